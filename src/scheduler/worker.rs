use super::Scheduler;
use crate::core::{DecayError, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Background task that calls `Scheduler::tick` on a fixed interval.
pub struct TickWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TickWorker {
    /// Signals the worker to stop and waits for it to finish. No tick runs
    /// after this returns.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| DecayError::SchedulerError(format!("tick worker join: {}", err)))?;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }
}

impl Drop for TickWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the tick loop. The first tick fires immediately so a restarted
/// process catches up without waiting a full interval; late ticks are
/// dropped rather than queued.
pub fn spawn_tick_worker(scheduler: Arc<Scheduler>) -> Result<TickWorker> {
    let period = scheduler.interval();
    if period.is_zero() {
        return Err(DecayError::SchedulerError(
            "tick interval must be greater than zero".to_string(),
        ));
    }

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    break;
                }
                _ = ticker.tick() => {
                    scheduler.tick();
                }
            }
        }
    });

    Ok(TickWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    })
}
