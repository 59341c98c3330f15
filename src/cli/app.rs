use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stockdecay::{DecayEngine, DecayReading, EngineConfig, EntitySeed, TimeRemaining};
use tokio::time::{MissedTickBehavior, interval, sleep};

#[derive(Parser)]
#[command(name = "stockdecay")]
#[command(about = "Inspect and drive decaying stock counters")]
pub struct Cli {
    /// JSON engine config (tickIntervalMs, persistTimeoutMs, ...)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every entity stored in a snapshot
    Inspect {
        #[arg(long)]
        state: PathBuf,
    },
    /// Load a catalog, activate entities and keep ticking
    Run {
        /// JSON array of {"name", "stock"} entries
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        state: PathBuf,
        /// Overrides the configured tick interval
        #[arg(long)]
        tick_ms: Option<u64>,
        /// Entity to activate on startup; repeatable
        #[arg(long)]
        activate: Vec<String>,
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Reset one entity, or all of them, and save
    Reset {
        #[arg(long)]
        state: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };

        match self.command {
            Command::Inspect { state } => inspect(&state, config).await,
            Command::Run {
                catalog,
                state,
                tick_ms,
                activate,
                duration_secs,
            } => {
                let config = match tick_ms {
                    Some(ms) => config.tick_interval(Duration::from_millis(ms)),
                    None => config,
                };
                run(&catalog, &state, config, &activate, duration_secs).await
            }
            Command::Reset { state, name } => reset(&state, config, name.as_deref()).await,
        }
    }
}

async fn inspect(state: &Path, config: EngineConfig) -> Result<()> {
    let engine = DecayEngine::open_file(state, config).await?;
    if engine.is_empty() {
        println!("No usable snapshot at {}", state.display());
    } else {
        print_table(&engine);
    }
    engine.shutdown().await?;
    Ok(())
}

async fn run(
    catalog: &Path,
    state: &Path,
    config: EngineConfig,
    activate: &[String],
    duration_secs: Option<u64>,
) -> Result<()> {
    let seeds = load_catalog(catalog)?;
    let tick_interval = config.tick_interval;
    let engine = DecayEngine::open_file(state, config).await?;

    let report = engine.initialize(&seeds)?;
    println!(
        "Catalog loaded: {} new, {} kept, {} dropped",
        report.created, report.kept, report.dropped
    );

    for name in activate {
        if !engine.activate(name) && engine.state(name).is_none() {
            eprintln!("warning: '{}' is not in the catalog", name);
        }
    }

    engine.start()?;

    let deadline = async {
        match duration_secs {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut display = interval(tick_interval);
    display.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            _ = display.tick() => print_table(&engine),
        }
    }

    engine.shutdown().await?;
    println!("Stopped; state saved to {}", state.display());
    Ok(())
}

async fn reset(state: &Path, config: EngineConfig, name: Option<&str>) -> Result<()> {
    let engine = DecayEngine::open_file(state, config).await?;
    if engine.is_empty() {
        bail!("no usable snapshot at {}", state.display());
    }

    match name {
        Some(name) => {
            if !engine.reset(name) {
                bail!("'{}' not found in {}", name, state.display());
            }
            println!("Reset {}", name);
        }
        None => println!("Reset {} entities", engine.reset_all()),
    }

    engine
        .flush()
        .await
        .with_context(|| format!("saving {}", state.display()))?;
    engine.shutdown().await?;
    Ok(())
}

fn load_catalog(path: &Path) -> Result<Vec<EntitySeed>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing catalog {}", path.display()))
}

fn print_table(engine: &DecayEngine) {
    println!(
        "{:<24} {:>12} {:>8} {:<9} {:>10}",
        "ENTITY", "VALUE", "LEFT%", "PHASE", "REMAINING"
    );
    for reading in engine.readings() {
        let remaining = engine.time_remaining(&reading.name);
        println!("{}", format_row(&reading, remaining));
    }
}

fn format_row(reading: &DecayReading, remaining: Option<TimeRemaining>) -> String {
    let remaining = remaining
        .map(|r| r.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<24} {:>12.2} {:>8.1} {:<9} {:>10}",
        reading.name,
        reading.current_value,
        reading.percentage_remaining,
        format!("{:?}", reading.phase),
        remaining
    )
}
