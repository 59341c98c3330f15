pub mod memory;
pub mod persistence;
pub mod writer;

pub use memory::MemoryAdapter;
pub use persistence::{
    DecaySnapshot, FileAdapter, PersistenceAdapter, SNAPSHOT_FORMAT_VERSION, SnapshotFormat,
};
pub use writer::{PersistenceStats, SnapshotWriter, WriterWorker};
