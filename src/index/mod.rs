//! RC100 composite index: capitalization snapshots, components and the rebalance engine.

pub mod capitalization;
pub mod component;
pub mod engine;

pub use capitalization::{snapshot_file_name, write_snapshot, CapitalizationSnapshot, SnapshotStore};
pub use component::IndexComponent;
pub use engine::{read_series, write_series, IndexEngine, IndexSettings};
