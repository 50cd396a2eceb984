pub mod aggregation;
pub mod gaps;
pub mod live;
pub mod registry;
pub mod repository;
pub mod storage;
pub mod sync_engine;

pub use aggregation::{to_heikin_ashi, to_hourly};
pub use gaps::{CorrectionReport, Gap, GapCorrector, GapDetector};
pub use live::{apply_live_candle, ConcurrentCandleBook, LiveCandleBook, LiveMerge};
pub use registry::{tradable_universe, SymbolSyncState, SyncRegistry};
pub use repository::CandleRepository;
pub use storage::CandleStorage;
pub use sync_engine::{SyncEngine, SyncReport};
