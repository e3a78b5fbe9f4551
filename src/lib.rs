// src/lib.rs
// Public library surface for the daemon and integration tests.

pub mod anchor;
pub mod analyze;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod repository;
pub mod rolling;
pub mod store;
pub mod trend;

// ---- Re-exports for stable public API ----
pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use crate::error::{
    AnchorError, FeedError, PipelineError, ScoringError, StoreError, TickError, TrendError,
};
pub use crate::ingest::scheduler::SchedulerDeps;
pub use crate::ingest::{Deduplicator, IngestionScheduler, RateBudget, TickPhase, TickReport};
pub use crate::model::{AssetTrend, Mention, Signal, SignalKind};
pub use crate::repository::{Repository, TrackingOutcome, TrendView};
pub use crate::store::{DynStore, MemorySignalStore, SignalStore, SqliteSignalStore};
pub use crate::trend::{TrendEngine, TrendWeights};
