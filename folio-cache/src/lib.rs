//! Folio Cache - Read Cache and Mutation Reconciliation
//!
//! Keeps the library client's read cache consistent with the data service
//! after every mutation.
//!
//! # Design Philosophy
//!
//! A successful mutation returns the entity's fresh state. That state is
//! written straight into the cache (detail entry plus every list that embeds
//! the record), and only the entries the mutation could have changed
//! indirectly are marked stale. A stale entry keeps serving its last value
//! while one background refetch runs, so the UI never flickers to empty, and
//! a refetch that lands after a newer write is discarded by watermark.
//!
//! # Example
//!
//! ```ignore
//! let cache = ReadCache::create(CacheConfig::from_env());
//! let pipeline = MutationPipeline::new(service.clone(), sink, cache.clone())
//!     .with_identity(identity);
//!
//! let books = cache.read_through(&service, &Fingerprint::of(EntityTag::Books)).await?;
//!
//! let report = pipeline
//!     .mutate(MutationRequest::update(EntityTag::BorrowRecord, "r1", json!({"status": "BORROWED"})))
//!     .await;
//! assert!(report.is_success());
//! ```

pub mod entry;
pub mod executor;
pub mod memo;
pub mod notify;
pub mod pipeline;
pub mod read_cache;
pub mod reconciler;
pub mod rules;
pub mod stats;
pub mod telemetry;
pub mod watermark;

pub use entry::{CacheEntry, CacheRead, ReadSource};
pub use executor::MutationExecutor;
pub use memo::{Memo, Selector};
pub use notify::NotificationEmitter;
pub use pipeline::{
    LifecycleError, MutationLifecycle, MutationPhase, MutationPipeline, MutationReport,
};
pub use read_cache::ReadCache;
pub use reconciler::{CacheReconciler, ReconcileReport};
pub use rules::{InvalidationRules, MutationRule, RulesBuilder};
pub use stats::CacheStats;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};
pub use watermark::{Watermark, WatermarkClock};
