//! rivven-shard - Live single-shard migration for Rivven
//!
//! Moves the rows of one shard (all rows whose sharding key equals a given
//! value) from a source MySQL database to a target database while the
//! application keeps writing, then cuts over under a short external write
//! lock after the data has been verified.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    ShardingOrchestrator                         │
//! │  phase tracker, cutover chain, delta copies, error sink         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  FilterCell          RowFilter / TableFilter (shared, Arc)      │
//! │  Throttler           LagThrottler over an injected LagSource    │
//! │  LockClient          lock / unlock webhooks                     │
//! │  MetricsRecorder     step durations                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Collaborators (injected)                     │
//! │  ├── CopyEngine (bulk copy, binlog streaming, standalone copy)  │
//! │  └── Verifier (pre-cutover and authoritative verification)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # CLI Usage (Binary)
//!
//! ```bash
//! # Check filters and configuration
//! rivven-shard -c shard.yaml validate
//!
//! # Release a write lock left held by an aborted migration
//! rivven-shard -c shard.yaml unlock
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod orchestrator;
pub mod phase;
pub mod schema;
pub mod sink;
pub mod throttle;
pub mod traits;
pub mod webhook;

pub use config::ShardingConfig;
pub use error::{ErrorCategory, FatalError, Result, ShardError, Stage};
pub use filter::{FilterCell, JoinTable, RowFilter, SelectQuery, TableFilter};
pub use metrics::{FacadeRecorder, InMemoryRecorder, MetricsRecorder};
pub use orchestrator::{
    CopyTask, CutoverReport, Quiesced, ShardingOrchestrator, ShardingOrchestratorBuilder,
};
pub use phase::{Phase, PhaseTracker};
pub use schema::{RowEvent, RowOp, TableSchema, TableSchemaCache};
pub use sink::{AbortHandler, AbortLatch, ErrorCallback, ErrorSink, FatalReport, HttpErrorCallback};
pub use throttle::{wait_for_throttle, LagThrottler, ThrottleConfig, Throttler};
pub use traits::{
    CopyEngine, CursorConfig, EngineContext, EngineFactory, LagSource, VerificationResult,
    Verifier, VerifierConfig, VerifierFactory,
};
pub use webhook::{HttpCallback, LockClient};
