//! Collaborator contracts
//!
//! The orchestrator drives three external subsystems through these traits:
//!
//! - [`CopyEngine`] - filtered bulk copy plus continuous binlog streaming,
//!   and a standalone (non-streaming) copy path for delta copies
//! - [`Verifier`] - compares source and target, built by a [`VerifierFactory`]
//!   once the engine has started
//! - [`LagSource`] - replica lag measurement behind the
//!   [`LagThrottler`](crate::throttle::LagThrottler)
//!
//! Database connections belong to the engine and the verifier; the
//! orchestrator never touches them.

use crate::config::ShardingConfig;
use crate::error::Result;
use crate::filter::{FilterCell, SelectQuery, TableFilter};
use crate::schema::{TableSchema, TableSchemaCache};
use crate::throttle::Throttler;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Bulk copy and binlog streaming engine.
///
/// Read retries for individual rows are the engine's business; an error
/// returned from any method here means retries are exhausted.
#[async_trait]
pub trait CopyEngine: Send + Sync {
    /// Discover schemas and open connections.
    async fn initialize(&self) -> Result<()>;

    /// Start the binlog streamer. It keeps running until
    /// [`flush_binlog_and_stop_streaming`](Self::flush_binlog_and_stop_streaming).
    async fn start(&self) -> Result<()>;

    /// Run the filtered bulk copy. Returns once the copy has finished and the
    /// streamer has been stopped.
    async fn run(&self) -> Result<()>;

    /// Resolves once every filtered row has been copied at least once.
    async fn wait_until_row_copy_is_complete(&self) -> Result<()>;

    /// Resolves once the streamer has reached the current source log position.
    async fn wait_until_binlog_streamer_catches_up(&self) -> Result<()>;

    /// Apply all pending binlog events, then stop streaming.
    async fn flush_binlog_and_stop_streaming(&self) -> Result<()>;

    /// Copy `tables` with the row filter, without streaming.
    async fn run_standalone_data_copy(&self, tables: Vec<TableSchema>) -> Result<()>;

    /// Load the source tables accepted by `filter`.
    async fn load_tables(&self, filter: &TableFilter) -> Result<TableSchemaCache>;

    /// Tables discovered by [`initialize`](Self::initialize).
    fn tables(&self) -> TableSchemaCache;
}

/// Everything an engine needs, handed to the engine factory after the
/// configuration has been validated.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<ShardingConfig>,
    pub filters: Arc<FilterCell>,
    pub throttler: Option<Arc<dyn Throttler>>,
}

/// Builds the copy engine. Only invoked once configuration is valid.
pub type EngineFactory =
    Box<dyn FnOnce(EngineContext) -> Result<Arc<dyn CopyEngine>> + Send + 'static>;

/// Outcome of an authoritative verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub data_correct: bool,
    /// Diagnostic message, describes mismatches when `data_correct` is false
    pub message: String,
}

impl VerificationResult {
    pub fn correct() -> Self {
        Self {
            data_correct: true,
            message: String::new(),
        }
    }

    pub fn incorrect(message: impl Into<String>) -> Self {
        Self {
            data_correct: false,
            message: message.into(),
        }
    }
}

/// Row cursor settings shared by the bulk copy and the verifier.
#[derive(Clone)]
pub struct CursorConfig {
    pub batch_size: u64,
    pub read_retries: u32,
    /// Same row predicate the bulk copy uses
    pub filters: Arc<FilterCell>,
}

impl CursorConfig {
    /// Build the select for the next batch of `table` after `last_pagination_key`.
    pub fn build_select(
        &self,
        columns: &[String],
        table: &TableSchema,
        last_pagination_key: u64,
    ) -> Result<SelectQuery> {
        self.filters
            .row_filter()
            .build_select(columns, table, last_pagination_key, self.batch_size)
    }
}

/// Settings a verifier is built from.
#[derive(Clone)]
pub struct VerifierConfig {
    pub cursor: CursorConfig,
    /// Running engine; verifiers reach the source connection and the live
    /// binlog streamer through their concrete engine.
    pub engine: Arc<dyn CopyEngine>,
    pub tables: TableSchemaCache,
    pub database_rewrites: HashMap<String, String>,
    pub table_rewrites: HashMap<String, String>,
    pub ignored_tables: Vec<String>,
    pub concurrency: usize,
}

/// Source/target data comparison.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn initialize(&mut self) -> Result<()>;

    /// Best-effort pass while writes are still flowing. Errors here mean the
    /// verification machinery itself is unhealthy.
    async fn verify_before_cutover(&self) -> Result<()>;

    /// Authoritative pass under the write lock.
    async fn verify_during_cutover(&self) -> Result<VerificationResult>;
}

/// Builds the verifier once the engine has started.
pub trait VerifierFactory: Send + Sync {
    fn build(&self, config: VerifierConfig) -> Result<Box<dyn Verifier>>;
}

impl<F> VerifierFactory for F
where
    F: Fn(VerifierConfig) -> Result<Box<dyn Verifier>> + Send + Sync,
{
    fn build(&self, config: VerifierConfig) -> Result<Box<dyn Verifier>> {
        self(config)
    }
}

/// Replica lag measurement.
#[async_trait]
pub trait LagSource: Send + Sync {
    async fn current_lag(&self) -> Result<Duration>;
}
