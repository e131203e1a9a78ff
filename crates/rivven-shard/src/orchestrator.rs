//! Cutover orchestration
//!
//! [`ShardingOrchestrator`] moves one shard from its source database to a
//! target database while the application keeps writing:
//!
//! ```text
//! bulk copy + binlog stream ──► pre-cutover verify ──► throttle / catch up
//!        ──► LOCK ──► drain stream, join copy ──► re-copy joined tables
//!        ──► verify ──► unthrottle ──► copy primary-key tables ──► UNLOCK
//! ```
//!
//! The bulk copy runs as a background task. Every wait before the drain is
//! supervised against it, so a failed copy aborts the run instead of leaving
//! it blocked. The lock request is the exception: it always runs to
//! completion.
//!
//! Any failure inside [`run`](ShardingOrchestrator::run) is terminal. If the
//! write lock was taken before the failure it is left held; releasing it is
//! an operator decision (`rivven-shard unlock`).
//!
//! # Example
//!
//! ```rust,ignore
//! let mut orchestrator = ShardingOrchestrator::builder(config)
//!     .engine(Box::new(|ctx| Ok(Arc::new(MysqlEngine::new(ctx)?) as Arc<dyn CopyEngine>)))
//!     .verifier(Arc::new(|cfg| Ok(Box::new(IterativeVerifier::new(cfg)) as Box<dyn Verifier>)))
//!     .lag_source(replica_lag)
//!     .build()?;
//!
//! orchestrator.initialize().await?;
//! orchestrator.start().await?;
//! let report = orchestrator.run().await?;
//! ```

use crate::config::ShardingConfig;
use crate::error::{FatalError, Result, ShardError, Stage};
use crate::filter::FilterCell;
use crate::metrics::{
    measure, FacadeRecorder, MetricsRecorder, CUTOVER_LOCK, CUTOVER_TIME, CUTOVER_UNLOCK,
    DELTA_COPY_JOINED_TABLES, VERIFY_BEFORE_CUTOVER, VERIFY_CUTOVER,
};
use crate::phase::{Phase, PhaseTracker};
use crate::sink::{AbortHandler, AbortLatch, ErrorCallback, ErrorSink, HttpErrorCallback};
use crate::throttle::{wait_for_throttle, LagThrottler, Throttler};
use crate::traits::{
    CopyEngine, CursorConfig, EngineContext, EngineFactory, LagSource, Verifier, VerifierConfig,
    VerifierFactory,
};
use crate::webhook::LockClient;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type RunResult<T> = std::result::Result<T, FatalError>;

/// Handle on the background bulk copy.
///
/// Dropping an unjoined task aborts it.
pub struct CopyTask {
    handle: Option<JoinHandle<Result<()>>>,
}

/// Proof that the bulk copy has been joined and streaming has stopped.
///
/// Only [`CopyTask::join`] hands these out; the delta-copy helpers require
/// one, so they cannot run while the source is still being streamed.
#[derive(Debug)]
pub struct Quiesced {
    _joined: (),
}

impl CopyTask {
    /// Spawn [`CopyEngine::run`] on the runtime.
    pub fn spawn(engine: Arc<dyn CopyEngine>) -> Self {
        let handle = tokio::spawn(async move { engine.run().await });
        Self {
            handle: Some(handle),
        }
    }

    fn outcome(
        joined: std::result::Result<Result<()>, tokio::task::JoinError>,
    ) -> Result<()> {
        joined.map_err(|e| ShardError::engine(format!("bulk copy task failed: {}", e)))?
    }

    /// Drive `fut` to completion while watching the copy task.
    ///
    /// Returns `Err` with the copy's error if the copy fails first. A copy
    /// that finishes successfully is noted and `fut` keeps running.
    pub async fn supervise<F, T>(&mut self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(fut);
        loop {
            let Some(handle) = self.handle.as_mut() else {
                return Ok(fut.await);
            };

            let joined = tokio::select! {
                output = &mut fut => return Ok(output),
                joined = handle => joined,
            };

            self.handle = None;
            Self::outcome(joined)?;
            debug!(tag = "sharding", "bulk copy task finished");
        }
    }

    /// Wait for the copy to finish.
    pub async fn join(mut self) -> Result<Quiesced> {
        if let Some(handle) = self.handle.take() {
            Self::outcome(handle.await)?;
        }
        Ok(Quiesced { _joined: () })
    }
}

impl Drop for CopyTask {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Summary of a completed cutover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoverReport {
    /// From the lock request to the unlock response
    pub cutover_duration: Duration,
    /// Joined tables re-copied under the lock
    pub joined_tables: Vec<String>,
    /// Primary-key tables copied under the lock
    pub primary_key_tables: Vec<String>,
    /// Message reported by the cutover verification
    pub verification_message: String,
}

/// Builder for [`ShardingOrchestrator`]
pub struct ShardingOrchestratorBuilder {
    config: ShardingConfig,
    engine: Option<EngineFactory>,
    verifier: Option<Arc<dyn VerifierFactory>>,
    throttler: Option<Arc<dyn Throttler>>,
    lag_source: Option<Arc<dyn LagSource>>,
    lock: Option<Arc<dyn LockClient>>,
    unlock: Option<Arc<dyn LockClient>>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    abort_handler: Option<Arc<dyn AbortHandler>>,
    error_callback: Option<Arc<dyn ErrorCallback>>,
}

impl ShardingOrchestratorBuilder {
    pub fn new(config: ShardingConfig) -> Self {
        Self {
            config,
            engine: None,
            verifier: None,
            throttler: None,
            lag_source: None,
            lock: None,
            unlock: None,
            metrics: None,
            abort_handler: None,
            error_callback: None,
        }
    }

    /// Factory for the copy engine (required)
    pub fn engine(mut self, factory: EngineFactory) -> Self {
        self.engine = Some(factory);
        self
    }

    /// Factory for the verifier (required)
    pub fn verifier(mut self, factory: Arc<dyn VerifierFactory>) -> Self {
        self.verifier = Some(factory);
        self
    }

    /// Use this throttler instead of one built from the `throttle` settings
    pub fn throttler(mut self, throttler: Arc<dyn Throttler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    /// Lag source for the configured `throttle`
    pub fn lag_source(mut self, source: Arc<dyn LagSource>) -> Self {
        self.lag_source = Some(source);
        self
    }

    /// Override the lock and unlock webhooks
    pub fn lock_clients(mut self, lock: Arc<dyn LockClient>, unlock: Arc<dyn LockClient>) -> Self {
        self.lock = Some(lock);
        self.unlock = Some(unlock);
        self
    }

    /// Metrics recorder (default: `metrics` facade)
    pub fn metrics(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(recorder);
        self
    }

    /// Base abort handler (default: [`AbortLatch`])
    pub fn abort_handler(mut self, handler: Arc<dyn AbortHandler>) -> Self {
        self.abort_handler = Some(handler);
        self
    }

    /// Error callback (default: the configured `error_callback` webhook)
    pub fn error_callback(mut self, callback: Arc<dyn ErrorCallback>) -> Self {
        self.error_callback = Some(callback);
        self
    }

    /// Build filters, validate, then create the engine.
    ///
    /// Nothing is created when filter building or validation fails.
    pub fn build(self) -> Result<ShardingOrchestrator> {
        let filters = Arc::new(FilterCell::build(&self.config)?);
        self.config.validate()?;

        let engine_factory = self
            .engine
            .ok_or_else(|| ShardError::config("a copy engine factory is required"))?;
        let verifier_factory = self
            .verifier
            .ok_or_else(|| ShardError::config("a verifier factory is required"))?;

        let throttler: Option<Arc<dyn Throttler>> = match (self.throttler, &self.config.throttle)
        {
            (Some(throttler), _) => Some(throttler),
            (None, Some(settings)) => {
                let source = self.lag_source.ok_or_else(|| {
                    ShardError::config("throttle is configured but no lag source was supplied")
                })?;
                Some(Arc::new(LagThrottler::new(settings.clone(), source)))
            }
            (None, None) => None,
        };

        let lock = self
            .lock
            .unwrap_or_else(|| Arc::new(self.config.cutover_lock.clone()) as Arc<dyn LockClient>);
        let unlock = self
            .unlock
            .unwrap_or_else(|| Arc::new(self.config.cutover_unlock.clone()) as Arc<dyn LockClient>);

        let mut sink = ErrorSink::new(
            self.abort_handler
                .unwrap_or_else(|| Arc::new(AbortLatch::new()) as Arc<dyn AbortHandler>),
        );
        let callback = self.error_callback.or_else(|| {
            self.config
                .error_callback
                .clone()
                .map(|cb| Arc::new(HttpErrorCallback::new(cb)) as Arc<dyn ErrorCallback>)
        });
        if let Some(callback) = callback {
            sink = sink.with_callback(callback);
        }

        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(FacadeRecorder) as Arc<dyn MetricsRecorder>);

        let config = Arc::new(self.config);
        let engine = engine_factory(EngineContext {
            config: Arc::clone(&config),
            filters: Arc::clone(&filters),
            throttler: throttler.clone(),
        })?;

        info!(
            tag = "sharding",
            source = %config.source_db,
            target = %config.target_db,
            sharding_key = %config.sharding_key,
            sharding_value = filters.row_filter().sharding_value(),
            "shard migration created"
        );

        Ok(ShardingOrchestrator {
            config,
            filters,
            engine,
            verifier_factory,
            verifier: None,
            throttler,
            lock,
            unlock,
            metrics,
            sink,
            phase: PhaseTracker::new(),
            running: AtomicBool::new(false),
        })
    }
}

/// Drives a single shard migration through its cutover.
pub struct ShardingOrchestrator {
    config: Arc<ShardingConfig>,
    filters: Arc<FilterCell>,
    engine: Arc<dyn CopyEngine>,
    verifier_factory: Arc<dyn VerifierFactory>,
    verifier: Option<Box<dyn Verifier>>,
    throttler: Option<Arc<dyn Throttler>>,
    lock: Arc<dyn LockClient>,
    unlock: Arc<dyn LockClient>,
    metrics: Arc<dyn MetricsRecorder>,
    sink: ErrorSink,
    phase: PhaseTracker,
    running: AtomicBool,
}

impl ShardingOrchestrator {
    pub fn builder(config: ShardingConfig) -> ShardingOrchestratorBuilder {
        ShardingOrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn filters(&self) -> &Arc<FilterCell> {
        &self.filters
    }

    pub fn throttler(&self) -> Option<&Arc<dyn Throttler>> {
        self.throttler.as_ref()
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase.current()
    }

    /// Initialize the engine (schema discovery, connections).
    pub async fn initialize(&self) -> Result<()> {
        self.phase.expect(Phase::Created)?;
        self.engine.initialize().await?;
        self.phase.advance(Phase::Initialized)?;
        info!(
            tag = "sharding",
            tables = self.engine.tables().len(),
            "engine initialized"
        );
        Ok(())
    }

    /// Start streaming, then build and initialize the verifier.
    pub async fn start(&mut self) -> Result<()> {
        self.phase.expect(Phase::Initialized)?;
        if self.verifier.is_some() {
            return Err(ShardError::invalid_state("migration already started"));
        }

        self.engine.start().await?;

        let verifier_config = VerifierConfig {
            cursor: CursorConfig {
                batch_size: self.config.data_iteration_batch_size,
                read_retries: self.config.db_read_retries,
                filters: Arc::clone(&self.filters),
            },
            engine: Arc::clone(&self.engine),
            tables: self.engine.tables(),
            database_rewrites: self.config.database_rewrites.clone(),
            table_rewrites: self.config.table_rewrites.clone(),
            ignored_tables: self.config.ignored_verification_tables.clone(),
            concurrency: self.config.verifier_concurrency(),
        };

        let mut verifier = self.verifier_factory.build(verifier_config)?;
        verifier.initialize().await?;
        self.verifier = Some(verifier);

        info!(
            tag = "sharding",
            concurrency = self.config.verifier_concurrency(),
            "streaming started, verifier ready"
        );
        Ok(())
    }

    /// Run the migration through cutover.
    ///
    /// Every failure is escalated through the error sink and ends the run.
    /// Calling `run` before [`start`](Self::start), or more than once, is
    /// refused without touching the migration state or the error sink.
    pub async fn run(&self) -> RunResult<CutoverReport> {
        let Some(verifier) = self.verifier.as_deref() else {
            let err = ShardError::invalid_state("start must complete before run");
            return Err(self.refuse(err));
        };
        if let Err(e) = self.phase.expect(Phase::Initialized) {
            return Err(self.refuse(e));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            let err = ShardError::invalid_state("migration is already running");
            return Err(self.refuse(err));
        }

        let mut copy = CopyTask::spawn(Arc::clone(&self.engine));

        self.supervised(
            &mut copy,
            self.engine.wait_until_row_copy_is_complete(),
            "row copy did not complete, aborting run",
        )
        .await?;
        self.advance(Phase::Copying).await?;

        self.supervised(
            &mut copy,
            measure(
                self.metrics.as_ref(),
                VERIFY_BEFORE_CUTOVER,
                verifier.verify_before_cutover(),
            ),
            "pre-cutover verification encountered an error, aborting run",
        )
        .await?;
        self.advance(Phase::PreCutoverVerified).await?;

        if let Some(throttler) = &self.throttler {
            if let Err(e) = copy.supervise(wait_for_throttle(throttler.as_ref())).await {
                return Err(self
                    .escalate(Stage::BulkCopy, e, "bulk copy failed, aborting run")
                    .await);
            }
        }
        self.supervised(
            &mut copy,
            self.engine.wait_until_binlog_streamer_catches_up(),
            "binlog streamer did not catch up, aborting run",
        )
        .await?;
        self.advance(Phase::ThrottleSynced).await?;

        // The lock webhook must not return before in-flight source
        // transactions are done and further writes are blocked. It is not
        // raced against the copy task: once sent it runs to completion, and a
        // copy failure in the meantime surfaces at the flush, under the lock.
        let client = reqwest::Client::new();
        let cutover_start = Instant::now();
        let locked = measure(self.metrics.as_ref(), CUTOVER_LOCK, self.lock.post(&client)).await;
        if let Err(e) = locked {
            return Err(self
                .escalate(Stage::Sharding, e, "locking failed, aborting run")
                .await);
        }
        self.advance(Phase::Locked).await?;

        self.set_throttle_disabled(true);

        self.supervised(
            &mut copy,
            self.engine.flush_binlog_and_stop_streaming(),
            "failed to flush binlog and stop streaming, aborting run",
        )
        .await?;
        let quiesced = match copy.join().await {
            Ok(quiesced) => quiesced,
            Err(e) => {
                return Err(self
                    .escalate(Stage::BulkCopy, e, "bulk copy failed, aborting run")
                    .await)
            }
        };
        self.advance(Phase::Drained).await?;

        let joined_tables = match measure(
            self.metrics.as_ref(),
            DELTA_COPY_JOINED_TABLES,
            self.delta_copy_joined_tables(&quiesced),
        )
        .await
        {
            Ok(tables) => tables,
            Err(e) => {
                return Err(self
                    .escalate(
                        Stage::Sharding,
                        e,
                        "failed to delta-copy joined tables after locking",
                    )
                    .await)
            }
        };
        self.advance(Phase::JoinedTablesCopied).await?;

        let verification = match measure(
            self.metrics.as_ref(),
            VERIFY_CUTOVER,
            verifier.verify_during_cutover(),
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                return Err(self
                    .escalate(
                        Stage::IterativeVerifier,
                        e,
                        "verification encountered an error, aborting run",
                    )
                    .await)
            }
        };
        if !verification.data_correct {
            return Err(self
                .escalate(
                    Stage::IterativeVerifier,
                    ShardError::DataDiscrepancy(verification.message),
                    "verification failed, aborting run",
                )
                .await);
        }
        self.advance(Phase::CutoverVerified).await?;

        self.set_throttle_disabled(false);
        self.advance(Phase::Unthrottled).await?;

        let primary_key_tables = match self.copy_primary_key_tables(&quiesced).await {
            Ok(tables) => tables,
            Err(e) => {
                return Err(self
                    .escalate(Stage::Sharding, e, "copying primary key table failed")
                    .await)
            }
        };
        self.advance(Phase::PrimaryKeyTablesCopied).await?;

        if let Err(e) = measure(
            self.metrics.as_ref(),
            CUTOVER_UNLOCK,
            self.unlock.post(&client),
        )
        .await
        {
            return Err(self
                .escalate(Stage::Sharding, e, "unlocking failed, aborting run")
                .await);
        }
        self.advance(Phase::Unlocked).await?;

        let cutover_duration = cutover_start.elapsed();
        self.metrics.timer(CUTOVER_TIME, cutover_duration);
        self.advance(Phase::Done).await?;

        info!(
            tag = "sharding",
            cutover_ms = cutover_duration.as_millis() as u64,
            joined_tables = joined_tables.len(),
            primary_key_tables = primary_key_tables.len(),
            "cutover complete"
        );

        Ok(CutoverReport {
            cutover_duration,
            joined_tables,
            primary_key_tables,
            verification_message: verification.message,
        })
    }

    /// Re-copy every joined table known to the engine.
    pub async fn delta_copy_joined_tables(&self, _quiesced: &Quiesced) -> Result<Vec<String>> {
        let tables: Vec<_> = self
            .engine
            .tables()
            .iter()
            .filter(|table| self.config.joined_tables.contains_key(&table.name))
            .cloned()
            .collect();
        let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();

        debug!(tag = "sharding", tables = ?names, "delta-copying joined tables");
        self.engine.run_standalone_data_copy(tables).await?;
        Ok(names)
    }

    /// Attach the primary-key table set to the filters, reload tables under
    /// the extended table filter and copy the primary-key tables.
    ///
    /// Every primary-key table must have exactly one primary key column;
    /// otherwise nothing is copied.
    pub async fn copy_primary_key_tables(&self, _quiesced: &Quiesced) -> Result<Vec<String>> {
        self.phase.expect(Phase::Unthrottled)?;

        let wanted: HashSet<String> = self.config.primary_key_tables.iter().cloned().collect();
        self.filters.attach_primary_key_tables(wanted.clone())?;

        let loaded = self
            .engine
            .load_tables(self.filters.table_filter())
            .await?;

        let mut tables = Vec::new();
        for table in loaded.iter().filter(|t| wanted.contains(&t.name)) {
            if table.pk_columns.len() != 1 {
                return Err(ShardError::CompositePrimaryKey {
                    table: table.full_name(),
                    columns: table.pk_columns.clone(),
                });
            }
            tables.push(table.clone());
        }

        if tables.is_empty() {
            warn!(tag = "sharding", "found no primary key tables to copy");
        }

        let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
        self.engine.run_standalone_data_copy(tables).await?;
        Ok(names)
    }

    fn set_throttle_disabled(&self, disabled: bool) {
        if let Some(throttler) = &self.throttler {
            throttler.set_disabled(disabled);
        }
    }

    async fn advance(&self, next: Phase) -> RunResult<()> {
        match self.phase.advance(next) {
            Ok(()) => {
                info!(tag = "sharding", phase = %next, "phase complete");
                Ok(())
            }
            Err(e) => Err(self
                .escalate(Stage::Sharding, e, "phase order violated, aborting run")
                .await),
        }
    }

    async fn supervised<F, T>(
        &self,
        copy: &mut CopyTask,
        fut: F,
        failure: &'static str,
    ) -> RunResult<T>
    where
        F: Future<Output = Result<T>>,
    {
        match copy.supervise(fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.escalate(Stage::Sharding, e, failure).await),
            Err(e) => Err(self
                .escalate(Stage::BulkCopy, e, "bulk copy failed, aborting run")
                .await),
        }
    }

    /// Reject a misused `run` without aborting the migration.
    fn refuse(&self, err: ShardError) -> FatalError {
        warn!(tag = "sharding", error = %err, phase = %self.phase.current(), "run refused");
        FatalError::new(Stage::Sharding, self.phase.last_completed(), err)
    }

    async fn escalate(&self, stage: Stage, err: ShardError, context: &str) -> FatalError {
        error!(tag = "sharding", error = %err, "{}", context);
        let phase = self.phase.abort();
        self.sink.fatal(stage, phase, err).await
    }
}
