//! Recording fakes for driving a migration without databases.
//!
//! Every collaborator appends to one shared call log so tests can assert the
//! exact cutover order.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rivven_shard::{
    AbortLatch, CopyEngine, EngineContext, FilterCell, InMemoryRecorder, LagSource, LockClient,
    Result, ShardError, ShardingConfig, ShardingOrchestrator, TableFilter, TableSchema,
    TableSchemaCache, Throttler, VerificationResult, Verifier, VerifierConfig,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub type CallLog = Arc<Mutex<Vec<String>>>;

fn record(log: &CallLog, call: impl Into<String>) {
    log.lock().push(call.into());
}

pub struct FakeEngine {
    log: CallLog,
    filters: Arc<FilterCell>,
    source: Vec<TableSchema>,
    discovered: Mutex<TableSchemaCache>,
    fail: HashSet<&'static str>,
    stopped: Notify,
}

#[async_trait]
impl CopyEngine for FakeEngine {
    async fn initialize(&self) -> Result<()> {
        record(&self.log, "engine.initialize");
        let tables = self.filters.table_filter().applicable_tables(&self.source);
        *self.discovered.lock() = tables.into_iter().collect();
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        record(&self.log, "engine.start");
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        if self.fail.contains("run") {
            return Err(ShardError::engine("row read retries exhausted on users"));
        }
        if self.fail.contains("run_late") {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Err(ShardError::engine("binlog connection reset"));
        }
        self.stopped.notified().await;
        Ok(())
    }

    async fn wait_until_row_copy_is_complete(&self) -> Result<()> {
        record(&self.log, "engine.wait_until_row_copy_is_complete");
        if self.fail.contains("run") {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_until_binlog_streamer_catches_up(&self) -> Result<()> {
        record(&self.log, "engine.wait_until_binlog_streamer_catches_up");
        Ok(())
    }

    async fn flush_binlog_and_stop_streaming(&self) -> Result<()> {
        record(&self.log, "engine.flush_binlog_and_stop_streaming");
        if self.fail.contains("flush") {
            return Err(ShardError::engine("binlog flush failed"));
        }
        self.stopped.notify_one();
        Ok(())
    }

    async fn run_standalone_data_copy(&self, tables: Vec<TableSchema>) -> Result<()> {
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        record(&self.log, format!("engine.standalone_copy[{}]", names.join(",")));
        if self.fail.contains("standalone_copy") {
            return Err(ShardError::engine("standalone copy failed"));
        }
        Ok(())
    }

    async fn load_tables(&self, filter: &TableFilter) -> Result<TableSchemaCache> {
        record(&self.log, "engine.load_tables");
        Ok(filter.applicable_tables(&self.source).into_iter().collect())
    }

    fn tables(&self) -> TableSchemaCache {
        self.discovered.lock().clone()
    }
}

#[derive(Debug, Clone)]
pub enum CutoverOutcome {
    Correct,
    Incorrect(&'static str),
    Error,
}

pub struct FakeVerifier {
    log: CallLog,
    fail_before: bool,
    outcome: CutoverOutcome,
}

#[async_trait]
impl Verifier for FakeVerifier {
    async fn initialize(&mut self) -> Result<()> {
        record(&self.log, "verifier.initialize");
        Ok(())
    }

    async fn verify_before_cutover(&self) -> Result<()> {
        record(&self.log, "verifier.verify_before_cutover");
        if self.fail_before {
            return Err(ShardError::verifier("source connection lost"));
        }
        Ok(())
    }

    async fn verify_during_cutover(&self) -> Result<VerificationResult> {
        record(&self.log, "verifier.verify_during_cutover");
        match &self.outcome {
            CutoverOutcome::Correct => Ok(VerificationResult::correct()),
            CutoverOutcome::Incorrect(message) => Ok(VerificationResult::incorrect(*message)),
            CutoverOutcome::Error => Err(ShardError::verifier("fingerprint query failed")),
        }
    }
}

pub struct FakeLock {
    name: &'static str,
    log: CallLog,
    fail: bool,
    /// Time the lock service takes to answer after taking the lock
    delay: Option<Duration>,
}

#[async_trait]
impl LockClient for FakeLock {
    async fn post(&self, _client: &reqwest::Client) -> Result<()> {
        record(&self.log, self.name);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ShardError::Webhook {
                uri: format!("http://ops.test/{}", self.name),
                status: 503,
            });
        }
        Ok(())
    }
}

pub struct FakeThrottler {
    log: CallLog,
    disabled: AtomicBool,
    /// Checks left that report throttled
    remaining: AtomicUsize,
}

#[async_trait]
impl Throttler for FakeThrottler {
    async fn throttled(&self) -> bool {
        record(&self.log, "throttler.throttled");
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }

    fn set_disabled(&self, disabled: bool) {
        record(&self.log, format!("throttler.set_disabled({})", disabled));
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    fn disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }
}

/// Tables on the source shard.
pub fn source_tables() -> Vec<TableSchema> {
    vec![
        TableSchema::new("shard_1", "users")
            .with_columns(["id", "tenant_id", "email"])
            .with_primary_key(["id"]),
        TableSchema::new("shard_1", "orders")
            .with_columns(["id", "tenant_id", "link_id"])
            .with_primary_key(["id"]),
        TableSchema::new("shard_1", "orders_link")
            .with_columns(["id", "sku"])
            .with_primary_key(["id"]),
        TableSchema::new("shard_1", "countries")
            .with_columns(["id", "name"])
            .with_primary_key(["id"]),
        TableSchema::new("shard_1", "_users_gho")
            .with_columns(["id", "tenant_id", "email"])
            .with_primary_key(["id"]),
    ]
}

pub fn base_config() -> ShardingConfig {
    let yaml = r#"
source_db: shard_1
target_db: shard_1_new
sharding_key: tenant_id
sharding_value: 42
joined_tables:
  orders_link:
    - table_name: orders
      join_column: link_id
ignored_tables: ["^_.*_gho$"]
primary_key_tables: [countries]
cutover_lock:
  uri: http://ops.test/lock
cutover_unlock:
  uri: http://ops.test/unlock
"#;
    ShardingConfig::from_yaml(yaml).expect("base config parses")
}

/// Knobs for one migration run.
pub struct Scenario {
    pub config: ShardingConfig,
    pub source: Vec<TableSchema>,
    pub engine_fail: HashSet<&'static str>,
    pub verify_before_fails: bool,
    pub outcome: CutoverOutcome,
    pub lock_fails: bool,
    pub unlock_fails: bool,
    pub lock_delay: Option<Duration>,
    pub fake_throttler: bool,
    /// Checks the fake throttler reports throttled before clearing
    pub throttled_checks: usize,
    pub lag_source: Option<Arc<dyn LagSource>>,
    /// Post the configured webhooks instead of recording fake lock calls
    pub config_webhooks: bool,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            config: base_config(),
            source: source_tables(),
            engine_fail: HashSet::new(),
            verify_before_fails: false,
            outcome: CutoverOutcome::Correct,
            lock_fails: false,
            unlock_fails: false,
            lock_delay: None,
            fake_throttler: true,
            throttled_checks: 0,
            lag_source: None,
            config_webhooks: false,
        }
    }
}

/// Handles on everything a run records.
pub struct Harness {
    pub log: CallLog,
    pub metrics: Arc<InMemoryRecorder>,
    pub latch: Arc<AbortLatch>,
    pub engine_built: Arc<AtomicBool>,
    pub verifier_concurrency: Arc<Mutex<Option<usize>>>,
}

impl Harness {
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn called(&self, call: &str) -> bool {
        self.log.lock().iter().any(|c| c == call)
    }
}

impl Scenario {
    pub fn build(self) -> (Result<ShardingOrchestrator>, Harness) {
        let harness = Harness {
            log: CallLog::default(),
            metrics: Arc::new(InMemoryRecorder::new()),
            latch: Arc::new(AbortLatch::new()),
            engine_built: Arc::new(AtomicBool::new(false)),
            verifier_concurrency: Arc::new(Mutex::new(None)),
        };

        let engine_log = harness.log.clone();
        let engine_built = harness.engine_built.clone();
        let source = self.source;
        let engine_fail = self.engine_fail;

        let verifier_log = harness.log.clone();
        let verifier_concurrency = harness.verifier_concurrency.clone();
        let fail_before = self.verify_before_fails;
        let outcome = self.outcome;

        let mut builder = ShardingOrchestrator::builder(self.config)
            .engine(Box::new(move |ctx: EngineContext| {
                engine_built.store(true, Ordering::SeqCst);
                Ok(Arc::new(FakeEngine {
                    log: engine_log,
                    filters: ctx.filters,
                    source,
                    discovered: Mutex::new(TableSchemaCache::new()),
                    fail: engine_fail,
                    stopped: Notify::new(),
                }) as Arc<dyn CopyEngine>)
            }))
            .verifier(Arc::new(
                move |config: VerifierConfig| -> Result<Box<dyn Verifier>> {
                    *verifier_concurrency.lock() = Some(config.concurrency);
                    Ok(Box::new(FakeVerifier {
                        log: verifier_log.clone(),
                        fail_before,
                        outcome: outcome.clone(),
                    }))
                },
            ))
            .metrics(harness.metrics.clone())
            .abort_handler(harness.latch.clone());

        if !self.config_webhooks {
            builder = builder.lock_clients(
                Arc::new(FakeLock {
                    name: "lock",
                    log: harness.log.clone(),
                    fail: self.lock_fails,
                    delay: self.lock_delay,
                }),
                Arc::new(FakeLock {
                    name: "unlock",
                    log: harness.log.clone(),
                    fail: self.unlock_fails,
                    delay: None,
                }),
            );
        }

        if self.fake_throttler {
            builder = builder.throttler(Arc::new(FakeThrottler {
                log: harness.log.clone(),
                disabled: AtomicBool::new(false),
                remaining: AtomicUsize::new(self.throttled_checks),
            }));
        }

        if let Some(source) = self.lag_source {
            builder = builder.lag_source(source);
        }

        (builder.build(), harness)
    }
}

/// Build, initialize and start a migration.
pub async fn started(scenario: Scenario) -> (ShardingOrchestrator, Harness) {
    let (orchestrator, harness) = scenario.build();
    let mut orchestrator = orchestrator.expect("orchestrator builds");
    orchestrator.initialize().await.expect("initialize");
    orchestrator.start().await.expect("start");
    (orchestrator, harness)
}

