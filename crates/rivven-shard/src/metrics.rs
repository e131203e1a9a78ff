//! Cutover metrics
//!
//! The orchestrator times its cutover steps through an injected
//! [`MetricsRecorder`]. Step names are stable and used as metric labels:
//!
//! | Name                      | Kind    | Covers                                 |
//! |---------------------------|---------|----------------------------------------|
//! | `VerifyBeforeCutover`     | measure | pre-cutover verification               |
//! | `CutoverLock`             | measure | the lock webhook                       |
//! | `deltaCopyJoinedTables`   | measure | joined-table delta copy under the lock |
//! | `VerifyCutover`           | measure | authoritative verification             |
//! | `CutoverUnlock`           | measure | the unlock webhook                     |
//! | `CutoverTime`             | timer   | lock request through unlock            |
//!
//! [`FacadeRecorder`] emits through the `metrics` crate facade, so any
//! installed exporter picks them up. [`InMemoryRecorder`] keeps samples for
//! inspection.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

pub const VERIFY_BEFORE_CUTOVER: &str = "VerifyBeforeCutover";
pub const CUTOVER_LOCK: &str = "CutoverLock";
pub const DELTA_COPY_JOINED_TABLES: &str = "deltaCopyJoinedTables";
pub const VERIFY_CUTOVER: &str = "VerifyCutover";
pub const CUTOVER_UNLOCK: &str = "CutoverUnlock";
pub const CUTOVER_TIME: &str = "CutoverTime";

/// Sink for step durations.
pub trait MetricsRecorder: Send + Sync {
    /// Duration of a single measured step, recorded whether or not it failed.
    fn measure(&self, name: &'static str, elapsed: Duration);

    /// Duration of a span covering several steps.
    fn timer(&self, name: &'static str, elapsed: Duration);
}

/// Time `fut` and record it under `name`, then hand back its output.
pub async fn measure<F, T>(recorder: &dyn MetricsRecorder, name: &'static str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let output = fut.await;
    recorder.measure(name, start.elapsed());
    output
}

/// Records through the `metrics` facade.
#[derive(Debug, Clone, Default)]
pub struct FacadeRecorder;

impl MetricsRecorder for FacadeRecorder {
    fn measure(&self, name: &'static str, elapsed: Duration) {
        ::metrics::histogram!("rivven_shard_step_duration_seconds", "step" => name)
            .record(elapsed.as_secs_f64());
    }

    fn timer(&self, name: &'static str, elapsed: Duration) {
        ::metrics::histogram!("rivven_shard_timer_seconds", "timer" => name)
            .record(elapsed.as_secs_f64());
    }
}

/// Kind of a recorded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Measure,
    Timer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub name: &'static str,
    pub kind: SampleKind,
    pub elapsed: Duration,
}

/// Keeps every sample in memory, in recording order.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    samples: Mutex<Vec<Sample>>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    /// Names in recording order.
    pub fn names(&self) -> Vec<&'static str> {
        self.samples.lock().iter().map(|s| s.name).collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.samples.lock().iter().any(|s| s.name == name)
    }

    fn push(&self, name: &'static str, kind: SampleKind, elapsed: Duration) {
        self.samples.lock().push(Sample {
            name,
            kind,
            elapsed,
        });
    }
}

impl MetricsRecorder for InMemoryRecorder {
    fn measure(&self, name: &'static str, elapsed: Duration) {
        self.push(name, SampleKind::Measure, elapsed);
    }

    fn timer(&self, name: &'static str, elapsed: Duration) {
        self.push(name, SampleKind::Timer, elapsed);
    }
}
