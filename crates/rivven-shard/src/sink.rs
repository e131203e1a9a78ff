//! Error sink
//!
//! Every run-time failure is routed through [`ErrorSink::fatal`], which:
//!
//! 1. logs the error with its stage tag
//! 2. notifies the optional [`ErrorCallback`] (a failing callback is logged
//!    and otherwise ignored)
//! 3. trips the base [`AbortHandler`]
//! 4. hands back a [`FatalError`] for the caller to return
//!
//! There is no retry and no compensation. A migration that reached the sink
//! is over.

use crate::error::{FatalError, ShardError, Stage};
use crate::phase::Phase;
use crate::webhook::HttpCallback;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// What the error callback is told about a fatal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalReport {
    pub stage: Stage,
    pub phase: Phase,
    pub message: String,
}

/// Base handler tripped on every fatal error.
pub trait AbortHandler: Send + Sync {
    fn abort(&self, stage: Stage, err: &ShardError);
}

/// Remembers the first fatal error and marks the migration aborted.
/// Later errors are logged and dropped.
#[derive(Debug, Default)]
pub struct AbortLatch {
    aborted: AtomicBool,
    first: Mutex<Option<(Stage, String)>>,
}

impl AbortLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Stage and message of the first fatal error, if any.
    pub fn first_error(&self) -> Option<(Stage, String)> {
        self.first.lock().clone()
    }
}

impl AbortHandler for AbortLatch {
    fn abort(&self, stage: Stage, err: &ShardError) {
        let mut first = self.first.lock();
        if first.is_some() {
            warn!(stage = %stage, error = %err, "migration already aborted, ignoring error");
            return;
        }
        *first = Some((stage, err.to_string()));
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// User notification hook for fatal errors.
#[async_trait]
pub trait ErrorCallback: Send + Sync {
    async fn on_fatal(&self, report: &FatalReport) -> crate::error::Result<()>;
}

/// Posts `{"Payload", "ErrFrom", "ErrMessage"}` to an HTTP endpoint.
pub struct HttpErrorCallback {
    callback: HttpCallback,
    client: reqwest::Client,
}

impl HttpErrorCallback {
    pub fn new(callback: HttpCallback) -> Self {
        Self {
            callback,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(callback: HttpCallback, client: reqwest::Client) -> Self {
        Self { callback, client }
    }
}

#[async_trait]
impl ErrorCallback for HttpErrorCallback {
    async fn on_fatal(&self, report: &FatalReport) -> crate::error::Result<()> {
        let body = serde_json::json!({
            "Payload": self.callback.payload,
            "ErrFrom": report.stage.as_str(),
            "ErrMessage": report.message,
        });
        self.callback.post_json(&self.client, &body).await
    }
}

/// Decorated error handler shared by the orchestrator.
pub struct ErrorSink {
    base: Arc<dyn AbortHandler>,
    callback: Option<Arc<dyn ErrorCallback>>,
}

impl ErrorSink {
    pub fn new(base: Arc<dyn AbortHandler>) -> Self {
        Self {
            base,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn ErrorCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Report a terminal failure and build the error to return from `run`.
    pub async fn fatal(&self, stage: Stage, phase: Phase, err: ShardError) -> FatalError {
        error!(
            tag = "sharding",
            stage = %stage,
            phase = %phase,
            error = %err,
            code = err.error_code(),
            "fatal error, migration aborted"
        );

        if let Some(callback) = &self.callback {
            let report = FatalReport {
                stage,
                phase,
                message: err.to_string(),
            };
            if let Err(callback_err) = callback.on_fatal(&report).await {
                error!(
                    tag = "sharding",
                    stage = %stage,
                    error = %callback_err,
                    "error callback failed"
                );
            }
        }

        self.base.abort(stage, &err);
        FatalError::new(stage, phase, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingCallback {
        reports: Mutex<Vec<FatalReport>>,
        fail: bool,
    }

    #[async_trait]
    impl ErrorCallback for RecordingCallback {
        async fn on_fatal(&self, report: &FatalReport) -> crate::error::Result<()> {
            self.reports.lock().push(report.clone());
            if self.fail {
                return Err(ShardError::Webhook {
                    uri: "http://callback".into(),
                    status: 500,
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_latch_keeps_first_error() {
        let latch = AbortLatch::new();
        assert!(!latch.is_aborted());

        latch.abort(Stage::Sharding, &ShardError::engine("first"));
        latch.abort(Stage::BulkCopy, &ShardError::engine("second"));

        assert!(latch.is_aborted());
        let (stage, message) = latch.first_error().unwrap();
        assert_eq!(stage, Stage::Sharding);
        assert!(message.contains("first"));
    }

    #[tokio::test]
    async fn test_fatal_notifies_and_trips() {
        let latch = Arc::new(AbortLatch::new());
        let callback = Arc::new(RecordingCallback::default());
        let sink = ErrorSink::new(latch.clone()).with_callback(callback.clone());

        let fatal = sink
            .fatal(
                Stage::IterativeVerifier,
                Phase::JoinedTablesCopied,
                ShardError::DataDiscrepancy("users: 1 row".into()),
            )
            .await;

        assert_eq!(fatal.stage, Stage::IterativeVerifier);
        assert_eq!(fatal.phase, Phase::JoinedTablesCopied);
        assert!(latch.is_aborted());

        let reports = callback.reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.contains("data discrepancy"));
    }

    #[tokio::test]
    async fn test_failing_callback_keeps_fatal_error() {
        let latch = Arc::new(AbortLatch::new());
        let callback = Arc::new(RecordingCallback {
            fail: true,
            ..Default::default()
        });
        let sink = ErrorSink::new(latch.clone()).with_callback(callback);

        let fatal = sink
            .fatal(Stage::Sharding, Phase::Locked, ShardError::engine("flush failed"))
            .await;

        assert!(matches!(fatal.source, ShardError::Engine(_)));
        assert!(latch.is_aborted());
    }
}
