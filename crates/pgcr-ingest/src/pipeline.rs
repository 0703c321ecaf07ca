//! Pipeline orchestration
//!
//! Wires the stages together for one run:
//!
//! ```text
//! FileRegistry ──▶ FileIngester ──▶ work queue ──▶ Worker × N ──▶ TransactionManager
//!       │                │
//!       └── started ─────┴── progress ──▶ ProgressListener ──▶ ProgressObserver
//! ```
//!
//! All stages share a run-scoped cancellation token derived from the caller's
//! shutdown token. The first fatal error cancels it, the remaining tasks wind
//! down on their own, and the transaction manager is closed last.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, Result};
use crate::ingest::{FileIngester, IngestReport};
use crate::progress::{ProgressListener, ProgressObserver};
use crate::reader::{InputCompression, DEFAULT_MAX_LINE_BYTES};
use crate::record::{PgcrCodec, RecordCodec};
use crate::registry::FileRegistry;
use crate::store::TransactionSink;
use crate::transaction::TransactionManager;
use crate::worker::{DecodePolicy, WorkQueue, Worker, WorkerReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub workers: usize,
    pub batch_size: u64,
    pub queue_capacity: usize,
    pub max_line_bytes: usize,
    pub compression: InputCompression,
    pub decode_policy: DecodePolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 100,
            batch_size: 10_000,
            queue_capacity: 50,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            compression: InputCompression::default(),
            decode_policy: DecodePolicy::default(),
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(IngestError::Config(
                "Number of workers cannot be zero or negative".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(IngestError::Config(
                "Batch size cannot be zero or negative".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(IngestError::Config(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(IngestError::Config(
                "Maximum line length must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub files: u64,
    pub lines_read: u64,
    /// Records in committed transactions
    pub records_persisted: u64,
    /// Records dropped under the skip decode policy
    pub records_skipped: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub elapsed: Duration,
}

enum TaskReport {
    Ingest(IngestReport),
    Worker(WorkerReport),
}

pub struct Pipeline<S: TransactionSink, C: RecordCodec = PgcrCodec> {
    sink: S,
    codec: Arc<C>,
    settings: PipelineSettings,
}

impl<S: TransactionSink> Pipeline<S, PgcrCodec> {
    pub fn new(sink: S, settings: PipelineSettings) -> Self {
        Self::with_codec(sink, PgcrCodec, settings)
    }
}

impl<S: TransactionSink, C: RecordCodec> Pipeline<S, C> {
    pub fn with_codec(sink: S, codec: C, settings: PipelineSettings) -> Self {
        Self {
            sink,
            codec: Arc::new(codec),
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Ingest every file in `registry`.
    ///
    /// Returns the first fatal error if any stage failed, or
    /// [`IngestError::Cancelled`] if `shutdown` fired. Batches committed
    /// before either stay committed; the open batch is rolled back.
    pub async fn run(
        self,
        registry: Arc<FileRegistry>,
        observer: Arc<dyn ProgressObserver>,
        shutdown: &CancellationToken,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        self.settings.validate()?;

        let run_token = shutdown.child_token();
        let manager = Arc::new(
            TransactionManager::begin(self.sink, self.settings.batch_size, run_token.clone())
                .await?,
        );

        // Progress must be drained for as long as files are being streamed.
        let listener_stop = CancellationToken::new();
        let listener = ProgressListener::spawn(Arc::clone(&registry), observer, listener_stop.clone());

        let (work_tx, work_rx) = mpsc::channel(self.settings.queue_capacity);
        let queue: WorkQueue = Arc::new(Mutex::new(work_rx));

        info!(
            files = registry.len(),
            workers = self.settings.workers,
            batch_size = self.settings.batch_size,
            queue_capacity = self.settings.queue_capacity,
            decode_policy = ?self.settings.decode_policy,
            "Starting ingestion"
        );

        let mut tasks: JoinSet<Result<TaskReport>> = JoinSet::new();

        let ingester = FileIngester::new(
            Arc::clone(&registry),
            work_tx,
            self.settings.compression,
            self.settings.max_line_bytes,
        );
        let token = run_token.clone();
        tasks.spawn(async move { ingester.run(token).await.map(TaskReport::Ingest) });

        for id in 0..self.settings.workers {
            let worker = Worker::new(
                id,
                Arc::clone(&queue),
                Arc::clone(&self.codec),
                Arc::clone(&manager),
                self.settings.decode_policy,
            );
            let token = run_token.clone();
            tasks.spawn(async move { worker.run(token).await.map(TaskReport::Worker) });
        }
        drop(queue);

        let mut failure: Option<IngestError> = None;
        let mut ingested = IngestReport::default();
        let mut skipped = 0u64;

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(IngestError::from).and_then(|report| report) {
                Ok(TaskReport::Ingest(report)) => ingested = report,
                Ok(TaskReport::Worker(report)) => skipped += report.skipped,
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if failure.is_none() {
                        error!(error = %e, "Ingestion failed, cancelling remaining tasks");
                        run_token.cancel();
                        failure = Some(e);
                    } else {
                        debug!(error = %e, "Additional failure after cancellation");
                    }
                }
            }
        }

        let closed = manager.close().await;

        listener_stop.cancel();
        if let Err(e) = listener.await {
            warn!(error = %e, "Progress listener failed");
        }

        if let Some(e) = failure {
            return Err(e);
        }
        closed?;
        if shutdown.is_cancelled() {
            warn!("Ingestion cancelled");
            return Err(IngestError::Cancelled);
        }

        let stats = manager.stats();
        let summary = RunSummary {
            files: ingested.files,
            lines_read: ingested.lines,
            records_persisted: stats.committed,
            records_skipped: skipped,
            commits: stats.commits,
            rollbacks: stats.rollbacks,
            elapsed: started.elapsed(),
        };

        info!(
            files = summary.files,
            lines = summary.lines_read,
            persisted = summary.records_persisted,
            skipped = summary.records_skipped,
            commits = summary.commits,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Ingestion complete"
        );

        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_validation() {
        assert!(PipelineSettings::default().validate().is_ok());

        let zero_workers = PipelineSettings {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(zero_workers.validate(), Err(IngestError::Config(_))));

        let zero_queue = PipelineSettings {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(zero_queue.validate(), Err(IngestError::Config(_))));
    }
}
