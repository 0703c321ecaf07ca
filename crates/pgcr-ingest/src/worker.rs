//! Record workers
//!
//! N workers pull from one shared bounded queue. Each record is decoded and
//! serialized by the codec, then handed to the transaction manager. Workers
//! stop when the queue is closed and drained, or when the run is cancelled.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::record::{Record, RecordCodec};
use crate::store::TransactionSink;
use crate::transaction::TransactionManager;

/// Receiving end of the work queue, shared by every worker.
pub type WorkQueue = Arc<Mutex<mpsc::Receiver<Record>>>;

/// What a worker does with a record that fails to decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Stop the whole run
    #[default]
    Fatal,
    /// Log it, count it and keep going
    Skip,
}

impl std::str::FromStr for DecodePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fatal" | "abort" => Ok(DecodePolicy::Fatal),
            "skip" => Ok(DecodePolicy::Skip),
            _ => Err(format!("Invalid decode policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub persisted: u64,
    pub skipped: u64,
}

pub struct Worker<S: TransactionSink, C: RecordCodec> {
    id: usize,
    queue: WorkQueue,
    codec: Arc<C>,
    manager: Arc<TransactionManager<S>>,
    policy: DecodePolicy,
}

impl<S: TransactionSink, C: RecordCodec> Worker<S, C> {
    pub fn new(
        id: usize,
        queue: WorkQueue,
        codec: Arc<C>,
        manager: Arc<TransactionManager<S>>,
        policy: DecodePolicy,
    ) -> Self {
        Self {
            id,
            queue,
            codec,
            manager,
            policy,
        }
    }

    async fn next_record(&self) -> Option<Record> {
        self.queue.lock().await.recv().await
    }

    /// Process records until the queue closes or `shutdown` fires.
    ///
    /// Cancellation is a clean exit; only decode (under the fatal policy) and
    /// persistence failures are returned as errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();

        loop {
            let record = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                record = self.next_record() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            let request = match self.codec.encode(&record.bytes) {
                Ok(request) => request,
                Err(source) => match self.policy {
                    DecodePolicy::Fatal => {
                        return Err(IngestError::Decode {
                            path: record.file.path().to_path_buf(),
                            line: record.line,
                            source,
                        });
                    }
                    DecodePolicy::Skip => {
                        warn!(
                            worker = self.id,
                            file = %record.file,
                            line = record.line,
                            error = %source,
                            "Skipping malformed record"
                        );
                        report.skipped += 1;
                        continue;
                    }
                },
            };

            match self.manager.add_persist(&request).await {
                Ok(()) => report.persisted += 1,
                Err(IngestError::Cancelled) => break,
                Err(e) => return Err(e),
            }
        }

        debug!(
            worker = self.id,
            persisted = report.persisted,
            skipped = report.skipped,
            "Worker finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::PgcrCodec;
    use crate::registry::FileId;
    use crate::store::MemorySink;
    use bytes::Bytes;
    use std::path::Path;

    fn record(line: u64, raw: &str) -> Record {
        Record {
            file: FileId::new(Path::new("/data/a.zst")),
            bytes: Bytes::from(raw.to_string()),
            line,
        }
    }

    fn pgcr(id: i64) -> String {
        format!(r#"{{"activityDetails":{{"instanceId":"{id}"}}}}"#)
    }

    async fn setup(
        policy: DecodePolicy,
    ) -> (
        mpsc::Sender<Record>,
        Worker<MemorySink, PgcrCodec>,
        Arc<TransactionManager<MemorySink>>,
        MemorySink,
    ) {
        let (tx, rx) = mpsc::channel(8);
        let sink = MemorySink::new();
        let manager = Arc::new(
            TransactionManager::begin(sink.clone(), 100, CancellationToken::new())
                .await
                .unwrap(),
        );
        let worker = Worker::new(
            0,
            Arc::new(Mutex::new(rx)),
            Arc::new(PgcrCodec),
            Arc::clone(&manager),
            policy,
        );
        (tx, worker, manager, sink)
    }

    #[tokio::test]
    async fn test_drains_queue_until_closed() {
        let (tx, worker, manager, sink) = setup(DecodePolicy::Fatal).await;
        for n in 0..3 {
            tx.send(record(n, &pgcr(n as i64 + 10))).await.unwrap();
        }
        drop(tx);

        let report = worker.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.persisted, 3);

        manager.close().await.unwrap();
        let ids: Vec<_> = sink.rows().iter().map(|r| r.instance_id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_fatal_policy_reports_location() {
        let (tx, worker, _manager, _sink) = setup(DecodePolicy::Fatal).await;
        tx.send(record(0, &pgcr(1))).await.unwrap();
        tx.send(record(1, "{not json")).await.unwrap();
        drop(tx);

        let err = worker.run(CancellationToken::new()).await.unwrap_err();
        match err {
            IngestError::Decode { path, line, .. } => {
                assert_eq!(path, Path::new("/data/a.zst"));
                assert_eq!(line, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_skip_policy_counts() {
        let (tx, worker, _manager, _sink) = setup(DecodePolicy::Skip).await;
        tx.send(record(0, "{not json")).await.unwrap();
        tx.send(record(1, &pgcr(2))).await.unwrap();
        tx.send(record(2, "")).await.unwrap();
        drop(tx);

        let report = worker.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report, WorkerReport { persisted: 1, skipped: 2 });
    }

    #[tokio::test]
    async fn test_cancellation_is_clean_exit() {
        let (_tx, worker, _manager, _sink) = setup(DecodePolicy::Fatal).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        // queue is still open, the token alone ends the loop
        let report = worker.run(shutdown).await.unwrap();
        assert_eq!(report, WorkerReport::default());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("skip".parse::<DecodePolicy>().unwrap(), DecodePolicy::Skip);
        assert_eq!("FATAL".parse::<DecodePolicy>().unwrap(), DecodePolicy::Fatal);
        assert!("ignore".parse::<DecodePolicy>().is_err());
    }
}
