//! Ingestion stage
//!
//! A single task walks the registry in order and streams every file onto the
//! work queue, one line per [`Record`]. Each line also produces one progress
//! increment, so the stage moves only as fast as both the workers and the
//! progress consumer allow.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::reader::{InputCompression, LineReader};
use crate::record::Record;
use crate::registry::{FileId, FileRegistry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub files: u64,
    pub lines: u64,
}

pub struct FileIngester {
    registry: Arc<FileRegistry>,
    output: mpsc::Sender<Record>,
    compression: InputCompression,
    max_line_bytes: usize,
}

impl FileIngester {
    pub fn new(
        registry: Arc<FileRegistry>,
        output: mpsc::Sender<Record>,
        compression: InputCompression,
        max_line_bytes: usize,
    ) -> Self {
        Self {
            registry,
            output,
            compression,
            max_line_bytes,
        }
    }

    /// Stream every registered file onto the work queue.
    ///
    /// The queue is closed when this returns, whatever the outcome. On
    /// cancellation the file in progress is abandoned and
    /// [`IngestError::Cancelled`] is returned.
    pub async fn run(self, shutdown: CancellationToken) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        for id in self.registry.ids() {
            let lines = self.ingest_file(&id, &shutdown).await?;
            report.files += 1;
            report.lines += lines;
        }

        info!(files = report.files, lines = report.lines, "All files ingested");
        Ok(report)
    }

    async fn ingest_file(&self, id: &FileId, shutdown: &CancellationToken) -> Result<u64> {
        let path = self
            .registry
            .entry(id)
            .map(|entry| entry.path)
            .ok_or_else(|| IngestError::UnknownFile(id.clone()))?;

        let mut reader = LineReader::open(&path, self.compression, self.max_line_bytes).await?;

        let progress = self.registry.mark_started(id)?;
        self.registry.publish_started(id, shutdown).await?;
        debug!(file = %id, "Streaming file");

        let mut attached = true;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(IngestError::Cancelled),
                next = reader.next_line() => next?,
            };
            let Some((line, bytes)) = next else {
                break;
            };

            let record = Record {
                file: id.clone(),
                bytes,
                line,
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(IngestError::Cancelled),
                sent = self.output.send(record) => {
                    // Every worker is gone, which only happens when the run is ending.
                    if sent.is_err() {
                        return Err(IngestError::Cancelled);
                    }
                }
            }

            if attached {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Err(IngestError::Cancelled),
                    delivered = progress.increment() => {
                        if !delivered {
                            debug!(file = %id, "Progress receiver dropped, detaching");
                            attached = false;
                        }
                    }
                }
            }
        }

        // Mark done before closing progress so consumers see a finished file.
        self.registry.mark_done(id);
        drop(progress);
        self.registry.publish_completed(id, shutdown).await?;

        Ok(reader.lines_read())
    }
}
