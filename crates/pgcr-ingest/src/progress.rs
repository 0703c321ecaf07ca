//! Per-file progress reporting
//!
//! Every started file owns a rendezvous progress channel: the ingestion stage
//! sends one unit increment per consumed line and does not move on until the
//! consumer has received it, so ingestion can never run ahead of the observer.
//! Closing the channel means "no more lines for this file".
//!
//! [`ProgressListener`] is the consumer side. It follows the registry's
//! started stream, claims each file's receiver and forwards everything to a
//! [`ProgressObserver`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{FileId, FileRegistry, RegistryEvents};

/// Create a rendezvous progress channel.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    // Capacity one plus a reserve after each send gives zero-capacity semantics.
    let (tx, rx) = mpsc::channel(1);
    (ProgressSender { tx }, ProgressReceiver { rx })
}

#[derive(Debug)]
pub struct ProgressSender {
    tx: mpsc::Sender<u64>,
}

impl ProgressSender {
    /// Report one consumed line.
    ///
    /// Returns once the receiver has taken the increment. Returns `false` when
    /// the receiver is gone, in which case progress for this file is detached.
    pub async fn increment(&self) -> bool {
        if self.tx.send(1).await.is_err() {
            return false;
        }
        // The slot frees only after the receiver has taken the value.
        match self.tx.reserve().await {
            Ok(permit) => {
                drop(permit);
                true
            }
            Err(_) => false,
        }
    }
}

#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::Receiver<u64>,
}

impl ProgressReceiver {
    /// Next increment, or `None` once the file is closed.
    pub async fn recv(&mut self) -> Option<u64> {
        self.rx.recv().await
    }
}

/// External consumer of per-file progress.
///
/// Callbacks run on the listener's tasks and must not block for long: a slow
/// observer slows ingestion down through the rendezvous channel.
pub trait ProgressObserver: Send + Sync + 'static {
    fn file_started(&self, file: &FileId);

    /// `lines` more lines of `file` were consumed.
    fn lines_processed(&self, file: &FileId, lines: u64);

    /// Progress channel closed after the file reached EOF.
    fn file_finished(&self, file: &FileId);

    /// Progress channel closed before the file reached EOF.
    fn file_interrupted(&self, file: &FileId);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn file_started(&self, _file: &FileId) {}
    fn lines_processed(&self, _file: &FileId, _lines: u64) {}
    fn file_finished(&self, _file: &FileId) {}
    fn file_interrupted(&self, _file: &FileId) {}
}

/// Drains the registry's notification streams on behalf of an observer.
pub struct ProgressListener;

impl ProgressListener {
    /// Spawn the listener.
    ///
    /// It runs until `stop` is cancelled, then waits for every file it is
    /// tracking to close its progress channel. Stop it only once the ingestion
    /// stage has returned.
    pub fn spawn(
        registry: Arc<FileRegistry>,
        observer: Arc<dyn ProgressObserver>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(events) = registry.subscribe() else {
                warn!("Registry events already claimed, progress will not be reported");
                return;
            };
            listen(registry, observer, events, stop).await;
        })
    }
}

async fn listen(
    registry: Arc<FileRegistry>,
    observer: Arc<dyn ProgressObserver>,
    mut events: RegistryEvents,
    stop: CancellationToken,
) {
    let mut trackers = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(id) = events.started.recv() => {
                track(&registry, &observer, &mut trackers, id);
            }
            Some(id) = events.completed.recv() => {
                debug!(file = %id, "File completed");
            }
            // Drive finished trackers so the set does not grow with the corpus.
            Some(_) = trackers.join_next(), if !trackers.is_empty() => {}
        }
    }

    // Files that started after the last poll still need their channels drained.
    while let Ok(id) = events.started.try_recv() {
        track(&registry, &observer, &mut trackers, id);
    }
    while let Ok(id) = events.completed.try_recv() {
        debug!(file = %id, "File completed");
    }

    while let Some(result) = trackers.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Progress tracker failed");
        }
    }
}

fn track(
    registry: &Arc<FileRegistry>,
    observer: &Arc<dyn ProgressObserver>,
    trackers: &mut JoinSet<()>,
    id: FileId,
) {
    observer.file_started(&id);

    let Some(mut progress) = registry.take_progress(&id) else {
        warn!(file = %id, "No progress channel for started file");
        return;
    };

    let registry = Arc::clone(registry);
    let observer = Arc::clone(observer);
    trackers.spawn(async move {
        while let Some(lines) = progress.recv().await {
            observer.lines_processed(&id, lines);
        }

        let done = registry.entry(&id).is_some_and(|entry| entry.done);
        if done {
            observer.file_finished(&id);
        } else {
            observer.file_interrupted(&id);
        }
    });
}

/// Reports progress through `tracing`.
#[derive(Debug)]
pub struct LogObserver {
    log_every: u64,
    counts: Mutex<HashMap<FileId, u64>>,
}

impl LogObserver {
    pub fn new(log_every: u64) -> Self {
        Self {
            log_every: log_every.max(1),
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn take_count(&self, file: &FileId) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(file)
            .unwrap_or(0)
    }
}

impl Default for LogObserver {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl ProgressObserver for LogObserver {
    fn file_started(&self, file: &FileId) {
        info!(file = %file.file_name(), "Started ingesting file");
    }

    fn lines_processed(&self, file: &FileId, lines: u64) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(file.clone()).or_insert(0);
        let before = *count;
        *count += lines;

        if before / self.log_every != *count / self.log_every {
            info!(file = %file.file_name(), lines = *count, "Ingestion progress");
        }
    }

    fn file_finished(&self, file: &FileId) {
        let lines = self.take_count(file);
        info!(file = %file.file_name(), lines, "Finished ingesting file");
    }

    fn file_interrupted(&self, file: &FileId) {
        let lines = self.take_count(file);
        warn!(file = %file.file_name(), lines, "File ingestion interrupted");
    }
}
