//! Stateful file registry
//!
//! Owns one [`FileEntry`] per discovered file plus the two notification
//! streams progress consumers listen on:
//!
//! - **started**: a file's identifier, published once when streaming begins
//! - **completed**: a file's identifier, published once when it reaches EOF
//!
//! Both streams have a capacity of one so the first notification never blocks
//! even if nobody is listening yet. A started file also gets a rendezvous
//! progress channel; its receiving half is parked here until a consumer calls
//! [`FileRegistry::take_progress`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};
use crate::progress::{self, ProgressReceiver, ProgressSender};

/// Identity of an input file: its full path as discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(Arc<str>);

impl FileId {
    pub fn new(path: &Path) -> Self {
        Self(Arc::from(path.to_string_lossy().as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn path(&self) -> &Path {
        Path::new(self.as_str())
    }

    /// Bare file name, for display.
    pub fn file_name(&self) -> &str {
        self.path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(self.as_str())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tracked status of one input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub started: bool,
    pub done: bool,
}

impl FileEntry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            started: false,
            done: false,
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: FileEntry,
    progress: Option<ProgressReceiver>,
}

/// Receiving halves of the registry's notification streams.
#[derive(Debug)]
pub struct RegistryEvents {
    pub started: mpsc::Receiver<FileId>,
    pub completed: mpsc::Receiver<FileId>,
}

#[derive(Debug)]
pub struct FileRegistry {
    slots: Mutex<BTreeMap<FileId, Slot>>,
    started_tx: mpsc::Sender<FileId>,
    completed_tx: mpsc::Sender<FileId>,
    events: Mutex<Option<RegistryEvents>>,
}

impl FileRegistry {
    pub fn new(entries: BTreeMap<FileId, FileEntry>) -> Self {
        let (started_tx, started) = mpsc::channel(1);
        let (completed_tx, completed) = mpsc::channel(1);

        let slots = entries
            .into_iter()
            .map(|(id, entry)| {
                (
                    id,
                    Slot {
                        entry,
                        progress: None,
                    },
                )
            })
            .collect();

        Self {
            slots: Mutex::new(slots),
            started_tx,
            completed_tx,
            events: Mutex::new(Some(RegistryEvents { started, completed })),
        }
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<FileId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Identifiers of every registered file, in path order.
    pub fn ids(&self) -> Vec<FileId> {
        self.slots().keys().cloned().collect()
    }

    /// Snapshot of a file's status.
    pub fn entry(&self, id: &FileId) -> Option<FileEntry> {
        self.slots().get(id).map(|slot| slot.entry.clone())
    }

    /// Hand out the notification streams. Only the first caller gets them.
    pub fn subscribe(&self) -> Option<RegistryEvents> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Take the progress receiver of a started file. Only the first caller gets it.
    pub fn take_progress(&self, id: &FileId) -> Option<ProgressReceiver> {
        self.slots().get_mut(id).and_then(|slot| slot.progress.take())
    }

    /// Flag `id` as started and allocate its progress channel.
    ///
    /// The receiving half is parked in the registry; the sending half belongs
    /// to the caller, and dropping it closes the channel.
    pub fn mark_started(&self, id: &FileId) -> Result<ProgressSender> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| IngestError::UnknownFile(id.clone()))?;

        if slot.entry.started {
            return Err(IngestError::AlreadyStarted(id.clone()));
        }

        let (sender, receiver) = progress::channel();
        slot.entry.started = true;
        slot.progress = Some(receiver);
        Ok(sender)
    }

    pub fn mark_done(&self, id: &FileId) {
        if let Some(slot) = self.slots().get_mut(id) {
            slot.entry.done = true;
        }
    }

    /// Publish `id` on the started stream.
    pub async fn publish_started(&self, id: &FileId, shutdown: &CancellationToken) -> Result<()> {
        Self::publish(&self.started_tx, id, shutdown).await
    }

    /// Publish `id` on the completed stream.
    pub async fn publish_completed(&self, id: &FileId, shutdown: &CancellationToken) -> Result<()> {
        Self::publish(&self.completed_tx, id, shutdown).await
    }

    async fn publish(
        tx: &mpsc::Sender<FileId>,
        id: &FileId,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(IngestError::Cancelled),
            // A dropped receiver means nobody is listening, which is fine.
            _ = tx.send(id.clone()) => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry(paths: &[&str]) -> FileRegistry {
        let entries = paths
            .iter()
            .map(|p| (FileId::new(Path::new(p)), FileEntry::new(PathBuf::from(p))))
            .collect();
        FileRegistry::new(entries)
    }

    #[test]
    fn test_file_id_display_and_name() {
        let id = FileId::new(Path::new("/data/2020/pgcr_1.jsonl.zst"));
        assert_eq!(id.to_string(), "/data/2020/pgcr_1.jsonl.zst");
        assert_eq!(id.file_name(), "pgcr_1.jsonl.zst");
    }

    #[test]
    fn test_ids_are_sorted() {
        let registry = registry(&["/b.zst", "/a.zst", "/c.zst"]);
        let ids: Vec<_> = registry.ids().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["/a.zst", "/b.zst", "/c.zst"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_progress_exists_only_after_start() {
        let registry = registry(&["/a.zst"]);
        let id = registry.ids().remove(0);

        assert!(registry.take_progress(&id).is_none());
        assert!(!registry.entry(&id).unwrap().started);

        let _sender = registry.mark_started(&id).unwrap();
        assert!(registry.entry(&id).unwrap().started);
        assert!(registry.take_progress(&id).is_some());
        // handed out once
        assert!(registry.take_progress(&id).is_none());
    }

    #[test]
    fn test_start_is_once_only() {
        let registry = registry(&["/a.zst"]);
        let id = registry.ids().remove(0);

        let _sender = registry.mark_started(&id).unwrap();
        assert!(matches!(
            registry.mark_started(&id),
            Err(IngestError::AlreadyStarted(_))
        ));
    }

    #[test]
    fn test_unknown_file() {
        let registry = registry(&["/a.zst"]);
        let stranger = FileId::new(Path::new("/elsewhere.zst"));
        assert!(matches!(
            registry.mark_started(&stranger),
            Err(IngestError::UnknownFile(_))
        ));
    }

    #[tokio::test]
    async fn test_first_started_notification_does_not_block() {
        let registry = registry(&["/a.zst"]);
        let id = registry.ids().remove(0);
        let shutdown = CancellationToken::new();

        // nobody subscribed yet
        registry.publish_started(&id, &shutdown).await.unwrap();

        let mut events = registry.subscribe().unwrap();
        assert_eq!(events.started.recv().await.unwrap(), id);
        assert!(registry.subscribe().is_none());
    }

    #[tokio::test]
    async fn test_publish_observes_cancellation() {
        let registry = registry(&["/a.zst", "/b.zst"]);
        let ids = registry.ids();
        let shutdown = CancellationToken::new();

        registry.publish_started(&ids[0], &shutdown).await.unwrap();
        shutdown.cancel();

        // stream is full and nobody drains it
        let result = registry.publish_started(&ids[1], &shutdown).await;
        assert!(matches!(result, Err(IngestError::Cancelled)));
    }
}
