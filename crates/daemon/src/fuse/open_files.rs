//! Write-back cache of open files.
//!
//! Each open path owns one scratch buffer shared by all of its handles.
//! Writes land in scratch and mark the file dirty; content only goes to the
//! remote store when a dirty file is flushed or released. Scratch lives in
//! memory until it outgrows the spool threshold, then spills to a temp file.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use common::error::RemoteError;
use common::path_ops;
use common::remote::RemoteClient;
use common::upload::{upload, UploadReport};
use parking_lot::Mutex;
use tempfile::SpooledTempFile;
use tokio::sync::Mutex as FileLock;

use super::error::{FsError, FsResult};

/// Default size an open file may reach before its scratch spills to disk
pub const DEFAULT_SPOOL_THRESHOLD: usize = 8 * 1024 * 1024;

struct OpenFile {
    scratch: SpooledTempFile,
    len: u64,
    dirty: bool,
    /// Set when materialization failed; handles still waiting on the lock see it
    failed: Option<RemoteError>,
}

impl OpenFile {
    fn new(spool_threshold: usize) -> Self {
        Self {
            scratch: SpooledTempFile::new(spool_threshold),
            len: 0,
            dirty: false,
            failed: None,
        }
    }

    fn load(&mut self, content: &[u8]) -> std::io::Result<()> {
        self.scratch.seek(SeekFrom::Start(0))?;
        self.scratch.write_all(content)?;
        self.scratch.set_len(content.len() as u64)?;
        self.len = content.len() as u64;
        Ok(())
    }
}

struct Slot {
    handles: usize,
    file: FileRef,
}

type FileRef = Arc<FileLock<OpenFile>>;

#[derive(Default)]
struct Entries {
    /// Entries reachable by path. Only these are ever uploaded.
    live: HashMap<String, Slot>,
    /// Entries that lost their path to an unlink or to a rename over them.
    /// Their handles keep reading and writing scratch until released.
    detached: Vec<(String, Slot)>,
}

impl Entries {
    fn detached_index(&self, path: &str) -> Option<usize> {
        self.detached.iter().rposition(|(key, _)| key == path)
    }

    /// The live entry for `path`, else the newest detached one
    fn any(&self, path: &str) -> Option<FileRef> {
        match self.live.get(path) {
            Some(slot) => Some(slot.file.clone()),
            None => self
                .detached_index(path)
                .map(|i| self.detached[i].1.file.clone()),
        }
    }

    /// Cut loose every live entry at or beneath `root`, except those beneath
    /// `keep`. Entries with handles are detached; the rest are handed back.
    fn detach_within(
        &mut self,
        root: &str,
        keep: Option<&str>,
    ) -> (Vec<(String, FileRef)>, Vec<(String, Slot)>) {
        let paths: Vec<String> = self
            .live
            .keys()
            .filter(|key| path_ops::is_within(key, root))
            .filter(|key| !keep.is_some_and(|keep| path_ops::is_within(key, keep)))
            .cloned()
            .collect();

        let mut detached = Vec::new();
        let mut dropped = Vec::new();
        for path in paths {
            let Some(slot) = self.live.remove(&path) else {
                continue;
            };
            if slot.handles == 0 {
                dropped.push((path, slot));
            } else {
                tracing::debug!("detached open file {}", path);
                detached.push((path.clone(), slot.file.clone()));
                self.detached.push((path, slot));
            }
        }
        (detached, dropped)
    }
}

/// Keys changed by [`OpenFileTable::rename`], kept so the move can be undone
#[derive(Default)]
pub struct Rekey {
    moved: Vec<(String, String)>,
    /// Entries open at the destination, detached to make room
    detached: Vec<(String, FileRef)>,
    /// Entries at the destination with no handles left
    dropped: Vec<(String, Slot)>,
}

impl Rekey {
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
    }

    /// Number of open files that moved
    pub fn len(&self) -> usize {
        self.moved.len()
    }

    /// Number of entries the move pushed off the destination
    pub fn displaced(&self) -> usize {
        self.detached.len() + self.dropped.len()
    }
}

/// Open files keyed by remote path
pub struct OpenFileTable {
    client: RemoteClient,
    spool_threshold: usize,
    entries: Mutex<Entries>,
}

impl std::fmt::Debug for OpenFileTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("OpenFileTable")
            .field("open", &entries.live.len())
            .field("detached", &entries.detached.len())
            .field("spool_threshold", &self.spool_threshold)
            .finish()
    }
}

impl OpenFileTable {
    pub fn new(client: RemoteClient, spool_threshold: usize) -> Self {
        Self {
            client,
            spool_threshold,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn client(&self) -> &RemoteClient {
        &self.client
    }

    fn live_file(&self, path: &str) -> Option<FileRef> {
        self.entries
            .lock()
            .live
            .get(path)
            .map(|slot| slot.file.clone())
    }

    fn live_or_err(&self, path: &str) -> FsResult<FileRef> {
        self.live_file(path)
            .ok_or_else(|| FsError::NotOpen(path.to_string()))
    }

    /// Scratch that handles on `path` read and write, detached or not
    fn handle_file(&self, path: &str) -> FsResult<FileRef> {
        self.entries
            .lock()
            .any(path)
            .ok_or_else(|| FsError::NotOpen(path.to_string()))
    }

    /// Drop `path` from the table, but only if it still maps to `file`
    fn remove_if_same(&self, path: &str, file: &FileRef) {
        let mut entries = self.entries.lock();
        if entries
            .live
            .get(path)
            .map(|slot| Arc::ptr_eq(&slot.file, file))
            .unwrap_or(false)
        {
            entries.live.remove(path);
        }
    }

    /// Open `path`, or add a handle to it if it is already open.
    ///
    /// A new entry starts clean. With `materialize` its scratch is filled with
    /// the remote content first; a failed download leaves nothing behind.
    /// Returns whether this call created the entry.
    pub async fn acquire(&self, path: &str, materialize: bool) -> FsResult<bool> {
        let path = path_ops::normalize(path);

        let (file, fresh) = {
            let mut entries = self.entries.lock();
            match entries.live.get_mut(&path) {
                Some(slot) => {
                    slot.handles += 1;
                    (slot.file.clone(), None)
                }
                None => {
                    let file = Arc::new(FileLock::new(OpenFile::new(self.spool_threshold)));
                    // Taken before the entry is visible so later acquirers wait on it.
                    let guard = file
                        .clone()
                        .try_lock_owned()
                        .map_err(|_| FsError::Busy(path.clone()))?;
                    entries.live.insert(
                        path.clone(),
                        Slot {
                            handles: 1,
                            file: file.clone(),
                        },
                    );
                    (file, Some(guard))
                }
            }
        };

        let Some(mut guard) = fresh else {
            let guard = file.lock().await;
            if let Some(e) = &guard.failed {
                return Err(e.clone().into());
            }
            tracing::debug!("added handle to open file {}", path);
            return Ok(false);
        };

        if !materialize {
            tracing::debug!("opened {} empty", path);
            return Ok(true);
        }

        let loaded = match self.client.download_object(&path).await {
            Ok(content) => guard.load(&content).map_err(RemoteError::from),
            Err(e) => Err(e),
        };
        match loaded {
            Ok(()) => {
                tracing::debug!("opened {} ({} bytes)", path, guard.len);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("failed to materialize {}: {}", path, e);
                guard.failed = Some(e.clone());
                drop(guard);
                self.remove_if_same(&path, &file);
                Err(e.into())
            }
        }
    }

    /// Write `data` at `offset`, zero-filling any gap. Returns bytes written.
    pub async fn write(&self, path: &str, data: &[u8], offset: u64) -> FsResult<usize> {
        let file = self.handle_file(path)?;
        let mut file = file.lock().await;

        file.scratch.seek(SeekFrom::Start(offset))?;
        file.scratch.write_all(data)?;
        file.len = file.len.max(offset + data.len() as u64);
        file.dirty = true;
        Ok(data.len())
    }

    /// Up to `size` bytes from `offset`; empty at or past the end
    pub async fn read(&self, path: &str, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        let file = self.handle_file(path)?;
        let mut file = file.lock().await;

        if offset >= file.len {
            return Ok(Vec::new());
        }
        let count = (file.len - offset).min(size as u64) as usize;
        let mut buf = vec![0u8; count];
        file.scratch.seek(SeekFrom::Start(offset))?;
        file.scratch.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Resize scratch to `len`. Only an actual change marks the file dirty.
    pub async fn truncate(&self, path: &str, len: u64) -> FsResult<()> {
        let file = self.handle_file(path)?;
        let mut file = file.lock().await;

        if file.len == len {
            return Ok(());
        }
        file.scratch.set_len(len)?;
        file.len = len;
        file.dirty = true;
        Ok(())
    }

    pub async fn mark_dirty(&self, path: &str) -> FsResult<()> {
        let file = self.live_or_err(path)?;
        file.lock().await.dirty = true;
        Ok(())
    }

    pub async fn is_dirty(&self, path: &str) -> bool {
        match self.live_file(path) {
            Some(file) => file.lock().await.dirty,
            None => false,
        }
    }

    /// Current scratch length of the file open at `path`
    pub async fn size_of(&self, path: &str) -> Option<u64> {
        let file = self.live_file(path)?;
        let len = file.lock().await.len;
        Some(len)
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.entries.lock().live.contains_key(path)
    }

    /// Whether any handle, detached or not, still refers to `path`
    pub fn has_handles(&self, path: &str) -> bool {
        self.entries.lock().any(path).is_some()
    }

    pub fn handles(&self, path: &str) -> usize {
        self.entries
            .lock()
            .live
            .get(path)
            .map(|slot| slot.handles)
            .unwrap_or(0)
    }

    pub fn open_paths(&self) -> Vec<String> {
        self.entries.lock().live.keys().cloned().collect()
    }

    /// Upload scratch if it holds unflushed writes.
    ///
    /// Returns the upload report, or `None` when there was nothing to send
    /// (including when `path` is not open). On failure the file stays dirty.
    pub async fn flush_if_dirty(&self, path: &str) -> FsResult<Option<UploadReport>> {
        let Some(file) = self.live_file(path) else {
            return Ok(None);
        };
        let mut file = file.lock().await;
        if !file.dirty {
            return Ok(None);
        }

        let len = file.len;
        file.scratch.seek(SeekFrom::Start(0))?;
        let reader = (&mut file.scratch).take(len);
        match upload(&self.client, path, reader, len).await {
            Ok(report) => {
                file.dirty = false;
                Ok(Some(report))
            }
            Err(e) => {
                tracing::error!("failed to upload {}: {}", path, e);
                Err(e.into())
            }
        }
    }

    /// Drop one handle of a detached entry at `path`, if there is one
    fn release_detached(&self, path: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(i) = entries.detached_index(path) else {
            return false;
        };
        let slot = &mut entries.detached[i].1;
        slot.handles = slot.handles.saturating_sub(1);
        if slot.handles == 0 {
            entries.detached.remove(i);
            tracing::debug!("closed detached {}", path);
        }
        true
    }

    /// Release one handle on `path`.
    ///
    /// Handles on a detached entry go first and never upload; otherwise this
    /// is [`OpenFileTable::close`].
    pub async fn release(&self, path: &str) -> FsResult<Option<UploadReport>> {
        if self.release_detached(path) {
            return Ok(None);
        }
        self.close(path).await
    }

    /// Flush the live entry at `path`, then drop one of its handles.
    ///
    /// The last close frees scratch and forgets the path, unless the flush
    /// failed: then the dirty entry is kept so a later release or
    /// [`OpenFileTable::flush_all`] can retry, and the error is returned.
    pub async fn close(&self, path: &str) -> FsResult<Option<UploadReport>> {
        let flushed = self.flush_if_dirty(path).await;

        let mut entries = self.entries.lock();
        let Some(slot) = entries.live.get_mut(path) else {
            return flushed;
        };
        slot.handles = slot.handles.saturating_sub(1);
        if slot.handles == 0 && flushed.is_ok() {
            entries.live.remove(path);
            tracing::debug!("closed {}", path);
        }
        flushed
    }

    /// Undo one [`OpenFileTable::acquire`] without uploading.
    ///
    /// An entry the acquire created is dropped with its writes once no other
    /// handle holds it.
    pub fn abandon(&self, path: &str, fresh: bool) {
        let mut entries = self.entries.lock();
        let Some(slot) = entries.live.get_mut(path) else {
            return;
        };
        slot.handles = slot.handles.saturating_sub(1);
        if fresh && slot.handles == 0 {
            entries.live.remove(path);
        }
    }

    /// Detach `path` and anything open beneath it.
    ///
    /// Open handles keep their scratch until released, but pending writes
    /// are never uploaded. Returns the number of entries affected.
    pub fn detach(&self, path: &str) -> usize {
        let (detached, dropped) = self.entries.lock().detach_within(path, None);
        detached.len() + dropped.len()
    }

    /// Move the entry for `from`, and every open path beneath it, to `to`.
    ///
    /// Scratch and dirty state travel untouched. Whatever was open at or
    /// beneath `to` is detached first, whether or not anything moves onto it.
    pub fn rename(&self, from: &str, to: &str) -> Rekey {
        let mut rekey = Rekey::default();
        if from == to {
            return rekey;
        }

        let mut entries = self.entries.lock();
        let (detached, dropped) = entries.detach_within(to, Some(from));
        rekey.detached = detached;
        rekey.dropped = dropped;

        let sources: Vec<String> = entries
            .live
            .keys()
            .filter(|key| path_ops::is_within(key, from))
            .cloned()
            .collect();

        let mut moving = Vec::with_capacity(sources.len());
        for source in sources {
            let Some(target) = path_ops::rebase(&source, from, to) else {
                continue;
            };
            if let Some(slot) = entries.live.remove(&source) {
                moving.push((source, target, slot));
            }
        }

        for (source, target, slot) in moving {
            tracing::debug!("re-keyed open file {} -> {}", source, target);
            entries.live.insert(target.clone(), slot);
            rekey.moved.push((source, target));
        }
        rekey
    }

    /// Undo a [`OpenFileTable::rename`]
    pub fn restore(&self, rekey: Rekey) {
        let mut entries = self.entries.lock();

        let moved: Vec<(String, Slot)> = rekey
            .moved
            .into_iter()
            .filter_map(|(source, target)| entries.live.remove(&target).map(|slot| (source, slot)))
            .collect();
        for (source, slot) in moved {
            entries.live.insert(source, slot);
        }

        for (path, file) in rekey.detached {
            if entries.live.contains_key(&path) {
                continue;
            }
            let found = entries
                .detached
                .iter()
                .position(|(_, slot)| Arc::ptr_eq(&slot.file, &file));
            if let Some(i) = found {
                let (_, slot) = entries.detached.remove(i);
                entries.live.insert(path, slot);
            }
        }
        for (path, slot) in rekey.dropped {
            entries.live.entry(path).or_insert(slot);
        }
    }

    /// Flush every dirty file, returning the paths that failed.
    ///
    /// Entries left behind by a failed release are closed once they save.
    pub async fn flush_all(&self) -> Vec<(String, FsError)> {
        let mut failures = Vec::new();
        for path in self.open_paths() {
            match self.flush_if_dirty(&path).await {
                Ok(_) => {
                    let mut entries = self.entries.lock();
                    if entries
                        .live
                        .get(&path)
                        .map(|slot| slot.handles == 0)
                        .unwrap_or(false)
                    {
                        entries.live.remove(&path);
                    }
                }
                Err(e) => failures.push((path, e)),
            }
        }
        failures
    }
}
