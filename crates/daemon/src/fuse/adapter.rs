//! Path-based filesystem operations over the remote store.
//!
//! Everything here speaks absolute remote paths; the FUSE binding in
//! `copy_fs` only translates inodes to paths and results to replies.

use common::error::RemoteError;
use common::path_ops;
use common::remote::{ObjectKind, ObjectMutation, RemoteClient, RemoteObject};
use common::upload::UploadReport;

use super::error::{FsError, FsResult};
use super::open_files::OpenFileTable;

pub const ROOT_PERM: u16 = 0o555;
pub const DIR_PERM: u16 = 0o755;
pub const FILE_PERM: u16 = 0o644;

/// Attributes of one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub kind: ObjectKind,
    pub size: u64,
    pub perm: u16,
    /// Unix seconds
    pub created_at: i64,
    pub modified_at: i64,
}

impl Attributes {
    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Dir
    }

    fn root() -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            kind: ObjectKind::Dir,
            size: 0,
            perm: ROOT_PERM,
            created_at: now,
            modified_at: now,
        }
    }
}

impl From<&RemoteObject> for Attributes {
    fn from(object: &RemoteObject) -> Self {
        Self {
            kind: object.kind,
            size: object.size,
            perm: if object.is_dir() { DIR_PERM } else { FILE_PERM },
            created_at: object.created_at,
            modified_at: object.modified_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: ObjectKind,
}

/// Filesystem statistics. The store exposes no quota, so these are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namelen: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            bsize: 512,
            blocks: 4096,
            bfree: 2048,
            bavail: 2048,
            files: 0,
            ffree: 0,
            namelen: 255,
        }
    }
}

#[derive(Debug)]
pub struct FilesystemAdapter {
    client: RemoteClient,
    files: OpenFileTable,
}

impl FilesystemAdapter {
    pub fn new(client: RemoteClient, spool_threshold: usize) -> Self {
        Self {
            files: OpenFileTable::new(client.clone(), spool_threshold),
            client,
        }
    }

    pub fn client(&self) -> &RemoteClient {
        &self.client
    }

    pub fn open_files(&self) -> &OpenFileTable {
        &self.files
    }

    pub async fn get_attr(&self, path: &str) -> FsResult<Attributes> {
        let path = path_ops::normalize(path);
        tracing::debug!("getattr {}", path);
        if path == path_ops::ROOT {
            return Ok(Attributes::root());
        }

        let object = self
            .client
            .lookup(&path)
            .await?
            .ok_or_else(|| RemoteError::NotFound(path.clone()))?;
        let mut attr = Attributes::from(&object);
        if !attr.is_dir() {
            if let Some(size) = self.files.size_of(&path).await {
                attr.size = size;
            }
        }
        Ok(attr)
    }

    /// `.` and `..` followed by the directory's children
    pub async fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = path_ops::normalize(path);
        tracing::debug!("readdir {}", path);
        if path != path_ops::ROOT && !self.get_attr(&path).await?.is_dir() {
            return Err(FsError::NotDirectory(path));
        }

        let children = self.client.list_children(&path).await?;
        let mut entries = Vec::with_capacity(children.len() + 2);
        for name in [".", ".."] {
            entries.push(DirEntry {
                name: name.to_string(),
                kind: ObjectKind::Dir,
            });
        }
        entries.extend(children.values().map(|child| DirEntry {
            name: child.name.clone(),
            kind: child.kind,
        }));
        Ok(entries)
    }

    /// Open an existing file with its remote content
    pub async fn open(&self, path: &str) -> FsResult<()> {
        let path = path_ops::normalize(path);
        tracing::debug!("open {}", path);
        if !self.files.is_open(&path) && self.get_attr(&path).await?.is_dir() {
            return Err(FsError::IsDirectory(path));
        }
        self.files.acquire(&path, true).await?;
        Ok(())
    }

    /// Create an empty file and register it with the store right away.
    ///
    /// The new file shows up in its parent's cached listing immediately. If
    /// the registration fails, nothing is left behind locally.
    pub async fn create(&self, path: &str) -> FsResult<Attributes> {
        let path = path_ops::normalize(path);
        let parent = path_ops::parent_of(&path);
        let name = path_ops::name_of(&path).to_string();
        tracing::debug!("create {}", path);

        let fresh = self.files.acquire(&path, false).await?;
        let now = chrono::Utc::now().timestamp();
        let seeded = RemoteObject::file(name.clone(), 0, now, now);
        self.client
            .insert_cached_child(&parent, seeded.clone())
            .await;

        let registered = match self.files.mark_dirty(&path).await {
            Ok(()) => self.flush(&path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            tracing::error!("failed to create {}: {}", path, e);
            self.files.abandon(&path, fresh);
            if fresh {
                self.client.remove_cached_child(&parent, &name).await;
            }
            return Err(e);
        }
        Ok(Attributes::from(&seeded))
    }

    pub async fn read(&self, path: &str, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        self.files
            .read(&path_ops::normalize(path), size, offset)
            .await
    }

    pub async fn write(&self, path: &str, data: &[u8], offset: u64) -> FsResult<usize> {
        self.files
            .write(&path_ops::normalize(path), data, offset)
            .await
    }

    /// Resize a file. A file that is not open is opened, resized and closed,
    /// which uploads the result.
    pub async fn truncate(&self, path: &str, len: u64) -> FsResult<()> {
        let path = path_ops::normalize(path);
        tracing::debug!("truncate {} to {}", path, len);
        if self.files.is_open(&path) {
            return self.files.truncate(&path, len).await;
        }

        let attr = match self.get_attr(&path).await {
            // Unlinked while open: only its handles can still reach it.
            Err(e) if e.is_not_found() && self.files.has_handles(&path) => {
                return self.files.truncate(&path, len).await;
            }
            attr => attr?,
        };
        if attr.is_dir() {
            return Err(FsError::IsDirectory(path));
        }
        // Nothing to keep when truncating to zero, so skip the download.
        let emptied = len == 0;
        let fresh = self.files.acquire(&path, !emptied).await?;
        let resized = if emptied {
            self.files.mark_dirty(&path).await
        } else {
            self.files.truncate(&path, len).await
        };
        if let Err(e) = resized {
            self.files.abandon(&path, fresh);
            return Err(e);
        }
        let report = self.files.close(&path).await?;
        self.record_upload(&path, report).await;
        Ok(())
    }

    /// Upload pending writes, if any
    pub async fn flush(&self, path: &str) -> FsResult<()> {
        let path = path_ops::normalize(path);
        tracing::debug!("flush {}", path);
        let report = self.files.flush_if_dirty(&path).await?;
        self.record_upload(&path, report).await;
        Ok(())
    }

    /// Same as [`FilesystemAdapter::flush`]; data and metadata are committed together
    pub async fn fsync(&self, path: &str, _datasync: bool) -> FsResult<()> {
        self.flush(path).await
    }

    pub async fn release(&self, path: &str) -> FsResult<()> {
        let path = path_ops::normalize(path);
        tracing::debug!("release {}", path);
        let report = self.files.release(&path).await?;
        self.record_upload(&path, report).await;
        Ok(())
    }

    /// Reflect a committed upload in the parent's cached listing
    async fn record_upload(&self, path: &str, report: Option<UploadReport>) {
        let Some(report) = report else {
            return;
        };
        let name = path_ops::name_of(path).to_string();
        let now = chrono::Utc::now().timestamp();
        self.client
            .listings()
            .patch(&path_ops::parent_of(path), move |children| {
                let entry = children
                    .entry(name.clone())
                    .or_insert_with(|| RemoteObject::file(name, 0, now, now));
                entry.kind = ObjectKind::File;
                entry.size = report.size;
                entry.modified_at = now;
            })
            .await;
    }

    pub async fn mkdir(&self, path: &str) -> FsResult<Attributes> {
        let path = path_ops::normalize(path);
        tracing::debug!("mkdir {}", path);
        self.client
            .mutate_metadata(ObjectMutation::CreateDir { path: path.clone() })
            .await?;

        let dir = RemoteObject::dir(path_ops::name_of(&path), chrono::Utc::now().timestamp());
        self.client
            .insert_cached_child(&path_ops::parent_of(&path), dir.clone())
            .await;
        Ok(Attributes::from(&dir))
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        let path = path_ops::normalize(path);
        tracing::debug!("unlink {}", path);
        self.remove(&path).await?;
        // Open handles keep their scratch, but it can no longer bring the file back.
        self.files.detach(&path);
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        let path = path_ops::normalize(path);
        tracing::debug!("rmdir {}", path);
        self.remove(&path).await?;
        self.files.detach(&path);
        self.client.invalidate_listing_tree(&path);
        Ok(())
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        self.client
            .mutate_metadata(ObjectMutation::Remove {
                path: path.to_string(),
            })
            .await?;
        self.client
            .remove_cached_child(&path_ops::parent_of(path), path_ops::name_of(path))
            .await;
        Ok(())
    }

    /// Move `from` to `to`, carrying open files and their pending writes along.
    ///
    /// Files open at `to` are detached: their handles keep working, but they
    /// can no longer upload over what was moved there.
    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let from = path_ops::normalize(from);
        let to = path_ops::normalize(to);
        tracing::debug!("rename {} -> {}", from, to);
        if from == to {
            return Ok(());
        }

        let rekey = self.files.rename(&from, &to);
        let renamed = self
            .client
            .mutate_metadata(ObjectMutation::Rename {
                path: from.clone(),
                new_path: to.clone(),
            })
            .await;
        if let Err(e) = renamed {
            tracing::error!("failed to rename {} -> {}: {}", from, to, e);
            self.files.restore(rekey);
            return Err(e.into());
        }

        let new_parent = path_ops::parent_of(&to);
        let moved = self
            .client
            .remove_cached_child(&path_ops::parent_of(&from), path_ops::name_of(&from))
            .await;
        match moved {
            Some(mut object) => {
                object.name = path_ops::name_of(&to).to_string();
                self.client.insert_cached_child(&new_parent, object).await;
            }
            None => self.client.invalidate_listing(&new_parent).await,
        }
        self.client.invalidate_listing_tree(&from);
        self.client.invalidate_listing_tree(&to);
        Ok(())
    }

    /// Permission bits are fixed by kind; changes are accepted and ignored
    pub async fn chmod(&self, path: &str, _mode: u32) -> FsResult<Attributes> {
        self.get_attr(path).await
    }

    /// Ownership is always the mounting user; changes are accepted and ignored
    pub async fn chown(
        &self,
        path: &str,
        _uid: Option<u32>,
        _gid: Option<u32>,
    ) -> FsResult<Attributes> {
        self.get_attr(path).await
    }

    pub fn statfs(&self) -> StatFs {
        StatFs::default()
    }

    /// Upload everything still dirty, logging what could not be saved
    pub async fn flush_all(&self) {
        for (path, e) in self.files.flush_all().await {
            tracing::error!("unsaved changes in {}: {}", path, e);
        }
    }
}
