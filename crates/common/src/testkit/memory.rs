use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{RemoteError, Result};
use crate::path_ops;
use crate::remote::{
    ListedObject, ManifestEntry, ObjectKind, ObjectMutation, ObjectStoreApi, PartDescriptor,
    RemoteClient, DEFAULT_LISTING_TTL,
};
use crate::upload::{chunk_bytes, Chunk, Fingerprint};

/// Calls seen by a [`MemoryStore`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub list_calls: usize,
    pub download_calls: usize,
    pub has_parts_calls: usize,
    pub send_parts_calls: usize,
    pub update_calls: usize,
    /// Chunk payloads received through `send_parts`
    pub parts_received: usize,
    pub bytes_received: u64,
}

/// Object store held in memory, speaking the same contract as the HTTP api.
///
/// Parts are deduplicated by fingerprint and objects are manifests over
/// them, so upload dedup can be observed through [`MemoryStore::stats`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    /// Absolute path -> object. The root is implicit.
    objects: BTreeMap<String, StoredObject>,
    /// Fingerprint -> payload
    parts: HashMap<String, Bytes>,
    stats: StoreStats,
    fail_uploads: bool,
    offline: bool,
}

#[derive(Debug, Clone)]
struct StoredObject {
    kind: ObjectKind,
    size: u64,
    manifest: Vec<ManifestEntry>,
    created_at: i64,
    modified_at: i64,
}

impl StoredObject {
    fn dir(now: i64) -> Self {
        Self {
            kind: ObjectKind::Dir,
            size: 0,
            manifest: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl MemoryStoreInner {
    fn is_dir(&self, path: &str) -> bool {
        path == path_ops::ROOT
            || self
                .objects
                .get(path)
                .map(|o| o.kind == ObjectKind::Dir)
                .unwrap_or(false)
    }

    fn ensure_parent(&self, path: &str) -> Result<()> {
        let parent = path_ops::parent_of(path);
        if self.is_dir(&parent) {
            Ok(())
        } else {
            Err(RemoteError::NotFound(parent))
        }
    }

    fn make_dirs(&mut self, path: &str) {
        let mut current = path_ops::normalize(path);
        let now = now();
        while current != path_ops::ROOT {
            self.objects
                .entry(current.clone())
                .or_insert_with(|| StoredObject::dir(now));
            current = path_ops::parent_of(&current);
        }
    }

    fn store_file(&mut self, path: &str, content: &[u8]) {
        let chunks = chunk_bytes(content);
        for chunk in &chunks {
            if let Some(payload) = &chunk.payload {
                self.parts
                    .insert(chunk.fingerprint.to_string(), payload.clone());
            }
        }
        let now = now();
        self.objects.insert(
            path.to_string(),
            StoredObject {
                kind: ObjectKind::File,
                size: content.len() as u64,
                manifest: chunks.iter().map(Chunk::manifest_entry).collect(),
                created_at: now,
                modified_at: now,
            },
        );
    }

    fn check_online(&self) -> Result<()> {
        if self.offline {
            Err(RemoteError::unavailable("memory store is offline"))
        } else {
            Ok(())
        }
    }

    /// Paths of `path` and everything beneath it
    fn subtree(&self, path: &str) -> Vec<String> {
        self.objects
            .keys()
            .filter(|key| path_ops::is_within(key, path))
            .cloned()
            .collect()
    }

    fn apply(&mut self, mutation: &ObjectMutation) -> Result<()> {
        match mutation {
            ObjectMutation::CreateFile { path, size, parts } => {
                if self.fail_uploads {
                    return Err(RemoteError::unavailable("uploads are failing"));
                }
                let path = path_ops::normalize(path);
                self.ensure_parent(&path)?;
                if self.is_dir(&path) {
                    return Err(RemoteError::unavailable(format!("{} is a directory", path)));
                }
                if let Some(part) = parts.iter().find(|p| {
                    p.size > 0 && !self.parts.contains_key(&p.fingerprint)
                }) {
                    return Err(RemoteError::unavailable(format!(
                        "part {} was never sent",
                        part.fingerprint
                    )));
                }
                let now = now();
                let created_at = self
                    .objects
                    .get(&path)
                    .map(|o| o.created_at)
                    .unwrap_or(now);
                self.objects.insert(
                    path,
                    StoredObject {
                        kind: ObjectKind::File,
                        size: *size,
                        manifest: parts.clone(),
                        created_at,
                        modified_at: now,
                    },
                );
            }
            ObjectMutation::CreateDir { path } => {
                let path = path_ops::normalize(path);
                self.ensure_parent(&path)?;
                self.objects
                    .entry(path)
                    .or_insert_with(|| StoredObject::dir(now()));
            }
            ObjectMutation::Remove { path } => {
                let path = path_ops::normalize(path);
                if !self.objects.contains_key(&path) {
                    return Err(RemoteError::NotFound(path));
                }
                for key in self.subtree(&path) {
                    self.objects.remove(&key);
                }
            }
            ObjectMutation::Rename { path, new_path } => {
                let from = path_ops::normalize(path);
                let to = path_ops::normalize(new_path);
                if !self.objects.contains_key(&from) {
                    return Err(RemoteError::NotFound(from));
                }
                if from == to {
                    return Ok(());
                }
                self.ensure_parent(&to)?;
                for key in self.subtree(&to) {
                    self.objects.remove(&key);
                }
                for key in self.subtree(&from) {
                    if let (Some(object), Some(rebased)) =
                        (self.objects.remove(&key), path_ops::rebase(&key, &from, &to))
                    {
                        self.objects.insert(rebased, object);
                    }
                }
            }
        }
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file, creating missing parent directories
    pub fn with_file(self, path: &str, content: impl AsRef<[u8]>) -> Self {
        let path = path_ops::normalize(path);
        {
            let mut inner = self.inner.lock();
            inner.make_dirs(&path_ops::parent_of(&path));
            inner.store_file(&path, content.as_ref());
        }
        self
    }

    /// Seed a directory and its ancestors
    pub fn with_dir(self, path: &str) -> Self {
        self.inner.lock().make_dirs(path);
        self
    }

    /// A client over this store with the default listing TTL
    pub fn client(&self) -> RemoteClient {
        self.client_with_ttl(DEFAULT_LISTING_TTL)
    }

    pub fn client_with_ttl(&self, ttl: Duration) -> RemoteClient {
        RemoteClient::new(Arc::new(self.clone()), ttl)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner
            .lock()
            .objects
            .contains_key(&path_ops::normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.inner.lock().is_dir(&path_ops::normalize(path))
    }

    /// Reassembled content of a committed file
    pub fn file_content(&self, path: &str) -> Option<Bytes> {
        let inner = self.inner.lock();
        let object = inner.objects.get(&path_ops::normalize(path))?;
        if object.kind != ObjectKind::File {
            return None;
        }
        let mut content = BytesMut::with_capacity(object.size as usize);
        for entry in &object.manifest {
            if entry.size > 0 {
                content.extend_from_slice(inner.parts.get(&entry.fingerprint)?);
            }
        }
        Some(content.freeze())
    }

    /// Manifest the file at `path` was committed with
    pub fn manifest(&self, path: &str) -> Option<Vec<ManifestEntry>> {
        self.inner
            .lock()
            .objects
            .get(&path_ops::normalize(path))
            .map(|o| o.manifest.clone())
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats = StoreStats::default();
    }

    /// Make every file commit fail with `RemoteUnavailable`
    pub fn set_fail_uploads(&self, fail: bool) {
        self.inner.lock().fail_uploads = fail;
    }

    /// Make every call fail with `RemoteUnavailable`
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }
}

#[async_trait]
impl ObjectStoreApi for MemoryStore {
    async fn list_objects(&self, path: &str) -> Result<Vec<ListedObject>> {
        let mut inner = self.inner.lock();
        inner.stats.list_calls += 1;
        inner.check_online()?;

        let path = path_ops::normalize(path);
        if !inner.is_dir(&path) {
            return Err(RemoteError::NotFound(path));
        }
        Ok(inner
            .objects
            .iter()
            .filter(|(key, _)| path_ops::parent_of(key) == path && key.as_str() != path)
            .map(|(key, object)| ListedObject {
                path: key.clone(),
                kind: object.kind,
                size: Some(object.size),
                created_time: Some(object.created_at),
                modified_time: Some(object.modified_at),
            })
            .collect())
    }

    async fn download_object(&self, path: &str) -> Result<Bytes> {
        {
            let mut inner = self.inner.lock();
            inner.stats.download_calls += 1;
            inner.check_online()?;
        }
        self.file_content(path)
            .ok_or_else(|| RemoteError::NotFound(path_ops::normalize(path)))
    }

    async fn has_parts(&self, parts: &[PartDescriptor]) -> Result<Vec<PartDescriptor>> {
        let mut inner = self.inner.lock();
        inner.stats.has_parts_calls += 1;
        inner.check_online()?;

        let mut missing: Vec<PartDescriptor> = Vec::new();
        for part in parts {
            if part.size > 0 && !inner.parts.contains_key(&part.fingerprint) && !missing.contains(part)
            {
                missing.push(part.clone());
            }
        }
        Ok(missing)
    }

    async fn send_parts(&self, parts: &[Chunk]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stats.send_parts_calls += 1;
        inner.check_online()?;
        if inner.fail_uploads {
            return Err(RemoteError::unavailable("uploads are failing"));
        }

        for part in parts {
            let payload = part.payload.clone().ok_or_else(|| {
                RemoteError::ProtocolInvariant(format!(
                    "chunk at offset {} has no payload left to send",
                    part.offset
                ))
            })?;
            if Fingerprint::compute(&payload) != part.fingerprint {
                return Err(RemoteError::unavailable(format!(
                    "payload does not match fingerprint {}",
                    part.fingerprint
                )));
            }
            inner.stats.parts_received += 1;
            inner.stats.bytes_received += payload.len() as u64;
            inner.parts.insert(part.fingerprint.to_string(), payload);
        }
        Ok(())
    }

    async fn update_objects(&self, mutations: &[ObjectMutation]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stats.update_calls += 1;
        inner.check_online()?;
        for mutation in mutations {
            inner.apply(mutation)?;
        }
        Ok(())
    }
}
