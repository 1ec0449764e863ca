//! Time-to-live cache of directory listings.
//!
//! Uses moka for concurrent access: every entry carries its own absolute
//! expiry, concurrent populates of one path are coalesced into a single
//! fetch, and there is no capacity bound. Entries leave the cache only by
//! going stale or by explicit invalidation.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::ops::compute::Op;
use moka::Expiry;

use super::api::{Listing, RemoteObject};
use crate::error::{RemoteError, Result};
use crate::path_ops;

/// How long a listing is trusted when the caller does not say otherwise
pub const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct CachedListing {
    children: Arc<Listing>,
    expires_at: Instant,
}

impl CachedListing {
    fn fresh(children: Listing, ttl: Duration) -> Self {
        Self {
            children: Arc::new(children),
            expires_at: Instant::now() + ttl,
        }
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        Some(self.expires_at.saturating_duration_since(now))
    }
}

/// Expiry driven by the absolute deadline stored in each value.
///
/// A refetch builds a new deadline; a local patch clones the old one, so
/// patching never extends a listing's life.
struct ListingExpiry;

impl Expiry<String, CachedListing> for ListingExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedListing,
        created_at: Instant,
    ) -> Option<Duration> {
        value.remaining(created_at)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedListing,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining(updated_at)
    }
}

/// Directory listings keyed by absolute path
pub struct DirectoryCache {
    entries: Cache<String, CachedListing>,
    default_ttl: Duration,
}

impl std::fmt::Debug for DirectoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryCache")
            .field("entries", &self.entries.entry_count())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl DirectoryCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .expire_after(ListingExpiry)
                .support_invalidation_closures()
                .build(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Cached children of `path`, if present and unexpired
    pub async fn get(&self, path: &str) -> Option<Arc<Listing>> {
        self.entries.get(path).await.map(|cached| cached.children)
    }

    /// Serve `path` from cache or populate it with `fetch`.
    ///
    /// Concurrent callers for the same path wait on one fetch and share its
    /// outcome; a failed fetch caches nothing.
    pub async fn get_or_fetch<F>(&self, path: &str, ttl: Duration, fetch: F) -> Result<Arc<Listing>>
    where
        F: Future<Output = Result<Listing>>,
    {
        self.entries
            .try_get_with(path.to_string(), async move {
                let children = fetch.await?;
                Ok(CachedListing::fresh(children, ttl))
            })
            .await
            .map(|cached| cached.children)
            .map_err(|e: Arc<RemoteError>| (*e).clone())
    }

    /// Replace a listing wholesale with a fresh expiry
    pub async fn replace(&self, path: &str, children: Listing, ttl: Duration) {
        self.entries
            .insert(path.to_string(), CachedListing::fresh(children, ttl))
            .await;
    }

    /// Apply `patch` to the cached listing of `parent`.
    ///
    /// Does nothing when `parent` is not cached (or already stale): the next
    /// lookup fetches the server's view anyway. Returns whether a listing
    /// was patched.
    pub async fn patch<F>(&self, parent: &str, patch: F) -> bool
    where
        F: FnOnce(&mut Listing),
    {
        let result = self
            .entries
            .entry(parent.to_string())
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(entry) => {
                        let mut cached = entry.into_value();
                        patch(Arc::make_mut(&mut cached.children));
                        Op::Put(cached)
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        matches!(result, moka::ops::compute::CompResult::ReplacedWith(_))
    }

    /// Insert or overwrite a child record in its parent's cached listing
    pub async fn insert_child(&self, parent: &str, object: RemoteObject) -> bool {
        self.patch(parent, move |children| {
            children.insert(object.name.clone(), object);
        })
        .await
    }

    /// Drop a child record from its parent's cached listing, returning it
    pub async fn remove_child(&self, parent: &str, name: &str) -> Option<RemoteObject> {
        let mut removed = None;
        self.patch(parent, |children| removed = children.remove(name))
            .await;
        removed
    }

    /// Forget the listing of one path
    pub async fn invalidate(&self, path: &str) {
        self.entries.invalidate(path).await;
    }

    /// Forget the listing of `path` and of everything beneath it
    pub fn invalidate_tree(&self, path: &str) {
        let root = path_ops::normalize(path);
        if let Err(e) = self
            .entries
            .invalidate_entries_if(move |key, _| path_ops::is_within(key, &root))
        {
            tracing::warn!("failed to invalidate listings under {}: {}", path, e);
        }
    }
}
