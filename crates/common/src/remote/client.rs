use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::api::{Listing, ObjectMutation, ObjectStoreApi, RemoteObject};
use super::http::{ClientConfig, HttpApi};
use super::listing::DirectoryCache;
use crate::error::Result;
use crate::path_ops;

/// The filesystem layer's view of the object store.
///
/// Listings go through a TTL cache; downloads and mutations always hit the
/// server. Mutations do not touch the cache on their own: callers patch or
/// invalidate the affected listings through [`RemoteClient::listings`].
#[derive(Debug, Clone)]
pub struct RemoteClient {
    api: Arc<dyn ObjectStoreApi>,
    listings: Arc<DirectoryCache>,
}

impl RemoteClient {
    pub fn new(api: Arc<dyn ObjectStoreApi>, listing_ttl: Duration) -> Self {
        Self {
            api,
            listings: Arc::new(DirectoryCache::new(listing_ttl)),
        }
    }

    /// Log in over HTTP and wrap the authenticated api
    pub async fn connect(config: &ClientConfig, username: &str, password: &str) -> Result<Self> {
        let api = HttpApi::login(config, username, password).await?;
        Ok(Self::new(Arc::new(api), config.listing_ttl))
    }

    pub fn api(&self) -> &dyn ObjectStoreApi {
        self.api.as_ref()
    }

    pub fn listings(&self) -> &DirectoryCache {
        &self.listings
    }

    /// Children of `path`, from cache while the listing is fresh
    pub async fn list_children(&self, path: &str) -> Result<Arc<Listing>> {
        self.list_children_with_ttl(path, self.listings.default_ttl())
            .await
    }

    /// Like [`RemoteClient::list_children`], with the TTL a fresh fetch is cached for
    pub async fn list_children_with_ttl(&self, path: &str, ttl: Duration) -> Result<Arc<Listing>> {
        let path = path_ops::normalize(path);
        let api = self.api.clone();
        let fetch_path = path.clone();

        self.listings
            .get_or_fetch(&path, ttl, async move {
                tracing::debug!("listing {}", fetch_path);
                let children = api.list_objects(&fetch_path).await?;
                Ok(children
                    .into_iter()
                    .map(RemoteObject::from)
                    .map(|object| (object.name.clone(), object))
                    .collect())
            })
            .await
    }

    /// Look up one entry through its parent's listing
    pub async fn lookup(&self, path: &str) -> Result<Option<RemoteObject>> {
        let children = self.list_children(&path_ops::parent_of(path)).await?;
        Ok(children.get(path_ops::name_of(path)).cloned())
    }

    /// Record `object` in the cached listing of `parent`, if that listing is cached
    pub async fn insert_cached_child(&self, parent: &str, object: RemoteObject) -> bool {
        self.listings.insert_child(parent, object).await
    }

    pub async fn remove_cached_child(&self, parent: &str, name: &str) -> Option<RemoteObject> {
        self.listings.remove_child(parent, name).await
    }

    pub async fn invalidate_listing(&self, path: &str) {
        self.listings.invalidate(&path_ops::normalize(path)).await
    }

    /// Forget the cached listing of `path` and every directory below it
    pub fn invalidate_listing_tree(&self, path: &str) {
        self.listings.invalidate_tree(path)
    }

    pub async fn download_object(&self, path: &str) -> Result<Bytes> {
        tracing::debug!("downloading {}", path);
        self.api.download_object(path).await
    }

    pub async fn mutate_metadata(&self, mutation: ObjectMutation) -> Result<()> {
        tracing::debug!("{} {}", mutation.action(), mutation.path());
        self.api.update_objects(std::slice::from_ref(&mutation)).await
    }
}
