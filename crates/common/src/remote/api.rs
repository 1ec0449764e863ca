use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use crate::error::Result;
use crate::path_ops;
use crate::upload::Chunk;

/// Children of one directory, keyed by name
pub type Listing = BTreeMap<String, RemoteObject>;

/// What kind of object a listing entry describes.
///
/// The server only distinguishes files; anything else it reports is treated
/// as a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    File,
    #[serde(other)]
    Dir,
}

/// One child as it appears in a `/list_objects` response.
///
/// Numeric fields arrive as numbers or as decimal strings depending on the
/// server build, so both are accepted.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedObject {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub size: Option<u64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub created_time: Option<i64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub modified_time: Option<i64>,
}

/// A file or directory in a cached listing.
///
/// Snapshots are immutable from the server's point of view; a refresh
/// replaces the whole listing rather than individual records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub name: String,
    pub kind: ObjectKind,
    pub size: u64,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds, equal to `created_at` when the server reported none
    pub modified_at: i64,
}

impl RemoteObject {
    pub fn file(name: impl Into<String>, size: u64, created_at: i64, modified_at: i64) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::File,
            size,
            created_at,
            modified_at,
        }
    }

    pub fn dir(name: impl Into<String>, created_at: i64) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Dir,
            size: 0,
            created_at,
            modified_at: created_at,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Dir
    }
}

impl From<ListedObject> for RemoteObject {
    fn from(listed: ListedObject) -> Self {
        let created_at = listed.created_time.unwrap_or_default();
        Self {
            name: path_ops::name_of(&listed.path).to_string(),
            kind: listed.kind,
            size: listed.size.unwrap_or_default(),
            created_at,
            modified_at: listed.modified_time.unwrap_or(created_at),
        }
    }
}

/// A `{fingerprint, size}` pair as exchanged with the `has_parts` query
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartDescriptor {
    pub fingerprint: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub size: u32,
}

/// One entry of a committed object's ordered chunk manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub fingerprint: String,
    pub offset: u64,
    pub size: u32,
}

/// Metadata changes understood by `/update_objects`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectMutation {
    /// Commit a file whose parts have already been stored
    CreateFile {
        path: String,
        size: u64,
        parts: Vec<ManifestEntry>,
    },
    CreateDir {
        path: String,
    },
    Remove {
        path: String,
    },
    Rename {
        path: String,
        new_path: String,
    },
}

impl ObjectMutation {
    pub fn action(&self) -> &'static str {
        match self {
            Self::CreateFile { .. } | Self::CreateDir { .. } => "create",
            Self::Remove { .. } => "remove",
            Self::Rename { .. } => "rename",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::CreateFile { path, .. }
            | Self::CreateDir { path }
            | Self::Remove { path }
            | Self::Rename { path, .. } => path,
        }
    }
}

/// The remote object store's wire surface.
///
/// [`crate::remote::HttpApi`] talks to the real service; the in-memory
/// store in `testkit` implements the same contract for tests.
#[async_trait]
pub trait ObjectStoreApi: Send + Sync + Debug + 'static {
    /// Raw children of a directory, in server order
    async fn list_objects(&self, path: &str) -> Result<Vec<ListedObject>>;

    /// Full content of an object
    async fn download_object(&self, path: &str) -> Result<Bytes>;

    /// Ask which of `parts` still have to be transmitted
    async fn has_parts(&self, parts: &[PartDescriptor]) -> Result<Vec<PartDescriptor>>;

    /// Transmit chunk payloads in one batch. Every chunk must still carry its payload.
    async fn send_parts(&self, parts: &[Chunk]) -> Result<()>;

    /// Apply metadata mutations
    async fn update_objects(&self, mutations: &[ObjectMutation]) -> Result<()>;
}
