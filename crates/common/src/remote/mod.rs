//! Client for the object store's control-plane API.
//!
//! [`HttpApi`] speaks the wire protocol, [`DirectoryCache`] keeps listings
//! around for a short TTL, and [`RemoteClient`] ties the two together into
//! the surface the filesystem layer talks to.

mod api;
mod client;
mod http;
mod listing;

pub use api::{
    ListedObject, Listing, ManifestEntry, ObjectKind, ObjectMutation, ObjectStoreApi,
    PartDescriptor, RemoteObject,
};
pub use client::RemoteClient;
pub use http::{AuthSession, ClientConfig, HttpApi, API_VERSION, DEFAULT_API_URL};
pub use listing::{DirectoryCache, DEFAULT_LISTING_TTL};
