/**
 * Error taxonomy shared by every remote-facing
 *  component.
 */
pub mod error;
/**
 * Helpers for the absolute, slash separated
 *  paths the remote store keys objects by.
 */
pub mod path_ops;
/**
 * Authenticated client for the object store's
 *  control plane: login, cached directory
 *  listings, metadata mutation and downloads.
 */
pub mod remote;
/**
 * Content-addressed upload protocol.
 * Splits content into fingerprinted chunks, asks
 *  the server for the ones it already holds and
 *  commits an ordered manifest.
 */
pub mod upload;

/**
 * In-memory object store implementing the
 *  same api contract, for tests and dry runs.
 */
pub mod testkit;

pub mod prelude {
    pub use crate::error::{RemoteError, Result};
    pub use crate::remote::{
        ClientConfig, HttpApi, Listing, ObjectKind, ObjectMutation, ObjectStoreApi, RemoteClient,
        RemoteObject,
    };
    pub use crate::upload::{upload, Chunk, Fingerprint, UploadReport};
}
