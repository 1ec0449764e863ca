//! In-process stand-ins for the remote object store.
//!
//! ```rust,ignore
//! use common::testkit::MemoryStore;
//!
//! let store = MemoryStore::new().with_file("/docs/a.txt", b"hello");
//! let client = store.client();
//! let listing = client.list_children("/docs").await?;
//! ```

mod memory;

pub use memory::{MemoryStore, StoreStats};
