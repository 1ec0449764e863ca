pub mod adapter;
#[cfg(feature = "fuse")]
pub mod copy_fs;
pub mod error;
pub mod inode_table;
pub mod open_files;

pub use adapter::{Attributes, DirEntry, FilesystemAdapter, StatFs};
#[cfg(feature = "fuse")]
pub use copy_fs::CopyFs;
pub use error::{FsError, FsResult};
pub use inode_table::InodeTable;
pub use open_files::{OpenFileTable, Rekey, DEFAULT_SPOOL_THRESHOLD};
