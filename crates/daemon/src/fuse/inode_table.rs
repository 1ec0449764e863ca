//! Inode to path mapping.
//!
//! FUSE names files by inode, the store by path. Inodes are handed out on
//! first sight of a path and stay stable across renames.

use std::collections::HashMap;

use common::path_ops;

/// Bidirectional mapping between inodes and remote paths
#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    next_inode: u64,
}

impl InodeTable {
    pub const ROOT_INODE: u64 = 1;

    /// Create a new inode table with the root directory at inode 1
    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        let root = path_ops::ROOT.to_string();
        table.path_to_inode.insert(root.clone(), Self::ROOT_INODE);
        table.inode_to_path.insert(Self::ROOT_INODE, root);
        table
    }

    /// Get the inode for a path, allocating one if it has none yet
    pub fn get_or_create(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_inode.get(path) {
            return ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(path.to_string(), ino);
        self.inode_to_path.insert(ino, path.to_string());
        ino
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(path).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }

    /// Forget a path and everything beneath it (for deleted files and directories)
    pub fn remove_path(&mut self, path: &str) {
        if path == path_ops::ROOT {
            return;
        }
        let doomed: Vec<String> = self
            .path_to_inode
            .keys()
            .filter(|key| path_ops::is_within(key, path))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(ino) = self.path_to_inode.remove(&key) {
                self.inode_to_path.remove(&ino);
            }
        }
    }

    /// Move a path and its descendants, keeping their inodes.
    ///
    /// Whatever was mapped at the destination is forgotten first.
    pub fn rename(&mut self, from: &str, to: &str) {
        if from == to || from == path_ops::ROOT {
            return;
        }
        self.remove_path(to);

        let moving: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(key, _)| path_ops::is_within(key, from))
            .map(|(key, ino)| (key.clone(), *ino))
            .collect();
        for (old, ino) in moving {
            if let Some(new) = path_ops::rebase(&old, from, to) {
                self.path_to_inode.remove(&old);
                self.path_to_inode.insert(new.clone(), ino);
                self.inode_to_path.insert(ino, new);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
