//! `fuser::Filesystem` binding for [`FilesystemAdapter`].
//!
//! Each callback resolves inodes to paths, runs the adapter on the tokio
//! runtime via `block_on` and turns the outcome into a reply.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::path_ops;
use common::remote::ObjectKind;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use tokio::runtime::Handle;

use super::adapter::{Attributes, FilesystemAdapter};
use super::error::{FsError, FsResult};
use super::inode_table::InodeTable;

/// Paths open file handles were opened at, following renames.
///
/// A handle keeps reaching its file after the inode's path is unlinked or
/// renamed over.
#[derive(Debug)]
struct OpenHandles {
    paths: HashMap<u64, String>,
    next_fh: u64,
}

impl OpenHandles {
    fn new() -> Self {
        Self {
            paths: HashMap::new(),
            next_fh: 1,
        }
    }

    fn insert(&mut self, path: &str) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.paths.insert(fh, path.to_string());
        fh
    }

    fn get(&self, fh: u64) -> Option<&str> {
        self.paths.get(&fh).map(String::as_str)
    }

    fn remove(&mut self, fh: u64) -> Option<String> {
        self.paths.remove(&fh)
    }

    /// Move handles under `from` to `to`; handles already at `to` stay put
    fn rename(&mut self, from: &str, to: &str) {
        for path in self.paths.values_mut() {
            if let Some(rebased) = path_ops::rebase(path, from, to) {
                *path = rebased;
            }
        }
    }
}

pub struct CopyFs {
    rt: Handle,
    adapter: Arc<FilesystemAdapter>,
    inodes: InodeTable,
    handles: OpenHandles,
    uid: u32,
    gid: u32,
}

impl CopyFs {
    /// How long the kernel may cache the attributes and entries we return
    const ATTR_TTL: Duration = Duration::from_secs(1);

    const BLOCK_SIZE: u32 = 512;

    pub fn new(rt: Handle, adapter: Arc<FilesystemAdapter>) -> Self {
        Self {
            rt,
            adapter,
            inodes: InodeTable::new(),
            handles: OpenHandles::new(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, libc::c_int> {
        self.inodes
            .get_path(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    /// The path an open handle refers to, else the inode's current path
    fn handle_path(&self, ino: u64, fh: u64) -> Result<String, libc::c_int> {
        match self.handles.get(fh) {
            Some(path) => Ok(path.to_string()),
            None => self.path_of(ino),
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, libc::c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(path_ops::join(&self.path_of(parent)?, name))
    }

    fn make_attr(&self, ino: u64, attr: &Attributes) -> FileAttr {
        let kind = match attr.kind {
            ObjectKind::Dir => FileType::Directory,
            ObjectKind::File => FileType::RegularFile,
        };
        let crtime = UNIX_EPOCH + Duration::from_secs(attr.created_at.max(0) as u64);
        let mtime = UNIX_EPOCH + Duration::from_secs(attr.modified_at.max(0) as u64);

        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(Self::BLOCK_SIZE as u64),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime,
            kind,
            perm: attr.perm,
            nlink: if attr.is_dir() { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: Self::BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Log a failed operation and hand back its errno
    fn fail(op: &str, path: &str, e: FsError) -> libc::c_int {
        if e.is_not_found() {
            tracing::debug!("{} {}: {}", op, path, e);
        } else {
            tracing::error!("{} {} failed: {}", op, path, e);
        }
        e.errno()
    }

    fn entry_for(&mut self, path: &str, attr: &Attributes) -> FileAttr {
        let ino = self.inodes.get_or_create(path);
        self.make_attr(ino, attr)
    }
}

impl Filesystem for CopyFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        tracing::info!("filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("filesystem unmounting, flushing open files");
        let adapter = self.adapter.clone();
        self.rt.block_on(async move { adapter.flush_all().await });
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        match self.rt.block_on(self.adapter.get_attr(&path)) {
            Ok(attr) => {
                let file_attr = self.entry_for(&path, &attr);
                reply.entry(&Self::ATTR_TTL, &file_attr, 0);
            }
            Err(e) => reply.error(Self::fail("lookup", &path, e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        match self.rt.block_on(self.adapter.get_attr(&path)) {
            Ok(attr) => reply.attr(&Self::ATTR_TTL, &self.make_attr(ino, &attr)),
            Err(e) => reply.error(Self::fail("getattr", &path, e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let resolved = match fh {
            Some(fh) => self.handle_path(ino, fh),
            None => self.path_of(ino),
        };
        let path = match resolved {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        let adapter = self.adapter.clone();
        let result: FsResult<Attributes> = self.rt.block_on(async {
            if let Some(len) = size {
                adapter.truncate(&path, len).await?;
            }
            if let Some(mode) = mode {
                adapter.chmod(&path, mode).await?;
            }
            if uid.is_some() || gid.is_some() {
                adapter.chown(&path, uid, gid).await?;
            }
            adapter.get_attr(&path).await
        });

        match result {
            Ok(attr) => reply.attr(&Self::ATTR_TTL, &self.make_attr(ino, &attr)),
            Err(e) => reply.error(Self::fail("setattr", &path, e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        match self.rt.block_on(self.adapter.mkdir(&path)) {
            Ok(attr) => {
                let file_attr = self.entry_for(&path, &attr);
                reply.entry(&Self::ATTR_TTL, &file_attr, 0);
            }
            Err(e) => reply.error(Self::fail("mkdir", &path, e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        match self.rt.block_on(self.adapter.unlink(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(Self::fail("unlink", &path, e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        match self.rt.block_on(self.adapter.rmdir(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(Self::fail("rmdir", &path, e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (from, to) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };

        match self.rt.block_on(self.adapter.rename(&from, &to)) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                self.handles.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(Self::fail("rename", &from, e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        match self.rt.block_on(self.adapter.open(&path)) {
            Ok(()) => {
                let fh = self.handles.insert(&path);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(Self::fail("open", &path, e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.handle_path(ino, fh) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };

        match self
            .rt
            .block_on(self.adapter.read(&path, size as usize, offset))
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(Self::fail("read", &path, e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.handle_path(ino, fh) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };

        match self.rt.block_on(self.adapter.write(&path, data, offset)) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(Self::fail("write", &path, e)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let path = match self.handle_path(ino, fh) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        match self.rt.block_on(self.adapter.flush(&path)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::fail("flush", &path, e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = match self.handles.remove(fh) {
            Some(path) => path,
            None => match self.path_of(ino) {
                Ok(p) => p,
                Err(e) => return reply.error(e),
            },
        };

        match self.rt.block_on(self.adapter.release(&path)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::fail("release", &path, e)),
        }
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let path = match self.handle_path(ino, fh) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        match self.rt.block_on(self.adapter.fsync(&path, datasync)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::fail("fsync", &path, e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        let entries = match self.rt.block_on(self.adapter.read_dir(&path)) {
            Ok(entries) => entries,
            Err(e) => return reply.error(Self::fail("readdir", &path, e)),
        };

        let parent_ino = if ino == InodeTable::ROOT_INODE {
            ino
        } else {
            self.inodes.get_or_create(&path_ops::parent_of(&path))
        };

        for (i, entry) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            let entry_ino = match entry.name.as_str() {
                "." => ino,
                ".." => parent_ino,
                name => self.inodes.get_or_create(&path_ops::join(&path, name)),
            };
            let kind = match entry.kind {
                ObjectKind::Dir => FileType::Directory,
                ObjectKind::File => FileType::RegularFile,
            };
            if reply.add(entry_ino, (i + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stat = self.adapter.statfs();
        reply.statfs(
            stat.blocks,
            stat.bfree,
            stat.bavail,
            stat.files,
            stat.ffree,
            stat.bsize,
            stat.namelen,
            stat.bsize,
        );
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        match self.rt.block_on(self.adapter.create(&path)) {
            Ok(attr) => {
                let file_attr = self.entry_for(&path, &attr);
                let fh = self.handles.insert(&path);
                reply.created(&Self::ATTR_TTL, &file_attr, 0, fh, 0);
            }
            Err(e) => reply.error(Self::fail("create", &path, e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.error(libc::ENOSYS);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }
}
