use std::ffi::OsStr;
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, TimeOrNow};

use crate::dentry::{join_path, RealKind};
use crate::error::UnionError;
use crate::fs::{UnionFsFuse, BLOCK_SIZE};

pub(crate) fn file_type(kind: RealKind) -> FileType {
    match kind {
        RealKind::Dir => FileType::Directory,
        RealKind::File => FileType::RegularFile,
        RealKind::Symlink => FileType::Symlink,
        RealKind::Special => FileType::NamedPipe,
    }
}

fn meta_file_type(meta: &Metadata) -> FileType {
    let ft = meta.file_type();
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH
    }
}

pub(crate) fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

pub(crate) fn errno_of(e: &UnionError) -> i32 {
    let errno = e.errno();
    if errno == libc::EIO || e.is_stale() {
        log::debug!("reply {}: {}", errno, e);
    }
    errno
}

impl UnionFsFuse {
    pub(crate) fn make_attr(&self, ino: u64, meta: &Metadata) -> FileAttr {
        FileAttr {
            ino,
            size: meta.len(),
            blocks: meta.blocks(),
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
            crtime: UNIX_EPOCH,
            kind: meta_file_type(meta),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Attributes of the control file in the union root.
    pub(crate) fn ctl_file_attr(&self, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: self.ctl_contents().len() as u64,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o600,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Union path of `name` inside directory inode `parent`.
    pub(crate) fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let parent_path = self.inodes.get_path(parent).ok_or(libc::ENOENT)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(join_path(&parent_path, name))
    }

    /// Attributes for `path` with its inode number assigned.
    pub(crate) fn attr_of(&self, path: &str) -> Result<FileAttr, i32> {
        let meta = self.fs.getattr(path).map_err(|e| errno_of(&e))?;
        let ino = self.inodes.get_or_create(path);
        Ok(self.make_attr(ino, &meta))
    }
}
