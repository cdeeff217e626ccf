use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};

use crate::fs_helpers::{errno_of, file_type, resolve_time};
use crate::inode::{InodeManager, ROOT_INO};
use crate::permission::Cred;
use crate::sb::{SetAttr, UnionFs};

// Branch changes can alter any name at any time, so the kernel must always
// come back to us.
const TTL: Duration = Duration::from_secs(0);
pub(crate) const BLOCK_SIZE: u32 = 512;

pub const CTL_FILE: &str = ".unionfs_ctl";
pub(crate) const CTL_INO: u64 = u64::MAX - 1;

/// FUSE frontend over a [`UnionFs`].
pub struct UnionFsFuse {
    pub(crate) fs: Arc<UnionFs>,
    pub(crate) inodes: InodeManager,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
}

impl UnionFsFuse {
    pub fn new(fs: Arc<UnionFs>) -> Self {
        Self {
            fs,
            inodes: InodeManager::new(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn cred(req: &Request<'_>) -> Cred {
        Cred::new(req.uid(), req.gid())
    }

    fn path_of(&self, ino: u64) -> Result<String, i32> {
        self.inodes.get_path(ino).ok_or(libc::ENOENT)
    }

    fn reply_new_entry(&self, path: &str, reply: ReplyEntry) {
        match self.attr_of(path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }
}

impl Filesystem for UnionFsFuse {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent == ROOT_INO && name == CTL_FILE {
            reply.entry(&TTL, &self.ctl_file_attr(CTL_INO), 0);
            return;
        }
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        self.reply_new_entry(&path, reply);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == CTL_INO {
            reply.attr(&TTL, &self.ctl_file_attr(CTL_INO));
            return;
        }
        let res = self.path_of(ino).and_then(|path| self.attr_of(&path));
        match res {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if ino == CTL_INO {
            reply.attr(&TTL, &self.ctl_file_attr(CTL_INO));
            return;
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let attr = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(resolve_time),
            mtime: mtime.map(resolve_time),
        };
        match self.fs.setattr(&path, &attr) {
            Ok(meta) => reply.attr(&TTL, &self.make_attr(ino, &meta)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let res = self
            .path_of(ino)
            .and_then(|path| self.fs.readlink(&path).map_err(|e| errno_of(&e)));
        match res {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let mode = mode & !(umask & 0o777);
        match self.fs.mknod(&path, mode, rdev as u64, &Self::cred(req)) {
            Ok(_) => self.reply_new_entry(&path, reply),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.mkdir(&path, mode & !umask, &Self::cred(req)) {
            Ok(_) => self.reply_new_entry(&path, reply),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.forget_tree(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, link_name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.symlink(&path, target, &Self::cred(req)) {
            Ok(_) => self.reply_new_entry(&path, reply),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let paths = self
            .child_path(parent, name)
            .and_then(|src| Ok((src, self.child_path(newparent, newname)?)));
        let (src, dst) = match paths {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.rename(&src, &dst) {
            Ok(()) => {
                self.inodes.rename(&src, &dst);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let paths = self
            .path_of(ino)
            .and_then(|src| Ok((src, self.child_path(newparent, newname)?)));
        let (src, dst) = match paths {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.link(&src, &dst) {
            Ok(_) => self.reply_new_entry(&dst, reply),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        if ino == CTL_INO {
            reply.opened(0, 0);
            return;
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        // writers get their copy-up before the first write
        let res = if flags & libc::O_ACCMODE != libc::O_RDONLY {
            self.fs.open_for_write(&path).map(|_| ())
        } else {
            self.fs.getattr(&path).map(|_| ())
        };
        match res {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        if ino == CTL_INO {
            let data = self.ctl_contents();
            let start = (offset.max(0) as usize).min(data.len());
            let end = (start + size as usize).min(data.len());
            reply.data(&data[start..end]);
            return;
        }
        let res = self.path_of(ino).and_then(|path| {
            self.fs
                .read(&path, offset.max(0) as u64, size as usize)
                .map_err(|e| errno_of(&e))
        });
        match res {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if ino == CTL_INO {
            self.handle_ctl_write(data, reply);
            return;
        }
        let res = self.path_of(ino).and_then(|path| {
            self.fs
                .write(&path, offset.max(0) as u64, data)
                .map_err(|e| errno_of(&e))
        });
        match res {
            Ok(n) => reply.written(n as u32),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let listing = match self.fs.readdir(&path) {
            Ok(l) => l,
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        if ino == ROOT_INO {
            entries.push((CTL_INO, FileType::RegularFile, CTL_FILE.to_string()));
        }
        for entry in listing {
            let child = crate::dentry::join_path(&path, &entry.name);
            let child_ino = self.inodes.get_or_create(&child);
            entries.push((child_ino, file_type(entry.kind), entry.name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let res = self
            .fs
            .create(&path, mode & !umask, &Self::cred(req))
            .map_err(|e| errno_of(&e))
            .and_then(|_| self.attr_of(&path));
        match res {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        if ino == CTL_INO {
            reply.ok();
            return;
        }
        let res = self.path_of(ino).and_then(|path| {
            self.fs
                .permission(&path, mask as u32, &Self::cred(req))
                .map_err(|e| errno_of(&e))
        });
        match res {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }
}
