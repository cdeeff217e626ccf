use std::collections::HashSet;
use std::fs::{self, File, FileTimes, Metadata};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::branch::{BIndex, BranchPerm, BranchTable};
use crate::config::{BranchSpec, MountConfig};
use crate::cpup;
use crate::dentry::{components, parent_and_name, Dentry, DentryCache, DentryInfo, RealEntry, RealKind};
use crate::error::{Result, UnionError};
use crate::lock::{HiLockRegistry, LockSubclass};
use crate::lookup;
use crate::permission::{self, Cred};
use crate::pin::{Pin, PinFlags, PinPair};
use crate::policy::{CopyupPolicy, CreatePolicy, WbrState};
use crate::vfsub;
use crate::whiteout;
use crate::wkq::Wkq;
use crate::wr_dir::{resolve_write_dir, WrDirFlags};

/// Name given to the transient entry behind an unnamed temporary file.
const TMPFILE_NAME: &str = ".unionfs.tmpfile";

/// Filesystem-wide state, guarded by the union's superblock lock.
#[derive(Debug)]
pub struct SbInfo {
    pub table: BranchTable,
    /// Bumped on every branch change; cached linkage from an older
    /// generation is rebuilt before use.
    pub gen: u64,
    pub create: CreatePolicy,
    pub copyup: CopyupPolicy,
}

/// Snapshot of one branch for the control interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub index: BIndex,
    pub id: u64,
    pub path: PathBuf,
    pub perm: BranchPerm,
    pub nfs: bool,
    pub writers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: RealKind,
}

/// Attribute changes applied by [`UnionFs::setattr`].
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

pub struct UnionFs {
    si: RwLock<SbInfo>,
    dcache: DentryCache,
    hi_locks: Arc<HiLockRegistry>,
    wbr: WbrState,
    wkq: Wkq,
    force_wkq_unlink: bool,
}

impl UnionFs {
    pub fn new(config: &MountConfig) -> Result<Self> {
        config.validate()?;
        let mut table = BranchTable::new();
        for spec in &config.branches {
            table.insert(table.len(), &spec.path, spec.perm)?;
        }
        let fs = Self {
            si: RwLock::new(SbInfo {
                table,
                gen: 1,
                create: config.create,
                copyup: config.copyup,
            }),
            dcache: DentryCache::new(),
            hi_locks: Arc::new(HiLockRegistry::new()),
            wbr: WbrState::new(),
            wkq: Wkq::new(config.wkq_workers)?,
            force_wkq_unlink: config.force_wkq_unlink,
        };
        {
            let si = fs.si.read();
            fs.root(&si)?;
            log::info!(
                "union of {} branches (create={}, copyup={})",
                si.table.len(),
                si.create,
                si.copyup
            );
        }
        Ok(fs)
    }

    /// Union with default policies over `branches`, top first.
    pub fn with_branches(branches: Vec<BranchSpec>) -> Result<Self> {
        Self::new(&MountConfig::new(PathBuf::new(), branches))
    }

    /// Shared superblock lock. Every operation holds it for its whole run;
    /// branch changes take it exclusively.
    pub fn si(&self) -> RwLockReadGuard<'_, SbInfo> {
        self.si.read()
    }

    pub fn hi_locks(&self) -> &Arc<HiLockRegistry> {
        &self.hi_locks
    }

    pub fn wbr(&self) -> &WbrState {
        &self.wbr
    }

    pub fn generation(&self) -> u64 {
        self.si.read().gen
    }

    // ---- lookup ----

    fn root(&self, si: &SbInfo) -> Result<Arc<Dentry>> {
        if let Some(root) = self.dcache.get("/") {
            if root.info.read_recursive().gen != si.gen {
                let mut info = root.info.write();
                if info.gen != si.gen {
                    *info = lookup::root_info(&si.table, si.gen)?;
                    root.refresh_inode(&info);
                }
            }
            return Ok(root);
        }
        let info = lookup::root_info(&si.table, si.gen)?;
        let root = Arc::new(Dentry::new("", "/".to_string(), Weak::new(), info));
        Ok(self.dcache.insert_or_get(root))
    }

    fn lookup_child(&self, si: &SbInfo, parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
        if whiteout::is_wh_name(name) {
            return Err(UnionError::NotFound(parent.child_path(name)));
        }
        let path = parent.child_path(name);
        if let Some(d) = self.dcache.get(&path) {
            let same_parent = d.parent().map_or(false, |p| Arc::ptr_eq(&p, parent));
            if same_parent {
                if d.info.read_recursive().gen == si.gen {
                    return Ok(d);
                }
                let pinfo = parent.info.read_recursive().clone();
                let fresh = lookup::lookup_branches(&si.table, &pinfo, name, si.gen)?;
                let mut info = d.info.write();
                if info.gen != si.gen {
                    *info = fresh;
                    d.refresh_inode(&info);
                }
                drop(info);
                return Ok(d);
            }
            self.dcache.remove_tree(&path);
        }

        let pinfo = parent.info.read_recursive().clone();
        let info = lookup::lookup_branches(&si.table, &pinfo, name, si.gen)?;
        let d = Arc::new(Dentry::new(name, path, Arc::downgrade(parent), info));
        Ok(self.dcache.insert_or_get(d))
    }

    /// Resolve `path` to its dentry under an already held superblock lock.
    /// The final entry may be negative.
    pub fn lookup_at(&self, si: &SbInfo, path: &str) -> Result<Arc<Dentry>> {
        let mut cur = self.root(si)?;
        for name in components(path)? {
            {
                let info = cur.info.read_recursive();
                if !info.is_positive() {
                    return Err(UnionError::NotFound(cur.path.clone()));
                }
                if !info.is_dir() {
                    return Err(UnionError::NotADirectory(cur.path.clone()));
                }
            }
            cur = self.lookup_child(si, &cur, name)?;
        }
        Ok(cur)
    }

    pub fn lookup(&self, path: &str) -> Result<Arc<Dentry>> {
        let si = self.si.read();
        self.lookup_at(&si, path)
    }

    fn lookup_positive(&self, si: &SbInfo, path: &str) -> Result<Arc<Dentry>> {
        let d = self.lookup_at(si, path)?;
        if !d.info.read_recursive().is_positive() {
            return Err(UnionError::NotFound(path.to_string()));
        }
        Ok(d)
    }

    fn lookup_dir(&self, si: &SbInfo, path: &str) -> Result<Arc<Dentry>> {
        let d = self.lookup_positive(si, path)?;
        if !d.info.read_recursive().is_dir() {
            return Err(UnionError::NotADirectory(path.to_string()));
        }
        Ok(d)
    }

    /// Drop cached linkage around `path` after a stale result so the next
    /// call looks it up again.
    fn settle<T>(&self, path: &str, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.is_stale() {
                let dir = parent_and_name(path)
                    .map(|(parent, _)| parent)
                    .unwrap_or_else(|_| "/".to_string());
                log::debug!("{}: {}; invalidating {}", path, e, dir);
                self.dcache.remove_tree(&dir);
            }
        }
        res
    }

    // ---- linkage updates, only with no pin held ----

    fn link_created(&self, dentry: &Dentry, bindex: BIndex, h: RealEntry, opaque: bool) {
        let mut info = dentry.info.write();
        info.make_negative(bindex);
        info.bwh = None;
        info.widen(bindex, h);
        info.bstop = opaque.then_some(bindex);
        dentry.refresh_inode(&info);
    }

    fn mark_removed(&self, dentry: &Dentry, parent_btop: BIndex, wh: Option<BIndex>) {
        let mut info = dentry.info.write();
        info.make_negative(parent_btop);
        info.bwh = wh;
        dentry.refresh_inode(&info);
    }

    fn parent_btop(dentry: &Dentry) -> BIndex {
        dentry
            .parent()
            .map(|p| p.info.read_recursive().btop)
            .unwrap_or(0)
    }

    fn exists_below(dentry: &Dentry, bindex: BIndex) -> bool {
        dentry.parent().map_or(false, |p| {
            lookup::exists_below(&p.info.read_recursive(), &dentry.name, bindex)
        })
    }

    // ---- adding names ----

    fn add_entry<F>(&self, path: &str, is_dir: bool, make: F) -> Result<Arc<Dentry>>
    where
        F: FnOnce(&Pin) -> Result<RealEntry>,
    {
        let si = self.si.read();
        let res = self.do_add_entry(&si, path, is_dir, make);
        self.settle(path, res)
    }

    fn do_add_entry<F>(&self, si: &SbInfo, path: &str, is_dir: bool, make: F) -> Result<Arc<Dentry>>
    where
        F: FnOnce(&Pin) -> Result<RealEntry>,
    {
        let (parent_path, name) = parent_and_name(path)?;
        whiteout::check_name(&name)?;
        let parent = self.lookup_dir(si, &parent_path)?;
        let dentry = self.lookup_child(si, &parent, &name)?;
        if dentry.info.read_recursive().is_positive() {
            return Err(UnionError::AlreadyExists(path.to_string()));
        }

        let flags = WrDirFlags {
            add_entry: true,
            is_dir,
            ..Default::default()
        };
        let bindex = resolve_write_dir(&self.hi_locks, si, &self.wbr, &dentry, None, flags)?;

        let (h, opaque) = {
            let pin = Pin::acquire(
                &self.hi_locks,
                si,
                &dentry,
                bindex,
                LockSubclass::IParent,
                PinFlags::write(),
            )?;
            let had_wh = whiteout::is_whiteouted(pin.h_dir_path(), &name);
            let h = make(&pin)?;
            let opaque = is_dir && (had_wh || Self::exists_below(&dentry, bindex));
            if opaque {
                whiteout::make_opaque(&h.path)?;
            }
            if had_wh {
                whiteout::remove_wh(pin.h_dir_path(), &name)?;
            }
            (h, opaque)
        };

        log::debug!("created {} in branch {}", path, bindex);
        self.link_created(&dentry, bindex, h, opaque);
        Ok(dentry)
    }

    pub fn create(&self, path: &str, mode: u32, cred: &Cred) -> Result<Arc<Dentry>> {
        self.add_entry(path, false, |pin| vfsub::create(pin, mode, cred))
    }

    pub fn mkdir(&self, path: &str, mode: u32, cred: &Cred) -> Result<Arc<Dentry>> {
        self.add_entry(path, true, |pin| vfsub::mkdir(pin, mode, cred))
    }

    pub fn symlink(&self, path: &str, target: &Path, cred: &Cred) -> Result<Arc<Dentry>> {
        self.add_entry(path, false, |pin| vfsub::symlink(pin, target, cred))
    }

    pub fn mknod(&self, path: &str, mode: u32, rdev: u64, cred: &Cred) -> Result<Arc<Dentry>> {
        self.add_entry(path, false, |pin| vfsub::mknod(pin, mode, rdev, cred))
    }

    /// Open an unnamed regular file that would live in `dir_path`.
    pub fn tmpfile(&self, dir_path: &str, mode: u32) -> Result<File> {
        let si = self.si.read();
        let res = (|| {
            let parent = self.lookup_dir(&si, dir_path)?;
            let btop = parent.info.read_recursive().btop;
            let dentry = Arc::new(Dentry::new(
                TMPFILE_NAME,
                parent.child_path(TMPFILE_NAME),
                Arc::downgrade(&parent),
                DentryInfo::negative(si.gen, si.table.len(), btop),
            ));
            let flags = WrDirFlags {
                add_entry: true,
                is_tmpfile: true,
                ..Default::default()
            };
            let bindex = resolve_write_dir(&self.hi_locks, &si, &self.wbr, &dentry, None, flags)?;
            let pin = Pin::acquire(
                &self.hi_locks,
                &si,
                &dentry,
                bindex,
                LockSubclass::IParent,
                PinFlags::write(),
            )?;
            vfsub::tmpfile(&pin, mode)
        })();
        self.settle(&crate::dentry::join_path(dir_path, TMPFILE_NAME), res)
    }

    // ---- removing names ----

    pub fn unlink(&self, path: &str) -> Result<()> {
        let si = self.si.read();
        let res = self.do_unlink(&si, path);
        self.settle(path, res)
    }

    fn do_unlink(&self, si: &SbInfo, path: &str) -> Result<()> {
        let dentry = self.lookup_positive(si, path)?;
        let btop = {
            let info = dentry.info.read_recursive();
            if info.is_dir() {
                return Err(UnionError::IsADirectory(path.to_string()));
            }
            info.btop
        };

        let bindex = resolve_write_dir(
            &self.hi_locks,
            si,
            &self.wbr,
            &dentry,
            None,
            WrDirFlags::default(),
        )?;
        let need_wh = bindex != btop || Self::exists_below(&dentry, bindex);

        {
            let pin = Pin::acquire(
                &self.hi_locks,
                si,
                &dentry,
                bindex,
                LockSubclass::IParent,
                PinFlags::write(),
            )?;
            if dentry.info.read_recursive().h(bindex).is_some() {
                vfsub::unlink(&pin, &self.wkq, self.force_wkq_unlink)?;
            }
            if need_wh {
                whiteout::create_wh(pin.h_dir_path(), &dentry.name)?;
            }
        }

        log::debug!("unlinked {} at branch {} (whiteout: {})", path, bindex, need_wh);
        self.mark_removed(&dentry, Self::parent_btop(&dentry), need_wh.then_some(bindex));
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let si = self.si.read();
        let res = self.do_rmdir(&si, path);
        self.settle(path, res)
    }

    fn do_rmdir(&self, si: &SbInfo, path: &str) -> Result<()> {
        let dentry = self.lookup_positive(si, path)?;
        if dentry.is_root() {
            return Err(UnionError::BranchBusy("cannot remove the root".into()));
        }
        let btop = {
            let info = dentry.info.read_recursive();
            if !info.is_dir() {
                return Err(UnionError::NotADirectory(path.to_string()));
            }
            info.btop
        };
        if !self.readdir_merged(&dentry)?.is_empty() {
            return Err(UnionError::NotEmpty(path.to_string()));
        }

        let bindex = resolve_write_dir(
            &self.hi_locks,
            si,
            &self.wbr,
            &dentry,
            None,
            WrDirFlags {
                is_dir: true,
                ..Default::default()
            },
        )?;
        let need_wh = bindex != btop || Self::exists_below(&dentry, bindex);

        {
            let pin = Pin::acquire(
                &self.hi_locks,
                si,
                &dentry,
                bindex,
                LockSubclass::IParent,
                PinFlags::write(),
            )?;
            let h = dentry.info.read_recursive().h(bindex).cloned();
            if let Some(h) = h {
                let _child = self.hi_locks.lock(h.key, LockSubclass::IChild);
                whiteout::clear_whiteouts(&h.path)?;
                vfsub::rmdir(&pin)?;
            }
            if need_wh {
                whiteout::create_wh(pin.h_dir_path(), &dentry.name)?;
            }
        }

        log::debug!("removed directory {} at branch {}", path, bindex);
        self.mark_removed(&dentry, Self::parent_btop(&dentry), need_wh.then_some(bindex));
        self.dcache.remove_tree(path);
        Ok(())
    }

    // ---- link and rename ----

    pub fn link(&self, src_path: &str, dst_path: &str) -> Result<Arc<Dentry>> {
        let si = self.si.read();
        let res = self.do_link(&si, src_path, dst_path);
        self.settle(dst_path, res)
    }

    fn do_link(&self, si: &SbInfo, src_path: &str, dst_path: &str) -> Result<Arc<Dentry>> {
        let src = self.lookup_positive(si, src_path)?;
        if src.info.read_recursive().is_dir() {
            return Err(UnionError::NotPermitted(format!("hard link to directory {}", src_path)));
        }
        let (_, dst_name) = parent_and_name(dst_path)?;
        whiteout::check_name(&dst_name)?;
        let dst = self.lookup_at(si, dst_path)?;
        if dst.info.read_recursive().is_positive() {
            return Err(UnionError::AlreadyExists(dst_path.to_string()));
        }

        let flags = WrDirFlags {
            add_entry: true,
            ..Default::default()
        };
        let bindex = resolve_write_dir(&self.hi_locks, si, &self.wbr, &dst, Some(&src), flags)?;
        self.copy_up_to(si, &src, bindex)?;

        let h = {
            let pair = PinPair::acquire(&self.hi_locks, si, &src, &dst, bindex)?;
            let had_wh = whiteout::is_whiteouted(pair.dst_dir(), &dst_name);
            let h = if pair.branch().perm().allows_link() {
                vfsub::link(&pair)?
            } else {
                let src_h = RealEntry::probe(pair.src_path())?
                    .ok_or_else(|| UnionError::Stale(format!("{} vanished", src_path)))?;
                let dst_h = pair.dst_path();
                cpup::copy_object(&src_h, &dst_h)?;
                RealEntry::probe(dst_h)?
                    .ok_or_else(|| UnionError::Stale(format!("{} vanished", dst_path)))?
            };
            if had_wh {
                whiteout::remove_wh(pair.dst_dir(), &dst_name)?;
            }
            h
        };

        log::debug!("linked {} to {} in branch {}", src_path, dst_path, bindex);
        self.link_created(&dst, bindex, h, false);
        Ok(dst)
    }

    pub fn rename(&self, src_path: &str, dst_path: &str) -> Result<()> {
        let si = self.si.read();
        let res = self.do_rename(&si, src_path, dst_path);
        let res = self.settle(src_path, res);
        self.settle(dst_path, res)
    }

    fn do_rename(&self, si: &SbInfo, src_path: &str, dst_path: &str) -> Result<()> {
        let src = self.lookup_positive(si, src_path)?;
        if src.is_root() {
            return Err(UnionError::BranchBusy("cannot rename the root".into()));
        }
        if src_path == dst_path {
            return Ok(());
        }
        if dst_path.starts_with(&format!("{}/", src_path)) {
            return Err(UnionError::Invalid(format!(
                "cannot move {} beneath itself",
                src_path
            )));
        }
        let (_, dst_name) = parent_and_name(dst_path)?;
        whiteout::check_name(&dst_name)?;
        let dst = self.lookup_at(si, dst_path)?;

        let src_is_dir = src.info.read_recursive().is_dir();
        let (dst_positive, dst_is_dir) = {
            let info = dst.info.read_recursive();
            (info.is_positive(), info.is_dir())
        };
        if dst_positive {
            if src_is_dir && !dst_is_dir {
                return Err(UnionError::NotADirectory(dst_path.to_string()));
            }
            if !src_is_dir && dst_is_dir {
                return Err(UnionError::IsADirectory(dst_path.to_string()));
            }
            if dst_is_dir && !self.readdir_merged(&dst)?.is_empty() {
                return Err(UnionError::NotEmpty(dst_path.to_string()));
            }
        }

        let flags = WrDirFlags {
            add_entry: true,
            is_dir: src_is_dir,
            ..Default::default()
        };
        let bindex = resolve_write_dir(&self.hi_locks, si, &self.wbr, &dst, Some(&src), flags)?;

        if src_is_dir {
            let (btop, bbot) = {
                let info = src.info.read_recursive();
                (info.btop, info.bbot)
            };
            if btop != bindex || bbot != bindex || Self::exists_below(&src, bindex) {
                return Err(UnionError::CrossDevice(format!(
                    "{} spans several branches",
                    src_path
                )));
            }
        } else {
            self.copy_up_to(si, &src, bindex)?;
        }
        let src_wh = Self::exists_below(&src, bindex);
        let dst_below = Self::exists_below(&dst, bindex);

        let (h, opaque) = {
            let pair = PinPair::acquire(&self.hi_locks, si, &src, &dst, bindex)?;
            let h_dst = dst.info.read_recursive().h(bindex).cloned();
            if let Some(h_dst) = h_dst.filter(|h| h.kind.is_dir()) {
                let _child = self.hi_locks.lock(h_dst.key, LockSubclass::IChild);
                whiteout::clear_whiteouts(&h_dst.path)?;
            }
            let had_wh = whiteout::is_whiteouted(pair.dst_dir(), &dst_name);
            let h = vfsub::rename(&pair)?;
            if had_wh {
                whiteout::remove_wh(pair.dst_dir(), &dst_name)?;
            }
            if src_wh {
                whiteout::create_wh(pair.src_dir(), &src.name)?;
            }
            let opaque = src_is_dir && (had_wh || dst_below);
            if opaque {
                whiteout::make_opaque(&h.path)?;
            }
            (h, opaque)
        };

        log::debug!("renamed {} to {} in branch {}", src_path, dst_path, bindex);
        self.mark_removed(&src, Self::parent_btop(&src), src_wh.then_some(bindex));
        self.link_created(&dst, bindex, h, opaque);
        self.dcache.remove_tree(src_path);
        self.dcache.remove_tree(dst_path);
        Ok(())
    }

    /// Copy `dentry` into `bindex` unless it is already there.
    fn copy_up_to(&self, si: &SbInfo, dentry: &Arc<Dentry>, bindex: BIndex) -> Result<()> {
        if dentry.info.read_recursive().h(bindex).is_some() {
            return Ok(());
        }
        cpup::materialize_ancestors(&self.hi_locks, si, dentry, bindex)?;
        cpup::cpup_single(&self.hi_locks, si, dentry, bindex)
    }

    // ---- data and attributes ----

    /// Make the top copy of `dentry` writable, copying it up when its top
    /// branch is read-only. Returns the branch and the writable object.
    fn copy_up_top(&self, si: &SbInfo, dentry: &Arc<Dentry>) -> Result<(BIndex, RealEntry)> {
        let btop = dentry.info.read_recursive().btop;
        let bindex = if si.table.test_ro(btop) {
            let is_dir = dentry.info.read_recursive().is_dir();
            let flags = WrDirFlags {
                is_dir,
                ..Default::default()
            };
            let bindex = resolve_write_dir(&self.hi_locks, si, &self.wbr, dentry, None, flags)?;
            self.copy_up_to(si, dentry, bindex)?;
            bindex
        } else {
            btop
        };
        let h = dentry
            .info
            .read_recursive()
            .h(bindex)
            .cloned()
            .ok_or_else(|| UnionError::Stale(format!("{} missing in branch {}", dentry.path, bindex)))?;
        Ok((bindex, h))
    }

    /// Ready `path` for writing; the returned object is in a writable branch.
    pub fn open_for_write(&self, path: &str) -> Result<RealEntry> {
        let si = self.si.read();
        let res = (|| {
            let dentry = self.lookup_positive(&si, path)?;
            if dentry.info.read_recursive().is_dir() {
                return Err(UnionError::IsADirectory(path.to_string()));
            }
            self.copy_up_top(&si, &dentry).map(|(_, h)| h)
        })();
        self.settle(path, res)
    }

    pub fn read(&self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        let si = self.si.read();
        let dentry = self.lookup_positive(&si, path)?;
        let h = Self::top(&dentry)?;
        if h.kind.is_dir() {
            return Err(UnionError::IsADirectory(path.to_string()));
        }
        let mut buf = vec![0u8; size];
        let n = vfsub::read_at(&h, &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let si = self.si.read();
        let res = (|| {
            let dentry = self.lookup_positive(&si, path)?;
            if dentry.info.read_recursive().is_dir() {
                return Err(UnionError::IsADirectory(path.to_string()));
            }
            let (bindex, h) = self.copy_up_top(&si, &dentry)?;
            let _lease = si.table.get(bindex)?.want_write()?;
            vfsub::write_at(&h, data, offset)
        })();
        self.settle(path, res)
    }

    pub fn setattr(&self, path: &str, attr: &SetAttr) -> Result<Metadata> {
        let si = self.si.read();
        let res = self.do_setattr(&si, path, attr);
        self.settle(path, res)
    }

    fn do_setattr(&self, si: &SbInfo, path: &str, attr: &SetAttr) -> Result<Metadata> {
        let dentry = self.lookup_positive(si, path)?;
        let (bindex, h) = self.copy_up_top(si, &dentry)?;
        let _lease = si.table.get(bindex)?.want_write()?;

        if let Some(size) = attr.size {
            if h.kind.is_dir() {
                return Err(UnionError::IsADirectory(path.to_string()));
            }
            vfsub::truncate(&h, size)?;
        }
        if let Some(mode) = attr.mode {
            if h.kind != RealKind::Symlink {
                fs::set_permissions(&h.path, fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
        if attr.uid.is_some() || attr.gid.is_some() {
            std::os::unix::fs::lchown(&h.path, attr.uid, attr.gid)?;
        }
        if attr.atime.is_some() || attr.mtime.is_some() {
            if h.kind != RealKind::Symlink {
                let mut times = FileTimes::new();
                if let Some(t) = attr.atime {
                    times = times.set_accessed(t);
                }
                if let Some(t) = attr.mtime {
                    times = times.set_modified(t);
                }
                File::open(&h.path)?.set_times(times)?;
            }
        }

        let refreshed = RealEntry::probe(h.path.clone())?
            .ok_or_else(|| UnionError::Stale(format!("{} vanished", path)))?;
        {
            let mut info = dentry.info.write();
            info.set_h(bindex, Some(refreshed));
            dentry.refresh_inode(&info);
        }
        Ok(fs::symlink_metadata(&h.path)?)
    }

    fn top(dentry: &Dentry) -> Result<RealEntry> {
        let info = dentry.info.read_recursive();
        info.h(info.btop)
            .cloned()
            .ok_or_else(|| UnionError::NotFound(dentry.path.clone()))
    }

    /// Attributes of the topmost real object.
    pub fn getattr(&self, path: &str) -> Result<Metadata> {
        let si = self.si.read();
        let dentry = self.lookup_positive(&si, path)?;
        let h = Self::top(&dentry)?;
        match fs::symlink_metadata(&h.path) {
            Ok(meta) => Ok(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                drop(si);
                self.settle(path, Err(UnionError::Stale(format!("{} vanished", path))))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn readlink(&self, path: &str) -> Result<PathBuf> {
        let si = self.si.read();
        let dentry = self.lookup_positive(&si, path)?;
        let h = Self::top(&dentry)?;
        if h.kind != RealKind::Symlink {
            return Err(UnionError::Invalid(format!("{} is not a symlink", path)));
        }
        Ok(fs::read_link(&h.path)?)
    }

    /// Merged listing: upper names hide lower ones, whiteouts hide names
    /// below them, and an opaque directory hides everything beneath it.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let si = self.si.read();
        let dentry = self.lookup_dir(&si, path)?;
        self.readdir_merged(&dentry)
    }

    fn readdir_merged(&self, dentry: &Dentry) -> Result<Vec<DirEntry>> {
        let info = dentry.info.read_recursive().clone();
        let mut seen = HashSet::new();
        let mut hidden = HashSet::new();
        let mut out = Vec::new();

        for bindex in info.btop..=info.bstop.unwrap_or(info.bbot) {
            let Some(h) = info.h(bindex) else {
                continue;
            };
            let mut whiteouts = Vec::new();
            for entry in fs::read_dir(&h.path)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == whiteout::WH_OPQ {
                    continue;
                }
                if let Some(hidden_name) = name.strip_prefix(whiteout::WH_PREFIX) {
                    whiteouts.push(hidden_name.to_string());
                    continue;
                }
                if hidden.contains(&name) || !seen.insert(name.clone()) {
                    continue;
                }
                let kind = RealKind::from_meta(&entry.metadata()?);
                out.push(DirEntry { name, kind });
            }
            hidden.extend(whiteouts);
        }
        Ok(out)
    }

    pub fn permission(&self, path: &str, mask: u32, cred: &Cred) -> Result<()> {
        let si = self.si.read();
        let dentry = self.lookup_positive(&si, path)?;
        let inode = dentry
            .inode()
            .ok_or_else(|| UnionError::NotFound(path.to_string()))?;
        let res = permission::permission(&inode, &si.table, mask, cred);
        drop(si);
        self.settle(path, res)
    }

    // ---- branch management ----

    fn bump_generation(&self, si: &mut SbInfo) {
        si.gen += 1;
        self.wbr.reset();
        log::info!("branch table changed, generation {}", si.gen);
    }

    /// Insert a branch at `bindex` (clamped to the bottom).
    pub fn add_branch(&self, bindex: BIndex, path: &Path, perm: BranchPerm) -> Result<BIndex> {
        let mut si = self.si.write();
        let bindex = si.table.insert(bindex, path, perm)?;
        self.bump_generation(&mut si);
        Ok(bindex)
    }

    /// Remove the branch rooted at `path`. Fails with `BranchBusy` while it
    /// has writers.
    pub fn del_branch(&self, path: &Path) -> Result<()> {
        let mut si = self.si.write();
        let bindex = si
            .table
            .index_of_path(path)
            .ok_or_else(|| UnionError::InvalidBranch(format!("{} is not a branch", path.display())))?;
        si.table.remove(bindex)?;
        self.bump_generation(&mut si);
        Ok(())
    }

    pub fn set_branch_perm(&self, path: &Path, perm: BranchPerm) -> Result<()> {
        let mut si = self.si.write();
        let bindex = si
            .table
            .index_of_path(path)
            .ok_or_else(|| UnionError::InvalidBranch(format!("{} is not a branch", path.display())))?;
        let branch = Arc::clone(si.table.get(bindex)?);
        if branch.is_writable() && !perm.is_writable() && branch.writers() > 0 {
            return Err(UnionError::BranchBusy(format!(
                "{} has {} writers",
                path.display(),
                branch.writers()
            )));
        }
        log::info!("branch {} is now {}", path.display(), perm);
        branch.set_perm(perm);
        self.bump_generation(&mut si);
        Ok(())
    }

    pub fn set_policies(&self, create: Option<CreatePolicy>, copyup: Option<CopyupPolicy>) {
        let mut si = self.si.write();
        if let Some(create) = create {
            si.create = create;
        }
        if let Some(copyup) = copyup {
            si.copyup = copyup;
        }
        self.wbr.reset();
    }

    pub fn branches(&self) -> Vec<BranchInfo> {
        let si = self.si.read();
        si.table
            .iter()
            .map(|(index, b)| BranchInfo {
                index,
                id: b.id,
                path: b.path.clone(),
                perm: b.perm(),
                nfs: b.nfs,
                writers: b.writers(),
            })
            .collect()
    }
}

impl std::fmt::Debug for UnionFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let si = self.si.read();
        f.debug_struct("UnionFs")
            .field("branches", &si.table.len())
            .field("gen", &si.gen)
            .field("cached", &self.dcache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_branches() -> (tempfile::TempDir, tempfile::TempDir, UnionFs) {
        let upper = tempfile::tempdir().unwrap();
        let lower = tempfile::tempdir().unwrap();
        let fs = UnionFs::with_branches(vec![
            BranchSpec::new(upper.path(), BranchPerm::Rw),
            BranchSpec::new(lower.path(), BranchPerm::Ro),
        ])
        .unwrap();
        (upper, lower, fs)
    }

    #[test]
    fn upper_names_shadow_lower_ones() {
        let (upper, lower, fs) = two_branches();
        std::fs::write(upper.path().join("a"), b"upper").unwrap();
        std::fs::write(lower.path().join("a"), b"lower").unwrap();
        std::fs::write(lower.path().join("b"), b"lower").unwrap();

        assert_eq!(fs.read("/a", 0, 16).unwrap(), b"upper");
        let mut names: Vec<_> = fs.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn whiteout_names_are_invisible() {
        let (upper, lower, fs) = two_branches();
        std::fs::write(lower.path().join("gone"), b"x").unwrap();
        std::fs::write(upper.path().join(".wh.gone"), b"").unwrap();

        assert!(matches!(fs.lookup("/.wh.gone"), Err(UnionError::NotFound(_))));
        assert!(!fs.lookup("/gone").unwrap().info.read().is_positive());
        assert!(fs.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn writing_a_lower_file_copies_it_up() {
        let (upper, lower, fs) = two_branches();
        std::fs::write(lower.path().join("f"), b"hello").unwrap();

        fs.write("/f", 5, b" world").unwrap();
        assert_eq!(std::fs::read(upper.path().join("f")).unwrap(), b"hello world");
        assert_eq!(std::fs::read(lower.path().join("f")).unwrap(), b"hello");
        assert_eq!(fs.lookup("/f").unwrap().info.read().btop, 0);
    }

    #[test]
    fn setattr_changes_mode_of_the_upper_copy() {
        let (upper, lower, fs) = two_branches();
        std::fs::write(lower.path().join("f"), b"x").unwrap();
        let attr = SetAttr {
            mode: Some(0o600),
            size: Some(0),
            ..Default::default()
        };
        let meta = fs.setattr("/f", &attr).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(meta.len(), 0);
        assert_eq!(std::fs::read(lower.path().join("f")).unwrap(), b"x");
        assert!(upper.path().join("f").exists());
    }

    #[test]
    fn branch_listing_reports_permissions() {
        let (_upper, _lower, fs) = two_branches();
        let branches = fs.branches();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].perm, BranchPerm::Rw);
        assert_eq!(branches[1].perm, BranchPerm::Ro);
        assert_eq!(branches[1].index, 1);
    }
}
