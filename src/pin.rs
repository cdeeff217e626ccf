//! Pinning the real parent directory a mutation will act on.
//!
//! A pin holds, in acquisition order: a shared lock on the logical parent's
//! info, a write-lease on the branch mount, and the exclusive lock on the real
//! parent directory. Everything is released in reverse order when the pin is
//! dropped, on success and error paths alike.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::RawRwLock;

use crate::branch::{BIndex, Branch, MntWrite};
use crate::dentry::{Dentry, DentryInfo, RealEntry};
use crate::error::{Result, UnionError};
use crate::lock::{
    canonical_order, enter_di_parent, DiMark, HiGuard, HiLockRegistry, LockSubclass,
};
use crate::sb::SbInfo;

#[derive(Debug, Clone, Copy, Default)]
pub struct PinFlags {
    /// The caller already holds the logical parent's info lock.
    pub di_locked: bool,
    /// Take a write-lease on the branch mount.
    pub mnt_write: bool,
}

impl PinFlags {
    pub fn write() -> Self {
        Self {
            di_locked: false,
            mnt_write: true,
        }
    }
}

type DiReadGuard = ArcRwLockReadGuard<RawRwLock, DentryInfo>;

/// Held logical parent: the shared lock plus its ordering token.
struct DiHold {
    guard: DiReadGuard,
    _mark: DiMark,
}

fn hold_di(parent: &Dentry) -> DiHold {
    let guard = parent.info.read_arc_recursive();
    DiHold {
        guard,
        _mark: enter_di_parent(),
    }
}

/// A pinned real parent. Released on drop.
pub struct Pin {
    hdir: Option<HiGuard>,
    mnt: Option<MntWrite>,
    di: Option<DiHold>,
    h_parent: Option<RealEntry>,
    parent: Option<Arc<Dentry>>,
    dentry: Arc<Dentry>,
    branch: Arc<Branch>,
    bindex: BIndex,
}

impl Pin {
    /// Pin `dentry`'s real parent in branch `bindex`.
    ///
    /// Fails with `Stale` when the parent has no real directory in that
    /// branch, or when the real parent or target changed before the lock was
    /// taken. Nothing stays held on failure.
    pub fn acquire(
        registry: &Arc<HiLockRegistry>,
        si: &SbInfo,
        dentry: &Arc<Dentry>,
        bindex: BIndex,
        lsc: LockSubclass,
        flags: PinFlags,
    ) -> Result<Pin> {
        let branch = Arc::clone(si.table.get(bindex)?);
        let mut pin = Pin {
            hdir: None,
            mnt: None,
            di: None,
            h_parent: None,
            parent: None,
            dentry: Arc::clone(dentry),
            branch,
            bindex,
        };

        if dentry.is_root() {
            if flags.mnt_write {
                pin.mnt = Some(pin.branch.want_write()?);
            }
            return Ok(pin);
        }

        let parent = dentry
            .parent()
            .ok_or_else(|| UnionError::Stale(format!("{} lost its parent", dentry.path)))?;
        if !flags.di_locked {
            pin.di = Some(hold_di(&parent));
        }
        let h_parent = {
            let pinfo = parent.info.read_recursive();
            if pinfo.gen != si.gen {
                return Err(UnionError::Stale(format!(
                    "{} predates generation {}",
                    parent.path, si.gen
                )));
            }
            pinfo.h(bindex).cloned()
        };
        let h_parent = h_parent.ok_or_else(|| {
            UnionError::Stale(format!("{} has no directory in branch {}", parent.path, bindex))
        })?;
        pin.parent = Some(parent);

        if flags.mnt_write {
            pin.mnt = Some(pin.branch.want_write()?);
        }

        pin.hdir = Some(registry.lock(h_parent.key, lsc));
        pin.h_parent = Some(h_parent);
        pin.verify()?;
        Ok(pin)
    }

    fn verify(&self) -> Result<()> {
        if let Some(h_parent) = &self.h_parent {
            if !h_parent.still_linked() {
                log::debug!("pin: {} moved under us", h_parent.path.display());
                return Err(UnionError::Stale(format!(
                    "{} is no longer linked",
                    h_parent.path.display()
                )));
            }
        }
        let h = self.dentry.info.read_recursive().h(self.bindex).cloned();
        if let Some(h) = h {
            let parent_ok = self
                .h_parent
                .as_ref()
                .map(|p| h.path.parent() == Some(p.path.as_path()))
                .unwrap_or(true);
            if !parent_ok || !h.still_linked() {
                return Err(UnionError::Stale(format!(
                    "{} is no longer linked",
                    h.path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn bindex(&self) -> BIndex {
        self.bindex
    }

    pub fn branch(&self) -> &Arc<Branch> {
        &self.branch
    }

    /// Real parent directory; the branch root when pinning the root.
    pub fn h_dir_path(&self) -> &Path {
        match &self.h_parent {
            Some(h) => &h.path,
            None => &self.branch.path,
        }
    }

    /// Real path of the pinned entry's name inside the pinned parent.
    pub fn h_path(&self) -> PathBuf {
        self.h_dir_path().join(&self.dentry.name)
    }

    pub fn is_locked(&self) -> bool {
        self.hdir.is_some()
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.hdir.take();
        self.mnt.take();
        self.di.take();
        self.parent.take();
    }
}

impl std::fmt::Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pin")
            .field("path", &self.dentry.path)
            .field("bindex", &self.bindex)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Release a pin. Dropping it is equivalent.
pub fn pin_release(pin: Pin) {
    drop(pin);
}

/// Two pins in one branch, for rename and link.
///
/// Both logical parents are read-locked first, then the two real parents in
/// `canonical_order`, the first as `IParent` and the second as `IParent2`.
/// When both names share a real parent it is locked once.
pub struct PinPair {
    first: Option<HiGuard>,
    second: Option<HiGuard>,
    mnt: Option<MntWrite>,
    di: Vec<DiHold>,
    src_dir: RealEntry,
    dst_dir: RealEntry,
    src: Arc<Dentry>,
    dst: Arc<Dentry>,
    bindex: BIndex,
    branch: Arc<Branch>,
}

impl PinPair {
    pub fn acquire(
        registry: &Arc<HiLockRegistry>,
        si: &SbInfo,
        src: &Arc<Dentry>,
        dst: &Arc<Dentry>,
        bindex: BIndex,
    ) -> Result<PinPair> {
        let branch = Arc::clone(si.table.get(bindex)?);
        let src_parent = src
            .parent()
            .ok_or_else(|| UnionError::Stale(format!("{} lost its parent", src.path)))?;
        let dst_parent = dst
            .parent()
            .ok_or_else(|| UnionError::Stale(format!("{} lost its parent", dst.path)))?;

        let mut di = vec![hold_di(&src_parent)];
        if !Arc::ptr_eq(&src_parent, &dst_parent) {
            di.push(hold_di(&dst_parent));
        }
        let h_of = |parent: &Dentry, guard: &DiReadGuard| -> Result<RealEntry> {
            if guard.gen != si.gen {
                return Err(UnionError::Stale(format!(
                    "{} predates generation {}",
                    parent.path, si.gen
                )));
            }
            guard.h(bindex).cloned().ok_or_else(|| {
                UnionError::Stale(format!("{} has no directory in branch {}", parent.path, bindex))
            })
        };
        let src_dir = h_of(&src_parent, &di[0].guard)?;
        let dst_dir = h_of(&dst_parent, &di[di.len() - 1].guard)?;

        let mut pair = PinPair {
            first: None,
            second: None,
            mnt: None,
            di,
            src_dir,
            dst_dir,
            src: Arc::clone(src),
            dst: Arc::clone(dst),
            bindex,
            branch,
        };
        pair.mnt = Some(pair.branch.want_write()?);

        let (k1, k2) = canonical_order(pair.src_dir.key, pair.dst_dir.key);
        pair.first = Some(registry.lock(k1, LockSubclass::IParent));
        if k2 != k1 {
            pair.second = Some(registry.lock(k2, LockSubclass::IParent2));
        }

        for dir in [&pair.src_dir, &pair.dst_dir] {
            if !dir.still_linked() {
                return Err(UnionError::Stale(format!(
                    "{} is no longer linked",
                    dir.path.display()
                )));
            }
        }
        for d in [&pair.src, &pair.dst] {
            if let Some(h) = d.info.read_recursive().h(bindex) {
                if !h.still_linked() {
                    return Err(UnionError::Stale(format!(
                        "{} is no longer linked",
                        h.path.display()
                    )));
                }
            }
        }
        Ok(pair)
    }

    pub fn bindex(&self) -> BIndex {
        self.bindex
    }

    pub fn branch(&self) -> &Arc<Branch> {
        &self.branch
    }

    pub fn src_dir(&self) -> &Path {
        &self.src_dir.path
    }

    pub fn dst_dir(&self) -> &Path {
        &self.dst_dir.path
    }

    pub fn src_path(&self) -> PathBuf {
        self.src_dir.path.join(&self.src.name)
    }

    pub fn dst_path(&self) -> PathBuf {
        self.dst_dir.path.join(&self.dst.name)
    }
}

impl Drop for PinPair {
    fn drop(&mut self) {
        self.second.take();
        self.first.take();
        self.mnt.take();
        while self.di.pop().is_some() {}
    }
}
