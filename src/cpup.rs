use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Arc;

use crate::branch::BIndex;
use crate::dentry::{Dentry, RealEntry, RealKind};
use crate::error::{Result, UnionError};
use crate::lock::{HiLockRegistry, LockSubclass};
use crate::pin::{Pin, PinFlags};
use crate::sb::SbInfo;
use crate::vfsub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Into a higher-priority branch than the ancestor's top.
    Up,
    /// Into a lower-priority branch.
    Down,
}

/// Copy ownership and permission bits of `src` onto the new `dst`.
fn cpup_attr(src: &RealEntry, dst: &std::path::Path) -> Result<()> {
    let meta = fs::symlink_metadata(&src.path)?;
    if src.kind != RealKind::Symlink {
        fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    }
    if nix::unistd::geteuid().is_root() {
        std::os::unix::fs::lchown(dst, Some(meta.uid()), Some(meta.gid()))?;
    }
    Ok(())
}

/// Create every directory between `dentry`'s parent and the deepest ancestor
/// that already exists in `bdst`, top-down.
///
/// A no-op when the parent is already there. The direction follows the
/// entry's own top branch; each missing ancestor is copied from its own top,
/// so an ancestor whose range has a gap at `bdst` is filled from wherever it
/// lives. Each ancestor's range is widened as soon as its directory exists,
/// so a failure part way leaves a usable prefix that a retry resumes from.
pub fn materialize_ancestors(
    registry: &Arc<HiLockRegistry>,
    si: &SbInfo,
    dentry: &Arc<Dentry>,
    bdst: BIndex,
) -> Result<()> {
    let Some(parent) = dentry.parent() else {
        return Ok(());
    };
    if parent.info.read_recursive().h(bdst).is_some() {
        return Ok(());
    }
    let btop = dentry.info.read_recursive().btop;
    assert_ne!(
        btop, bdst,
        "copy-up of {} into its own top branch {} with the parent missing",
        dentry.path, bdst
    );
    let direction = if btop > bdst {
        Direction::Up
    } else {
        Direction::Down
    };

    let mut missing = Vec::new();
    let mut cur = parent;
    loop {
        {
            let info = cur.info.read_recursive();
            if info.h(bdst).is_some() {
                break;
            }
            if !info.is_dir() {
                return Err(UnionError::Stale(format!("{} is not a directory", cur.path)));
            }
        }
        let next = cur
            .parent()
            .ok_or_else(|| UnionError::Stale(format!("{} lost its parent", cur.path)))?;
        missing.push(cur);
        cur = next;
    }

    log::debug!(
        "copy {:?} {} ancestors of {} into branch {}",
        direction,
        missing.len(),
        dentry.path,
        bdst
    );
    for dir in missing.iter().rev() {
        cpup_dir(registry, si, dir, bdst)?;
    }
    Ok(())
}

/// Make `dir` exist in `bdst`. Its parent must already be there.
fn cpup_dir(
    registry: &Arc<HiLockRegistry>,
    si: &SbInfo,
    dir: &Arc<Dentry>,
    bdst: BIndex,
) -> Result<()> {
    let src = {
        let info = dir.info.read_recursive();
        info.h(info.btop)
            .cloned()
            .ok_or_else(|| UnionError::Stale(format!("{} has no real directory", dir.path)))?
    };

    let h = {
        let pin = Pin::acquire(registry, si, dir, bdst, LockSubclass::IParent2, PinFlags::write())?;
        let path = pin.h_path();
        match vfsub::mkdir_at(&path, src.mode) {
            Ok(()) => cpup_attr(&src, &path)?,
            // an earlier, interrupted copy-up left it behind
            Err(UnionError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
        let h = RealEntry::probe(path)?
            .ok_or_else(|| UnionError::Stale(format!("{} vanished", dir.path)))?;
        if !h.kind.is_dir() {
            return Err(UnionError::NotADirectory(h.path.display().to_string()));
        }
        h
    };

    // widen only once the real parent is unlocked
    let mut info = dir.info.write();
    info.widen(bdst, h);
    dir.refresh_inode(&info);
    Ok(())
}

/// Copy `dentry` from its top branch into `bdst`, whose parent directory must
/// already exist. Contents, mode and owner are kept; a directory is created
/// empty.
pub fn cpup_single(
    registry: &Arc<HiLockRegistry>,
    si: &SbInfo,
    dentry: &Arc<Dentry>,
    bdst: BIndex,
) -> Result<()> {
    let src = {
        let info = dentry.info.read_recursive();
        if info.h(bdst).is_some() {
            return Ok(());
        }
        info.h(info.btop)
            .cloned()
            .ok_or_else(|| UnionError::NotFound(dentry.path.clone()))?
    };
    if src.kind.is_dir() {
        return cpup_dir(registry, si, dentry, bdst);
    }

    let h = {
        let pin = Pin::acquire(registry, si, dentry, bdst, LockSubclass::IParent, PinFlags::write())?;
        let path = pin.h_path();
        copy_object(&src, &path)?;
        RealEntry::probe(path)?
            .ok_or_else(|| UnionError::Stale(format!("{} vanished", dentry.path)))?
    };
    log::debug!("copied up {} to branch {}", dentry.path, bdst);

    let mut info = dentry.info.write();
    info.widen(bdst, h);
    dentry.refresh_inode(&info);
    Ok(())
}

/// Duplicate one real non-directory at `dst`.
pub(crate) fn copy_object(src: &RealEntry, dst: &std::path::Path) -> Result<()> {
    match src.kind {
        RealKind::File => {
            fs::copy(&src.path, dst)?;
        }
        RealKind::Symlink => {
            let target = fs::read_link(&src.path)?;
            std::os::unix::fs::symlink(target, dst)?;
        }
        RealKind::Special => {
            let meta = fs::symlink_metadata(&src.path)?;
            vfsub::mknod_at(dst, meta.mode(), meta.rdev())?;
        }
        RealKind::Dir => return Err(UnionError::IsADirectory(src.path.display().to_string())),
    }
    cpup_attr(src, dst)
}
