use std::os::unix::fs::MetadataExt;

use nix::sys::statvfs::{statvfs, FsFlags};
use nix::unistd::{getegid, geteuid, getgroups};

use crate::branch::{Branch, BranchTable};
use crate::dentry::{RealEntry, RealKind};
use crate::error::{Result, UnionError};
use crate::iinfo::LogicalInode;

pub const MAY_EXEC: u32 = 0x1;
pub const MAY_WRITE: u32 = 0x2;
pub const MAY_READ: u32 = 0x4;
pub const MAY_APPEND: u32 = 0x8;

/// Identity a request acts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Cred {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(0, 0)
    }

    /// The process's own effective identity.
    pub fn current() -> Self {
        Self {
            uid: geteuid().as_raw(),
            gid: getegid().as_raw(),
            groups: getgroups()
                .map(|gs| gs.into_iter().map(|g| g.as_raw()).collect())
                .unwrap_or_default(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Mode-bit check against the owner, group and other classes.
pub fn generic_permission(
    mode: u32,
    uid: u32,
    gid: u32,
    is_dir: bool,
    mask: u32,
    cred: &Cred,
) -> Result<()> {
    let mask = mask & (MAY_READ | MAY_WRITE | MAY_EXEC | MAY_APPEND);
    let want = (if mask & MAY_READ != 0 { 4 } else { 0 })
        | (if mask & (MAY_WRITE | MAY_APPEND) != 0 { 2 } else { 0 })
        | (if mask & MAY_EXEC != 0 { 1 } else { 0 });

    if cred.is_root() {
        // root needs some exec bit to execute a non-directory
        if mask & MAY_EXEC == 0 || is_dir || mode & 0o111 != 0 {
            return Ok(());
        }
        return Err(UnionError::Access("no exec bit set".into()));
    }

    let class = if cred.uid == uid {
        (mode >> 6) & 0o7
    } else if cred.in_group(gid) {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };
    if class & want == want {
        Ok(())
    } else {
        Err(UnionError::Access(format!(
            "mode {:o} denies {:o} to uid {}",
            mode & 0o7777,
            want,
            cred.uid
        )))
    }
}

fn mounted_noexec(branch: &Branch) -> bool {
    statvfs(&branch.path)
        .map(|st| st.flags().contains(FsFlags::ST_NOEXEC))
        .unwrap_or(false)
}

/// Check `mask` against one real object.
pub fn h_permission(h: &RealEntry, branch: &Branch, mask: u32, cred: &Cred) -> Result<()> {
    let meta = std::fs::symlink_metadata(&h.path)
        .map_err(|e| UnionError::Stale(format!("{}: {}", h.path.display(), e)))?;
    if meta.ino() != h.key.ino || meta.dev() != h.key.dev {
        return Err(UnionError::Stale(format!("{} was replaced", h.path.display())));
    }

    if mask & MAY_EXEC != 0
        && h.kind == RealKind::File
        && (meta.mode() & 0o111 == 0 || mounted_noexec(branch))
    {
        return Err(UnionError::Access(format!(
            "{} is not executable",
            h.path.display()
        )));
    }
    generic_permission(
        meta.mode(),
        meta.uid(),
        meta.gid(),
        h.kind.is_dir(),
        mask,
        cred,
    )
}

/// Access check for a logical inode.
///
/// A non-directory, or a directory being written, is judged by its top branch
/// alone; a write additionally needs a writable branch at or above it. Reading
/// or searching a directory must pass on every branch it exists in.
pub fn permission(
    inode: &LogicalInode,
    table: &BranchTable,
    mask: u32,
    cred: &Cred,
) -> Result<()> {
    let info = inode.info();
    let write_mask = mask & (MAY_WRITE | MAY_APPEND) != 0;

    if !inode.is_dir() || write_mask {
        let bindex = info.ibtop;
        let h = info
            .hi(bindex)
            .filter(|h| h.kind == inode.kind())
            .ok_or_else(|| UnionError::Stale(format!("no real inode at branch {}", bindex)))?;
        h_permission(h, table.get(bindex)?, mask, cred)?;
        if write_mask && h.kind != RealKind::Special && table.writable().all(|b| b > bindex) {
            return Err(UnionError::ReadOnly(format!(
                "no writable branch at or above {}",
                bindex
            )));
        }
        return Ok(());
    }

    for bindex in info.ibtop..=info.ibbot {
        let Some(h) = info.hi(bindex) else {
            continue;
        };
        if !h.kind.is_dir() {
            return Err(UnionError::Stale(format!(
                "{} is no longer a directory",
                h.path.display()
            )));
        }
        h_permission(h, table.get(bindex)?, mask, cred)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchPerm;
    use crate::dentry::DentryInfo;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn other() -> Cred {
        Cred::new(4242, 4242)
    }

    fn dir_inode(table: &BranchTable, dirs: &[&std::path::Path]) -> std::sync::Arc<LogicalInode> {
        let mut info = DentryInfo::negative(0, table.len(), 0);
        for (i, d) in dirs.iter().enumerate() {
            if let Some(h) = RealEntry::probe(d.to_path_buf()).unwrap() {
                info.widen(i, h);
            }
        }
        LogicalInode::from_dentry(&info).unwrap()
    }

    fn three_branches() -> (Vec<tempfile::TempDir>, BranchTable) {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let mut table = BranchTable::new();
        for (i, d) in dirs.iter().enumerate() {
            let perm = if i == 0 { BranchPerm::Rw } else { BranchPerm::Ro };
            table.insert(i, d.path(), perm).unwrap();
        }
        (dirs, table)
    }

    #[test]
    fn generic_mode_classes() {
        let c = Cred::new(10, 20);
        assert!(generic_permission(0o600, 10, 0, false, MAY_READ | MAY_WRITE, &c).is_ok());
        assert!(generic_permission(0o060, 0, 20, false, MAY_READ, &c).is_ok());
        assert!(generic_permission(0o604, 0, 0, false, MAY_WRITE, &c).is_err());
        assert!(generic_permission(0o000, 5, 5, false, MAY_READ, &Cred::root()).is_ok());
        assert!(generic_permission(0o644, 5, 5, false, MAY_EXEC, &Cred::root()).is_err());
    }

    #[test]
    fn directory_read_is_conjunctive() {
        let (dirs, table) = three_branches();
        let paths: Vec<_> = dirs.iter().map(|d| d.path().join("d")).collect();
        for p in &paths {
            fs::create_dir(p).unwrap();
            fs::set_permissions(p, fs::Permissions::from_mode(0o755)).unwrap();
        }
        let refs: Vec<_> = paths.iter().map(|p| p.as_path()).collect();
        let inode = dir_inode(&table, &refs);
        assert!(permission(&inode, &table, MAY_READ | MAY_EXEC, &other()).is_ok());

        fs::set_permissions(&paths[1], fs::Permissions::from_mode(0o700)).unwrap();
        let err = permission(&inode, &table, MAY_READ, &other()).unwrap_err();
        assert!(matches!(err, UnionError::Access(_)));
    }

    #[test]
    fn directory_read_checks_across_a_gap() {
        let (dirs, table) = three_branches();
        let top = dirs[0].path().join("d");
        let bottom = dirs[2].path().join("d");
        fs::create_dir(&top).unwrap();
        fs::create_dir(&bottom).unwrap();
        fs::set_permissions(&top, fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(&bottom, fs::Permissions::from_mode(0o700)).unwrap();
        let missing = dirs[1].path().join("d");
        let inode = dir_inode(&table, &[&top, &missing, &bottom]);
        assert_eq!((inode.info().ibtop, inode.info().ibbot), (0, 2));
        assert!(inode.info().hi(1).is_none());
        assert!(permission(&inode, &table, MAY_READ, &other()).is_err());
    }

    #[test]
    fn file_is_judged_by_its_top_branch() {
        let (dirs, table) = three_branches();
        let lower = dirs[2].path().join("f");
        fs::write(&lower, b"x").unwrap();
        fs::set_permissions(&lower, fs::Permissions::from_mode(0o644)).unwrap();
        let absent0 = dirs[0].path().join("f");
        let absent1 = dirs[1].path().join("f");
        let inode = dir_inode(&table, &[&absent0, &absent1, &lower]);
        assert!(permission(&inode, &table, MAY_READ, &other()).is_ok());
        assert!(permission(&inode, &table, MAY_EXEC, &other()).is_err());
    }

    #[test]
    fn write_without_writable_branch_is_erofs() {
        let a = tempfile::tempdir().unwrap();
        let mut table = BranchTable::new();
        table.insert(0, a.path(), BranchPerm::Ro).unwrap();
        let f = a.path().join("f");
        fs::write(&f, b"x").unwrap();
        fs::set_permissions(&f, fs::Permissions::from_mode(0o666)).unwrap();
        let inode = dir_inode(&table, &[&f]);
        let err = permission(&inode, &table, MAY_WRITE, &other()).unwrap_err();
        assert!(matches!(err, UnionError::ReadOnly(_)));
    }
}
