use std::sync::Arc;

use crate::branch::BIndex;
use crate::cpup;
use crate::dentry::{Dentry, RealEntry};
use crate::error::{Result, UnionError};
use crate::lock::{HiLockRegistry, LockSubclass};
use crate::policy::{PolicyCtx, WbrState};
use crate::sb::SbInfo;

#[derive(Debug, Clone, Copy, Default)]
pub struct WrDirFlags {
    /// A new name is being added.
    pub add_entry: bool,
    pub is_dir: bool,
    /// The caller creates an unnamed file; no name is looked up in the target.
    pub is_tmpfile: bool,
    /// Decided by the caller; must be writable.
    pub force_btgt: Option<BIndex>,
}

/// Pick the branch `dentry` is written to and make its parent exist there.
///
/// With a `src` (link or rename) the target never sits below the source's top
/// branch. A new entry asks the create policy; anything that lands on a
/// read-only branch falls back to the copyup policy. A negative entry ends up
/// with the range `[bcpup, bcpup]`.
pub fn resolve_write_dir(
    registry: &Arc<HiLockRegistry>,
    si: &SbInfo,
    wbr: &WbrState,
    dentry: &Arc<Dentry>,
    src: Option<&Arc<Dentry>>,
    flags: WrDirFlags,
) -> Result<BIndex> {
    let add_entry = flags.add_entry || flags.is_tmpfile;
    let (btop, bwh) = {
        let info = dentry.info.read_recursive();
        (info.btop, info.bwh)
    };
    let parent = dentry.parent();

    let bcpup = match flags.force_btgt {
        Some(b) => {
            assert!(
                !si.table.test_ro(b),
                "forced write branch {} of {} is read-only",
                b,
                dentry.path
            );
            b
        }
        None => choose(si, wbr, dentry, parent.as_ref(), src, btop, bwh, add_entry, flags)?,
    };

    log::debug!("wr_dir {}: btop {}, bcpup {}", dentry.path, btop, bcpup);
    if bcpup == btop {
        return Ok(bcpup);
    }
    let Some(parent) = parent else {
        // the root exists in every branch
        return Ok(bcpup);
    };

    if parent.info.read_recursive().h(bcpup).is_none() {
        cpup::materialize_ancestors(registry, si, dentry, bcpup)?;
    }

    if add_entry && !flags.is_tmpfile {
        check_negative(registry, &parent, &dentry.name, bcpup)?;
    }
    let mut info = dentry.info.write();
    if !info.is_positive() {
        info.btop = bcpup;
        info.bbot = bcpup;
    }
    Ok(bcpup)
}

#[allow(clippy::too_many_arguments)]
fn choose(
    si: &SbInfo,
    wbr: &WbrState,
    dentry: &Dentry,
    parent: Option<&Arc<Dentry>>,
    src: Option<&Arc<Dentry>>,
    btop: BIndex,
    bwh: Option<BIndex>,
    add_entry: bool,
    flags: WrDirFlags,
) -> Result<BIndex> {
    let (parent_btop, parent_present, horizon) = match parent {
        Some(p) => {
            let pinfo = p.info.read_recursive();
            (pinfo.btop, pinfo.present(), pinfo.bstop)
        }
        None => (0, vec![true; si.table.len()], None),
    };
    let bbot = dentry.info.read_recursive().bbot;
    let ctx = PolicyCtx {
        table: &si.table,
        entry_btop: btop,
        entry_bbot: bbot,
        parent_btop,
        parent_present: &parent_present,
        is_dir: flags.is_dir,
    };

    let mut bcpup = Some(btop);
    if let Some(src) = src {
        let src_btop = src.info.read_recursive().btop;
        if src_btop < btop {
            bcpup = Some(src_btop);
        }
    } else if add_entry {
        bcpup = match si.create.select(wbr, &ctx) {
            Ok(b) => Some(b),
            Err(e) => {
                log::debug!("create policy {} failed: {}", si.create, e);
                None
            }
        };
    }

    // a new name placed below a whiteout or an opaque parent would stay hidden
    if add_entry {
        let limit = [bwh, horizon].into_iter().flatten().min();
        if let (Some(b), Some(limit)) = (bcpup, limit) {
            bcpup = Some(b.min(limit));
        }
    }

    match bcpup {
        Some(b) if !si.table.test_ro(b) => Ok(b),
        _ => si.copyup.select(&ctx),
    }
}

/// Make sure `name` does not already exist in the parent's `bindex` directory.
fn check_negative(
    registry: &Arc<HiLockRegistry>,
    parent: &Dentry,
    name: &str,
    bindex: BIndex,
) -> Result<()> {
    let h_dir = parent
        .info
        .read_recursive()
        .h(bindex)
        .cloned()
        .ok_or_else(|| UnionError::Stale(format!("{} missing in branch {}", parent.path, bindex)))?;
    let _guard = registry.lock(h_dir.key, LockSubclass::IParent);
    if RealEntry::probe(h_dir.path.join(name))?.is_some() {
        return Err(UnionError::Stale(format!(
            "{} appeared in branch {}",
            crate::dentry::join_path(&parent.path, name),
            bindex
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchPerm, BranchTable};
    use crate::dentry::join_path;
    use crate::lookup::{lookup_branches, root_info};
    use crate::policy::{CopyupPolicy, CreatePolicy};
    use std::sync::Weak;

    struct Fixture {
        dirs: Vec<tempfile::TempDir>,
        si: SbInfo,
        root: Arc<Dentry>,
        registry: Arc<HiLockRegistry>,
        wbr: WbrState,
    }

    fn fixture(perms: &[BranchPerm]) -> Fixture {
        let dirs: Vec<_> = perms.iter().map(|_| tempfile::tempdir().unwrap()).collect();
        let mut table = BranchTable::new();
        for (i, (d, p)) in dirs.iter().zip(perms).enumerate() {
            table.insert(i, d.path(), *p).unwrap();
        }
        let si = SbInfo {
            table,
            gen: 1,
            create: CreatePolicy::Tdp,
            copyup: CopyupPolicy::Tdp,
        };
        let root = Arc::new(Dentry::new(
            "",
            "/".into(),
            Weak::new(),
            root_info(&si.table, si.gen).unwrap(),
        ));
        Fixture {
            dirs,
            si,
            root,
            registry: Arc::new(HiLockRegistry::new()),
            wbr: WbrState::new(),
        }
    }

    fn child(f: &Fixture, parent: &Arc<Dentry>, name: &str) -> Arc<Dentry> {
        let info = lookup_branches(&f.si.table, &parent.info.read(), name, f.si.gen).unwrap();
        Arc::new(Dentry::new(
            name,
            join_path(&parent.path, name),
            Arc::downgrade(parent),
            info,
        ))
    }

    fn add_entry() -> WrDirFlags {
        WrDirFlags {
            add_entry: true,
            ..Default::default()
        }
    }

    #[test]
    fn new_name_under_a_lower_dir_lands_on_top() {
        let f = fixture(&[BranchPerm::Rw, BranchPerm::Ro]);
        std::fs::create_dir(f.dirs[1].path().join("d")).unwrap();
        let d = child(&f, &f.root, "d");
        let x = child(&f, &d, "x");

        let bindex = resolve_write_dir(&f.registry, &f.si, &f.wbr, &x, None, add_entry()).unwrap();
        assert_eq!(bindex, 0);
        assert!(f.dirs[0].path().join("d").is_dir());
        let info = x.info.read();
        assert_eq!((info.btop, info.bbot), (0, 0));
    }

    #[test]
    fn target_never_sits_below_the_source() {
        let f = fixture(&[BranchPerm::Rw, BranchPerm::Rw]);
        std::fs::write(f.dirs[0].path().join("src"), b"").unwrap();
        std::fs::create_dir(f.dirs[1].path().join("d")).unwrap();
        let src = child(&f, &f.root, "src");
        let d = child(&f, &f.root, "d");
        let dst = child(&f, &d, "dst");
        assert_eq!(dst.info.read().btop, 1);

        let bindex =
            resolve_write_dir(&f.registry, &f.si, &f.wbr, &dst, Some(&src), add_entry()).unwrap();
        assert_eq!(bindex, 0);
        assert!(f.dirs[0].path().join("d").is_dir());
    }

    #[test]
    fn existing_real_name_is_stale() {
        let f = fixture(&[BranchPerm::Rw, BranchPerm::Ro]);
        std::fs::create_dir(f.dirs[1].path().join("d")).unwrap();
        let d = child(&f, &f.root, "d");
        let x = child(&f, &d, "x");
        std::fs::create_dir(f.dirs[0].path().join("d")).unwrap();
        std::fs::write(f.dirs[0].path().join("d/x"), b"").unwrap();

        let err = resolve_write_dir(&f.registry, &f.si, &f.wbr, &x, None, add_entry()).unwrap_err();
        assert!(err.is_stale(), "{:?}", err);
    }

    #[test]
    fn no_writable_branch_is_read_only() {
        let f = fixture(&[BranchPerm::Ro, BranchPerm::Rr]);
        let x = child(&f, &f.root, "x");
        let err = resolve_write_dir(&f.registry, &f.si, &f.wbr, &x, None, add_entry()).unwrap_err();
        assert!(matches!(err, UnionError::ReadOnly(_)), "{:?}", err);
    }
}
