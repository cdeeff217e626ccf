use crate::branch::{BIndex, BranchTable};
use crate::dentry::{DentryInfo, RealEntry};
use crate::error::{Result, UnionError};
use crate::whiteout;

/// Branch range of a directory's children: its top down to its opaque branch or bottom.
fn child_scan(parent: &DentryInfo) -> std::ops::RangeInclusive<BIndex> {
    parent.btop..=parent.bstop.unwrap_or(parent.bbot)
}

/// Linkage of the root: every branch root, down to the first opaque one.
pub fn root_info(table: &BranchTable, gen: u64) -> Result<DentryInfo> {
    let mut info = DentryInfo::negative(gen, table.len(), 0);
    for (bindex, branch) in table.iter() {
        let h = RealEntry::probe(branch.path.clone())?.ok_or_else(|| {
            UnionError::Stale(format!("branch root {} vanished", branch.path.display()))
        })?;
        info.widen(bindex, h);
        if whiteout::is_opaque(&branch.path) {
            info.bstop = Some(bindex);
            break;
        }
    }
    Ok(info)
}

/// Build the linkage of `name` under `parent`.
///
/// Scans top-down. A whiteout ends the scan and is remembered in `bwh`. A
/// non-directory ends it at the first hit; a directory keeps collecting lower
/// directories until a type mismatch or an opaque copy.
pub fn lookup_branches(
    table: &BranchTable,
    parent: &DentryInfo,
    name: &str,
    gen: u64,
) -> Result<DentryInfo> {
    if !parent.is_dir() {
        return Err(UnionError::NotADirectory(name.to_string()));
    }
    let mut info = DentryInfo::negative(gen, table.len(), parent.btop);
    let mut want_dir = None;

    for bindex in child_scan(parent) {
        let Some(hdir) = parent.h(bindex) else {
            continue;
        };
        if whiteout::is_whiteouted(&hdir.path, name) {
            info.bwh = Some(bindex);
            break;
        }
        let Some(h) = RealEntry::probe(hdir.path.join(name))? else {
            continue;
        };
        let is_dir = h.kind.is_dir();
        match want_dir {
            None => want_dir = Some(is_dir),
            Some(true) if is_dir => {}
            // a lower object of another type is hidden
            Some(_) => break,
        }
        let opaque = is_dir && whiteout::is_opaque(&h.path);
        info.widen(bindex, h);
        if !is_dir {
            break;
        }
        if opaque {
            info.bstop = Some(bindex);
            break;
        }
    }

    log::trace!(
        "lookup {}: [{}, {}] bwh {:?} bstop {:?}",
        name,
        info.btop,
        info.bbot,
        info.bwh,
        info.bstop
    );
    Ok(info)
}

/// True when `name` is still visible somewhere below `bindex` under `parent`,
/// so removing or renaming it at `bindex` must leave a whiteout.
pub fn exists_below(parent: &DentryInfo, name: &str, bindex: BIndex) -> bool {
    for b in child_scan(parent).filter(|b| *b > bindex) {
        let Some(hdir) = parent.h(b) else {
            continue;
        };
        if whiteout::is_whiteouted(&hdir.path, name) {
            return false;
        }
        if std::fs::symlink_metadata(hdir.path.join(name)).is_ok() {
            return true;
        }
    }
    false
}
