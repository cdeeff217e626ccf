pub mod branch;
pub mod config;
pub mod cpup;
pub mod dentry;
pub mod error;
pub mod fs;
mod fs_ctl;
mod fs_helpers;
pub mod iinfo;
pub mod inode;
pub mod lock;
pub mod lookup;
pub mod permission;
pub mod pin;
pub mod policy;
pub mod sb;
pub mod vfsub;
pub mod whiteout;
pub mod wkq;
pub mod wr_dir;

pub use branch::{BIndex, Branch, BranchPerm, BranchTable};
pub use cpup::materialize_ancestors;
pub use error::{Result, UnionError};
pub use fs_ctl::CtlCommand;
pub use pin::{pin_release, Pin, PinFlags, PinPair};
pub use policy::{CopyupPolicy, CreatePolicy};
pub use sb::{BranchInfo, DirEntry, SbInfo, SetAttr, UnionFs};
pub use wr_dir::{resolve_write_dir, WrDirFlags};

/// Pin `dentry`'s real parent in branch `bindex`; see [`Pin::acquire`].
pub fn pin_acquire(
    registry: &std::sync::Arc<lock::HiLockRegistry>,
    si: &SbInfo,
    dentry: &std::sync::Arc<dentry::Dentry>,
    bindex: BIndex,
    lsc: lock::LockSubclass,
    flags: PinFlags,
) -> Result<Pin> {
    Pin::acquire(registry, si, dentry, bindex, lsc, flags)
}
