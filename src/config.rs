use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use fuser::MountOption;
use serde::{Deserialize, Serialize};

use crate::branch::BranchPerm;
use crate::error::{Result, UnionError};
use crate::policy::{CopyupPolicy, CreatePolicy};

/// One `path=perm` branch definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub path: PathBuf,
    pub perm: BranchPerm,
}

impl BranchSpec {
    pub fn new(path: impl Into<PathBuf>, perm: BranchPerm) -> Self {
        Self {
            path: path.into(),
            perm,
        }
    }

    /// Parse `path[=perm]`. Without a permission the first branch is
    /// read-write and the others read-only.
    pub fn parse_at(s: &str, position: usize) -> Result<Self> {
        let (path, perm) = match s.rsplit_once('=') {
            Some((path, perm)) => (path, perm.parse()?),
            None if position == 0 => (s, BranchPerm::Rw),
            None => (s, BranchPerm::Ro),
        };
        if path.is_empty() {
            return Err(UnionError::InvalidBranch(format!("empty branch path in '{}'", s)));
        }
        Ok(Self::new(path, perm))
    }
}

impl FromStr for BranchSpec {
    type Err = UnionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_at(s, 0)
    }
}

impl fmt::Display for BranchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.path.display(), self.perm)
    }
}

fn default_fsname() -> String {
    "unionfs".into()
}

fn default_wkq_workers() -> usize {
    2
}

/// Everything needed to bring up one union mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub mount_point: PathBuf,
    /// Top branch first.
    pub branches: Vec<BranchSpec>,
    #[serde(default)]
    pub create: CreatePolicy,
    #[serde(default)]
    pub copyup: CopyupPolicy,
    #[serde(default = "default_fsname")]
    pub fsname: String,
    #[serde(default)]
    pub allow_other: bool,
    #[serde(default)]
    pub auto_unmount: bool,
    /// Route every unlink through the work queue, not just NFS branches.
    #[serde(default)]
    pub force_wkq_unlink: bool,
    #[serde(default = "default_wkq_workers")]
    pub wkq_workers: usize,
}

impl MountConfig {
    pub fn new(mount_point: impl Into<PathBuf>, branches: Vec<BranchSpec>) -> Self {
        Self {
            mount_point: mount_point.into(),
            branches,
            create: CreatePolicy::default(),
            copyup: CopyupPolicy::default(),
            fsname: default_fsname(),
            allow_other: false,
            auto_unmount: false,
            force_wkq_unlink: false,
            wkq_workers: default_wkq_workers(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: MountConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(UnionError::InvalidBranch("no branches given".into()));
        }
        if !self.branches.iter().any(|b| b.perm.is_writable()) {
            log::warn!("no writable branch; the union will be read-only");
        }
        Ok(())
    }

    pub fn to_mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fsname.clone()),
            MountOption::Subtype("unionfs".into()),
            MountOption::DefaultPermissions,
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}
