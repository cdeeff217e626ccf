use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use nix::sys::statfs::{statfs, NFS_SUPER_MAGIC};
use nix::sys::statvfs::statvfs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UnionError};

/// Branch index: 0 is the topmost (highest priority) branch.
pub type BIndex = usize;

/// Permission class of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BranchPerm {
    /// Read-write.
    Rw,
    /// Read-write, but hard links are never created here.
    RwNoLink,
    /// Read-only through the union; the real fs may still be writable.
    Ro,
    /// Read-only, but whiteouts may be placed here.
    RoWh,
    /// Really read-only: the real fs itself cannot be written.
    Rr,
}

impl BranchPerm {
    pub fn is_writable(self) -> bool {
        matches!(self, BranchPerm::Rw | BranchPerm::RwNoLink)
    }

    pub fn allows_whiteout(self) -> bool {
        matches!(self, BranchPerm::Rw | BranchPerm::RwNoLink | BranchPerm::RoWh)
    }

    pub fn allows_link(self) -> bool {
        self == BranchPerm::Rw
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BranchPerm::Rw => "rw",
            BranchPerm::RwNoLink => "rw+nolink",
            BranchPerm::Ro => "ro",
            BranchPerm::RoWh => "ro+wh",
            BranchPerm::Rr => "rr",
        }
    }
}

impl fmt::Display for BranchPerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BranchPerm {
    type Err = UnionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "rw" => Ok(BranchPerm::Rw),
            "rw+nolink" => Ok(BranchPerm::RwNoLink),
            "ro" => Ok(BranchPerm::Ro),
            "ro+wh" => Ok(BranchPerm::RoWh),
            "rr" => Ok(BranchPerm::Rr),
            other => Err(UnionError::InvalidBranch(format!(
                "unknown branch permission '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for BranchPerm {
    type Error = UnionError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<BranchPerm> for String {
    fn from(p: BranchPerm) -> Self {
        p.as_str().to_string()
    }
}

/// One underlying directory tree participating in the union.
pub struct Branch {
    /// Stable identity; unlike the index it survives reordering.
    pub id: u64,
    pub path: PathBuf,
    /// Unlinks on this branch are deferred to the work queue.
    pub nfs: bool,
    perm: RwLock<BranchPerm>,
    writers: AtomicUsize,
    frozen: AtomicBool,
}

impl Branch {
    pub fn open(id: u64, path: &Path, perm: BranchPerm) -> Result<Self> {
        let path = path.canonicalize()?;
        let meta = std::fs::metadata(&path)?;
        if !meta.is_dir() {
            return Err(UnionError::InvalidBranch(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        let nfs = match statfs(&path) {
            Ok(st) => st.filesystem_type() == NFS_SUPER_MAGIC,
            Err(e) => {
                log::debug!("statfs({:?}) failed: {}", path, e);
                false
            }
        };

        Ok(Self {
            id,
            nfs,
            path,
            perm: RwLock::new(perm),
            writers: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        })
    }

    pub fn perm(&self) -> BranchPerm {
        *self.perm.read()
    }

    /// Only called with the filesystem-wide lock held exclusively.
    pub(crate) fn set_perm(&self, perm: BranchPerm) {
        *self.perm.write() = perm;
    }

    pub fn is_writable(&self) -> bool {
        self.perm().is_writable()
    }

    /// Real path of `rel` (a union path such as `/a/b`) inside this branch.
    pub fn real_path(&self, rel: &str) -> PathBuf {
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            self.path.clone()
        } else {
            self.path.join(rel)
        }
    }

    /// Bytes available to unprivileged writers.
    pub fn free_space(&self) -> Result<u64> {
        let st = statvfs(&self.path)?;
        Ok((st.blocks_available() as u64).saturating_mul(st.fragment_size() as u64))
    }

    /// Take a write-lease on the branch mount. Dropped with the returned guard.
    ///
    /// Only branches that accept whiteouts hand out leases.
    pub fn want_write(self: &Arc<Self>) -> Result<MntWrite> {
        if self.frozen.load(Ordering::SeqCst) || !self.perm().allows_whiteout() {
            return Err(UnionError::ReadOnly(format!(
                "branch {} refuses writers",
                self.path.display()
            )));
        }
        self.writers.fetch_add(1, Ordering::SeqCst);
        // re-check so a concurrent freeze never misses a writer
        if self.frozen.load(Ordering::SeqCst) {
            self.writers.fetch_sub(1, Ordering::SeqCst);
            return Err(UnionError::ReadOnly(format!(
                "branch {} is being removed",
                self.path.display()
            )));
        }
        Ok(MntWrite {
            branch: Arc::clone(self),
        })
    }

    pub fn writers(&self) -> usize {
        self.writers.load(Ordering::SeqCst)
    }

    /// Stop new write-leases; fails if any are outstanding.
    pub(crate) fn freeze(&self) -> Result<()> {
        self.frozen.store(true, Ordering::SeqCst);
        if self.writers() > 0 {
            self.frozen.store(false, Ordering::SeqCst);
            return Err(UnionError::BranchBusy(format!(
                "{} has {} active writers",
                self.path.display(),
                self.writers()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("perm", &self.perm())
            .finish()
    }
}

/// Write-lease on a branch mount.
#[derive(Debug)]
pub struct MntWrite {
    branch: Arc<Branch>,
}

impl Drop for MntWrite {
    fn drop(&mut self) {
        self.branch.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Ordered branch sequence. Mutated only under the exclusive filesystem lock.
#[derive(Debug, Default)]
pub struct BranchTable {
    branches: Vec<Arc<Branch>>,
    next_id: u64,
}

impl BranchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn get(&self, bindex: BIndex) -> Result<&Arc<Branch>> {
        self.branches
            .get(bindex)
            .ok_or(UnionError::NoSuchBranch(bindex))
    }

    pub fn iter(&self) -> impl Iterator<Item = (BIndex, &Arc<Branch>)> {
        self.branches.iter().enumerate()
    }

    pub fn index_of_path(&self, path: &Path) -> Option<BIndex> {
        let path = path.canonicalize().ok()?;
        self.branches.iter().position(|b| b.path == path)
    }

    /// True when nothing may be written to `bindex` through the union.
    pub fn test_ro(&self, bindex: BIndex) -> bool {
        self.get(bindex).map(|b| !b.is_writable()).unwrap_or(true)
    }

    pub fn writable(&self) -> impl Iterator<Item = BIndex> + '_ {
        self.iter()
            .filter(|(_, b)| b.is_writable())
            .map(|(i, _)| i)
    }

    pub fn insert(&mut self, bindex: BIndex, path: &Path, perm: BranchPerm) -> Result<BIndex> {
        let bindex = bindex.min(self.branches.len());
        let branch = Branch::open(self.next_id, path, perm)?;
        for existing in &self.branches {
            if existing.path.starts_with(&branch.path) || branch.path.starts_with(&existing.path)
            {
                return Err(UnionError::InvalidBranch(format!(
                    "{} overlaps branch {}",
                    branch.path.display(),
                    existing.path.display()
                )));
            }
        }
        self.next_id += 1;
        log::info!(
            "Adding branch {} ({}) at index {}",
            branch.path.display(),
            perm,
            bindex
        );
        self.branches.insert(bindex, Arc::new(branch));
        Ok(bindex)
    }

    pub fn remove(&mut self, bindex: BIndex) -> Result<Arc<Branch>> {
        if bindex >= self.branches.len() {
            return Err(UnionError::NoSuchBranch(bindex));
        }
        if self.branches.len() == 1 {
            return Err(UnionError::BranchBusy(
                "cannot remove the last branch".into(),
            ));
        }
        let branch = Arc::clone(&self.branches[bindex]);
        branch.freeze()?;
        self.branches.remove(bindex);
        log::info!("Removed branch {} from index {}", branch.path.display(), bindex);
        Ok(branch)
    }
}
