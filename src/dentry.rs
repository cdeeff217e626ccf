use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::branch::BIndex;
use crate::error::{Result, UnionError};
use crate::iinfo::LogicalInode;
use crate::lock::HiKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealKind {
    Dir,
    File,
    Symlink,
    /// Character/block device, fifo or socket.
    Special,
}

impl RealKind {
    pub fn from_meta(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_dir() {
            RealKind::Dir
        } else if ft.is_symlink() {
            RealKind::Symlink
        } else if ft.is_char_device() || ft.is_block_device() || ft.is_fifo() || ft.is_socket()
        {
            RealKind::Special
        } else {
            RealKind::File
        }
    }

    pub fn is_dir(self) -> bool {
        self == RealKind::Dir
    }
}

/// Handle to a real object inside one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealEntry {
    pub path: PathBuf,
    pub key: HiKey,
    pub kind: RealKind,
    pub mode: u32,
}

impl RealEntry {
    pub fn from_meta(path: PathBuf, meta: &Metadata) -> Self {
        Self {
            key: HiKey {
                dev: meta.dev(),
                ino: meta.ino(),
            },
            kind: RealKind::from_meta(meta),
            mode: meta.mode(),
            path,
        }
    }

    /// `lstat` the real path; `None` when it does not exist.
    pub fn probe(path: PathBuf) -> Result<Option<Self>> {
        match std::fs::symlink_metadata(&path) {
            Ok(meta) => Ok(Some(Self::from_meta(path, &meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// True while the real path still names the same object.
    pub fn still_linked(&self) -> bool {
        match std::fs::symlink_metadata(&self.path) {
            Ok(meta) => meta.dev() == self.key.dev && meta.ino() == self.key.ino,
            Err(_) => false,
        }
    }
}

/// Branch range and per-branch real handles of one logical entry.
///
/// `hd` has exactly one slot per branch; it is resized only while the branch
/// table is held exclusively.
#[derive(Debug, Clone)]
pub struct DentryInfo {
    pub gen: u64,
    pub btop: BIndex,
    pub bbot: BIndex,
    /// Branch of the whiteout that hides this name below, if any.
    pub bwh: Option<BIndex>,
    /// Lowest branch whose contents are visible beneath this directory.
    pub bstop: Option<BIndex>,
    pub hd: Vec<Option<RealEntry>>,
}

impl DentryInfo {
    pub fn negative(gen: u64, nbranch: usize, btop: BIndex) -> Self {
        Self {
            gen,
            btop,
            bbot: btop,
            bwh: None,
            bstop: None,
            hd: vec![None; nbranch],
        }
    }

    pub fn h(&self, bindex: BIndex) -> Option<&RealEntry> {
        self.hd.get(bindex).and_then(|h| h.as_ref())
    }

    pub fn is_positive(&self) -> bool {
        self.hd.iter().any(|h| h.is_some())
    }

    /// Kind of the topmost real object.
    pub fn kind(&self) -> Option<RealKind> {
        self.h(self.btop).map(|h| h.kind)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == Some(RealKind::Dir)
    }

    pub fn set_h(&mut self, bindex: BIndex, h: Option<RealEntry>) {
        if bindex >= self.hd.len() {
            self.hd.resize(bindex + 1, None);
        }
        self.hd[bindex] = h;
    }

    /// Link `h` at `bindex` and widen the range to include it.
    pub fn widen(&mut self, bindex: BIndex, h: RealEntry) {
        let was_positive = self.is_positive();
        self.set_h(bindex, Some(h));
        if was_positive {
            self.btop = self.btop.min(bindex);
            self.bbot = self.bbot.max(bindex);
        } else {
            self.btop = bindex;
            self.bbot = bindex;
        }
    }

    /// Drop every handle and leave a negative entry at `btop`.
    pub fn make_negative(&mut self, btop: BIndex) {
        self.hd.iter_mut().for_each(|h| *h = None);
        self.btop = btop;
        self.bbot = btop;
        self.bstop = None;
    }

    pub fn present(&self) -> Vec<bool> {
        self.hd.iter().map(|h| h.is_some()).collect()
    }
}

/// Logical directory entry.
pub struct Dentry {
    pub name: String,
    /// Union path, `/` for the root.
    pub path: String,
    parent: Weak<Dentry>,
    /// Guarded by the "di" lock.
    pub info: Arc<RwLock<DentryInfo>>,
    inode: RwLock<Option<Arc<LogicalInode>>>,
}

impl Dentry {
    pub fn new(name: &str, path: String, parent: Weak<Dentry>, info: DentryInfo) -> Self {
        let inode = LogicalInode::from_dentry(&info);
        Self {
            name: name.to_string(),
            path,
            parent,
            info: Arc::new(RwLock::new(info)),
            inode: RwLock::new(inode),
        }
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.upgrade()
    }

    pub fn inode(&self) -> Option<Arc<LogicalInode>> {
        self.inode.read().clone()
    }

    /// Re-derive the logical inode after the branch linkage changed.
    pub fn refresh_inode(&self, info: &DentryInfo) {
        let mut inode = self.inode.write();
        match inode.as_ref() {
            Some(existing) if info.kind() == Some(existing.kind()) => {
                existing.refresh(info)
            }
            _ => *inode = LogicalInode::from_dentry(info),
        }
    }

    pub fn child_path(&self, name: &str) -> String {
        join_path(&self.path, name)
    }
}

impl std::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info.read();
        f.debug_struct("Dentry")
            .field("path", &self.path)
            .field("btop", &info.btop)
            .field("bbot", &info.bbot)
            .field("gen", &info.gen)
            .finish()
    }
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Split a union path into its components, rejecting `.` and `..`.
pub fn components(path: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    for c in path.split('/').filter(|c| !c.is_empty()) {
        if c == "." || c == ".." {
            return Err(UnionError::Invalid(format!("path component '{}'", c)));
        }
        out.push(c);
    }
    Ok(out)
}

pub fn parent_and_name(path: &str) -> Result<(String, String)> {
    let comps = components(path)?;
    match comps.split_last() {
        Some((name, dirs)) => {
            let parent = if dirs.is_empty() {
                "/".to_string()
            } else {
                format!("/{}", dirs.join("/"))
            };
            Ok((parent, name.to_string()))
        }
        None => Err(UnionError::Invalid("the root has no parent".into())),
    }
}

/// Every cached entry, keyed by union path. Owns the strong references;
/// children only point back at parents weakly.
#[derive(Debug, Default)]
pub struct DentryCache {
    map: DashMap<String, Arc<Dentry>>,
}

impl DentryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Arc<Dentry>> {
        self.map.get(path).map(|d| Arc::clone(d.value()))
    }

    pub fn insert(&self, dentry: Arc<Dentry>) {
        self.map.insert(dentry.path.clone(), dentry);
    }

    /// Insert `dentry` unless another thread cached the same path first;
    /// either way return the cached entry.
    pub fn insert_or_get(&self, dentry: Arc<Dentry>) -> Arc<Dentry> {
        Arc::clone(self.map.entry(dentry.path.clone()).or_insert(dentry).value())
    }

    /// Forget `path` and everything below it.
    pub fn remove_tree(&self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.map
            .retain(|p, _| p != path && !(path != "/" && p.starts_with(&prefix)));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }
}
