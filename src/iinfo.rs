use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::branch::BIndex;
use crate::dentry::{DentryInfo, RealEntry, RealKind};

#[derive(Debug, Clone)]
pub struct InodeInfo {
    pub gen: u64,
    pub ibtop: BIndex,
    pub ibbot: BIndex,
    pub hi: Vec<Option<RealEntry>>,
}

impl InodeInfo {
    pub fn hi(&self, bindex: BIndex) -> Option<&RealEntry> {
        self.hi.get(bindex).and_then(|h| h.as_ref())
    }
}

#[derive(Debug)]
pub struct LogicalInode {
    kind: RealKind,
    info: RwLock<InodeInfo>,
}

impl LogicalInode {
    /// `None` for a negative entry.
    pub fn from_dentry(di: &DentryInfo) -> Option<Arc<Self>> {
        let kind = di.kind()?;
        Some(Arc::new(Self {
            kind,
            info: RwLock::new(Self::derive(di)),
        }))
    }

    fn derive(di: &DentryInfo) -> InodeInfo {
        InodeInfo {
            gen: di.gen,
            ibtop: di.btop,
            ibbot: di.bbot,
            hi: di.hd.clone(),
        }
    }

    pub fn refresh(&self, di: &DentryInfo) {
        *self.info.write() = Self::derive(di);
    }

    pub fn kind(&self) -> RealKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn info(&self) -> RwLockReadGuard<'_, InodeInfo> {
        self.info.read()
    }

    /// The object attributes are synthesized from.
    pub fn top(&self) -> Option<RealEntry> {
        let info = self.info.read();
        info.hi(info.ibtop).cloned()
    }
}
