use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::branch::{BIndex, BranchTable};
use crate::error::{Result, UnionError};

pub const MFS_DEFAULT_EXPIRE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CreatePolicy {
    /// Top-down-parent: the parent's top branch, or the first writable above it.
    #[default]
    Tdp,
    /// Round-robin among writable branches.
    Rr,
    /// Most free space, re-measured after `expire`.
    Mfs { expire: Duration },
    /// Most free space; round-robin when the best is below `watermark` bytes.
    MfsRr { watermark: u64, expire: Duration },
    /// Top-down from the parent's branch: first writable with at least `watermark` free.
    Tdmfs { watermark: u64, expire: Duration },
    /// Most free space among writable branches holding the parent.
    Pmfs { expire: Duration },
    /// Pmfs with a round-robin fallback below `watermark`.
    PmfsRr { watermark: u64, expire: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CopyupPolicy {
    /// First writable branch at or above the entry's top branch.
    #[default]
    Tdp,
    /// Like `Tdp`, restricted to branches holding the parent, else `Bu`.
    Bup,
    /// First writable branch at or above the entry's bottom branch.
    Bu,
}

/// Inputs a policy may consult.
#[derive(Debug)]
pub struct PolicyCtx<'a> {
    pub table: &'a BranchTable,
    pub entry_btop: BIndex,
    pub entry_bbot: BIndex,
    pub parent_btop: BIndex,
    /// `parent_present[i]` is true when the parent directory exists in branch `i`.
    pub parent_present: &'a [bool],
    pub is_dir: bool,
}

#[derive(Debug, Default)]
struct MfsCache {
    bindex: Option<BIndex>,
    free: u64,
    stamp: Option<Instant>,
}

/// Mutable policy state shared by every creation on one mount.
#[derive(Debug, Default)]
pub struct WbrState {
    rr_next: AtomicUsize,
    mfs: Mutex<MfsCache>,
}

impl WbrState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget cached measurements; called whenever the branch table changes.
    pub fn reset(&self) {
        *self.mfs.lock() = MfsCache::default();
        self.rr_next.store(0, Ordering::SeqCst);
    }

    fn round_robin(&self, table: &BranchTable, is_dir: bool) -> Result<BIndex> {
        let n = table.len();
        for _ in 0..n {
            // directories peek at the rotation, files advance it
            let cur = if is_dir {
                self.rr_next.load(Ordering::SeqCst)
            } else {
                self.rr_next.fetch_add(1, Ordering::SeqCst)
            };
            let bindex = cur % n;
            if !table.test_ro(bindex) {
                return Ok(bindex);
            }
            if is_dir {
                self.rr_next.fetch_add(1, Ordering::SeqCst);
            }
        }
        Err(no_writable())
    }

    fn measured_mfs(
        &self,
        table: &BranchTable,
        expire: Duration,
        filter: impl Fn(BIndex) -> bool,
    ) -> Option<(BIndex, u64)> {
        let mut cache = self.mfs.lock();
        let fresh = cache
            .stamp
            .map(|t| t.elapsed() < expire)
            .unwrap_or(false);
        if fresh {
            if let Some(b) = cache.bindex {
                if filter(b) && !table.test_ro(b) {
                    return Some((b, cache.free));
                }
            }
        }

        let best = most_free(table.writable().filter(|&b| filter(b)).map(|b| {
            let free = table
                .get(b)
                .and_then(|br| br.free_space())
                .unwrap_or_else(|e| {
                    log::warn!("free space unavailable on branch {}: {}", b, e);
                    0
                });
            (b, free)
        }));
        cache.stamp = Some(Instant::now());
        cache.bindex = best.map(|(b, _)| b);
        cache.free = best.map(|(_, f)| f).unwrap_or(0);
        best
    }
}

/// Branch with the most free space; ties go to the higher-priority branch.
pub fn most_free(cands: impl Iterator<Item = (BIndex, u64)>) -> Option<(BIndex, u64)> {
    let mut best: Option<(BIndex, u64)> = None;
    for (b, free) in cands {
        match best {
            Some((_, f)) if f >= free => {}
            _ => best = Some((b, free)),
        }
    }
    best
}

/// First writable branch at or above `bindex`, scanning toward index 0.
pub fn writable_at_or_above(table: &BranchTable, bindex: BIndex) -> Result<BIndex> {
    let start = bindex.min(table.len().saturating_sub(1));
    (0..=start)
        .rev()
        .find(|&b| !table.test_ro(b))
        .ok_or_else(no_writable)
}

fn no_writable() -> UnionError {
    UnionError::ReadOnly("no writable branch".into())
}

impl CreatePolicy {
    pub fn select(&self, state: &WbrState, ctx: &PolicyCtx<'_>) -> Result<BIndex> {
        let table = ctx.table;
        let bindex = match *self {
            CreatePolicy::Tdp => writable_at_or_above(table, ctx.parent_btop)?,
            CreatePolicy::Rr => state.round_robin(table, ctx.is_dir)?,
            CreatePolicy::Mfs { expire } => match state.measured_mfs(table, expire, |_| true) {
                Some((b, _)) => b,
                None => writable_at_or_above(table, ctx.parent_btop)?,
            },
            CreatePolicy::MfsRr { watermark, expire } => {
                match state.measured_mfs(table, expire, |_| true) {
                    Some((b, free)) if free >= watermark => b,
                    _ => state.round_robin(table, ctx.is_dir)?,
                }
            }
            CreatePolicy::Tdmfs { watermark, expire } => {
                let top_down = (ctx.parent_btop..table.len()).find(|&b| {
                    !table.test_ro(b)
                        && table
                            .get(b)
                            .and_then(|br| br.free_space())
                            .map(|free| free >= watermark)
                            .unwrap_or(false)
                });
                match top_down {
                    Some(b) => b,
                    None => match state.measured_mfs(table, expire, |_| true) {
                        Some((b, _)) => b,
                        None => writable_at_or_above(table, ctx.parent_btop)?,
                    },
                }
            }
            CreatePolicy::Pmfs { expire } => {
                let present = |b: BIndex| ctx.parent_present.get(b).copied().unwrap_or(false);
                match state.measured_mfs(table, expire, present) {
                    Some((b, _)) => b,
                    None => match state.measured_mfs(table, expire, |_| true) {
                        Some((b, _)) => b,
                        None => writable_at_or_above(table, ctx.parent_btop)?,
                    },
                }
            }
            CreatePolicy::PmfsRr { watermark, expire } => {
                let present = |b: BIndex| ctx.parent_present.get(b).copied().unwrap_or(false);
                match state.measured_mfs(table, expire, present) {
                    Some((b, free)) if free >= watermark => b,
                    _ => state.round_robin(table, ctx.is_dir)?,
                }
            }
        };
        log::debug!("create policy {} selected branch {}", self, bindex);
        Ok(bindex)
    }
}

impl CopyupPolicy {
    pub fn select(&self, ctx: &PolicyCtx<'_>) -> Result<BIndex> {
        match self {
            CopyupPolicy::Tdp => writable_at_or_above(ctx.table, ctx.entry_btop),
            CopyupPolicy::Bup => {
                let found = (0..=ctx.entry_btop).rev().find(|&b| {
                    ctx.parent_present.get(b).copied().unwrap_or(false) && !ctx.table.test_ro(b)
                });
                match found {
                    Some(b) => Ok(b),
                    None => writable_at_or_above(ctx.table, ctx.entry_bbot),
                }
            }
            CopyupPolicy::Bu => writable_at_or_above(ctx.table, ctx.entry_bbot),
        }
    }
}

fn parse_num<T: FromStr>(s: &str, what: &str) -> Result<T> {
    s.parse()
        .map_err(|_| UnionError::Invalid(format!("bad {} '{}'", what, s)))
}

fn parse_expire(s: Option<&str>) -> Result<Duration> {
    match s {
        Some(secs) => Ok(Duration::from_secs(parse_num(secs, "expire seconds")?)),
        None => Ok(MFS_DEFAULT_EXPIRE),
    }
}

impl FromStr for CreatePolicy {
    type Err = UnionError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split(':');
        let name = parts.next().unwrap_or_default();
        let a = parts.next();
        let b = parts.next();
        let watermark = |v: Option<&str>| -> Result<u64> {
            match v {
                Some(v) => parse_num(v, "watermark"),
                None => Err(UnionError::Invalid(format!("policy '{}' needs a watermark", name))),
            }
        };
        match name {
            "tdp" => Ok(CreatePolicy::Tdp),
            "rr" => Ok(CreatePolicy::Rr),
            "mfs" => Ok(CreatePolicy::Mfs {
                expire: parse_expire(a)?,
            }),
            "mfsrr" => Ok(CreatePolicy::MfsRr {
                watermark: watermark(a)?,
                expire: parse_expire(b)?,
            }),
            "tdmfs" => Ok(CreatePolicy::Tdmfs {
                watermark: watermark(a)?,
                expire: parse_expire(b)?,
            }),
            "pmfs" => Ok(CreatePolicy::Pmfs {
                expire: parse_expire(a)?,
            }),
            "pmfsrr" => Ok(CreatePolicy::PmfsRr {
                watermark: watermark(a)?,
                expire: parse_expire(b)?,
            }),
            other => Err(UnionError::Invalid(format!("unknown create policy '{}'", other))),
        }
    }
}

impl fmt::Display for CreatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatePolicy::Tdp => write!(f, "tdp"),
            CreatePolicy::Rr => write!(f, "rr"),
            CreatePolicy::Mfs { expire } => write!(f, "mfs:{}", expire.as_secs()),
            CreatePolicy::MfsRr { watermark, expire } => {
                write!(f, "mfsrr:{}:{}", watermark, expire.as_secs())
            }
            CreatePolicy::Tdmfs { watermark, expire } => {
                write!(f, "tdmfs:{}:{}", watermark, expire.as_secs())
            }
            CreatePolicy::Pmfs { expire } => write!(f, "pmfs:{}", expire.as_secs()),
            CreatePolicy::PmfsRr { watermark, expire } => {
                write!(f, "pmfsrr:{}:{}", watermark, expire.as_secs())
            }
        }
    }
}

impl TryFrom<String> for CreatePolicy {
    type Error = UnionError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CreatePolicy> for String {
    fn from(p: CreatePolicy) -> Self {
        p.to_string()
    }
}

impl FromStr for CopyupPolicy {
    type Err = UnionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "tdp" => Ok(CopyupPolicy::Tdp),
            "bup" => Ok(CopyupPolicy::Bup),
            "bu" => Ok(CopyupPolicy::Bu),
            other => Err(UnionError::Invalid(format!("unknown copyup policy '{}'", other))),
        }
    }
}

impl fmt::Display for CopyupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CopyupPolicy::Tdp => "tdp",
            CopyupPolicy::Bup => "bup",
            CopyupPolicy::Bu => "bu",
        })
    }
}

impl TryFrom<String> for CopyupPolicy {
    type Error = UnionError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CopyupPolicy> for String {
    fn from(p: CopyupPolicy) -> Self {
        p.to_string()
    }
}
