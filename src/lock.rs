//! Real-inode locks and their ordering.
//!
//! Every real directory a pin locks is identified by its `(dev, ino)` pair and
//! locked through a shared registry, so two pins on the same real directory
//! serialize even when they reached it through different logical entries.
//! Subclasses order the locks a single thread may hold at once; two real
//! parents are always taken in `canonical_order`.

use std::cell::RefCell;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

/// Lock subclass. A thread only ever takes a higher subclass than the ones it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockSubclass {
    /// Logical parent dentry info.
    DiParent,
    /// Real parent, first of a pair or alone.
    IParent,
    /// Real parent, second of a pair; also used while copying up directories.
    IParent2,
    /// A real directory being emptied under its locked parent.
    IChild,
}

/// Identity of a real inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HiKey {
    pub dev: u64,
    pub ino: u64,
}

thread_local! {
    static HELD: RefCell<Vec<LockSubclass>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Default)]
pub struct HiLockRegistry {
    locks: DashMap<HiKey, Arc<Mutex<()>>>,
}

impl HiLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the real inode `key` is exclusively ours.
    pub fn lock(self: &Arc<Self>, key: HiKey, subclass: LockSubclass) -> HiGuard {
        HELD.with(|held| {
            let held = held.borrow();
            if let Some(&last) = held.last() {
                debug_assert!(
                    last < subclass,
                    "lock order violation: taking {:?} while holding {:?}",
                    subclass,
                    last
                );
            }
        });

        let mutex = Arc::clone(self.locks.entry(key).or_default().value());
        let guard = mutex.lock_arc();
        HELD.with(|held| held.borrow_mut().push(subclass));
        HiGuard {
            key,
            subclass,
            guard: Some(guard),
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Record that a logical parent's info lock is held. Must come before any real lock.
pub(crate) fn enter_di_parent() -> DiMark {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        debug_assert!(
            held.iter().all(|s| *s == LockSubclass::DiParent),
            "lock order violation: taking DiParent while holding {:?}",
            held
        );
        held.push(LockSubclass::DiParent);
    });
    DiMark(())
}

/// Bookkeeping token for a held logical parent lock.
#[derive(Debug)]
pub(crate) struct DiMark(());

impl Drop for DiMark {
    fn drop(&mut self) {
        forget_held(LockSubclass::DiParent);
    }
}

fn forget_held(subclass: LockSubclass) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|s| *s == subclass) {
            held.remove(pos);
        }
    });
}

/// Exclusive hold on a real inode; released on drop.
pub struct HiGuard {
    key: HiKey,
    subclass: LockSubclass,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    registry: Arc<HiLockRegistry>,
}

impl HiGuard {
    pub fn key(&self) -> HiKey {
        self.key
    }
}

impl Drop for HiGuard {
    fn drop(&mut self) {
        self.guard.take();
        forget_held(self.subclass);
        // the registry holds one reference, so an idle entry has a count of one
        self.registry
            .locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

impl std::fmt::Debug for HiGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HiGuard")
            .field("key", &self.key)
            .field("subclass", &self.subclass)
            .finish()
    }
}

/// Order in which two real parents are locked: ascending key.
///
/// Every caller that needs two real parents goes through here, so two
/// operations touching the same pair in opposite roles still agree on order.
pub fn canonical_order<T: Ord + Copy>(a: T, b: T) -> (T, T) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn guard_releases_and_prunes_registry() {
        let reg = Arc::new(HiLockRegistry::new());
        let key = HiKey { dev: 1, ino: 2 };
        {
            let g = reg.lock(key, LockSubclass::IParent);
            assert_eq!(g.key(), key);
            assert_eq!(reg.len(), 1);
        }
        assert!(reg.is_empty());
        let _again = reg.lock(key, LockSubclass::IParent);
    }

    #[test]
    fn pair_locks_in_ascending_subclass() {
        let reg = Arc::new(HiLockRegistry::new());
        let (a, b) = canonical_order(HiKey { dev: 1, ino: 9 }, HiKey { dev: 1, ino: 3 });
        assert_eq!(a.ino, 3);
        let _ga = reg.lock(a, LockSubclass::IParent);
        let _gb = reg.lock(b, LockSubclass::IParent2);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn descending_subclass_panics_in_debug() {
        let reg = Arc::new(HiLockRegistry::new());
        let _a = reg.lock(HiKey { dev: 1, ino: 1 }, LockSubclass::IParent2);
        let _b = reg.lock(HiKey { dev: 1, ino: 2 }, LockSubclass::IParent);
    }

    #[test]
    fn di_marks_nest_before_real_locks() {
        let reg = Arc::new(HiLockRegistry::new());
        let _d1 = enter_di_parent();
        let _d2 = enter_di_parent();
        let _p = reg.lock(HiKey { dev: 1, ino: 1 }, LockSubclass::IParent);
        let _c = reg.lock(HiKey { dev: 1, ino: 2 }, LockSubclass::IChild);
    }

    #[test]
    fn contended_lock_serializes_threads() {
        let reg = Arc::new(HiLockRegistry::new());
        let counter = Arc::new(Mutex::new(0u32));
        let key = HiKey { dev: 7, ino: 7 };
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _g = reg.lock(key, LockSubclass::IParent);
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 400);
        assert!(reg.is_empty());
    }

    // A lock is (branch, directory). An operation is the ordered list of locks it takes.
    type Lk = (usize, usize);

    /// Explore every interleaving of `ops`; true if some schedule deadlocks.
    fn can_deadlock(ops: &[Vec<Lk>]) -> bool {
        fn step(
            ops: &[Vec<Lk>],
            pcs: &mut Vec<usize>,
            owner: &mut Vec<(Lk, usize)>,
            seen: &mut HashSet<Vec<usize>>,
        ) -> bool {
            if !seen.insert(pcs.clone()) {
                return false;
            }
            let mut progressed = false;
            for t in 0..ops.len() {
                let pc = pcs[t];
                if pc == ops[t].len() {
                    continue;
                }
                let want = ops[t][pc];
                if owner.iter().any(|(l, o)| *l == want && *o != t) {
                    continue;
                }
                progressed = true;
                owner.push((want, t));
                pcs[t] += 1;
                let done = pcs[t] == ops[t].len();
                let released: Vec<_> = if done {
                    let r = owner.iter().filter(|(_, o)| *o == t).copied().collect();
                    owner.retain(|(_, o)| *o != t);
                    r
                } else {
                    Vec::new()
                };
                let dead = step(ops, pcs, owner, seen);
                owner.extend(released);
                pcs[t] -= 1;
                owner.retain(|e| *e != (want, t));
                if dead {
                    return true;
                }
            }
            let all_done = pcs.iter().zip(ops).all(|(pc, op)| *pc == op.len());
            !progressed && !all_done
        }
        let mut pcs = vec![0; ops.len()];
        step(ops, &mut pcs, &mut Vec::new(), &mut HashSet::new())
    }

    #[test]
    fn opposite_renames_deadlock_without_canonical_order() {
        let old_new = vec![vec![(0, 0), (0, 1)], vec![(0, 1), (0, 0)]];
        assert!(can_deadlock(&old_new));
    }

    #[test]
    fn canonical_order_never_deadlocks_on_small_table() {
        // 3 branches x 2 directories, every pair of two-parent operations
        let locks: Vec<Lk> = (0..3).flat_map(|b| (0..2).map(move |d| (b, d))).collect();
        let mut pairs = Vec::new();
        for &x in &locks {
            for &y in &locks {
                if x != y {
                    pairs.push((x, y));
                }
            }
        }
        for &(a_old, a_new) in &pairs {
            for &(b_old, b_new) in &pairs {
                let (a1, a2) = canonical_order(a_old, a_new);
                let (b1, b2) = canonical_order(b_old, b_new);
                let ops = vec![vec![a1, a2], vec![b1, b2], vec![a2.min(b1)]];
                assert!(
                    !can_deadlock(&ops),
                    "deadlock between {:?}->{:?} and {:?}->{:?}",
                    a_old,
                    a_new,
                    b_old,
                    b_new
                );
            }
        }
    }
}
