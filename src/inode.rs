use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

pub const ROOT_INO: u64 = 1;

#[derive(Default)]
struct Maps {
    by_path: HashMap<String, u64>,
    by_ino: HashMap<u64, String>,
}

impl Maps {
    fn insert(&mut self, path: String, ino: u64) {
        self.by_ino.insert(ino, path.clone());
        self.by_path.insert(path, ino);
    }
}

pub struct InodeManager {
    next_ino: AtomicU64,
    maps: RwLock<Maps>,
}

fn is_under(path: &str, dir: &str) -> bool {
    dir == "/" || path == dir || path.starts_with(&format!("{}/", dir))
}

impl InodeManager {
    pub fn new() -> Self {
        let mut maps = Maps::default();
        maps.insert("/".to_string(), ROOT_INO);
        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            maps: RwLock::new(maps),
        }
    }

    pub fn get_or_create(&self, path: &str) -> u64 {
        if let Some(&ino) = self.maps.read().by_path.get(path) {
            return ino;
        }
        let mut maps = self.maps.write();
        if let Some(&ino) = maps.by_path.get(path) {
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        maps.insert(path.to_string(), ino);
        ino
    }

    pub fn get_path(&self, ino: u64) -> Option<String> {
        self.maps.read().by_ino.get(&ino).cloned()
    }

    pub fn get_ino(&self, path: &str) -> Option<u64> {
        self.maps.read().by_path.get(path).copied()
    }

    pub fn remove(&self, path: &str) {
        let mut maps = self.maps.write();
        if let Some(ino) = maps.by_path.remove(path) {
            maps.by_ino.remove(&ino);
        }
    }

    /// Forget `dir` and every path below it. The root itself is kept.
    pub fn forget_tree(&self, dir: &str) {
        let mut maps = self.maps.write();
        let gone: Vec<String> = maps
            .by_path
            .keys()
            .filter(|p| p.as_str() != "/" && is_under(p, dir))
            .cloned()
            .collect();
        for path in gone {
            if let Some(ino) = maps.by_path.remove(&path) {
                maps.by_ino.remove(&ino);
            }
        }
    }

    /// Move `from` and its descendants to `to`, replacing whatever was there.
    pub fn rename(&self, from: &str, to: &str) {
        let mut maps = self.maps.write();
        let replaced: Vec<String> = maps
            .by_path
            .keys()
            .filter(|p| is_under(p, to))
            .cloned()
            .collect();
        for path in replaced {
            if let Some(ino) = maps.by_path.remove(&path) {
                maps.by_ino.remove(&ino);
            }
        }

        let moved: Vec<(String, u64)> = maps
            .by_path
            .iter()
            .filter(|(p, _)| is_under(p, from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (path, ino) in moved {
            maps.by_path.remove(&path);
            let new_path = format!("{}{}", to, &path[from.len()..]);
            maps.insert(new_path, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeManager {
    fn default() -> Self {
        Self::new()
    }
}
