//! Per-name load locks.
//!
//! At most one concurrent load per name without a single global lock:
//! callers resolving the same name contend on one mutex, unrelated names
//! never meet. Entries are weakly retained; once no caller holds the
//! returned lock, the entry is dead and gets pruned on a later access
//! when the table crosses its high-water mark, keeping it bounded over a
//! long-running process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

const PRUNE_FLOOR: usize = 64;

#[derive(Debug)]
struct LockTable {
    entries: HashMap<String, Weak<Mutex<()>>>,
    prune_at: usize,
}

#[derive(Debug)]
pub struct ClassLoadingLocks {
    table: Mutex<LockTable>,
}

impl Default for ClassLoadingLocks {
    fn default() -> Self {
        Self {
            table: Mutex::new(LockTable {
                entries: HashMap::new(),
                prune_at: PRUNE_FLOOR,
            }),
        }
    }
}

impl ClassLoadingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `name`, creating it if absent or reclaimed.
    pub fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = table.entries.get(name).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(Mutex::new(()));
        table
            .entries
            .insert(name.to_string(), Arc::downgrade(&lock));

        if table.entries.len() >= table.prune_at {
            table.entries.retain(|_, weak| weak.strong_count() > 0);
            table.prune_at = (table.entries.len() * 2).max(PRUNE_FLOOR);
        }

        lock
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_shares_a_lock_while_held() {
        let locks = ClassLoadingLocks::new();
        let a = locks.lock_for("org.example.A");
        let b = locks.lock_for("org.example.A");
        assert!(Arc::ptr_eq(&a, &b));

        let other = locks.lock_for("org.example.B");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn released_lock_is_recreated() {
        let locks = ClassLoadingLocks::new();
        let first = locks.lock_for("org.example.A");
        drop(first);
        // The entry is dead; a fresh lock must come back.
        let second = locks.lock_for("org.example.A");
        let third = locks.lock_for("org.example.A");
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[test]
    fn dead_entries_get_pruned_past_high_water_mark() {
        let locks = ClassLoadingLocks::new();
        for i in 0..PRUNE_FLOOR + 10 {
            drop(locks.lock_for(&format!("org.example.C{i}")));
        }
        assert!(locks.len() < PRUNE_FLOOR + 10);
    }

    #[test]
    fn serializes_same_name_callers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let locks = Arc::new(ClassLoadingLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(std::thread::spawn(move || {
                let lock = locks.lock_for("same.Name");
                let _guard = lock.lock().unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(1));
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
