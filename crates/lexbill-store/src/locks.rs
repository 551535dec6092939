//! Per-user row locks.
//!
//! Every balance mutation happens while holding the owner's [`RowLock`]. The
//! guard is synchronous and must not be held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use lexbill_core::UserId;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// Exclusive lock on one user's balance row, released on drop.
pub struct RowLock {
    user_id: UserId,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl RowLock {
    /// The user this lock covers.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

impl std::fmt::Debug for RowLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowLock").field("user_id", &self.user_id).finish()
    }
}

/// Table of per-user mutexes.
#[derive(Default)]
pub struct LockTable {
    rows: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl LockTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the user's row lock is acquired.
    pub fn lock(&self, user_id: &UserId) -> RowLock {
        let row = {
            let mut rows = self.rows.lock();
            Arc::clone(rows.entry(*user_id).or_default())
        };
        RowLock {
            user_id: *user_id,
            _guard: row.lock_arc(),
        }
    }

    /// Forget rows nobody holds or waits on. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| Arc::strong_count(row) > 1);
        before - rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn same_user_is_serialized() {
        let table = Arc::new(LockTable::new());
        let user = UserId::generate();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    let _lock = table.lock(&user);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(std::time::Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prune_drops_only_idle_rows() {
        let table = LockTable::new();
        let busy = UserId::generate();
        drop(table.lock(&UserId::generate()));
        drop(table.lock(&UserId::generate()));
        let held = table.lock(&busy);

        assert_eq!(table.prune(), 2);
        assert_eq!(table.prune(), 0);

        // The held row survived, so a second locker still waits on it.
        assert!(table.rows.lock().get(&busy).is_some_and(|row| row.is_locked()));
        drop(held);
        assert_eq!(table.prune(), 1);
    }

    #[test]
    fn different_users_do_not_block() {
        let table = LockTable::new();
        let a = table.lock(&UserId::generate());
        let b = table.lock(&UserId::generate());
        assert_ne!(a.user_id(), b.user_id());
    }
}
