// src/table.rs
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Names one connection for its whole lifetime.
///
/// Descriptors are recycled by the kernel as soon as they are closed, so the
/// fd alone cannot tell a late job for an old connection from a job for the
/// new one; the generation can.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub fd: RawFd,
    pub generation: u64,
}

/// A connection plus the hand-off flags the reactor keeps for it.
pub struct Entry<C> {
    token: Token,
    conn: Mutex<C>,
    busy: AtomicBool,
    close_pending: AtomicBool,
}

impl<C> Entry<C> {
    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Lock the connection. Only one side holds it at a time (the reactor
    /// while the fd is armed, a worker while a job runs), so this does not
    /// contend in practice.
    pub fn lock(&self) -> MutexGuard<'_, C> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A worker job is in flight for this connection.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// Ask for a close once the in-flight job reports back.
    #[inline]
    pub fn defer_close(&self) {
        self.close_pending.store(true, Ordering::Release);
    }

    #[inline]
    pub fn take_close_pending(&self) -> bool {
        self.close_pending.swap(false, Ordering::AcqRel)
    }
}

/// Live connections keyed by descriptor.
///
/// Only the reactor inserts and removes. Workers look entries up by token and
/// get nothing back for a connection that has since gone away.
pub struct ConnectionTable<C> {
    entries: RwLock<HashMap<RawFd, Arc<Entry<C>>>>,
    next_generation: AtomicU64,
}

impl<C> ConnectionTable<C> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            next_generation: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RawFd, Arc<Entry<C>>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RawFd, Arc<Entry<C>>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a freshly accepted connection under `fd`. Any stale entry still
    /// filed under the same descriptor is replaced.
    pub fn insert(&self, fd: RawFd, conn: C) -> Arc<Entry<C>> {
        let token = Token {
            fd,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        };
        let entry = Arc::new(Entry {
            token,
            conn: Mutex::new(conn),
            busy: AtomicBool::new(false),
            close_pending: AtomicBool::new(false),
        });
        self.write().insert(fd, entry.clone());
        entry
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Entry<C>>> {
        self.read().get(&fd).cloned()
    }

    /// Resolve-or-no-op: `None` if the connection behind `token` is gone.
    pub fn resolve(&self, token: Token) -> Option<Arc<Entry<C>>> {
        self.read()
            .get(&token.fd)
            .filter(|e| e.token.generation == token.generation)
            .cloned()
    }

    /// Drop the entry for `token` if it is still the live one.
    pub fn remove(&self, token: Token) -> Option<Arc<Entry<C>>> {
        let mut entries = self.write();
        match entries.get(&token.fd) {
            Some(e) if e.token.generation == token.generation => entries.remove(&token.fd),
            _ => None,
        }
    }

    /// Empty the table, handing back every entry.
    pub fn drain(&self) -> Vec<Arc<Entry<C>>> {
        self.write().drain().map(|(_, e)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_distinguish_reused_descriptors() {
        let table = ConnectionTable::with_capacity(4);
        let first = table.insert(7, "first").token();
        assert_eq!(*table.resolve(first).unwrap().lock(), "first");

        assert!(table.remove(first).is_some());
        assert!(table.resolve(first).is_none());
        assert!(table.remove(first).is_none());

        let second = table.insert(7, "second").token();
        assert_ne!(first, second);
        assert!(table.resolve(first).is_none());
        assert_eq!(*table.get(7).unwrap().lock(), "second");
    }

    #[test]
    fn stale_remove_does_not_evict_new_owner() {
        let table = ConnectionTable::with_capacity(4);
        let old = table.insert(3, 1).token();
        let new = table.insert(3, 2).token();
        assert!(table.remove(old).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.resolve(new).is_some());
    }

    #[test]
    fn hand_off_flags() {
        let table = ConnectionTable::with_capacity(1);
        let entry = table.insert(5, ());
        assert!(!entry.is_busy());
        entry.set_busy(true);
        assert!(entry.is_busy());

        assert!(!entry.take_close_pending());
        entry.defer_close();
        assert!(entry.take_close_pending());
        assert!(!entry.take_close_pending());
    }

    #[test]
    fn drain_empties_the_table() {
        let table = ConnectionTable::with_capacity(8);
        for fd in 0..5 {
            table.insert(fd, fd);
        }
        assert_eq!(table.drain().len(), 5);
        assert!(table.is_empty());
    }
}
