// src/auth/pool.rs
use crate::error::{ServerError, ServerResult};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Inner<C> {
    free: Mutex<Vec<C>>,
    returned: Condvar,
    capacity: usize,
}

impl<C> Inner<C> {
    fn lock(&self) -> MutexGuard<'_, Vec<C>> {
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed set of reusable handles with checkout/checkin.
///
/// The free list doubles as the counting wait: a checkout takes one handle
/// or waits on the condvar for a checkin, so at most `capacity` callers ever
/// hold a handle at once.
pub struct ConnPool<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for ConnPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> ConnPool<C> {
    pub fn new(handles: Vec<C>) -> Self {
        let capacity = handles.len();
        Self {
            inner: Arc::new(Inner {
                free: Mutex::new(handles),
                returned: Condvar::new(),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Take a handle without waiting; `PoolBusy` when all are checked out.
    pub fn get(&self) -> ServerResult<PooledConn<C>> {
        let conn = self.inner.lock().pop().ok_or(ServerError::PoolBusy)?;
        Ok(self.wrap(conn))
    }

    /// Take a handle, waiting up to `timeout` for one to be returned.
    pub fn get_timeout(&self, timeout: Duration) -> ServerResult<PooledConn<C>> {
        let deadline = Instant::now() + timeout;
        let mut free = self.inner.lock();
        loop {
            if let Some(conn) = free.pop() {
                drop(free);
                return Ok(self.wrap(conn));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(ServerError::PoolBusy);
            }
            free = self
                .inner
                .returned
                .wait_timeout(free, left)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn wrap(&self, conn: C) -> PooledConn<C> {
        PooledConn {
            conn: Some(conn),
            pool: self.inner.clone(),
        }
    }
}

/// A checked-out handle; goes back to the pool on drop.
pub struct PooledConn<C> {
    conn: Option<C>,
    pool: Arc<Inner<C>>,
}

impl<C> Deref for PooledConn<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `Drop` takes the handle out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<C> DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<C> Drop for PooledConn<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.lock().push(conn);
            self.pool.returned.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn checkout_and_return() {
        let pool = ConnPool::new(vec![1, 2]);
        assert_eq!(pool.capacity(), 2);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(pool.free_count(), 0);
        assert!(matches!(pool.get(), Err(ServerError::PoolBusy)));
        assert_eq!(*a + *b, 3);
        drop(a);
        assert_eq!(pool.free_count(), 1);
        drop(b);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn timed_checkout_waits_for_return() {
        let pool = ConnPool::new(vec![String::from("only")]);
        let held = pool.get().unwrap();
        let p = pool.clone();
        let waiter = thread::spawn(move || p.get_timeout(Duration::from_secs(5)).map(|c| (*c).clone()));
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), "only");
    }

    #[test]
    fn timed_checkout_gives_up() {
        let pool = ConnPool::new(vec![()]);
        let _held = pool.get().unwrap();
        let started = Instant::now();
        assert!(matches!(
            pool.get_timeout(Duration::from_millis(30)),
            Err(ServerError::PoolBusy)
        ));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn never_more_than_capacity_out() {
        let pool = ConnPool::new(vec![(); 3]);
        let out = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let out = out.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _c = pool.get_timeout(Duration::from_secs(5)).unwrap();
                        let now = out.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                        out.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
        assert_eq!(pool.free_count(), 3);
    }
}
