// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C, align(64))]
#[derive(Debug)]
pub struct ServerMetrics {
    pub active_conns: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub timeouts: AtomicUsize,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_conns: usize,
    pub req_count: usize,
    pub bytes_sent: usize,
    pub timeouts: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) -> usize {
        self.active_conns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dec_conn(&self) -> usize {
        self.active_conns.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_conns: self.active_conns.load(Ordering::Relaxed),
            req_count: self.req_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move_together() {
        let m = ServerMetrics::new();
        assert_eq!(m.inc_conn(), 1);
        assert_eq!(m.inc_conn(), 2);
        assert_eq!(m.dec_conn(), 1);
        m.inc_req();
        m.add_bytes(120);
        m.add_bytes(30);
        m.inc_timeout();
        assert_eq!(
            m.snapshot(),
            MetricsSnapshot {
                active_conns: 1,
                req_count: 1,
                bytes_sent: 150,
                timeouts: 1,
            }
        );
    }
}
