//! Port allocation for dev servers.

use std::collections::HashSet;
use std::net::TcpListener;

use tokio::sync::Mutex;

/// Allocator over a half-open port range `[start, end)`.
///
/// Allocation skips both ports handed out by this allocator and ports some
/// other process already listens on. The scan itself is synchronous; the
/// mutex is held only for its duration.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator for `[start, end)`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate the first free port, or `None` when the range is exhausted.
    pub async fn allocate(&self) -> Option<u16> {
        let mut allocated = self.allocated.lock().await;
        for port in self.start..self.end {
            if !allocated.contains(&port) && is_port_free(port) {
                allocated.insert(port);
                return Some(port);
            }
        }
        None
    }

    /// Release a port back to the pool. Idempotent.
    pub async fn release(&self, port: u16) {
        self.allocated.lock().await.remove(&port);
    }

    /// Number of ports currently tracked as allocated.
    pub async fn in_use(&self) -> usize {
        self.allocated.lock().await.len()
    }
}

/// A port is free when nothing on the host is bound to it.
fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
