use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Global counter of tunnel sessions that passed the WebSocket upgrade
pub static ACTIVE_SESSIONS: AtomicUsize = AtomicUsize::new(0);

/// Bytes relayed from WebSocket clients to destinations
static BYTES_UP: AtomicU64 = AtomicU64::new(0);
/// Bytes relayed from destinations back to WebSocket clients
static BYTES_DOWN: AtomicU64 = AtomicU64::new(0);

/// RAII guard to ensure the session count is properly decremented
pub struct SessionGuard {
    released: bool,
}

impl SessionGuard {
    pub fn new() -> Self {
        ACTIVE_SESSIONS.fetch_add(1, Ordering::AcqRel);
        Self { released: false }
    }

    /// Release the slot early; later calls and the drop are no-ops
    pub fn release(&mut self) {
        if !self.released {
            ACTIVE_SESSIONS.fetch_sub(1, Ordering::AcqRel);
            self.released = true;
        }
    }

    pub fn active_count() -> usize {
        ACTIVE_SESSIONS.load(Ordering::Relaxed)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub fn add_up(n: u64) {
    BYTES_UP.fetch_add(n, Ordering::Relaxed);
}

pub fn add_down(n: u64) {
    BYTES_DOWN.fetch_add(n, Ordering::Relaxed);
}

/// Snapshot of (up, down) byte totals since startup
pub fn traffic() -> (u64, u64) {
    (
        BYTES_UP.load(Ordering::Relaxed),
        BYTES_DOWN.load(Ordering::Relaxed),
    )
}
