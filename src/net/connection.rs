//! Tunnel ownership state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track who owns a client connection (Serving → Hijacked → Closed)
//! - Generate unique tunnel IDs for tracing
//! - Count live tunnels so shutdown can drain them
//!
//! The HTTP server owns a connection while it is `Serving`. Only a successful
//! hijack moves it to `Hijacked`, after which the tunnel alone may read,
//! write or close it. Dropping the guard is the only way to reach `Closed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Global atomic counter for tunnel IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static TUNNEL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId(u64);

impl TunnelId {
    /// Generate a new unique tunnel ID.
    pub fn new() -> Self {
        Self(TUNNEL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TunnelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tunnel-{}", self.0)
    }
}

/// Who currently owns the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Still owned by the HTTP server; the tunnel must not touch the socket.
    Serving,
    /// Taken over by the tunnel; the HTTP server no longer writes or closes it.
    Hijacked,
    /// Both legs released.
    Closed,
}

/// Tracks live tunnels for metrics and graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct TunnelTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicU64,
    drained: Notify,
}

impl TunnelTracker {
    /// Create a new tunnel tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel that is about to be established.
    /// Returns a guard in the `Serving` state that deregisters on drop.
    pub fn track(&self) -> TunnelGuard {
        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("proxy_tunnels_active").set(active as f64);
        TunnelGuard {
            tracker: Arc::clone(&self.inner),
            id: TunnelId::new(),
            state: TunnelState::Serving,
        }
    }

    /// Get current count of live tunnels.
    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until every tunnel has closed, or until `grace` elapses.
    ///
    /// Returns `true` if all tunnels drained in time.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

/// Guard owning one tunnel's lifecycle state.
#[derive(Debug)]
pub struct TunnelGuard {
    tracker: Arc<TrackerInner>,
    id: TunnelId,
    state: TunnelState,
}

impl TunnelGuard {
    /// Get this tunnel's ID.
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Current ownership state.
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Record a successful hijack: the tunnel now owns the client connection.
    ///
    /// # Panics
    /// If called in any state other than `Serving`.
    pub fn hijacked(&mut self) {
        assert_eq!(
            self.state,
            TunnelState::Serving,
            "{} hijacked twice or after close",
            self.id
        );
        self.state = TunnelState::Hijacked;
        tracing::trace!(tunnel_id = %self.id, "Client connection hijacked");
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        let previous = self.state;
        self.state = TunnelState::Closed;
        let remaining = self.tracker.active.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("proxy_tunnels_active").set(remaining as f64);
        if remaining == 0 {
            self.tracker.drained.notify_waiters();
        }
        tracing::trace!(tunnel_id = %self.id, from = ?previous, "Tunnel closed");
    }
}
