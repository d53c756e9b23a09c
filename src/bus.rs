//! Typed event topics connecting the five components.
//!
//! The source this crate is modeled on wires a many-to-many graph of
//! ad-hoc channels at startup (a package-level `ConfigUpdateChannel` here,
//! an `OSSignalsChannel` there). This module replaces that with named
//! topics and an explicit, dependency-ordered subscriber list, the
//! structural equivalent of how `examples/unikmhz-uxum/src/handle.rs`
//! composes its own startup sequence as one linear function instead of
//! scattering wiring across modules.
//!
//! Three topics are used by the composer:
//!
//! - `ConfigUpdated`: broadcasts a validated configuration snapshot, telemetry
//!   first, then egress, then ingress (spec §4.4 broadcast ordering).
//! - `TelemetryReady`: the stage barrier. C1 publishes one token per
//!   subscriber after a config has been fully applied; C2/C3 block on it
//!   before touching the new providers.
//! - `Shutdown`: fanned out by the signal controller to every other
//!   component once the watched peer has exited (or immediately, if none is
//!   configured).

use tokio::sync::mpsc;

/// A single-producer, many-consumer topic with per-subscriber backpressure.
///
/// Each subscriber gets its own bounded channel (depth given at subscribe
/// time); [`Topic::publish`] sends to every subscriber in registration
/// order, awaiting each send in turn. A full subscriber channel therefore
/// applies back-pressure to the whole broadcast, matching spec §4.4's "the
/// controller performs a blocking send per subscriber" rule.
pub struct Topic<T> {
    subscribers: Vec<mpsc::Sender<T>>,
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<T: Clone> Topic<T> {
    /// Create an empty topic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber, returning its receiving half.
    ///
    /// Subscribers must be registered in the order they should receive
    /// broadcasts (dependency order), since [`Topic::publish`] iterates the
    /// list in registration order.
    pub fn subscribe(&mut self, depth: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(depth.max(1));
        self.subscribers.push(tx);
        rx
    }

    /// Broadcast a value to every subscriber, in registration order.
    ///
    /// A subscriber whose receiver has been dropped is silently skipped;
    /// components are expected to outlive the composer's broadcast loop for
    /// the lifetime of the process.
    pub async fn publish(&self, value: T) {
        for tx in &self.subscribers {
            let _ = tx.send(value.clone()).await;
        }
    }

    /// Number of currently registered subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether any subscribers are registered.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_to_all_subscribers_in_order() {
        let mut topic: Topic<u32> = Topic::new();
        let mut a = topic.subscribe(1);
        let mut b = topic.subscribe(1);
        topic.publish(7).await;
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_others() {
        let mut topic: Topic<u32> = Topic::new();
        let dropped = topic.subscribe(1);
        let mut kept = topic.subscribe(1);
        drop(dropped);
        topic.publish(1).await;
        assert_eq!(kept.recv().await, Some(1));
    }
}
