//! Event fan-out to external collaborators.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::models::StreamEvent;

/// Capacity of the broadcast side; slow receivers see `Lagged`.
const BROADCAST_CAPACITY: usize = 1024;

/// A collaborator notified of every published event.
///
/// Called synchronously on the receive path: implementations must return
/// quickly and hand off any I/O (see `LedgerSink`).
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &StreamEvent) -> anyhow::Result<()>;
}

impl<F> EventSink for F
where
    F: Fn(&StreamEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &StreamEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by [`EventFanout::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Non-blocking dispatch of parsed events to sinks and broadcast receivers.
pub struct EventFanout {
    sinks: RwLock<Vec<(SinkId, Arc<dyn EventSink>)>>,
    next_id: AtomicU64,
    broadcast: broadcast::Sender<StreamEvent>,
}

impl Default for EventFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFanout {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sinks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            broadcast,
        }
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, sink));
        id
    }

    /// Returns false if the sink was not registered.
    pub fn unregister(&self, id: SinkId) -> bool {
        let mut sinks = self
            .sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        sinks.len() != before
    }

    /// Async receiver of every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.broadcast.subscribe()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Deliver `event` to every sink, then to broadcast receivers.
    ///
    /// Sink errors and panics are logged and swallowed; they never reach
    /// the caller.
    pub fn publish(&self, event: &StreamEvent) {
        let sinks: Vec<Arc<dyn EventSink>> = self
            .sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();

        for sink in sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Event sink failed"),
                Err(_) => error!("Event sink panicked"),
            }
        }

        // No receivers is fine
        let _ = self.broadcast.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickEvent;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    fn tick() -> StreamEvent {
        StreamEvent::Tick(TickEvent {
            symbol: "R_100".to_string(),
            quote: dec!(1234.5),
            epoch: 1,
            pip_size: None,
            last_digit: 5,
        })
    }

    #[tokio::test]
    async fn test_failing_sinks_do_not_stop_delivery() {
        let fanout = EventFanout::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        fanout.register(Arc::new(|_: &StreamEvent| -> anyhow::Result<()> {
            anyhow::bail!("store unavailable")
        }));
        fanout.register(Arc::new(|_: &StreamEvent| -> anyhow::Result<()> {
            panic!("bad sink")
        }));
        let counter = Arc::clone(&delivered);
        fanout.register(Arc::new(move |_: &StreamEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut rx = fanout.subscribe();
        fanout.publish(&tick());
        fanout.publish(&tick());

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(rx.recv().await.unwrap(), tick());
    }

    #[test]
    fn test_unregister() {
        let fanout = EventFanout::new();
        let id = fanout.register(Arc::new(|_: &StreamEvent| -> anyhow::Result<()> { Ok(()) }));
        assert_eq!(fanout.sink_count(), 1);
        assert!(fanout.unregister(id));
        assert!(!fanout.unregister(id));
        assert_eq!(fanout.sink_count(), 0);
    }
}
