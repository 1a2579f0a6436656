use dbxfer_contract::TransferEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Sink for transfer events. Delivery is best effort; publishing never blocks the pipeline.
pub trait TransferNotifier: Send + Sync {
    fn publish(&self, event: TransferEvent);
}

/// Fans events out to every live subscriber. Slow subscribers lag and lose events.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    bus: broadcast::Sender<TransferEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self { bus }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.bus.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TransferNotifier for BroadcastNotifier {
    fn publish(&self, event: TransferEvent) {
        // No receivers is not an error.
        if self.bus.send(event).is_err() {
            trace!("transfer event dropped, no subscribers");
        }
    }
}
