//! In-process publication of tracker events.

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use protofit_types::{events::TrackerEvent, Result};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: TrackerEvent) -> Result<()>;
    fn subscribe(&self) -> BoxStream<'static, TrackerEvent>;
}

/// Broadcast-channel bus; slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<TrackerEvent>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, event: TrackerEvent) -> Result<()> {
        debug!("Publishing {:?} event {}", event.kind, event.id);
        // No subscribers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, TrackerEvent> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|event| async move {
                match event {
                    Ok(event) => Some(event),
                    Err(err) => {
                        warn!("Event subscriber lagging: {}", err);
                        None
                    }
                }
            })
            .boxed()
    }
}
