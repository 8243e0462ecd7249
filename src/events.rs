use crate::models::JobEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Receives progress, status and completion notifications. Delivery is
/// best-effort: an event with no subscriber is simply dropped.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JobEvent);
}

#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: JobEvent) {
        trace!(target = "altered.events", ?event, "emit");
        let _ = self.tx.send(event);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    #[tokio::test]
    async fn broadcast_sink_is_lossy_without_subscribers() {
        let sink = BroadcastSink::new(4);
        sink.emit(JobEvent::status("nobody listening", Severity::Info));

        let mut rx = sink.subscribe();
        sink.emit(JobEvent::Progress {
            current: 1,
            total: 2,
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            JobEvent::Progress {
                current: 1,
                total: 2
            }
        );
    }
}
