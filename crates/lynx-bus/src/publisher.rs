// Single-writer publish worker. Stamps outgoing messages with the sender
// identity and send timestamp, then hands them to the topic publisher.
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info};

use lynx_broker::TopicPublisher;
use lynx_wire::{BroadcastMessage, Envelope};

pub(crate) const PUBLISH_QUEUE_DEPTH: usize = 1024;

/// Shared handle to the current publish queue. `connect` swaps the whole
/// sender in one write, so the listener surface either reaches the old
/// connection or the new one, never a half-configured mix.
pub(crate) type PublisherSlot = Arc<RwLock<Option<mpsc::Sender<BroadcastMessage>>>>;

pub(crate) fn new_slot() -> PublisherSlot {
    Arc::new(RwLock::new(None))
}

/// Enqueue a message for the publish worker. Failures are logged and
/// swallowed: the local mutation is already committed and the next mutation
/// re-converges the cluster.
pub(crate) fn enqueue(slot: &PublisherSlot, message: BroadcastMessage) {
    let guard = slot.read().expect("publisher slot lock");
    let Some(tx) = guard.as_ref() else {
        info!(event = ?message, "cache bus not connected; dropping outgoing event");
        return;
    };
    if let Err(err) = tx.try_send(message) {
        metrics::counter!("lynx_bus_publish_dropped_total").increment(1);
        info!(error = %err, "failed to enqueue outgoing cache event");
    }
}

/// Spawn the writer task for one connection epoch. The sender identifier is
/// fixed for the task's lifetime; reconnection spawns a fresh writer.
pub(crate) fn spawn_publisher_writer(
    publisher: Arc<dyn TopicPublisher>,
    sender_id: String,
) -> (mpsc::Sender<BroadcastMessage>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_DEPTH);
    let handle = tokio::spawn(run_publisher_writer(publisher, sender_id, rx));
    (tx, handle)
}

async fn run_publisher_writer(
    publisher: Arc<dyn TopicPublisher>,
    sender_id: String,
    mut rx: mpsc::Receiver<BroadcastMessage>,
) {
    debug!(sender_id = %sender_id, "publish writer started");
    while let Some(message) = rx.recv().await {
        let envelope = Envelope {
            sender_id: Some(sender_id.clone()),
            sent_at_ms: now_ms(),
            message,
        };
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                info!(error = %err, "failed to encode outgoing cache event");
                continue;
            }
        };
        match publisher.publish(bytes).await {
            Ok(_) => {
                metrics::counter!("lynx_bus_frames_out_total").increment(1);
            }
            Err(err) => {
                metrics::counter!("lynx_bus_publish_errors_total").increment(1);
                info!(error = %err, "cache event publish failed");
            }
        }
    }
    debug!(sender_id = %sender_id, "publish writer exited");
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use lynx_broker::BrokerError;
    use lynx_wire::CacheEvent;
    use std::sync::Mutex;

    struct CapturingPublisher {
        frames: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl TopicPublisher for CapturingPublisher {
        async fn publish(&self, payload: Bytes) -> lynx_broker::Result<usize> {
            self.frames.lock().expect("frames lock").push(payload);
            Ok(1)
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl TopicPublisher for FailingPublisher {
        async fn publish(&self, _payload: Bytes) -> lynx_broker::Result<usize> {
            Err(BrokerError::Transport("wire cut".to_string()))
        }
    }

    fn group_reset() -> BroadcastMessage {
        BroadcastMessage::Cache(CacheEvent::GroupReset { group_id: 7 })
    }

    #[tokio::test]
    async fn writer_stamps_sender_and_timestamp() {
        let publisher = Arc::new(CapturingPublisher {
            frames: Mutex::new(Vec::new()),
        });
        let (tx, handle) = spawn_publisher_writer(
            Arc::clone(&publisher) as Arc<dyn TopicPublisher>,
            "node-a".to_string(),
        );
        tx.send(group_reset()).await.expect("send");
        drop(tx);
        handle.await.expect("writer join");

        let frames = publisher.frames.lock().expect("frames lock");
        assert_eq!(frames.len(), 1);
        let envelope = Envelope::decode(frames[0].clone()).expect("decode");
        assert_eq!(envelope.sender_id.as_deref(), Some("node-a"));
        assert!(envelope.sent_at_ms > 0);
        assert_eq!(envelope.message, group_reset());
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed() {
        let (tx, handle) = spawn_publisher_writer(Arc::new(FailingPublisher), "node-a".to_string());
        tx.send(group_reset()).await.expect("send");
        tx.send(group_reset()).await.expect("send again");
        drop(tx);
        // The writer must survive both failures and exit only on close.
        handle.await.expect("writer join");
    }

    #[tokio::test]
    async fn enqueue_without_connection_drops_quietly() {
        let slot = new_slot();
        enqueue(&slot, group_reset());

        let publisher = Arc::new(CapturingPublisher {
            frames: Mutex::new(Vec::new()),
        });
        let (tx, handle) = spawn_publisher_writer(
            Arc::clone(&publisher) as Arc<dyn TopicPublisher>,
            "node-a".to_string(),
        );
        *slot.write().expect("slot lock") = Some(tx);
        enqueue(&slot, group_reset());
        *slot.write().expect("slot lock") = None;
        handle.await.expect("writer join");
        assert_eq!(publisher.frames.lock().expect("frames lock").len(), 1);
    }
}
