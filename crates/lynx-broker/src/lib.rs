// In-process pub/sub broker for cache coherence topics.
// Topics auto-create on first use; every connection gets a broker-assigned
// client identifier that lives until the connection is dropped.
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("topic capacity too large")]
    CapacityTooLarge,
    #[error("transport failure: {0}")]
    Transport(String),
}

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Delivery mode requested for a topic publisher. The in-process broker
/// treats both the same; networked brokers map this onto their own notion
/// of persistent delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Persistent,
    NonPersistent,
}

/// Seam between the bus and whatever carries its frames. Production code
/// uses [`TopicSender`]; tests inject failing transports.
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    /// Publish one frame, returning how many subscribers received it.
    async fn publish(&self, payload: Bytes) -> Result<usize>;
}

#[derive(Debug)]
struct TopicState {
    // Broadcast channel for live subscribers; lagging receivers drop.
    sender: broadcast::Sender<Bytes>,
}

impl TopicState {
    fn new(capacity: usize) -> Self {
        // The initial receiver is discarded; subscribers attach through
        // the sender.
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

/// In-process broker for pub/sub messaging between co-resident nodes.
///
/// ```
/// use bytes::Bytes;
/// use lynx_broker::{Broker, DeliveryMode, TopicPublisher};
///
/// let broker = Broker::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let publisher_conn = broker.connect();
///     let subscriber_conn = broker.connect();
///     let mut sub = subscriber_conn.subscribe("CACHE.TOPIC").await;
///     let publisher = publisher_conn
///         .topic_publisher("CACHE.TOPIC", DeliveryMode::Persistent)
///         .await;
///     publisher
///         .publish(Bytes::from_static(b"payload"))
///         .await
///         .expect("publish");
///     assert_eq!(sub.recv().await.expect("recv"), Bytes::from_static(b"payload"));
/// });
/// ```
#[derive(Debug)]
pub struct Broker {
    // Map of topic name -> broadcast state.
    topics: RwLock<HashMap<String, Arc<TopicState>>>,
    // Source of connection-scoped client identifiers.
    next_client: AtomicU64,
    // Broadcast channel capacity for each topic.
    topic_capacity: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
        }
    }
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_topic_capacity(capacity: usize) -> Result<Arc<Self>> {
        if capacity == 0 {
            return Err(BrokerError::CapacityTooLarge);
        }
        Ok(Arc::new(Self {
            topic_capacity: capacity,
            ..Self::default()
        }))
    }

    /// Open a connection, assigning it a fresh client identifier. The
    /// identifier is opaque to callers and unique for the broker's lifetime.
    pub fn connect(self: &Arc<Self>) -> Connection {
        let serial = self.next_client.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("lynx-{serial:08x}");
        debug!(client_id = %client_id, "broker connection opened");
        Connection {
            broker: Arc::clone(self),
            client_id,
        }
    }

    async fn topic_state(&self, topic: &str) -> Arc<TopicState> {
        if let Some(state) = self.topics.read().await.get(topic) {
            return Arc::clone(state);
        }
        let mut guard = self.topics.write().await;
        Arc::clone(
            guard
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(TopicState::new(self.topic_capacity))),
        )
    }
}

/// A connection to the broker. Holds the client identifier that outgoing
/// envelopes are stamped with.
#[derive(Debug, Clone)]
pub struct Connection {
    broker: Arc<Broker>,
    client_id: String,
}

impl Connection {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Create a publisher handle bound to one topic.
    pub async fn topic_publisher(&self, topic: &str, mode: DeliveryMode) -> TopicSender {
        TopicSender {
            state: self.broker.topic_state(topic).await,
            mode,
        }
    }

    /// Attach a live subscription to one topic.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Bytes> {
        self.broker.topic_state(topic).await.sender.subscribe()
    }
}

/// Publisher handle for a single topic.
#[derive(Debug, Clone)]
pub struct TopicSender {
    state: Arc<TopicState>,
    mode: DeliveryMode,
}

impl TopicSender {
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.mode
    }
}

#[async_trait]
impl TopicPublisher for TopicSender {
    async fn publish(&self, payload: Bytes) -> Result<usize> {
        // Zero receivers is not an error; the payload simply had no audience.
        Ok(self.state.sender.send(payload).unwrap_or(0))
    }
}
