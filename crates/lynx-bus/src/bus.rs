//! Lifecycle controller for the cache bus.
//!
//! # Purpose
//! Owns the publish and subscribe endpoints: configure, connect (also used
//! for reconnection), close. Connecting records the broker-assigned
//! instance identifier that both the publisher adapter and the suppression
//! filter key on.
//!
//! # Design notes
//! Reconnection swaps the publish queue and spawns a fresh consumer in one
//! step, so there is no window where events stamped with the old identifier
//! race a filter holding the new one: each consumer epoch carries the
//! identifier it was born with.
use anyhow::{Context, Result, bail};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::info;

use lynx_broker::{Broker, TopicPublisher};
use lynx_store::EntityStore;

use crate::config::BusConfig;
use crate::consumer;
use crate::listener::{BusListener, CollapsePolicy, SizeThreshold};
use crate::publisher::{self, PublisherSlot};
use crate::stats::StatsRegistry;

/// The single pub/sub destination all nodes share.
pub const CACHE_TOPIC: &str = "CACHE.TOPIC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unconfigured,
    Configured,
    Connected,
    Closed,
}

struct Endpoints {
    shutdown: watch::Sender<bool>,
    consumer: tokio::task::JoinHandle<()>,
    publisher: tokio::task::JoinHandle<()>,
    instance_id: String,
}

/// Keeps per-node caches coherent by broadcasting local mutations and
/// applying remote ones.
pub struct CacheBus {
    store: Arc<dyn EntityStore>,
    broker: Arc<Broker>,
    config: RwLock<BusConfig>,
    state: Mutex<Lifecycle>,
    slot: PublisherSlot,
    listener: RwLock<Option<Arc<BusListener>>>,
    endpoints: Mutex<Option<Endpoints>>,
}

impl CacheBus {
    pub fn new(store: Arc<dyn EntityStore>, broker: Arc<Broker>) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            config: RwLock::new(BusConfig::default()),
            state: Mutex::new(Lifecycle::Unconfigured),
            slot: publisher::new_slot(),
            listener: RwLock::new(None),
            endpoints: Mutex::new(None),
        })
    }

    /// Apply configuration and build the listener surface with the default
    /// size-threshold collapse policy.
    pub fn configure(&self, config: BusConfig) {
        let collapse = Arc::new(SizeThreshold(config.maximum_relation_size));
        self.configure_with_collapse(config, collapse);
    }

    /// Apply configuration with a caller-chosen collapse policy.
    pub fn configure_with_collapse(&self, config: BusConfig, collapse: Arc<dyn CollapsePolicy>) {
        info!(
            maximum_relation_size = config.maximum_relation_size,
            delivery_mode = ?config.delivery_mode,
            stats_period_minutes = config.stats_period_minutes,
            stats_log_max_threshold_ms = config.stats_log_max_threshold_ms,
            "cache bus configured"
        );
        *self.listener.write().expect("listener lock") = Some(Arc::new(BusListener::new(
            Arc::clone(&self.store),
            Arc::clone(&self.slot),
            collapse,
        )));
        *self.config.write().expect("config lock") = config;
        let mut state = self.state.lock().expect("state lock");
        if *state == Lifecycle::Unconfigured {
            *state = Lifecycle::Configured;
        }
    }

    /// The listener surface to register with the local store for both cache
    /// and relation notifications.
    pub fn handle(&self) -> Result<Arc<BusListener>> {
        self.listener
            .read()
            .expect("listener lock")
            .clone()
            .context("cache bus is not configured")
    }

    /// Start the publisher and subscriber. Alias for the first [`connect`].
    ///
    /// [`connect`]: CacheBus::connect
    pub async fn start(&self) -> Result<()> {
        self.connect().await
    }

    /// Open (or reopen) both endpoints. Usable for reconnection: existing
    /// endpoints are closed first and the instance identifier is re-read
    /// from the new publish connection.
    pub async fn connect(&self) -> Result<()> {
        {
            let state = self.state.lock().expect("state lock");
            if *state == Lifecycle::Unconfigured {
                bail!("cache bus must be configured before connecting");
            }
        }
        let config = self.config.read().expect("config lock").clone();

        // Close any existing endpoints before opening new ones.
        self.teardown();

        // Publish connection: the broker assigns our instance identifier.
        let publish_conn = self.broker.connect();
        let instance_id = publish_conn.client_id().to_string();
        let topic_sender = publish_conn
            .topic_publisher(CACHE_TOPIC, config.delivery_mode)
            .await;
        let (publish_tx, publisher_task) = publisher::spawn_publisher_writer(
            Arc::new(topic_sender) as Arc<dyn TopicPublisher>,
            instance_id.clone(),
        );
        *self.slot.write().expect("publisher slot lock") = Some(publish_tx);
        info!(instance_id = %instance_id, "cache bus publish connection established");

        // Subscribe connection, with its own identity like any other peer.
        let subscribe_conn = self.broker.connect();
        let receiver = subscribe_conn.subscribe(CACHE_TOPIC).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = StatsRegistry::new(
            config.stats_period_minutes,
            config.stats_log_max_threshold_ms,
        );
        let consumer_task = tokio::spawn(consumer::run_consumer(
            receiver,
            shutdown_rx,
            Arc::clone(&self.store),
            instance_id.clone(),
            stats,
        ));
        info!(
            subscriber_id = %subscribe_conn.client_id(),
            "cache bus subscribe connection established"
        );

        *self.endpoints.lock().expect("endpoints lock") = Some(Endpoints {
            shutdown: shutdown_tx,
            consumer: consumer_task,
            publisher: publisher_task,
            instance_id,
        });
        *self.state.lock().expect("state lock") = Lifecycle::Connected;
        Ok(())
    }

    /// The instance identifier of the current connection epoch, if any.
    pub fn instance_id(&self) -> Option<String> {
        self.endpoints
            .lock()
            .expect("endpoints lock")
            .as_ref()
            .map(|endpoints| endpoints.instance_id.clone())
    }

    /// Shut down both endpoints. In-flight message handling completes;
    /// anything arriving afterwards is ignored.
    pub fn close(&self) {
        info!("cache bus closing");
        self.teardown();
        *self.state.lock().expect("state lock") = Lifecycle::Closed;
    }

    fn teardown(&self) {
        // Dropping the publish queue ends the writer after it drains;
        // the consumer leaves at its next await point.
        *self.slot.write().expect("publisher slot lock") = None;
        if let Some(endpoints) = self.endpoints.lock().expect("endpoints lock").take() {
            let _ = endpoints.shutdown.send(true);
            drop(endpoints.consumer);
            drop(endpoints.publisher);
        }
    }
}

impl Drop for CacheBus {
    fn drop(&mut self) {
        self.teardown();
    }
}
