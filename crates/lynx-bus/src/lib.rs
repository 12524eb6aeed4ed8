//! Distributed cache-coherence bus.
//!
//! Keeps per-node, in-memory caches of typed entities and relations
//! consistent across a cluster by broadcasting mutation events on a shared
//! topic. Each node publishes its local mutations and applies remote ones
//! with remote origin, so nothing it hears is ever re-broadcast. A
//! per-group latency aggregator logs periodic summaries for diagnosing
//! propagation delays.
//!
//! ```no_run
//! use lynx_broker::Broker;
//! use lynx_bus::{BusConfig, CacheBus};
//! use lynx_store::{CacheListener, EntityStore, MemoryStore, RelationListener};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let broker = Broker::new();
//! let store = MemoryStore::new();
//! let bus = CacheBus::new(Arc::clone(&store) as Arc<dyn EntityStore>, broker);
//! bus.configure(BusConfig::from_env_or_yaml(None)?);
//! let handle = bus.handle()?;
//! store.add_cache_listener(Arc::clone(&handle) as Arc<dyn CacheListener>);
//! store.add_relation_listener(handle as Arc<dyn RelationListener>);
//! bus.start().await?;
//! # Ok(())
//! # }
//! ```
pub mod bus;
pub mod config;
pub mod listener;
pub mod stats;

mod consumer;
mod publisher;

pub use bus::{CACHE_TOPIC, CacheBus};
pub use config::BusConfig;
pub use listener::{BusListener, CollapsePolicy, SizeThreshold};
pub use stats::{KeySummary, OverallSummary, StatsKey, StatsRegistry, StatsReport};
