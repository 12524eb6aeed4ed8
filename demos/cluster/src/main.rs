//! Two-node cache coherence demo.
//!
//! # Purpose
//! Boots an in-process broker and two nodes with independent stores, then
//! shows an entity update, a removal, and a relation rebuild converging
//! across the cluster.
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use lynx_broker::Broker;
use lynx_bus::{BusConfig, CacheBus};
use lynx_store::{
    CacheListener, CachedRelation, EntityGroup, EntityStore, MemoryGroup, MemoryRelation,
    MemoryStore, Origin, RelationListener,
};
use lynx_wire::{PropertyMap, RelationPairs};

const USER_GROUP: u64 = 7;
const MEMBERSHIP_RELATION: u64 = 3;

struct Node {
    name: &'static str,
    store: Arc<MemoryStore>,
    bus: Arc<CacheBus>,
}

async fn spawn_node(name: &'static str, broker: &Arc<Broker>) -> Result<Node> {
    let store = MemoryStore::new();
    store.register_group(MemoryGroup::new(USER_GROUP, "user"));
    store.register_relation(MemoryRelation::new(MEMBERSHIP_RELATION).with_loader(Box::new(
        || RelationPairs::new(vec![(1, 100), (2, 100), (3, 200)]),
    )));
    store.mark_initialized();

    let bus = CacheBus::new(
        Arc::clone(&store) as Arc<dyn EntityStore>,
        Arc::clone(broker),
    );
    bus.configure(BusConfig::from_env_or_yaml(None)?);
    let handle = bus.handle()?;
    store.add_cache_listener(Arc::clone(&handle) as Arc<dyn CacheListener>);
    store.add_relation_listener(handle as Arc<dyn RelationListener>);
    bus.start().await?;
    println!(
        "node {name} connected as {}",
        bus.instance_id().unwrap_or_default()
    );
    Ok(Node { name, store, bus })
}

fn props(name: &str) -> PropertyMap {
    let mut map = PropertyMap::new();
    map.insert("name".to_string(), serde_json::json!(name));
    map
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(2) {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("== Lynx cache coherence demo ==");
    println!("Step 1/4: booting in-process broker and two nodes.");
    let broker = Broker::new();
    let alpha = spawn_node("alpha", &broker).await?;
    let beta = spawn_node("beta", &broker).await?;

    println!("Step 2/4: updating entity 42 on {}.", alpha.name);
    alpha.store.write_object("user", 42, props("ada"))?;
    let group_beta = beta.store.group_by_id(USER_GROUP).expect("beta group");
    if wait_until(|| group_beta.contains(42)).await {
        println!(
            "node {} now caches entity 42: {:?}",
            beta.name,
            group_beta.write_map(42).expect("entity")
        );
    } else {
        println!("entity 42 did not propagate in time");
    }

    println!("Step 3/4: rebuilding the membership relation from {}.", alpha.name);
    let relation_alpha = alpha
        .store
        .relation(MEMBERSHIP_RELATION)
        .expect("alpha relation");
    relation_alpha.reset(Origin::Local);
    let relation_beta = beta
        .store
        .relation(MEMBERSHIP_RELATION)
        .expect("beta relation");
    if wait_until(|| relation_beta.len() == 3).await {
        println!(
            "node {} rebuilt the relation: {:?}",
            beta.name,
            relation_beta.pairs()
        );
    } else {
        println!("relation did not propagate in time");
    }

    println!("Step 4/4: removing entity 42 on {}.", alpha.name);
    alpha.store.delete_object("user", 42)?;
    if wait_until(|| !group_beta.contains(42)).await {
        println!("node {} dropped entity 42", beta.name);
    } else {
        println!("removal did not propagate in time");
    }

    alpha.bus.close();
    beta.bus.close();
    println!("Demo complete.");
    Ok(())
}
