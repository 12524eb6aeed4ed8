//! Listener surface the local store drives.
//!
//! # Purpose
//! Maps each store notification onto one broadcast event and hands it to
//! the publish worker. This is the only producer of outgoing events.
//!
//! # Design notes
//! A full cache reset is deliberately never distributed: every instance
//! would hit the database at once rebuilding its caches. Bulk relation
//! events run through a [`CollapsePolicy`] so oversized payloads turn into
//! a reset instead of a megabyte of pairs on the topic.
use std::sync::Arc;
use tracing::info;

use lynx_store::{CacheListener, EntityGroup, EntityStore, RelationListener};
use lynx_wire::{BroadcastMessage, CacheEvent, RelationEvent, RelationPairs};

use crate::publisher::{self, PublisherSlot};

/// Decides when a bulk relation payload is too large to ship as itself.
pub trait CollapsePolicy: Send + Sync {
    fn should_collapse(&self, pair_count: usize) -> bool;
}

/// Collapse payloads strictly larger than the configured size.
pub struct SizeThreshold(pub usize);

impl CollapsePolicy for SizeThreshold {
    fn should_collapse(&self, pair_count: usize) -> bool {
        pair_count > self.0
    }
}

/// The bus side of the store's listener registration.
pub struct BusListener {
    store: Arc<dyn EntityStore>,
    slot: PublisherSlot,
    collapse: Arc<dyn CollapsePolicy>,
}

impl BusListener {
    pub(crate) fn new(
        store: Arc<dyn EntityStore>,
        slot: PublisherSlot,
        collapse: Arc<dyn CollapsePolicy>,
    ) -> Self {
        Self {
            store,
            slot,
            collapse,
        }
    }

    fn send(&self, message: BroadcastMessage) {
        publisher::enqueue(&self.slot, message);
    }

    /// Look up a group and apply the distribution gate. Non-distributed
    /// groups are local-only caches and produce nothing.
    fn distributed_group(&self, kind: &str) -> Option<Arc<dyn EntityGroup>> {
        let Some(group) = self.store.group_by_kind(kind) else {
            info!(kind, "no entity group for kind; dropping notification");
            return None;
        };
        if !group.distribute() {
            return None;
        }
        Some(group)
    }
}

impl CacheListener for BusListener {
    fn cache_full_reset(&self) {
        // Disabled on the wire: a cluster-wide reset stampedes the database.
        info!("distributing a full cache reset is disabled");
    }

    fn cache_type_reset(&self, kind: &str) {
        let Some(group) = self.distributed_group(kind) else {
            return;
        };
        info!(kind, "sending 'cache type reset'");
        self.send(BroadcastMessage::Cache(CacheEvent::GroupReset {
            group_id: group.group_id(),
        }));
    }

    fn cache_object_expired(&self, kind: &str, id: u64) {
        let Some(group) = self.distributed_group(kind) else {
            return;
        };
        // The entity can be gone already if it was removed between the
        // store's update and this callback. Send nothing: the removal
        // notification carries the truth.
        let Some(properties) = group.write_map(id) else {
            return;
        };
        info!(kind, id, "sending 'cache object expired'");
        self.send(BroadcastMessage::Cache(CacheEvent::ObjectReset {
            group_id: group.group_id(),
            object_id: id,
            properties,
        }));
    }

    fn remove_from_cache(&self, kind: &str, id: u64) {
        let Some(group) = self.distributed_group(kind) else {
            return;
        };
        info!(kind, id, "sending 'remove from cache'");
        self.send(BroadcastMessage::Cache(CacheEvent::ObjectRemove {
            group_id: group.group_id(),
            object_id: id,
        }));
    }
}

impl RelationListener for BusListener {
    fn add(&self, relation_id: u64, left: u64, right: u64) {
        info!(relation_id, left, right, "sending 'rel add'");
        self.send(BroadcastMessage::Relation(RelationEvent::Add {
            relation_id,
            left_id: left,
            right_id: right,
        }));
    }

    fn add_all(&self, relation_id: u64, pairs: &RelationPairs) {
        if self.collapse.should_collapse(pairs.len()) {
            self.reset(relation_id);
        } else {
            info!(relation_id, "sending 'rel add all'");
            self.send(BroadcastMessage::Relation(RelationEvent::AddAll {
                relation_id,
                pairs: pairs.clone(),
            }));
        }
    }

    fn clear(&self, relation_id: u64) {
        info!(relation_id, "sending 'rel clear'");
        self.send(BroadcastMessage::Relation(RelationEvent::Clear {
            relation_id,
        }));
    }

    fn remove(&self, relation_id: u64, left: u64, right: u64) {
        info!(relation_id, left, right, "sending 'rel remove'");
        self.send(BroadcastMessage::Relation(RelationEvent::Remove {
            relation_id,
            left_id: left,
            right_id: right,
        }));
    }

    fn remove_all(&self, relation_id: u64, pairs: &RelationPairs) {
        if self.collapse.should_collapse(pairs.len()) {
            self.reset(relation_id);
        } else {
            info!(relation_id, "sending 'rel remove all'");
            self.send(BroadcastMessage::Relation(RelationEvent::RemoveAll {
                relation_id,
                pairs: pairs.clone(),
            }));
        }
    }

    fn remove_left_value(&self, relation_id: u64, left: u64) {
        info!(relation_id, left, "sending 'rel remove left'");
        self.send(BroadcastMessage::Relation(RelationEvent::RemoveLeft {
            relation_id,
            left_id: left,
        }));
    }

    fn remove_right_value(&self, relation_id: u64, right: u64) {
        info!(relation_id, right, "sending 'rel remove right'");
        self.send(BroadcastMessage::Relation(RelationEvent::RemoveRight {
            relation_id,
            right_id: right,
        }));
    }

    fn replace_all(&self, relation_id: u64, pairs: &RelationPairs) {
        if self.collapse.should_collapse(pairs.len()) {
            self.reset(relation_id);
        } else {
            info!(relation_id, "sending 'rel replace all'");
            self.send(BroadcastMessage::Relation(RelationEvent::ReplaceAll {
                relation_id,
                pairs: pairs.clone(),
            }));
        }
    }

    fn reset(&self, relation_id: u64) {
        info!(relation_id, "sending 'rel reset'");
        self.send(BroadcastMessage::Relation(RelationEvent::Reset {
            relation_id,
        }));
    }
}
