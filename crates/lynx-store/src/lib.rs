//! Contracts of the local entity/relation store that the cache bus keeps
//! coherent across the cluster.
//!
//! # Purpose
//! The bus never owns entities; it mutates a store owned by the embedding
//! application. These traits are that seam: group and relation handles for
//! the consumer side, listener surfaces for the publish side, and the
//! [`Origin`] token that keeps the two from feeding back into each other.
//!
//! # Design notes
//! Every mutation carries an [`Origin`]. The store dispatches cluster
//! listeners only for `Origin::Local`, so applying a remote event can never
//! re-broadcast it. This replaces per-call broadcast/persist flag triples
//! with one value whose meaning is fixed at the seam.
use std::sync::Arc;

use lynx_wire::{PropertyMap, RelationPairs};

pub mod memory;

pub use memory::{MemoryGroup, MemoryRelation, MemoryStore, MethodValueOp};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("unknown entity group {0}")]
    UnknownGroup(u64),
    #[error("unknown entity kind {0:?}")]
    UnknownKind(String),
    #[error("unknown relation {0}")]
    UnknownRelation(u64),
}

/// Where a mutation originated.
///
/// Local mutations fan out to cluster listeners; remote ones must not, or
/// every node would re-broadcast everything it hears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    /// Whether mutations with this origin reach cluster listeners.
    pub fn broadcasts(self) -> bool {
        matches!(self, Origin::Local)
    }
}

/// The local store as seen by the bus.
pub trait EntityStore: Send + Sync {
    /// Whether the store has finished its initial load. Inbound events that
    /// arrive earlier are dropped by the consumer.
    fn is_initialized(&self) -> bool;

    fn group_by_kind(&self, kind: &str) -> Option<Arc<dyn EntityGroup>>;

    fn group_by_id(&self, group_id: u64) -> Option<Arc<dyn EntityGroup>>;

    fn relation(&self, relation_id: u64) -> Option<Arc<dyn CachedRelation>>;

    /// Reset every group's cache.
    fn reset_all(&self, origin: Origin);

    /// Reset one group's cache by kind.
    fn reset_group(&self, kind: &str, origin: Origin) -> Result<()>;

    /// Tell listeners an entity's cached state changed. Cluster listeners
    /// only hear about local-origin changes.
    fn notify_object_expired(&self, origin: Origin, kind: &str, id: u64);

    /// Refresh derived method-value cache entries for one entity.
    fn method_value_cache_update(&self, kind: &str, id: u64);

    /// Drop derived method-value cache entries for one entity.
    fn method_value_cache_delete(&self, kind: &str, id: u64);
}

/// One typed entity group inside the store.
///
/// Groups that report `is_caching() == false` still participate in the
/// cluster (a peer may cache what this node does not); they accept and
/// ignore cache mutations.
pub trait EntityGroup: Send + Sync {
    fn group_id(&self) -> u64;

    fn kind(&self) -> &str;

    /// Whether this group wants cluster-wide coherence. Non-distributed
    /// groups are local-only caches and never produce events.
    fn distribute(&self) -> bool;

    fn is_caching(&self) -> bool;

    /// Serialize the live entity's full attribute map, or `None` when the
    /// entity is gone (it may have been removed between the update and the
    /// listener callback).
    fn write_map(&self, id: u64) -> Option<PropertyMap>;

    fn contains(&self, id: u64) -> bool;

    /// Construct a new cached entity from its serialized state.
    fn insert_from_map(&self, id: u64, map: &PropertyMap);

    /// Update an existing cached entity's attributes from serialized state.
    fn update_from_map(&self, id: u64, map: &PropertyMap);

    /// Re-apply the group's ordering after an entity changed.
    fn reorder(&self, id: u64);

    fn remove_from_cache(&self, id: u64);

    /// Drop all cached entities for this group.
    fn reset(&self);
}

/// One cached many-to-many relation inside the store.
///
/// Mutations return whether they changed anything; unchanged mutations do
/// not reach listeners.
pub trait CachedRelation: Send + Sync {
    fn relation_id(&self) -> u64;

    fn add(&self, left: u64, right: u64, origin: Origin) -> bool;

    fn add_all(&self, pairs: &RelationPairs, origin: Origin) -> bool;

    fn clear(&self, origin: Origin);

    fn remove(&self, left: u64, right: u64, origin: Origin) -> bool;

    fn remove_all(&self, pairs: &RelationPairs, origin: Origin) -> bool;

    fn remove_left(&self, left: u64, origin: Origin) -> bool;

    fn remove_right(&self, right: u64, origin: Origin) -> bool;

    fn replace_all(&self, pairs: &RelationPairs, origin: Origin) -> bool;

    /// Rebuild the relation from its authoritative source.
    fn reset(&self, origin: Origin);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool;

    /// Snapshot of the current pairs, in stable order.
    fn pairs(&self) -> RelationPairs;
}

/// Cluster-facing entity cache notifications. The bus implements this and
/// registers it with the store; the store invokes it for local-origin
/// mutations only.
pub trait CacheListener: Send + Sync {
    fn cache_full_reset(&self);

    fn cache_type_reset(&self, kind: &str);

    fn cache_object_expired(&self, kind: &str, id: u64);

    fn remove_from_cache(&self, kind: &str, id: u64);
}

/// Cluster-facing relation notifications, mirrored from [`CachedRelation`].
pub trait RelationListener: Send + Sync {
    fn add(&self, relation_id: u64, left: u64, right: u64);

    fn add_all(&self, relation_id: u64, pairs: &RelationPairs);

    fn clear(&self, relation_id: u64);

    fn remove(&self, relation_id: u64, left: u64, right: u64);

    fn remove_all(&self, relation_id: u64, pairs: &RelationPairs);

    fn remove_left_value(&self, relation_id: u64, left: u64);

    fn remove_right_value(&self, relation_id: u64, right: u64);

    fn replace_all(&self, relation_id: u64, pairs: &RelationPairs);

    fn reset(&self, relation_id: u64);
}
