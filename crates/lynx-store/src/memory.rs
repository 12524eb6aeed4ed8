//! In-memory reference store used by tests and demos.
//!
//! Lock-guarded maps behind the store traits. A production deployment
//! supplies its own store; this one exists so the bus can be exercised
//! without a database.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use lynx_wire::{PropertyMap, RelationPairs};

use crate::{
    CacheListener, CachedRelation, EntityGroup, EntityStore, Origin, RelationListener, Result,
    StoreError,
};

type CacheListeners = Arc<RwLock<Vec<Arc<dyn CacheListener>>>>;
type RelationListeners = Arc<RwLock<Vec<Arc<dyn RelationListener>>>>;

/// Closure producing a relation's authoritative contents, consulted on
/// reset.
pub type RelationLoader = Box<dyn Fn() -> RelationPairs + Send + Sync>;

/// Derived-cache maintenance recorded by the store. The embedding
/// application wires real method-value caches here; the memory store keeps
/// a journal so tests can assert the calls happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodValueOp {
    Update { kind: String, id: u64 },
    Delete { kind: String, id: u64 },
}

/// In-memory [`EntityStore`] with registered groups and relations.
pub struct MemoryStore {
    groups: RwLock<HashMap<u64, Arc<MemoryGroup>>>,
    kinds: RwLock<HashMap<String, u64>>,
    relations: RwLock<HashMap<u64, Arc<MemoryRelation>>>,
    cache_listeners: CacheListeners,
    relation_listeners: RelationListeners,
    initialized: AtomicBool,
    expirations: Mutex<Vec<(String, u64, Origin)>>,
    method_value_ops: Mutex<Vec<MethodValueOp>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            kinds: RwLock::new(HashMap::new()),
            relations: RwLock::new(HashMap::new()),
            cache_listeners: Arc::new(RwLock::new(Vec::new())),
            relation_listeners: Arc::new(RwLock::new(Vec::new())),
            initialized: AtomicBool::new(false),
            expirations: Mutex::new(Vec::new()),
            method_value_ops: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_group(&self, group: MemoryGroup) -> Arc<MemoryGroup> {
        let group = Arc::new(group);
        self.kinds
            .write()
            .expect("kinds lock")
            .insert(group.kind.clone(), group.group_id);
        self.groups
            .write()
            .expect("groups lock")
            .insert(group.group_id, Arc::clone(&group));
        group
    }

    pub fn register_relation(&self, mut relation: MemoryRelation) -> Arc<MemoryRelation> {
        relation.listeners = Arc::clone(&self.relation_listeners);
        let relation = Arc::new(relation);
        self.relations
            .write()
            .expect("relations lock")
            .insert(relation.relation_id, Arc::clone(&relation));
        relation
    }

    pub fn add_cache_listener(&self, listener: Arc<dyn CacheListener>) {
        self.cache_listeners
            .write()
            .expect("cache listeners lock")
            .push(listener);
    }

    pub fn add_relation_listener(&self, listener: Arc<dyn RelationListener>) {
        self.relation_listeners
            .write()
            .expect("relation listeners lock")
            .push(listener);
    }

    /// Flip the store to initialized; the consumer drops inbound events
    /// until this happens.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Application-facing write: update the cached entity and notify
    /// listeners that it expired, with local origin so the change
    /// distributes.
    pub fn write_object(&self, kind: &str, id: u64, map: PropertyMap) -> Result<()> {
        let group = self
            .group_by_kind(kind)
            .ok_or_else(|| StoreError::UnknownKind(kind.to_string()))?;
        if group.contains(id) {
            group.update_from_map(id, &map);
            group.reorder(id);
        } else {
            group.insert_from_map(id, &map);
        }
        self.notify_object_expired(Origin::Local, kind, id);
        Ok(())
    }

    /// Application-facing delete: drop the cached entity and notify
    /// listeners of the removal.
    pub fn delete_object(&self, kind: &str, id: u64) -> Result<()> {
        let group = self
            .group_by_kind(kind)
            .ok_or_else(|| StoreError::UnknownKind(kind.to_string()))?;
        group.remove_from_cache(id);
        for listener in self.cache_listeners.read().expect("cache listeners lock").iter() {
            listener.remove_from_cache(kind, id);
        }
        Ok(())
    }

    /// Every expiration notification seen so far, with its origin.
    pub fn expirations(&self) -> Vec<(String, u64, Origin)> {
        self.expirations.lock().expect("expirations lock").clone()
    }

    /// Journal of derived-cache maintenance calls.
    pub fn method_value_ops(&self) -> Vec<MethodValueOp> {
        self.method_value_ops
            .lock()
            .expect("method value lock")
            .clone()
    }
}

impl EntityStore for MemoryStore {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn group_by_kind(&self, kind: &str) -> Option<Arc<dyn EntityGroup>> {
        let group_id = *self.kinds.read().expect("kinds lock").get(kind)?;
        self.group_by_id(group_id)
    }

    fn group_by_id(&self, group_id: u64) -> Option<Arc<dyn EntityGroup>> {
        let group = Arc::clone(self.groups.read().expect("groups lock").get(&group_id)?);
        Some(group)
    }

    fn relation(&self, relation_id: u64) -> Option<Arc<dyn CachedRelation>> {
        let relation = Arc::clone(
            self.relations
                .read()
                .expect("relations lock")
                .get(&relation_id)?,
        );
        Some(relation)
    }

    fn reset_all(&self, origin: Origin) {
        for group in self.groups.read().expect("groups lock").values() {
            group.reset();
        }
        if origin.broadcasts() {
            for listener in self.cache_listeners.read().expect("cache listeners lock").iter() {
                listener.cache_full_reset();
            }
        }
    }

    fn reset_group(&self, kind: &str, origin: Origin) -> Result<()> {
        let group = self
            .group_by_kind(kind)
            .ok_or_else(|| StoreError::UnknownKind(kind.to_string()))?;
        group.reset();
        if origin.broadcasts() {
            for listener in self.cache_listeners.read().expect("cache listeners lock").iter() {
                listener.cache_type_reset(kind);
            }
        }
        Ok(())
    }

    fn notify_object_expired(&self, origin: Origin, kind: &str, id: u64) {
        self.expirations
            .lock()
            .expect("expirations lock")
            .push((kind.to_string(), id, origin));
        if origin.broadcasts() {
            for listener in self.cache_listeners.read().expect("cache listeners lock").iter() {
                listener.cache_object_expired(kind, id);
            }
        }
    }

    fn method_value_cache_update(&self, kind: &str, id: u64) {
        debug!(kind, id, "method value cache update");
        self.method_value_ops
            .lock()
            .expect("method value lock")
            .push(MethodValueOp::Update {
                kind: kind.to_string(),
                id,
            });
    }

    fn method_value_cache_delete(&self, kind: &str, id: u64) {
        debug!(kind, id, "method value cache delete");
        self.method_value_ops
            .lock()
            .expect("method value lock")
            .push(MethodValueOp::Delete {
                kind: kind.to_string(),
                id,
            });
    }
}

/// In-memory entity group. Ordering is an id-sorted index re-applied by
/// [`EntityGroup::reorder`].
pub struct MemoryGroup {
    group_id: u64,
    kind: String,
    distribute: bool,
    caching: bool,
    entities: RwLock<BTreeMap<u64, PropertyMap>>,
    order: RwLock<Vec<u64>>,
    reorders: AtomicU64,
}

impl MemoryGroup {
    pub fn new(group_id: u64, kind: impl Into<String>) -> Self {
        Self {
            group_id,
            kind: kind.into(),
            distribute: true,
            caching: true,
            entities: RwLock::new(BTreeMap::new()),
            order: RwLock::new(Vec::new()),
            reorders: AtomicU64::new(0),
        }
    }

    /// Whether this group participates in cluster distribution.
    pub fn distributed(mut self, distribute: bool) -> Self {
        self.distribute = distribute;
        self
    }

    /// Whether this node caches the group at all.
    pub fn caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    /// How many times the ordering was re-applied.
    pub fn reorder_count(&self) -> u64 {
        self.reorders.load(Ordering::Relaxed)
    }

    /// Current ordering index.
    pub fn ordered_ids(&self) -> Vec<u64> {
        self.order.read().expect("order lock").clone()
    }
}

impl EntityGroup for MemoryGroup {
    fn group_id(&self) -> u64 {
        self.group_id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn distribute(&self) -> bool {
        self.distribute
    }

    fn is_caching(&self) -> bool {
        self.caching
    }

    fn write_map(&self, id: u64) -> Option<PropertyMap> {
        self.entities.read().expect("entities lock").get(&id).cloned()
    }

    fn contains(&self, id: u64) -> bool {
        self.entities.read().expect("entities lock").contains_key(&id)
    }

    fn insert_from_map(&self, id: u64, map: &PropertyMap) {
        self.entities
            .write()
            .expect("entities lock")
            .insert(id, map.clone());
        let mut order = self.order.write().expect("order lock");
        if let Err(position) = order.binary_search(&id) {
            order.insert(position, id);
        }
    }

    fn update_from_map(&self, id: u64, map: &PropertyMap) {
        if let Some(entity) = self.entities.write().expect("entities lock").get_mut(&id) {
            for (name, value) in map {
                entity.insert(name.clone(), value.clone());
            }
        }
    }

    fn reorder(&self, id: u64) {
        let mut order = self.order.write().expect("order lock");
        order.retain(|existing| *existing != id);
        if let Err(position) = order.binary_search(&id) {
            order.insert(position, id);
        }
        self.reorders.fetch_add(1, Ordering::Relaxed);
    }

    fn remove_from_cache(&self, id: u64) {
        self.entities.write().expect("entities lock").remove(&id);
        self.order
            .write()
            .expect("order lock")
            .retain(|existing| *existing != id);
    }

    fn reset(&self) {
        self.entities.write().expect("entities lock").clear();
        self.order.write().expect("order lock").clear();
    }
}

/// In-memory cached relation with an optional authoritative loader.
pub struct MemoryRelation {
    relation_id: u64,
    pairs: RwLock<BTreeSet<(u64, u64)>>,
    loader: Option<RelationLoader>,
    listeners: RelationListeners,
}

impl MemoryRelation {
    pub fn new(relation_id: u64) -> Self {
        Self {
            relation_id,
            pairs: RwLock::new(BTreeSet::new()),
            loader: None,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Attach the authoritative source consulted on reset.
    pub fn with_loader(mut self, loader: RelationLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    fn emit(&self, origin: Origin, notify: impl Fn(&dyn RelationListener)) {
        if !origin.broadcasts() {
            return;
        }
        for listener in self.listeners.read().expect("relation listeners lock").iter() {
            notify(listener.as_ref());
        }
    }
}

impl CachedRelation for MemoryRelation {
    fn relation_id(&self) -> u64 {
        self.relation_id
    }

    fn add(&self, left: u64, right: u64, origin: Origin) -> bool {
        let changed = self
            .pairs
            .write()
            .expect("pairs lock")
            .insert((left, right));
        if changed {
            self.emit(origin, |listener| {
                listener.add(self.relation_id, left, right)
            });
        }
        changed
    }

    fn add_all(&self, pairs: &RelationPairs, origin: Origin) -> bool {
        let mut changed = false;
        {
            let mut guard = self.pairs.write().expect("pairs lock");
            for pair in pairs.iter() {
                changed |= guard.insert(pair);
            }
        }
        if changed {
            self.emit(origin, |listener| listener.add_all(self.relation_id, pairs));
        }
        changed
    }

    fn clear(&self, origin: Origin) {
        let was_empty = {
            let mut guard = self.pairs.write().expect("pairs lock");
            let was_empty = guard.is_empty();
            guard.clear();
            was_empty
        };
        if !was_empty {
            self.emit(origin, |listener| listener.clear(self.relation_id));
        }
    }

    fn remove(&self, left: u64, right: u64, origin: Origin) -> bool {
        let changed = self
            .pairs
            .write()
            .expect("pairs lock")
            .remove(&(left, right));
        if changed {
            self.emit(origin, |listener| {
                listener.remove(self.relation_id, left, right)
            });
        }
        changed
    }

    fn remove_all(&self, pairs: &RelationPairs, origin: Origin) -> bool {
        let mut changed = false;
        {
            let mut guard = self.pairs.write().expect("pairs lock");
            for pair in pairs.iter() {
                changed |= guard.remove(&pair);
            }
        }
        if changed {
            self.emit(origin, |listener| {
                listener.remove_all(self.relation_id, pairs)
            });
        }
        changed
    }

    fn remove_left(&self, left: u64, origin: Origin) -> bool {
        let changed = {
            let mut guard = self.pairs.write().expect("pairs lock");
            let before = guard.len();
            guard.retain(|(existing, _)| *existing != left);
            guard.len() != before
        };
        if changed {
            self.emit(origin, |listener| {
                listener.remove_left_value(self.relation_id, left)
            });
        }
        changed
    }

    fn remove_right(&self, right: u64, origin: Origin) -> bool {
        let changed = {
            let mut guard = self.pairs.write().expect("pairs lock");
            let before = guard.len();
            guard.retain(|(_, existing)| *existing != right);
            guard.len() != before
        };
        if changed {
            self.emit(origin, |listener| {
                listener.remove_right_value(self.relation_id, right)
            });
        }
        changed
    }

    fn replace_all(&self, pairs: &RelationPairs, origin: Origin) -> bool {
        let replacement: BTreeSet<(u64, u64)> = pairs.iter().collect();
        let changed = {
            let mut guard = self.pairs.write().expect("pairs lock");
            let changed = *guard != replacement;
            *guard = replacement;
            changed
        };
        if changed {
            self.emit(origin, |listener| {
                listener.replace_all(self.relation_id, pairs)
            });
        }
        changed
    }

    fn reset(&self, origin: Origin) {
        {
            let mut guard = self.pairs.write().expect("pairs lock");
            *guard = match &self.loader {
                Some(loader) => loader().iter().collect(),
                None => BTreeSet::new(),
            };
        }
        self.emit(origin, |listener| listener.reset(self.relation_id));
    }

    fn len(&self) -> usize {
        self.pairs.read().expect("pairs lock").len()
    }

    fn is_empty(&self) -> bool {
        self.pairs.read().expect("pairs lock").is_empty()
    }

    fn pairs(&self) -> RelationPairs {
        self.pairs
            .read()
            .expect("pairs lock")
            .iter()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn push(&self, call: impl Into<String>) {
            self.calls.lock().expect("calls lock").push(call.into());
        }
    }

    impl CacheListener for RecordingListener {
        fn cache_full_reset(&self) {
            self.push("full_reset");
        }

        fn cache_type_reset(&self, kind: &str) {
            self.push(format!("type_reset:{kind}"));
        }

        fn cache_object_expired(&self, kind: &str, id: u64) {
            self.push(format!("expired:{kind}/{id}"));
        }

        fn remove_from_cache(&self, kind: &str, id: u64) {
            self.push(format!("remove:{kind}/{id}"));
        }
    }

    impl RelationListener for RecordingListener {
        fn add(&self, relation_id: u64, left: u64, right: u64) {
            self.push(format!("add:{relation_id}/{left}/{right}"));
        }

        fn add_all(&self, relation_id: u64, pairs: &RelationPairs) {
            self.push(format!("add_all:{relation_id}/{}", pairs.len()));
        }

        fn clear(&self, relation_id: u64) {
            self.push(format!("clear:{relation_id}"));
        }

        fn remove(&self, relation_id: u64, left: u64, right: u64) {
            self.push(format!("remove:{relation_id}/{left}/{right}"));
        }

        fn remove_all(&self, relation_id: u64, pairs: &RelationPairs) {
            self.push(format!("remove_all:{relation_id}/{}", pairs.len()));
        }

        fn remove_left_value(&self, relation_id: u64, left: u64) {
            self.push(format!("remove_left:{relation_id}/{left}"));
        }

        fn remove_right_value(&self, relation_id: u64, right: u64) {
            self.push(format!("remove_right:{relation_id}/{right}"));
        }

        fn replace_all(&self, relation_id: u64, pairs: &RelationPairs) {
            self.push(format!("replace_all:{relation_id}/{}", pairs.len()));
        }

        fn reset(&self, relation_id: u64) {
            self.push(format!("reset:{relation_id}"));
        }
    }

    fn props(name: &str) -> PropertyMap {
        let mut map = PropertyMap::new();
        map.insert("name".to_string(), serde_json::json!(name));
        map
    }

    #[test]
    fn write_object_notifies_local_expiration() {
        let store = MemoryStore::new();
        store.register_group(MemoryGroup::new(7, "user"));
        let listener = Arc::new(RecordingListener::default());
        store.add_cache_listener(Arc::clone(&listener) as Arc<dyn CacheListener>);

        store.write_object("user", 42, props("x")).expect("write");
        assert_eq!(listener.calls(), vec!["expired:user/42"]);
        assert_eq!(store.expirations().len(), 1);
    }

    #[test]
    fn remote_expiration_skips_cluster_listeners() {
        let store = MemoryStore::new();
        store.register_group(MemoryGroup::new(7, "user"));
        let listener = Arc::new(RecordingListener::default());
        store.add_cache_listener(Arc::clone(&listener) as Arc<dyn CacheListener>);

        store.notify_object_expired(Origin::Remote, "user", 42);
        assert!(listener.calls().is_empty());
        assert_eq!(store.expirations(), vec![("user".to_string(), 42, Origin::Remote)]);
    }

    #[test]
    fn reset_group_gates_on_origin() {
        let store = MemoryStore::new();
        let group = store.register_group(MemoryGroup::new(7, "user"));
        group.insert_from_map(1, &props("a"));
        let listener = Arc::new(RecordingListener::default());
        store.add_cache_listener(Arc::clone(&listener) as Arc<dyn CacheListener>);

        store.reset_group("user", Origin::Remote).expect("reset");
        assert!(!group.contains(1));
        assert!(listener.calls().is_empty());

        store.reset_group("user", Origin::Local).expect("reset");
        assert_eq!(listener.calls(), vec!["type_reset:user"]);
    }

    #[test]
    fn relation_mutations_gate_on_origin() {
        let store = MemoryStore::new();
        let relation = store.register_relation(MemoryRelation::new(3));
        let listener = Arc::new(RecordingListener::default());
        store.add_relation_listener(Arc::clone(&listener) as Arc<dyn RelationListener>);

        assert!(relation.add(1, 2, Origin::Remote));
        assert!(listener.calls().is_empty());

        assert!(relation.add(3, 4, Origin::Local));
        assert_eq!(listener.calls(), vec!["add:3/3/4"]);

        // Re-adding an existing pair changes nothing and stays silent.
        assert!(!relation.add(3, 4, Origin::Local));
        assert_eq!(listener.calls().len(), 1);
    }

    #[test]
    fn relation_reset_uses_loader() {
        let relation = MemoryRelation::new(3)
            .with_loader(Box::new(|| RelationPairs::new(vec![(10, 20), (30, 40)])));
        relation.add(1, 2, Origin::Remote);
        relation.reset(Origin::Remote);
        assert_eq!(relation.pairs(), RelationPairs::new(vec![(10, 20), (30, 40)]));
    }

    #[test]
    fn remove_left_and_right_strip_matching_pairs() {
        let relation = MemoryRelation::new(3);
        relation.add_all(
            &RelationPairs::new(vec![(1, 2), (1, 3), (2, 3)]),
            Origin::Remote,
        );
        assert!(relation.remove_left(1, Origin::Remote));
        assert_eq!(relation.pairs(), RelationPairs::new(vec![(2, 3)]));
        assert!(relation.remove_right(3, Origin::Remote));
        assert!(relation.is_empty());
        assert!(!relation.remove_left(9, Origin::Remote));
    }

    #[test]
    fn group_ordering_follows_reorder() {
        let group = MemoryGroup::new(7, "user");
        group.insert_from_map(5, &props("e"));
        group.insert_from_map(2, &props("b"));
        group.insert_from_map(9, &props("i"));
        assert_eq!(group.ordered_ids(), vec![2, 5, 9]);

        group.update_from_map(5, &props("changed"));
        group.reorder(5);
        assert_eq!(group.ordered_ids(), vec![2, 5, 9]);
        assert_eq!(group.reorder_count(), 1);

        group.remove_from_cache(2);
        assert_eq!(group.ordered_ids(), vec![5, 9]);
    }

    #[test]
    fn update_from_map_merges_attributes() {
        let group = MemoryGroup::new(7, "user");
        let mut initial = props("a");
        initial.insert("age".to_string(), serde_json::json!(30));
        group.insert_from_map(1, &initial);
        group.update_from_map(1, &props("b"));
        let merged = group.write_map(1).expect("entity");
        assert_eq!(merged["name"], serde_json::json!("b"));
        assert_eq!(merged["age"], serde_json::json!(30));
    }

    #[test]
    fn store_starts_uninitialized() {
        let store = MemoryStore::new();
        assert!(!store.is_initialized());
        store.mark_initialized();
        assert!(store.is_initialized());
    }

    #[test]
    fn method_value_journal_records_ops() {
        let store = MemoryStore::new();
        store.method_value_cache_update("user", 1);
        store.method_value_cache_delete("user", 2);
        assert_eq!(
            store.method_value_ops(),
            vec![
                MethodValueOp::Update {
                    kind: "user".to_string(),
                    id: 1,
                },
                MethodValueOp::Delete {
                    kind: "user".to_string(),
                    id: 2,
                },
            ]
        );
    }
}
