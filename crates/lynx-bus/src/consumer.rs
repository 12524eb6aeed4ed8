//! Inbound path: suppression filter plus the consumer state machine.
//!
//! # Purpose
//! Receives every frame on the cache topic, discards echoes of this node's
//! own events, and applies remote mutations to the local store with remote
//! origin so nothing is re-broadcast.
//!
//! # Design notes
//! One message is handled at a time inside a single task; that contract is
//! what lets the statistics registry live here without locks. Nothing in
//! this module is allowed to kill the task: malformed frames, unknown ids
//! and application errors are logged and dropped.
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use lynx_store::{CachedRelation, EntityGroup, EntityStore, Origin};
use lynx_wire::{BroadcastMessage, CacheEvent, Envelope, Error as WireError, RelationEvent};

use crate::publisher::now_ms;
use crate::stats::{self, StatsKey, StatsRegistry};

pub(crate) async fn run_consumer(
    mut rx: broadcast::Receiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    store: Arc<dyn EntityStore>,
    instance_id: String,
    mut stats: StatsRegistry,
) {
    debug!(instance_id = %instance_id, "cache topic consumer started");
    loop {
        let payload = tokio::select! {
            // Shutdown wins over queued traffic so close() is prompt.
            biased;
            _ = shutdown.changed() => break,
            received = rx.recv() => match received {
                Ok(payload) => payload,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "cache topic subscriber lagged; events lost");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        handle_frame(&store, &instance_id, &mut stats, payload);
    }
    debug!(instance_id = %instance_id, "cache topic consumer exited");
}

/// Process one inbound frame end to end. Never panics, never propagates.
fn handle_frame(
    store: &Arc<dyn EntityStore>,
    instance_id: &str,
    stats: &mut StatsRegistry,
    payload: Bytes,
) {
    metrics::counter!("lynx_bus_frames_in_total").increment(1);
    if !store.is_initialized() {
        // The peer will re-emit on its next mutation, or this cache loads
        // cold on demand.
        debug!("store not yet initialized; ignoring cache message");
        return;
    }

    let received_wall_ms = now_ms();
    let receive_start = Instant::now();

    let envelope = match Envelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(err @ WireError::Payload(_)) => {
            // Possibly an action this build does not know; the peer may be
            // running a newer schema.
            metrics::counter!("lynx_bus_decode_errors_total").increment(1);
            warn!(error = %err, "undecodable broadcast payload; dropping");
            return;
        }
        Err(err) => {
            metrics::counter!("lynx_bus_decode_errors_total").increment(1);
            info!(error = %err, "non-broadcast frame on cache topic; dropping");
            return;
        }
    };

    let sender = match envelope.sender_id.as_deref() {
        Some(sender) if !sender.is_empty() => sender,
        _ => {
            info!("broadcast message without sender identifier; dropping");
            return;
        }
    };
    if sender == instance_id {
        // Self-echo: the broker cannot filter our own publications off the
        // topic. Hot path, so no log line.
        metrics::counter!("lynx_bus_self_echo_total").increment(1);
        return;
    }

    let key = stats_key(&envelope.message);
    if let Err(err) = apply(store, &envelope.message) {
        error!(error = %err, event = ?envelope.message, "failed to apply remote cache event");
        return;
    }
    metrics::counter!("lynx_bus_events_applied_total").increment(1);

    if let Some(key) = key {
        let tx_ms = received_wall_ms.saturating_sub(envelope.sent_at_ms);
        let px_ms = receive_start.elapsed().as_millis() as u64;
        if let Some(report) = stats.record(key, tx_ms, px_ms, &envelope.message) {
            stats::log_report(&report);
        }
    }
}

fn stats_key(message: &BroadcastMessage) -> Option<StatsKey> {
    match message {
        BroadcastMessage::Cache(event) => event.group_id().map(StatsKey::Group),
        BroadcastMessage::Relation(event) => Some(StatsKey::Relation(event.relation_id())),
    }
}

fn apply(store: &Arc<dyn EntityStore>, message: &BroadcastMessage) -> anyhow::Result<()> {
    match message {
        BroadcastMessage::Cache(event) => apply_cache_event(store, event),
        BroadcastMessage::Relation(event) => apply_relation_event(store, event),
    }
}

fn apply_cache_event(store: &Arc<dyn EntityStore>, event: &CacheEvent) -> anyhow::Result<()> {
    match event {
        CacheEvent::FullReset => {
            // Never sent by current nodes, but honored for compatibility.
            info!("receiving 'cache full reset'");
            store.reset_all(Origin::Remote);
        }
        CacheEvent::GroupReset { group_id } => {
            let Some(group) = store.group_by_id(*group_id) else {
                info!(group_id, "unknown group id on group reset; peer may be newer");
                return Ok(());
            };
            store.reset_group(group.kind(), Origin::Remote)?;
            info!(group_id, kind = group.kind(), "received 'cache group reset'");
        }
        CacheEvent::ObjectReset {
            group_id,
            object_id,
            properties,
        } => {
            let Some(group) = store.group_by_id(*group_id) else {
                info!(group_id, "unknown group id on object reset; peer may be newer");
                return Ok(());
            };
            if group.is_caching() {
                if group.contains(*object_id) {
                    group.update_from_map(*object_id, properties);
                    group.reorder(*object_id);
                    store.notify_object_expired(Origin::Remote, group.kind(), *object_id);
                    info!(
                        group_id,
                        object_id, "received 'cache object expired' for existing entity"
                    );
                } else {
                    group.insert_from_map(*object_id, properties);
                    store.notify_object_expired(Origin::Remote, group.kind(), *object_id);
                    info!(
                        group_id,
                        object_id, "received 'cache object expired' for new entity"
                    );
                }
            }
            // A peer caches this group even if this node does not; either
            // way the derived caches get refreshed.
            store.method_value_cache_update(group.kind(), *object_id);
        }
        CacheEvent::ObjectRemove {
            group_id,
            object_id,
        } => {
            let Some(group) = store.group_by_id(*group_id) else {
                info!(group_id, "unknown group id on object remove; peer may be newer");
                return Ok(());
            };
            if group.is_caching() {
                group.remove_from_cache(*object_id);
                info!(group_id, object_id, "received 'cache object remove'");
            }
            store.method_value_cache_delete(group.kind(), *object_id);
        }
    }
    Ok(())
}

fn apply_relation_event(
    store: &Arc<dyn EntityStore>,
    event: &RelationEvent,
) -> anyhow::Result<()> {
    let relation_id = event.relation_id();
    let Some(relation) = store.relation(relation_id) else {
        info!(relation_id, "unknown relation id; peer may be newer");
        return Ok(());
    };
    match event {
        RelationEvent::Add {
            left_id, right_id, ..
        } => {
            relation.add(*left_id, *right_id, Origin::Remote);
            info!(relation_id, left_id, right_id, "received 'rel add'");
        }
        RelationEvent::AddAll { pairs, .. } => {
            relation.add_all(pairs, Origin::Remote);
            info!(relation_id, pairs = pairs.len(), "received 'rel add all'");
        }
        RelationEvent::Clear { .. } => {
            relation.clear(Origin::Remote);
            info!(relation_id, "received 'rel clear'");
        }
        RelationEvent::Remove {
            left_id, right_id, ..
        } => {
            relation.remove(*left_id, *right_id, Origin::Remote);
            info!(relation_id, left_id, right_id, "received 'rel remove'");
        }
        RelationEvent::RemoveAll { pairs, .. } => {
            relation.remove_all(pairs, Origin::Remote);
            info!(relation_id, pairs = pairs.len(), "received 'rel remove all'");
        }
        RelationEvent::RemoveLeft { left_id, .. } => {
            relation.remove_left(*left_id, Origin::Remote);
            info!(relation_id, left_id, "received 'rel remove left'");
        }
        RelationEvent::RemoveRight { right_id, .. } => {
            relation.remove_right(*right_id, Origin::Remote);
            info!(relation_id, right_id, "received 'rel remove right'");
        }
        RelationEvent::ReplaceAll { pairs, .. } => {
            relation.replace_all(pairs, Origin::Remote);
            info!(relation_id, pairs = pairs.len(), "received 'rel replace all'");
        }
        RelationEvent::Reset { .. } => {
            relation.reset(Origin::Remote);
            info!(relation_id, "received 'rel reset'");
        }
    }
    Ok(())
}
