//! The three-channel event bus (spec §4.2).
//!
//! Every state change an agent makes is published as an [`EventEnvelope`] on one of
//! three channels — `progress` (user-facing narration), `control` (approvals and
//! other things requiring a decision), `monitor` (everything, for observability and
//! replay). Events are sequence-numbered, persisted through a [`Store`], and
//! fanned out live via a bounded `tokio::sync::broadcast` channel per agent.
//!
//! Grounded on querymt's `event_bus.rs` (the `AtomicU64` sequence counter with
//! `compare_exchange_weak`, the `broadcast::channel` fan-out) and loom's
//! `stream-event/envelope.rs` (the bookmark/cursor stamping discipline).

use crate::ids::AgentId;
use crate::model::{Bookmark, Channel, EventEnvelope};
use crate::store::Store;
use crate::{Error, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const CHANNEL_BUFFER: usize = 1024;

struct AgentBus {
    sender: broadcast::Sender<EventEnvelope>,
    cursor: AtomicU64,
}

impl AgentBus {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_BUFFER);
        Self {
            sender,
            cursor: AtomicU64::new(0),
        }
    }
}

/// Publishes and replays events for every agent in one kernel deployment.
pub struct EventBus {
    store: Arc<dyn Store>,
    buses: DashMap<AgentId, Arc<AgentBus>>,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            buses: DashMap::new(),
        }
    }

    fn bus_for(&self, agent: &AgentId) -> Arc<AgentBus> {
        self.buses
            .entry(agent.clone())
            .or_insert_with(|| Arc::new(AgentBus::new()))
            .clone()
    }

    /// Publishes `payload` on `channel` for `agent`, persisting it before (and
    /// regardless of) whether any subscriber is currently live.
    pub async fn publish(&self, agent: &AgentId, channel: Channel, payload: Value) -> Result<EventEnvelope> {
        let bus = self.bus_for(agent);
        let cursor = bus.cursor.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = EventEnvelope {
            agent_id: agent.clone(),
            cursor,
            bookmark: Bookmark {
                seq: cursor,
                timestamp_millis: chrono::Utc::now().timestamp_millis(),
            },
            channel,
            payload,
        };
        self.store.append_event(envelope.clone()).await?;
        // No subscribers is a normal, non-error condition.
        let _ = bus.sender.send(envelope.clone());
        Ok(envelope)
    }

    /// Replays persisted events after `since` (or from the start) then hands off to
    /// the live broadcast feed, filtered to `channels` (empty = all channels).
    ///
    /// The handoff is watermarked by bookmark so an event delivered during replay is
    /// never redelivered from the live feed, and a live event racing the replay read
    /// is never dropped.
    pub async fn subscribe(
        &self,
        agent: &AgentId,
        channels: Vec<Channel>,
        since: Option<Bookmark>,
    ) -> Result<Subscription> {
        let bus = self.bus_for(agent);
        // Subscribe before reading history so nothing published between the read
        // and the subscribe call is lost.
        let live = bus.sender.subscribe();
        let replay = self.store.read_events(agent, since, &channels).await?;
        let watermark = replay.last().map(|e| e.bookmark).or(since);
        Ok(Subscription {
            replay: replay.into_iter(),
            live,
            channels,
            watermark,
        })
    }
}

/// An iterator over replayed events followed by a live feed of new ones.
pub struct Subscription {
    replay: std::vec::IntoIter<EventEnvelope>,
    live: broadcast::Receiver<EventEnvelope>,
    channels: Vec<Channel>,
    watermark: Option<Bookmark>,
}

impl Subscription {
    /// Returns the next event, awaiting the live feed once replay is exhausted.
    /// Returns `Ok(None)` only if the sending half of the bus is gone (agent
    /// destroyed), never on a merely-idle channel.
    pub async fn next(&mut self) -> Result<Option<EventEnvelope>> {
        if let Some(event) = self.replay.next() {
            self.watermark = Some(event.bookmark);
            return Ok(Some(event));
        }
        loop {
            match self.live.recv().await {
                Ok(event) => {
                    if self.watermark.is_some_and(|w| event.bookmark <= w) {
                        continue;
                    }
                    if !self.channels.is_empty() && !self.channels.contains(&event.channel) {
                        continue;
                    }
                    self.watermark = Some(event.bookmark);
                    return Ok(Some(event));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

/// A one-shot slot for resolving a `permission_required` control-channel event.
///
/// The wire event itself carries no callback; the kernel keeps the sender side
/// here, keyed by the call id embedded in the event payload, and resolves it when
/// `PermissionManager::decide` is invoked.
pub struct ApprovalSlot {
    tx: Option<tokio::sync::oneshot::Sender<crate::model::PermissionDecision>>,
}

impl ApprovalSlot {
    pub fn new() -> (Self, tokio::sync::oneshot::Receiver<crate::model::PermissionDecision>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn resolve(&mut self, decision: crate::model::PermissionDecision) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx
                .send(decision)
                .map_err(|_| Error::permission("approval receiver already dropped")),
            None => Err(Error::permission("approval already resolved")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn publish_assigns_monotonic_cursors() {
        let bus = bus();
        let agent = AgentId::generate();
        let e1 = bus
            .publish(&agent, Channel::Progress, serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let e2 = bus
            .publish(&agent, Channel::Progress, serde_json::json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(e1.cursor, 1);
        assert_eq!(e2.cursor, 2);
    }

    #[tokio::test]
    async fn subscribe_replays_then_delivers_live() {
        let bus = bus();
        let agent = AgentId::generate();
        bus.publish(&agent, Channel::Progress, serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let mut sub = bus.subscribe(&agent, vec![], None).await.unwrap();
        let replayed = sub.next().await.unwrap().unwrap();
        assert_eq!(replayed.cursor, 1);

        bus.publish(&agent, Channel::Progress, serde_json::json!({"n": 2}))
            .await
            .unwrap();
        let live = sub.next().await.unwrap().unwrap();
        assert_eq!(live.cursor, 2);
    }

    #[tokio::test]
    async fn subscribe_filters_by_channel() {
        let bus = bus();
        let agent = AgentId::generate();
        bus.publish(&agent, Channel::Progress, serde_json::json!({})).await.unwrap();
        bus.publish(&agent, Channel::Monitor, serde_json::json!({})).await.unwrap();

        let mut sub = bus
            .subscribe(&agent, vec![Channel::Monitor], None)
            .await
            .unwrap();
        let only = sub.next().await.unwrap().unwrap();
        assert_eq!(only.channel, Channel::Monitor);
    }

    #[tokio::test]
    async fn approval_slot_resolves_once() {
        let (mut slot, rx) = ApprovalSlot::new();
        slot.resolve(crate::model::PermissionDecision::Allow).unwrap();
        assert!(slot.resolve(crate::model::PermissionDecision::Deny).is_err());
        assert_eq!(rx.await.unwrap(), crate::model::PermissionDecision::Allow);
    }

    #[tokio::test]
    async fn subscribe_with_since_skips_already_seen_events() {
        let bus = bus();
        let agent = AgentId::generate();
        let e1 = bus.publish(&agent, Channel::Progress, serde_json::json!({})).await.unwrap();
        bus.publish(&agent, Channel::Progress, serde_json::json!({})).await.unwrap();

        let mut sub = bus.subscribe(&agent, vec![], Some(e1.bookmark)).await.unwrap();
        let next = sub.next().await.unwrap().unwrap();
        assert_eq!(next.cursor, 2);
    }
}
