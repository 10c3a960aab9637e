//! Mention-based message routing between agents sharing a pool (spec §4.11).
//!
//! `Room` is deliberately thin: it owns no agent state of its own, just a
//! name-to-`AgentId` map over an `Arc<AgentPool>`. Saying something into the
//! room parses `@name` mentions out of the text with the same "small, fixed
//! grammar, compiled once" shape the teacher uses for templating, and enqueues
//! a `QueuedMessage::User` onto every mentioned agent's `AgentLoop` (or every
//! member, if nothing was mentioned at all).

use crate::agent_loop::QueuedMessage;
use crate::ids::AgentId;
use crate::pool::AgentPool;
use crate::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@([A-Za-z0-9_-]+)").expect("static mention pattern is valid"))
}

/// Extracts the distinct `@name` mentions in `text`, in first-seen order.
pub fn parse_mentions(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in mention_pattern().captures_iter(text) {
        let name = cap[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// A named group of agents, routed by `@mention`.
pub struct Room {
    pool: Arc<AgentPool>,
    members: HashMap<String, AgentId>,
}

impl Room {
    pub fn new(pool: Arc<AgentPool>) -> Self {
        Self { pool, members: HashMap::new() }
    }

    /// Adds `agent_id` to the room under `name`. A later call with the same
    /// name replaces the earlier mapping.
    pub fn join(&mut self, name: impl Into<String>, agent_id: AgentId) {
        self.members.insert(name.into(), agent_id);
    }

    pub fn leave(&mut self, name: &str) -> Option<AgentId> {
        self.members.remove(name)
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &AgentId)> {
        self.members.iter().map(|(name, id)| (name.as_str(), id))
    }

    /// Delivers `text` to the agents it mentions, or to every member if it
    /// mentions none. Returns the names the message was actually delivered
    /// to. Mentions of names not in the room are silently ignored, the same
    /// way an `@here` on a channel with no such member is just text.
    pub fn say(&self, from: Option<&str>, text: &str) -> Result<Vec<String>> {
        let mentioned = parse_mentions(text);
        let targets: Vec<&String> = if mentioned.is_empty() {
            self.members.keys().filter(|name| Some(name.as_str()) != from).collect()
        } else {
            mentioned.iter().filter(|name| self.members.contains_key(*name)).collect()
        };

        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let envelope = match from {
            Some(sender) => format!("@{sender}: {text}"),
            None => text.to_string(),
        };

        let mut delivered = Vec::with_capacity(targets.len());
        for name in targets {
            let id = &self.members[name];
            let agent = self
                .pool
                .agent(id)
                .ok_or_else(|| Error::pool(format!("room member '{name}' ({id}) is not live in the pool")))?;
            agent.enqueue(QueuedMessage::User(envelope.clone()));
            delivered.push(name.clone());
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mentions_dedupes_and_preserves_order() {
        let mentions = parse_mentions("hey @bob can you loop in @alice and @bob again?");
        assert_eq!(mentions, vec!["bob".to_string(), "alice".to_string()]);
    }

    #[test]
    fn parse_mentions_empty_when_none_present() {
        assert!(parse_mentions("no mentions here").is_empty());
    }

    #[tokio::test]
    async fn say_without_mentions_goes_to_all_other_members() {
        use crate::events::EventBus;
        use crate::provider::{ModelChunk, ModelChunkStream, ModelContext, ModelProvider};
        use crate::pool::PoolConfig;
        use crate::store::InMemoryStore;
        use crate::types::AgentOptions;
        use async_trait::async_trait;

        struct SilentProvider;
        #[async_trait]
        impl ModelProvider for SilentProvider {
            async fn stream_complete(&self, _ctx: ModelContext) -> Result<ModelChunkStream> {
                Ok(Box::pin(futures::stream::iter(vec![Ok(ModelChunk::Done { usage: None })])))
            }
        }

        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(EventBus::new(store.clone()));
        let pool = Arc::new(AgentPool::new(store, events, Arc::new(SilentProvider), 4));

        let opts = || AgentOptions::builder().model("m").base_url("http://localhost:1234/v1").build().unwrap();
        let alice = AgentId::generate();
        let bob = AgentId::generate();
        pool.create(alice.clone(), PoolConfig { options: opts(), template_id: "t".into(), template_version: "1".into() }).await.unwrap();
        pool.create(bob.clone(), PoolConfig { options: opts(), template_id: "t".into(), template_version: "1".into() }).await.unwrap();

        let mut room = Room::new(pool.clone());
        room.join("alice", alice.clone());
        room.join("bob", bob.clone());

        let delivered = room.say(Some("alice"), "good morning").unwrap();
        assert_eq!(delivered, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn say_with_unknown_mention_delivers_to_nobody() {
        use crate::events::EventBus;
        use crate::provider::{ModelChunk, ModelChunkStream, ModelContext, ModelProvider};
        use crate::store::InMemoryStore;
        use async_trait::async_trait;

        struct SilentProvider;
        #[async_trait]
        impl ModelProvider for SilentProvider {
            async fn stream_complete(&self, _ctx: ModelContext) -> Result<ModelChunkStream> {
                Ok(Box::pin(futures::stream::iter(vec![Ok(ModelChunk::Done { usage: None })])))
            }
        }

        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(EventBus::new(store.clone()));
        let pool = Arc::new(AgentPool::new(store, events, Arc::new(SilentProvider), 4));
        let room = Room::new(pool);

        let delivered = room.say(None, "hello @ghost").unwrap();
        assert!(delivered.is_empty());
    }
}
