//! Subscriber table
//!
//! Subscriptions bind a topic to a callback. A subscription on a topic
//! also receives publications for every topic below it, so subscribing to
//! `registry/dev1` observes all of that object's settings and events.
//!
//! Each topic may additionally carry exactly one command handler, which is
//! invoked before regular subscribers when its ephemeral topic is
//! published. Its return value is the reversal used by undo.

use crate::error::{PubSubError, Result};
use crate::pubsub::PubSub;
use crate::registry::ObjectId;
use crate::topic;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Subscriber callback: `(pubsub, topic, value)`.
///
/// Callbacks run on the processing context and may publish back into the
/// engine through the handle they are given.
pub type Callback = Arc<dyn Fn(&PubSub, &str, &Value) + Send + Sync>;

/// Publishes that undo a command, applied in order.
pub type Reversal = Vec<(String, Value)>;

/// Command handler: returns the reversal, or `None` when not undoable.
pub type CommandFn = Arc<dyn Fn(&PubSub, &str, &Value) -> Result<Option<Reversal>> + Send + Sync>;

/// Handle returned by `subscribe`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Delivery classes a subscription opts into.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct SubscribeFlags(u8);

impl SubscribeFlags {
    /// Value publications
    pub const PUB: Self = Self(1 << 0);
    /// Replay current retained values on subscribe
    pub const RETAIN: Self = Self(1 << 1);
    /// Metadata publications, delivered as `topic$`
    pub const METADATA: Self = Self(1 << 2);
    /// Removal notifications, delivered as `topic~`
    pub const REMOVE: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Parse a flag list such as `"pub,retain"`.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        s.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .try_fold(Self::empty(), |acc, part| {
                let flag = match part {
                    "pub" => Self::PUB,
                    "retain" => Self::RETAIN,
                    "metadata" => Self::METADATA,
                    "remove" => Self::REMOVE,
                    other => return Err(format!("unknown subscribe flag {:?}", other)),
                };
                Ok(acc | flag)
            })
    }
}

impl BitOr for SubscribeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    flags: SubscribeFlags,
    owner: Option<ObjectId>,
    callback: Callback,
}

#[derive(Clone)]
struct CommandEntry {
    owner: Option<ObjectId>,
    handler: CommandFn,
}

/// Subscriptions and command handlers keyed by topic.
#[derive(Default)]
pub struct SubscriptionTable {
    by_topic: HashMap<String, Vec<Subscription>>,
    topic_of: HashMap<SubscriptionId, String>,
    commands: HashMap<String, CommandEntry>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.topic_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topic_of.is_empty()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.topic_of.contains_key(&id)
    }

    pub fn insert(
        &mut self,
        id: SubscriptionId,
        topic: &str,
        flags: SubscribeFlags,
        owner: Option<ObjectId>,
        callback: Callback,
    ) {
        self.by_topic
            .entry(topic.to_string())
            .or_default()
            .push(Subscription {
                id,
                flags,
                owner,
                callback,
            });
        self.topic_of.insert(id, topic.to_string());
    }

    /// Remove one subscription. Returns false if it was not present.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(topic) = self.topic_of.remove(&id) else {
            return false;
        };
        if let Some(subs) = self.by_topic.get_mut(&topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                self.by_topic.remove(&topic);
            }
        }
        true
    }

    /// Drop all subscriptions and command handlers on `root` and below.
    pub fn remove_within(&mut self, root: &str) -> usize {
        let topics: Vec<String> = self
            .by_topic
            .keys()
            .filter(|t| topic::is_within(t, root))
            .cloned()
            .collect();
        let mut count = 0;
        for t in topics {
            if let Some(subs) = self.by_topic.remove(&t) {
                count += subs.len();
                for s in subs {
                    self.topic_of.remove(&s.id);
                }
            }
        }
        self.commands.retain(|t, _| !topic::is_within(t, root));
        count
    }

    /// Drop every subscription and command handler owned by `owner`.
    pub fn remove_owner(&mut self, owner: ObjectId) -> usize {
        let mut removed = Vec::new();
        self.by_topic.retain(|_, subs| {
            subs.retain(|s| {
                let keep = s.owner != Some(owner);
                if !keep {
                    removed.push(s.id);
                }
                keep
            });
            !subs.is_empty()
        });
        for id in &removed {
            self.topic_of.remove(id);
        }
        self.commands.retain(|_, c| c.owner != Some(owner));
        removed.len()
    }

    /// Subscribers for a publication on `topic` with delivery class `flag`:
    /// the topic's own subscribers first, then each ancestor's.
    pub fn matching(&self, topic: &str, flag: SubscribeFlags) -> Vec<(SubscriptionId, Callback)> {
        topic::ancestors(topic)
            .filter_map(|t| self.by_topic.get(t))
            .flatten()
            .filter(|s| s.flags.contains(flag))
            .map(|s| (s.id, s.callback.clone()))
            .collect()
    }

    /// Install the command handler for `topic`.
    pub fn set_command(
        &mut self,
        topic: &str,
        owner: Option<ObjectId>,
        handler: CommandFn,
    ) -> Result<()> {
        if self.commands.contains_key(topic) {
            return Err(PubSubError::CommandExists(topic.to_string()));
        }
        self.commands
            .insert(topic.to_string(), CommandEntry { owner, handler });
        Ok(())
    }

    pub fn remove_command(&mut self, topic: &str) -> bool {
        self.commands.remove(topic).is_some()
    }

    pub fn command(&self, topic: &str) -> Option<CommandFn> {
        self.commands.get(topic).map(|c| c.handler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Arc::new(|_: &PubSub, _: &str, _: &Value| {})
    }

    #[test]
    fn test_flags() {
        let flags = SubscribeFlags::PUB | SubscribeFlags::RETAIN;
        assert!(flags.contains(SubscribeFlags::PUB));
        assert!(!flags.contains(SubscribeFlags::METADATA));
        assert_eq!(SubscribeFlags::parse("pub, retain").unwrap(), flags);
        assert!(SubscribeFlags::parse("pub,bogus").is_err());
    }

    #[test]
    fn test_matching_walks_ancestors() {
        let mut table = SubscriptionTable::new();
        table.insert(SubscriptionId(1), "a/b", SubscribeFlags::PUB, None, noop());
        table.insert(SubscriptionId(2), "a", SubscribeFlags::PUB, None, noop());
        table.insert(SubscriptionId(3), "a/b/c", SubscribeFlags::METADATA, None, noop());
        table.insert(SubscriptionId(4), "a/bc", SubscribeFlags::PUB, None, noop());
        let ids: Vec<_> = table
            .matching("a/b/c", SubscribeFlags::PUB)
            .into_iter()
            .map(|(id, _)| id.0)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_remove_owner() {
        let mut table = SubscriptionTable::new();
        let owner = ObjectId(9);
        table.insert(SubscriptionId(1), "a", SubscribeFlags::PUB, Some(owner), noop());
        table.insert(SubscriptionId(2), "b", SubscribeFlags::PUB, None, noop());
        table
            .set_command("a/!go", Some(owner), Arc::new(|_: &PubSub, _: &str, _: &Value| Ok(None)))
            .unwrap();
        assert_eq!(table.remove_owner(owner), 1);
        assert_eq!(table.len(), 1);
        assert!(table.command("a/!go").is_none());
        assert!(!table.contains(SubscriptionId(1)));
    }

    #[test]
    fn test_remove_within() {
        let mut table = SubscriptionTable::new();
        table.insert(SubscriptionId(1), "a/b", SubscribeFlags::PUB, None, noop());
        table.insert(SubscriptionId(2), "a/b/c", SubscribeFlags::PUB, None, noop());
        table.insert(SubscriptionId(3), "a", SubscribeFlags::PUB, None, noop());
        assert_eq!(table.remove_within("a/b"), 2);
        assert!(table.contains(SubscriptionId(3)));
        assert!(!table.remove(SubscriptionId(1)));
    }

    #[test]
    fn test_single_command_handler() {
        let mut table = SubscriptionTable::new();
        let handler: CommandFn = Arc::new(|_: &PubSub, _: &str, _: &Value| Ok(None));
        table.set_command("x/!cmd", None, handler.clone()).unwrap();
        assert!(matches!(
            table.set_command("x/!cmd", None, handler),
            Err(PubSubError::CommandExists(_))
        ));
    }
}
