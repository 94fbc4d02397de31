//! Hierarchical topic tree.
//!
//! Holds the metadata and retained value of every topic. Nodes are stored
//! flat in a `HashMap` keyed by the full topic, with each node keeping the
//! ordered list of its children so subtree walks and enumeration follow
//! insertion order.
//!
//! ```text
//! registry                 (node, implicit)
//! +-- registry/dev1        (node)
//!     +-- settings         (node)
//!     |   +-- gain         (u8, retained)
//!     +-- actions
//!         +-- !reset       (none, ephemeral)
//! ```
//!
//! Adding `a/b/c` creates `a` and `a/b` as implicit `node` topics. An
//! implicit node is replaced by a later explicit definition.

use crate::error::{PubSubError, Result};
use crate::metadata::Metadata;
use crate::topic;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A single topic in the tree.
#[derive(Debug, Clone)]
pub struct TopicNode {
    pub meta: Arc<Metadata>,
    /// Retained value; always `None` for ephemeral and node topics.
    pub value: Option<Value>,
    /// Full topic names of the direct children, in insertion order.
    pub children: Vec<String>,
    /// Created as a placeholder parent rather than by `topic_add`.
    pub implicit: bool,
}

impl TopicNode {
    fn new(meta: Arc<Metadata>, retained: bool, implicit: bool) -> Self {
        let value = if retained { meta.default_value() } else { None };
        Self {
            meta,
            value,
            children: Vec::new(),
            implicit,
        }
    }
}

/// Result of [`TopicTree::insert`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// New topics, parents first; the requested topic is last.
    Created(Vec<String>),
    /// Identical metadata already present.
    Unchanged,
    /// An implicit node or an older schema version was replaced.
    Replaced,
}

/// Flat-storage topic tree.
#[derive(Debug, Default)]
pub struct TopicTree {
    nodes: HashMap<String, TopicNode>,
    roots: Vec<String>,
}

impl TopicTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.nodes.contains_key(topic)
    }

    pub fn get(&self, topic: &str) -> Option<&TopicNode> {
        self.nodes.get(topic)
    }

    pub fn metadata(&self, topic: &str) -> Option<Arc<Metadata>> {
        self.nodes.get(topic).map(|n| n.meta.clone())
    }

    pub fn value(&self, topic: &str) -> Option<&Value> {
        self.nodes.get(topic).and_then(|n| n.value.as_ref())
    }

    /// Add a topic, creating missing parents as implicit nodes.
    pub fn insert(&mut self, topic: &str, meta: Metadata) -> Result<InsertOutcome> {
        topic::validate(topic)?;
        meta.check()
            .map_err(|reason| PubSubError::validation(topic, reason))?;
        let retained = !topic::is_ephemeral(topic);

        if let Some(node) = self.nodes.get_mut(topic) {
            if *node.meta == meta {
                return Ok(InsertOutcome::Unchanged);
            }
            if node.implicit {
                *node = TopicNode {
                    children: std::mem::take(&mut node.children),
                    ..TopicNode::new(Arc::new(meta), retained, false)
                };
                return Ok(InsertOutcome::Replaced);
            }
            if meta.version > node.meta.version {
                let kept = node
                    .value
                    .as_ref()
                    .and_then(|v| meta.validate(v).ok())
                    .or_else(|| if retained { meta.default_value() } else { None });
                tracing::debug!(
                    "Topic {} superseded by schema version {}",
                    topic,
                    meta.version
                );
                node.meta = Arc::new(meta);
                node.value = kept;
                node.implicit = false;
                return Ok(InsertOutcome::Replaced);
            }
            return Err(PubSubError::DuplicateTopic(topic.to_string()));
        }

        let mut created = Vec::new();
        let missing: Vec<&str> = topic::ancestors(topic)
            .skip(1)
            .take_while(|t| !self.nodes.contains_key(*t))
            .collect();
        for parent in missing.into_iter().rev() {
            self.link(parent, TopicNode::new(Arc::new(Metadata::node("")), false, true));
            created.push(parent.to_string());
        }
        self.link(topic, TopicNode::new(Arc::new(meta), retained, false));
        created.push(topic.to_string());
        Ok(InsertOutcome::Created(created))
    }

    fn link(&mut self, topic: &str, node: TopicNode) {
        match topic::parent(topic).and_then(|p| self.nodes.get_mut(p)) {
            Some(parent) => parent.children.push(topic.to_string()),
            None => self.roots.push(topic.to_string()),
        }
        self.nodes.insert(topic.to_string(), node);
    }

    /// Remove a topic and its subtree, returning the removed topics in
    /// depth-first order (the topic itself first).
    pub fn remove(&mut self, topic: &str) -> Result<Vec<(String, TopicNode)>> {
        if !self.nodes.contains_key(topic) {
            return Err(PubSubError::UnknownTopic(topic.to_string()));
        }
        let order = self.subtree(topic);
        let siblings = match topic::parent(topic).and_then(|p| self.nodes.get_mut(p)) {
            Some(parent) => &mut parent.children,
            None => &mut self.roots,
        };
        siblings.retain(|c| c != topic);

        Ok(order
            .into_iter()
            .filter_map(|t| self.nodes.remove(&t).map(|n| (t, n)))
            .collect())
    }

    /// Replace the retained value, returning the previous one.
    pub fn set_value(&mut self, topic: &str, value: Option<Value>) -> Result<Option<Value>> {
        let node = self
            .nodes
            .get_mut(topic)
            .ok_or_else(|| PubSubError::UnknownTopic(topic.to_string()))?;
        Ok(std::mem::replace(&mut node.value, value))
    }

    /// The topic and all descendants, depth-first, parents before children.
    pub fn subtree(&self, topic: &str) -> Vec<String> {
        let mut out = Vec::new();
        if self.nodes.contains_key(topic) {
            self.walk(topic, &mut out);
        }
        out
    }

    fn walk(&self, topic: &str, out: &mut Vec<String>) {
        out.push(topic.to_string());
        if let Some(node) = self.nodes.get(topic) {
            for child in &node.children {
                self.walk(child, out);
            }
        }
    }

    /// All topics depth-first from the roots.
    pub fn topics(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for root in &self.roots {
            self.walk(root, &mut out);
        }
        out
    }

    /// List the subtopics of `topic` (`""` lists the roots).
    ///
    /// With `traverse` the whole subtree is listed, otherwise only direct
    /// children. With `absolute` full topic names are returned, otherwise
    /// names relative to `topic`.
    pub fn enumerate(&self, topic: &str, absolute: bool, traverse: bool) -> Result<Vec<String>> {
        let children: &[String] = if topic.is_empty() {
            &self.roots
        } else {
            &self
                .nodes
                .get(topic)
                .ok_or_else(|| PubSubError::UnknownTopic(topic.to_string()))?
                .children
        };

        let mut names = Vec::new();
        for child in children {
            if traverse {
                self.walk(child, &mut names);
            } else {
                names.push(child.clone());
            }
        }
        if !absolute && !topic.is_empty() {
            let strip = topic.len() + 1;
            for name in &mut names {
                name.drain(..strip);
            }
        }
        Ok(names)
    }

    /// Iterate over all nodes (unordered).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TopicNode)> {
        self.nodes.iter().map(|(k, v)| (k.as_str(), v))
    }
}
