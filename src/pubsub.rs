//! The PubSub engine
//!
//! [`PubSub`] is a cloneable handle to one engine instance: the topic tree,
//! the subscriber table, the undo stack and the object registry. All
//! mutation happens on a single processing context. Calls made on that
//! context execute immediately. Calls from any other thread are queued
//! on a FIFO channel and executed when the processing context drains it.
//!
//! # Processing context
//!
//! The thread that constructs the engine is the processing context. It
//! drains foreign requests by calling [`PubSub::process`], typically from
//! its event loop after the notify hook fires. Alternatively
//! [`PubSub::spawn_dispatcher`] moves the processing context to a
//! dedicated thread:
//!
//! ```text
//! producer thread --publish--> [ crossbeam queue ] --drain--> dispatcher
//!                                                             |-- validate
//!                                                             |-- retain
//!                                                             |-- record undo
//!                                                             `-- callbacks
//! ```
//!
//! Callbacks run on the processing context and may publish again; such
//! nested publishes execute immediately (depth-first) so every queued
//! entry is fully processed before the next one is taken.
//!
//! # Blocking calls
//!
//! `*_blocking` variants wait until their request has been processed and
//! return its result. From the processing context itself they fail with
//! [`PubSubError::DeadlockRisk`]. Non-blocking calls from other threads
//! return once the request is queued; failures are logged.
//!
//! # Example
//!
//! ```
//! use jsui_pubsub::{DType, Metadata, PubSub, PubSubConfig, Value};
//!
//! let pubsub = PubSub::new(PubSubConfig::default());
//! pubsub
//!     .topic_add("device/gain", Metadata::new(DType::U8, "Gain").with_range(0.0, 10.0))
//!     .unwrap();
//! pubsub.publish("device/gain", 5).unwrap();
//! assert_eq!(pubsub.query("device/gain").unwrap(), Value::Int(5));
//! assert!(pubsub.publish("device/gain", 99).is_err());
//! pubsub.undo(1).unwrap();
//! ```

use crate::config::{DispatchConfig, PubSubConfig};
use crate::error::{PubSubError, Result};
use crate::metadata::{DType, Flag, Metadata};
use crate::registry::{
    Capability, ObjectId, RegisterRequest, Registry, RegistryEntry, REGISTRY_MANAGER_TOPIC,
    REGISTRY_TOPIC,
};
use crate::subscription::{Callback, CommandFn, SubscribeFlags, SubscriptionId, SubscriptionTable};
use crate::topic;
use crate::tree::{InsertOutcome, TopicTree};
use crate::undo::{Step, Transaction, UndoStack};
use crate::value::Value;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Hook invoked whenever a request is queued from a foreign thread.
pub type NotifyFn = Arc<dyn Fn() + Send + Sync>;

/// Requests executed on the processing context
enum Message {
    TopicAdd(String, Metadata),
    TopicRemove(String),
    Publish(String, Value),
    Subscribe {
        id: SubscriptionId,
        topic: String,
        flags: SubscribeFlags,
        owner: Option<ObjectId>,
        callback: Callback,
    },
    Unsubscribe(SubscriptionId),
    UnsubscribeAll(ObjectId),
    Command {
        topic: String,
        owner: Option<ObjectId>,
        handler: CommandFn,
    },
    Undo(usize),
    Redo(usize),
    UndoClear,
    Register(ObjectId, RegisterRequest),
    Unregister(ObjectId),
    /// Completes once everything queued before it has been processed
    Barrier,
}

impl Message {
    /// Short description for logs and undo transactions
    fn label(&self) -> String {
        match self {
            Message::TopicAdd(t, _) => format!("topic_add {}", t),
            Message::TopicRemove(t) => format!("topic_remove {}", t),
            Message::Publish(t, _) => t.clone(),
            Message::Subscribe { topic, .. } => format!("subscribe {}", topic),
            Message::Unsubscribe(id) => format!("unsubscribe {}", id),
            Message::UnsubscribeAll(owner) => format!("unsubscribe_all {}", owner),
            Message::Command { topic, .. } => format!("command {}", topic),
            Message::Undo(n) => format!("undo {}", n),
            Message::Redo(n) => format!("redo {}", n),
            Message::UndoClear => "undo_clear".to_string(),
            Message::Register(id, _) => format!("register {}", id),
            Message::Unregister(id) => format!("unregister {}", id),
            Message::Barrier => "barrier".to_string(),
        }
    }

    fn captures_undo(&self) -> bool {
        !matches!(
            self,
            Message::Undo(_) | Message::Redo(_) | Message::UndoClear | Message::Barrier
        )
    }
}

/// Outcome of a processed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Done,
    /// Number of undo/redo transactions applied
    Count(usize),
}

impl Reply {
    fn count(self) -> usize {
        match self {
            Reply::Done => 0,
            Reply::Count(n) => n,
        }
    }
}

struct Envelope {
    message: Message,
    completion: Option<Sender<Result<Reply>>>,
}

struct Inner {
    config: DispatchConfig,
    tree: RwLock<TopicTree>,
    subs: Mutex<SubscriptionTable>,
    undo: Mutex<UndoStack>,
    registry: Mutex<Registry>,
    /// Transaction being recorded for the current top-level request
    capture: Mutex<Option<Transaction>>,
    queue_tx: Sender<Envelope>,
    queue_rx: Receiver<Envelope>,
    processing_thread: RwLock<ThreadId>,
    dispatcher_active: AtomicBool,
    depth: AtomicUsize,
    notify: RwLock<Option<NotifyFn>>,
    next_subscription: AtomicU64,
    next_object: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Decrements the nesting depth when a request finishes.
struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to a PubSub engine instance.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("topics", &read(&self.inner.tree).len())
            .field("subscriptions", &lock(&self.inner.subs).len())
            .field("objects", &lock(&self.inner.registry).len())
            .field("pending", &self.inner.queue_rx.len())
            .finish()
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new(PubSubConfig::default())
    }
}

impl PubSub {
    /// Create an engine whose processing context is the calling thread.
    pub fn new(config: PubSubConfig) -> Self {
        let (queue_tx, queue_rx) = unbounded();
        let pubsub = Self {
            inner: Arc::new(Inner {
                undo: Mutex::new(UndoStack::new(config.dispatch.undo_depth)),
                config: config.dispatch,
                tree: RwLock::new(TopicTree::new()),
                subs: Mutex::new(SubscriptionTable::new()),
                registry: Mutex::new(Registry::new()),
                capture: Mutex::new(None),
                queue_tx,
                queue_rx,
                processing_thread: RwLock::new(thread::current().id()),
                dispatcher_active: AtomicBool::new(false),
                depth: AtomicUsize::new(0),
                notify: RwLock::new(None),
                next_subscription: AtomicU64::new(1),
                next_object: AtomicU64::new(1),
            }),
        };
        pubsub.add_builtin_topics();
        pubsub
    }

    fn add_builtin_topics(&self) {
        let mut tree = write(&self.inner.tree);
        let mut builtin = vec![
            (REGISTRY_TOPIC.to_string(), Metadata::node("Registered objects")),
            (
                REGISTRY_MANAGER_TOPIC.to_string(),
                Metadata::node("Registry manager"),
            ),
        ];
        for cap in Capability::ALL {
            builtin.push((
                cap.list_topic(),
                Metadata::new(DType::UniqueStrings, format!("Objects providing {}", cap))
                    .with_default(Value::List(Vec::new()))
                    .with_flags(&[Flag::ReadOnly, Flag::Tmp, Flag::SkipUndo]),
            ));
        }
        for (t, meta) in builtin {
            if let Err(e) = tree.insert(&t, meta) {
                tracing::error!("Failed to add builtin topic {}: {}", t, e);
            }
        }
    }

    /// Install the hook called when a foreign thread queues a request.
    pub fn set_notify_fn(&self, notify: impl Fn() + Send + Sync + 'static) {
        *write(&self.inner.notify) = Some(Arc::new(notify));
    }

    /// True when called on the processing context.
    pub fn is_processing_context(&self) -> bool {
        *read(&self.inner.processing_thread) == thread::current().id()
    }

    // ==================== Dispatch ====================

    fn submit(&self, message: Message, blocking: bool) -> Result<Reply> {
        if self.is_processing_context() {
            if blocking {
                return Err(PubSubError::DeadlockRisk);
            }
            if self.inner.depth.load(Ordering::SeqCst) == 0 {
                // Keep FIFO order with requests queued by other threads
                self.drain();
            }
            return self.execute(message);
        }

        let (completion, done) = if blocking {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.inner
            .queue_tx
            .send(Envelope {
                message,
                completion,
            })
            .map_err(|_| PubSubError::Channel("dispatch queue closed".to_string()))?;
        let notify = read(&self.inner.notify).clone();
        if let Some(notify) = notify {
            notify();
        }

        let Some(done) = done else {
            return Ok(Reply::Done);
        };
        let timeout = self.inner.config.blocking_timeout();
        match done.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PubSubError::Timeout(format!(
                "no reply from processing context within {:?}",
                timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(PubSubError::Channel(
                "request dropped before completion".to_string(),
            )),
        }
    }

    /// Process all queued requests. Returns the number processed.
    ///
    /// Must be called on the processing context.
    pub fn process(&self) -> Result<usize> {
        if !self.is_processing_context() {
            return Err(PubSubError::Channel(
                "process() called outside the processing context".to_string(),
            ));
        }
        Ok(self.drain())
    }

    fn drain(&self) -> usize {
        let mut count = 0;
        while let Ok(envelope) = self.inner.queue_rx.try_recv() {
            self.run(envelope);
            count += 1;
        }
        count
    }

    fn run(&self, envelope: Envelope) {
        let label = envelope.message.label();
        let result = self.execute(envelope.message);
        match envelope.completion {
            Some(done) => {
                // The caller may have timed out and dropped its receiver
                let _ = done.send(result);
            }
            None => {
                if let Err(e) = result {
                    tracing::warn!("Queued request {} failed: {}", label, e);
                }
            }
        }
    }

    fn execute(&self, message: Message) -> Result<Reply> {
        let depth = self.inner.depth.fetch_add(1, Ordering::SeqCst);
        let _guard = DepthGuard(&self.inner.depth);
        if depth >= self.inner.config.max_nesting_depth {
            return Err(PubSubError::NestingDepth(depth, message.label()));
        }

        let top_level = depth == 0 && message.captures_undo();
        if top_level {
            *lock(&self.inner.capture) = Some(Transaction::new(message.label()));
        }
        let result = self.dispatch(message);
        if top_level {
            let captured = lock(&self.inner.capture).take();
            if let Some(tx) = captured.filter(|tx| !tx.is_empty()) {
                tracing::trace!("Undo entry recorded for {}", tx.origin);
                lock(&self.inner.undo).push(tx);
            }
        }
        result
    }

    fn dispatch(&self, message: Message) -> Result<Reply> {
        match message {
            Message::TopicAdd(t, meta) => self.do_topic_add(&t, meta),
            Message::TopicRemove(t) => self.do_topic_remove(&t),
            Message::Publish(t, value) => self.do_publish(&t, value),
            Message::Subscribe {
                id,
                topic,
                flags,
                owner,
                callback,
            } => self.do_subscribe(id, &topic, flags, owner, callback),
            Message::Unsubscribe(id) => {
                if !lock(&self.inner.subs).remove(id) {
                    tracing::debug!("Unsubscribe of unknown subscription {}", id);
                }
                Ok(())
            }
            Message::UnsubscribeAll(owner) => {
                let n = lock(&self.inner.subs).remove_owner(owner);
                tracing::debug!("Removed {} subscriptions of {}", n, owner);
                Ok(())
            }
            Message::Command {
                topic,
                owner,
                handler,
            } => self.do_command(&topic, owner, handler),
            Message::Undo(n) => return Ok(Reply::Count(self.do_undo(n))),
            Message::Redo(n) => return Ok(Reply::Count(self.do_redo(n))),
            Message::UndoClear => {
                lock(&self.inner.undo).clear();
                Ok(())
            }
            Message::Register(id, request) => self.do_register(id, request),
            Message::Unregister(id) => self.do_unregister(id),
            Message::Barrier => Ok(()),
        }
        .map(|_| Reply::Done)
    }

    /// Invoke the callbacks subscribed to `lookup` or its ancestors with
    /// delivery class `flag`.
    fn deliver(&self, lookup: &str, delivered: &str, value: &Value, flag: SubscribeFlags) {
        let targets = lock(&self.inner.subs).matching(lookup, flag);
        for (id, callback) in targets {
            // An earlier callback may have unsubscribed this one
            if !lock(&self.inner.subs).contains(id) {
                continue;
            }
            callback(self, delivered, value);
        }
    }

    fn record(&self, f: impl FnOnce(&mut Transaction)) {
        if let Some(tx) = lock(&self.inner.capture).as_mut() {
            f(tx);
        }
    }

    // ==================== Topic operations ====================

    fn announce_metadata(&self, t: &str) {
        let meta = read(&self.inner.tree).metadata(t);
        if let Some(meta) = meta {
            self.deliver(t, &topic::metadata_topic(t), &meta.to_value(), SubscribeFlags::METADATA);
        }
    }

    fn do_topic_add(&self, t: &str, meta: Metadata) -> Result<()> {
        self.add_topic(t, meta).map(|_| ())
    }

    /// Add `t` and return the topics this call created, parents first.
    fn add_topic(&self, t: &str, meta: Metadata) -> Result<Vec<String>> {
        let outcome = write(&self.inner.tree).insert(t, meta)?;
        match outcome {
            InsertOutcome::Unchanged => Ok(Vec::new()),
            InsertOutcome::Created(created) => {
                tracing::trace!("Topic added: {}", t);
                for c in &created {
                    self.announce_metadata(c);
                }
                Ok(created)
            }
            InsertOutcome::Replaced => {
                self.announce_metadata(t);
                let value = read(&self.inner.tree).value(t).cloned();
                if let Some(value) = value {
                    self.deliver(t, t, &value, SubscribeFlags::PUB);
                }
                Ok(Vec::new())
            }
        }
    }

    fn do_topic_remove(&self, t: &str) -> Result<()> {
        if !read(&self.inner.tree).contains(t) {
            return Err(PubSubError::UnknownTopic(t.to_string()));
        }
        // Notify before the subtree's own subscriptions are dropped
        self.deliver(t, &topic::remove_topic(t), &Value::Null, SubscribeFlags::REMOVE);
        let removed = write(&self.inner.tree).remove(t)?;
        let dropped = lock(&self.inner.subs).remove_within(t);
        tracing::trace!(
            "Topic removed: {} ({} topics, {} subscriptions)",
            t,
            removed.len(),
            dropped
        );
        Ok(())
    }

    fn do_publish(&self, t: &str, value: Value) -> Result<()> {
        topic::validate(t)?;
        let meta = read(&self.inner.tree)
            .metadata(t)
            .ok_or_else(|| PubSubError::UnknownTopic(t.to_string()))?;
        let value = self.apply_toggle(t, &meta, value);
        let value = meta
            .validate(&value)
            .map_err(|reason| PubSubError::validation(t, reason))?;

        if topic::is_ephemeral(t) {
            let handler = lock(&self.inner.subs).command(t);
            if let Some(handler) = handler {
                let reversal = handler(self, t, &value)?;
                if let Some(reversal) = reversal {
                    if !meta.has_flag(Flag::SkipUndo) {
                        self.record(|tx| tx.record_command(t, value.clone(), reversal));
                    }
                }
            }
            self.deliver(t, t, &value, SubscribeFlags::PUB);
            return Ok(());
        }

        let previous = {
            let mut tree = write(&self.inner.tree);
            let previous = tree.value(t).cloned();
            if meta.deduplicates() && previous.as_ref() == Some(&value) {
                return Ok(());
            }
            tree.set_value(t, Some(value.clone()))?;
            previous
        };
        if !meta.has_flag(Flag::SkipUndo) {
            self.record(|tx| tx.record_publish(t, previous, value.clone()));
        }
        self.deliver(t, t, &value, SubscribeFlags::PUB);
        Ok(())
    }

    /// `"!"` or `"__toggle__"` published to a bool topic inverts it.
    fn apply_toggle(&self, t: &str, meta: &Metadata, value: Value) -> Value {
        match (&meta.dtype, value.as_str()) {
            (DType::Bool, Some("!" | "__toggle__")) => {
                let current = read(&self.inner.tree)
                    .value(t)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Value::Bool(!current)
            }
            _ => value,
        }
    }

    fn do_subscribe(
        &self,
        id: SubscriptionId,
        t: &str,
        flags: SubscribeFlags,
        owner: Option<ObjectId>,
        callback: Callback,
    ) -> Result<()> {
        if !read(&self.inner.tree).contains(t) {
            return Err(PubSubError::UnknownTopic(t.to_string()));
        }
        lock(&self.inner.subs).insert(id, t, flags, owner, callback.clone());
        if flags.contains(SubscribeFlags::RETAIN) {
            let retained: Vec<(String, Value)> = {
                let tree = read(&self.inner.tree);
                tree.subtree(t)
                    .into_iter()
                    .filter(|s| !topic::is_ephemeral(s))
                    .filter_map(|s| tree.value(&s).cloned().map(|v| (s, v)))
                    .collect()
            };
            for (s, v) in retained {
                callback(self, &s, &v);
            }
        }
        Ok(())
    }

    fn do_command(&self, t: &str, owner: Option<ObjectId>, handler: CommandFn) -> Result<()> {
        if !topic::is_ephemeral(t) {
            return Err(PubSubError::InvalidTopic {
                topic: t.to_string(),
                reason: "command handlers require an ephemeral topic".to_string(),
            });
        }
        if !read(&self.inner.tree).contains(t) {
            return Err(PubSubError::UnknownTopic(t.to_string()));
        }
        lock(&self.inner.subs).set_command(t, owner, handler)
    }

    // ==================== Undo ====================

    /// Replay one step without recording it. Unknown topics are skipped.
    fn replay(&self, step: &Step) {
        let result = match &step.value {
            Some(value) => self.do_publish(&step.topic, value.clone()),
            None => match write(&self.inner.tree).set_value(&step.topic, None) {
                Ok(_) => {
                    self.deliver(&step.topic, &step.topic, &Value::Null, SubscribeFlags::PUB);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            tracing::warn!("Skipping undo/redo step for {}: {}", step.topic, e);
        }
    }

    fn do_undo(&self, count: usize) -> usize {
        // Replays are never recorded, even when issued from a callback
        let suspended = lock(&self.inner.capture).take();
        let mut applied = 0;
        while applied < count {
            let Some(tx) = lock(&self.inner.undo).pop_undo() else {
                break;
            };
            tracing::debug!("Undo {}", tx.origin);
            for step in tx.undo_steps() {
                self.replay(step);
            }
            lock(&self.inner.undo).push_redo(tx);
            applied += 1;
        }
        if applied == 0 {
            tracing::debug!("Undo requested but the undo stack is empty");
        }
        *lock(&self.inner.capture) = suspended;
        applied
    }

    fn do_redo(&self, count: usize) -> usize {
        let suspended = lock(&self.inner.capture).take();
        let mut applied = 0;
        while applied < count {
            let Some(tx) = lock(&self.inner.undo).pop_redo() else {
                break;
            };
            tracing::debug!("Redo {}", tx.origin);
            for step in tx.redo_steps() {
                self.replay(step);
            }
            lock(&self.inner.undo).push_undone(tx);
            applied += 1;
        }
        if applied == 0 {
            tracing::debug!("Redo requested but the redo stack is empty");
        }
        *lock(&self.inner.capture) = suspended;
        applied
    }

    // ==================== Registry ====================

    fn publish_capability_lists(&self, capabilities: &[Capability]) {
        for cap in capabilities {
            let ids = lock(&self.inner.registry).capability_unique_ids(*cap);
            if let Err(e) = self.do_publish(&cap.list_topic(), Value::strings(ids)) {
                tracing::warn!("Failed to update capability list {}: {}", cap, e);
            }
        }
    }

    fn publish_children(&self, id: ObjectId) {
        let (t, children) = {
            let registry = lock(&self.inner.registry);
            let Some(entry) = registry.get(id) else {
                return;
            };
            let children: Vec<String> = entry
                .children
                .iter()
                .filter_map(|c| registry.get(*c).map(|e| e.unique_id.clone()))
                .collect();
            (topic::join(&entry.topic(), "children"), children)
        };
        if let Err(e) = self.do_publish(&t, Value::strings(children)) {
            tracing::warn!("Failed to update {}: {}", t, e);
        }
    }

    fn do_register(&self, id: ObjectId, request: RegisterRequest) -> Result<()> {
        lock(&self.inner.registry).insert(id, &request)?;
        let Some(entry) = self.object(id) else {
            return Err(PubSubError::UnknownObject(id));
        };
        let root = entry.topic();

        let mut topics = vec![
            (root.clone(), Metadata::node(request.class_name.clone())),
            (topic::join(&root, "actions"), Metadata::node("actions")),
            (topic::join(&root, "events"), Metadata::node("events")),
            (topic::join(&root, "settings"), Metadata::node("settings")),
            (
                topic::join(&root, "children"),
                Metadata::new(DType::UniqueStrings, "Child objects")
                    .with_default(Value::List(Vec::new()))
                    .with_flags(&[Flag::ReadOnly, Flag::Tmp, Flag::SkipUndo]),
            ),
        ];
        for (name, meta) in &request.settings {
            topics.push((topic::join(&root, &format!("settings/{}", name)), meta.clone()));
        }

        let mut created = Vec::new();
        for (t, meta) in topics {
            match self.add_topic(&t, meta) {
                Ok(added) => created.extend(added),
                Err(e) => {
                    tracing::warn!("Register {} failed creating {}: {}", entry.unique_id, t, e);
                    // Only undo what this registration added
                    for c in created.iter().rev() {
                        if !read(&self.inner.tree).contains(c) {
                            continue;
                        }
                        if let Err(e) = self.do_topic_remove(c) {
                            tracing::warn!("Rollback of {} failed: {}", c, e);
                        }
                    }
                    lock(&self.inner.registry).remove(id);
                    return Err(e);
                }
            }
        }

        if let Some(parent) = entry.parent {
            self.publish_children(parent);
        }
        self.publish_capability_lists(&entry.capabilities);
        tracing::debug!("Registered {} as {}", entry.unique_id, id);
        Ok(())
    }

    fn do_unregister(&self, id: ObjectId) -> Result<()> {
        let order = lock(&self.inner.registry).unregister_order(id)?;
        for oid in order {
            let subs = lock(&self.inner.subs).remove_owner(oid);
            let Some(entry) = lock(&self.inner.registry).remove(oid) else {
                continue;
            };
            let root = entry.topic();
            if read(&self.inner.tree).contains(&root) {
                if let Err(e) = self.do_topic_remove(&root) {
                    tracing::warn!("Failed to remove topics of {}: {}", entry.unique_id, e);
                }
            }
            if let Some(parent) = entry.parent {
                self.publish_children(parent);
            }
            self.publish_capability_lists(&entry.capabilities);
            tracing::debug!(
                "Unregistered {} ({} subscriptions dropped)",
                entry.unique_id,
                subs
            );
        }
        Ok(())
    }

    // ==================== Topic API ====================

    /// Define a topic. Idempotent for identical metadata.
    pub fn topic_add(&self, topic: &str, meta: Metadata) -> Result<()> {
        self.submit(Message::TopicAdd(topic.to_string(), meta), false)
            .map(|_| ())
    }

    /// Remove a topic, its retained value, its subtree and all
    /// subscriptions on it. Ancestor `REMOVE` subscribers see `topic~`.
    pub fn topic_remove(&self, topic: &str) -> Result<()> {
        self.submit(Message::TopicRemove(topic.to_string()), false)
            .map(|_| ())
    }

    /// Publish a value.
    pub fn publish(&self, topic: &str, value: impl Into<Value>) -> Result<()> {
        self.submit(Message::Publish(topic.to_string(), value.into()), false)
            .map(|_| ())
    }

    /// Publish and wait until the value has been delivered.
    pub fn publish_blocking(&self, topic: &str, value: impl Into<Value>) -> Result<()> {
        self.submit(Message::Publish(topic.to_string(), value.into()), true)
            .map(|_| ())
    }

    /// Wait until everything queued so far has been processed.
    pub fn flush(&self) -> Result<()> {
        if self.is_processing_context() {
            self.drain();
            return Ok(());
        }
        self.submit(Message::Barrier, true).map(|_| ())
    }

    /// Current retained value. Non-blocking direct read.
    pub fn query(&self, topic: &str) -> Result<Value> {
        let tree = read(&self.inner.tree);
        let node = tree
            .get(topic)
            .ok_or_else(|| PubSubError::UnknownTopic(topic.to_string()))?;
        Ok(node.value.clone().unwrap_or_default())
    }

    /// Metadata of a topic.
    pub fn metadata(&self, topic: &str) -> Result<Arc<Metadata>> {
        read(&self.inner.tree)
            .metadata(topic)
            .ok_or_else(|| PubSubError::UnknownTopic(topic.to_string()))
    }

    pub fn contains(&self, topic: &str) -> bool {
        read(&self.inner.tree).contains(topic)
    }

    /// List subtopics; see [`TopicTree::enumerate`].
    pub fn enumerate(&self, topic: &str, absolute: bool, traverse: bool) -> Result<Vec<String>> {
        read(&self.inner.tree).enumerate(topic, absolute, traverse)
    }

    /// Run `f` with shared access to the topic tree.
    pub fn with_tree<R>(&self, f: impl FnOnce(&TopicTree) -> R) -> R {
        f(&read(&self.inner.tree))
    }

    fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst))
    }

    /// Subscribe to a topic and its subtree.
    pub fn subscribe<F>(&self, topic: &str, flags: SubscribeFlags, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&PubSub, &str, &Value) + Send + Sync + 'static,
    {
        self.subscribe_with_owner(topic, flags, None, Arc::new(callback))
    }

    /// Subscribe on behalf of a registered object. The subscription is
    /// dropped when the object is unregistered.
    pub fn subscribe_as<F>(
        &self,
        owner: ObjectId,
        topic: &str,
        flags: SubscribeFlags,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(&PubSub, &str, &Value) + Send + Sync + 'static,
    {
        self.subscribe_with_owner(topic, flags, Some(owner), Arc::new(callback))
    }

    fn subscribe_with_owner(
        &self,
        topic: &str,
        flags: SubscribeFlags,
        owner: Option<ObjectId>,
        callback: Callback,
    ) -> Result<SubscriptionId> {
        let id = self.next_subscription_id();
        self.submit(
            Message::Subscribe {
                id,
                topic: topic.to_string(),
                flags,
                owner,
                callback,
            },
            false,
        )?;
        Ok(id)
    }

    /// Remove future deliveries. Already queued deliveries still run.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.submit(Message::Unsubscribe(id), false).map(|_| ())
    }

    /// Remove every subscription and command handler owned by `owner`.
    pub fn unsubscribe_all(&self, owner: ObjectId) -> Result<()> {
        self.submit(Message::UnsubscribeAll(owner), false).map(|_| ())
    }

    /// Install the single command handler of an ephemeral topic.
    pub fn command<F>(&self, topic: &str, owner: Option<ObjectId>, handler: F) -> Result<()>
    where
        F: Fn(&PubSub, &str, &Value) -> Result<Option<crate::subscription::Reversal>>
            + Send
            + Sync
            + 'static,
    {
        self.submit(
            Message::Command {
                topic: topic.to_string(),
                owner,
                handler: Arc::new(handler),
            },
            false,
        )
        .map(|_| ())
    }

    // ==================== Command API ====================

    /// Undo up to `count` transactions. Returns how many were undone.
    ///
    /// From a foreign thread this returns 0 once queued; use
    /// [`PubSub::undo_blocking`] for the count.
    pub fn undo(&self, count: usize) -> Result<usize> {
        self.submit(Message::Undo(count), false).map(Reply::count)
    }

    pub fn undo_blocking(&self, count: usize) -> Result<usize> {
        self.submit(Message::Undo(count), true).map(Reply::count)
    }

    /// Redo up to `count` transactions. Returns how many were redone.
    pub fn redo(&self, count: usize) -> Result<usize> {
        self.submit(Message::Redo(count), false).map(Reply::count)
    }

    pub fn redo_blocking(&self, count: usize) -> Result<usize> {
        self.submit(Message::Redo(count), true).map(Reply::count)
    }

    /// Drop the undo and redo history.
    pub fn undo_clear(&self) -> Result<()> {
        self.submit(Message::UndoClear, false).map(|_| ())
    }

    pub fn undo_len(&self) -> usize {
        lock(&self.inner.undo).undo_len()
    }

    pub fn redo_len(&self) -> usize {
        lock(&self.inner.undo).redo_len()
    }

    // ==================== Registry API ====================

    /// Register an object, creating its `registry/<unique_id>` subtree.
    ///
    /// The id is allocated up front. From a foreign thread the
    /// registration completes asynchronously; use
    /// [`PubSub::register_blocking`] to observe failures.
    pub fn register(&self, request: RegisterRequest) -> Result<ObjectId> {
        self.register_impl(request, false)
    }

    pub fn register_blocking(&self, request: RegisterRequest) -> Result<ObjectId> {
        self.register_impl(request, true)
    }

    fn register_impl(&self, request: RegisterRequest, blocking: bool) -> Result<ObjectId> {
        let id = ObjectId(self.inner.next_object.fetch_add(1, Ordering::SeqCst));
        self.submit(Message::Register(id, request), blocking)?;
        Ok(id)
    }

    /// Unregister an object, its children first.
    pub fn unregister(&self, id: ObjectId) -> Result<()> {
        self.submit(Message::Unregister(id), false).map(|_| ())
    }

    pub fn unregister_blocking(&self, id: ObjectId) -> Result<()> {
        self.submit(Message::Unregister(id), true).map(|_| ())
    }

    /// Registered objects providing `capability`.
    pub fn find_by_capability(&self, capability: Capability) -> Vec<ObjectId> {
        lock(&self.inner.registry).find_by_capability(capability)
    }

    /// Existence record of an object.
    pub fn object(&self, id: ObjectId) -> Option<RegistryEntry> {
        lock(&self.inner.registry).get(id).cloned()
    }

    /// Object id for a unique id.
    pub fn lookup(&self, unique_id: &str) -> Option<ObjectId> {
        lock(&self.inner.registry).lookup(unique_id)
    }

    pub fn children(&self, id: ObjectId) -> Vec<ObjectId> {
        lock(&self.inner.registry).children(id)
    }

    /// The registered object itself, if alive and of type `T`.
    pub fn instance<T: Any + Send + Sync>(&self, id: ObjectId) -> Option<Arc<T>> {
        lock(&self.inner.registry).instance::<T>(id)
    }

    // ==================== Dispatcher thread ====================

    /// Move the processing context to a dedicated thread.
    ///
    /// Only the current processing context may hand itself over, and only
    /// one dispatcher runs at a time. Both misuses return
    /// [`PubSubError::Dispatcher`].
    pub fn spawn_dispatcher(&self) -> Result<DispatcherHandle> {
        if !self.is_processing_context() {
            return Err(PubSubError::Dispatcher(
                "must be started from the processing context".to_string(),
            ));
        }
        if self
            .inner
            .dispatcher_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PubSubError::Dispatcher("already running".to_string()));
        }
        let handle = self.start_dispatcher();
        if handle.is_err() {
            self.inner.dispatcher_active.store(false, Ordering::SeqCst);
        }
        handle
    }

    fn start_dispatcher(&self) -> Result<DispatcherHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<()>(1);
        let pubsub = self.clone();
        let flag = running.clone();
        let thread = thread::Builder::new()
            .name("pubsub-dispatch".to_string())
            .spawn(move || {
                *write(&pubsub.inner.processing_thread) = thread::current().id();
                let _ = ready_tx.send(());
                tracing::debug!("PubSub dispatcher started");
                while flag.load(Ordering::SeqCst) {
                    match pubsub.inner.queue_rx.recv_timeout(Duration::from_millis(50)) {
                        Ok(envelope) => pubsub.run(envelope),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                pubsub.drain();
                tracing::debug!("PubSub dispatcher stopped");
            })?;
        ready_rx
            .recv()
            .map_err(|_| PubSubError::Channel("dispatcher thread failed to start".to_string()))?;
        Ok(DispatcherHandle {
            pubsub: self.clone(),
            running,
            thread: Some(thread),
        })
    }
}

/// Owns the dispatcher thread started by [`PubSub::spawn_dispatcher`].
///
/// Dropping the handle stops the thread. The processing context returns
/// to the thread that stops it.
pub struct DispatcherHandle {
    pubsub: PubSub,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the dispatcher after it drains the queue.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let joined = thread.join();
        *write(&self.pubsub.inner.processing_thread) = thread::current().id();
        self.pubsub
            .inner
            .dispatcher_active
            .store(false, Ordering::SeqCst);
        joined.map_err(|_| PubSubError::Channel("dispatcher thread panicked".to_string()))
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("Dispatcher shutdown failed: {}", e);
        }
    }
}
