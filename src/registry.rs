//! Registry of live objects
//!
//! Devices, widgets and plugins register here when they are created. Each
//! registration gets a process-unique [`ObjectId`], a unique string id
//! used in topic names (`registry/<unique_id>`), a closed set of
//! [`Capability`] tags and an optional parent. Unregistering a parent
//! cascades to its children first.
//!
//! The registry owns the existence records only. The object itself is
//! owned by whoever created it; the registry keeps a weak reference so
//! that lookups never extend its lifetime.
//!
//! # Example
//!
//! ```ignore
//! let req = RegisterRequest::new("JsdrvDevice")
//!     .with_capability(Capability::Device)
//!     .with_capability(Capability::SignalSource)
//!     .with_setting("name", Metadata::new(DType::Str, "Device name").with_default("JS220"));
//! let id = pubsub.register(req)?;
//! ```

use crate::error::{PubSubError, Result};
use crate::metadata::Metadata;
use crate::topic;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Root of all object topic subtrees.
pub const REGISTRY_TOPIC: &str = "registry";

/// Root of the registry manager's own topics.
pub const REGISTRY_MANAGER_TOPIC: &str = "registry_manager";

/// Process-unique object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a registered object can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    RangeTool,
    RangeToolClass,
    RangeToolObject,
    DeviceFactory,
    Device,
    SignalSource,
    SignalStreaming,
    SignalSink,
    StatisticsSource,
    StatisticsSink,
    View,
    Widget,
    WidgetClass,
    WidgetObject,
}

impl Capability {
    pub const ALL: [Capability; 14] = [
        Capability::RangeTool,
        Capability::RangeToolClass,
        Capability::RangeToolObject,
        Capability::DeviceFactory,
        Capability::Device,
        Capability::SignalSource,
        Capability::SignalStreaming,
        Capability::SignalSink,
        Capability::StatisticsSource,
        Capability::StatisticsSink,
        Capability::View,
        Capability::Widget,
        Capability::WidgetClass,
        Capability::WidgetObject,
    ];

    /// Name used in topics, e.g. `signal.source`
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::RangeTool => "range_tool",
            Capability::RangeToolClass => "range_tool.class",
            Capability::RangeToolObject => "range_tool.object",
            Capability::DeviceFactory => "device_factory",
            Capability::Device => "device",
            Capability::SignalSource => "signal.source",
            Capability::SignalStreaming => "signal.streaming",
            Capability::SignalSink => "signal.sink",
            Capability::StatisticsSource => "statistics.source",
            Capability::StatisticsSink => "statistics.sink",
            Capability::View => "view",
            Capability::Widget => "widget",
            Capability::WidgetClass => "widget.class",
            Capability::WidgetObject => "widget.object",
        }
    }

    pub fn parse(s: &str) -> Option<Capability> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Retained topic listing the unique ids that provide this capability
    pub fn list_topic(self) -> String {
        format!("{}/capabilities/{}/list", REGISTRY_MANAGER_TOPIC, self.as_str())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Instance = Weak<dyn Any + Send + Sync>;

/// Builder describing an object to register.
#[derive(Clone)]
pub struct RegisterRequest {
    pub class_name: String,
    pub unique_id: Option<String>,
    pub capabilities: Vec<Capability>,
    pub parent: Option<ObjectId>,
    pub settings: Vec<(String, Metadata)>,
    pub(crate) instance: Option<Instance>,
}

impl fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("class_name", &self.class_name)
            .field("unique_id", &self.unique_id)
            .field("capabilities", &self.capabilities)
            .field("parent", &self.parent)
            .field("settings", &self.settings.len())
            .finish()
    }
}

impl RegisterRequest {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            unique_id: None,
            capabilities: Vec::new(),
            parent: None,
            settings: Vec::new(),
            instance: None,
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn with_parent(mut self, parent: ObjectId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Declare a setting topic created at `registry/<unique_id>/settings/<name>`.
    pub fn with_setting(mut self, name: impl Into<String>, meta: Metadata) -> Self {
        self.settings.push((name.into(), meta));
        self
    }

    /// Attach the object itself. Only a weak reference is kept.
    pub fn with_instance<T: Any + Send + Sync>(mut self, instance: &Arc<T>) -> Self {
        let strong: Arc<dyn Any + Send + Sync> = instance.clone();
        self.instance = Some(Arc::downgrade(&strong));
        self
    }
}

/// Lifecycle state of a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Registered,
    Unregistering,
}

/// Existence record of a registered object.
#[derive(Clone)]
pub struct RegistryEntry {
    pub id: ObjectId,
    pub unique_id: String,
    pub class_name: String,
    pub capabilities: Vec<Capability>,
    pub parent: Option<ObjectId>,
    pub children: Vec<ObjectId>,
    pub state: ObjectState,
    instance: Option<Instance>,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("id", &self.id)
            .field("unique_id", &self.unique_id)
            .field("class_name", &self.class_name)
            .field("capabilities", &self.capabilities)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("state", &self.state)
            .finish()
    }
}

impl RegistryEntry {
    /// Root topic of this object's subtree
    pub fn topic(&self) -> String {
        topic::join(REGISTRY_TOPIC, &self.unique_id)
    }
}

/// Existence records, unique-id lookup and the capability index.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<ObjectId, RegistryEntry>,
    by_unique_id: HashMap<String, ObjectId>,
    by_capability: HashMap<Capability, Vec<ObjectId>>,
    class_counters: HashMap<String, u64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn allocate_unique_id(&mut self, class_name: &str) -> String {
        loop {
            let counter = self.class_counters.entry(class_name.to_string()).or_insert(0);
            *counter += 1;
            let candidate = format!("{}:{:03}", class_name, counter);
            if !self.by_unique_id.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Create the existence record under `id`. Topic creation is done by
    /// the caller.
    pub fn insert(&mut self, id: ObjectId, request: &RegisterRequest) -> Result<()> {
        topic::validate_segment_name(&request.class_name)?;
        if self.entries.contains_key(&id) {
            return Err(PubSubError::DuplicateObject(id.to_string()));
        }
        if let Some(parent) = request.parent {
            if !self.entries.contains_key(&parent) {
                return Err(PubSubError::UnknownObject(parent));
            }
        }
        let unique_id = match &request.unique_id {
            Some(uid) => {
                topic::validate_segment_name(uid)?;
                if self.by_unique_id.contains_key(uid) {
                    return Err(PubSubError::DuplicateObject(uid.clone()));
                }
                uid.clone()
            }
            None => self.allocate_unique_id(&request.class_name),
        };

        if let Some(parent) = request.parent.and_then(|p| self.entries.get_mut(&p)) {
            parent.children.push(id);
        }
        for cap in &request.capabilities {
            self.by_capability.entry(*cap).or_default().push(id);
        }
        self.by_unique_id.insert(unique_id.clone(), id);
        self.entries.insert(
            id,
            RegistryEntry {
                id,
                unique_id,
                class_name: request.class_name.clone(),
                capabilities: request.capabilities.clone(),
                parent: request.parent,
                children: Vec::new(),
                state: ObjectState::Registered,
                instance: request.instance.clone(),
            },
        );
        Ok(())
    }

    /// Mark `id` and its descendants as unregistering and return them
    /// children first, in the order they must be torn down.
    pub fn unregister_order(&mut self, id: ObjectId) -> Result<Vec<ObjectId>> {
        if !self.entries.contains_key(&id) {
            return Err(PubSubError::UnknownObject(id));
        }
        let mut order = Vec::new();
        self.postorder(id, &mut order);
        for oid in &order {
            if let Some(entry) = self.entries.get_mut(oid) {
                entry.state = ObjectState::Unregistering;
            }
        }
        Ok(order)
    }

    fn postorder(&self, id: ObjectId, out: &mut Vec<ObjectId>) {
        if let Some(entry) = self.entries.get(&id) {
            for child in &entry.children {
                self.postorder(*child, out);
            }
            out.push(id);
        }
    }

    /// Drop the existence record and unlink it from its parent and the
    /// capability index.
    pub fn remove(&mut self, id: ObjectId) -> Option<RegistryEntry> {
        let entry = self.entries.remove(&id)?;
        self.by_unique_id.remove(&entry.unique_id);
        if let Some(parent) = entry.parent.and_then(|p| self.entries.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        for cap in &entry.capabilities {
            if let Some(ids) = self.by_capability.get_mut(cap) {
                ids.retain(|c| *c != id);
            }
        }
        Some(entry)
    }

    pub fn get(&self, id: ObjectId) -> Option<&RegistryEntry> {
        self.entries.get(&id)
    }

    pub fn lookup(&self, unique_id: &str) -> Option<ObjectId> {
        self.by_unique_id.get(unique_id).copied()
    }

    /// Registered objects providing `capability`, in registration order.
    pub fn find_by_capability(&self, capability: Capability) -> Vec<ObjectId> {
        self.by_capability
            .get(&capability)
            .cloned()
            .unwrap_or_default()
    }

    /// Unique ids providing `capability`, as mirrored in the list topic.
    pub fn capability_unique_ids(&self, capability: Capability) -> Vec<String> {
        self.find_by_capability(capability)
            .into_iter()
            .filter_map(|id| self.entries.get(&id).map(|e| e.unique_id.clone()))
            .collect()
    }

    pub fn children(&self, id: ObjectId) -> Vec<ObjectId> {
        self.entries
            .get(&id)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    /// The registered object, if it is still alive and of type `T`.
    pub fn instance<T: Any + Send + Sync>(&self, id: ObjectId) -> Option<Arc<T>> {
        self.entries
            .get(&id)?
            .instance
            .as_ref()?
            .upgrade()?
            .downcast::<T>()
            .ok()
    }
}
