//! # jsui-pubsub: Topic-addressed state and command engine
//!
//! An in-process publish-subscribe engine holding all application state
//! as retained topic values. Front ends (GUI widgets, device drivers, CLI
//! tools) interact with each other only through topics.
//!
//! ## Architecture
//!
//! - **Topic tree**: hierarchical `/`-separated namespace of retained values
//! - **Metadata**: per-topic schema used to validate and coerce values
//! - **Dispatcher**: single processing context with a crossbeam FIFO queue
//!   for requests from other threads
//! - **Undo/redo**: every top-level request becomes a reversible transaction
//! - **Registry**: live objects, their capabilities and parent/child lifecycle
//! - **Profiles**: named snapshots of retained values with versioned history
//!
//! ## Configuration
//!
//! Engine configuration is stored as `pubsub.toml` in the platform data
//! directory under `joulescope-ui` (see [`config`]).
//!
//! ## Example
//!
//! ```
//! use jsui_pubsub::{DType, Metadata, PubSub, SubscribeFlags, Value};
//! use std::sync::{Arc, Mutex};
//!
//! let pubsub = PubSub::default();
//! pubsub
//!     .topic_add("device/gain", Metadata::new(DType::U8, "Gain").with_range(0.0, 10.0))
//!     .unwrap();
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! pubsub
//!     .subscribe("device", SubscribeFlags::PUB, move |_: &PubSub, topic: &str, value: &Value| {
//!         sink.lock().unwrap().push((topic.to_string(), value.clone()));
//!     })
//!     .unwrap();
//!
//! pubsub.publish("device/gain", 5).unwrap();
//! assert_eq!(seen.lock().unwrap().len(), 1);
//! ```

pub mod config;
pub mod error;
pub mod metadata;
pub mod profile;
pub mod pubsub;
pub mod registry;
pub mod subscription;
pub mod topic;
pub mod tree;
pub mod undo;
pub mod value;
pub mod versioned_file;

// Re-export commonly used types
pub use config::PubSubConfig;
pub use error::{PubSubError, Result, ResultExt};
pub use metadata::{DType, Flag, Metadata, OptionEntry, Range};
pub use profile::{LoadReport, ProfileManager, ProfileSummary};
pub use pubsub::{DispatcherHandle, PubSub};
pub use registry::{Capability, ObjectId, RegisterRequest, RegistryEntry};
pub use subscription::{Reversal, SubscribeFlags, SubscriptionId};
pub use value::Value;
