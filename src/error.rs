//! Error handling for the PubSub engine
//!
//! This module defines the crate error type and a Result alias used
//! throughout the engine. Every error here is recoverable: lookup and
//! validation failures are returned to the caller of `publish`/`topic_add`,
//! persistence failures fall back to defaults, and registry inconsistencies
//! are reported without tearing anything down.

use std::path::PathBuf;
use thiserror::Error;

use crate::registry::ObjectId;

/// Main error type for PubSub operations
#[derive(Error, Debug)]
pub enum PubSubError {
    /// The topic has not been added to the topic tree
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// The topic already exists with conflicting metadata
    #[error("Duplicate topic: {0}")]
    DuplicateTopic(String),

    /// The topic string violates the path rules
    #[error("Invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// The value (or metadata default) does not satisfy the topic metadata
    #[error("Validation failed for {topic}: {reason}")]
    Validation { topic: String, reason: String },

    /// A persisted profile or history file could not be parsed
    #[error("Corrupt profile {path:?}: {reason}")]
    CorruptProfile { path: PathBuf, reason: String },

    /// A blocking call was issued from the processing context itself
    #[error("Blocking call from the processing context would deadlock")]
    DeadlockRisk,

    /// The dispatcher can only be started once, from the processing context
    #[error("Dispatcher unavailable: {0}")]
    Dispatcher(String),

    /// The registry has no object with this id
    #[error("Unknown object: {0}")]
    UnknownObject(ObjectId),

    /// An object with this unique id is already registered
    #[error("Duplicate object: {0}")]
    DuplicateObject(String),

    /// A command handler is already installed for this topic
    #[error("Command handler already installed for {0}")]
    CommandExists(String),

    /// Callback re-publishes nested deeper than allowed
    #[error("Nesting depth {0} exceeded while processing {1}")]
    NestingDepth(usize, String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PubSubError>,
    },
}

impl PubSubError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PubSubError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a validation failure
    pub fn validation(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        PubSubError::Validation {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// The innermost error, with any context layers stripped
    pub fn root(&self) -> &PubSubError {
        match self {
            PubSubError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for `UnknownTopic`, looking through context layers
    pub fn is_unknown_topic(&self) -> bool {
        matches!(self.root(), PubSubError::UnknownTopic(_))
    }

    /// True for `Validation`, looking through context layers
    pub fn is_validation(&self) -> bool {
        matches!(self.root(), PubSubError::Validation { .. })
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(err: serde_json::Error) -> Self {
        PubSubError::Serialization(err.to_string())
    }
}

/// Result type alias for PubSub operations
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| PubSubError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PubSubError::Io(e).with_context(f()))
    }
}
