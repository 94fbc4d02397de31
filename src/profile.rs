//! Profile persistence
//!
//! A profile is a named snapshot of retained topic values. Topics under
//! `common/` hold settings shared by every profile and are stored in
//! `common.json`; everything else goes to `<name>.json`. Each write keeps
//! a rotating history (see [`crate::versioned_file`]).
//!
//! # File format
//!
//! ```text
//! {
//!   "schema": "jsui-profile",
//!   "version": 1,
//!   "name": "default",
//!   "description": "",
//!   "saved_at": "2024-01-01T12:00:00Z",
//!   "values": { "registry/app/settings/theme": "dark", ... }
//! }
//! ```
//!
//! Loading publishes every stored value through the normal validation
//! and delivery path. A value that no longer validates falls back to the
//! topic's default; an unreadable file falls back to defaults for the
//! whole file. Neither aborts startup.

use crate::config::PubSubConfig;
use crate::error::{PubSubError, Result, ResultExt};
use crate::metadata::{DType, Flag, Metadata};
use crate::pubsub::PubSub;
use crate::topic;
use crate::value::Value;
use crate::versioned_file;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Schema marker written into every profile file
pub const PROFILE_SCHEMA: &str = "jsui-profile";

/// Current profile file format version
pub const PROFILE_VERSION: u32 = 1;

/// File name (without extension) of the shared settings
pub const COMMON_PROFILE: &str = "common";

/// Topic subtree persisted in the shared settings file
pub const COMMON_TOPIC: &str = "common";

const EXTENSION: &str = "json";

/// On-disk profile contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFile {
    pub schema: String,
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub saved_at: DateTime<Utc>,
    /// Topic to JSON value; decoded per key so one bad entry does not
    /// spoil the rest
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Entry returned by [`ProfileManager::list`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSummary {
    pub name: String,
    pub description: String,
    /// None when the file could not be read
    pub saved_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
    /// Number of previous versions available for revert
    pub history: usize,
}

/// What happened to each key of a loaded profile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Published from the file
    pub applied: Vec<String>,
    /// Invalid stored value, reset to the topic default
    pub defaulted: Vec<String>,
    /// Not defined in the topic tree, ignored
    pub unknown: Vec<String>,
    /// Defined but excluded from restore (ro, noinit, tmp, structural)
    pub skipped: Vec<String>,
}

impl LoadReport {
    pub fn merge(&mut self, other: LoadReport) {
        self.applied.extend(other.applied);
        self.defaulted.extend(other.defaulted);
        self.unknown.extend(other.unknown);
        self.skipped.extend(other.skipped);
    }
}

/// True when a topic's value belongs in a profile.
fn persistable(meta: &Metadata) -> bool {
    meta.is_persistent() && !meta.has_flag(Flag::NoInit) && !meta.has_flag(Flag::ReadOnly)
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != COMMON_PROFILE
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(PubSubError::Config(format!("Invalid profile name {:?}", name)))
    }
}

/// Which part of the topic tree a file covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Common,
    Profile,
}

impl Scope {
    fn covers(self, t: &str) -> bool {
        topic::is_within(t, COMMON_TOPIC) == (self == Scope::Common)
    }
}

/// Saves and restores profiles for one engine.
#[derive(Debug, Clone)]
pub struct ProfileManager {
    pubsub: PubSub,
    dir: PathBuf,
    history_count: usize,
}

impl ProfileManager {
    pub fn new(pubsub: PubSub, dir: impl Into<PathBuf>, history_count: usize) -> Self {
        Self {
            pubsub,
            dir: dir.into(),
            history_count,
        }
    }

    /// Manager using the configured profile directory and history count
    pub fn from_config(pubsub: PubSub, config: &PubSubConfig) -> Result<Self> {
        Ok(Self::new(
            pubsub,
            config.profile_dir()?,
            config.persistence.history_count,
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a profile's current file
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, EXTENSION))
    }

    /// Saved profiles, sorted by name. The common file is not listed.
    pub fn list(&self) -> Result<Vec<ProfileSummary>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries =
            std::fs::read_dir(&self.dir).with_context(|| format!("listing {:?}", self.dir))?;
        let mut profiles: Vec<ProfileSummary> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(EXTENSION))
            .filter_map(|p| {
                let name = p.file_stem()?.to_str()?.to_string();
                validate_name(&name).ok()?;
                let header = read_file(&p).ok();
                Some(ProfileSummary {
                    description: header
                        .as_ref()
                        .map(|h| h.description.clone())
                        .unwrap_or_default(),
                    saved_at: header.map(|h| h.saved_at),
                    history: versioned_file::versions(&p).len(),
                    path: p,
                    name,
                })
            })
            .collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    fn snapshot(&self, scope: Scope) -> BTreeMap<String, serde_json::Value> {
        self.pubsub.with_tree(|tree| {
            tree.iter()
                .filter(|(t, _)| scope.covers(t) && !topic::is_ephemeral(t))
                .filter(|(_, node)| persistable(&node.meta))
                .filter_map(|(t, node)| node.value.as_ref().map(|v| (t.to_string(), v.to_json())))
                .collect()
        })
    }

    fn write(&self, path: &Path, name: &str, description: &str, scope: Scope) -> Result<()> {
        let file = ProfileFile {
            schema: PROFILE_SCHEMA.to_string(),
            version: PROFILE_VERSION,
            name: name.to_string(),
            description: description.to_string(),
            saved_at: Utc::now(),
            values: self.snapshot(scope),
        };
        let contents = serde_json::to_vec_pretty(&file)?;
        versioned_file::write(path, &contents, self.history_count)
            .with_context(|| format!("saving profile {}", name))?;
        tracing::info!("Saved profile {} ({} values)", name, file.values.len());
        Ok(())
    }

    /// Save the current non-common values as profile `name`.
    pub fn save(&self, name: &str, description: &str) -> Result<PathBuf> {
        validate_name(name)?;
        let path = self.path(name);
        self.write(&path, name, description, Scope::Profile)?;
        Ok(path)
    }

    /// Save the `common/` subtree.
    pub fn save_common(&self) -> Result<PathBuf> {
        let path = self.path(COMMON_PROFILE);
        self.write(&path, COMMON_PROFILE, "Settings shared by all profiles", Scope::Common)?;
        Ok(path)
    }

    /// Load profile `name`. Clears the undo history afterwards.
    pub fn load(&self, name: &str) -> Result<LoadReport> {
        validate_name(name)?;
        self.load_scope(&self.path(name), Scope::Profile)
    }

    /// Load the `common/` subtree.
    pub fn load_common(&self) -> Result<LoadReport> {
        self.load_scope(&self.path(COMMON_PROFILE), Scope::Common)
    }

    fn load_scope(&self, path: &Path, scope: Scope) -> Result<LoadReport> {
        let file = match read_file(path) {
            Ok(file) => file,
            Err(e) => {
                if matches!(e.root(), PubSubError::CorruptProfile { .. }) {
                    tracing::warn!("{}; restoring defaults", e);
                    self.restore_scope(Some(scope));
                    self.clear_history();
                }
                return Err(e);
            }
        };
        let report = self.apply(&file, scope);
        self.clear_history();
        tracing::info!(
            "Loaded profile {}: {} applied, {} defaulted, {} unknown",
            file.name,
            report.applied.len(),
            report.defaulted.len(),
            report.unknown.len()
        );
        Ok(report)
    }

    fn apply(&self, file: &ProfileFile, scope: Scope) -> LoadReport {
        let mut report = LoadReport::default();
        for (t, json) in &file.values {
            let meta = match self.pubsub.metadata(t) {
                Ok(meta) if scope.covers(t) => meta,
                _ => {
                    tracing::warn!("Profile {} has unknown topic {}", file.name, t);
                    report.unknown.push(t.clone());
                    continue;
                }
            };
            if !persistable(&meta) || topic::is_ephemeral(t) {
                report.skipped.push(t.clone());
                continue;
            }
            let result = Value::from_json(json.clone())
                .map_err(|reason| PubSubError::validation(t.as_str(), reason))
                .and_then(|value| self.publish(t, value));
            match result {
                Ok(()) => report.applied.push(t.clone()),
                Err(e) => {
                    tracing::warn!("Profile {}: {}; using default", file.name, e);
                    if let Some(default) = meta.default_value() {
                        if let Err(e) = self.publish(t, default) {
                            tracing::warn!("Failed to restore default of {}: {}", t, e);
                        }
                    }
                    report.defaulted.push(t.clone());
                }
            }
        }
        report
    }

    /// Republish the declared default of every restorable topic.
    /// Returns the number of topics published.
    pub fn restore_defaults(&self) -> usize {
        let count = self.restore_scope(None);
        self.clear_history();
        count
    }

    fn restore_scope(&self, scope: Option<Scope>) -> usize {
        let defaults: Vec<(String, Value)> = self.pubsub.with_tree(|tree| {
            tree.topics()
                .into_iter()
                .filter(|t| scope.map_or(true, |s| s.covers(t)) && !topic::is_ephemeral(t))
                .filter_map(|t| {
                    let node = tree.get(&t)?;
                    if node.meta.has_flag(Flag::ReadOnly) || node.meta.dtype == DType::Node {
                        return None;
                    }
                    node.meta.default_value().map(|d| (t, d))
                })
                .collect()
        });
        let mut count = 0;
        for (t, value) in defaults {
            match self.publish(&t, value) {
                Ok(()) => count += 1,
                Err(e) => tracing::warn!("Failed to restore default of {}: {}", t, e),
            }
        }
        tracing::debug!("Restored {} defaults", count);
        count
    }

    /// Load the common file and then profile `name`. Missing or corrupt
    /// files leave defaults in place; this never fails.
    pub fn startup(&self, name: &str) -> LoadReport {
        let mut report = LoadReport::default();
        for (label, result) in [
            (COMMON_PROFILE, self.load_common()),
            (name, self.load(name)),
        ] {
            match result {
                Ok(r) => report.merge(r),
                Err(e) if is_not_found(&e) => {
                    tracing::debug!("No saved {} profile, using defaults", label)
                }
                Err(e) => tracing::warn!("Startup load of {} failed: {}", label, e),
            }
        }
        report
    }

    /// Restore a previous version of profile `name`.
    pub fn revert(&self, name: &str, count: usize) -> Result<bool> {
        validate_name(name)?;
        versioned_file::revert(&self.path(name), count)
    }

    /// Delete profile `name` and its history.
    pub fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        versioned_file::remove(&self.path(name))
    }

    fn publish(&self, t: &str, value: Value) -> Result<()> {
        if self.pubsub.is_processing_context() {
            self.pubsub.publish(t, value)
        } else {
            self.pubsub.publish_blocking(t, value)
        }
    }

    fn clear_history(&self) {
        if let Err(e) = self.pubsub.undo_clear() {
            tracing::warn!("Failed to clear undo history: {}", e);
        }
    }
}

fn is_not_found(e: &PubSubError) -> bool {
    matches!(e.root(), PubSubError::Io(io) if io.kind() == std::io::ErrorKind::NotFound)
}

/// Read and check a profile file.
pub fn read_file(path: &Path) -> Result<ProfileFile> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading profile {:?}", path))?;
    let corrupt = |reason: String| PubSubError::CorruptProfile {
        path: path.to_path_buf(),
        reason,
    };
    let file: ProfileFile = serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;
    if file.schema != PROFILE_SCHEMA {
        return Err(corrupt(format!("unexpected schema {:?}", file.schema)));
    }
    if file.version > PROFILE_VERSION {
        tracing::warn!(
            "Profile {:?} has newer format version {}, reading what is understood",
            path,
            file.version
        );
    }
    Ok(file)
}
