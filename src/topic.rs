//! Topic path rules
//!
//! A topic is a `/`-separated path such as
//! `registry/dev1/settings/gain`. Topics are case-sensitive, never start
//! or end with the separator, and never contain empty segments.
//!
//! Segments use ASCII letters, digits and `_ - . :`. A few characters are
//! reserved for framing:
//!
//! - `!` at the start of the final segment marks an ephemeral channel
//!   (command, event or callback) that is delivered but never retained
//! - `$` suffix names the metadata channel of a topic (`gain$`)
//! - `~` suffix names the removal channel of a topic (`gain~`)
//! - `#`, `*`, `+` and `?` are reserved for completion and wildcard markers

use crate::error::{PubSubError, Result};

/// Segment separator
pub const SEPARATOR: char = '/';

/// Prefix marking an ephemeral (non-retained) segment
pub const EPHEMERAL_PREFIX: char = '!';

/// Suffix of the derived metadata channel
pub const METADATA_SUFFIX: char = '$';

/// Suffix of the derived removal channel
pub const REMOVE_SUFFIX: char = '~';

/// Characters reserved for framing, never valid inside a segment
pub const RESERVED: &[char] = &['$', '~', '#', '*', '+', '?'];

fn invalid(topic: &str, reason: impl Into<String>) -> PubSubError {
    PubSubError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.into(),
    }
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

/// Check a topic string against the path rules.
pub fn validate(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(invalid(topic, "empty topic"));
    }
    if topic.starts_with(SEPARATOR) || topic.ends_with(SEPARATOR) {
        return Err(invalid(topic, "leading or trailing separator"));
    }
    let mut segments = topic.split(SEPARATOR).peekable();
    while let Some(segment) = segments.next() {
        validate_segment(topic, segment)?;
        // Ephemeral topics hold no value, so they cannot have children
        if segments.peek().is_some() && segment.starts_with(EPHEMERAL_PREFIX) {
            return Err(invalid(topic, "only the last segment may be ephemeral"));
        }
    }
    Ok(())
}

fn validate_segment(topic: &str, segment: &str) -> Result<()> {
    let body = segment.strip_prefix(EPHEMERAL_PREFIX).unwrap_or(segment);
    if body.is_empty() {
        return Err(invalid(topic, "empty segment"));
    }
    if let Some(c) = body.chars().find(|c| RESERVED.contains(c)) {
        return Err(invalid(topic, format!("reserved character {:?}", c)));
    }
    if let Some(c) = body.chars().find(|c| !is_segment_char(*c)) {
        return Err(invalid(topic, format!("character {:?} not allowed", c)));
    }
    Ok(())
}

/// Check a single segment, as used for object unique ids and setting names.
pub fn validate_segment_name(name: &str) -> Result<()> {
    if name.starts_with(EPHEMERAL_PREFIX) {
        return Err(invalid(name, "segment name may not be ephemeral"));
    }
    validate_segment(name, name)
}

/// True when the final segment is ephemeral (`.../!name`).
pub fn is_ephemeral(topic: &str) -> bool {
    leaf(topic).starts_with(EPHEMERAL_PREFIX)
}

/// Final segment of a topic.
pub fn leaf(topic: &str) -> &str {
    topic.rsplit(SEPARATOR).next().unwrap_or(topic)
}

/// Parent topic, or None for a top-level topic.
pub fn parent(topic: &str) -> Option<&str> {
    topic.rfind(SEPARATOR).map(|idx| &topic[..idx])
}

/// Join a parent topic and a child segment path.
pub fn join(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}{}{}", parent, SEPARATOR, child)
    }
}

/// The topic itself followed by each ancestor, nearest first.
pub fn ancestors(topic: &str) -> Ancestors<'_> {
    Ancestors {
        current: Some(topic),
    }
}

/// True when `topic` equals `root` or lies in its subtree.
pub fn is_within(topic: &str, root: &str) -> bool {
    topic == root
        || (topic.len() > root.len()
            && topic.starts_with(root)
            && topic[root.len()..].starts_with(SEPARATOR))
}

/// Derived metadata channel name (`topic$`).
pub fn metadata_topic(topic: &str) -> String {
    format!("{}{}", topic, METADATA_SUFFIX)
}

/// Derived removal channel name (`topic~`).
pub fn remove_topic(topic: &str) -> String {
    format!("{}{}", topic, REMOVE_SUFFIX)
}

/// Iterator returned by [`ancestors`].
pub struct Ancestors<'a> {
    current: Option<&'a str>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = parent(current);
        Some(current)
    }
}
