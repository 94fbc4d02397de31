//! Test data builders for topics and engines

use jsui_pubsub::{DType, Flag, Metadata, OptionEntry, PubSub, PubSubConfig};

/// `u8` gain setting in 0..=10, default 1
pub fn gain() -> Metadata {
    Metadata::new(DType::U8, "Gain")
        .with_range(0.0, 10.0)
        .with_default(1)
}

/// Current range selector with labelled options and aliases
pub fn current_range() -> Metadata {
    Metadata::new(DType::Str, "Current range")
        .with_default("auto")
        .with_options([
            OptionEntry::labeled("auto", "Auto").with_alias("automatic"),
            OptionEntry::labeled("10 A", "10 A"),
            OptionEntry::labeled("180 mA", "180 mA"),
        ])
}

pub fn enabled() -> Metadata {
    Metadata::new(DType::Bool, "Enabled").with_default(false)
}

pub fn name() -> Metadata {
    Metadata::new(DType::Str, "Name").with_default("")
}

/// Ephemeral action topic metadata
pub fn action() -> Metadata {
    Metadata::new(DType::Obj, "Action").with_flag(Flag::NoDedup)
}

/// Builder for an engine pre-populated with topics
pub struct PubSubBuilder {
    config: PubSubConfig,
    topics: Vec<(String, Metadata)>,
}

impl PubSubBuilder {
    pub fn new() -> Self {
        Self {
            config: PubSubConfig::default(),
            topics: Vec::new(),
        }
    }

    pub fn undo_depth(mut self, depth: usize) -> Self {
        self.config.dispatch.undo_depth = depth;
        self
    }

    pub fn blocking_timeout_ms(mut self, ms: u64) -> Self {
        self.config.dispatch.blocking_timeout_ms = ms;
        self
    }

    pub fn topic(mut self, topic: &str, meta: Metadata) -> Self {
        self.topics.push((topic.to_string(), meta));
        self
    }

    /// A device with gain, range, enable and an ephemeral reset action
    pub fn device(self, name: &str) -> Self {
        self.topic(&format!("{}/settings/gain", name), gain())
            .topic(&format!("{}/settings/range", name), current_range())
            .topic(&format!("{}/settings/enabled", name), enabled())
            .topic(&format!("{}/actions/!reset", name), action())
    }

    pub fn build(self) -> PubSub {
        let pubsub = PubSub::new(self.config);
        for (topic, meta) in self.topics {
            pubsub.topic_add(&topic, meta).unwrap();
        }
        pubsub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_builder() {
        let pubsub = PubSubBuilder::new().device("dev").build();
        assert!(pubsub.contains("dev/settings/gain"));
        assert!(pubsub.contains("dev/actions/!reset"));
        assert_eq!(pubsub.metadata("dev/settings/range").unwrap().dtype, DType::Str);
    }
}
