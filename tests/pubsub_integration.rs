//! Integration tests for the topic API
//!
//! These tests exercise the engine through its public handle:
//! - Validation, retention and query
//! - Delivery rules (dedup, ephemeral topics, subtree subscriptions)
//! - Command handlers and undo/redo

mod common;

use common::builders::{self, PubSubBuilder};
use common::Recorder;
use jsui_pubsub::{DType, Flag, Metadata, PubSub, PubSubError, SubscribeFlags, Value};

#[test]
fn test_gain_scenario() {
    let pubsub = PubSub::default();
    pubsub
        .topic_add(
            "device/gain",
            Metadata::new(DType::U8, "Gain").with_range(0.0, 10.0),
        )
        .unwrap();

    pubsub.publish("device/gain", 5).unwrap();
    assert_eq!(pubsub.query("device/gain").unwrap().as_i64(), Some(5));

    let err = pubsub.publish("device/gain", 99).unwrap_err();
    assert!(err.is_validation());
    assert_eq!(pubsub.query("device/gain").unwrap().as_i64(), Some(5));
}

#[test]
fn test_invalid_values_leave_retained_value() {
    let pubsub = PubSubBuilder::new().device("dev").build();
    pubsub.publish("dev/settings/gain", 3).unwrap();
    pubsub.publish("dev/settings/range", "10 A").unwrap();

    for bad in [Value::from(-1), Value::from(11), Value::from("loud"), Value::from(2.5)] {
        assert!(pubsub.publish("dev/settings/gain", bad).is_err());
    }
    assert!(pubsub.publish("dev/settings/range", "2 A").is_err());
    assert!(pubsub.publish("dev/settings/range", 10).is_err());

    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(3));
    assert_eq!(pubsub.query("dev/settings/range").unwrap(), Value::from("10 A"));
}

#[test]
fn test_coercion_and_aliases() {
    let pubsub = PubSubBuilder::new().device("dev").build();

    pubsub.publish("dev/settings/gain", "7").unwrap();
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(7));

    pubsub.publish("dev/settings/gain", 4.0).unwrap();
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(4));

    pubsub.publish("dev/settings/range", "automatic").unwrap();
    assert_eq!(pubsub.query("dev/settings/range").unwrap(), Value::from("auto"));

    pubsub.publish("dev/settings/enabled", "on").unwrap();
    assert_eq!(pubsub.query("dev/settings/enabled").unwrap(), Value::Bool(true));
}

#[test]
fn test_unknown_and_malformed_topics() {
    let pubsub = PubSub::default();
    assert!(pubsub.publish("nope", 1).unwrap_err().is_unknown_topic());
    assert!(pubsub.query("nope").unwrap_err().is_unknown_topic());
    assert!(pubsub.metadata("nope").is_err());
    assert!(pubsub.subscribe("nope", SubscribeFlags::PUB, |_: &PubSub, _: &str, _: &Value| {}).is_err());

    for bad in ["", "/a", "a/", "a//b", "a/b$", "a/~b"] {
        assert!(
            pubsub.topic_add(bad, builders::gain()).is_err(),
            "{:?} should be rejected",
            bad
        );
    }
}

#[test]
fn test_duplicate_topic_add() {
    let pubsub = PubSub::default();
    pubsub.topic_add("a/b", builders::gain()).unwrap();
    // Identical redefinition is accepted
    pubsub.topic_add("a/b", builders::gain()).unwrap();

    let err = pubsub.topic_add("a/b", builders::name()).unwrap_err();
    assert!(matches!(err, PubSubError::DuplicateTopic(_)));

    // A newer schema version supersedes the definition
    pubsub
        .topic_add("a/b", builders::name().with_version(2))
        .unwrap();
    assert_eq!(pubsub.metadata("a/b").unwrap().dtype, DType::Str);
}

#[test]
fn test_implicit_parents() {
    let pubsub = PubSub::default();
    pubsub.topic_add("a/b/c", builders::gain()).unwrap();
    assert!(pubsub.contains("a"));
    assert!(pubsub.contains("a/b"));
    assert_eq!(pubsub.metadata("a/b").unwrap().dtype, DType::Node);
    assert!(pubsub.publish("a/b", 1).is_err());

    pubsub.topic_add("a/b", builders::name()).unwrap();
    assert_eq!(pubsub.metadata("a/b").unwrap().dtype, DType::Str);
    assert_eq!(pubsub.enumerate("a", true, true).unwrap(), vec!["a/b", "a/b/c"]);
    assert_eq!(pubsub.enumerate("a/b", false, false).unwrap(), vec!["c"]);
}

#[test]
fn test_retained_dedup_and_ephemeral_delivery() {
    let pubsub = PubSubBuilder::new().device("dev").build();
    let settings = Recorder::new();
    let actions = Recorder::new();
    pubsub
        .subscribe("dev/settings/gain", SubscribeFlags::PUB, settings.callback())
        .unwrap();
    pubsub
        .subscribe("dev/actions/!reset", SubscribeFlags::PUB, actions.callback())
        .unwrap();

    pubsub.publish("dev/settings/gain", 5).unwrap();
    pubsub.publish("dev/settings/gain", 5).unwrap();
    assert_eq!(settings.len(), 1);

    pubsub.publish("dev/actions/!reset", Value::Null).unwrap();
    pubsub.publish("dev/actions/!reset", Value::Null).unwrap();
    assert_eq!(actions.len(), 2);
    assert!(pubsub.query("dev/actions/!reset").unwrap().is_null());
}

#[test]
fn test_no_dedup_flag() {
    let pubsub = PubSubBuilder::new()
        .topic(
            "stream/sample",
            Metadata::new(DType::Float, "Sample").with_flag(Flag::NoDedup),
        )
        .build();
    let rec = Recorder::new();
    pubsub
        .subscribe("stream", SubscribeFlags::PUB, rec.callback())
        .unwrap();
    for _ in 0..3 {
        pubsub.publish("stream/sample", 1.5).unwrap();
    }
    assert_eq!(rec.len(), 3);
}

#[test]
fn test_subtree_subscription_and_unsubscribe() {
    let pubsub = PubSubBuilder::new().device("d1").device("d2").build();
    let rec = Recorder::new();
    let id = pubsub
        .subscribe("d1", SubscribeFlags::PUB, rec.callback())
        .unwrap();

    pubsub.publish("d1/settings/gain", 2).unwrap();
    pubsub.publish("d2/settings/gain", 2).unwrap();
    pubsub.publish("d1/settings/enabled", true).unwrap();
    assert_eq!(rec.topics(), vec!["d1/settings/gain", "d1/settings/enabled"]);

    pubsub.unsubscribe(id).unwrap();
    pubsub.publish("d1/settings/gain", 3).unwrap();
    assert_eq!(rec.len(), 2);
}

#[test]
fn test_retain_replays_current_values() {
    let pubsub = PubSubBuilder::new().device("dev").build();
    pubsub.publish("dev/settings/gain", 9).unwrap();

    let rec = Recorder::new();
    pubsub
        .subscribe(
            "dev/settings",
            SubscribeFlags::PUB | SubscribeFlags::RETAIN,
            rec.callback(),
        )
        .unwrap();
    assert_eq!(rec.values_for("dev/settings/gain"), vec![Value::from(9)]);
    assert_eq!(rec.values_for("dev/settings/range"), vec![Value::from("auto")]);
    assert!(rec.topics().iter().all(|t| !t.contains('!')));
}

#[test]
fn test_metadata_and_remove_channels() {
    let pubsub = PubSubBuilder::new().device("dev").build();
    let rec = Recorder::new();
    pubsub
        .subscribe(
            "dev",
            SubscribeFlags::METADATA | SubscribeFlags::REMOVE,
            rec.callback(),
        )
        .unwrap();

    pubsub.topic_add("dev/settings/name", builders::name()).unwrap();
    pubsub.topic_remove("dev/settings").unwrap();

    let topics = rec.topics();
    assert_eq!(topics, vec!["dev/settings/name$", "dev/settings~"]);
    assert!(!pubsub.contains("dev/settings/gain"));
    assert!(pubsub.topic_remove("dev/settings").is_err());
}

#[test]
fn test_undo_redo_round_trip() {
    let pubsub = PubSubBuilder::new().device("dev").build();
    pubsub.publish("dev/settings/gain", 4).unwrap();
    pubsub.publish("dev/settings/gain", 8).unwrap();

    assert_eq!(pubsub.undo(1).unwrap(), 1);
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(4));
    assert_eq!(pubsub.redo(1).unwrap(), 1);
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(8));

    assert_eq!(pubsub.undo(5).unwrap(), 2);
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(1));
    assert_eq!(pubsub.undo(1).unwrap(), 0);

    // A new publish invalidates the redo history
    pubsub.publish("dev/settings/gain", 6).unwrap();
    assert_eq!(pubsub.redo_len(), 0);
    assert_eq!(pubsub.redo(1).unwrap(), 0);
}

#[test]
fn test_undo_notifies_subscribers() {
    let pubsub = PubSubBuilder::new().device("dev").build();
    pubsub.publish("dev/settings/range", "10 A").unwrap();
    let rec = Recorder::new();
    pubsub
        .subscribe("dev/settings/range", SubscribeFlags::PUB, rec.callback())
        .unwrap();
    pubsub.undo(1).unwrap();
    assert_eq!(rec.values_for("dev/settings/range"), vec![Value::from("auto")]);
}

#[test]
fn test_callback_publish_is_one_transaction() {
    let pubsub = PubSubBuilder::new().device("dev").build();
    // Enabling the device resets its gain
    pubsub
        .subscribe(
            "dev/settings/enabled",
            SubscribeFlags::PUB,
            |ps: &PubSub, _: &str, value: &Value| {
                if value.as_bool() == Some(true) {
                    ps.publish("dev/settings/gain", 0).unwrap();
                }
            },
        )
        .unwrap();
    pubsub.publish("dev/settings/gain", 7).unwrap();
    pubsub.publish("dev/settings/enabled", true).unwrap();
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(0));
    assert_eq!(pubsub.undo_len(), 2);

    pubsub.undo(1).unwrap();
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(7));
    assert_eq!(pubsub.query("dev/settings/enabled").unwrap(), Value::Bool(false));
}

#[test]
fn test_command_handler_reversal() {
    let pubsub = PubSubBuilder::new().device("dev").build();
    pubsub
        .command("dev/actions/!reset", None, |ps: &PubSub, _: &str, _: &Value| {
            let previous = ps.query("dev/settings/gain")?;
            ps.publish("dev/settings/gain", 0)?;
            Ok(Some(vec![("dev/settings/gain".to_string(), previous)]))
        })
        .unwrap();

    let err = pubsub
        .command("dev/actions/!reset", None, |_: &PubSub, _: &str, _: &Value| Ok(None))
        .unwrap_err();
    assert!(matches!(err, PubSubError::CommandExists(_)));
    assert!(pubsub
        .command("dev/settings/gain", None, |_: &PubSub, _: &str, _: &Value| Ok(None))
        .is_err());

    pubsub.publish("dev/settings/gain", 7).unwrap();
    pubsub.publish("dev/actions/!reset", Value::Null).unwrap();
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(0));

    pubsub.undo(1).unwrap();
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(7));
    pubsub.redo(1).unwrap();
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(0));
}

#[test]
fn test_undo_skips_removed_topic() {
    let pubsub = PubSubBuilder::new()
        .topic("x", builders::gain())
        .topic("y", builders::gain())
        .build();
    pubsub.publish("x", 2).unwrap();
    pubsub.publish("y", 3).unwrap();
    pubsub.publish("x", 4).unwrap();
    pubsub.topic_remove("x").unwrap();

    // Steps for x are dropped, the rest of the history still replays
    assert_eq!(pubsub.undo(3).unwrap(), 3);
    assert!(!pubsub.contains("x"));
    assert_eq!(pubsub.query("y").unwrap().as_i64(), Some(1));
    assert_eq!(pubsub.redo_len(), 3);
}

#[test]
fn test_redo_skips_removed_topic() {
    let pubsub = PubSubBuilder::new()
        .topic("x", builders::gain())
        .topic("y", builders::gain())
        .build();
    pubsub.publish("x", 2).unwrap();
    pubsub.publish("y", 3).unwrap();
    assert_eq!(pubsub.undo(2).unwrap(), 2);
    pubsub.topic_remove("x").unwrap();

    assert_eq!(pubsub.redo(2).unwrap(), 2);
    assert!(!pubsub.contains("x"));
    assert_eq!(pubsub.query("y").unwrap().as_i64(), Some(3));
}

#[test]
fn test_undo_depth_is_bounded() {
    let pubsub = PubSubBuilder::new().undo_depth(3).device("dev").build();
    for gain in 2..=8 {
        pubsub.publish("dev/settings/gain", gain).unwrap();
    }
    assert_eq!(pubsub.undo_len(), 3);
    assert_eq!(pubsub.undo(10).unwrap(), 3);
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(5));
}

#[test]
fn test_undo_clear() {
    let pubsub = PubSubBuilder::new().device("dev").build();
    pubsub.publish("dev/settings/gain", 2).unwrap();
    pubsub.undo_clear().unwrap();
    assert_eq!(pubsub.undo_len(), 0);
    assert_eq!(pubsub.undo(1).unwrap(), 0);
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(2));
}

#[test]
fn test_unsubscribe_during_delivery() {
    let pubsub = PubSubBuilder::new().device("dev").build();
    let rec = Recorder::new();
    let late = pubsub
        .subscribe("dev", SubscribeFlags::PUB, rec.callback())
        .unwrap();
    // Subscribers on the topic itself run before ancestors
    pubsub
        .subscribe(
            "dev/settings/gain",
            SubscribeFlags::PUB,
            move |ps: &PubSub, _: &str, _: &Value| {
                ps.unsubscribe(late).unwrap();
            },
        )
        .unwrap();
    pubsub.publish("dev/settings/gain", 2).unwrap();
    assert_eq!(rec.len(), 0);
}
