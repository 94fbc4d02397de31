//! Integration tests for profile persistence
//!
//! These tests validate the save/load workflow:
//! - Save, mutate, load restores values and notifies subscribers
//! - Versioned history, revert and remove
//! - Recovery from stale or damaged files

mod common;

use common::builders::{self, PubSubBuilder};
use common::Recorder;
use jsui_pubsub::profile::{read_file, COMMON_PROFILE};
use jsui_pubsub::{
    DType, Flag, Metadata, ProfileManager, PubSub, PubSubConfig, PubSubError, SubscribeFlags,
    Value,
};
use serial_test::serial;
use tempfile::TempDir;

fn engine() -> PubSub {
    PubSubBuilder::new()
        .device("dev")
        .topic(
            "dev/settings/window",
            Metadata::new(DType::Bytes, "Window state").with_flag(Flag::Hide),
        )
        .topic(
            "dev/status/serial",
            builders::name().with_flag(Flag::ReadOnly),
        )
        .topic(
            "dev/status/temperature",
            Metadata::new(DType::Float, "Temperature").with_flag(Flag::Tmp),
        )
        .topic(
            "common/settings/theme",
            Metadata::new(DType::Str, "Theme").with_default("light"),
        )
        .build()
}

fn setup() -> (PubSub, ProfileManager, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pubsub = engine();
    let manager = ProfileManager::new(pubsub.clone(), dir.path(), 5);
    (pubsub, manager, dir)
}

#[test]
fn test_save_mutate_load_restores_and_notifies() {
    let (pubsub, manager, _dir) = setup();
    pubsub.publish("dev/settings/gain", 6).unwrap();
    pubsub.publish("dev/settings/range", "10 A").unwrap();
    pubsub.publish("dev/settings/window", Value::bytes(vec![1, 2, 3])).unwrap();
    manager.save("profileA", "bench setup").unwrap();

    pubsub.publish("dev/settings/gain", 2).unwrap();
    pubsub.publish("dev/settings/range", "auto").unwrap();
    pubsub.publish("dev/settings/window", Value::bytes(vec![9])).unwrap();

    let rec = Recorder::new();
    pubsub.subscribe("dev", SubscribeFlags::PUB, rec.callback()).unwrap();
    let report = manager.load("profileA").unwrap();

    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(6));
    assert_eq!(pubsub.query("dev/settings/range").unwrap(), Value::from("10 A"));
    assert_eq!(
        pubsub.query("dev/settings/window").unwrap(),
        Value::bytes(vec![1, 2, 3])
    );
    assert!(report.unknown.is_empty());
    assert!(report.defaulted.is_empty());

    // Unchanged topics (enabled) are deduplicated
    let mut changed = rec.topics();
    changed.sort();
    assert_eq!(
        changed,
        vec!["dev/settings/gain", "dev/settings/range", "dev/settings/window"]
    );
    assert_eq!(pubsub.undo_len(), 0);
}

#[test]
fn test_excluded_topics_are_not_saved() {
    let (pubsub, manager, _dir) = setup();
    pubsub.publish("dev/status/serial", "JS220-001").unwrap();
    pubsub.publish("dev/status/temperature", 31.5).unwrap();
    pubsub.publish("common/settings/theme", "dark").unwrap();
    let path = manager.save("p", "").unwrap();

    let file = read_file(&path).unwrap();
    assert_eq!(file.name, "p");
    assert!(file.values.contains_key("dev/settings/gain"));
    for excluded in [
        "dev/status/serial",
        "dev/status/temperature",
        "dev/actions/!reset",
        "common/settings/theme",
        "registry_manager/capabilities/device/list",
    ] {
        assert!(!file.values.contains_key(excluded), "{} was saved", excluded);
    }
}

#[test]
fn test_common_file() {
    let (pubsub, manager, dir) = setup();
    pubsub.publish("common/settings/theme", "dark").unwrap();
    let path = manager.save_common().unwrap();
    assert_eq!(path, dir.path().join("common.json"));

    let file = read_file(&path).unwrap();
    assert_eq!(file.name, COMMON_PROFILE);
    assert_eq!(file.values.len(), 1);

    pubsub.publish("common/settings/theme", "light").unwrap();
    manager.load_common().unwrap();
    assert_eq!(pubsub.query("common/settings/theme").unwrap(), Value::from("dark"));

    assert!(manager.save("common", "").is_err());
}

#[test]
fn test_startup_loads_common_then_profile() {
    let (pubsub, manager, dir) = setup();
    pubsub.publish("common/settings/theme", "dark").unwrap();
    pubsub.publish("dev/settings/gain", 9).unwrap();
    manager.save_common().unwrap();
    manager.save("default", "").unwrap();

    // A new session on the same directory
    let fresh = engine();
    let fresh_manager = ProfileManager::new(fresh.clone(), dir.path(), 5);
    let report = fresh_manager.startup("default");
    assert!(report.applied.contains(&"common/settings/theme".to_string()));
    assert!(report.applied.contains(&"dev/settings/gain".to_string()));
    assert_eq!(fresh.query("common/settings/theme").unwrap(), Value::from("dark"));
    assert_eq!(fresh.query("dev/settings/gain").unwrap().as_i64(), Some(9));
}

#[test]
fn test_startup_survives_missing_and_corrupt_files() {
    let (pubsub, manager, dir) = setup();
    std::fs::write(dir.path().join("common.json"), "garbage").unwrap();

    let report = manager.startup("never-saved");
    assert!(report.applied.is_empty());
    assert_eq!(pubsub.query("common/settings/theme").unwrap(), Value::from("light"));
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(1));
}

#[test]
fn test_stale_keys_fall_back_to_defaults() {
    let (pubsub, manager, dir) = setup();
    pubsub.publish("dev/settings/gain", 5).unwrap();
    std::fs::write(
        dir.path().join("stale.json"),
        r#"{
            "schema": "jsui-profile",
            "version": 1,
            "name": "stale",
            "saved_at": "2024-03-01T08:00:00Z",
            "values": {
                "dev/settings/gain": 99,
                "dev/settings/range": "180 mA",
                "dev/status/serial": "spoofed",
                "removed/topic": 1
            }
        }"#,
    )
    .unwrap();

    let report = manager.load("stale").unwrap();
    assert_eq!(report.applied, vec!["dev/settings/range"]);
    assert_eq!(report.defaulted, vec!["dev/settings/gain"]);
    assert_eq!(report.unknown, vec!["removed/topic"]);
    assert_eq!(report.skipped, vec!["dev/status/serial"]);

    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(1));
    assert_eq!(pubsub.query("dev/settings/range").unwrap(), Value::from("180 mA"));
    assert_eq!(pubsub.query("dev/status/serial").unwrap(), Value::from(""));
}

#[test]
fn test_corrupt_profile_error() {
    let (pubsub, manager, dir) = setup();
    pubsub.publish("dev/settings/gain", 5).unwrap();
    std::fs::write(dir.path().join("bad.json"), "[1, 2").unwrap();

    let err = manager.load("bad").unwrap_err();
    assert!(matches!(err.root(), PubSubError::CorruptProfile { .. }));
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(1));
}

#[test]
fn test_restore_defaults() {
    let (pubsub, manager, _dir) = setup();
    pubsub.publish("dev/settings/gain", 5).unwrap();
    pubsub.publish("dev/settings/enabled", true).unwrap();
    pubsub.publish("dev/status/serial", "JS220-001").unwrap();

    let count = manager.restore_defaults();
    assert!(count >= 4);
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(1));
    assert_eq!(pubsub.query("dev/settings/enabled").unwrap(), Value::Bool(false));
    // Read-only status is owned by its producer
    assert_eq!(pubsub.query("dev/status/serial").unwrap(), Value::from("JS220-001"));
    assert_eq!(pubsub.undo_len(), 0);
}

#[test]
fn test_history_revert_and_remove() {
    let (pubsub, manager, _dir) = setup();
    for gain in [3, 4, 5] {
        pubsub.publish("dev/settings/gain", gain).unwrap();
        manager.save("bench", "").unwrap();
    }
    let summary = manager.list().unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].name, "bench");
    assert_eq!(summary[0].history, 2);
    assert!(summary[0].saved_at.is_some());

    assert!(manager.revert("bench", 1).unwrap());
    manager.load("bench").unwrap();
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(4));

    assert!(!manager.revert("bench", 5).unwrap());

    manager.remove("bench").unwrap();
    assert!(manager.list().unwrap().is_empty());
    assert!(manager.load("bench").is_err());
}

#[test]
fn test_list_sorted_without_common() {
    let (_pubsub, manager, _dir) = setup();
    manager.save("zeta", "last").unwrap();
    manager.save("alpha", "first").unwrap();
    manager.save_common().unwrap();

    let names: Vec<String> = manager.list().unwrap().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
    assert_eq!(manager.list().unwrap()[0].description, "first");
}

#[test]
fn test_load_with_dispatcher_thread() {
    let (pubsub, manager, _dir) = setup();
    pubsub.publish("dev/settings/gain", 8).unwrap();
    manager.save("threaded", "").unwrap();
    pubsub.publish("dev/settings/gain", 2).unwrap();

    let dispatcher = pubsub.spawn_dispatcher().unwrap();
    let report = manager.load("threaded").unwrap();
    assert!(report.applied.contains(&"dev/settings/gain".to_string()));
    pubsub.flush().unwrap();
    assert_eq!(pubsub.query("dev/settings/gain").unwrap().as_i64(), Some(8));
    dispatcher.shutdown().unwrap();
}

#[test]
#[serial]
fn test_profile_dir_from_environment() {
    let home = tempfile::tempdir().unwrap();
    std::env::set_var("JSUI_PUBSUB_HOME", home.path());

    let pubsub = PubSub::default();
    pubsub.topic_add("dev/settings/gain", builders::gain()).unwrap();
    let manager = ProfileManager::from_config(pubsub, &PubSubConfig::default()).unwrap();
    let path = manager.save("default", "").unwrap();

    std::env::remove_var("JSUI_PUBSUB_HOME");
    assert_eq!(manager.dir(), home.path().join("profiles"));
    assert!(path.starts_with(home.path()));
    assert!(path.is_file());
}
