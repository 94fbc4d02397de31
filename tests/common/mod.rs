//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use jsui_pubsub::{PubSub, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_millis(2000)
}

/// Collects every delivery a subscription receives
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback to pass to `PubSub::subscribe`
    pub fn callback(&self) -> impl Fn(&PubSub, &str, &Value) + Send + Sync + 'static {
        let events = self.events.clone();
        move |_: &PubSub, topic: &str, value: &Value| {
            events.lock().unwrap().push((topic.to_string(), value.clone()));
        }
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events().into_iter().map(|(t, _)| t).collect()
    }

    pub fn values_for(&self, topic: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

/// Poll `condition` until it holds or the test timeout expires
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + test_timeout();
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
