use std::sync::Arc;

use parking_lot::RwLock;

use crate::bus::EventBus;
use crate::config::Timings;

pub const RANDOM_HASH_TOPIC: &str = "randomHash";
pub const GREETINGS_KEY: &str = "Query.greetings";

const INITIAL_GREETINGS: [&str; 4] = ["Hello", "Hi", "Ay", "Sup"];

#[derive(Debug)]
pub struct DemoState {
    greetings: RwLock<Vec<String>>,
}

impl Default for DemoState {
    fn default() -> Self {
        Self {
            greetings: RwLock::new(INITIAL_GREETINGS.iter().map(|g| g.to_string()).collect()),
        }
    }
}

impl DemoState {
    pub fn greetings(&self) -> Vec<String> {
        self.greetings.read().clone()
    }

    #[cfg(test)]
    pub fn replace_greetings(&self, greetings: Vec<String>) {
        *self.greetings.write() = greetings;
    }

    pub fn rotate_greetings(&self) {
        let mut greetings = self.greetings.write();
        if let Some(last) = greetings.pop() {
            greetings.insert(0, last);
        }
    }
}

#[derive(Clone)]
pub struct RequestContext {
    pub state: Arc<DemoState>,
    pub bus: EventBus,
    pub timings: Timings,
}

#[derive(Clone)]
pub struct ContextFactory {
    state: Arc<DemoState>,
    bus: EventBus,
    timings: Timings,
}

impl ContextFactory {
    pub fn new(state: Arc<DemoState>, bus: EventBus, timings: Timings) -> Self {
        Self {
            state,
            bus,
            timings,
        }
    }

    pub fn build(&self) -> RequestContext {
        RequestContext {
            state: self.state.clone(),
            bus: self.bus.clone(),
            timings: self.timings,
        }
    }

    pub fn state(&self) -> &Arc<DemoState> {
        &self.state
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

pub fn random_hash() -> String {
    let bytes: Vec<u8> = (0..20).map(|_| fastrand::u8(..)).collect();
    hex::encode(bytes)
}
