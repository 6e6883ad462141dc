//! Function container monitor
//!
//! Launchers report the container id of each function they manage; the
//! monitor keeps the mapping for diagnostics and resource accounting.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::info;

/// Container id length on the launcher handshake, hex-encoded
pub const CONTAINER_ID_LENGTH: usize = 64;

/// Sentinel launchers send when they run outside a container
pub const INVALID_CONTAINER_ID: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Default)]
pub struct Monitor {
    containers: Mutex<HashMap<u16, String>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_new_func_container(&self, func_id: u16, container_id: String) {
        info!(func_id, container_id = %container_id, "New function container");
        self.containers.lock().insert(func_id, container_id);
    }

    pub fn container_id(&self, func_id: u16) -> Option<String> {
        self.containers.lock().get(&func_id).cloned()
    }
}
