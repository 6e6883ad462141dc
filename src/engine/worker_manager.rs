//! Worker manager: launcher and function-worker registry
//!
//! One launcher connection per function; any number of worker connections,
//! each identified by an engine-allocated client id. Client id 0 is
//! reserved for external callers and never handed out.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::{info, warn};

use super::connection::ConnectionHandle;
use crate::error::{LumenError, Result};
use crate::protocol::Message;

/// Registered function worker
#[derive(Clone)]
pub struct FuncWorkerHandle {
    pub func_id: u16,
    pub client_id: u16,
    connection: ConnectionHandle,
}

impl FuncWorkerHandle {
    pub fn send_message(&self, message: Message) -> Result<()> {
        self.connection.send_message(message)
    }
}

#[derive(Default)]
pub struct WorkerManager {
    next_client_id: AtomicU16,
    launchers: DashMap<u16, ConnectionHandle>,
    func_workers: DashMap<u16, FuncWorkerHandle>,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self {
            // 0 is the external caller
            next_client_id: AtomicU16::new(1),
            launchers: DashMap::new(),
            func_workers: DashMap::new(),
        }
    }

    pub fn on_launcher_connected(&self, func_id: u16, handle: ConnectionHandle) -> Result<()> {
        match self.launchers.entry(func_id) {
            Entry::Occupied(_) => Err(LumenError::InvalidHandshake(format!(
                "launcher for func_id {func_id} already connected"
            ))),
            Entry::Vacant(entry) => {
                info!(func_id, "Launcher connected");
                entry.insert(handle);
                Ok(())
            }
        }
    }

    pub fn on_launcher_disconnected(&self, func_id: u16) {
        if self.launchers.remove(&func_id).is_some() {
            info!(func_id, "Launcher disconnected");
        }
    }

    pub fn on_func_worker_connected(
        &self,
        func_id: u16,
        client_id: u16,
        connection: ConnectionHandle,
    ) -> Result<FuncWorkerHandle> {
        if client_id == 0 {
            return Err(LumenError::InvalidHandshake(
                "client_id 0 is reserved for external callers".into(),
            ));
        }
        match self.func_workers.entry(client_id) {
            Entry::Occupied(_) => Err(LumenError::InvalidHandshake(format!(
                "func worker with client_id {client_id} already connected"
            ))),
            Entry::Vacant(entry) => {
                let worker = FuncWorkerHandle {
                    func_id,
                    client_id,
                    connection,
                };
                entry.insert(worker.clone());
                info!(func_id, client_id, "Function worker connected");
                Ok(worker)
            }
        }
    }

    pub fn on_func_worker_disconnected(&self, client_id: u16) -> Option<FuncWorkerHandle> {
        let removed = self.func_workers.remove(&client_id).map(|(_, worker)| worker);
        if let Some(worker) = &removed {
            info!(func_id = worker.func_id, client_id, "Function worker disconnected");
        }
        removed
    }

    pub fn get_func_worker(&self, client_id: u16) -> Option<FuncWorkerHandle> {
        self.func_workers
            .get(&client_id)
            .map(|worker| worker.clone())
    }

    /// Ask the function's launcher to start one more worker. Returns the
    /// client id the new worker will handshake with.
    pub fn request_new_func_worker(&self, func_id: u16) -> Result<u16> {
        let launcher = self
            .launchers
            .get(&func_id)
            .map(|handle| handle.clone())
            .ok_or_else(|| {
                LumenError::Dispatch(format!("no launcher connected for func_id {func_id}"))
            })?;
        let client_id = self.allocate_client_id();
        if let Err(e) = launcher.send_message(Message::new_create_func_worker(client_id)) {
            warn!(func_id, error = %e, "Failed to ask launcher for a new worker");
            return Err(e);
        }
        info!(func_id, client_id, "Requested new function worker");
        Ok(client_id)
    }

    fn allocate_client_id(&self) -> u16 {
        loop {
            let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            // Skips 0 on wrap-around
            if id != 0 {
                return id;
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.func_workers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_registration_unique_per_func() {
        let manager = WorkerManager::new();
        let (handle, _rx) = ConnectionHandle::new_for_test(7);
        manager.on_launcher_connected(1, handle.clone()).unwrap();
        assert!(manager.on_launcher_connected(1, handle).is_err());
        manager.on_launcher_disconnected(1);
    }

    #[test]
    fn test_worker_registration_and_lookup() {
        let manager = WorkerManager::new();
        let (handle, _rx) = ConnectionHandle::new_for_test(7);
        let worker = manager.on_func_worker_connected(1, 3, handle).unwrap();
        assert_eq!(worker.client_id, 3);
        assert!(manager.get_func_worker(3).is_some());
        assert_eq!(manager.worker_count(), 1);

        manager.on_func_worker_disconnected(3).unwrap();
        assert!(manager.get_func_worker(3).is_none());
    }

    #[test]
    fn test_client_id_zero_rejected() {
        let manager = WorkerManager::new();
        let (handle, _rx) = ConnectionHandle::new_for_test(7);
        assert!(manager.on_func_worker_connected(1, 0, handle).is_err());
    }

    #[test]
    fn test_request_worker_without_launcher_fails() {
        let manager = WorkerManager::new();
        assert!(manager.request_new_func_worker(9).is_err());
    }

    #[test]
    fn test_allocated_client_ids_are_unique() {
        let manager = WorkerManager::new();
        let a = manager.allocate_client_id();
        let b = manager.allocate_client_id();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }
}
