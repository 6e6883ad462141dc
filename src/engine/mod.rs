//! Engine dispatch core
//!
//! The engine terminates launcher/worker IPC, routes invocations to
//! function workers, and propagates completions back out. Cross-worker
//! state (dispatchers, external-call shm inputs, the discarded-call list)
//! lives under one mutex; per-connection work stays on the I/O worker that
//! owns the connection.
//!
//! External call results leave through a [`CompletionSink`] the engine is
//! constructed with: the gateway embeds the engine and routes results to
//! the originating connection, keyed by full call id.

pub mod connection;
pub mod dispatcher;
pub mod func_config;
pub mod io_worker;
pub mod monitor;
pub mod worker_manager;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{LumenError, Result};
use crate::ipc::{
    self, func_call_input_shm_name, func_call_output_fifo_name, func_call_output_shm_name,
    IpcPaths, ShmRegion,
};
use crate::protocol::{
    compute_message_delay, monotonic_micros, FuncCall, Message, INLINE_MAX, PIPE_BUF_SIZE,
};
use self::connection::{ConnectionHandle, ConnectionIdentity};
use self::dispatcher::{DispatchPayload, Dispatcher};
use self::func_config::FuncConfig;
use self::monitor::{Monitor, CONTAINER_ID_LENGTH, INVALID_CONTAINER_ID};
use self::worker_manager::WorkerManager;

/// Result of an external function call, delivered exactly once per call
#[derive(Debug, Clone)]
pub struct CallResult {
    pub success: bool,
    pub discarded: bool,
    pub status_code: i32,
    pub output: Bytes,
}

impl CallResult {
    pub fn ok(output: Bytes) -> Self {
        Self {
            success: true,
            discarded: false,
            status_code: 0,
            output,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            discarded: false,
            status_code: 0,
            output: Bytes::new(),
        }
    }

    pub fn discarded() -> Self {
        Self {
            success: false,
            discarded: true,
            status_code: 0,
            output: Bytes::new(),
        }
    }
}

/// Where results of external calls go; the gateway implements this
pub trait CompletionSink: Send + Sync {
    fn on_external_call_finished(&self, func_call: FuncCall, result: CallResult);
}

/// Counter snapshot for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub incoming_external_requests: u64,
    pub inflight_external_requests: i64,
    pub input_use_shm: u64,
    pub output_use_shm: u64,
    pub discarded_func_calls: u64,
}

#[derive(Default)]
struct Counters {
    incoming_external_requests: AtomicU64,
    input_use_shm: AtomicU64,
    output_use_shm: AtomicU64,
    discarded_func_calls: AtomicU64,
}

struct EngineInner {
    dispatchers: HashMap<u16, Arc<Dispatcher>>,
    /// Input shm regions of external calls, reclaimed on completion or
    /// discard. The engine is their remove-on-destruction owner.
    external_shm_inputs: HashMap<u64, ShmRegion>,
    /// External calls admitted and not yet finished; the exactly-once
    /// guard for the completion sink
    inflight_external_calls: HashSet<u64>,
    /// Discards observed during message handling, processed at the end of
    /// the current tick
    discarded_func_calls: Vec<FuncCall>,
}

pub struct Engine {
    config: EngineConfig,
    ipc_paths: IpcPaths,
    func_config: FuncConfig,
    worker_manager: Arc<WorkerManager>,
    monitor: Option<Monitor>,
    completion_sink: Arc<dyn CompletionSink>,
    inner: Mutex<EngineInner>,
    counters: Counters,
    inflight_external_requests: AtomicI64,
    last_external_request_timestamp: AtomicI64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        func_config: FuncConfig,
        completion_sink: Arc<dyn CompletionSink>,
    ) -> Self {
        let monitor = config.monitor_enabled.then(Monitor::new);
        let ipc_paths = IpcPaths::new(config.ipc_root.clone());
        info!(
            node_id = config.node_id,
            functions = func_config.function_count(),
            "Engine initialized"
        );
        Self {
            config,
            ipc_paths,
            func_config,
            worker_manager: Arc::new(WorkerManager::new()),
            monitor,
            completion_sink,
            inner: Mutex::new(EngineInner {
                dispatchers: HashMap::new(),
                external_shm_inputs: HashMap::new(),
                inflight_external_calls: HashSet::new(),
                discarded_func_calls: Vec::new(),
            }),
            counters: Counters::default(),
            inflight_external_requests: AtomicI64::new(0),
            last_external_request_timestamp: AtomicI64::new(-1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ipc_paths(&self) -> &IpcPaths {
        &self.ipc_paths
    }

    pub fn worker_manager(&self) -> &Arc<WorkerManager> {
        &self.worker_manager
    }

    /// Validate a handshake and register the connection.
    ///
    /// Launchers carry their container id as inline payload and get
    /// registered with the monitor; workers attach to their function's
    /// dispatcher. The response payload is the cluster's function config
    /// JSON either way.
    pub fn on_new_handshake(
        &self,
        handle: &ConnectionHandle,
        message: &Message,
    ) -> Result<(ConnectionIdentity, Message, Bytes)> {
        if !message.is_launcher_handshake() && !message.is_func_worker_handshake() {
            return Err(LumenError::InvalidHandshake(
                "received message is not a handshake".into(),
            ));
        }
        let func_id = message.func_id;
        let func_spec = self.func_config.find_by_func_id(func_id).ok_or_else(|| {
            LumenError::InvalidHandshake(format!("invalid func_id {func_id} in handshake"))
        })?;

        let identity = if message.is_launcher_handshake() {
            let payload = message.inline_data();
            if payload.len() != CONTAINER_ID_LENGTH {
                return Err(LumenError::InvalidHandshake(
                    "launcher handshake does not carry a container id".into(),
                ));
            }
            let container_id = std::str::from_utf8(payload)
                .map_err(|_| {
                    LumenError::InvalidHandshake("container id is not valid UTF-8".into())
                })?
                .to_string();
            if let Some(monitor) = &self.monitor {
                if container_id != INVALID_CONTAINER_ID {
                    monitor.on_new_func_container(func_id, container_id);
                }
            }
            self.worker_manager
                .on_launcher_connected(func_id, handle.clone())?;
            // Warm the pool up to the configured floor
            for _ in 0..func_spec.min_workers {
                if let Err(e) = self.worker_manager.request_new_func_worker(func_id) {
                    warn!(func_id, error = %e, "Failed to request initial worker");
                }
            }
            ConnectionIdentity::Launcher { func_id }
        } else {
            let client_id = message.client_id;
            self.worker_manager
                .on_func_worker_connected(func_id, client_id, handle.clone())?;
            if let Some(dispatcher) = self.get_or_create_dispatcher(func_id) {
                dispatcher.on_func_worker_connected(client_id);
            }
            self.process_discarded_func_calls_if_necessary();
            ConnectionIdentity::FuncWorker { func_id, client_id }
        };

        let payload = Bytes::copy_from_slice(self.func_config.raw_json().as_bytes());
        let response = Message::new_handshake_response(payload.len() as u32);
        Ok((identity, response, payload))
    }

    /// Route one data message from a handshaken connection
    pub fn on_recv_message(
        &self,
        identity: ConnectionIdentity,
        _handle: &ConnectionHandle,
        message: &Message,
    ) {
        let message_delay = compute_message_delay(message);
        if message_delay >= 0 {
            debug!(?identity, message_delay, "Message delay sampled");
        }
        if message.is_invoke_func() {
            self.handle_invoke_func(message);
        } else if message.is_func_call_complete() || message.is_func_call_failed() {
            self.handle_func_call_result(message);
        } else {
            error!(
                message_type = message.message_type,
                "Unknown message type; dropping"
            );
        }
        self.process_discarded_func_calls_if_necessary();
    }

    fn handle_invoke_func(&self, message: &Message) {
        let func_call = message.func_call();
        let payload = if message.payload_in_shm() {
            self.counters.input_use_shm.fetch_add(1, Ordering::Relaxed);
            DispatchPayload::Shm(message.payload_size.unsigned_abs() as usize)
        } else {
            DispatchPayload::Inline(Bytes::copy_from_slice(message.inline_data()))
        };
        match self.get_or_create_dispatcher(func_call.func_id) {
            Some(dispatcher) => {
                if let Err(e) =
                    dispatcher.on_new_func_call(func_call, message.parent_call_id, payload)
                {
                    error!(func_id = func_call.func_id, error = %e, "Dispatcher failed");
                }
            }
            None => error!(func_id = func_call.func_id, "Invoke for unknown func_id"),
        }
    }

    fn handle_func_call_result(&self, message: &Message) {
        let func_call = message.func_call();
        let completed = message.is_func_call_complete();
        if completed {
            let output_in_shm = if func_call.is_external() {
                message.payload_size < 0
            } else {
                message.payload_size as i64 + 4 > PIPE_BUF_SIZE as i64
            };
            if output_in_shm {
                self.counters.output_use_shm.fetch_add(1, Ordering::Relaxed);
            }
        }
        // Reclaim the input region regardless of the outcome
        let input_region = if func_call.is_external() {
            self.grab_external_shm_input(func_call)
        } else {
            None
        };
        drop(input_region);

        let dispatcher = match self.get_or_create_dispatcher(func_call.func_id) {
            Some(dispatcher) => dispatcher,
            None => {
                error!(func_id = func_call.func_id, "Result for unknown func_id");
                return;
            }
        };
        if completed {
            let known = dispatcher.on_func_call_completed(
                func_call,
                message.processing_time,
                message.dispatch_delay,
                message.payload_size.unsigned_abs() as usize,
            );
            if known && func_call.is_external() {
                if message.payload_in_shm() {
                    self.finish_external_call_with_shm_output(func_call);
                } else {
                    self.external_func_call_finished(
                        func_call,
                        CallResult::ok(Bytes::copy_from_slice(message.inline_data())),
                    );
                }
            }
        } else {
            let known = dispatcher.on_func_call_failed(func_call, message.dispatch_delay);
            if known && func_call.is_external() {
                self.external_func_call_finished(func_call, CallResult::failure());
            }
        }
    }

    fn finish_external_call_with_shm_output(&self, func_call: FuncCall) {
        let name = func_call_output_shm_name(func_call.full_call_id());
        let path = self.ipc_paths.shm_path(&name);
        match ShmRegion::open(&path) {
            Ok(mut region) => {
                // The engine takes ownership of the worker's output region
                region.enable_remove_on_destruction();
                let output = Bytes::copy_from_slice(region.as_slice());
                self.external_func_call_finished(func_call, CallResult::ok(output));
            }
            Err(e) => {
                warn!(%func_call, error = %e, "Failed to open output shm region");
                self.external_func_call_finished(func_call, CallResult::failure());
            }
        }
    }

    /// Admission entry from the gateway
    pub fn on_external_func_call(&self, func_call: FuncCall, input: Bytes) {
        self.inflight_external_requests.fetch_add(1, Ordering::Relaxed);
        let use_shm = input.len() > INLINE_MAX;
        let mut input_region = None;
        if use_shm {
            let name = func_call_input_shm_name(func_call.full_call_id());
            match ShmRegion::create(self.ipc_paths.shm_path(&name), input.len()) {
                Ok(mut region) => {
                    region.enable_remove_on_destruction();
                    region.write_all(&input);
                    input_region = Some(region);
                }
                Err(e) => {
                    warn!(%func_call, error = %e, "Failed to create input shm region");
                    self.register_inflight_external_call(func_call);
                    self.external_func_call_finished(func_call, CallResult::failure());
                    return;
                }
            }
        }
        let dispatcher = {
            let mut inner = self.inner.lock();
            self.counters
                .incoming_external_requests
                .fetch_add(1, Ordering::Relaxed);
            let now = monotonic_micros();
            let last = self
                .last_external_request_timestamp
                .swap(now, Ordering::Relaxed);
            if last >= 0 && now > last {
                debug!(
                    instant_rps = 1e6 / (now - last) as f64,
                    inflight = self.inflight_external_requests.load(Ordering::Relaxed),
                    "External request admitted"
                );
            }
            inner
                .inflight_external_calls
                .insert(func_call.full_call_id());
            let dispatcher = self.get_or_create_dispatcher_locked(&mut inner, func_call.func_id);
            if let Some(region) = input_region {
                if dispatcher.is_some() {
                    inner
                        .external_shm_inputs
                        .insert(func_call.full_call_id(), region);
                }
                self.counters.input_use_shm.fetch_add(1, Ordering::Relaxed);
            }
            dispatcher
        };
        let dispatcher = match dispatcher {
            Some(dispatcher) => dispatcher,
            None => {
                error!(func_id = func_call.func_id, "External call for unknown func_id");
                self.external_func_call_finished(func_call, CallResult::failure());
                return;
            }
        };
        let payload = if use_shm {
            DispatchPayload::Shm(input.len())
        } else {
            DispatchPayload::Inline(input)
        };
        if let Err(e) = dispatcher.on_new_func_call(func_call, 0, payload) {
            warn!(%func_call, error = %e, "Dispatcher rejected external call");
            let _ = self.grab_external_shm_input(func_call);
            self.external_func_call_finished(func_call, CallResult::failure());
        }
    }

    /// Enqueue a discard; processed at the end of the current tick
    pub fn discard_func_call(&self, func_call: FuncCall) {
        self.inner.lock().discarded_func_calls.push(func_call);
        self.counters
            .discarded_func_calls
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Fan out failure notifications for batched discards and reclaim
    /// their shm inputs. One critical section covers the bookkeeping; the
    /// notifications run outside it.
    pub fn process_discarded_func_calls_if_necessary(&self) {
        let mut discarded_inputs = Vec::new();
        let mut external_calls = Vec::new();
        let mut internal_calls = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.discarded_func_calls.is_empty() {
                return;
            }
            let drained = std::mem::take(&mut inner.discarded_func_calls);
            let mut seen = HashSet::new();
            for func_call in drained {
                if !seen.insert(func_call.full_call_id()) {
                    continue;
                }
                if func_call.is_external() {
                    if let Some(region) = inner
                        .external_shm_inputs
                        .remove(&func_call.full_call_id())
                    {
                        discarded_inputs.push(region);
                    }
                    // Remove from the dispatcher queue if it never got
                    // assigned
                    if let Some(dispatcher) = inner.dispatchers.get(&func_call.func_id) {
                        dispatcher.remove_queued_call(func_call);
                    }
                    external_calls.push(func_call);
                } else {
                    internal_calls.push(func_call);
                }
            }
        }
        for func_call in external_calls {
            self.external_func_call_finished(func_call, CallResult::discarded());
        }
        for func_call in internal_calls {
            self.notify_internal_call_failed(func_call);
        }
        drop(discarded_inputs);
    }

    /// Deliver an external call's result, exactly once per full call id
    fn external_func_call_finished(&self, func_call: FuncCall, result: CallResult) {
        let admitted = self
            .inner
            .lock()
            .inflight_external_calls
            .remove(&func_call.full_call_id());
        if !admitted {
            debug!(%func_call, "External call already finished; dropping result");
            return;
        }
        self.inflight_external_requests
            .fetch_sub(1, Ordering::Relaxed);
        self.completion_sink
            .on_external_call_finished(func_call, result);
    }

    fn register_inflight_external_call(&self, func_call: FuncCall) {
        self.inner
            .lock()
            .inflight_external_calls
            .insert(func_call.full_call_id());
    }

    /// A worker issued this call; failure goes back through its output
    /// FIFO, best effort
    fn notify_internal_call_failed(&self, func_call: FuncCall) {
        let name = func_call_output_fifo_name(func_call.full_call_id());
        let path = self.ipc_paths.fifo_path(&name);
        if !path.exists() {
            return;
        }
        match ipc::open_fifo_read_write_nonblocking(&path) {
            Ok(mut fifo) => {
                let frame = Message::new_func_call_failed(func_call).encode();
                if let Err(e) = fifo.write_all(&frame) {
                    warn!(%func_call, error = %e, "Failed to write failure to output FIFO");
                }
            }
            Err(e) => warn!(%func_call, error = %e, "Failed to open output FIFO"),
        }
    }

    /// The connection's identity decided by its handshake is also how its
    /// close is routed
    pub fn on_connection_close(&self, identity: ConnectionIdentity) {
        match identity {
            ConnectionIdentity::Launcher { func_id } => {
                self.worker_manager.on_launcher_disconnected(func_id);
            }
            ConnectionIdentity::FuncWorker { func_id, client_id } => {
                self.worker_manager.on_func_worker_disconnected(client_id);
                let dispatcher = self.inner.lock().dispatchers.get(&func_id).cloned();
                if let Some(dispatcher) = dispatcher {
                    if let Some(orphaned) = dispatcher.on_func_worker_disconnected(client_id) {
                        self.discard_func_call(orphaned);
                    }
                }
            }
        }
        self.process_discarded_func_calls_if_necessary();
    }

    fn get_or_create_dispatcher(&self, func_id: u16) -> Option<Arc<Dispatcher>> {
        let mut inner = self.inner.lock();
        self.get_or_create_dispatcher_locked(&mut inner, func_id)
    }

    fn get_or_create_dispatcher_locked(
        &self,
        inner: &mut EngineInner,
        func_id: u16,
    ) -> Option<Arc<Dispatcher>> {
        if let Some(dispatcher) = inner.dispatchers.get(&func_id) {
            return Some(dispatcher.clone());
        }
        let spec = self.func_config.find_by_func_id(func_id)?;
        let dispatcher = Arc::new(Dispatcher::new(
            func_id,
            spec.max_workers,
            self.worker_manager.clone(),
        ));
        inner.dispatchers.insert(func_id, dispatcher.clone());
        Some(dispatcher)
    }

    fn grab_external_shm_input(&self, func_call: FuncCall) -> Option<ShmRegion> {
        self.inner
            .lock()
            .external_shm_inputs
            .remove(&func_call.full_call_id())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            incoming_external_requests: self
                .counters
                .incoming_external_requests
                .load(Ordering::Relaxed),
            inflight_external_requests: self.inflight_external_requests.load(Ordering::Relaxed),
            input_use_shm: self.counters.input_use_shm.load(Ordering::Relaxed),
            output_use_shm: self.counters.output_use_shm.load(Ordering::Relaxed),
            discarded_func_calls: self.counters.discarded_func_calls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::TempDir;

    const FUNC_CONFIG: &str = r#"[{"funcId": 1, "funcName": "echo", "minWorkers": 0}]"#;

    #[derive(Default)]
    struct RecordingSink {
        finished: Mutex<Vec<(FuncCall, CallResult)>>,
    }

    impl CompletionSink for RecordingSink {
        fn on_external_call_finished(&self, func_call: FuncCall, result: CallResult) {
            self.finished.lock().push((func_call, result));
        }
    }

    struct TestEngine {
        engine: Engine,
        sink: Arc<RecordingSink>,
        _ipc_root: TempDir,
    }

    fn test_engine() -> TestEngine {
        let ipc_root = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.ipc_root = ipc_root.path().to_path_buf();
        let func_config = FuncConfig::load(FUNC_CONFIG.to_string()).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let engine = Engine::new(config, func_config, sink.clone());
        engine.ipc_paths().setup().unwrap();
        TestEngine {
            engine,
            sink,
            _ipc_root: ipc_root,
        }
    }

    fn launcher_handshake() -> Message {
        let mut msg = Message::new_launcher_handshake(1);
        msg.set_inline_data("b".repeat(CONTAINER_ID_LENGTH).as_bytes());
        msg
    }

    fn attach_worker(engine: &Engine, client_id: u16) -> ConnectionIdentity {
        let (handle, rx) = ConnectionHandle::new_for_test(u64::from(client_id));
        std::mem::forget(rx);
        let msg = Message::new_func_worker_handshake(1, client_id);
        let (identity, response, payload) = engine.on_new_handshake(&handle, &msg).unwrap();
        assert_eq!(response.payload_size as usize, payload.len());
        identity
    }

    #[test]
    fn test_handshake_rejects_non_handshake_message() {
        let t = test_engine();
        let (handle, _rx) = ConnectionHandle::new_for_test(1);
        let msg = Message::new_invoke_func(FuncCall::new(1, 0, 1), 0);
        assert!(matches!(
            t.engine.on_new_handshake(&handle, &msg),
            Err(LumenError::InvalidHandshake(_))
        ));
    }

    #[test]
    fn test_handshake_rejects_unknown_func_id() {
        let t = test_engine();
        let (handle, _rx) = ConnectionHandle::new_for_test(1);
        let msg = Message::new_func_worker_handshake(42, 1);
        assert!(t.engine.on_new_handshake(&handle, &msg).is_err());
    }

    #[test]
    fn test_launcher_handshake_requires_container_id() {
        let t = test_engine();
        let (handle, _rx) = ConnectionHandle::new_for_test(1);
        let msg = Message::new_launcher_handshake(1);
        assert!(t.engine.on_new_handshake(&handle, &msg).is_err());

        let (handle, _rx) = ConnectionHandle::new_for_test(2);
        let (identity, _, payload) = t
            .engine
            .on_new_handshake(&handle, &launcher_handshake())
            .unwrap();
        assert_eq!(identity, ConnectionIdentity::Launcher { func_id: 1 });
        assert_eq!(payload, Bytes::from(FUNC_CONFIG));
    }

    #[test]
    fn test_inline_external_call_roundtrip() {
        let t = test_engine();
        let worker = attach_worker(&t.engine, 5);

        let func_call = FuncCall::new(1, 0, 1);
        t.engine
            .on_external_func_call(func_call, Bytes::from_static(b"hello"));

        // Worker echoes through an inline completion
        let (handle, _rx) = ConnectionHandle::new_for_test(5);
        let mut complete = Message::new_func_call_complete(func_call, 120);
        complete.set_inline_data(b"hello");
        t.engine.on_recv_message(worker, &handle, &complete);

        let finished = t.sink.finished.lock();
        assert_eq!(finished.len(), 1);
        let (call, result) = &finished[0];
        assert_eq!(*call, func_call);
        assert!(result.success);
        assert!(!result.discarded);
        assert_eq!(result.output, Bytes::from_static(b"hello"));

        let stats = t.engine.stats();
        assert_eq!(stats.input_use_shm, 0);
        assert_eq!(stats.output_use_shm, 0);
        assert_eq!(stats.inflight_external_requests, 0);
    }

    #[test]
    fn test_large_external_call_uses_shm() {
        let t = test_engine();
        let worker = attach_worker(&t.engine, 5);

        let func_call = FuncCall::new(1, 0, 2);
        let input = Bytes::from(vec![0xAB; INLINE_MAX + 1]);
        t.engine.on_external_func_call(func_call, input.clone());

        // The engine created the input region
        let input_path = t
            .engine
            .ipc_paths()
            .shm_path(&func_call_input_shm_name(func_call.full_call_id()));
        assert!(input_path.exists());
        assert_eq!(t.engine.stats().input_use_shm, 1);

        // Worker reads the input, writes its output region, completes with
        // a negated size
        let opened = ShmRegion::open(&input_path).unwrap();
        assert_eq!(opened.as_slice(), &input[..]);
        let output_path = t
            .engine
            .ipc_paths()
            .shm_path(&func_call_output_shm_name(func_call.full_call_id()));
        let mut output = ShmRegion::create(&output_path, input.len()).unwrap();
        output.write_all(&input);
        drop(output);
        drop(opened);

        let (handle, _rx) = ConnectionHandle::new_for_test(5);
        let mut complete = Message::new_func_call_complete(func_call, 300);
        complete.set_shm_payload(input.len());
        t.engine.on_recv_message(worker, &handle, &complete);

        let finished = t.sink.finished.lock();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].1.success);
        assert_eq!(finished[0].1.output, input);
        // Both regions are reclaimed
        assert!(!input_path.exists());
        assert!(!output_path.exists());
        assert_eq!(t.engine.stats().output_use_shm, 1);
    }

    #[test]
    fn test_external_call_unknown_func_fails() {
        let t = test_engine();
        t.engine
            .on_external_func_call(FuncCall::new(9, 0, 1), Bytes::new());
        let finished = t.sink.finished.lock();
        assert_eq!(finished.len(), 1);
        assert!(!finished[0].1.success);
        assert!(!finished[0].1.discarded);
    }

    #[test]
    fn test_discard_is_idempotent() {
        let t = test_engine();
        let func_call = FuncCall::new(1, 0, 3);
        // No worker: the call queues
        t.engine.on_external_func_call(func_call, Bytes::new());

        t.engine.discard_func_call(func_call);
        t.engine.discard_func_call(func_call);
        t.engine.discard_func_call(func_call);
        t.engine.process_discarded_func_calls_if_necessary();
        t.engine.process_discarded_func_calls_if_necessary();

        let finished = t.sink.finished.lock();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].1.discarded);
        assert!(!finished[0].1.success);
    }

    #[test]
    fn test_discard_reclaims_shm_input() {
        let t = test_engine();
        let func_call = FuncCall::new(1, 0, 4);
        t.engine
            .on_external_func_call(func_call, Bytes::from(vec![1u8; INLINE_MAX + 10]));
        let input_path = t
            .engine
            .ipc_paths()
            .shm_path(&func_call_input_shm_name(func_call.full_call_id()));
        assert!(input_path.exists());

        t.engine.discard_func_call(func_call);
        t.engine.process_discarded_func_calls_if_necessary();
        assert!(!input_path.exists());
    }

    #[test]
    fn test_worker_disconnect_discards_inflight_call() {
        let t = test_engine();
        let worker = attach_worker(&t.engine, 5);
        let func_call = FuncCall::new(1, 0, 6);
        t.engine.on_external_func_call(func_call, Bytes::new());

        t.engine.on_connection_close(worker);

        let finished = t.sink.finished.lock();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].1.discarded);
    }

    #[test]
    fn test_completion_after_discard_is_noop() {
        let t = test_engine();
        let worker = attach_worker(&t.engine, 5);
        let func_call = FuncCall::new(1, 0, 7);
        t.engine.on_external_func_call(func_call, Bytes::new());

        t.engine.discard_func_call(func_call);
        t.engine.process_discarded_func_calls_if_necessary();

        let (handle, _rx) = ConnectionHandle::new_for_test(5);
        let mut complete = Message::new_func_call_complete(func_call, 10);
        complete.set_inline_data(b"late");
        t.engine.on_recv_message(worker, &handle, &complete);

        let finished = t.sink.finished.lock();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].1.discarded);
    }
}
