//! Per-function dispatcher
//!
//! One dispatcher per func_id tracks the function's idle workers, the
//! queue of admitted-but-unassigned calls, and every outstanding
//! assignment. Dispatchers live in an arena owned by the engine, keyed by
//! func_id, and hold only a non-owning handle to the worker manager.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::worker_manager::WorkerManager;
use crate::error::{LumenError, Result};
use crate::protocol::{monotonic_micros, FuncCall, Message};

/// How an invocation's input travels to the worker
#[derive(Debug, Clone)]
pub enum DispatchPayload {
    Inline(bytes::Bytes),
    /// The input lives in the shm region named by the call id
    Shm(usize),
}

/// Calls admitted but not yet assigned to a worker
struct QueuedCall {
    func_call: FuncCall,
    parent_call_id: u64,
    payload: DispatchPayload,
    queued_at: i64,
}

#[derive(Default)]
struct DispatcherInner {
    idle_workers: VecDeque<u16>,
    attached_workers: HashSet<u16>,
    /// client_id → the call it is running
    assigned: HashMap<u16, FuncCall>,
    /// full_call_id → client_id
    assigned_by_call: HashMap<u64, u16>,
    queued: VecDeque<QueuedCall>,
    /// Workers asked from the launcher but not yet handshaken
    requested_workers: usize,
}

pub struct Dispatcher {
    func_id: u16,
    max_workers: usize,
    max_queued: usize,
    worker_manager: Arc<WorkerManager>,
    inner: Mutex<DispatcherInner>,
}

impl Dispatcher {
    /// Queue bound per function; beyond it admission fails instead of
    /// buffering without limit
    const DEFAULT_MAX_QUEUED: usize = 1024;

    pub fn new(func_id: u16, max_workers: usize, worker_manager: Arc<WorkerManager>) -> Self {
        Self {
            func_id,
            max_workers,
            max_queued: Self::DEFAULT_MAX_QUEUED,
            worker_manager,
            inner: Mutex::new(DispatcherInner::default()),
        }
    }

    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    /// Admit a call: dispatch to an idle worker or queue it, growing the
    /// worker pool through the launcher when the queue backs up.
    pub fn on_new_func_call(
        &self,
        func_call: FuncCall,
        parent_call_id: u64,
        payload: DispatchPayload,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        debug!(%func_call, queued = inner.queued.len(), "New function call");
        if let Some(client_id) = inner.idle_workers.pop_front() {
            return self.dispatch_to(&mut inner, client_id, func_call, parent_call_id, payload, 0);
        }
        if inner.queued.len() >= self.max_queued {
            return Err(LumenError::ResourceExhausted(format!(
                "dispatch queue full for func_id {}",
                self.func_id
            )));
        }
        inner.queued.push_back(QueuedCall {
            func_call,
            parent_call_id,
            payload,
            queued_at: monotonic_micros(),
        });
        self.request_worker_if_needed(&mut inner);
        Ok(())
    }

    /// Completion from the worker. Returns false for calls this dispatcher
    /// does not know (already discarded or never assigned).
    pub fn on_func_call_completed(
        &self,
        func_call: FuncCall,
        processing_time: i32,
        dispatch_delay: i32,
        output_size: usize,
    ) -> bool {
        debug!(
            %func_call,
            processing_time,
            dispatch_delay,
            output_size,
            "Function call completed"
        );
        self.finish_assignment(func_call)
    }

    /// Failure from the worker. Returns false for unknown calls.
    pub fn on_func_call_failed(&self, func_call: FuncCall, dispatch_delay: i32) -> bool {
        warn!(%func_call, dispatch_delay, "Function call failed");
        self.finish_assignment(func_call)
    }

    /// A worker of this function finished its handshake
    pub fn on_func_worker_connected(&self, client_id: u16) {
        let mut inner = self.inner.lock();
        inner.attached_workers.insert(client_id);
        inner.requested_workers = inner.requested_workers.saturating_sub(1);
        inner.idle_workers.push_back(client_id);
        self.drain_queue(&mut inner);
    }

    /// A worker's connection closed. Returns the call it was running, if
    /// any; the engine turns it into a discard.
    pub fn on_func_worker_disconnected(&self, client_id: u16) -> Option<FuncCall> {
        let mut inner = self.inner.lock();
        inner.attached_workers.remove(&client_id);
        inner.idle_workers.retain(|&idle| idle != client_id);
        let orphaned = inner.assigned.remove(&client_id);
        if let Some(func_call) = &orphaned {
            inner.assigned_by_call.remove(&func_call.full_call_id());
            warn!(client_id, %func_call, "Worker disconnected with a call in flight");
        }
        orphaned
    }

    /// Drop a queued call before assignment (engine-side discard).
    /// Returns true when the call was still queued here.
    pub fn remove_queued_call(&self, func_call: FuncCall) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.queued.len();
        inner
            .queued
            .retain(|queued| queued.func_call != func_call);
        before != inner.queued.len()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.inner.lock().idle_workers.len()
    }

    pub fn queued_call_count(&self) -> usize {
        self.inner.lock().queued.len()
    }

    fn finish_assignment(&self, func_call: FuncCall) -> bool {
        let mut inner = self.inner.lock();
        let client_id = match inner.assigned_by_call.remove(&func_call.full_call_id()) {
            Some(client_id) => client_id,
            None => return false,
        };
        inner.assigned.remove(&client_id);
        if inner.attached_workers.contains(&client_id) {
            inner.idle_workers.push_back(client_id);
        }
        self.drain_queue(&mut inner);
        true
    }

    fn drain_queue(&self, inner: &mut DispatcherInner) {
        while !inner.queued.is_empty() && !inner.idle_workers.is_empty() {
            let queued = match inner.queued.pop_front() {
                Some(queued) => queued,
                None => break,
            };
            let client_id = match inner.idle_workers.pop_front() {
                Some(client_id) => client_id,
                None => break,
            };
            let dispatch_delay =
                i32::try_from(monotonic_micros() - queued.queued_at).unwrap_or(i32::MAX);
            if let Err(e) = self.dispatch_to(
                inner,
                client_id,
                queued.func_call,
                queued.parent_call_id,
                queued.payload,
                dispatch_delay,
            ) {
                error!(error = %e, "Failed to dispatch queued call");
            }
        }
    }

    fn dispatch_to(
        &self,
        inner: &mut DispatcherInner,
        client_id: u16,
        func_call: FuncCall,
        parent_call_id: u64,
        payload: DispatchPayload,
        dispatch_delay: i32,
    ) -> Result<()> {
        let worker = self
            .worker_manager
            .get_func_worker(client_id)
            .ok_or_else(|| {
                LumenError::Dispatch(format!("func worker {client_id} vanished before dispatch"))
            })?;
        let mut message = Message::new_dispatch_func_call(func_call, parent_call_id);
        message.dispatch_delay = dispatch_delay;
        match payload {
            DispatchPayload::Inline(data) => message.set_inline_data(&data),
            DispatchPayload::Shm(size) => message.set_shm_payload(size),
        }
        worker.send_message(message)?;
        inner.assigned.insert(client_id, func_call);
        inner
            .assigned_by_call
            .insert(func_call.full_call_id(), client_id);
        Ok(())
    }

    fn request_worker_if_needed(&self, inner: &mut DispatcherInner) {
        if inner.queued.len() <= inner.requested_workers {
            return;
        }
        if inner.attached_workers.len() + inner.requested_workers >= self.max_workers {
            return;
        }
        match self.worker_manager.request_new_func_worker(self.func_id) {
            Ok(_) => inner.requested_workers += 1,
            Err(e) => debug!(func_id = self.func_id, error = %e, "Could not grow worker pool"),
        }
    }
}
