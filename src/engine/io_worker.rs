//! I/O worker pool
//!
//! N workers, each a dedicated thread running a single-threaded event loop
//! (a current-thread Tokio runtime plus a `LocalSet`). Accepted connections
//! are assigned round-robin and then fully owned by one worker: connection
//! state never moves cross-thread, and anything another thread wants from a
//! connection goes through its write handle or the per-worker task queue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::connection::run_message_connection;
use super::Engine;
use crate::error::{LumenError, Result};
use crate::runtime::apply_thread_cpuset;

/// A connection handed to a worker, still as a std stream; the owning
/// worker registers it with its own reactor
pub enum IoTask {
    Unix(u64, std::os::unix::net::UnixStream),
    Tcp(u64, std::net::TcpStream),
}

pub struct IoWorkerPool {
    senders: Vec<mpsc::UnboundedSender<IoTask>>,
    next_worker: AtomicUsize,
    next_conn_id: AtomicU64,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl IoWorkerPool {
    /// Spawn `num_workers` event-loop threads serving `engine`
    pub fn start(engine: Arc<Engine>, num_workers: usize) -> Result<Self> {
        let mut senders = Vec::with_capacity(num_workers);
        let mut threads = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let engine = engine.clone();
            let thread = std::thread::Builder::new()
                .name(format!("io-worker-{worker_id}"))
                .spawn(move || run_io_worker(engine, worker_id, rx))?;
            senders.push(tx);
            threads.push(thread);
        }
        info!(num_workers, "I/O workers started");
        Ok(Self {
            senders,
            next_worker: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            threads,
        })
    }

    /// Hand a fresh Unix connection to the next worker in rotation
    pub fn assign_unix_connection(&self, stream: std::os::unix::net::UnixStream) -> Result<()> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.assign(IoTask::Unix(conn_id, stream))
    }

    /// Hand a fresh TCP connection to the next worker in rotation
    pub fn assign_tcp_connection(&self, stream: std::net::TcpStream) -> Result<()> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.assign(IoTask::Tcp(conn_id, stream))
    }

    fn assign(&self, task: IoTask) -> Result<()> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index]
            .send(task)
            .map_err(|_| LumenError::Dispatch(format!("I/O worker {index} is gone")))
    }

    /// Drop the task queues and join every worker thread
    pub fn shutdown(mut self) {
        self.senders.clear();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("I/O worker thread panicked");
            }
        }
    }
}

fn run_io_worker(engine: Arc<Engine>, worker_id: usize, mut rx: mpsc::UnboundedReceiver<IoTask>) {
    apply_thread_cpuset("IO_WORKER");
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker_id, error = %e, "Failed to build I/O worker runtime");
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        while let Some(task) = rx.recv().await {
            match task {
                IoTask::Unix(conn_id, stream) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(conn_id, error = %e, "Failed to set nonblocking");
                        continue;
                    }
                    match tokio::net::UnixStream::from_std(stream) {
                        Ok(stream) => {
                            tokio::task::spawn_local(run_message_connection(
                                engine.clone(),
                                stream,
                                conn_id,
                            ));
                        }
                        Err(e) => warn!(conn_id, error = %e, "Failed to adopt unix stream"),
                    }
                }
                IoTask::Tcp(conn_id, stream) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(conn_id, error = %e, "Failed to set nonblocking");
                        continue;
                    }
                    match tokio::net::TcpStream::from_std(stream) {
                        Ok(stream) => {
                            tokio::task::spawn_local(run_message_connection(
                                engine.clone(),
                                stream,
                                conn_id,
                            ));
                        }
                        Err(e) => warn!(conn_id, error = %e, "Failed to adopt tcp stream"),
                    }
                }
            }
        }
        info!(worker_id, "I/O worker draining");
    });
}

/// Accept engine IPC connections and shard them across the pool.
///
/// Binds the Unix socket under the IPC root, or a localhost TCP socket
/// when the cross-host fallback is configured.
pub fn run_ipc_listener(engine: Arc<Engine>, pool: Arc<IoWorkerPool>) -> Result<()> {
    if let Some(port) = engine.config().engine_tcp_port {
        let listener = std::net::TcpListener::bind(("127.0.0.1", port))?;
        info!(port, "Listening on TCP for IPC connections");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => pool.assign_tcp_connection(stream)?,
                Err(e) => warn!(error = %e, "Failed to accept TCP connection"),
            }
        }
    } else {
        let path = engine.ipc_paths().engine_socket();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = std::os::unix::net::UnixListener::bind(&path)?;
        info!(path = %path.display(), "Listening on unix socket for IPC connections");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => pool.assign_unix_connection(stream)?,
                Err(e) => warn!(error = %e, "Failed to accept unix connection"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::func_config::FuncConfig;
    use crate::engine::{CallResult, CompletionSink};
    use crate::protocol::FuncCall;

    struct NullSink;

    impl CompletionSink for NullSink {
        fn on_external_call_finished(&self, _func_call: FuncCall, _result: CallResult) {}
    }

    #[test]
    fn test_pool_starts_and_shuts_down() {
        let ipc_root = tempfile::TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.ipc_root = ipc_root.path().to_path_buf();
        let func_config = FuncConfig::load("[]".to_string()).unwrap();
        let engine = Arc::new(Engine::new(config, func_config, Arc::new(NullSink)));

        let pool = IoWorkerPool::start(engine, 2).unwrap();
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        pool.assign_unix_connection(left).unwrap();
        drop(right);
        pool.shutdown();
    }
}
