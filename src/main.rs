//! Lumen engine node binary
//!
//! Terminates launcher and function-worker IPC, dispatches invocations,
//! and (when enabled) runs the shared-log engine core alongside.

use clap::Parser;
use parking_lot::Mutex;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lumen::config::{EngineArgs, EngineConfig};
use lumen::engine::func_config::FuncConfig;
use lumen::engine::io_worker::{run_ipc_listener, IoWorkerPool};
use lumen::engine::{CallResult, CompletionSink, Engine};
use lumen::log::engine_core::{EngineCoreCallbacks, SLogEngineCore};
use lumen::protocol::FuncCall;
use lumen::runtime::spawn_interval_thread;
use lumen::Result;

/// Sink used when no gateway embeds the engine: results are logged and
/// dropped. A gateway routes them back to the originating connection.
struct LoggingCompletionSink;

impl CompletionSink for LoggingCompletionSink {
    fn on_external_call_finished(&self, func_call: FuncCall, result: CallResult) {
        info!(
            %func_call,
            success = result.success,
            discarded = result.discarded,
            output_size = result.output.len(),
            "External call finished"
        );
    }
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("lumen-engine failed to start: {e}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let args = EngineArgs::parse();
    let config = EngineConfig::from_args(args);
    info!(node_id = config.node_id, "Starting engine node");

    let func_config = FuncConfig::load_from_file(&config.func_config_file)?;
    let enable_shared_log = config.enable_shared_log;
    let node_id = config.node_id;
    let local_cut_interval = Duration::from_micros(config.local_cut_interval_us);

    let engine = Arc::new(Engine::new(
        config,
        func_config,
        Arc::new(LoggingCompletionSink),
    ));
    engine.ipc_paths().setup()?;

    if enable_shared_log {
        start_slog_core(node_id, local_cut_interval)?;
    }

    let pool = Arc::new(IoWorkerPool::start(
        engine.clone(),
        engine.config().num_io_workers,
    )?);

    // The accept loop runs until the listener fails
    run_ipc_listener(engine, pool)
}

/// Bring up the shared-log engine core and its local-cut timer.
///
/// The sequencer message plane is the embedder's wiring: callbacks and
/// emitted cuts are logged here so a bare engine node stays observable.
fn start_slog_core(node_id: u16, local_cut_interval: Duration) -> Result<()> {
    let callbacks = EngineCoreCallbacks {
        log_persisted: Box::new(|localid, seqnum| {
            info!(localid, seqnum, "Log entry persisted");
        }),
        log_discarded: Box::new(|localid| {
            info!(localid, "Log entry discarded");
        }),
        send_tag_vec: Box::new(|view, start_seqnum, tags| {
            info!(
                view_id = view.id(),
                start_seqnum,
                tags = tags.len(),
                "Tag vector ready"
            );
        }),
    };
    let core = Arc::new(Mutex::new(SLogEngineCore::new(node_id, callbacks)));
    spawn_interval_thread("local-cut-timer", "SLOG", local_cut_interval, move || {
        if let Some(cut) = core.lock().build_local_cut_message() {
            info!(
                view_id = cut.view_id,
                cuts = ?cut.localid_cuts,
                "Local cut ready"
            );
        }
    })?;
    Ok(())
}
