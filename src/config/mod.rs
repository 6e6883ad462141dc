//! Configuration for the Lumen engine node
//!
//! Configuration comes from three sources, in precedence order:
//! 1. Command-line arguments (`EngineArgs`)
//! 2. Environment variables (`FAAS_*`)
//! 3. Built-in defaults

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default root directory for IPC artifacts (socket, shm files, FIFOs)
pub const DEFAULT_IPC_ROOT: &str = "/dev/shm/faas_ipc";

/// Default number of I/O worker threads
pub const DEFAULT_NUM_IO_WORKERS: usize = 2;

/// Default interval between local cut messages, in microseconds
pub const DEFAULT_LOCAL_CUT_INTERVAL_US: u64 = 1000;

/// Default per-call timeout for nested invocations, in milliseconds
pub const DEFAULT_FUNC_CALL_TIMEOUT_MS: u64 = 5000;

/// Default cap on live (in-memory) log entries kept by a storage shard
pub const DEFAULT_MAX_LIVE_STORAGE_ENTRIES: usize = 65536;

/// Default listen backlog for the engine IPC socket
pub const DEFAULT_LISTEN_BACKLOG: u32 = 64;

/// Command-line arguments for the engine binary
#[derive(Debug, Parser)]
#[command(name = "lumen-engine", about = "Lumen FaaS engine node")]
pub struct EngineArgs {
    /// Node ID of this engine. Defaults to FAAS_NODE_ID, then to a hash of
    /// the hostname.
    #[arg(long)]
    pub node_id: Option<u16>,

    /// Root directory for IPC artifacts
    #[arg(long, default_value = DEFAULT_IPC_ROOT)]
    pub ipc_root: PathBuf,

    /// Path to the function config file (JSON)
    #[arg(long)]
    pub func_config_file: PathBuf,

    /// Number of I/O worker threads
    #[arg(long, default_value_t = DEFAULT_NUM_IO_WORKERS)]
    pub io_workers: usize,

    /// Enable the shared log subsystem
    #[arg(long, default_value_t = false)]
    pub enable_shared_log: bool,

    /// Path to the sequencer config file (required with --enable-shared-log)
    #[arg(long)]
    pub sequencer_config_file: Option<PathBuf>,

    /// If set, launchers and workers connect over localhost TCP instead of
    /// the Unix socket (cross-host testing)
    #[arg(long)]
    pub engine_tcp_port: Option<u16>,

    /// Disable the function container monitor
    #[arg(long, default_value_t = false)]
    pub disable_monitor: bool,
}

/// Resolved configuration for an engine node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub node_id: u16,
    pub ipc_root: PathBuf,
    pub func_config_file: PathBuf,
    pub num_io_workers: usize,
    pub listen_backlog: u32,
    pub enable_shared_log: bool,
    pub sequencer_config_file: Option<PathBuf>,
    pub engine_tcp_port: Option<u16>,
    pub monitor_enabled: bool,
    /// Interval between local cut messages, microseconds
    pub local_cut_interval_us: u64,
    /// Per-call timeout for nested invocations, milliseconds
    pub func_call_timeout_ms: u64,
    /// Cap on live log entries kept in memory by a storage shard
    pub max_live_storage_entries: usize,
    /// Coordination-service tunables, passed through to the embedder
    pub raft_election_timeout_ms: u64,
    pub raft_heartbeat_interval_ms: u64,
    pub raft_snapshot_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            ipc_root: PathBuf::from(DEFAULT_IPC_ROOT),
            func_config_file: PathBuf::new(),
            num_io_workers: DEFAULT_NUM_IO_WORKERS,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            enable_shared_log: false,
            sequencer_config_file: None,
            engine_tcp_port: None,
            monitor_enabled: true,
            local_cut_interval_us: DEFAULT_LOCAL_CUT_INTERVAL_US,
            func_call_timeout_ms: DEFAULT_FUNC_CALL_TIMEOUT_MS,
            max_live_storage_entries: DEFAULT_MAX_LIVE_STORAGE_ENTRIES,
            raft_election_timeout_ms: 1000,
            raft_heartbeat_interval_ms: 100,
            raft_snapshot_threshold: 10_000,
        }
    }
}

impl EngineConfig {
    /// Build the resolved configuration from parsed arguments and the
    /// environment.
    pub fn from_args(args: EngineArgs) -> Self {
        let node_id = args
            .node_id
            .or_else(node_id_from_env)
            .unwrap_or_else(node_id_from_hostname);
        Self {
            node_id,
            ipc_root: args.ipc_root,
            func_config_file: args.func_config_file,
            num_io_workers: args.io_workers.max(1),
            enable_shared_log: args.enable_shared_log,
            sequencer_config_file: args.sequencer_config_file,
            engine_tcp_port: args.engine_tcp_port,
            monitor_enabled: !args.disable_monitor,
            ..Self::default()
        }
    }
}

fn node_id_from_env() -> Option<u16> {
    std::env::var("FAAS_NODE_ID").ok()?.parse().ok()
}

/// Derive a stable node id by hashing the hostname.
///
/// Overflow wraps freely; the only requirement is determinism for a given
/// hostname.
fn node_id_from_hostname() -> u16 {
    let hostname = std::env::var("FAAS_ENGINE_HOST")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_default();
    hash_hostname(&hostname)
}

fn hash_hostname(hostname: &str) -> u16 {
    let mut result: u16 = 0;
    for byte in hostname.bytes() {
        result = result.wrapping_mul(177).wrapping_add(u16::from(byte));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.ipc_root, PathBuf::from("/dev/shm/faas_ipc"));
        assert_eq!(config.local_cut_interval_us, 1000);
        assert!(config.monitor_enabled);
    }

    #[test]
    fn test_hostname_hash_is_stable() {
        assert_eq!(hash_hostname("engine-0"), hash_hostname("engine-0"));
        assert_ne!(hash_hostname("engine-0"), hash_hostname("engine-1"));
    }

    #[test]
    fn test_from_args_respects_explicit_node_id() {
        let args = EngineArgs::parse_from([
            "lumen-engine",
            "--node-id",
            "42",
            "--func-config-file",
            "/tmp/funcs.json",
        ]);
        let config = EngineConfig::from_args(args);
        assert_eq!(config.node_id, 42);
        assert_eq!(config.num_io_workers, DEFAULT_NUM_IO_WORKERS);
    }

    #[test]
    fn test_io_workers_floor_of_one() {
        let args = EngineArgs::parse_from([
            "lumen-engine",
            "--io-workers",
            "0",
            "--func-config-file",
            "/tmp/funcs.json",
        ]);
        let config = EngineConfig::from_args(args);
        assert_eq!(config.num_io_workers, 1);
    }
}
