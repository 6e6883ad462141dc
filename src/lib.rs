#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Lumen
//!
//! Lumen is a FaaS runtime whose engine nodes dispatch short function
//! invocations to worker processes and, in parallel, maintain a replicated
//! shared log ("SLog") that functions use for state and ordering.
//!
//! ## Architecture
//!
//! - [`engine`]: the dispatch core: launcher/worker IPC over Unix-domain
//!   sockets, per-function dispatchers, mixed inline/shared-memory payload
//!   transport, and the external-call completion sink
//! - [`log`]: the shared log: per-engine bookkeeping ([`log::engine_core`]),
//!   the view FSM, the per-view primary/backup sequencer pipeline, and the
//!   storage shard bookkeeping
//! - [`protocol`]: the fixed-size IPC wire message
//! - [`ipc`]: shared-memory regions, FIFOs, and the IPC root layout
//! - [`config`]: engine configuration and CLI arguments
//! - [`runtime`]: thread cpusets and interval threads
//! - [`error`]: error types and the `Result` alias
//!
//! ## Payload transport
//!
//! A function payload travels inline within the fixed message frame when it
//! fits [`protocol::INLINE_MAX`]; larger payloads go through a named
//! shared-memory region and the frame carries the negated size. One holder
//! of each region owns its removal; everyone else reads.
//!
//! ## Ordering
//!
//! Log entries get node-local ids when appended, are replicated to backup
//! nodes, and receive global sequence numbers when the per-view primary
//! sequencer aggregates shard progress into a cut that a majority of its
//! replica sequencers acknowledges.

pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod log;
pub mod protocol;
pub mod runtime;

pub use engine::{CallResult, CompletionSink, Engine, EngineStats};
pub use error::{LumenError, Result};
pub use protocol::{FuncCall, Message};
