//! Meta-log, FSM, and local-cut record types
//!
//! These records travel between engines, sequencers, and storage nodes.
//! All of them use length-prefixed JSON encoding on the wire:
//!
//! ```text
//! [4 bytes: record length (big-endian)] [record JSON bytes]
//! ```
//!
//! Engines are indexed in the view's canonical sort order in every cut
//! record, so every observer reconstructs shard deltas identically.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::view::ViewSpec;
use crate::error::{LumenError, Result};

/// A single meta-log record minted by a primary sequencer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaLog {
    /// (view_id:16 | sequencer_id:16)
    pub logspace_id: u32,
    /// Position of this record in the meta-log
    pub metalog_seqnum: u32,
    pub kind: MetaLogKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetaLogKind {
    NewLogs(NewLogsRecord),
    ViewChange,
}

/// A global cut: commits per-shard deltas against the previous cut
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewLogsRecord {
    /// First seqnum assigned by this cut
    pub start_seqnum: u64,
    /// Per engine (canonical order): the shard position before this cut
    pub shard_starts: Vec<u32>,
    /// Per engine (canonical order): entries committed by this cut; 0 for
    /// clean shards
    pub shard_deltas: Vec<u32>,
}

impl MetaLog {
    pub fn new_logs(&self) -> Option<&NewLogsRecord> {
        match &self.kind {
            MetaLogKind::NewLogs(record) => Some(record),
            MetaLogKind::ViewChange => None,
        }
    }
}

/// A batch of meta-log records for replication to backups
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaLogs {
    pub logspace_id: u32,
    pub metalogs: Vec<MetaLog>,
}

/// An engine's local cut: what it has replicated so far
///
/// `localid_cuts[0]` is the producer's own `next_localid`; subsequent
/// elements follow the view's primary-of iteration order for the producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalCutMsg {
    pub view_id: u16,
    pub my_node_id: u16,
    pub localid_cuts: Vec<u32>,
}

/// A record of the view FSM, delivered in `seqnum` order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsmRecord {
    /// Position of this record in the FSM's record sequence
    pub seqnum: u32,
    pub kind: FsmRecordKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FsmRecordKind {
    NewView(ViewSpec),
    GlobalCut(GlobalCutRecord),
}

/// A committed global cut as seen by engines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalCutRecord {
    /// First seqnum assigned by this cut
    pub start_seqnum: u64,
    /// Per engine (canonical order): the shard position after this cut
    pub localid_cuts: Vec<u32>,
}

/// A batch of FSM records broadcast by sequencers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsmRecordsMsg {
    pub records: Vec<FsmRecord>,
}

/// Encode a record with its length prefix
pub fn encode_record<T: Serialize>(record: &T) -> Result<Bytes> {
    let body = serde_json::to_vec(record)?;
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode one length-prefixed record from `payload`
pub fn decode_record<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    if payload.len() < 4 {
        return Err(LumenError::Protocol(format!(
            "record payload too short: {} bytes",
            payload.len()
        )));
    }
    let mut buf = payload;
    let len = buf.get_u32() as usize;
    if buf.len() < len {
        return Err(LumenError::Protocol(format!(
            "record payload truncated: have {}, expected {}",
            buf.len(),
            len
        )));
    }
    Ok(serde_json::from_slice(&buf[..len])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metalog_roundtrip() {
        let metalog = MetaLog {
            logspace_id: 0x0005_000a,
            metalog_seqnum: 3,
            kind: MetaLogKind::NewLogs(NewLogsRecord {
                start_seqnum: 100,
                shard_starts: vec![0, 5, 9],
                shard_deltas: vec![4, 0, 2],
            }),
        };
        let encoded = encode_record(&metalog).unwrap();
        let decoded: MetaLog = decode_record(&encoded).unwrap();
        assert_eq!(decoded, metalog);
    }

    #[test]
    fn test_local_cut_roundtrip() {
        let cut = LocalCutMsg {
            view_id: 2,
            my_node_id: 7,
            localid_cuts: vec![12, 4, 9],
        };
        let encoded = encode_record(&cut).unwrap();
        let decoded: LocalCutMsg = decode_record(&encoded).unwrap();
        assert_eq!(decoded, cut);
    }

    #[test]
    fn test_decode_truncated_payload() {
        let cut = LocalCutMsg {
            view_id: 1,
            my_node_id: 1,
            localid_cuts: vec![],
        };
        let encoded = encode_record(&cut).unwrap();
        let result: Result<LocalCutMsg> = decode_record(&encoded[..encoded.len() - 1]);
        assert!(result.is_err());
        let result: Result<LocalCutMsg> = decode_record(&encoded[..2]);
        assert!(result.is_err());
    }

    #[test]
    fn test_new_logs_accessor() {
        let record = MetaLog {
            logspace_id: 1,
            metalog_seqnum: 0,
            kind: MetaLogKind::ViewChange,
        };
        assert!(record.new_logs().is_none());
    }
}
