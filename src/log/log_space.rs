//! Per-logspace state machines
//!
//! A logspace is a (view, primary sequencer) pair owning a contiguous range
//! of sequence numbers. This module holds the three materializations:
//!
//! - [`MetaLogPrimary`]: the one primary per logspace per view; aggregates
//!   storage-shard progress, mints global cuts, tracks replica quorum
//! - [`MetaLogBackup`]: a replica applying meta-log records in order
//! - [`LogStorage`]: a storage node's shard bookkeeping for one logspace
//!
//! Logspaces are shared behind [`LockablePtr`], a reader-writer guard over
//! a heap cell: collections hand out the pointer under a short read lock,
//! and mutation happens under an explicit write lock.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

use super::records::{MetaLog, MetaLogKind, NewLogsRecord};
use super::view::{NodeId, View};
use super::{
    build_local_id, build_logspace_id, build_seqnum, local_id_to_node_id, LogEntry,
};

/// Reader-writer guard over a heap cell; `read()` for lookups, `write()`
/// for mutation
pub type LockablePtr<T> = Arc<RwLock<T>>;

/// Lifecycle of a logspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSpaceState {
    Normal,
    /// No further mutation accepted; tail meta-logs may still be read
    Frozen,
    /// Terminal; installed when the superseding view commits this
    /// logspace's final extent
    Finalized,
}

/// Ordered application of meta-log records, shared by primary and backups
struct MetaLogTracker {
    logspace_id: u32,
    /// Next meta-log seqnum to apply
    position: u32,
    /// Applied records, indexed by metalog_seqnum
    applied: Vec<MetaLog>,
    /// Records that arrived ahead of `position`
    pending: BTreeMap<u32, MetaLog>,
    /// Position half of the next seqnum this logspace will assign
    seqnum_position: u32,
}

impl MetaLogTracker {
    fn new(logspace_id: u32) -> Self {
        Self {
            logspace_id,
            position: 0,
            applied: Vec::new(),
            pending: BTreeMap::new(),
            seqnum_position: 0,
        }
    }

    /// Feed one record; returns the records that became applied, in order.
    /// Records below the current position are duplicates and are dropped.
    fn provide(&mut self, metalog: MetaLog) -> Vec<MetaLog> {
        assert_eq!(
            metalog.logspace_id, self.logspace_id,
            "meta-log record for a different logspace"
        );
        if metalog.metalog_seqnum < self.position {
            warn!(
                metalog_seqnum = metalog.metalog_seqnum,
                position = self.position,
                "Dropping duplicate meta-log record"
            );
            return Vec::new();
        }
        self.pending.insert(metalog.metalog_seqnum, metalog);
        let mut newly_applied = Vec::new();
        while let Some(metalog) = self.pending.remove(&self.position) {
            self.position += 1;
            if let Some(new_logs) = metalog.new_logs() {
                let total: u32 = new_logs.shard_deltas.iter().sum();
                self.seqnum_position += total;
            }
            self.applied.push(metalog.clone());
            newly_applied.push(metalog);
        }
        newly_applied
    }

    /// Records in `[from, to)`, or `None` when the range is not fully
    /// applied
    fn get_range(&self, from: u32, to: u32) -> Option<Vec<MetaLog>> {
        if to > self.applied.len() as u32 || from > to {
            return None;
        }
        Some(self.applied[from as usize..to as usize].to_vec())
    }
}

/// The primary sequencer's state for one logspace
pub struct MetaLogPrimary {
    view: Arc<View>,
    sequencer_id: NodeId,
    state: LogSpaceState,
    tracker: MetaLogTracker,
    /// (engine, storage) → that storage's progress for the engine's shard
    shard_progress: HashMap<(NodeId, NodeId), u32>,
    /// Per engine: position committed by the last cut
    last_cut: HashMap<NodeId, u32>,
    /// Engines whose replicated position moved past the last cut
    dirty_shards: BTreeSet<NodeId>,
    /// Latest acknowledged meta-log position per replica sequencer
    metalog_progresses: HashMap<NodeId, u32>,
    /// Median of the replica acknowledgments
    replicated_metalog_position: u32,
}

impl MetaLogPrimary {
    pub fn new(view: Arc<View>, sequencer_id: NodeId) -> Self {
        let logspace_id = build_logspace_id(view.id(), sequencer_id);
        let mut shard_progress = HashMap::new();
        let mut last_cut = HashMap::new();
        for &engine_id in view.engine_node_ids() {
            if let Some(engine) = view.engine_node(engine_id) {
                for &storage_id in &engine.storage_nodes {
                    shard_progress.insert((engine_id, storage_id), 0);
                }
            }
            last_cut.insert(engine_id, 0);
        }
        let mut metalog_progresses = HashMap::new();
        if let Some(sequencer) = view.sequencer_node(sequencer_id) {
            for &replica_id in &sequencer.replicas {
                metalog_progresses.insert(replica_id, 0);
            }
        }
        if metalog_progresses.is_empty() {
            warn!(view_id = view.id(), sequencer_id, "No meta log replication");
        }
        Self {
            view,
            sequencer_id,
            state: LogSpaceState::Normal,
            tracker: MetaLogTracker::new(logspace_id),
            shard_progress,
            last_cut,
            dirty_shards: BTreeSet::new(),
            metalog_progresses,
            replicated_metalog_position: 0,
        }
    }

    pub fn identifier(&self) -> u32 {
        self.tracker.logspace_id
    }

    pub fn view(&self) -> &Arc<View> {
        &self.view
    }

    pub fn sequencer_id(&self) -> NodeId {
        self.sequencer_id
    }

    /// Next meta-log sequence number to assign
    pub fn metalog_position(&self) -> u32 {
        self.tracker.position
    }

    pub fn replicated_metalog_position(&self) -> u32 {
        self.replicated_metalog_position
    }

    pub fn all_metalog_replicated(&self) -> bool {
        self.replicated_metalog_position == self.tracker.position
    }

    pub fn frozen(&self) -> bool {
        self.state != LogSpaceState::Normal
    }

    pub fn freeze(&mut self) {
        if self.state == LogSpaceState::Normal {
            self.state = LogSpaceState::Frozen;
        }
    }

    pub fn finalize_space(&mut self) {
        self.state = LogSpaceState::Finalized;
    }

    /// Apply a storage node's progress vector. `progress[i]` is the
    /// storage's position for `view.storage_node(storage_id).source_engines[i]`.
    ///
    /// Panics when the storage node is outside the view or the vector does
    /// not match its source-engine list: both indicate view-membership
    /// desynchronization.
    pub fn update_storage_progress(&mut self, storage_id: NodeId, progress: &[u32]) {
        if self.frozen() {
            warn!(
                logspace_id = format_args!("{:#010x}", self.identifier()),
                "LogSpace is frozen"
            );
            return;
        }
        let storage_node = self
            .view
            .storage_node(storage_id)
            .unwrap_or_else(|| {
                panic!(
                    "view {} does not have storage node {storage_id}",
                    self.view.id()
                )
            });
        assert_eq!(
            progress.len(),
            storage_node.source_engines.len(),
            "progress size does not match the storage node's source engines"
        );
        let source_engines = storage_node.source_engines.clone();
        for (i, &position) in progress.iter().enumerate() {
            let engine_id = source_engines[i];
            let cell = (engine_id, storage_id);
            let current = self.shard_progress.get(&cell).copied().unwrap_or(0);
            if position > current {
                self.shard_progress.insert(cell, position);
                let replicated = self.shard_replicated_position(engine_id);
                let last_cut = self.last_cut[&engine_id];
                debug_assert!(replicated >= last_cut);
                if replicated > last_cut {
                    self.dirty_shards.insert(engine_id);
                }
            }
        }
    }

    /// Apply a replica sequencer's acknowledgment.
    ///
    /// Panics on an ack from a non-replica or for a position ahead of what
    /// this primary has minted: the primary never loses `metalog_position`
    /// within a view, so a future ack is a protocol violation.
    pub fn update_replica_progress(&mut self, sequencer_id: NodeId, metalog_position: u32) {
        let is_replica = self
            .view
            .sequencer_node(self.sequencer_id)
            .map(|node| node.is_replica_sequencer_node(sequencer_id))
            .unwrap_or(false);
        assert!(
            is_replica,
            "META_PROG from sequencer {sequencer_id} which is not a replica"
        );
        assert!(
            metalog_position <= self.tracker.position,
            "future meta-log ack: received={metalog_position}, current={}",
            self.tracker.position
        );
        let current = self.metalog_progresses.get(&sequencer_id).copied().unwrap_or(0);
        if metalog_position > current {
            self.metalog_progresses
                .insert(sequencer_id, metalog_position);
            self.update_replicated_position();
        }
    }

    /// Mint the next global cut, or `None` when every shard is clean.
    pub fn mark_next_cut(&mut self) -> Option<MetaLog> {
        if self.dirty_shards.is_empty() {
            return None;
        }
        let start_seqnum = build_seqnum(self.identifier(), self.tracker.seqnum_position);
        let mut shard_starts = Vec::with_capacity(self.view.engine_node_ids().len());
        let mut shard_deltas = Vec::with_capacity(self.view.engine_node_ids().len());
        let engine_ids: Vec<NodeId> = self.view.engine_node_ids().to_vec();
        for engine_id in engine_ids {
            let last_cut = self.last_cut[&engine_id];
            shard_starts.push(last_cut);
            let mut delta = 0;
            if self.dirty_shards.contains(&engine_id) {
                let current = self.shard_replicated_position(engine_id);
                debug_assert!(current > last_cut);
                delta = current - last_cut;
                self.last_cut.insert(engine_id, current);
            }
            shard_deltas.push(delta);
        }
        self.dirty_shards.clear();
        let metalog = MetaLog {
            logspace_id: self.identifier(),
            metalog_seqnum: self.tracker.position,
            kind: MetaLogKind::NewLogs(NewLogsRecord {
                start_seqnum,
                shard_starts,
                shard_deltas,
            }),
        };
        let applied = self.tracker.provide(metalog.clone());
        assert_eq!(applied.len(), 1, "failed to advance metalog position");
        if self.metalog_progresses.is_empty() {
            // Single-sequencer deployment: nothing to wait for
            self.replicated_metalog_position = self.tracker.position;
        }
        Some(metalog)
    }

    /// Applied records in `[from, to)`, for propagation after the quorum
    /// advances
    pub fn get_metalogs(&self, from: u32, to: u32) -> Option<Vec<MetaLog>> {
        self.tracker.get_range(from, to)
    }

    fn update_replicated_position(&mut self) {
        if self.replicated_metalog_position == self.tracker.position {
            return;
        }
        if self.metalog_progresses.is_empty() {
            return;
        }
        let mut progress: Vec<u32> = self.metalog_progresses.values().copied().collect();
        progress.sort_unstable();
        let mid = progress.len() / 2;
        let median = progress[mid];
        debug_assert!(median >= self.replicated_metalog_position);
        debug_assert!(median <= self.tracker.position);
        self.replicated_metalog_position = median;
    }

    /// Min over this engine's storage nodes of their shard progress
    fn shard_replicated_position(&self, engine_id: NodeId) -> u32 {
        let engine = self
            .view
            .engine_node(engine_id)
            .unwrap_or_else(|| panic!("unknown engine node {engine_id}"));
        engine
            .storage_nodes
            .iter()
            .map(|&storage_id| {
                self.shard_progress
                    .get(&(engine_id, storage_id))
                    .copied()
                    .unwrap_or(0)
            })
            .min()
            .unwrap_or(0)
    }
}

/// A replica sequencer's state for a peer's logspace
pub struct MetaLogBackup {
    view: Arc<View>,
    primary_sequencer_id: NodeId,
    state: LogSpaceState,
    tracker: MetaLogTracker,
}

impl MetaLogBackup {
    pub fn new(view: Arc<View>, primary_sequencer_id: NodeId) -> Self {
        let logspace_id = build_logspace_id(view.id(), primary_sequencer_id);
        Self {
            view,
            primary_sequencer_id,
            state: LogSpaceState::Normal,
            tracker: MetaLogTracker::new(logspace_id),
        }
    }

    pub fn identifier(&self) -> u32 {
        self.tracker.logspace_id
    }

    pub fn primary_sequencer_id(&self) -> NodeId {
        self.primary_sequencer_id
    }

    pub fn view(&self) -> &Arc<View> {
        &self.view
    }

    pub fn metalog_position(&self) -> u32 {
        self.tracker.position
    }

    pub fn frozen(&self) -> bool {
        self.state != LogSpaceState::Normal
    }

    pub fn freeze(&mut self) {
        if self.state == LogSpaceState::Normal {
            self.state = LogSpaceState::Frozen;
        }
    }

    pub fn finalize_space(&mut self) {
        self.state = LogSpaceState::Finalized;
    }

    /// Apply an incoming meta-log record; out-of-order records are held
    /// until their predecessors arrive, so records are never applied with
    /// a gap.
    pub fn provide_metalog(&mut self, metalog: MetaLog) {
        if self.frozen() {
            warn!(
                logspace_id = format_args!("{:#010x}", self.identifier()),
                "LogSpace is frozen"
            );
            return;
        }
        self.tracker.provide(metalog);
    }
}

/// A read request against a storage shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub seqnum: u64,
    pub origin_node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResultStatus {
    Ok,
    /// Entry was shrunk from the live window; look it up in the database
    LookupDb,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReadResult {
    pub status: ReadResultStatus,
    pub entry: Option<Arc<LogEntry>>,
    pub request: ReadRequest,
}

/// A storage node's bookkeeping for one logspace
pub struct LogStorage {
    storage_node_id: NodeId,
    view: Arc<View>,
    state: LogSpaceState,
    logspace_id: u32,
    /// Source engines, canonical order
    source_engines: Vec<NodeId>,
    /// Per source engine: position already committed by applied cuts
    applied_cut: HashMap<NodeId, u32>,
    /// Per source engine: contiguous stored prefix
    shard_progress: HashMap<NodeId, u32>,
    shard_progress_dirty: bool,
    /// localid → entry, stored but not yet cut
    pending_entries: HashMap<u64, LogEntry>,
    /// Live window of cut entries, ascending seqnums
    live_seqnums: VecDeque<u64>,
    live_entries: HashMap<u64, Arc<LogEntry>>,
    /// Entries below this are durably persisted
    persisted_seqnum_position: u64,
    pending_reads: BTreeMap<u64, Vec<ReadRequest>>,
    pending_read_results: Vec<ReadResult>,
    max_live_entries: usize,
    /// Next seqnum this logspace will assign
    seqnum_position: u64,
}

impl LogStorage {
    pub fn new(
        storage_node_id: NodeId,
        view: Arc<View>,
        sequencer_id: NodeId,
        max_live_entries: usize,
    ) -> Self {
        let logspace_id = build_logspace_id(view.id(), sequencer_id);
        let storage_node = view
            .storage_node(storage_node_id)
            .unwrap_or_else(|| panic!("view {} lacks storage node {storage_node_id}", view.id()));
        let source_engines = storage_node.source_engines.clone();
        let mut shard_progress = HashMap::new();
        let mut applied_cut = HashMap::new();
        for &engine_id in &source_engines {
            shard_progress.insert(engine_id, 0);
            applied_cut.insert(engine_id, 0);
        }
        Self {
            storage_node_id,
            view,
            state: LogSpaceState::Normal,
            logspace_id,
            source_engines,
            applied_cut,
            shard_progress,
            shard_progress_dirty: false,
            pending_entries: HashMap::new(),
            live_seqnums: VecDeque::new(),
            live_entries: HashMap::new(),
            persisted_seqnum_position: build_seqnum(logspace_id, 0),
            pending_reads: BTreeMap::new(),
            pending_read_results: Vec::new(),
            max_live_entries,
            seqnum_position: build_seqnum(logspace_id, 0),
        }
    }

    pub fn identifier(&self) -> u32 {
        self.logspace_id
    }

    pub fn frozen(&self) -> bool {
        self.state != LogSpaceState::Normal
    }

    pub fn freeze(&mut self) {
        if self.state == LogSpaceState::Normal {
            self.state = LogSpaceState::Frozen;
        }
    }

    /// Next seqnum to be assigned in this logspace
    pub fn seqnum_position(&self) -> u64 {
        self.seqnum_position
    }

    /// Position committed by applied cuts for one source engine's shard
    pub fn shard_cut_position(&self, engine_id: NodeId) -> u32 {
        self.applied_cut.get(&engine_id).copied().unwrap_or(0)
    }

    /// Store an entry replicated from an engine. Returns false when this
    /// node does not hold the engine's shard.
    pub fn store(&mut self, entry: LogEntry) -> bool {
        let engine_id = local_id_to_node_id(entry.localid);
        if !self.source_engines.contains(&engine_id) {
            warn!(
                storage_node_id = self.storage_node_id,
                engine_id, "Not a storage node for the engine"
            );
            return false;
        }
        self.pending_entries.insert(entry.localid, entry);
        self.advance_shard_progress(engine_id);
        true
    }

    /// Serve a read, or park it until the seqnum gets assigned
    pub fn read_at(&mut self, request: ReadRequest) {
        if request.seqnum >= self.seqnum_position {
            self.pending_reads
                .entry(request.seqnum)
                .or_default()
                .push(request);
            return;
        }
        let result = if let Some(entry) = self.live_entries.get(&request.seqnum) {
            ReadResult {
                status: ReadResultStatus::Ok,
                entry: Some(entry.clone()),
                request,
            }
        } else if request.seqnum < self.persisted_seqnum_position {
            ReadResult {
                status: ReadResultStatus::LookupDb,
                entry: None,
                request,
            }
        } else {
            ReadResult {
                status: ReadResultStatus::Failed,
                entry: None,
                request,
            }
        };
        self.pending_read_results.push(result);
    }

    /// Live entries beyond the persisted position, for flushing to the
    /// database. Returns `None` when everything live is already durable.
    pub fn grab_log_entries_for_persistence(&self) -> Option<(Vec<Arc<LogEntry>>, u64)> {
        let start = self
            .live_seqnums
            .partition_point(|&seqnum| seqnum < self.persisted_seqnum_position);
        if start >= self.live_seqnums.len() {
            return None;
        }
        let entries: Vec<Arc<LogEntry>> = self
            .live_seqnums
            .iter()
            .skip(start)
            .map(|seqnum| self.live_entries[seqnum].clone())
            .collect();
        let new_position = self.live_seqnums.back().copied().unwrap_or(0) + 1;
        Some((entries, new_position))
    }

    /// Durable flush finished up to `new_position`
    pub fn log_entries_persisted(&mut self, new_position: u64) {
        self.persisted_seqnum_position = new_position;
        self.shrink_live_entries_if_needed();
    }

    pub fn poll_read_results(&mut self) -> Vec<ReadResult> {
        std::mem::take(&mut self.pending_read_results)
    }

    /// Shard progress vector for the primary sequencer, ordered by the
    /// storage node's source-engine list; `None` when nothing advanced.
    pub fn grab_shard_progress_for_sending(&mut self) -> Option<Vec<u32>> {
        if !self.shard_progress_dirty {
            return None;
        }
        self.shard_progress_dirty = false;
        Some(
            self.source_engines
                .iter()
                .map(|engine_id| self.shard_progress[engine_id])
                .collect(),
        )
    }

    /// Apply a committed meta-log record, assigning seqnums to the pending
    /// entries it covers.
    ///
    /// Panics when the cut names an entry this node never stored: shard
    /// progress only advances over stored prefixes, so the primary cannot
    /// legally cut past them.
    pub fn provide_metalog(&mut self, metalog: &MetaLog) {
        if self.frozen() {
            warn!(
                logspace_id = format_args!("{:#010x}", self.identifier()),
                "LogSpace is frozen"
            );
            return;
        }
        let new_logs = match metalog.new_logs() {
            Some(record) => record,
            None => return,
        };
        let engine_ids: Vec<NodeId> = self.view.engine_node_ids().to_vec();
        assert_eq!(new_logs.shard_deltas.len(), engine_ids.len());
        let mut seqnum = new_logs.start_seqnum;
        for (idx, &engine_id) in engine_ids.iter().enumerate() {
            let start = new_logs.shard_starts[idx];
            let delta = new_logs.shard_deltas[idx];
            if self.source_engines.contains(&engine_id) {
                self.apply_new_logs(engine_id, start, delta, seqnum);
            }
            seqnum += u64::from(delta);
        }
        self.seqnum_position = seqnum;
        self.answer_unblocked_reads();
    }

    fn apply_new_logs(&mut self, engine_id: NodeId, start: u32, delta: u32, start_seqnum: u64) {
        for i in 0..delta {
            let localid = build_local_id(self.view.id(), engine_id, start + i);
            let seqnum = start_seqnum + u64::from(i);
            let mut entry = self
                .pending_entries
                .remove(&localid)
                .unwrap_or_else(|| panic!("cannot find pending log entry for localid {localid:#x}"));
            entry.seqnum = seqnum;
            debug_assert!(self.live_seqnums.back().map_or(true, |&last| seqnum > last));
            self.live_seqnums.push_back(seqnum);
            self.live_entries.insert(seqnum, Arc::new(entry));
            self.shrink_live_entries_if_needed();
            self.applied_cut.insert(engine_id, start + i + 1);
        }
    }

    fn answer_unblocked_reads(&mut self) {
        let ready: Vec<u64> = self
            .pending_reads
            .range(..self.seqnum_position)
            .map(|(&seqnum, _)| seqnum)
            .collect();
        for seqnum in ready {
            if let Some(requests) = self.pending_reads.remove(&seqnum) {
                for request in requests {
                    self.read_at(request);
                }
            }
        }
    }

    /// Discard whatever never got cut
    pub fn on_finalized(&mut self) {
        self.state = LogSpaceState::Finalized;
        if !self.pending_entries.is_empty() {
            warn!(
                discarded = self.pending_entries.len(),
                "Pending log entries discarded on finalize"
            );
            self.pending_entries.clear();
        }
    }

    fn advance_shard_progress(&mut self, engine_id: NodeId) {
        let current = self.shard_progress[&engine_id];
        let mut advanced = current;
        while self
            .pending_entries
            .contains_key(&build_local_id(self.view.id(), engine_id, advanced))
        {
            advanced += 1;
        }
        if advanced > current {
            self.shard_progress_dirty = true;
            self.shard_progress.insert(engine_id, advanced);
        }
    }

    fn shrink_live_entries_if_needed(&mut self) {
        while self.live_seqnums.len() > self.max_live_entries
            && self
                .live_seqnums
                .front()
                .is_some_and(|&front| front < self.persisted_seqnum_position)
        {
            if let Some(front) = self.live_seqnums.pop_front() {
                self.live_entries.remove(&front);
            }
            debug_assert_eq!(self.live_seqnums.len(), self.live_entries.len());
        }
    }
}
