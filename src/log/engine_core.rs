//! Per-engine shared log bookkeeping
//!
//! [`SLogEngineCore`] sits between "a function produced a log record" and
//! "the record is durable and globally ordered". It tracks entries this
//! node primaries (awaiting replication) and entries it stores as a backup
//! (awaiting their view's cut), feeds the tag index, and produces the local
//! cut messages that drive the primary sequencer.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::fsm::{Fsm, FsmEvent};
use super::records::{FsmRecordsMsg, LocalCutMsg};
use super::tag_index::TagIndex;
use super::view::{NodeId, View};
use super::{
    build_local_id, local_id_to_node_id, local_id_to_view_id, LogEntry, Tag, EMPTY_TAG,
};

/// Progress readouts exposed for sequencer re-sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmProgressKind {
    /// Records applied by the storage-side FSM
    Storage,
    /// Records applied by the tag index
    Index,
}

/// Narrow observer capability, registered once at construction
pub struct EngineCoreCallbacks {
    /// (localid, seqnum): the entry is replicated and globally ordered
    pub log_persisted: Box<dyn Fn(u64, u64) + Send>,
    /// (localid): the entry can never replicate (its view is gone)
    pub log_discarded: Box<dyn Fn(u64) + Send>,
    /// (view, start_seqnum, tags): tag vector of an own batch, to be sent
    /// to the other engine nodes
    pub send_tag_vec: Box<dyn Fn(&View, u64, &[Tag]) + Send>,
}

/// Per-engine bookkeeping core for the shared log
pub struct SLogEngineCore {
    my_node_id: NodeId,
    fsm: Fsm,
    /// Counter for records this node primaries; restarts every view
    next_localid: u32,
    /// localid → entry, both self-primaried (awaiting replication) and
    /// backup-stored (awaiting their view's cut)
    pending_entries: BTreeMap<u64, LogEntry>,
    /// seqnum → entry, after replication
    persisted_entries: BTreeMap<u64, LogEntry>,
    /// For each engine whose backups include us: the next localid counter
    /// we have contiguously stored
    log_progress: HashMap<NodeId, u32>,
    log_progress_dirty: bool,
    tag_index: TagIndex,
    callbacks: EngineCoreCallbacks,
}

impl SLogEngineCore {
    pub fn new(my_node_id: NodeId, callbacks: EngineCoreCallbacks) -> Self {
        Self {
            my_node_id,
            fsm: Fsm::new(),
            next_localid: 0,
            pending_entries: BTreeMap::new(),
            persisted_entries: BTreeMap::new(),
            log_progress: HashMap::new(),
            log_progress_dirty: false,
            tag_index: TagIndex::new(),
            callbacks,
        }
    }

    pub fn fsm(&self) -> &Fsm {
        &self.fsm
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.tag_index
    }

    pub fn fsm_progress(&self, kind: FsmProgressKind) -> u32 {
        match kind {
            FsmProgressKind::Storage => self.fsm.progress(),
            FsmProgressKind::Index => self.tag_index.fsm_progress(),
        }
    }

    /// Consume a batched FSM records broadcast from the sequencers
    pub fn on_new_fsm_records_message(&mut self, message: FsmRecordsMsg) {
        let events = self.fsm.on_recv_records_msg(message);
        for event in events {
            self.handle_fsm_event(event);
        }
    }

    /// Tag vector received from another engine's replicated batch
    pub fn on_recv_tag_data(&mut self, primary_node_id: NodeId, start_seqnum: u64, tags: &[Tag]) {
        self.tag_index.recv_tag_data(primary_node_id, start_seqnum, tags);
    }

    /// Resolve the engine node that primaries `tag` in the current view.
    /// `None` when no view message has arrived from the sequencers yet.
    pub fn log_tag_to_primary_node(&self, tag: Tag) -> Option<NodeId> {
        let current_view = match self.fsm.current_view() {
            Some(view) => view,
            None => {
                error!("No view message from sequencer yet");
                return None;
            }
        };
        if tag == EMPTY_TAG {
            if current_view.contains_engine_node(self.my_node_id) {
                Some(self.my_node_id)
            } else {
                warn!("Current view does not contain this node; picking a random primary");
                Some(current_view.pick_one_node())
            }
        } else {
            Some(current_view.log_tag_to_primary_node(tag))
        }
    }

    /// Append an entry this node primaries. Returns its localid.
    pub fn store_log_as_primary_node(&mut self, tag: Tag, data: Bytes) -> Option<u64> {
        let current_view = match self.fsm.current_view() {
            Some(view) => view.clone(),
            None => {
                error!("No view message from sequencer yet");
                return None;
            }
        };
        if !current_view.contains_engine_node(self.my_node_id) {
            error!(
                view_id = current_view.id(),
                "Current view does not contain this node"
            );
            return None;
        }
        if tag != EMPTY_TAG && current_view.log_tag_to_primary_node(tag) != self.my_node_id {
            error!(
                tag,
                view_id = current_view.id(),
                "This node is not the primary of the tag in the current view"
            );
            return None;
        }
        debug!(tag, data_size = data.len(), "New local log");
        let localid = build_local_id(current_view.id(), self.my_node_id, self.next_localid);
        self.next_localid += 1;
        self.pending_entries
            .insert(localid, LogEntry::new(localid, tag, data));
        self.log_progress_dirty = true;
        Some(localid)
    }

    /// Store an entry on behalf of its primary. Returns false when the
    /// entry belongs to a superseded view and was dropped.
    ///
    /// Panics if the localid names this node as primary: a primary never
    /// receives its own entries on the backup path, so this indicates
    /// view-membership desynchronization.
    pub fn store_log_as_backup_node(&mut self, tag: Tag, data: Bytes, localid: u64) -> bool {
        let view_id = local_id_to_view_id(localid);
        let primary_node_id = local_id_to_node_id(localid);
        assert!(
            primary_node_id != self.my_node_id,
            "primary node id of backup entry is this node"
        );
        debug!(view_id, primary_node_id, "Store new log as backup node");
        let current_view = self.fsm.current_view().cloned();
        if let Some(view) = &current_view {
            if view.id() > view_id {
                warn!(view_id, current_view_id = view.id(), "Received outdated log");
                return false;
            }
        }
        self.pending_entries
            .insert(localid, LogEntry::new(localid, tag, data));
        if let Some(view) = current_view {
            if view.id() == view_id {
                self.advance_log_progress(&view, primary_node_id);
            }
        }
        true
    }

    /// Register a placeholder for an entry whose data will arrive with its
    /// replication notice
    pub fn add_wait_for_replication(&mut self, tag: Tag, localid: u64) {
        self.pending_entries
            .insert(localid, LogEntry::new(localid, tag, Bytes::new()));
    }

    /// Emit the local cut, or `None` when nothing advanced since the last
    /// one. The first element is this node's own `next_localid`; the rest
    /// follow the view's primary-of iteration order.
    pub fn build_local_cut_message(&mut self) -> Option<LocalCutMsg> {
        if !self.log_progress_dirty {
            return None;
        }
        let view = self.fsm.current_view()?.clone();
        self.log_progress_dirty = false;
        let mut localid_cuts = vec![self.next_localid];
        for node_id in view.primary_nodes_backed_by(self.my_node_id) {
            localid_cuts.push(self.log_progress.get(&node_id).copied().unwrap_or(0));
        }
        Some(LocalCutMsg {
            view_id: view.id(),
            my_node_id: self.my_node_id,
            localid_cuts,
        })
    }

    fn handle_fsm_event(&mut self, event: FsmEvent) {
        match event {
            FsmEvent::NewView {
                record_seqnum,
                view,
            } => self.on_fsm_new_view(record_seqnum, view),
            FsmEvent::LogReplicated {
                start_localid,
                start_seqnum,
                delta,
            } => self.on_fsm_log_replicated(start_localid, start_seqnum, delta),
            FsmEvent::GlobalCut {
                record_seqnum,
                start_seqnum,
                end_seqnum,
            } => self
                .tag_index
                .on_new_global_cut(record_seqnum, start_seqnum, end_seqnum),
        }
    }

    fn on_fsm_new_view(&mut self, record_seqnum: u32, view: Arc<View>) {
        // Entries of older views can never replicate now
        let discarded: Vec<u64> = self
            .pending_entries
            .range(..build_local_id(view.id(), 0, 0))
            .map(|(&localid, _)| localid)
            .collect();
        for localid in discarded {
            self.pending_entries.remove(&localid);
            (self.callbacks.log_discarded)(localid);
        }
        self.next_localid = 0;
        self.log_progress.clear();
        if view.contains_engine_node(self.my_node_id) {
            for node_id in view.primary_nodes_backed_by(self.my_node_id) {
                self.log_progress.insert(node_id, 0);
                self.advance_log_progress(&view, node_id);
            }
        }
        self.tag_index.on_new_view(record_seqnum, view.id());
    }

    fn on_fsm_log_replicated(&mut self, start_localid: u64, start_seqnum: u64, delta: u32) {
        for i in 0..u64::from(delta) {
            let localid = start_localid + i;
            let mut entry = match self.pending_entries.remove(&localid) {
                Some(entry) => entry,
                None => continue,
            };
            let seqnum = start_seqnum + i;
            debug!(localid, seqnum, "Log replicated");
            entry.seqnum = seqnum;
            (self.callbacks.log_persisted)(entry.localid, entry.seqnum);
            self.persisted_entries.insert(seqnum, entry);
        }
        if local_id_to_node_id(start_localid) == self.my_node_id {
            let tags: Vec<Tag> = (0..u64::from(delta))
                .map(|i| {
                    self.persisted_entries
                        .get(&(start_seqnum + i))
                        .map(|entry| entry.tag)
                        .unwrap_or(EMPTY_TAG)
                })
                .collect();
            self.tag_index
                .recv_tag_data(self.my_node_id, start_seqnum, &tags);
            if let Some(view) = self.fsm.current_view() {
                (self.callbacks.send_tag_vec)(view, start_seqnum, &tags);
            }
        }
    }

    /// Extend the contiguous stored prefix for `node_id` and mark the cut
    /// dirty when it moved
    fn advance_log_progress(&mut self, view: &View, node_id: NodeId) {
        let counter = match self.log_progress.get(&node_id) {
            Some(&counter) => counter,
            None => {
                error!(
                    node_id,
                    view_id = view.id(),
                    "This node is not a backup of the given node in the view"
                );
                return;
            }
        };
        let mut advanced = counter;
        while self
            .pending_entries
            .contains_key(&build_local_id(view.id(), node_id, advanced))
        {
            advanced += 1;
        }
        if advanced > counter {
            self.log_progress.insert(node_id, advanced);
            self.log_progress_dirty = true;
        }
    }

    /// Fetch a persisted entry by seqnum
    pub fn persisted_entry(&self, seqnum: u64) -> Option<&LogEntry> {
        self.persisted_entries.get(&seqnum)
    }

    pub fn pending_entry_count(&self) -> usize {
        self.pending_entries.len()
    }

    /// Debug dump of the core state
    pub fn state_check(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "My NodeId: {}", self.my_node_id);
        out.push_str(&self.fsm.state_check());
        if !self.pending_entries.is_empty() {
            let _ = writeln!(
                out,
                "There are {} pending log entries",
                self.pending_entries.len()
            );
            for (counter, (localid, entry)) in self.pending_entries.iter().enumerate() {
                let node_id = local_id_to_node_id(*localid);
                let src = if node_id == self.my_node_id {
                    "myself".to_string()
                } else {
                    node_id.to_string()
                };
                let _ = writeln!(
                    out,
                    "--[{}] LocalId={:#018x} Tag={} SrcNode={}",
                    counter + 1,
                    localid,
                    entry.tag,
                    src
                );
                if counter + 1 >= 32 {
                    out.push_str("...more...\n");
                    break;
                }
            }
        }
        let _ = write!(out, "LogProgress:");
        let mut progress: Vec<_> = self.log_progress.iter().collect();
        progress.sort_unstable_by_key(|(node_id, _)| **node_id);
        for (node_id, counter) in progress {
            let _ = write!(out, " Node[{}]={:#010x}", node_id, counter);
        }
        let _ = writeln!(out, " Myself={:#010x}", self.next_localid);
        out.push_str(&self.tag_index.state_check());
        out
    }
}
