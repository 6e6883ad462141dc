//! The per-view primary/backup sequencer driver
//!
//! One sequencer process materializes a [`MetaLogPrimary`] for its own
//! logspace (when the view includes it) and a [`MetaLogBackup`] for every
//! peer whose replica set includes it. This driver owns the collections,
//! applies the view lifecycle, and runs the message handlers with one
//! uniform view policy:
//!
//! - future view on `MetaLogProgress` at the primary: fatal (the primary
//!   minted every position a replica can ack)
//! - future view elsewhere: held until the view installs
//! - past view: dropped with a warning
//!
//! Outbound traffic goes through a [`SequencerSink`]; the embedder wires it
//! to its connections.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::future_requests::FutureRequests;
use super::log_space::{LockablePtr, MetaLogBackup, MetaLogPrimary};
use super::records::{decode_record, LocalCutMsg, MetaLog, MetaLogs};
use super::view::{NodeId, View};
use super::{build_logspace_id, logspace_id_to_sequencer_id};
use crate::error::Result;

/// Operations on the sequencer message plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SLogOp {
    /// Replica → primary: acknowledged meta-log position
    MetaLogProgress,
    /// Storage → primary: per-shard progress vector
    ShardProgress,
    /// Engine → primary: local cut (shard progress in engine-replication
    /// deployments)
    LocalCut,
    /// Primary → replicas: meta-log records for replication
    MetaLogs,
}

/// Header of a sequencer-plane message
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SLogMessage {
    pub op: SLogOp,
    pub view_id: u16,
    pub logspace_id: u32,
    pub origin_node_id: NodeId,
    /// Valid for `MetaLogProgress`
    pub metalog_position: u32,
}

/// A message held for a future view
#[derive(Debug, Clone)]
pub struct SharedLogRequest {
    pub message: SLogMessage,
    pub payload: Bytes,
}

/// Outbound capability the sequencer is constructed with
pub trait SequencerSink: Send + Sync {
    /// Ship freshly minted meta-log records to the replica sequencers
    fn replicate_metalogs(&self, view: &View, metalogs: &MetaLogs);
    /// Ship quorum-committed meta-log records to engines and storage nodes
    fn propagate_metalogs(&self, view: &View, metalogs: &[MetaLog]);
    /// Acknowledge a primary's replication stream
    fn send_metalog_progress(
        &self,
        view: &View,
        primary_sequencer_id: NodeId,
        logspace_id: u32,
        metalog_position: u32,
    );
}

struct SequencerCore {
    current_view: Option<Arc<View>>,
    current_primary: Option<LockablePtr<MetaLogPrimary>>,
    primary_collection: HashMap<u32, LockablePtr<MetaLogPrimary>>,
    backup_collection: HashMap<u32, LockablePtr<MetaLogBackup>>,
}

/// Sequencer node driver
pub struct Sequencer {
    node_id: NodeId,
    sink: Arc<dyn SequencerSink>,
    core: RwLock<SequencerCore>,
    future_requests: Mutex<FutureRequests<SharedLogRequest>>,
}

impl Sequencer {
    pub fn new(node_id: NodeId, sink: Arc<dyn SequencerSink>) -> Self {
        Self {
            node_id,
            sink,
            core: RwLock::new(SequencerCore {
                current_view: None,
                current_primary: None,
                primary_collection: HashMap::new(),
                backup_collection: HashMap::new(),
            }),
            future_requests: Mutex::new(FutureRequests::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn current_view_id(&self) -> Option<u16> {
        self.core.read().current_view.as_ref().map(|view| view.id())
    }

    /// The coordination service created a view: install logspaces and
    /// release held requests.
    pub fn on_view_created(&self, view: Arc<View>) {
        let contains_myself = view.contains_sequencer_node(self.node_id);
        let mut ready_requests = Vec::new();
        {
            let mut core = self.core.write();
            if contains_myself {
                let primary_id = build_logspace_id(view.id(), self.node_id);
                core.primary_collection.insert(
                    primary_id,
                    Arc::new(RwLock::new(MetaLogPrimary::new(view.clone(), self.node_id))),
                );
                for &sequencer_id in view.sequencer_node_ids() {
                    let is_replica = view
                        .sequencer_node(sequencer_id)
                        .map(|node| node.is_replica_sequencer_node(self.node_id))
                        .unwrap_or(false);
                    if is_replica {
                        core.backup_collection.insert(
                            build_logspace_id(view.id(), sequencer_id),
                            Arc::new(RwLock::new(MetaLogBackup::new(
                                view.clone(),
                                sequencer_id,
                            ))),
                        );
                    }
                }
            }
            core.current_primary = core
                .primary_collection
                .get(&build_logspace_id(view.id(), self.node_id))
                .cloned();
            debug_assert!(!contains_myself || core.current_primary.is_some());
            {
                let mut future_requests = self.future_requests.lock();
                future_requests.on_new_view(
                    view.id(),
                    contains_myself.then_some(&mut ready_requests),
                );
            }
            info!(view_id = view.id(), contains_myself, "Sequencer view created");
            core.current_view = Some(view);
        }
        if !ready_requests.is_empty() {
            self.process_requests(ready_requests);
        }
    }

    /// The coordination service froze the view: no further mutation.
    pub fn on_view_frozen(&self, view_id: u16) {
        let core = self.core.read();
        let Some(current) = &core.current_view else {
            panic!("view frozen before any install");
        };
        debug_assert_eq!(view_id, current.id());
        if let Some(primary) = &core.current_primary {
            primary.write().freeze();
        }
        for backup in core.backup_collection.values() {
            let mut backup = backup.write();
            if backup.view().id() == view_id {
                backup.freeze();
            }
        }
    }

    /// The superseding view committed this view's final extent.
    pub fn on_view_finalized(&self, view_id: u16) {
        let core = self.core.read();
        let Some(current) = &core.current_view else {
            panic!("view finalized before any install");
        };
        debug_assert_eq!(view_id, current.id());
        if let Some(primary) = &core.current_primary {
            primary.write().finalize_space();
        }
        for backup in core.backup_collection.values() {
            let mut backup = backup.write();
            if backup.view().id() == view_id {
                backup.finalize_space();
            }
        }
    }

    /// Entry point for every sequencer-plane message
    pub fn handle_message(&self, message: SLogMessage, payload: Bytes) -> Result<()> {
        match message.op {
            SLogOp::MetaLogProgress => {
                self.on_recv_metalog_progress(&message);
                Ok(())
            }
            SLogOp::ShardProgress => self.on_recv_shard_progress(&message, &payload),
            SLogOp::LocalCut => self.on_recv_local_cut(&message, &payload),
            SLogOp::MetaLogs => self.on_recv_new_metalogs(&message, &payload),
        }
    }

    /// Replica acknowledgment at the primary. Quorum advancement triggers
    /// propagation of the newly committed records, exactly once.
    fn on_recv_metalog_progress(&self, message: &SLogMessage) {
        let (logspace_ptr, view) = {
            let core = self.core.read();
            let current = match &core.current_view {
                Some(view) => view,
                // The primary minted every position a replica can ack
                None => panic!("META_PROG before any view install"),
            };
            assert!(
                message.view_id <= current.id(),
                "META_PROG from future view {}",
                message.view_id
            );
            if message.view_id < current.id() {
                warn!(view_id = message.view_id, "Dropping META_PROG from past view");
                return;
            }
            let logspace_ptr = core
                .primary_collection
                .get(&message.logspace_id)
                .cloned()
                .unwrap_or_else(|| {
                    panic!("no primary logspace {:#010x}", message.logspace_id)
                });
            (logspace_ptr, current.clone())
        };
        let mut newly_replicated = Vec::new();
        {
            let mut locked = logspace_ptr.write();
            if locked.frozen() {
                warn!(
                    logspace_id = format_args!("{:#010x}", message.logspace_id),
                    "LogSpace is frozen"
                );
                return;
            }
            let old_position = locked.replicated_metalog_position();
            locked.update_replica_progress(message.origin_node_id, message.metalog_position);
            let new_position = locked.replicated_metalog_position();
            if new_position > old_position {
                newly_replicated = locked
                    .get_metalogs(old_position, new_position)
                    .unwrap_or_else(|| {
                        panic!("cannot get meta logs between {old_position} and {new_position}")
                    });
            }
        }
        if !newly_replicated.is_empty() {
            self.sink.propagate_metalogs(&view, &newly_replicated);
        }
    }

    /// Storage-shard progress at the primary
    fn on_recv_shard_progress(&self, message: &SLogMessage, payload: &Bytes) -> Result<()> {
        let logspace_ptr = match self.primary_logspace_or_hold(message, payload) {
            Some(ptr) => ptr,
            None => return Ok(()),
        };
        let progress: Vec<u32> = decode_record(payload)?;
        let mut locked = logspace_ptr.write();
        if locked.frozen() {
            warn!(
                logspace_id = format_args!("{:#010x}", message.logspace_id),
                "LogSpace is frozen"
            );
            return Ok(());
        }
        locked.update_storage_progress(message.origin_node_id, &progress);
        Ok(())
    }

    /// An engine's local cut. In engine-replicated deployments the engine
    /// doubles as the storage node of its own shard and of the shards it
    /// backs up, with `source_engines = [self] + primaries backed by self`
    /// in exactly the local cut's element order.
    fn on_recv_local_cut(&self, message: &SLogMessage, payload: &Bytes) -> Result<()> {
        let logspace_ptr = match self.primary_logspace_or_hold(message, payload) {
            Some(ptr) => ptr,
            None => return Ok(()),
        };
        let cut: LocalCutMsg = decode_record(payload)?;
        debug_assert_eq!(cut.my_node_id, message.origin_node_id);
        let mut locked = logspace_ptr.write();
        if locked.frozen() {
            warn!(
                logspace_id = format_args!("{:#010x}", message.logspace_id),
                "LogSpace is frozen"
            );
            return Ok(());
        }
        locked.update_storage_progress(cut.my_node_id, &cut.localid_cuts);
        Ok(())
    }

    /// Replicated meta-log records at a backup; acks the primary when the
    /// applied position advances.
    fn on_recv_new_metalogs(&self, message: &SLogMessage, payload: &Bytes) -> Result<()> {
        let (logspace_ptr, view) = {
            let core = self.core.read();
            if self.should_hold(&core, message, payload) {
                return Ok(());
            }
            if self.is_stale(&core, message) {
                return Ok(());
            }
            let logspace_ptr = core
                .backup_collection
                .get(&message.logspace_id)
                .cloned()
                .unwrap_or_else(|| {
                    panic!("no backup logspace {:#010x}", message.logspace_id)
                });
            let Some(view) = core.current_view.clone() else {
                // should_hold already held the request in this case
                unreachable!("message handled without an installed view");
            };
            (logspace_ptr, view)
        };
        let metalogs: MetaLogs = decode_record(payload)?;
        debug_assert_eq!(metalogs.logspace_id, message.logspace_id);
        let (old_position, new_position) = {
            let mut locked = logspace_ptr.write();
            if locked.frozen() {
                warn!(
                    logspace_id = format_args!("{:#010x}", message.logspace_id),
                    "LogSpace is frozen"
                );
                return Ok(());
            }
            let old_position = locked.metalog_position();
            for metalog in metalogs.metalogs {
                locked.provide_metalog(metalog);
            }
            (old_position, locked.metalog_position())
        };
        if new_position > old_position {
            self.sink.send_metalog_progress(
                &view,
                logspace_id_to_sequencer_id(message.logspace_id),
                message.logspace_id,
                new_position,
            );
        }
        Ok(())
    }

    /// Mint the next cut when every prior meta-log is replicated.
    pub fn mark_next_cut_if_doable(&self) {
        let (logspace_ptr, view) = {
            let core = self.core.read();
            match (&core.current_primary, &core.current_view) {
                (Some(primary), Some(view)) => (primary.clone(), view.clone()),
                _ => return,
            }
        };
        let (cut, committed) = {
            let mut locked = logspace_ptr.write();
            if locked.frozen() {
                return;
            }
            if !locked.all_metalog_replicated() {
                info!("Not all meta log replicated, will not mark new cut");
                return;
            }
            let cut = locked.mark_next_cut();
            let committed = locked.all_metalog_replicated();
            (cut, committed)
        };
        if let Some(cut) = cut {
            let metalogs = MetaLogs {
                logspace_id: cut.logspace_id,
                metalogs: vec![cut.clone()],
            };
            self.sink.replicate_metalogs(&view, &metalogs);
            if committed {
                // Single-sequencer deployment: no acks will arrive
                self.sink.propagate_metalogs(&view, &[cut]);
            }
        }
    }

    fn process_requests(&self, requests: Vec<SharedLogRequest>) {
        for request in requests {
            if let Err(e) = self.handle_message(request.message, request.payload) {
                warn!(error = %e, "Failed to process released request");
            }
        }
    }

    /// Common hold-or-fetch for handlers addressed at the primary
    fn primary_logspace_or_hold(
        &self,
        message: &SLogMessage,
        payload: &Bytes,
    ) -> Option<LockablePtr<MetaLogPrimary>> {
        let core = self.core.read();
        if self.should_hold(&core, message, payload) {
            return None;
        }
        if self.is_stale(&core, message) {
            return None;
        }
        Some(
            core.primary_collection
                .get(&message.logspace_id)
                .cloned()
                .unwrap_or_else(|| {
                    panic!("no primary logspace {:#010x}", message.logspace_id)
                }),
        )
    }

    fn should_hold(&self, core: &SequencerCore, message: &SLogMessage, payload: &Bytes) -> bool {
        let future = match &core.current_view {
            Some(view) => message.view_id > view.id(),
            None => true,
        };
        if future {
            self.future_requests.lock().on_hold_request(
                message.view_id,
                SharedLogRequest {
                    message: *message,
                    payload: payload.clone(),
                },
            );
        }
        future
    }

    fn is_stale(&self, core: &SequencerCore, message: &SLogMessage) -> bool {
        match &core.current_view {
            Some(view) if message.view_id < view.id() => {
                warn!(
                    view_id = message.view_id,
                    current_view_id = view.id(),
                    "Dropping outdated message"
                );
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::records::encode_record;
    use crate::log::view::test_view_spec;

    #[derive(Default)]
    struct SinkEvents {
        replicated: Vec<MetaLogs>,
        propagated: Vec<MetaLog>,
        acks: Vec<(NodeId, u32, u32)>,
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<SinkEvents>,
    }

    impl SequencerSink for RecordingSink {
        fn replicate_metalogs(&self, _view: &View, metalogs: &MetaLogs) {
            self.events.lock().replicated.push(metalogs.clone());
        }

        fn propagate_metalogs(&self, _view: &View, metalogs: &[MetaLog]) {
            self.events.lock().propagated.extend_from_slice(metalogs);
        }

        fn send_metalog_progress(
            &self,
            _view: &View,
            primary_sequencer_id: NodeId,
            logspace_id: u32,
            metalog_position: u32,
        ) {
            self.events
                .lock()
                .acks
                .push((primary_sequencer_id, logspace_id, metalog_position));
        }
    }

    fn test_view(id: u16) -> Arc<View> {
        Arc::new(View::new(test_view_spec(id)))
    }

    fn shard_progress_msg(view_id: u16, logspace_id: u32, storage_id: NodeId) -> SLogMessage {
        SLogMessage {
            op: SLogOp::ShardProgress,
            view_id,
            logspace_id,
            origin_node_id: storage_id,
            metalog_position: 0,
        }
    }

    #[test]
    fn test_view_install_creates_logspaces() {
        let sink = Arc::new(RecordingSink::default());
        let sequencer = Sequencer::new(10, sink);
        sequencer.on_view_created(test_view(1));
        assert_eq!(sequencer.current_view_id(), Some(1));
    }

    #[test]
    fn test_shard_progress_then_cut_then_quorum() {
        let sink = Arc::new(RecordingSink::default());
        let sequencer = Sequencer::new(10, sink.clone());
        let view = test_view(1);
        sequencer.on_view_created(view.clone());
        let logspace_id = build_logspace_id(1, 10);

        // Storage 20 reports progress for engines [1, 2]
        let payload = encode_record(&vec![2u32, 1u32]).unwrap();
        sequencer
            .handle_message(shard_progress_msg(1, logspace_id, 20), payload)
            .unwrap();

        sequencer.mark_next_cut_if_doable();
        {
            let events = sink.events.lock();
            assert_eq!(events.replicated.len(), 1);
            // Replicas exist, so nothing propagates before the quorum acks
            assert!(events.propagated.is_empty());
        }

        // Majority acks: replicas are {11, 12}; median of [0, 1] is 1
        sequencer.handle_message(
            SLogMessage {
                op: SLogOp::MetaLogProgress,
                view_id: 1,
                logspace_id,
                origin_node_id: 12,
                metalog_position: 1,
            },
            Bytes::new(),
        )
        .unwrap();

        let events = sink.events.lock();
        assert_eq!(events.propagated.len(), 1);
        assert_eq!(events.propagated[0].metalog_seqnum, 0);
    }

    #[test]
    fn test_duplicate_ack_propagates_once() {
        let sink = Arc::new(RecordingSink::default());
        let sequencer = Sequencer::new(10, sink.clone());
        sequencer.on_view_created(test_view(1));
        let logspace_id = build_logspace_id(1, 10);

        let payload = encode_record(&vec![1u32, 0u32]).unwrap();
        sequencer
            .handle_message(shard_progress_msg(1, logspace_id, 20), payload)
            .unwrap();
        sequencer.mark_next_cut_if_doable();

        let ack = SLogMessage {
            op: SLogOp::MetaLogProgress,
            view_id: 1,
            logspace_id,
            origin_node_id: 12,
            metalog_position: 1,
        };
        sequencer.handle_message(ack, Bytes::new()).unwrap();
        sequencer.handle_message(ack, Bytes::new()).unwrap();

        let events = sink.events.lock();
        assert_eq!(events.propagated.len(), 1);
    }

    #[test]
    fn test_future_view_message_held_and_replayed() {
        let sink = Arc::new(RecordingSink::default());
        let sequencer = Sequencer::new(10, sink);
        sequencer.on_view_created(test_view(1));

        // Message for view 2 before it installs
        let logspace_id = build_logspace_id(2, 10);
        let payload = encode_record(&vec![3u32, 0u32]).unwrap();
        sequencer
            .handle_message(shard_progress_msg(2, logspace_id, 20), payload)
            .unwrap();

        sequencer.on_view_created(test_view(2));
        // The held shard progress applied: a cut is now mintable
        let primary = {
            let core = sequencer.core.read();
            core.current_primary.clone().unwrap()
        };
        assert!(primary.read().metalog_position() == 0);
        sequencer.mark_next_cut_if_doable();
        assert_eq!(primary.read().metalog_position(), 1);
    }

    #[test]
    fn test_stale_message_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let sequencer = Sequencer::new(10, sink);
        sequencer.on_view_created(test_view(1));
        sequencer.on_view_created(test_view(2));

        let logspace_id = build_logspace_id(1, 10);
        let payload = encode_record(&vec![5u32, 0u32]).unwrap();
        // Handled without panic, no effect
        sequencer
            .handle_message(shard_progress_msg(1, logspace_id, 20), payload)
            .unwrap();
    }

    #[test]
    fn test_local_cut_feeds_primary() {
        // Engine-replication wiring: engine 1 doubles as storage for its
        // own shard, reported through a local cut
        let spec = crate::log::view::ViewSpec {
            id: 1,
            engine_nodes: vec![1, 2],
            engine_replicas: 1,
            sequencer_nodes: vec![crate::log::view::SequencerSpec {
                node_id: 10,
                replicas: vec![],
            }],
            storage_nodes: vec![
                crate::log::view::StorageSpec {
                    node_id: 1,
                    source_engines: vec![1, 2],
                },
                crate::log::view::StorageSpec {
                    node_id: 2,
                    source_engines: vec![2, 1],
                },
            ],
        };
        let sink = Arc::new(RecordingSink::default());
        let sequencer = Sequencer::new(10, sink.clone());
        sequencer.on_view_created(Arc::new(View::new(spec)));
        let logspace_id = build_logspace_id(1, 10);

        for node_id in [1u16, 2u16] {
            let cut = LocalCutMsg {
                view_id: 1,
                my_node_id: node_id,
                localid_cuts: vec![3, 3],
            };
            sequencer
                .handle_message(
                    SLogMessage {
                        op: SLogOp::LocalCut,
                        view_id: 1,
                        logspace_id,
                        origin_node_id: node_id,
                        metalog_position: 0,
                    },
                    encode_record(&cut).unwrap(),
                )
                .unwrap();
        }

        sequencer.mark_next_cut_if_doable();
        let events = sink.events.lock();
        // No replicas: the cut replicates trivially and propagates at once
        assert_eq!(events.replicated.len(), 1);
        assert_eq!(events.propagated.len(), 1);
        let new_logs = events.propagated[0].new_logs().unwrap();
        assert_eq!(new_logs.shard_deltas, vec![3, 3]);
    }

    #[test]
    fn test_frozen_view_rejects_cut() {
        let sink = Arc::new(RecordingSink::default());
        let sequencer = Sequencer::new(10, sink.clone());
        sequencer.on_view_created(test_view(1));
        let logspace_id = build_logspace_id(1, 10);
        let payload = encode_record(&vec![1u32, 0u32]).unwrap();
        sequencer
            .handle_message(shard_progress_msg(1, logspace_id, 20), payload)
            .unwrap();

        sequencer.on_view_frozen(1);
        sequencer.mark_next_cut_if_doable();
        assert!(sink.events.lock().replicated.is_empty());
    }
}
