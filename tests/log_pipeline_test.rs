//! Scenario tests for the shared-log pipeline
//!
//! Wires real `SLogEngineCore`, `Sequencer`, and `LogStorage` instances
//! together and drives view changes, quorum cuts, and future-view holding
//! end to end.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use lumen::log::engine_core::{EngineCoreCallbacks, SLogEngineCore};
use lumen::log::records::{
    encode_record, FsmRecord, FsmRecordKind, FsmRecordsMsg, GlobalCutRecord, LocalCutMsg, MetaLog,
    MetaLogs,
};
use lumen::log::sequencer::{SLogMessage, SLogOp, Sequencer, SequencerSink};
use lumen::log::view::{NodeId, SequencerSpec, StorageSpec, View, ViewSpec};
use lumen::log::{
    build_logspace_id, local_id_to_counter, local_id_to_view_id, seqnum_to_position, EMPTY_TAG,
};

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
        view: &View,
        _primary_sequencer_id: NodeId,
        logspace_id: u32,
        metalog_position: u32,
    ) {
        self.events
            .lock()
            .acks
            .push((view.id(), logspace_id, metalog_position));
    }
}

#[derive(Default)]
struct CoreEvents {
    persisted: Vec<(u64, u64)>,
    discarded: Vec<u64>,
}

fn recording_core(node_id: NodeId) -> (SLogEngineCore, Arc<Mutex<CoreEvents>>) {
    let events = Arc::new(Mutex::new(CoreEvents::default()));
    let persisted = events.clone();
    let discarded = events.clone();
    let callbacks = EngineCoreCallbacks {
        log_persisted: Box::new(move |localid, seqnum| {
            persisted.lock().persisted.push((localid, seqnum));
        }),
        log_discarded: Box::new(move |localid| {
            discarded.lock().discarded.push(localid);
        }),
        send_tag_vec: Box::new(|_, _, _| {}),
    };
    (SLogEngineCore::new(node_id, callbacks), events)
}

/// Two engines backing each other up, doubling as storage of their own
/// and their peer's shard; one sequencer with the given replicas
fn engine_replicated_spec(view_id: u16, replicas: Vec<NodeId>) -> ViewSpec {
    ViewSpec {
        id: view_id,
        engine_nodes: vec![1, 2],
        engine_replicas: 1,
        sequencer_nodes: vec![SequencerSpec {
            node_id: 10,
            replicas,
        }],
        storage_nodes: vec![
            StorageSpec {
                node_id: 1,
                source_engines: vec![1, 2],
            },
            StorageSpec {
                node_id: 2,
                source_engines: vec![2, 1],
            },
        ],
    }
}

fn install_view(core: &mut SLogEngineCore, record_seqnum: u32, spec: ViewSpec) {
    core.on_new_fsm_records_message(FsmRecordsMsg {
        records: vec![FsmRecord {
            seqnum: record_seqnum,
            kind: FsmRecordKind::NewView(spec),
        }],
    });
}

/// Convert a committed NEW_LOGS meta-log into the FSM's global cut record
fn global_cut_from_metalog(record_seqnum: u32, metalog: &MetaLog) -> FsmRecord {
    let new_logs = metalog.new_logs().unwrap();
    let localid_cuts = new_logs
        .shard_starts
        .iter()
        .zip(&new_logs.shard_deltas)
        .map(|(start, delta)| start + delta)
        .collect();
    FsmRecord {
        seqnum: record_seqnum,
        kind: FsmRecordKind::GlobalCut(GlobalCutRecord {
            start_seqnum: new_logs.start_seqnum,
            localid_cuts,
        }),
    }
}

// A view change while entries are pending discards them and resets the
// localid counter.
#[test]
fn view_change_mid_flight_discards_pending() {
    let (mut core, events) = recording_core(1);
    install_view(&mut core, 0, engine_replicated_spec(5, vec![]));

    let first = core
        .store_log_as_primary_node(EMPTY_TAG, Bytes::from_static(b"a"))
        .unwrap();
    let second = core
        .store_log_as_primary_node(EMPTY_TAG, Bytes::from_static(b"b"))
        .unwrap();
    assert_eq!(local_id_to_view_id(first), 5);

    install_view(&mut core, 1, engine_replicated_spec(6, vec![]));

    {
        let events = events.lock();
        assert_eq!(events.discarded, vec![first, second]);
        assert!(events.persisted.is_empty());
    }
    // next_localid restarted at 0 in the new view
    let restarted = core
        .store_log_as_primary_node(EMPTY_TAG, Bytes::from_static(b"c"))
        .unwrap();
    assert_eq!(local_id_to_view_id(restarted), 6);
    assert_eq!(local_id_to_counter(restarted), 0);
}

// Replica acks {10, 12, 15} give a replicated position of 12; moving one
// replica to 13 moves it to 13.
#[test]
fn replica_ack_median_with_lagging_minority() {
    use lumen::log::log_space::MetaLogPrimary;

    let view = Arc::new(View::new(engine_replicated_spec(1, vec![11, 12, 13])));
    let mut primary = MetaLogPrimary::new(view, 10);
    for i in 1..=15u32 {
        primary.update_storage_progress(1, &[i, 0]);
        primary.update_storage_progress(2, &[0, i]);
        primary.mark_next_cut().unwrap();
    }
    assert_eq!(primary.metalog_position(), 15);

    primary.update_replica_progress(11, 10);
    primary.update_replica_progress(12, 12);
    primary.update_replica_progress(13, 15);
    assert_eq!(primary.replicated_metalog_position(), 12);

    primary.update_replica_progress(11, 13);
    assert_eq!(primary.replicated_metalog_position(), 13);
    // The newly committed range is exactly (12, 13]
    let committed = primary.get_metalogs(12, 13).unwrap();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].metalog_seqnum, 12);
}

// Every committed meta-log leaves the sequencer exactly once, in meta-log
// order, and only after the quorum acks it.
#[test]
fn quorum_cut_propagates_exactly_once() {
    let sink = Arc::new(RecordingSink::default());
    let sequencer = Sequencer::new(10, sink.clone());
    let view = Arc::new(View::new(engine_replicated_spec(1, vec![11, 12])));
    sequencer.on_view_created(view);
    let logspace_id = build_logspace_id(1, 10);

    let ack = |replica: NodeId, position: u32| SLogMessage {
        op: SLogOp::MetaLogProgress,
        view_id: 1,
        logspace_id,
        origin_node_id: replica,
        metalog_position: position,
    };

    // Mint 15 cuts; each needs the previous one fully replicated, so a
    // replica acks after every mint (with two replicas, one ack plus the
    // primary is a majority)
    for i in 1..=15u32 {
        let cut = LocalCutMsg {
            view_id: 1,
            my_node_id: 1,
            localid_cuts: vec![i, 0],
        };
        sequencer
            .handle_message(
                SLogMessage {
                    op: SLogOp::LocalCut,
                    view_id: 1,
                    logspace_id,
                    origin_node_id: 1,
                    metalog_position: 0,
                },
                encode_record(&cut).unwrap(),
            )
            .unwrap();
        // Engine 1's shard is also persisted by node 2; its cut carries
        // the backup progress
        let peer = LocalCutMsg {
            view_id: 1,
            my_node_id: 2,
            localid_cuts: vec![0, i],
        };
        sequencer
            .handle_message(
                SLogMessage {
                    op: SLogOp::LocalCut,
                    view_id: 1,
                    logspace_id,
                    origin_node_id: 2,
                    metalog_position: 0,
                },
                encode_record(&peer).unwrap(),
            )
            .unwrap();
        sequencer.mark_next_cut_if_doable();
        assert_eq!(sink.events.lock().replicated.len() as u32, i);
        assert_eq!(sink.events.lock().propagated.len() as u32, i - 1);

        sequencer.handle_message(ack(11, i), Bytes::new()).unwrap();
        // A duplicate ack must not re-propagate anything
        sequencer.handle_message(ack(11, i), Bytes::new()).unwrap();
        assert_eq!(sink.events.lock().propagated.len() as u32, i);
    }

    let events = sink.events.lock();
    let positions: Vec<u32> = events
        .propagated
        .iter()
        .map(|metalog| metalog.metalog_seqnum)
        .collect();
    let expected: Vec<u32> = (0..15).collect();
    assert_eq!(positions, expected);
}

// A message for view 2 arriving while the sequencer is at view 1 is held,
// replayed after the view installs, and the acknowledgment carries the new
// view.
#[test]
fn future_view_metalogs_held_then_acked() {
    let sink = Arc::new(RecordingSink::default());
    // Node 11 is a replica of sequencer 10 in this view
    let sequencer = Sequencer::new(11, sink.clone());
    sequencer.on_view_created(Arc::new(View::new(ViewSpec {
        id: 1,
        engine_nodes: vec![1],
        engine_replicas: 0,
        sequencer_nodes: vec![
            SequencerSpec {
                node_id: 10,
                replicas: vec![11],
            },
            SequencerSpec {
                node_id: 11,
                replicas: vec![10],
            },
        ],
        storage_nodes: vec![StorageSpec {
            node_id: 20,
            source_engines: vec![1],
        }],
    })));

    let next_logspace = build_logspace_id(2, 10);
    let metalogs = MetaLogs {
        logspace_id: next_logspace,
        metalogs: vec![MetaLog {
            logspace_id: next_logspace,
            metalog_seqnum: 0,
            kind: lumen::log::records::MetaLogKind::ViewChange,
        }],
    };
    sequencer
        .handle_message(
            SLogMessage {
                op: SLogOp::MetaLogs,
                view_id: 2,
                logspace_id: next_logspace,
                origin_node_id: 10,
                metalog_position: 0,
            },
            encode_record(&metalogs).unwrap(),
        )
        .unwrap();
    // Held: nothing acked yet
    assert!(sink.events.lock().acks.is_empty());

    sequencer.on_view_created(Arc::new(View::new(ViewSpec {
        id: 2,
        engine_nodes: vec![1],
        engine_replicas: 0,
        sequencer_nodes: vec![
            SequencerSpec {
                node_id: 10,
                replicas: vec![11],
            },
            SequencerSpec {
                node_id: 11,
                replicas: vec![10],
            },
        ],
        storage_nodes: vec![StorageSpec {
            node_id: 20,
            source_engines: vec![1],
        }],
    })));

    let events = sink.events.lock();
    assert_eq!(events.acks.len(), 1);
    let (ack_view, ack_logspace, ack_position) = events.acks[0];
    assert_eq!(ack_view, 2);
    assert_eq!(ack_logspace, next_logspace);
    assert_eq!(ack_position, 1);
}

// Full pipeline: appends on two engines flow through local cuts, a global
// cut, and FSM records back into both engine cores with dense seqnums.
#[test]
fn appends_reach_global_order_through_the_pipeline() {
    let spec = engine_replicated_spec(1, vec![]);
    let (mut primary_core, primary_events) = recording_core(1);
    let (mut backup_core, _backup_events) = recording_core(2);
    install_view(&mut primary_core, 0, spec.clone());
    install_view(&mut backup_core, 0, spec.clone());

    // Engine 1 appends two entries; engine 2 stores them as backup
    let mut localids = Vec::new();
    for payload in [&b"first"[..], &b"second"[..]] {
        let localid = primary_core
            .store_log_as_primary_node(EMPTY_TAG, Bytes::copy_from_slice(payload))
            .unwrap();
        assert!(backup_core.store_log_as_backup_node(
            EMPTY_TAG,
            Bytes::copy_from_slice(payload),
            localid
        ));
        localids.push(localid);
    }

    // Local cuts: engine 1 reports its own appends, engine 2 reports its
    // backup progress for engine 1
    let cut_1 = primary_core.build_local_cut_message().unwrap();
    assert_eq!(cut_1.localid_cuts, vec![2, 0]);
    let cut_2 = backup_core.build_local_cut_message().unwrap();
    assert_eq!(cut_2.localid_cuts, vec![0, 2]);

    let sink = Arc::new(RecordingSink::default());
    let sequencer = Sequencer::new(10, sink.clone());
    sequencer.on_view_created(Arc::new(View::new(spec)));
    let logspace_id = build_logspace_id(1, 10);
    for cut in [cut_1, cut_2] {
        let origin = cut.my_node_id;
        sequencer
            .handle_message(
                SLogMessage {
                    op: SLogOp::LocalCut,
                    view_id: 1,
                    logspace_id,
                    origin_node_id: origin,
                    metalog_position: 0,
                },
                encode_record(&cut).unwrap(),
            )
            .unwrap();
    }
    sequencer.mark_next_cut_if_doable();

    let propagated = sink.events.lock().propagated.clone();
    assert_eq!(propagated.len(), 1);
    let record = global_cut_from_metalog(1, &propagated[0]);
    primary_core.on_new_fsm_records_message(FsmRecordsMsg {
        records: vec![record.clone()],
    });
    backup_core.on_new_fsm_records_message(FsmRecordsMsg {
        records: vec![record],
    });

    let events = primary_events.lock();
    assert_eq!(events.persisted.len(), 2);
    let positions: Vec<u32> = events
        .persisted
        .iter()
        .map(|&(_, seqnum)| seqnum_to_position(seqnum))
        .collect();
    assert_eq!(positions, vec![0, 1]);
    assert_eq!(
        events.persisted[0].0,
        localids[0],
        "first append gets the first seqnum"
    );
    assert!(primary_core
        .persisted_entry(events.persisted[0].1)
        .is_some());
    assert!(backup_core
        .persisted_entry(events.persisted[0].1)
        .is_some());
}
