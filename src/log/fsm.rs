//! The view-driven finite state machine
//!
//! Engines learn everything about global ordering from the FSM record
//! stream broadcast by sequencers: view installs and committed global cuts.
//! Records carry their own sequence numbers; the FSM applies them strictly
//! in order, buffering records that arrive early and dropping duplicates.
//!
//! Applying a record produces [`FsmEvent`]s for the embedder to handle.
//! Events are returned rather than delivered through registered callbacks
//! so that the consumer can react with full `&mut self` access and no
//! reentrancy hazards.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::records::{FsmRecord, FsmRecordKind, FsmRecordsMsg, GlobalCutRecord};
use super::view::{View, ViewSpec};
use super::build_local_id;

/// What applying FSM records produced, in delivery order
#[derive(Debug, Clone)]
pub enum FsmEvent {
    NewView {
        record_seqnum: u32,
        view: Arc<View>,
    },
    /// A contiguous batch of one engine's entries got global sequence
    /// numbers assigned
    LogReplicated {
        start_localid: u64,
        start_seqnum: u64,
        delta: u32,
    },
    GlobalCut {
        record_seqnum: u32,
        start_seqnum: u64,
        end_seqnum: u64,
    },
}

/// Ordered sequence of views plus cut bookkeeping
pub struct Fsm {
    current_view: Option<Arc<View>>,
    /// Next record seqnum to apply
    next_record_seqnum: u32,
    held_records: BTreeMap<u32, FsmRecord>,
    /// Per engine (canonical order), the shard position at the last
    /// applied cut of the current view
    cut_positions: Vec<u32>,
}

impl Fsm {
    pub fn new() -> Self {
        Self {
            current_view: None,
            next_record_seqnum: 0,
            held_records: BTreeMap::new(),
            cut_positions: Vec::new(),
        }
    }

    pub fn current_view(&self) -> Option<&Arc<View>> {
        self.current_view.as_ref()
    }

    /// Number of FSM records applied so far
    pub fn progress(&self) -> u32 {
        self.next_record_seqnum
    }

    /// Consume one record; returns the events of every record that became
    /// applicable (the record itself plus any held successors).
    pub fn on_recv_record(&mut self, record: FsmRecord) -> Vec<FsmEvent> {
        let mut events = Vec::new();
        if record.seqnum < self.next_record_seqnum {
            debug!(
                record_seqnum = record.seqnum,
                progress = self.next_record_seqnum,
                "Dropping duplicate FSM record"
            );
            return events;
        }
        self.held_records.insert(record.seqnum, record);
        while let Some(record) = self.held_records.remove(&self.next_record_seqnum) {
            self.next_record_seqnum += 1;
            self.apply(record, &mut events);
        }
        events
    }

    /// Consume a batched records message
    pub fn on_recv_records_msg(&mut self, message: FsmRecordsMsg) -> Vec<FsmEvent> {
        let mut events = Vec::new();
        for record in message.records {
            events.extend(self.on_recv_record(record));
        }
        events
    }

    fn apply(&mut self, record: FsmRecord, events: &mut Vec<FsmEvent>) {
        match record.kind {
            FsmRecordKind::NewView(spec) => self.apply_new_view(record.seqnum, spec, events),
            FsmRecordKind::GlobalCut(cut) => self.apply_global_cut(record.seqnum, cut, events),
        }
    }

    fn apply_new_view(&mut self, record_seqnum: u32, spec: ViewSpec, events: &mut Vec<FsmEvent>) {
        if let Some(current) = &self.current_view {
            if spec.id <= current.id() {
                warn!(
                    view_id = spec.id,
                    current_view_id = current.id(),
                    "Dropping non-monotone view install"
                );
                return;
            }
        }
        let view = Arc::new(View::new(spec));
        self.cut_positions = vec![0; view.engine_node_ids().len()];
        self.current_view = Some(view.clone());
        events.push(FsmEvent::NewView {
            record_seqnum,
            view,
        });
    }

    fn apply_global_cut(
        &mut self,
        record_seqnum: u32,
        cut: GlobalCutRecord,
        events: &mut Vec<FsmEvent>,
    ) {
        let view = match &self.current_view {
            Some(view) => view.clone(),
            None => {
                warn!(record_seqnum, "Global cut before any view; dropping");
                return;
            }
        };
        let engine_ids = view.engine_node_ids();
        assert_eq!(
            cut.localid_cuts.len(),
            engine_ids.len(),
            "global cut width does not match the view's engine cohort"
        );

        let start_seqnum = cut.start_seqnum;
        let mut next_seqnum = start_seqnum;
        for (idx, &engine_id) in engine_ids.iter().enumerate() {
            let previous = self.cut_positions[idx];
            let current = cut.localid_cuts[idx];
            assert!(
                current >= previous,
                "global cut regressed shard position for engine {engine_id}"
            );
            let delta = current - previous;
            if delta > 0 {
                events.push(FsmEvent::LogReplicated {
                    start_localid: build_local_id(view.id(), engine_id, previous),
                    start_seqnum: next_seqnum,
                    delta,
                });
                next_seqnum += u64::from(delta);
                self.cut_positions[idx] = current;
            }
        }
        events.push(FsmEvent::GlobalCut {
            record_seqnum,
            start_seqnum,
            end_seqnum: next_seqnum,
        });
    }

    /// Debug dump of the FSM state
    pub fn state_check(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        match &self.current_view {
            Some(view) => {
                let _ = writeln!(out, "CurrentView: {}", view.id());
            }
            None => {
                let _ = writeln!(out, "CurrentView: none");
            }
        }
        let _ = writeln!(out, "FsmProgress: {}", self.next_record_seqnum);
        if !self.held_records.is_empty() {
            let _ = writeln!(out, "HeldRecords: {}", self.held_records.len());
        }
        for (idx, position) in self.cut_positions.iter().enumerate() {
            let _ = writeln!(out, "CutPosition[{idx}]={:#010x}", position);
        }
        out
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}
