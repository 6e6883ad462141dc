//! Tag index: answers tag → seqnum queries
//!
//! Primaries forward the tag vector of every replicated batch
//! (`primary_node_id`, `start_seqnum`, tags). Batches stay pending until a
//! global cut commits the seqnum range they occupy; only committed entries
//! are queryable, so readers never observe an entry ahead of the total
//! order.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use super::Tag;

/// A received but not yet committed tag batch
#[derive(Debug)]
struct PendingBatch {
    primary_node_id: u16,
    tags: Vec<Tag>,
}

/// Index from tag to the committed seqnums carrying it
pub struct TagIndex {
    current_view_id: u16,
    /// FSM record seqnum of the last applied view install or global cut
    fsm_progress: u32,
    /// Seqnums below this are committed
    committed_seqnum: u64,
    pending_batches: BTreeMap<u64, PendingBatch>,
    /// Committed seqnums per tag, ascending
    committed: HashMap<Tag, Vec<u64>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self {
            current_view_id: 0,
            fsm_progress: 0,
            committed_seqnum: 0,
            pending_batches: BTreeMap::new(),
            committed: HashMap::new(),
        }
    }

    /// FSM progress as observed by the index
    pub fn fsm_progress(&self) -> u32 {
        self.fsm_progress
    }

    /// Ingest the tag vector of a replicated batch
    pub fn recv_tag_data(&mut self, primary_node_id: u16, start_seqnum: u64, tags: &[Tag]) {
        if tags.is_empty() {
            return;
        }
        if start_seqnum < self.committed_seqnum {
            warn!(
                primary_node_id,
                start_seqnum, "Tag data below committed position; dropping"
            );
            return;
        }
        self.pending_batches.insert(
            start_seqnum,
            PendingBatch {
                primary_node_id,
                tags: tags.to_vec(),
            },
        );
    }

    /// A new view installed: pending batches of the old view can never
    /// commit and are discarded.
    pub fn on_new_view(&mut self, record_seqnum: u32, view_id: u16) {
        if !self.pending_batches.is_empty() {
            debug!(
                view_id,
                discarded = self.pending_batches.len(),
                "Discarding pending tag batches on view change"
            );
            self.pending_batches.clear();
        }
        self.current_view_id = view_id;
        self.fsm_progress = record_seqnum;
    }

    /// A global cut committed `[start_seqnum, end_seqnum)`
    pub fn on_new_global_cut(&mut self, record_seqnum: u32, start_seqnum: u64, end_seqnum: u64) {
        self.fsm_progress = record_seqnum;
        debug_assert!(start_seqnum >= self.committed_seqnum);
        let mut split: Vec<(u64, PendingBatch)> = Vec::new();
        let committed_starts: Vec<u64> = self
            .pending_batches
            .range(..end_seqnum)
            .map(|(&start, _)| start)
            .collect();
        for batch_start in committed_starts {
            let batch = match self.pending_batches.remove(&batch_start) {
                Some(batch) => batch,
                None => continue,
            };
            for (offset, &tag) in batch.tags.iter().enumerate() {
                let seqnum = batch_start + offset as u64;
                if seqnum >= end_seqnum {
                    // The cut split this batch: the tail stays pending
                    split.push((
                        seqnum,
                        PendingBatch {
                            primary_node_id: batch.primary_node_id,
                            tags: batch.tags[offset..].to_vec(),
                        },
                    ));
                    break;
                }
                if tag != super::EMPTY_TAG {
                    self.committed.entry(tag).or_default().push(seqnum);
                }
            }
        }
        for (start, batch) in split {
            self.pending_batches.insert(start, batch);
        }
        if end_seqnum > self.committed_seqnum {
            self.committed_seqnum = end_seqnum;
        }
    }

    /// First committed seqnum carrying `tag` at or after `start_seqnum`
    pub fn find_first(&self, tag: Tag, start_seqnum: u64) -> Option<u64> {
        let seqnums = self.committed.get(&tag)?;
        let idx = seqnums.partition_point(|&s| s < start_seqnum);
        seqnums.get(idx).copied()
    }

    /// Last committed seqnum carrying `tag` strictly below `end_seqnum`
    pub fn find_last(&self, tag: Tag, end_seqnum: u64) -> Option<u64> {
        let seqnums = self.committed.get(&tag)?;
        let idx = seqnums.partition_point(|&s| s < end_seqnum);
        idx.checked_sub(1).map(|i| seqnums[i])
    }

    /// Debug dump of the index state
    pub fn state_check(&self) -> String {
        format!(
            "TagIndex: view={} progress={} committed_seqnum={:#018x} pending_batches={} tags={}\n",
            self.current_view_id,
            self.fsm_progress,
            self.committed_seqnum,
            self.pending_batches.len(),
            self.committed.len()
        )
    }
}

impl Default for TagIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_query_only_after_commit() {
        let mut index = TagIndex::new();
        index.recv_tag_data(1, 100, &[7, 0, 7]);
        assert_eq!(index.find_first(7, 0), None);

        index.on_new_global_cut(1, 100, 103);
        assert_eq!(index.find_first(7, 0), Some(100));
        assert_eq!(index.find_first(7, 101), Some(102));
        assert_eq!(index.find_first(7, 103), None);
    }

    #[test]
    fn test_empty_tag_not_indexed() {
        let mut index = TagIndex::new();
        index.recv_tag_data(1, 10, &[0, 0]);
        index.on_new_global_cut(1, 10, 12);
        assert_eq!(index.find_first(0, 0), None);
    }

    #[test]
    fn test_partial_commit_of_batch() {
        let mut index = TagIndex::new();
        index.recv_tag_data(2, 0, &[5, 5, 5, 5]);
        // Cut only covers the first two entries
        index.on_new_global_cut(1, 0, 2);
        assert_eq!(index.find_last(5, u64::MAX), Some(1));
    }

    #[test]
    fn test_view_change_discards_pending() {
        let mut index = TagIndex::new();
        index.recv_tag_data(1, 50, &[9]);
        index.on_new_view(3, 2);
        index.on_new_global_cut(4, 50, 51);
        assert_eq!(index.find_first(9, 0), None);
        assert_eq!(index.fsm_progress(), 4);
    }

    #[test]
    fn test_find_last() {
        let mut index = TagIndex::new();
        index.recv_tag_data(1, 0, &[4, 4]);
        index.on_new_global_cut(1, 0, 2);
        assert_eq!(index.find_last(4, 1), Some(0));
        assert_eq!(index.find_last(4, 0), None);
    }
}
