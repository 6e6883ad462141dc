//! Views: immutable cluster membership snapshots
//!
//! A view fixes, for its lifetime, the set of engine nodes, the set of
//! sequencer nodes with their replica relations, and the set of storage
//! nodes with their source-engine relations. Views are installed by the
//! coordination service through the FSM and are never mutated; a view is
//! only superseded by one with a larger id.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Tag;

/// Node identifier within a cluster
pub type NodeId = u16;

/// Declarative description of a view, as delivered by the coordination
/// service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewSpec {
    pub id: u16,
    /// Engine node ids; order on the wire is irrelevant, iteration is
    /// always over the canonical (sorted) order
    pub engine_nodes: Vec<NodeId>,
    /// How many backup engine nodes hold each engine's entries
    pub engine_replicas: usize,
    pub sequencer_nodes: Vec<SequencerSpec>,
    pub storage_nodes: Vec<StorageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequencerSpec {
    pub node_id: NodeId,
    /// Sequencers replicating this sequencer's meta-log
    pub replicas: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageSpec {
    pub node_id: NodeId,
    /// Engines whose shards this storage node persists, canonical order
    pub source_engines: Vec<NodeId>,
}

/// A sequencer node's relations within a view
#[derive(Debug, Clone)]
pub struct SequencerNode {
    pub node_id: NodeId,
    pub replicas: Vec<NodeId>,
}

impl SequencerNode {
    pub fn is_replica_sequencer_node(&self, node_id: NodeId) -> bool {
        self.replicas.contains(&node_id)
    }
}

/// A storage node's relations within a view
#[derive(Debug, Clone)]
pub struct StorageNode {
    pub node_id: NodeId,
    pub source_engines: Vec<NodeId>,
}

impl StorageNode {
    pub fn is_source_engine_node(&self, node_id: NodeId) -> bool {
        self.source_engines.contains(&node_id)
    }
}

/// An engine node's relations within a view
#[derive(Debug, Clone)]
pub struct EngineNode {
    pub node_id: NodeId,
    /// Engines holding backup copies of this node's entries
    pub backup_nodes: Vec<NodeId>,
    /// Storage nodes persisting this engine's shard
    pub storage_nodes: Vec<NodeId>,
}

/// An immutable membership snapshot
#[derive(Debug, Clone)]
pub struct View {
    id: u16,
    engine_node_ids: Vec<NodeId>,
    engine_nodes: HashMap<NodeId, EngineNode>,
    sequencer_node_ids: Vec<NodeId>,
    sequencer_nodes: HashMap<NodeId, SequencerNode>,
    storage_node_ids: Vec<NodeId>,
    storage_nodes: HashMap<NodeId, StorageNode>,
}

impl View {
    pub fn new(spec: ViewSpec) -> Self {
        let mut engine_node_ids = spec.engine_nodes.clone();
        engine_node_ids.sort_unstable();
        engine_node_ids.dedup();

        // Backups are the nodes following each engine on the sorted ring
        let mut engine_nodes = HashMap::new();
        let n = engine_node_ids.len();
        let backup_count = spec.engine_replicas.min(n.saturating_sub(1));
        for (idx, &node_id) in engine_node_ids.iter().enumerate() {
            let backup_nodes = (1..=backup_count)
                .map(|step| engine_node_ids[(idx + step) % n])
                .collect();
            engine_nodes.insert(
                node_id,
                EngineNode {
                    node_id,
                    backup_nodes,
                    storage_nodes: Vec::new(),
                },
            );
        }

        let mut storage_node_ids = Vec::new();
        let mut storage_nodes = HashMap::new();
        for storage in &spec.storage_nodes {
            storage_node_ids.push(storage.node_id);
            for &engine_id in &storage.source_engines {
                if let Some(engine) = engine_nodes.get_mut(&engine_id) {
                    engine.storage_nodes.push(storage.node_id);
                }
            }
            storage_nodes.insert(
                storage.node_id,
                StorageNode {
                    node_id: storage.node_id,
                    source_engines: storage.source_engines.clone(),
                },
            );
        }
        storage_node_ids.sort_unstable();
        for engine in engine_nodes.values_mut() {
            engine.storage_nodes.sort_unstable();
        }

        let mut sequencer_node_ids = Vec::new();
        let mut sequencer_nodes = HashMap::new();
        for sequencer in &spec.sequencer_nodes {
            sequencer_node_ids.push(sequencer.node_id);
            sequencer_nodes.insert(
                sequencer.node_id,
                SequencerNode {
                    node_id: sequencer.node_id,
                    replicas: sequencer.replicas.clone(),
                },
            );
        }
        sequencer_node_ids.sort_unstable();

        Self {
            id: spec.id,
            engine_node_ids,
            engine_nodes,
            sequencer_node_ids,
            sequencer_nodes,
            storage_node_ids,
            storage_nodes,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Engine node ids in canonical (sorted) order; cut records index
    /// engines in exactly this order
    pub fn engine_node_ids(&self) -> &[NodeId] {
        &self.engine_node_ids
    }

    pub fn sequencer_node_ids(&self) -> &[NodeId] {
        &self.sequencer_node_ids
    }

    pub fn storage_node_ids(&self) -> &[NodeId] {
        &self.storage_node_ids
    }

    pub fn contains_engine_node(&self, node_id: NodeId) -> bool {
        self.engine_nodes.contains_key(&node_id)
    }

    pub fn contains_sequencer_node(&self, node_id: NodeId) -> bool {
        self.sequencer_nodes.contains_key(&node_id)
    }

    pub fn contains_storage_node(&self, node_id: NodeId) -> bool {
        self.storage_nodes.contains_key(&node_id)
    }

    pub fn engine_node(&self, node_id: NodeId) -> Option<&EngineNode> {
        self.engine_nodes.get(&node_id)
    }

    pub fn sequencer_node(&self, node_id: NodeId) -> Option<&SequencerNode> {
        self.sequencer_nodes.get(&node_id)
    }

    pub fn storage_node(&self, node_id: NodeId) -> Option<&StorageNode> {
        self.storage_nodes.get(&node_id)
    }

    /// The engine node that primaries `tag`: deterministic hash of the tag
    /// mod the engine cohort, identical on every observer
    pub fn log_tag_to_primary_node(&self, tag: Tag) -> NodeId {
        assert!(!self.engine_node_ids.is_empty(), "view has no engine nodes");
        let idx = mix64(tag) % self.engine_node_ids.len() as u64;
        self.engine_node_ids[idx as usize]
    }

    /// A uniformly random engine node, for untagged appends from nodes
    /// outside the view
    pub fn pick_one_node(&self) -> NodeId {
        assert!(!self.engine_node_ids.is_empty(), "view has no engine nodes");
        let idx = rand::thread_rng().gen_range(0..self.engine_node_ids.len());
        self.engine_node_ids[idx]
    }

    /// The engines whose backup cohort includes `node_id`, in canonical
    /// order. A node's local cut reports its progress for exactly these
    /// peers.
    pub fn primary_nodes_backed_by(&self, node_id: NodeId) -> Vec<NodeId> {
        self.engine_node_ids
            .iter()
            .copied()
            .filter(|&primary| {
                primary != node_id
                    && self.engine_nodes[&primary].backup_nodes.contains(&node_id)
            })
            .collect()
    }
}

/// A small three-engine, two-sequencer, two-storage view used across the
/// crate's tests.
#[cfg(test)]
pub(crate) fn test_view_spec(id: u16) -> ViewSpec {
    ViewSpec {
        id,
        engine_nodes: vec![3, 1, 2],
        engine_replicas: 1,
        sequencer_nodes: vec![
            SequencerSpec {
                node_id: 10,
                replicas: vec![11, 12],
            },
            SequencerSpec {
                node_id: 11,
                replicas: vec![10, 12],
            },
        ],
        storage_nodes: vec![
            StorageSpec {
                node_id: 20,
                source_engines: vec![1, 2],
            },
            StorageSpec {
                node_id: 21,
                source_engines: vec![3],
            },
        ],
    }
}

/// SplitMix64 finalizer; a stable mix so all nodes agree on tag placement
fn mix64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e37_79b9_7f4a_7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    value ^ (value >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_ids_canonical_order() {
        let view = View::new(test_view_spec(1));
        assert_eq!(view.engine_node_ids(), &[1, 2, 3]);
    }

    #[test]
    fn test_backup_cohort_on_sorted_ring() {
        let view = View::new(test_view_spec(1));
        assert_eq!(view.engine_node(1).unwrap().backup_nodes, vec![2]);
        assert_eq!(view.engine_node(2).unwrap().backup_nodes, vec![3]);
        assert_eq!(view.engine_node(3).unwrap().backup_nodes, vec![1]);
    }

    #[test]
    fn test_primary_nodes_backed_by_inverts_backups() {
        let view = View::new(test_view_spec(1));
        assert_eq!(view.primary_nodes_backed_by(2), vec![1]);
        assert_eq!(view.primary_nodes_backed_by(1), vec![3]);
        assert!(view.primary_nodes_backed_by(99).is_empty());
    }

    #[test]
    fn test_storage_relations_inverted_to_engines() {
        let view = View::new(test_view_spec(1));
        assert_eq!(view.engine_node(1).unwrap().storage_nodes, vec![20]);
        assert_eq!(view.engine_node(3).unwrap().storage_nodes, vec![21]);
        assert!(view
            .storage_node(20)
            .unwrap()
            .is_source_engine_node(2));
    }

    #[test]
    fn test_tag_to_primary_is_deterministic() {
        let view = View::new(test_view_spec(1));
        let other = View::new(test_view_spec(1));
        for tag in 1..100u64 {
            assert_eq!(
                view.log_tag_to_primary_node(tag),
                other.log_tag_to_primary_node(tag)
            );
            assert!(view.contains_engine_node(view.log_tag_to_primary_node(tag)));
        }
    }

    #[test]
    fn test_sequencer_replica_relation() {
        let view = View::new(test_view_spec(1));
        let seq = view.sequencer_node(10).unwrap();
        assert!(seq.is_replica_sequencer_node(11));
        assert!(!seq.is_replica_sequencer_node(10));
    }

    #[test]
    fn test_replicas_clamped_to_cohort() {
        let spec = ViewSpec {
            id: 1,
            engine_nodes: vec![1],
            engine_replicas: 3,
            sequencer_nodes: vec![],
            storage_nodes: vec![],
        };
        let view = View::new(spec);
        assert!(view.engine_node(1).unwrap().backup_nodes.is_empty());
    }
}
