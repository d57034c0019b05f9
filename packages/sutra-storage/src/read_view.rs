/// Immutable read view for zero-contention graph traversal
///
/// Design:
/// - Immutable snapshot (readers never block)
/// - Atomic pointer swap (arc-swap for lock-free publication)
/// - Graph-optimized layout (out-edges co-located with concepts)
/// - Structural sharing between generations via im::HashMap
use crate::types::{current_timestamp_us, AssociationRecord, ConceptId};
use arc_swap::ArcSwap;
use std::sync::Arc;
use sutra_protocol::ConceptMetadata;

/// In-memory concept with co-located out-edges
#[derive(Debug, Clone)]
pub struct ConceptNode {
    pub id: ConceptId,
    pub content: Arc<str>,
    pub embedding: Option<Arc<[f32]>>,
    pub strength: f32,
    pub confidence: f32,
    pub metadata: ConceptMetadata,
    pub created: u64,
    pub last_accessed: u64,

    /// Out-neighbors in first-edge insertion order
    pub neighbors: Vec<ConceptId>,
    /// Out-edges; multi-edge allowed only with distinct assoc_type
    pub edges: Vec<AssociationRecord>,
}

impl ConceptNode {
    pub fn new(
        id: ConceptId,
        content: Arc<str>,
        embedding: Option<Arc<[f32]>>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
        timestamp: u64,
    ) -> Self {
        Self {
            id,
            content,
            embedding,
            strength,
            confidence,
            metadata,
            created: timestamp,
            last_accessed: timestamp,
            neighbors: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Add an out-edge. The same (target, type) pair updates confidence in
    /// place (max); a new pair appends, keeping neighbor insertion order.
    pub fn add_edge(&mut self, record: AssociationRecord) {
        if let Some(existing) = self
            .edges
            .iter_mut()
            .find(|e| e.target_id == record.target_id && e.assoc_type == record.assoc_type)
        {
            existing.confidence = existing.confidence.max(record.confidence);
            return;
        }
        if !self.neighbors.contains(&record.target_id) {
            self.neighbors.push(record.target_id);
        }
        self.edges.push(record);
    }

    /// Merge a duplicate learn of the same concept: strength is monotonically
    /// non-decreasing, confidence is replaced, tags union, attributes merge.
    pub fn merge_learn(
        &mut self,
        strength: f32,
        confidence: f32,
        metadata: &ConceptMetadata,
        timestamp: u64,
    ) {
        self.strength = self.strength.max(strength);
        self.confidence = confidence;
        self.last_accessed = timestamp;
        for tag in &metadata.tags {
            if !self.metadata.tags.contains(tag) {
                self.metadata.tags.push(tag.clone());
            }
        }
        for (k, v) in &metadata.attributes {
            self.metadata
                .attributes
                .insert(k.clone(), v.clone());
        }
        if metadata.organization_id.is_some() {
            self.metadata.organization_id = metadata.organization_id.clone();
        }
        self.metadata.last_accessed = timestamp;
    }

    /// Neighbors paired with the strongest edge confidence toward each
    pub fn neighbors_weighted(&self) -> Vec<(ConceptId, f32)> {
        self.neighbors
            .iter()
            .map(|&target| {
                let confidence = self
                    .edges
                    .iter()
                    .filter(|e| e.target_id == target)
                    .map(|e| e.confidence)
                    .fold(0.0f32, f32::max);
                (target, confidence)
            })
            .collect()
    }
}

/// Immutable graph snapshot
///
/// Built on im::HashMap so cloning a snapshot is cheap (structural sharing)
/// and a published snapshot can never be mutated under a reader.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    /// All concepts indexed by ID (immutable map)
    pub concepts: im::HashMap<ConceptId, ConceptNode>,

    /// Strictly monotonic snapshot version
    pub generation: u64,
    pub timestamp: u64,
    pub concept_count: usize,
    pub edge_count: usize,
}

impl GraphSnapshot {
    pub fn new(generation: u64) -> Self {
        Self {
            concepts: im::HashMap::new(),
            generation,
            timestamp: current_timestamp_us(),
            concept_count: 0,
            edge_count: 0,
        }
    }

    pub fn get_concept(&self, id: &ConceptId) -> Option<&ConceptNode> {
        self.concepts.get(id)
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.concepts.contains_key(id)
    }

    /// Out-neighbors in insertion order
    pub fn get_neighbors(&self, id: &ConceptId) -> Vec<ConceptId> {
        self.concepts
            .get(id)
            .map(|node| node.neighbors.clone())
            .unwrap_or_default()
    }

    pub fn get_neighbors_weighted(&self, id: &ConceptId) -> Vec<(ConceptId, f32)> {
        self.concepts
            .get(id)
            .map(|node| node.neighbors_weighted())
            .unwrap_or_default()
    }

    /// Shortest path from start to end (BFS over out-edges).
    ///
    /// Deterministic: neighbors are expanded in insertion order, so among
    /// equal-length paths the one through the earliest-inserted edges wins.
    pub fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<Vec<ConceptId>> {
        use std::collections::{HashMap, VecDeque};

        if !self.contains(&start) {
            return None;
        }
        if start == end {
            return Some(vec![start]);
        }

        let mut queue = VecDeque::new();
        let mut parent: HashMap<ConceptId, ConceptId> = HashMap::new();

        queue.push_back((start, 0usize));
        parent.insert(start, start);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }

            if let Some(node) = self.concepts.get(&current) {
                for &neighbor in &node.neighbors {
                    if parent.contains_key(&neighbor) {
                        continue;
                    }
                    parent.insert(neighbor, current);

                    if neighbor == end {
                        let mut path = vec![neighbor];
                        let mut cursor = current;
                        while cursor != start {
                            path.push(cursor);
                            cursor = parent[&cursor];
                        }
                        path.push(start);
                        path.reverse();
                        return Some(path);
                    }

                    queue.push_back((neighbor, depth + 1));
                }
            }
        }

        None
    }

    /// Recompute counters after a batch of modifications
    pub fn update_stats(&mut self) {
        self.concept_count = self.concepts.len();
        self.edge_count = self.concepts.values().map(|node| node.edges.len()).sum();
    }
}

/// Read view with atomic snapshot swapping
pub struct ReadView {
    snapshot: ArcSwap<GraphSnapshot>,
}

impl ReadView {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(GraphSnapshot::new(0)),
        }
    }

    pub fn with_initial(snapshot: GraphSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Acquire the current snapshot (one atomic load; held references keep
    /// the old snapshot alive until the last reader drops it)
    pub fn load(&self) -> Arc<GraphSnapshot> {
        self.snapshot.load_full()
    }

    /// Publish a new snapshot (single atomic store)
    pub fn store(&self, new_snapshot: GraphSnapshot) {
        debug_assert!(new_snapshot.generation > self.snapshot.load().generation);
        self.snapshot.store(Arc::new(new_snapshot));
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.load().generation
    }
}

impl Default for ReadView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssociationType;

    fn node(n: u8) -> ConceptNode {
        ConceptNode::new(
            ConceptId([n; 8]),
            Arc::from(format!("concept {}", n)),
            None,
            1.0,
            0.9,
            ConceptMetadata::default(),
            1000,
        )
    }

    fn edge(src: u8, tgt: u8, assoc_type: AssociationType, confidence: f32) -> AssociationRecord {
        AssociationRecord::new(
            ConceptId([src; 8]),
            ConceptId([tgt; 8]),
            assoc_type,
            confidence,
        )
    }

    #[test]
    fn test_add_edge_dedup_by_type() {
        let mut n = node(1);
        n.add_edge(edge(1, 2, AssociationType::Semantic, 0.5));
        n.add_edge(edge(1, 2, AssociationType::Semantic, 0.8));
        n.add_edge(edge(1, 2, AssociationType::Causal, 0.3));

        // Same (target, type) merged to max confidence; distinct type kept
        assert_eq!(n.neighbors.len(), 1);
        assert_eq!(n.edges.len(), 2);
        let confidence = n.edges[0].confidence;
        assert_eq!(confidence, 0.8);
    }

    #[test]
    fn test_merge_learn_strength_monotonic() {
        let mut n = node(1);
        n.merge_learn(0.8, 0.7, &ConceptMetadata::default(), 2000);
        assert_eq!(n.strength, 1.0); // 0.8 < 1.0 keeps the old value
        assert_eq!(n.confidence, 0.7); // confidence replaces

        n.strength = 0.5;
        n.merge_learn(0.8, 0.9, &ConceptMetadata::default(), 3000);
        assert_eq!(n.strength, 0.8);
        assert_eq!(n.last_accessed, 3000);
    }

    #[test]
    fn test_snapshot_lookup() {
        let mut snapshot = GraphSnapshot::new(1);
        snapshot.concepts.insert(ConceptId([1; 8]), node(1));
        snapshot.update_stats();

        assert!(snapshot.contains(&ConceptId([1; 8])));
        assert_eq!(snapshot.concept_count, 1);
        assert_eq!(
            snapshot.get_concept(&ConceptId([1; 8])).unwrap().content.as_ref(),
            "concept 1"
        );
    }

    #[test]
    fn test_read_view_swap_isolation() {
        let view = ReadView::new();
        let old = view.load();
        assert_eq!(old.generation, 0);

        let mut next = GraphSnapshot::new(1);
        next.concepts.insert(ConceptId([1; 8]), node(1));
        next.update_stats();
        view.store(next);

        // New readers see the new snapshot, held references keep the old one
        assert_eq!(view.load().generation, 1);
        assert!(view.load().contains(&ConceptId([1; 8])));
        assert_eq!(old.generation, 0);
        assert!(!old.contains(&ConceptId([1; 8])));
    }

    #[test]
    fn test_find_path_shortest_with_insertion_tiebreak() {
        let mut snapshot = GraphSnapshot::new(1);

        // A→B, B→C, A→D, D→C; both A→B→C and A→D→C have length 2,
        // B was inserted first so the path goes through B.
        let mut a = node(1);
        a.add_edge(edge(1, 2, AssociationType::Causal, 0.8));
        a.add_edge(edge(1, 4, AssociationType::Causal, 0.8));
        let mut b = node(2);
        b.add_edge(edge(2, 3, AssociationType::Causal, 0.8));
        let mut d = node(4);
        d.add_edge(edge(4, 3, AssociationType::Causal, 0.8));

        snapshot.concepts.insert(a.id, a);
        snapshot.concepts.insert(b.id, b);
        snapshot.concepts.insert(node(3).id, node(3));
        snapshot.concepts.insert(d.id, d);

        let path = snapshot
            .find_path(ConceptId([1; 8]), ConceptId([3; 8]), 2)
            .unwrap();
        assert_eq!(
            path,
            vec![ConceptId([1; 8]), ConceptId([2; 8]), ConceptId([3; 8])]
        );
    }

    #[test]
    fn test_find_path_depth_bound() {
        let mut snapshot = GraphSnapshot::new(1);
        let mut a = node(1);
        a.add_edge(edge(1, 2, AssociationType::Semantic, 0.8));
        let mut b = node(2);
        b.add_edge(edge(2, 3, AssociationType::Semantic, 0.8));
        snapshot.concepts.insert(a.id, a);
        snapshot.concepts.insert(b.id, b);
        snapshot.concepts.insert(node(3).id, node(3));

        assert!(snapshot
            .find_path(ConceptId([1; 8]), ConceptId([3; 8]), 1)
            .is_none());
        assert!(snapshot
            .find_path(ConceptId([1; 8]), ConceptId([3; 8]), 2)
            .is_some());
    }

    #[test]
    fn test_find_path_directed() {
        let mut snapshot = GraphSnapshot::new(1);
        let mut a = node(1);
        a.add_edge(edge(1, 2, AssociationType::Semantic, 0.8));
        snapshot.concepts.insert(a.id, a);
        snapshot.concepts.insert(node(2).id, node(2));

        // Edges are directed: 2 → 1 has no path
        assert!(snapshot
            .find_path(ConceptId([2; 8]), ConceptId([1; 8]), 4)
            .is_none());
    }
}
