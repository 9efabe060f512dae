//! Vertex- and edge-weighted multigraph projection of a tensor network.
//! Vertices are input tensors, edges are contracted dimensions, and open
//! dimensions are absorbed into the owning vertex's weight. All weights are
//! stored as `floor(log2(volume)) + 1` so that merge arithmetic stays within
//! machine integers while preserving the ordering of volumes.

use rustc_hash::FxHashMap;

use crate::tensornetwork::TensorNetwork;
use crate::types::{TensorId, VertexId};

/// Log-encoded weight of a volume: `floor(log2(volume)) + 1`.
pub(crate) fn log_weight(volume: u64) -> u64 {
    debug_assert!(volume > 0);
    (63 - volume.leading_zeros() as u64) + 1
}

/// Volume represented by a log-encoded weight.
pub(crate) fn weight_volume(weight: u64) -> f64 {
    2f64.powi(weight as i32 - 1)
}

/// Cost and volume estimates for one candidate pairwise contraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContractionCost {
    /// Fused multiply-add flop estimate `sqrt(vol(L)*vol(R)*vol(D))`.
    pub flops: f64,
    /// Volume of the produced intermediate.
    pub intermediate_volume: f64,
    /// Intermediate volume minus the input volumes.
    pub differential_volume: f64,
}

/// CSR-stored weighted multigraph. Mutation is concentrated in
/// [`WeightedGraph::merge_vertices`], the planner's one structural operation.
#[derive(Debug, Clone, Default)]
pub struct WeightedGraph {
    /// Per-vertex adjacency offsets into `adjncy`/`adjwgt` (length
    /// `num_vertices + 1`).
    xadj: Vec<usize>,
    /// Adjacent vertex ids, sorted within each vertex.
    adjncy: Vec<VertexId>,
    /// Log-encoded edge weights, parallel to `adjncy`.
    adjwgt: Vec<u64>,
    /// Log-encoded open volume per vertex.
    vwgt: Vec<u64>,
    /// Vertex id -> original tensor id in the source network.
    renumber: Vec<TensorId>,
    /// K-way partition assignment, invalidated by any mutation.
    partitions: Option<Vec<usize>>,
}

impl WeightedGraph {
    pub fn new() -> Self {
        Self {
            xadj: vec![0],
            ..Self::default()
        }
    }

    /// Projects a finalized tensor network onto the weighted graph. Input
    /// tensors become vertices 0..N-1 in id order; connections to the output
    /// tensor are absorbed into vertex weights.
    pub fn from_network(network: &TensorNetwork) -> Self {
        assert!(network.is_finalized());
        let mut graph = Self::new();
        let mut id_map: FxHashMap<TensorId, VertexId> = FxHashMap::default();
        for (vertex, conn) in network.inputs().enumerate() {
            graph.renumber.push(conn.id());
            id_map.insert(conn.id(), vertex);
        }
        for conn in network.inputs() {
            // Aggregate the volume shared with each adjacent tensor.
            let mut open_volume: u64 = 1;
            let mut shared: FxHashMap<VertexId, u64> = FxHashMap::default();
            for (dim, leg) in conn.legs().iter().enumerate() {
                let extent = conn.dim_extent(dim as u32);
                if leg.peer_id() == 0 {
                    open_volume = open_volume.saturating_mul(extent);
                } else {
                    let peer = id_map[&leg.peer_id()];
                    shared
                        .entry(peer)
                        .and_modify(|v| *v = v.saturating_mul(extent))
                        .or_insert(extent);
                }
            }
            let mut edges: Vec<(VertexId, u64)> = shared
                .into_iter()
                .map(|(peer, volume)| (peer, log_weight(volume)))
                .collect();
            edges.sort_unstable();
            graph.append_vertex(&edges, log_weight(open_volume));
        }
        graph
    }

    pub fn num_vertices(&self) -> usize {
        self.vwgt.len()
    }

    pub fn num_edge_slots(&self) -> usize {
        self.adjncy.len()
    }

    /// Appends a vertex given its `(adjacent vertex, log edge weight)` list
    /// and log-encoded open volume.
    pub fn append_vertex(&mut self, edges: &[(VertexId, u64)], vertex_weight: u64) {
        self.partitions = None;
        for &(peer, weight) in edges {
            self.adjncy.push(peer);
            self.adjwgt.push(weight);
        }
        let last = *self.xadj.last().unwrap();
        self.xadj.push(last + edges.len());
        self.vwgt.push(vertex_weight);
    }

    /// Original tensor id of a vertex (valid until the first merge).
    pub fn original_tensor_id(&self, vertex: VertexId) -> Option<TensorId> {
        self.renumber.get(vertex).copied()
    }

    fn edge_range(&self, vertex: VertexId) -> std::ops::Range<usize> {
        self.xadj[vertex]..self.xadj[vertex + 1]
    }

    /// Neighbors of a vertex with log-encoded edge weights.
    pub fn edges_of(&self, vertex: VertexId) -> impl Iterator<Item = (VertexId, u64)> + '_ {
        self.edge_range(vertex)
            .map(move |i| (self.adjncy[i], self.adjwgt[i]))
    }

    /// Full volume of a vertex: open volume times all incident edge volumes.
    fn vertex_volume(&self, vertex: VertexId) -> f64 {
        let mut volume = weight_volume(self.vwgt[vertex]);
        for (_, weight) in self.edges_of(vertex) {
            volume *= weight_volume(weight);
        }
        volume
    }

    /// Estimates the cost of contracting two distinct vertices. The flop
    /// estimate is `sqrt(vol(L)*vol(R)*vol(D))` with
    /// `vol(D) = vol(L)*vol(R)/contr^2`, `contr` being the product of the
    /// contracted edge volumes.
    pub fn contraction_cost(&self, vertex1: VertexId, vertex2: VertexId) -> ContractionCost {
        assert!(vertex1 != vertex2);
        assert!(vertex1 < self.num_vertices() && vertex2 < self.num_vertices());
        let left_volume = self.vertex_volume(vertex1);
        let right_volume = self.vertex_volume(vertex2);
        let mut contracted = 1f64;
        for (peer, weight) in self.edges_of(vertex1) {
            if peer == vertex2 {
                contracted *= weight_volume(weight);
            }
        }
        let intermediate_volume = left_volume * right_volume / (contracted * contracted);
        ContractionCost {
            flops: (left_volume * right_volume * intermediate_volume).sqrt(),
            intermediate_volume,
            differential_volume: intermediate_volume - (left_volume + right_volume),
        }
    }

    /// Fuses `vertex2` into `vertex1`: open volumes combine, duplicate
    /// adjacencies aggregate their weights, self-loops created by the
    /// contraction disappear, and every downstream reference to `vertex2` is
    /// renumbered. Any existing partition is invalidated. Returns false for
    /// invalid vertex pairs.
    pub fn merge_vertices(&mut self, vertex1: VertexId, vertex2: VertexId) -> bool {
        if vertex1 == vertex2
            || vertex1 >= self.num_vertices()
            || vertex2 >= self.num_vertices()
        {
            return false;
        }
        self.partitions = None;
        self.renumber.clear();
        let (vertex1, vertex2) = if vertex1 < vertex2 {
            (vertex1, vertex2)
        } else {
            (vertex2, vertex1)
        };

        // Combined log open volume.
        let merged_vwgt = self.vwgt[vertex1] + self.vwgt[vertex2] - 1;

        // Aggregate the surviving edges of the merged vertex.
        let mut merged_edges: std::collections::BTreeMap<VertexId, u64> =
            std::collections::BTreeMap::new();
        for source in [vertex1, vertex2] {
            for (peer, weight) in self.edges_of(source) {
                if peer == vertex1 || peer == vertex2 {
                    continue; // contracted edge becomes a self-loop
                }
                merged_edges
                    .entry(peer)
                    .and_modify(|w| *w += weight - 1)
                    .or_insert(weight);
            }
        }

        // Rebuild the CSR arrays, dropping vertex2 and patching references.
        let mut xadj = vec![0usize];
        let mut adjncy = Vec::with_capacity(self.adjncy.len());
        let mut adjwgt = Vec::with_capacity(self.adjwgt.len());
        let mut vwgt = Vec::with_capacity(self.vwgt.len() - 1);
        let patch = |peer: VertexId| -> VertexId {
            if peer == vertex2 {
                vertex1
            } else if peer > vertex2 {
                peer - 1
            } else {
                peer
            }
        };
        for vertex in 0..self.num_vertices() {
            if vertex == vertex2 {
                continue;
            }
            if vertex == vertex1 {
                for (&peer, &weight) in &merged_edges {
                    adjncy.push(patch(peer));
                    adjwgt.push(weight);
                }
                vwgt.push(merged_vwgt);
            } else {
                let mut edges: std::collections::BTreeMap<VertexId, u64> =
                    std::collections::BTreeMap::new();
                for (peer, weight) in self.edges_of(vertex) {
                    edges
                        .entry(patch(peer))
                        .and_modify(|w| *w += weight - 1)
                        .or_insert(weight);
                }
                for (peer, weight) in edges {
                    adjncy.push(peer);
                    adjwgt.push(weight);
                }
                vwgt.push(self.vwgt[vertex]);
            }
            xadj.push(adjncy.len());
        }
        self.xadj = xadj;
        self.adjncy = adjncy;
        self.adjwgt = adjwgt;
        self.vwgt = vwgt;
        true
    }

    /// Number of distinct cross-vertex edges (aggregated adjacencies count
    /// once per endpoint pair).
    pub fn num_cross_edges(&self) -> usize {
        debug_assert!(self.adjncy.len() % 2 == 0);
        self.adjncy.len() / 2
    }

    /// K-way partition assignment, if one has been computed.
    pub fn partitions(&self) -> Option<&[usize]> {
        self.partitions.as_deref()
    }

    /// Partitions the graph into `num_parts` parts, minimizing the cut of
    /// log-encoded edge weights.
    #[cfg(feature = "kahypar")]
    pub fn partition(&mut self, num_parts: usize, imbalance: f64) -> crate::error::Result<()> {
        use crate::error::Error;
        use kahypar::{partition, KaHyParContext};

        if self.num_vertices() == 0 || num_parts == 0 {
            return Err(Error::Contract(
                "partitioning requires a non-empty graph and at least one part".to_string(),
            ));
        }
        let num_parts = num_parts.min(self.num_vertices());
        let mut hyperedge_indices = vec![0usize];
        let mut hyperedges = Vec::new();
        let mut hyperedge_weights = Vec::new();
        for vertex in 0..self.num_vertices() {
            for (peer, weight) in self.edges_of(vertex) {
                if peer > vertex {
                    hyperedges.push(vertex as u32);
                    hyperedges.push(peer as u32);
                    hyperedge_indices.push(hyperedges.len());
                    hyperedge_weights.push(weight as i32);
                }
            }
        }
        let mut context = KaHyParContext::new();
        let mut objective = 0;
        let mut partitioning = vec![-1; self.num_vertices()];
        partition(
            self.num_vertices() as u32,
            hyperedge_weights.len() as u32,
            imbalance,
            num_parts as i32,
            None,
            Some(hyperedge_weights),
            &hyperedge_indices,
            hyperedges.as_slice(),
            &mut objective,
            &mut context,
            &mut partitioning,
        );
        self.partitions = Some(partitioning.into_iter().map(|p| p as usize).collect());
        Ok(())
    }

    /// Extracts the subgraph induced by one partition. External edges are
    /// absorbed into the vertex weights; the returned renumbering maps child
    /// vertices to parent vertices.
    pub fn subgraph(&self, members: &[VertexId]) -> (WeightedGraph, Vec<VertexId>) {
        let mut id_map: FxHashMap<VertexId, VertexId> = FxHashMap::default();
        for (child, &parent) in members.iter().enumerate() {
            id_map.insert(parent, child);
        }
        let mut graph = WeightedGraph::new();
        for &parent in members {
            let mut vertex_weight = self.vwgt[parent];
            let mut edges = Vec::new();
            for (peer, weight) in self.edges_of(parent) {
                if let Some(&child_peer) = id_map.get(&peer) {
                    edges.push((child_peer, weight));
                } else {
                    // External edge: absorb into the open volume.
                    vertex_weight += weight - 1;
                }
            }
            edges.sort_unstable();
            graph.append_vertex(&edges, vertex_weight);
        }
        (graph, members.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensornetwork::tests::setup_mps_closure;

    fn setup_graph() -> WeightedGraph {
        WeightedGraph::from_network(&setup_mps_closure())
    }

    #[test]
    fn test_log_weight_encoding() {
        assert_eq!(log_weight(1), 1);
        assert_eq!(log_weight(2), 2);
        assert_eq!(log_weight(4), 3);
        assert_eq!(log_weight(6), 3);
        assert_eq!(weight_volume(3), 4.0);
    }

    #[test]
    fn test_projection_shape() {
        let graph = setup_graph();
        assert_eq!(graph.num_vertices(), 7);
        // The closed 3-site network has 9 contracted edges.
        assert_eq!(graph.num_cross_edges(), 9);
        // No open dimensions: every vertex weight is log(1) + 1.
        for vertex in 0..graph.num_vertices() {
            assert_eq!(graph.vwgt[vertex], 1);
        }
    }

    #[test]
    fn test_contraction_cost_symmetry() {
        let graph = setup_graph();
        let a = graph.contraction_cost(0, 1);
        let b = graph.contraction_cost(1, 0);
        assert_eq!(a.flops, b.flops);
        assert_eq!(a.intermediate_volume, b.intermediate_volume);
        // T0(2x2) and T1(2x2x2) share one extent-2 edge: intermediate is
        // 2*2*2 = 8, flops = sqrt(4*8*8).
        assert_eq!(a.intermediate_volume, 8.0);
        assert_eq!(a.flops, (4.0 * 8.0 * 8.0f64).sqrt());
    }

    #[test]
    fn test_merge_bookkeeping() {
        let mut graph = setup_graph();
        let vertices_before = graph.num_vertices();
        let edges_before = graph.num_cross_edges();
        // Vertices 0 (T0) and 1 (T1) share exactly one edge; no duplicate
        // adjacency between their remaining neighbors exists beforehand.
        let shared: usize = graph.edges_of(0).filter(|&(p, _)| p == 1).count();
        assert!(graph.merge_vertices(0, 1));
        assert_eq!(graph.num_vertices(), vertices_before - 1);
        // T0 and T1 both touch H0 (vertex 3), so one adjacency aggregates.
        assert_eq!(graph.num_cross_edges(), edges_before - shared - 1);
    }

    #[test]
    fn test_merge_aggregates_weights() {
        // Triangle with unit open volumes and extent-2 edges.
        let mut graph = WeightedGraph::new();
        graph.append_vertex(&[(1, 2), (2, 2)], 1);
        graph.append_vertex(&[(0, 2), (2, 2)], 1);
        graph.append_vertex(&[(0, 2), (1, 2)], 1);
        assert!(graph.merge_vertices(0, 1));
        assert_eq!(graph.num_vertices(), 2);
        // Both former edges to vertex 2 aggregate: 2 + 2 - 1 = 3 (volume 4).
        assert_eq!(graph.edges_of(0).collect::<Vec<_>>(), vec![(1, 3)]);
        assert_eq!(graph.edges_of(1).collect::<Vec<_>>(), vec![(0, 3)]);
    }

    #[test]
    fn test_merge_rejects_invalid() {
        let mut graph = setup_graph();
        assert!(!graph.merge_vertices(0, 0));
        assert!(!graph.merge_vertices(0, 99));
    }

    #[test]
    fn test_subgraph_absorbs_external_edges() {
        let graph = setup_graph();
        let (sub, renumber) = graph.subgraph(&[0, 1, 2]);
        assert_eq!(sub.num_vertices(), 3);
        assert_eq!(renumber, vec![0, 1, 2]);
        // External edges moved into the vertex weights, so the total log
        // volume is conserved.
        let total = |g: &WeightedGraph, members: &[VertexId]| -> u64 {
            members
                .iter()
                .map(|&v| {
                    g.vwgt[v] - 1
                        + g.edges_of(v)
                            .map(|(_, w)| w - 1)
                            .sum::<u64>()
                })
                .sum()
        };
        assert_eq!(total(&graph, &[0, 1, 2]), total(&sub, &[0, 1, 2]));
    }
}
