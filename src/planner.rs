//! Contraction-sequence planning. A finalized tensor network is projected
//! onto a weighted multigraph and contracted pair by pair; the planner emits
//! the resulting ordered list of contraction triples. Strategies are
//! selected by name and replay deterministically for a fixed seed.

use std::str::FromStr;

use itertools::Itertools;
use log::debug;
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tensornetwork::TensorNetwork;
use crate::types::{calculate_hash, ContractionTriple, TensorId, VertexId};

pub mod cache;
pub mod graph;

use cache::PlanCache;
use graph::{ContractionCost, WeightedGraph};

/// Contraction-sequence search strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Contract in input order.
    Dummy,
    /// Heuristic pairwise flop-cost model.
    Heuro,
    /// Smallest intermediate first, ties broken by smallest differential
    /// volume.
    Greed,
    /// K-way graph partitioning, recursing into each partition.
    Metis,
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "dummy" => Ok(Self::Dummy),
            "heuro" => Ok(Self::Heuro),
            "greed" => Ok(Self::Greed),
            "metis" => Ok(Self::Metis),
            other => Err(Error::RegistryMiss {
                kind: "planner strategy",
                name: other.to_string(),
            }),
        }
    }
}

/// A finished contraction plan: the triples in execution order plus cost
/// estimates accumulated while planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractionPlan {
    pub triples: Vec<ContractionTriple>,
    /// Accumulated FMA flop estimate.
    pub flops: f64,
    /// Largest intermediate volume produced along the plan.
    pub max_intermediate_volume: f64,
    /// Tensor id holding the final result.
    pub result_id: TensorId,
}

/// Plans contraction sequences for tensor networks, caching finished plans
/// by network topology.
#[derive(Debug)]
pub struct Planner {
    strategy: Strategy,
    seed: u64,
    cache: PlanCache,
}

impl Planner {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            seed: 0,
            cache: PlanCache::new(),
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Ok(Self::new(Strategy::from_str(name)?))
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut PlanCache {
        &mut self.cache
    }

    /// Plans the pairwise contraction of `network`. Finished plans are keyed
    /// by `(topology, strategy, seed)` and replayed from the cache on
    /// repeated calls.
    pub fn plan(&mut self, network: &TensorNetwork) -> Result<ContractionPlan> {
        if !network.is_finalized() {
            return Err(Error::Contract(format!(
                "network `{}` must be finalized before planning",
                network.name()
            )));
        }
        if network.num_inputs() == 0 {
            return Err(Error::Contract(format!(
                "network `{}` has no input tensors",
                network.name()
            )));
        }
        let key = calculate_hash(&(
            network.topology_fingerprint(),
            self.strategy,
            self.seed,
        ));
        if let Some(plan) = self.cache.lookup(key) {
            debug!(
                "plan cache hit for network `{}` ({} triples)",
                network.name(),
                plan.triples.len()
            );
            return Ok(plan);
        }

        let plan = self.compute_plan(network)?;
        self.cache.insert(key, plan.clone());
        Ok(plan)
    }

    fn compute_plan(&self, network: &TensorNetwork) -> Result<ContractionPlan> {
        let labels = network.input_ids();
        if labels.len() == 1 {
            return Ok(ContractionPlan {
                triples: Vec::new(),
                flops: 0.0,
                max_intermediate_volume: 0.0,
                result_id: labels[0],
            });
        }
        let graph = WeightedGraph::from_network(network);
        let mut state = PlanState::new(graph, labels);
        let mut rng = StdRng::seed_from_u64(self.seed);

        match self.strategy {
            Strategy::Dummy => {
                while state.alive() > 1 {
                    state.merge(0, 1);
                }
            }
            Strategy::Heuro => {
                while state.alive() > 1 {
                    let candidates: Vec<VertexId> = (0..state.alive()).collect();
                    let (a, b) = pick_pair(&state.graph, &candidates, &mut rng, |cost| {
                        (cost.flops, cost.intermediate_volume)
                    });
                    state.merge(a, b);
                }
            }
            Strategy::Greed => {
                while state.alive() > 1 {
                    let candidates: Vec<VertexId> = (0..state.alive()).collect();
                    let (a, b) = pick_pair(&state.graph, &candidates, &mut rng, |cost| {
                        (cost.intermediate_volume, cost.differential_volume)
                    });
                    state.merge(a, b);
                }
            }
            Strategy::Metis => {
                self.plan_partitioned(&mut state, &mut rng)?;
            }
        }

        debug!(
            "planned network `{}` with {:?}: {} triples, {:.3e} flops",
            network.name(),
            self.strategy,
            state.triples.len(),
            state.flops
        );
        Ok(ContractionPlan {
            result_id: state.labels[0],
            triples: state.triples,
            flops: state.flops,
            max_intermediate_volume: state.max_intermediate_volume,
        })
    }

    #[cfg(feature = "kahypar")]
    fn plan_partitioned(&self, state: &mut PlanState, rng: &mut StdRng) -> Result<()> {
        const PARTITION_THRESHOLD: usize = 8;
        const IMBALANCE: f64 = 0.03;

        while state.alive() > 1 {
            if state.alive() <= PARTITION_THRESHOLD {
                let candidates: Vec<VertexId> = (0..state.alive()).collect();
                let (a, b) = pick_pair(&state.graph, &candidates, rng, |cost| {
                    (cost.intermediate_volume, cost.differential_volume)
                });
                state.merge(a, b);
                continue;
            }
            state.graph.partition(2, IMBALANCE)?;
            let assignment = state.graph.partitions().unwrap().to_vec();
            // Contract each partition down to a single vertex, tracking
            // members through the index shifts by their stable labels.
            for part in 0..2 {
                let mut members: Vec<TensorId> = assignment
                    .iter()
                    .enumerate()
                    .filter(|&(_, &p)| p == part)
                    .map(|(v, _)| state.labels[v])
                    .collect();
                while members.len() > 1 {
                    let positions: Vec<VertexId> = members
                        .iter()
                        .map(|label| state.position(*label))
                        .collect();
                    let (a, b) = pick_pair(&state.graph, &positions, rng, |cost| {
                        (cost.intermediate_volume, cost.differential_volume)
                    });
                    let (left, right) = (state.labels[a], state.labels[b]);
                    let result = state.merge(a, b);
                    members.retain(|&l| l != left && l != right);
                    members.push(result);
                }
            }
        }
        Ok(())
    }

    #[cfg(not(feature = "kahypar"))]
    fn plan_partitioned(&self, _state: &mut PlanState, _rng: &mut StdRng) -> Result<()> {
        Err(Error::Unavailable(
            "the `metis` strategy (kahypar feature)".to_string(),
        ))
    }
}

/// Mutable planning state: the shrinking graph, the stable tensor-id label
/// of every surviving vertex, and the emitted triples.
struct PlanState {
    graph: WeightedGraph,
    labels: Vec<TensorId>,
    next_id: TensorId,
    triples: Vec<ContractionTriple>,
    flops: f64,
    max_intermediate_volume: f64,
}

impl PlanState {
    fn new(graph: WeightedGraph, labels: Vec<TensorId>) -> Self {
        let next_id = labels.iter().copied().max().unwrap_or(0) + 1;
        Self {
            graph,
            labels,
            next_id,
            triples: Vec::new(),
            flops: 0.0,
            max_intermediate_volume: 0.0,
        }
    }

    fn alive(&self) -> usize {
        self.labels.len()
    }

    fn position(&self, label: TensorId) -> VertexId {
        self.labels
            .iter()
            .position(|&l| l == label)
            .expect("label is alive")
    }

    /// Merges two current vertex indices, emitting a triple. Returns the
    /// fresh intermediate id.
    fn merge(&mut self, a: VertexId, b: VertexId) -> TensorId {
        let (a, b) = if a < b { (a, b) } else { (b, a) };
        let cost = self.graph.contraction_cost(a, b);
        self.flops += cost.flops;
        self.max_intermediate_volume = self.max_intermediate_volume.max(cost.intermediate_volume);
        let merged = self.graph.merge_vertices(a, b);
        assert!(merged);
        let result = self.next_id;
        self.next_id += 1;
        self.triples
            .push(ContractionTriple::new(self.labels[a], self.labels[b], result));
        self.labels[a] = result;
        self.labels.remove(b);
        result
    }
}

/// Picks the candidate pair minimizing `objective` (lexicographic). Exact
/// ties are broken by the seeded rng so that replay stays deterministic.
fn pick_pair<F>(
    graph: &WeightedGraph,
    candidates: &[VertexId],
    rng: &mut StdRng,
    objective: F,
) -> (VertexId, VertexId)
where
    F: Fn(&ContractionCost) -> (f64, f64),
{
    debug_assert!(candidates.len() > 1);
    let mut best: Vec<(VertexId, VertexId)> = Vec::new();
    let mut best_key = (OrderedFloat(f64::INFINITY), OrderedFloat(f64::INFINITY));
    for (&a, &b) in candidates.iter().tuple_combinations() {
        let (primary, secondary) = objective(&graph.contraction_cost(a, b));
        let key = (OrderedFloat(primary), OrderedFloat(secondary));
        if key < best_key {
            best_key = key;
            best.clear();
            best.push((a, b));
        } else if key == best_key {
            best.push((a, b));
        }
    }
    *best.choose(rng).expect("at least one candidate pair")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{make_shared, Tensor, TensorHandle, TensorShape};
    use crate::tensornetwork::tests::setup_mps_closure;
    use rand::Rng;
    use rustc_hash::FxHashMap;

    fn plan_with(strategy: Strategy, network: &TensorNetwork) -> ContractionPlan {
        Planner::new(strategy).with_seed(7).plan(network).unwrap()
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(Strategy::from_str("dummy").unwrap(), Strategy::Dummy);
        assert_eq!(Strategy::from_str("heuro").unwrap(), Strategy::Heuro);
        assert_eq!(Strategy::from_str("greed").unwrap(), Strategy::Greed);
        assert_eq!(Strategy::from_str("metis").unwrap(), Strategy::Metis);
        assert!(Strategy::from_str("bogus").is_err());
    }

    #[test]
    fn test_dummy_contracts_in_input_order() {
        let network = setup_mps_closure();
        let plan = plan_with(Strategy::Dummy, &network);
        assert_eq!(plan.triples.len(), 6);
        assert_eq!(plan.triples[0], ContractionTriple::new(1, 2, 8));
        assert_eq!(plan.triples[1], ContractionTriple::new(8, 3, 9));
        assert_eq!(plan.result_id, 13);
    }

    #[test]
    fn test_plan_consumes_every_input_once() {
        let network = setup_mps_closure();
        for strategy in [Strategy::Dummy, Strategy::Heuro, Strategy::Greed] {
            let plan = plan_with(strategy, &network);
            let mut consumed: Vec<TensorId> = plan
                .triples
                .iter()
                .flat_map(|t| [t.left, t.right])
                .filter(|&id| id <= 7)
                .collect();
            consumed.sort_unstable();
            assert_eq!(consumed, vec![1, 2, 3, 4, 5, 6, 7], "{strategy:?}");
        }
    }

    #[test]
    fn test_replay_is_deterministic() {
        let network = setup_mps_closure();
        let first = Planner::new(Strategy::Greed)
            .with_seed(42)
            .plan(&network)
            .unwrap();
        let second = Planner::new(Strategy::Greed)
            .with_seed(42)
            .plan(&network)
            .unwrap();
        assert_eq!(first.triples, second.triples);
    }

    #[test]
    fn test_cache_replay() {
        let network = setup_mps_closure();
        let mut planner = Planner::new(Strategy::Greed).with_seed(42);
        let first = planner.plan(&network).unwrap();
        let second = planner.plan(&network).unwrap();
        assert_eq!(first, second);
        assert_eq!(planner.cache().hits(), 1);
        assert_eq!(planner.cache().misses(), 1);
    }

    /// Random 10-vertex network with extents from {2,4}; every strategy must
    /// beat or match input order on the estimated cost.
    fn setup_random_network(seed: u64) -> TensorNetwork {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tensors: FxHashMap<String, TensorHandle> = FxHashMap::default();
        // Ring of 10 tensors with random extents plus a few chords.
        let n = 10usize;
        let mut extents = Vec::new();
        for _ in 0..n {
            extents.push(if rng.gen_bool(0.5) { 2u64 } else { 4 });
        }
        let mut specs: Vec<(String, Vec<String>, Vec<u64>)> = Vec::new();
        for i in 0..n {
            let name = format!("R{i}");
            let left = format!("e{i}");
            let right = format!("e{}", (i + 1) % n);
            specs.push((
                name,
                vec![left, right],
                vec![extents[i], extents[(i + 1) % n]],
            ));
        }
        let mut expression = String::from("Z()=");
        for (i, (name, labels, dims)) in specs.iter().enumerate() {
            if i > 0 {
                expression.push('*');
            }
            expression.push_str(&format!("{name}({})", labels.join(",")));
            tensors.insert(
                name.clone(),
                make_shared(Tensor::new(
                    name,
                    TensorShape::new(dims.clone()).unwrap(),
                )),
            );
        }
        tensors.insert("Z".to_string(), make_shared(Tensor::scalar("Z")));
        TensorNetwork::from_symbolic("random", &expression, &tensors).unwrap()
    }

    #[test]
    fn test_greedy_beats_input_order() {
        for seed in 0..5 {
            let network = setup_random_network(seed);
            let dummy = plan_with(Strategy::Dummy, &network);
            let greedy = plan_with(Strategy::Greed, &network);
            assert!(
                greedy.flops <= dummy.flops,
                "seed {seed}: greedy {} > dummy {}",
                greedy.flops,
                dummy.flops
            );
        }
    }

    #[test]
    fn test_heuro_beats_input_order() {
        for seed in 0..5 {
            let network = setup_random_network(seed);
            let dummy = plan_with(Strategy::Dummy, &network);
            let heuro = plan_with(Strategy::Heuro, &network);
            assert!(heuro.flops <= dummy.flops);
        }
    }

    #[cfg(not(feature = "kahypar"))]
    #[test]
    fn test_metis_unavailable_without_feature() {
        let network = setup_mps_closure();
        assert!(matches!(
            Planner::new(Strategy::Metis).plan(&network),
            Err(Error::Unavailable(_))
        ));
    }
}
