//! Tensor networks: tensors connected by legs. A network stores one
//! connection per tensor, keyed by id, with the output tensor at id 0
//! collecting all open legs. Legs reference peers by id and dimension,
//! never by pointer.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::symbolic::IndexPattern;
use crate::tensor::{make_shared, Tensor, TensorHandle};
use crate::types::{calculate_hash, DimExtent, DimId, LegDirection, TensorId};

pub mod expansion;
pub mod operator;

/// One leg of a tensor connection: the peer tensor id within the network,
/// the peer dimension and an optional direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorLeg {
    peer_id: TensorId,
    peer_dim: DimId,
    direction: LegDirection,
}

impl TensorLeg {
    pub fn new(peer_id: TensorId, peer_dim: DimId) -> Self {
        Self {
            peer_id,
            peer_dim,
            direction: LegDirection::Undirected,
        }
    }

    pub fn directed(peer_id: TensorId, peer_dim: DimId, direction: LegDirection) -> Self {
        Self {
            peer_id,
            peer_dim,
            direction,
        }
    }

    pub fn peer_id(&self) -> TensorId {
        self.peer_id
    }

    pub fn peer_dim(&self) -> DimId {
        self.peer_dim
    }

    pub fn direction(&self) -> LegDirection {
        self.direction
    }

    pub(crate) fn reset(&mut self, peer_id: TensorId, peer_dim: DimId) {
        self.peer_id = peer_id;
        self.peer_dim = peer_dim;
    }

    pub(crate) fn reverse_direction(&mut self) {
        self.direction = self.direction.reversed();
    }
}

impl std::fmt::Display for TensorLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let marker = match self.direction {
            LegDirection::Undirected => "",
            LegDirection::Inward => "<",
            LegDirection::Outward => ">",
        };
        write!(f, "{}:{}{}", self.peer_id, self.peer_dim, marker)
    }
}

/// A tensor placed inside a network: the shared tensor handle, its id within
/// the network, one leg per dimension, and the conjugation/optimizability
/// flags. The output connection (id 0) is never conjugated and never
/// optimizable.
#[derive(Debug, Clone)]
pub struct TensorConn {
    tensor: TensorHandle,
    id: TensorId,
    legs: Vec<TensorLeg>,
    conjugated: bool,
    optimizable: bool,
}

impl TensorConn {
    pub fn new(tensor: TensorHandle, id: TensorId, legs: Vec<TensorLeg>) -> Self {
        Self {
            tensor,
            id,
            legs,
            conjugated: false,
            optimizable: false,
        }
    }

    pub fn tensor(&self) -> &TensorHandle {
        &self.tensor
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.tensor.name()
    }

    pub fn rank(&self) -> usize {
        self.tensor.rank()
    }

    pub fn dim_extent(&self, dim: DimId) -> DimExtent {
        self.tensor.dim_extent(dim)
    }

    pub fn legs(&self) -> &[TensorLeg] {
        &self.legs
    }

    pub fn leg(&self, dim: DimId) -> &TensorLeg {
        &self.legs[dim as usize]
    }

    pub fn is_conjugated(&self) -> bool {
        self.conjugated
    }

    pub fn is_optimizable(&self) -> bool {
        self.optimizable
    }

    /// Marks the underlying tensor as subject to variational optimization.
    pub fn set_optimizable(&mut self, optimizable: bool) -> Result<()> {
        if optimizable && self.id == 0 {
            return Err(Error::Contract(
                "the output tensor cannot be optimizable".to_string(),
            ));
        }
        self.optimizable = optimizable;
        Ok(())
    }

    pub(crate) fn reset_leg(&mut self, dim: DimId, peer_id: TensorId, peer_dim: DimId) {
        self.legs[dim as usize].reset(peer_id, peer_dim);
    }

    /// Toggles conjugation (inputs only) and reverses all leg directions.
    pub(crate) fn conjugate(&mut self) {
        if self.id != 0 {
            self.conjugated = !self.conjugated;
        }
        for leg in &mut self.legs {
            leg.reverse_direction();
        }
    }

    /// Replaces the stored tensor with an edited clone (copy-on-write).
    fn edit_tensor<F: FnOnce(&mut Tensor)>(&mut self, edit: F) {
        let mut tensor = (*self.tensor).clone();
        edit(&mut tensor);
        self.tensor = Arc::new(tensor);
    }
}

impl std::fmt::Display for TensorConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}{}: {{",
            self.id,
            self.tensor,
            if self.conjugated { "+" } else { "" }
        )?;
        for (i, leg) in self.legs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{leg}")?;
        }
        write!(f, "}}")
    }
}

/// A tensor network. Connections are keyed by id in a `BTreeMap` so that
/// iteration order is deterministic and replay-stable.
#[derive(Debug, Clone)]
pub struct TensorNetwork {
    name: String,
    conns: BTreeMap<TensorId, TensorConn>,
    finalized: bool,
}

impl TensorNetwork {
    /// Starts a network from its output tensor. Input tensors are then added
    /// with [`TensorNetwork::place_tensor`]; output legs are derived during
    /// [`TensorNetwork::finalize`].
    pub fn new(name: &str, output: Tensor) -> Self {
        let mut conns = BTreeMap::new();
        conns.insert(0, TensorConn::new(make_shared(output), 0, Vec::new()));
        Self {
            name: name.to_string(),
            conns,
            finalized: false,
        }
    }

    /// Builds a network from a symbolic specification of the form
    /// `Out(i,j)=A(i,k)*B(k,j)*...`, binding tensors from `tensors` by name.
    /// Input tensors receive ids 1,2,... in factor order. The returned
    /// network is finalized.
    pub fn from_symbolic(
        name: &str,
        specification: &str,
        tensors: &FxHashMap<String, TensorHandle>,
    ) -> Result<Self> {
        let pattern = IndexPattern::parse(specification)?;
        let lookup = |factor_name: &str| -> Result<TensorHandle> {
            tensors
                .get(factor_name)
                .cloned()
                .ok_or_else(|| Error::RegistryMiss {
                    kind: "tensor",
                    name: factor_name.to_string(),
                })
        };

        let output_tensor = lookup(&pattern.output.name)?;
        if output_tensor.rank() != pattern.output.rank() {
            return Err(Error::Contract(format!(
                "output tensor `{}` has rank {}, specification names {} indices",
                pattern.output.name,
                output_tensor.rank(),
                pattern.output.rank()
            )));
        }

        // label -> list of (tensor id, dimension); id 0 is the output.
        let mut occurrences: FxHashMap<&str, Vec<(TensorId, DimId)>> = FxHashMap::default();
        for (pos, label) in pattern.output.indices.iter().enumerate() {
            occurrences
                .entry(label)
                .or_default()
                .push((0, pos as DimId));
        }
        for (i, factor) in pattern.inputs.iter().enumerate() {
            let id = (i + 1) as TensorId;
            for (pos, label) in factor.indices.iter().enumerate() {
                occurrences
                    .entry(label)
                    .or_default()
                    .push((id, pos as DimId));
            }
        }
        for (label, occs) in &occurrences {
            if occs.len() != 2 {
                return Err(Error::Contract(format!(
                    "index `{label}` must appear exactly twice in `{specification}`"
                )));
            }
        }

        let mut network = Self::new(name, (*output_tensor).clone());
        // Pre-size the output legs; they are overwritten below.
        network.conns.get_mut(&0).unwrap().legs =
            vec![TensorLeg::new(TensorId::MAX, 0); output_tensor.rank()];

        for (i, factor) in pattern.inputs.iter().enumerate() {
            let id = (i + 1) as TensorId;
            let tensor = lookup(&factor.name)?;
            if tensor.rank() != factor.rank() {
                return Err(Error::Contract(format!(
                    "tensor `{}` has rank {}, specification names {} indices",
                    factor.name,
                    tensor.rank(),
                    factor.rank()
                )));
            }
            let legs = factor
                .indices
                .iter()
                .enumerate()
                .map(|(pos, label)| {
                    let occs = &occurrences[label.as_str()];
                    let (peer_id, peer_dim) = occs
                        .iter()
                        .copied()
                        .find(|&(t, d)| (t, d) != (id, pos as DimId))
                        .expect("every label occurs twice");
                    TensorLeg::new(peer_id, peer_dim)
                })
                .collect();
            let mut conn = TensorConn::new(tensor, id, legs);
            conn.conjugated = factor.conjugated;
            network.conns.insert(id, conn);
        }

        // Wire the output legs from the reverse occurrences.
        let output_legs: Vec<TensorLeg> = pattern
            .output
            .indices
            .iter()
            .enumerate()
            .map(|(pos, label)| {
                let (peer_id, peer_dim) = occurrences[label.as_str()]
                    .iter()
                    .copied()
                    .find(|&(t, d)| (t, d) != (0, pos as DimId))
                    .expect("validated above");
                TensorLeg::new(peer_id, peer_dim)
            })
            .collect();
        network.conns.get_mut(&0).unwrap().legs = output_legs;

        network.finalize()?;
        Ok(network)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Rank of the output tensor.
    pub fn rank(&self) -> usize {
        self.output().rank()
    }

    pub fn output(&self) -> &TensorConn {
        self.conns.get(&0).expect("output connection always exists")
    }

    pub fn connection(&self, id: TensorId) -> Option<&TensorConn> {
        self.conns.get(&id)
    }

    pub fn connection_mut(&mut self, id: TensorId) -> Option<&mut TensorConn> {
        self.conns.get_mut(&id)
    }

    /// Number of input tensors.
    pub fn num_inputs(&self) -> usize {
        self.conns.len() - 1
    }

    /// All connections in id order, output first.
    pub fn connections(&self) -> impl Iterator<Item = &TensorConn> {
        self.conns.values()
    }

    /// Input connections in id order.
    pub fn inputs(&self) -> impl Iterator<Item = &TensorConn> {
        self.conns.values().filter(|c| c.id != 0)
    }

    pub fn input_ids(&self) -> Vec<TensorId> {
        self.conns.keys().copied().filter(|&id| id != 0).collect()
    }

    /// Largest id currently placed.
    pub fn max_tensor_id(&self) -> TensorId {
        self.conns.keys().copied().max().unwrap_or(0)
    }

    /// Places an input tensor. `legs` must cover every dimension; peers may
    /// be placed later, symmetry is checked during finalization. A leg with
    /// peer id 0 declares an open dimension at the given output position.
    pub fn place_tensor(
        &mut self,
        id: TensorId,
        tensor: TensorHandle,
        legs: Vec<TensorLeg>,
        conjugated: bool,
    ) -> Result<()> {
        if id == 0 {
            return Err(Error::Contract(
                "id 0 is reserved for the output tensor".to_string(),
            ));
        }
        if self.conns.contains_key(&id) {
            return Err(Error::Contract(format!(
                "tensor id {id} already placed in network `{}`",
                self.name
            )));
        }
        if legs.len() != tensor.rank() {
            return Err(Error::Contract(format!(
                "tensor `{}` of rank {} given {} legs",
                tensor.name(),
                tensor.rank(),
                legs.len()
            )));
        }
        let mut conn = TensorConn::new(tensor, id, legs);
        conn.conjugated = conjugated;
        self.conns.insert(id, conn);
        self.finalized = false;
        Ok(())
    }

    /// Verifies the network structure and derives the output legs. After a
    /// successful call every non-output leg has a symmetric peer, extents
    /// agree across every connection, and the output enumerates all open
    /// legs in dimension order.
    pub fn finalize(&mut self) -> Result<()> {
        let output_rank = self.output().rank();
        let mut output_legs: Vec<Option<TensorLeg>> = vec![None; output_rank];

        for conn in self.conns.values() {
            if conn.id == 0 {
                continue;
            }
            for (dim, leg) in conn.legs.iter().enumerate() {
                let dim = dim as DimId;
                if leg.peer_id == conn.id && leg.peer_dim == dim {
                    return Err(Error::Contract(format!(
                        "tensor {} dimension {dim} connects to itself",
                        conn.id
                    )));
                }
                if leg.peer_id == 0 {
                    let pos = leg.peer_dim as usize;
                    if pos >= output_rank {
                        return Err(Error::Contract(format!(
                            "tensor {} dimension {dim} opens at output position {pos}, output rank is {output_rank}",
                            conn.id
                        )));
                    }
                    if self.output().dim_extent(leg.peer_dim) != conn.dim_extent(dim) {
                        return Err(Error::Contract(format!(
                            "open leg extent mismatch at output position {pos}: {} vs {}",
                            self.output().dim_extent(leg.peer_dim),
                            conn.dim_extent(dim)
                        )));
                    }
                    if let Some(prev) = output_legs[pos] {
                        if (prev.peer_id, prev.peer_dim) != (conn.id, dim) {
                            return Err(Error::Contract(format!(
                                "output position {pos} claimed by tensors {} and {}",
                                prev.peer_id, conn.id
                            )));
                        }
                    }
                    output_legs[pos] =
                        Some(TensorLeg::directed(conn.id, dim, leg.direction.reversed()));
                } else {
                    let peer = self.conns.get(&leg.peer_id).ok_or_else(|| {
                        Error::Contract(format!(
                            "tensor {} dimension {dim} references missing tensor {}",
                            conn.id, leg.peer_id
                        ))
                    })?;
                    if leg.peer_dim as usize >= peer.rank() {
                        return Err(Error::Contract(format!(
                            "tensor {} dimension {dim} references dimension {} of rank-{} tensor {}",
                            conn.id,
                            leg.peer_dim,
                            peer.rank(),
                            peer.id
                        )));
                    }
                    let back = peer.leg(leg.peer_dim);
                    if (back.peer_id, back.peer_dim) != (conn.id, dim) {
                        return Err(Error::Contract(format!(
                            "asymmetric connection: tensor {} dim {dim} -> tensor {} dim {}, reverse points to tensor {} dim {}",
                            conn.id, leg.peer_id, leg.peer_dim, back.peer_id, back.peer_dim
                        )));
                    }
                    if back.direction != leg.direction.reversed() {
                        return Err(Error::Contract(format!(
                            "leg directions disagree between tensor {} dim {dim} and tensor {} dim {}",
                            conn.id, leg.peer_id, leg.peer_dim
                        )));
                    }
                    if peer.dim_extent(leg.peer_dim) != conn.dim_extent(dim) {
                        return Err(Error::Contract(format!(
                            "extent mismatch on edge between tensor {} dim {dim} ({}) and tensor {} dim {} ({})",
                            conn.id,
                            conn.dim_extent(dim),
                            peer.id,
                            leg.peer_dim,
                            peer.dim_extent(leg.peer_dim)
                        )));
                    }
                }
            }
        }

        let output_legs: Vec<TensorLeg> = output_legs
            .into_iter()
            .enumerate()
            .map(|(pos, leg)| {
                leg.ok_or_else(|| {
                    Error::Contract(format!("output dimension {pos} is not claimed by any input"))
                })
            })
            .collect::<Result<_>>()?;
        self.conns.get_mut(&0).unwrap().legs = output_legs;
        self.finalized = true;
        debug!(
            "finalized tensor network `{}`: {} inputs, output rank {}",
            self.name,
            self.num_inputs(),
            self.rank()
        );
        Ok(())
    }

    /// Removes an input tensor and promotes its previously contracted legs
    /// to new open legs on the output (in the deleted tensor's dimension
    /// order). Open legs of the deleted tensor disappear from the output.
    /// This forms the optimization environment of the deleted tensor.
    pub fn delete_tensor(&mut self, id: TensorId) -> Result<()> {
        if id == 0 {
            return Err(Error::Contract(
                "the output tensor cannot be deleted".to_string(),
            ));
        }
        if !self.finalized {
            return Err(Error::Contract(format!(
                "network `{}` must be finalized before editing",
                self.name
            )));
        }
        let dead = self.conns.remove(&id).ok_or_else(|| Error::RegistryMiss {
            kind: "tensor id",
            name: id.to_string(),
        })?;

        // Output dimensions owned by the deleted tensor go away first.
        let mut doomed: Vec<DimId> = dead
            .legs
            .iter()
            .filter(|leg| leg.peer_id == 0)
            .map(|leg| leg.peer_dim)
            .collect();
        doomed.sort_unstable();
        for (already_removed, dim) in doomed.into_iter().enumerate() {
            self.remove_output_dimension(dim - already_removed as DimId);
        }

        // Contracted legs become open legs appended to the output.
        for (dim, leg) in dead.legs.iter().enumerate() {
            if leg.peer_id == 0 {
                continue;
            }
            let peer_id = leg.peer_id;
            let peer_dim = leg.peer_dim;
            let (attr, extent, direction) = {
                let peer = &self.conns[&peer_id];
                (
                    peer.tensor.signature().dim_attr(peer_dim),
                    peer.dim_extent(peer_dim),
                    peer.leg(peer_dim).direction,
                )
            };
            let new_dim = self.output().rank() as DimId;
            let output = self.conns.get_mut(&0).unwrap();
            output.edit_tensor(|t| t.append_dimension(attr, extent));
            output
                .legs
                .push(TensorLeg::directed(peer_id, peer_dim, direction.reversed()));
            let peer = self.conns.get_mut(&peer_id).unwrap();
            peer.reset_leg(peer_dim, 0, new_dim);
            let _ = dim;
        }
        debug!(
            "deleted tensor {id} from network `{}`; output rank is now {}",
            self.name,
            self.rank()
        );
        Ok(())
    }

    /// Drops output dimension `dim`, renumbering every reference to later
    /// output dimensions.
    fn remove_output_dimension(&mut self, dim: DimId) {
        let output = self.conns.get_mut(&0).unwrap();
        output.edit_tensor(|t| t.delete_dimension(dim));
        output.legs.remove(dim as usize);
        for conn in self.conns.values_mut() {
            if conn.id == 0 {
                continue;
            }
            for leg in &mut conn.legs {
                if leg.peer_id == 0 && leg.peer_dim > dim {
                    leg.peer_dim -= 1;
                }
            }
        }
    }

    /// Complex-conjugates the network: toggles every input's conjugation
    /// flag and reverses the direction of every leg. The output connection's
    /// flag is untouched. An involution.
    pub fn conjugate(&mut self) {
        for conn in self.conns.values_mut() {
            conn.conjugate();
        }
    }

    /// `(input id, input dimension)` behind every output dimension, in
    /// output order. Requires a finalized network.
    pub fn open_legs(&self) -> Vec<(TensorId, DimId)> {
        self.output()
            .legs
            .iter()
            .map(|leg| (leg.peer_id, leg.peer_dim))
            .collect()
    }

    /// Same output shape and signature.
    pub fn is_congruent_to(&self, other: &TensorNetwork) -> bool {
        self.output()
            .tensor()
            .is_congruent_to(other.output().tensor())
    }

    /// Name-independent fingerprint of the network topology: connection
    /// structure, extents, directions and conjugation flags. Used to key the
    /// contraction-plan cache.
    pub fn topology_fingerprint(&self) -> u64 {
        let mut parts: Vec<u64> = Vec::with_capacity(self.conns.len());
        for conn in self.conns.values() {
            parts.push(calculate_hash(&(
                conn.id,
                conn.tensor.shape().extents(),
                conn.conjugated,
                conn.legs
                    .iter()
                    .map(|l| (l.peer_id, l.peer_dim, l.direction))
                    .collect::<Vec<_>>(),
            )));
        }
        calculate_hash(&parts)
    }

    /// Assembles a network from pre-wired connections. Used by the expansion
    /// and operator gluing machinery; the result is finalized.
    pub(crate) fn from_parts(
        name: &str,
        output: TensorConn,
        inputs: Vec<TensorConn>,
    ) -> Result<Self> {
        let mut conns = BTreeMap::new();
        assert_eq!(output.id, 0);
        conns.insert(0, output);
        for conn in inputs {
            assert_ne!(conn.id, 0);
            conns.insert(conn.id, conn);
        }
        let mut network = Self {
            name: name.to_string(),
            conns,
            finalized: false,
        };
        network.finalize()?;
        Ok(network)
    }
}

impl std::fmt::Display for TensorNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "TensorNetwork `{}` ({}finalized):",
            self.name,
            if self.finalized { "" } else { "not " }
        )?;
        for conn in self.conns.values() {
            writeln!(f, "  {conn}")?;
        }
        Ok(())
    }
}
