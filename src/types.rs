use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Id of a registered vector space. Id 0 is the always-present anonymous
/// space; named spaces have ids greater than zero.
pub type SpaceId = u32;

/// Id of a subspace within a vector space. Id 0 is the full subspace;
/// [`UNREG_SUBSPACE`] marks an unregistered subspace.
pub type SubspaceId = u64;

/// Extent of a tensor dimension.
pub type DimExtent = u64;

/// Base offset of a subspace within its parent space.
pub type DimOffset = u64;

/// Id of a tensor connection within a tensor network. Id 0 is reserved for
/// the output tensor.
pub type TensorId = u32;

/// Index of a dimension within a tensor.
pub type DimId = u32;

/// Submission-ordered id of a primitive tensor operation.
pub type OpId = u64;

/// Vertex id in the planner's weighted graph.
pub type VertexId = usize;

/// Global rank of a process within the default process group.
pub type ProcessRank = u32;

/// The anonymous vector space.
pub const SOME_SPACE: SpaceId = 0;

/// The trivial (full) subspace every registered space carries.
pub const FULL_SUBSPACE: SubspaceId = 0;

/// Id of any unregistered subspace.
pub const UNREG_SUBSPACE: SubspaceId = SubspaceId::MAX;

/// Dimension of the anonymous vector space.
pub const MAX_SPACE_DIM: DimExtent = DimExtent::MAX;

/// Numeric type of tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Real32,
    Real64,
    Complex32,
    Complex64,
}

impl ElementType {
    /// Storage size of one element in bytes.
    pub fn byte_size(self) -> usize {
        match self {
            Self::Real32 => 4,
            Self::Real64 => 8,
            Self::Complex32 => 8,
            Self::Complex64 => 16,
        }
    }

    pub fn is_complex(self) -> bool {
        matches!(self, Self::Complex32 | Self::Complex64)
    }

    /// Cost factor of one fused multiply-add in this element type, relative
    /// to a real one.
    pub fn op_factor(self) -> f64 {
        if self.is_complex() {
            8.0
        } else {
            2.0
        }
    }
}

/// Direction of a leg (directed edge) in a tensor network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LegDirection {
    #[default]
    Undirected,
    Inward,
    Outward,
}

impl LegDirection {
    pub fn reversed(self) -> Self {
        match self {
            Self::Undirected => Self::Undirected,
            Self::Inward => Self::Outward,
            Self::Outward => Self::Inward,
        }
    }
}

/// Kind of an index in a binary tensor contraction `D = L * R`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Open index shared by the destination and the left operand only.
    Left,
    /// Open index shared by the destination and the right operand only.
    Right,
    /// Contracted index shared by the left and right operands only.
    Contracted,
    /// Hyper index present in all three operands.
    Hyper,
    /// Index present solely in the destination (destination batch).
    DestTrace,
    /// Traced index within the left operand.
    LeftTrace,
    /// Traced index within the right operand.
    RightTrace,
}

/// One step of an emitted contraction sequence: contract `left` with `right`
/// producing the intermediate `result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractionTriple {
    pub left: TensorId,
    pub right: TensorId,
    pub result: TensorId,
}

impl ContractionTriple {
    pub fn new(left: TensorId, right: TensorId, result: TensorId) -> Self {
        Self {
            left,
            right,
            result,
        }
    }
}

/// Stable-within-a-process hash used to identify tensors and network
/// topologies.
pub fn calculate_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_sizes() {
        assert_eq!(ElementType::Real32.byte_size(), 4);
        assert_eq!(ElementType::Real64.byte_size(), 8);
        assert_eq!(ElementType::Complex32.byte_size(), 8);
        assert_eq!(ElementType::Complex64.byte_size(), 16);
        assert!(ElementType::Complex64.is_complex());
        assert!(!ElementType::Real64.is_complex());
    }

    #[test]
    fn test_leg_direction_reversal() {
        assert_eq!(LegDirection::Inward.reversed(), LegDirection::Outward);
        assert_eq!(LegDirection::Outward.reversed(), LegDirection::Inward);
        assert_eq!(
            LegDirection::Undirected.reversed(),
            LegDirection::Undirected
        );
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(calculate_hash("T0"), calculate_hash("T0"));
        assert_ne!(calculate_hash("T0"), calculate_hash("T1"));
    }
}
