//! Abstract tensors: shapes, signatures, isometry groups. A tensor here is a
//! symbolic handle; storage is allocated separately by a `CREATE` operation
//! on a device backend.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{
    calculate_hash, DimExtent, DimId, ElementType, SpaceId, SubspaceId, SOME_SPACE,
};

pub mod composite;

/// Ordered tuple of dimension extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorShape(Vec<DimExtent>);

impl TensorShape {
    pub fn new(extents: Vec<DimExtent>) -> Result<Self> {
        if extents.iter().any(|&e| e == 0) {
            return Err(Error::Contract(
                "tensor dimension extents must be positive".to_string(),
            ));
        }
        Ok(Self(extents))
    }

    /// The scalar shape.
    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn extent(&self, dim: DimId) -> DimExtent {
        self.0[dim as usize]
    }

    pub fn extents(&self) -> &[DimExtent] {
        &self.0
    }

    /// Total number of elements.
    pub fn volume(&self) -> DimExtent {
        self.0.iter().product()
    }

    pub(crate) fn delete_dimension(&mut self, dim: DimId) {
        self.0.remove(dim as usize);
    }

    pub(crate) fn append_dimension(&mut self, extent: DimExtent) {
        self.0.push(extent);
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, extent) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{extent}")?;
        }
        write!(f, ")")
    }
}

impl<const N: usize> From<[DimExtent; N]> for TensorShape {
    fn from(extents: [DimExtent; N]) -> Self {
        Self(extents.to_vec())
    }
}

/// Ordered tuple of `(space, subspace)` attributes, one per dimension. For
/// the anonymous space the subspace id holds the base offset instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorSignature(Vec<(SpaceId, SubspaceId)>);

impl TensorSignature {
    pub fn new(attributes: Vec<(SpaceId, SubspaceId)>) -> Self {
        Self(attributes)
    }

    /// All dimensions in the anonymous space at base offset 0.
    pub fn anonymous(rank: usize) -> Self {
        Self(vec![(SOME_SPACE, 0); rank])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dim_attr(&self, dim: DimId) -> (SpaceId, SubspaceId) {
        self.0[dim as usize]
    }

    pub fn attributes(&self) -> &[(SpaceId, SubspaceId)] {
        &self.0
    }

    /// Base offsets, meaningful for anonymous-space dimensions.
    pub fn base_offsets(&self) -> Vec<SubspaceId> {
        self.0.iter().map(|&(_, sub)| sub).collect()
    }

    pub(crate) fn delete_dimension(&mut self, dim: DimId) {
        self.0.remove(dim as usize);
    }

    pub(crate) fn append_dimension(&mut self, attr: (SpaceId, SubspaceId)) {
        self.0.push(attr);
    }
}

/// A symbolic tensor: name, shape, signature, element type and up to two
/// disjoint isometry groups. Uniquely identified within a process by the
/// stable hash of `(name, shape, signature)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    name: String,
    shape: TensorShape,
    signature: TensorSignature,
    isometries: Vec<Vec<DimId>>,
    element_type: ElementType,
}

impl Tensor {
    /// Creates a tensor with an anonymous-space signature.
    pub fn new(name: &str, shape: TensorShape) -> Self {
        let rank = shape.rank();
        Self {
            name: name.to_string(),
            shape,
            signature: TensorSignature::anonymous(rank),
            isometries: Vec::new(),
            element_type: ElementType::Real64,
        }
    }

    /// Creates a rank-0 (scalar) tensor.
    pub fn scalar(name: &str) -> Self {
        Self::new(name, TensorShape::scalar())
    }

    /// Creates a tensor with an explicit signature; ranks must agree.
    pub fn with_signature(
        name: &str,
        shape: TensorShape,
        signature: TensorSignature,
    ) -> Result<Self> {
        if shape.rank() != signature.rank() {
            return Err(Error::Contract(format!(
                "tensor `{name}`: shape rank {} does not match signature rank {}",
                shape.rank(),
                signature.rank()
            )));
        }
        Ok(Self {
            name: name.to_string(),
            shape,
            signature,
            isometries: Vec::new(),
            element_type: ElementType::Real64,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn signature(&self) -> &TensorSignature {
        &self.signature
    }

    pub fn dim_extent(&self, dim: DimId) -> DimExtent {
        self.shape.extent(dim)
    }

    pub fn volume(&self) -> DimExtent {
        self.shape.volume()
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn set_element_type(&mut self, element_type: ElementType) {
        self.element_type = element_type;
    }

    /// Declares a subset of dimensions isometric. A tensor may carry at most
    /// two isometry groups and they must be disjoint.
    pub fn register_isometry(&mut self, group: Vec<DimId>) -> Result<()> {
        if self.isometries.len() == 2 {
            return Err(Error::Contract(format!(
                "tensor `{}` already carries two isometry groups",
                self.name
            )));
        }
        if group.iter().any(|&d| (d as usize) >= self.rank()) {
            return Err(Error::Contract(format!(
                "isometry group of tensor `{}` names a dimension past rank {}",
                self.name,
                self.rank()
            )));
        }
        for existing in &self.isometries {
            if group.iter().any(|d| existing.contains(d)) {
                return Err(Error::Contract(format!(
                    "isometry groups of tensor `{}` must be disjoint",
                    self.name
                )));
            }
        }
        self.isometries.push(group);
        Ok(())
    }

    pub fn isometries(&self) -> &[Vec<DimId>] {
        &self.isometries
    }

    /// True if `dim` belongs to some isometry group.
    pub fn has_isometric_dimension(&self, dim: DimId) -> bool {
        self.isometries.iter().any(|g| g.contains(&dim))
    }

    /// Same shape and signature (name excluded).
    pub fn is_congruent_to(&self, other: &Tensor) -> bool {
        self.shape == other.shape && self.signature == other.signature
    }

    /// Stable identity hash over `(name, shape, signature)`.
    pub fn tensor_hash(&self) -> u64 {
        calculate_hash(&(&self.name, &self.shape, &self.signature))
    }

    pub(crate) fn delete_dimension(&mut self, dim: DimId) {
        assert!((dim as usize) < self.rank());
        self.shape.delete_dimension(dim);
        self.signature.delete_dimension(dim);
        // Isometry groups referring to removed or shifted dimensions are
        // dropped; isometry is not preserved under dimension deletion.
        self.isometries.clear();
    }

    pub(crate) fn append_dimension(&mut self, attr: (SpaceId, SubspaceId), extent: DimExtent) {
        self.shape.append_dimension(extent);
        self.signature.append_dimension(attr);
    }
}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tensor_hash().hash(state);
    }
}

impl std::fmt::Display for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.name, self.shape)
    }
}

/// Shared tensor handle. Networks and operations hold tensors through this.
pub type TensorHandle = Arc<Tensor>;

pub fn make_shared(tensor: Tensor) -> TensorHandle {
    Arc::new(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_volume() {
        let shape = TensorShape::from([2, 3, 4]);
        assert_eq!(shape.rank(), 3);
        assert_eq!(shape.volume(), 24);
        assert_eq!(TensorShape::scalar().volume(), 1);
    }

    #[test]
    fn test_zero_extent_rejected() {
        assert!(TensorShape::new(vec![2, 0, 4]).is_err());
    }

    #[test]
    fn test_signature_rank_mismatch() {
        let shape = TensorShape::from([2, 2]);
        let signature = TensorSignature::new(vec![(1, 5)]);
        assert!(Tensor::with_signature("T", shape, signature).is_err());
    }

    #[test]
    fn test_tensor_hash_identity() {
        let a = Tensor::new("T0", TensorShape::from([2, 2]));
        let b = Tensor::new("T0", TensorShape::from([2, 2]));
        let c = Tensor::new("T0", TensorShape::from([2, 3]));
        assert_eq!(a.tensor_hash(), b.tensor_hash());
        assert_ne!(a.tensor_hash(), c.tensor_hash());
    }

    #[test]
    fn test_isometry_groups_disjoint() {
        let mut t = Tensor::new("U", TensorShape::from([2, 2, 2, 2]));
        t.register_isometry(vec![0, 1]).unwrap();
        assert!(t.register_isometry(vec![1, 2]).is_err());
        t.register_isometry(vec![2, 3]).unwrap();
        assert!(t.register_isometry(vec![]).is_err());
        assert!(t.has_isometric_dimension(3));
    }

    #[test]
    fn test_congruence_ignores_name() {
        let a = Tensor::new("A", TensorShape::from([2, 4]));
        let b = Tensor::new("B", TensorShape::from([2, 4]));
        assert!(a.is_congruent_to(&b));
    }

    #[test]
    fn test_delete_dimension() {
        let mut t = Tensor::new("T", TensorShape::from([2, 3, 4]));
        t.delete_dimension(1);
        assert_eq!(t.shape().extents(), &[2, 4]);
        assert_eq!(t.signature().rank(), 2);
    }
}
