//! Block-decomposed (composite) tensors. Chosen dimensions are recursively
//! bisected to a given depth, producing `2^(sum of depths)` blocks that are
//! distributed over the existence domain of the tensor. A user predicate may
//! drop blocks, yielding block-sparse storage.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::tensor::{make_shared, Tensor, TensorHandle, TensorShape};
use crate::types::{DimExtent, DimId, ProcessRank};

/// Position of one block: the segment index along every split dimension, in
/// split declaration order.
pub type BlockIndex = Vec<u32>;

#[derive(Debug, Clone)]
pub struct Block {
    tensor: TensorHandle,
    segments: BlockIndex,
}

impl Block {
    pub fn tensor(&self) -> &TensorHandle {
        &self.tensor
    }

    pub fn segments(&self) -> &[u32] {
        &self.segments
    }
}

/// A tensor whose body is partitioned into blocks by recursive bisection of
/// the split dimensions.
#[derive(Debug, Clone)]
pub struct CompositeTensor {
    base: TensorHandle,
    splits: Vec<(DimId, u32)>,
    blocks: BTreeMap<u64, Block>,
}

impl CompositeTensor {
    /// Splits `base` along the given `(dimension, depth)` pairs. Every named
    /// dimension must be distinct, within rank, and large enough to be
    /// bisected `depth` times.
    pub fn new(base: Tensor, splits: Vec<(DimId, u32)>) -> Result<Self> {
        if splits.is_empty() {
            return Err(Error::Contract(format!(
                "composite tensor `{}` needs at least one split dimension",
                base.name()
            )));
        }
        let mut seen = Vec::new();
        for &(dim, depth) in &splits {
            if (dim as usize) >= base.rank() {
                return Err(Error::Contract(format!(
                    "composite tensor `{}`: split dimension {dim} exceeds rank {}",
                    base.name(),
                    base.rank()
                )));
            }
            if seen.contains(&dim) {
                return Err(Error::Contract(format!(
                    "composite tensor `{}`: dimension {dim} split twice",
                    base.name()
                )));
            }
            if base.dim_extent(dim) < (1u64 << depth) {
                return Err(Error::Contract(format!(
                    "composite tensor `{}`: dimension {dim} of extent {} cannot be bisected {depth} times",
                    base.name(),
                    base.dim_extent(dim)
                )));
            }
            seen.push(dim);
        }

        let base = make_shared(base);
        let mut composite = Self {
            base,
            splits,
            blocks: BTreeMap::new(),
        };
        for block_id in 0..composite.num_blocks() {
            let segments = composite.unpack_block_id(block_id);
            let tensor = composite.make_subtensor(block_id, &segments);
            composite.blocks.insert(
                block_id,
                Block {
                    tensor: make_shared(tensor),
                    segments,
                },
            );
        }
        Ok(composite)
    }

    /// Drops every block for which `keep` returns false (block-sparse
    /// storage).
    pub fn retain_blocks<F>(&mut self, mut keep: F)
    where
        F: FnMut(&[u32]) -> bool,
    {
        self.blocks.retain(|_, block| keep(&block.segments));
    }

    pub fn base(&self) -> &TensorHandle {
        &self.base
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn splits(&self) -> &[(DimId, u32)] {
        &self.splits
    }

    pub fn total_depth(&self) -> u32 {
        self.splits.iter().map(|&(_, d)| d).sum()
    }

    /// Number of blocks before any predicate filtering.
    pub fn num_blocks(&self) -> u64 {
        1u64 << self.total_depth()
    }

    /// Blocks surviving the predicate, in block-id order.
    pub fn blocks(&self) -> impl Iterator<Item = (u64, &Block)> {
        self.blocks.iter().map(|(&id, block)| (id, block))
    }

    pub fn block(&self, block_id: u64) -> Option<&Block> {
        self.blocks.get(&block_id)
    }

    /// True when the block survived the predicate.
    pub fn block_present(&self, block_id: u64) -> bool {
        self.blocks.contains_key(&block_id)
    }

    /// Owner rank of a block within an existence domain of `domain_size`
    /// processes. The domain size must be a power of two.
    pub fn owner_rank(&self, block_id: u64, domain_size: usize) -> Result<ProcessRank> {
        if !domain_size.is_power_of_two() {
            return Err(Error::Contract(format!(
                "existence domain of composite tensor `{}` must have a power-of-two size, got {domain_size}",
                self.name()
            )));
        }
        let num_blocks = self.num_blocks();
        let rank = if (domain_size as u64) <= num_blocks {
            block_id / (num_blocks / domain_size as u64)
        } else {
            block_id * (domain_size as u64 / num_blocks)
        };
        Ok(rank as ProcessRank)
    }

    /// Decodes a block id into per-split segment indices.
    fn unpack_block_id(&self, block_id: u64) -> BlockIndex {
        let mut segments = Vec::with_capacity(self.splits.len());
        let mut shift = self.total_depth();
        for &(_, depth) in &self.splits {
            shift -= depth;
            segments.push(((block_id >> shift) & ((1u64 << depth) - 1)) as u32);
        }
        segments
    }

    /// Packs segment indices back into a block id.
    pub fn pack_block_id(&self, segments: &[u32]) -> u64 {
        assert_eq!(segments.len(), self.splits.len());
        let mut block_id = 0u64;
        for (&(_, depth), &segment) in self.splits.iter().zip(segments) {
            block_id = (block_id << depth) | u64::from(segment);
        }
        block_id
    }

    fn make_subtensor(&self, block_id: u64, segments: &[u32]) -> Tensor {
        let mut extents: Vec<DimExtent> = self.base.shape().extents().to_vec();
        let mut signature = self.base.signature().clone();
        for (&(dim, depth), &segment) in self.splits.iter().zip(segments) {
            let (extent, offset) = segment_bounds(self.base.dim_extent(dim), depth, segment);
            extents[dim as usize] = extent;
            // The segment's base offset is recorded in the signature so that
            // INSERT/SLICE kernels can locate the block inside the full body.
            let (space, base_offset) = signature.dim_attr(dim);
            let attrs: Vec<_> = signature
                .attributes()
                .iter()
                .enumerate()
                .map(|(i, &attr)| {
                    if i == dim as usize {
                        (space, base_offset + offset)
                    } else {
                        attr
                    }
                })
                .collect();
            signature = crate::tensor::TensorSignature::new(attrs);
        }
        let name = format!("{}_{:x}", self.base.name(), block_id);
        let shape = TensorShape::new(extents).expect("block extents are positive");
        let mut tensor =
            Tensor::with_signature(&name, shape, signature).expect("ranks agree by construction");
        tensor.set_element_type(self.base.element_type());
        tensor
    }
}

/// Extent and base offset of segment `segment` of a dimension of extent
/// `extent` bisected `depth` times. Leftover elements go to the leading
/// segments, one each.
fn segment_bounds(extent: DimExtent, depth: u32, segment: u32) -> (DimExtent, DimExtent) {
    let parts = 1u64 << depth;
    let base = extent / parts;
    let leftover = extent % parts;
    let segment = u64::from(segment);
    let extent = base + u64::from(segment < leftover);
    let offset = segment * base + segment.min(leftover);
    (extent, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorShape;

    fn setup() -> CompositeTensor {
        let base = Tensor::new("T2", TensorShape::from([10, 10, 10, 10]));
        CompositeTensor::new(base, vec![(2, 1), (3, 2)]).unwrap()
    }

    #[test]
    fn test_block_count() {
        let composite = setup();
        assert_eq!(composite.total_depth(), 3);
        assert_eq!(composite.num_blocks(), 8);
        assert_eq!(composite.blocks().count(), 8);
    }

    #[test]
    fn test_block_id_round_trip() {
        let composite = setup();
        for (id, block) in composite.blocks() {
            assert_eq!(composite.pack_block_id(block.segments()), id);
        }
    }

    #[test]
    fn test_segment_extents_cover_dimension() {
        // Extent 10 at depth 2: segments 3,3,2,2.
        let extents: Vec<u64> = (0..4).map(|s| segment_bounds(10, 2, s).0).collect();
        assert_eq!(extents, vec![3, 3, 2, 2]);
        assert_eq!(extents.iter().sum::<u64>(), 10);
        // Offsets are cumulative.
        assert_eq!(segment_bounds(10, 2, 2).1, 6);
    }

    #[test]
    fn test_block_shapes() {
        let composite = setup();
        let first = composite.block(0).unwrap();
        assert_eq!(first.tensor().shape().extents(), &[10, 10, 5, 3]);
        let last = composite.block(7).unwrap();
        assert_eq!(last.tensor().shape().extents(), &[10, 10, 5, 2]);
    }

    #[test]
    fn test_block_predicate() {
        let mut composite = setup();
        composite.retain_blocks(|segments| segments[0] == 0);
        assert_eq!(composite.blocks().count(), 4);
        assert!(composite.block_present(0));
        assert!(!composite.block_present(4));
    }

    #[test]
    fn test_owner_ranks() {
        let composite = setup();
        assert_eq!(composite.owner_rank(0, 4).unwrap(), 0);
        assert_eq!(composite.owner_rank(7, 4).unwrap(), 3);
        assert_eq!(composite.owner_rank(3, 8).unwrap(), 3);
        assert!(composite.owner_rank(0, 3).is_err());
    }

    #[test]
    fn test_invalid_splits_rejected() {
        let base = Tensor::new("T", TensorShape::from([4, 4]));
        assert!(CompositeTensor::new(base.clone(), vec![(2, 1)]).is_err());
        assert!(CompositeTensor::new(base.clone(), vec![(0, 1), (0, 1)]).is_err());
        assert!(CompositeTensor::new(base, vec![(0, 3)]).is_err());
    }
}
