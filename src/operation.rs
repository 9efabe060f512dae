//! Primitive tensor operations: the closed set of opcodes, their arities and
//! output masks, and the operation object the scheduler and backends work
//! with. Higher-level requests (network evaluation, composite-tensor
//! arithmetic) decompose into lists of these.

use std::sync::Arc;

use ndarray::ArrayD;
use num_complex::Complex64;

use crate::error::{Error, Result};
use crate::process_group::ProcessGroup;
use crate::symbolic::IndexPattern;
use crate::tensor::composite::CompositeTensor;
use crate::tensor::{Tensor, TensorHandle};
use crate::types::{ElementType, IndexKind, OpId, ProcessRank};

/// The closed set of primitive tensor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Noop,
    Create,
    Destroy,
    Transform,
    Slice,
    Insert,
    Add,
    Contract,
    DecomposeSvd3,
    DecomposeSvd2,
    OrthogonalizeSvd,
    OrthogonalizeMgs,
    Fetch,
    Upload,
    Broadcast,
    Allreduce,
}

impl OpCode {
    /// Declared arity: `(number of operand slots, number of scalar slots)`.
    pub fn arity(self) -> (usize, usize) {
        match self {
            Self::Noop => (0, 0),
            Self::Create => (1, 0),
            Self::Destroy => (1, 0),
            Self::Transform => (1, 0),
            Self::Slice => (2, 0),
            Self::Insert => (2, 0),
            Self::Add => (2, 1),
            Self::Contract => (3, 2),
            Self::DecomposeSvd3 => (4, 0),
            Self::DecomposeSvd2 => (3, 0),
            Self::OrthogonalizeSvd => (1, 0),
            Self::OrthogonalizeMgs => (1, 0),
            Self::Fetch => (1, 0),
            Self::Upload => (1, 0),
            Self::Broadcast => (1, 0),
            Self::Allreduce => (1, 0),
        }
    }

    /// Bit-set marking which operand slots the operation writes.
    pub fn output_mask(self) -> u32 {
        match self {
            Self::Noop | Self::Upload => 0b0,
            Self::Create
            | Self::Destroy
            | Self::Transform
            | Self::Slice
            | Self::Insert
            | Self::Add
            | Self::Contract
            | Self::OrthogonalizeSvd
            | Self::OrthogonalizeMgs
            | Self::Fetch
            | Self::Broadcast
            | Self::Allreduce => 0b1,
            Self::DecomposeSvd2 => 0b011,
            Self::DecomposeSvd3 => 0b0111,
        }
    }

    /// True when the operation requires a symbolic index pattern.
    pub fn needs_pattern(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Contract | Self::DecomposeSvd2 | Self::DecomposeSvd3
        )
    }

    /// True for message-passing collectives.
    pub fn is_collective(self) -> bool {
        matches!(
            self,
            Self::Fetch | Self::Upload | Self::Broadcast | Self::Allreduce
        )
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Noop => "NOOP",
            Self::Create => "CREATE",
            Self::Destroy => "DESTROY",
            Self::Transform => "TRANSFORM",
            Self::Slice => "SLICE",
            Self::Insert => "INSERT",
            Self::Add => "ADD",
            Self::Contract => "CONTRACT",
            Self::DecomposeSvd3 => "DECOMPOSE_SVD3",
            Self::DecomposeSvd2 => "DECOMPOSE_SVD2",
            Self::OrthogonalizeSvd => "ORTHOGONALIZE_SVD",
            Self::OrthogonalizeMgs => "ORTHOGONALIZE_MGS",
            Self::Fetch => "FETCH",
            Self::Upload => "UPLOAD",
            Self::Broadcast => "BROADCAST",
            Self::Allreduce => "ALLREDUCE",
        };
        write!(f, "{name}")
    }
}

/// A named transformation functor applied by `TRANSFORM` operations to the
/// local body of a tensor.
pub trait TensorMethod: Send + Sync {
    fn name(&self) -> &str;

    /// Transforms the tensor body in place.
    fn apply(&self, data: &mut ArrayD<Complex64>);
}

/// Initializes every element to a constant.
pub struct InitValue(pub Complex64);

impl TensorMethod for InitValue {
    fn name(&self) -> &str {
        "init_value"
    }

    fn apply(&self, data: &mut ArrayD<Complex64>) {
        data.fill(self.0);
    }
}

/// A primitive tensor operation: opcode, operand slots, scalar slots, the
/// symbolic index pattern (parsed once) and a unique submission id.
#[derive(Clone)]
pub struct TensorOperation {
    id: OpId,
    opcode: OpCode,
    operands: Vec<Option<TensorHandle>>,
    scalars: Vec<Complex64>,
    pattern: Option<IndexPattern>,
    element_type: Option<ElementType>,
    method: Option<Arc<dyn TensorMethod>>,
    group: Option<ProcessGroup>,
    peer_rank: Option<ProcessRank>,
}

impl TensorOperation {
    pub fn new(opcode: OpCode) -> Self {
        let (num_operands, num_scalars) = opcode.arity();
        let scalars = match opcode {
            // Prefactor and accumulation weight default to one.
            OpCode::Add => vec![Complex64::new(1.0, 0.0)],
            OpCode::Contract => vec![Complex64::new(1.0, 0.0); 2],
            _ => vec![Complex64::new(0.0, 0.0); num_scalars],
        };
        Self {
            id: 0,
            opcode,
            operands: vec![None; num_operands],
            scalars,
            pattern: None,
            element_type: None,
            method: None,
            group: None,
            peer_rank: None,
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub(crate) fn assign_id(&mut self, id: OpId) {
        self.id = id;
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    pub fn num_operands_set(&self) -> usize {
        self.operands.iter().filter(|o| o.is_some()).count()
    }

    /// Binds a tensor to an operand slot.
    pub fn set_operand(&mut self, slot: usize, tensor: TensorHandle) -> Result<()> {
        let slot_ref = self.operands.get_mut(slot).ok_or_else(|| {
            Error::Contract(format!(
                "{} takes {} operands, slot {slot} does not exist",
                self.opcode,
                self.opcode.arity().0
            ))
        })?;
        *slot_ref = Some(tensor);
        Ok(())
    }

    pub fn operand(&self, slot: usize) -> Option<&TensorHandle> {
        self.operands.get(slot).and_then(|o| o.as_ref())
    }

    pub fn operands(&self) -> impl Iterator<Item = (usize, &TensorHandle)> {
        self.operands
            .iter()
            .enumerate()
            .filter_map(|(slot, o)| o.as_ref().map(|t| (slot, t)))
    }

    pub fn set_scalar(&mut self, slot: usize, value: Complex64) -> Result<()> {
        let slot_ref = self.scalars.get_mut(slot).ok_or_else(|| {
            Error::Contract(format!(
                "{} takes {} scalars, slot {slot} does not exist",
                self.opcode,
                self.opcode.arity().1
            ))
        })?;
        *slot_ref = value;
        Ok(())
    }

    pub fn scalar(&self, slot: usize) -> Complex64 {
        self.scalars[slot]
    }

    /// Parses and attaches the symbolic index pattern. Parsing happens once
    /// here; the executor reuses the parsed form.
    pub fn set_pattern(&mut self, pattern: &str) -> Result<()> {
        let parsed = IndexPattern::parse(pattern)?;
        if self.opcode == OpCode::Add {
            parsed.check_addition()?;
        }
        self.pattern = Some(parsed);
        Ok(())
    }

    pub fn pattern(&self) -> Option<&IndexPattern> {
        self.pattern.as_ref()
    }

    pub fn set_element_type(&mut self, element_type: ElementType) {
        self.element_type = Some(element_type);
    }

    pub fn element_type(&self) -> Option<ElementType> {
        self.element_type
    }

    pub fn set_method(&mut self, method: Arc<dyn TensorMethod>) {
        self.method = Some(method);
    }

    pub fn method(&self) -> Option<&Arc<dyn TensorMethod>> {
        self.method.as_ref()
    }

    pub fn set_process_group(&mut self, group: ProcessGroup) {
        self.group = Some(group);
    }

    pub fn process_group(&self) -> Option<&ProcessGroup> {
        self.group.as_ref()
    }

    pub fn set_peer_rank(&mut self, rank: ProcessRank) {
        self.peer_rank = Some(rank);
    }

    pub fn peer_rank(&self) -> Option<ProcessRank> {
        self.peer_rank
    }

    /// Dispatches this operation to a device back-end.
    pub fn accept(
        &self,
        backend: &mut dyn crate::runtime::backend::DeviceBackend,
    ) -> Result<crate::runtime::backend::SubmitStatus> {
        backend.submit(self)
    }

    /// True iff every operand slot is bound and, for operations that require
    /// one, the index pattern is present.
    pub fn is_set(&self) -> bool {
        self.num_operands_set() == self.num_operands()
            && (!self.opcode.needs_pattern() || self.pattern.is_some())
    }

    /// True when the operation writes operand `slot`.
    pub fn writes_operand(&self, slot: usize) -> bool {
        self.opcode.output_mask() & (1 << slot) != 0
    }

    /// Tensors written by this operation.
    pub fn written_tensors(&self) -> impl Iterator<Item = &TensorHandle> {
        self.operands()
            .filter(|&(slot, _)| self.writes_operand(slot))
            .map(|(_, t)| t)
    }

    /// FMA flop estimate; only contractions report a non-zero cost.
    pub fn flop_estimate(&self) -> f64 {
        if self.opcode == OpCode::Contract && self.is_set() {
            let volumes: f64 = self
                .operands()
                .map(|(_, t)| t.volume() as f64)
                .product();
            volumes.sqrt()
        } else {
            0.0
        }
    }

    /// Lowers an operation on composite tensors into block-level operations,
    /// with collectives on the inter-domain edges. `None` means the
    /// operation kind has no defined lowering for the given operand shapes.
    pub fn decompose<M: TensorMapper>(&self, mapper: &M) -> Option<Vec<TensorOperation>> {
        let composite_slots: Vec<usize> = self
            .operands()
            .filter(|(_, t)| mapper.composite_of(t).is_some())
            .map(|(slot, _)| slot)
            .collect();
        if composite_slots.is_empty() {
            return None;
        }
        match self.opcode {
            OpCode::Create | OpCode::Destroy | OpCode::Transform => {
                let composite = mapper.composite_of(self.operand(0)?)?;
                let mut ops = Vec::new();
                for (_, block) in composite.blocks() {
                    let mut op = TensorOperation::new(self.opcode);
                    op.operands[0] = Some(block.tensor().clone());
                    op.element_type = self.element_type;
                    op.method = self.method.clone();
                    op.group = self.group.clone();
                    ops.push(op);
                }
                Some(ops)
            }
            OpCode::Add => {
                let dst = mapper.composite_of(self.operand(0)?)?;
                let src = mapper.composite_of(self.operand(1)?)?;
                if dst.splits() != src.splits() || dst.num_blocks() != src.num_blocks() {
                    return None;
                }
                let mut ops = Vec::new();
                for (block_id, dst_block) in dst.blocks() {
                    let src_block = src.block(block_id)?;
                    let mut op = TensorOperation::new(OpCode::Add);
                    op.operands[0] = Some(dst_block.tensor().clone());
                    op.operands[1] = Some(src_block.tensor().clone());
                    op.scalars = self.scalars.clone();
                    op.pattern = self.pattern.clone();
                    op.group = self.group.clone();
                    ops.push(op);
                }
                Some(ops)
            }
            OpCode::Contract => {
                self.decompose_contract(mapper, &composite_slots)
            }
            // No lowering is defined for the remaining kinds.
            _ => None,
        }
    }

    /// Block-wise contraction: defined when exactly one input operand is
    /// composite and every split dimension of it is contracted away. Each
    /// block contributes an accumulative contraction; an all-reduce over the
    /// execution domain combines the partial destinations.
    fn decompose_contract<M: TensorMapper>(
        &self,
        mapper: &M,
        composite_slots: &[usize],
    ) -> Option<Vec<TensorOperation>> {
        if composite_slots != [1] && composite_slots != [2] {
            return None;
        }
        let slot = composite_slots[0];
        let composite = mapper.composite_of(self.operand(slot)?)?;
        let pattern = self.pattern.as_ref()?;
        let kinds = pattern.classify().ok()?;
        let factor = &pattern.inputs[slot - 1];
        for &(dim, _) in composite.splits() {
            let label = factor.indices.get(dim as usize)?;
            if kinds.get(label) != Some(&IndexKind::Contracted) {
                return None;
            }
        }
        let mut ops = Vec::new();
        for (_, block) in composite.blocks() {
            let mut op = TensorOperation::new(OpCode::Contract);
            op.operands = self.operands.clone();
            op.operands[slot] = Some(block.tensor().clone());
            op.scalars = self.scalars.clone();
            op.pattern = Some(pattern.clone());
            op.group = self.group.clone();
            ops.push(op);
        }
        // Partial destinations are combined across the execution domain.
        let mut reduce = TensorOperation::new(OpCode::Allreduce);
        reduce.operands[0] = self.operands[0].clone();
        reduce.group = self.group.clone();
        ops.push(reduce);
        Some(ops)
    }
}

/// Maps tensors to their composite (block-decomposed) representation during
/// operation lowering.
pub trait TensorMapper {
    fn composite_of(&self, tensor: &Tensor) -> Option<&CompositeTensor>;
}

impl std::fmt::Debug for TensorOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorOperation")
            .field("id", &self.id)
            .field("opcode", &self.opcode)
            .field(
                "operands",
                &self
                    .operands
                    .iter()
                    .map(|o| o.as_ref().map(|t| t.name().to_string()))
                    .collect::<Vec<_>>(),
            )
            .field("scalars", &self.scalars)
            .field("pattern", &self.pattern.as_ref().map(|p| p.to_string()))
            .finish()
    }
}

impl std::fmt::Display for TensorOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "TensorOperation({})[id={}]{{", self.opcode, self.id)?;
        if let Some(pattern) = &self.pattern {
            writeln!(f, " {pattern}")?;
        }
        for (_, tensor) in self.operands() {
            writeln!(f, " {tensor}")?;
        }
        if !self.scalars.is_empty() {
            writeln!(
                f,
                " {}",
                self.scalars
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            )?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{make_shared, TensorShape};
    use rustc_hash::FxHashMap;

    struct MapperStub {
        composites: FxHashMap<u64, CompositeTensor>,
    }

    impl TensorMapper for MapperStub {
        fn composite_of(&self, tensor: &Tensor) -> Option<&CompositeTensor> {
            self.composites.get(&tensor.tensor_hash())
        }
    }

    #[test]
    fn test_arity_table() {
        assert_eq!(OpCode::Contract.arity(), (3, 2));
        assert_eq!(OpCode::Add.arity(), (2, 1));
        assert_eq!(OpCode::DecomposeSvd3.arity(), (4, 0));
        assert_eq!(OpCode::Noop.arity(), (0, 0));
    }

    #[test]
    fn test_output_masks() {
        let contract = TensorOperation::new(OpCode::Contract);
        assert!(contract.writes_operand(0));
        assert!(!contract.writes_operand(1));
        let svd3 = TensorOperation::new(OpCode::DecomposeSvd3);
        assert!(svd3.writes_operand(0));
        assert!(svd3.writes_operand(1));
        assert!(svd3.writes_operand(2));
        assert!(!svd3.writes_operand(3));
        let upload = TensorOperation::new(OpCode::Upload);
        assert!(!upload.writes_operand(0));
    }

    #[test]
    fn test_is_set_requires_pattern() {
        let d = make_shared(Tensor::new("D", TensorShape::from([2, 2])));
        let l = make_shared(Tensor::new("L", TensorShape::from([2, 3])));
        let r = make_shared(Tensor::new("R", TensorShape::from([3, 2])));
        let mut op = TensorOperation::new(OpCode::Contract);
        op.set_operand(0, d).unwrap();
        op.set_operand(1, l).unwrap();
        op.set_operand(2, r).unwrap();
        assert!(!op.is_set());
        op.set_pattern("D(a,b)+=L(a,k)*R(k,b)").unwrap();
        assert!(op.is_set());
        // Default contract scalars: prefactor 1, accumulation weight 1.
        assert_eq!(op.scalar(0), Complex64::new(1.0, 0.0));
        assert_eq!(op.scalar(1), Complex64::new(1.0, 0.0));
    }

    #[test]
    fn test_contract_flop_estimate() {
        let d = make_shared(Tensor::new("D", TensorShape::from([2, 2])));
        let l = make_shared(Tensor::new("L", TensorShape::from([2, 8])));
        let r = make_shared(Tensor::new("R", TensorShape::from([8, 2])));
        let mut op = TensorOperation::new(OpCode::Contract);
        op.set_operand(0, d).unwrap();
        op.set_operand(1, l).unwrap();
        op.set_operand(2, r).unwrap();
        op.set_pattern("D(a,b)+=L(a,k)*R(k,b)").unwrap();
        assert_eq!(op.flop_estimate(), (4.0 * 16.0 * 16.0f64).sqrt());
    }

    #[test]
    fn test_decompose_create_per_block() {
        let base = Tensor::new("C", TensorShape::from([8, 8]));
        let composite = CompositeTensor::new(base.clone(), vec![(0, 1), (1, 1)]).unwrap();
        let mut composites = FxHashMap::default();
        composites.insert(base.tensor_hash(), composite);
        let mapper = MapperStub { composites };

        let mut op = TensorOperation::new(OpCode::Create);
        op.set_operand(0, make_shared(base)).unwrap();
        op.set_element_type(ElementType::Complex64);
        let lowered = op.decompose(&mapper).unwrap();
        assert_eq!(lowered.len(), 4);
        assert!(lowered.iter().all(|op| op.opcode() == OpCode::Create));
    }

    #[test]
    fn test_decompose_contract_needs_contracted_splits() {
        let base = Tensor::new("L", TensorShape::from([4, 4]));
        let composite = CompositeTensor::new(base.clone(), vec![(1, 1)]).unwrap();
        let mut composites = FxHashMap::default();
        composites.insert(base.tensor_hash(), composite);
        let mapper = MapperStub { composites };

        let d = make_shared(Tensor::new("D", TensorShape::from([4, 4])));
        let r = make_shared(Tensor::new("R", TensorShape::from([4, 4])));
        let mut op = TensorOperation::new(OpCode::Contract);
        op.set_operand(0, d.clone()).unwrap();
        op.set_operand(1, make_shared(base.clone())).unwrap();
        op.set_operand(2, r.clone()).unwrap();
        // Split dimension `k` is contracted: lowering defined.
        op.set_pattern("D(a,b)+=L(a,k)*R(k,b)").unwrap();
        let lowered = op.decompose(&mapper).unwrap();
        assert_eq!(lowered.len(), 3);
        assert_eq!(lowered.last().unwrap().opcode(), OpCode::Allreduce);

        // Split dimension `b` stays open: no lowering defined.
        let mut open_op = TensorOperation::new(OpCode::Contract);
        open_op.set_operand(0, d).unwrap();
        open_op.set_operand(1, make_shared(base)).unwrap();
        open_op.set_operand(2, r).unwrap();
        open_op.set_pattern("D(a,b)+=L(a,b)*R(a,b)").unwrap();
        assert!(open_op.decompose(&mapper).is_none());
    }

    #[test]
    fn test_noop_decompose_undefined() {
        let mapper = MapperStub {
            composites: FxHashMap::default(),
        };
        let op = TensorOperation::new(OpCode::Noop);
        assert!(op.decompose(&mapper).is_none());
    }
}
