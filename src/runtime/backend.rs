//! Device back-end interface and the bundled dense CPU reference back-end.
//! Back-ends expose an asynchronous submit/poll surface: submission returns
//! an execution handle (or defers on resource exhaustion) and the executor
//! polls handles for completion. Kernel failures are reported through the
//! completion record, never by panicking the pump.

use ndarray::{ArrayD, Dimension, IxDyn};
use ndarray_linalg::SVD;
use num_complex::Complex64;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{Error, Result};
use crate::operation::{OpCode, TensorOperation};
use crate::symbolic::PatternFactor;
use crate::tensor::Tensor;
use crate::types::IndexKind;

/// Handle to an in-flight back-end execution.
pub type ExecHandle = u64;

/// Outcome of submitting an operation to a back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// The operation is in flight under the returned handle.
    Accepted(ExecHandle),
    /// The device pool cannot take the operation right now; retry after
    /// in-flight work retires.
    Deferred,
}

/// Completion state of an execution handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Pending,
    Done,
    /// Non-zero kernel status.
    Failed(i32),
}

pub const STATUS_MISSING_STORAGE: i32 = 1;
pub const STATUS_SHAPE_MISMATCH: i32 = 2;
pub const STATUS_LINALG: i32 = 3;
pub const STATUS_UNSUPPORTED: i32 = 4;
pub const STATUS_MISSING_METHOD: i32 = 5;

/// Default number of operations kept in flight by the executor.
pub const DEFAULT_PIPELINE_DEPTH: usize = 16;
/// Default number of upcoming operations whose operands are pre-staged.
pub const DEFAULT_PREFETCH_DEPTH: usize = 4;

/// A compute device executing primitive tensor operations.
pub trait DeviceBackend: Send {
    fn name(&self) -> &str;

    /// Submits one operation. Contract violations have been filtered out by
    /// the engine; kernel failures surface through the completion record.
    fn submit(&mut self, op: &TensorOperation) -> Result<SubmitStatus>;

    /// Polls an execution handle.
    fn poll(&mut self, handle: ExecHandle) -> Completion;

    /// Pre-stages a tensor for an upcoming operation. Optional.
    fn prefetch(&mut self, _tensor: &Tensor) {}

    /// Pipeline depth the executor should use with this back-end.
    fn preferred_pipeline_depth(&self) -> usize {
        DEFAULT_PIPELINE_DEPTH
    }

    /// Copies out the stored body of a tensor, if resident.
    fn tensor_data(&self, tensor_hash: u64) -> Option<ArrayD<Complex64>>;

    /// Replaces the stored body of a tensor (imports and tests).
    fn set_tensor_data(&mut self, tensor_hash: u64, data: ArrayD<Complex64>);

    /// Releases the storage of a tensor. Used by the garbage collector.
    fn free_tensor(&mut self, tensor_hash: u64);

    /// Bytes currently allocated on the device.
    fn memory_in_use(&self) -> usize;
}

/// Registry of named back-ends with one active selection. Switching applies
/// to subsequently submitted work only.
pub struct BackendRegistry {
    backends: FxHashMap<String, Box<dyn DeviceBackend>>,
    active: String,
}

impl BackendRegistry {
    /// Creates a registry holding the dense reference back-end under the
    /// name `"default"`.
    pub fn with_default() -> Self {
        let mut backends: FxHashMap<String, Box<dyn DeviceBackend>> = FxHashMap::default();
        backends.insert(
            "default".to_string(),
            Box::new(DenseBackend::new()) as Box<dyn DeviceBackend>,
        );
        Self {
            backends,
            active: "default".to_string(),
        }
    }

    pub fn register(&mut self, name: &str, backend: Box<dyn DeviceBackend>) -> Result<()> {
        if self.backends.contains_key(name) {
            return Err(Error::Duplicate {
                kind: "backend",
                name: name.to_string(),
            });
        }
        self.backends.insert(name.to_string(), backend);
        Ok(())
    }

    /// Selects the active back-end by name.
    pub fn select(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(Error::RegistryMiss {
                kind: "backend",
                name: name.to_string(),
            });
        }
        self.active = name.to_string();
        Ok(())
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    pub fn active(&self) -> &dyn DeviceBackend {
        self.backends[&self.active].as_ref()
    }

    pub fn active_mut(&mut self) -> &mut (dyn DeviceBackend + 'static) {
        self.backends.get_mut(&self.active).unwrap().as_mut()
    }
}

/// Dense CPU reference back-end. Tensor bodies are stored as
/// `ArrayD<Complex64>` regardless of the declared element type; execution is
/// synchronous behind the asynchronous submit/poll surface. Allocations are
/// tracked against an optional byte budget so that the executor's deferral
/// path is honored.
pub struct DenseBackend {
    storage: FxHashMap<u64, ArrayD<Complex64>>,
    completions: FxHashMap<ExecHandle, Completion>,
    prefetched: FxHashSet<u64>,
    next_handle: ExecHandle,
    pool_capacity: Option<usize>,
    bytes_used: usize,
}

impl Default for DenseBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DenseBackend {
    pub fn new() -> Self {
        Self {
            storage: FxHashMap::default(),
            completions: FxHashMap::default(),
            prefetched: FxHashSet::default(),
            next_handle: 1,
            pool_capacity: None,
            bytes_used: 0,
        }
    }

    /// Caps the device pool at `capacity` bytes.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    fn byte_size(tensor: &Tensor) -> usize {
        tensor.volume() as usize * std::mem::size_of::<Complex64>()
    }

    fn finish(&mut self, status: i32) -> SubmitStatus {
        let handle = self.next_handle;
        self.next_handle += 1;
        let completion = if status == 0 {
            Completion::Done
        } else {
            Completion::Failed(status)
        };
        self.completions.insert(handle, completion);
        SubmitStatus::Accepted(handle)
    }

    fn execute(&mut self, op: &TensorOperation) -> i32 {
        match op.opcode() {
            OpCode::Noop => 0,
            OpCode::Create => self.run_create(op),
            OpCode::Destroy => self.run_destroy(op),
            OpCode::Transform => self.run_transform(op),
            OpCode::Add => self.run_add(op),
            OpCode::Contract => self.run_contract(op),
            OpCode::Slice => self.run_slice(op),
            OpCode::Insert => self.run_insert(op),
            OpCode::DecomposeSvd2 => self.run_svd2(op),
            OpCode::DecomposeSvd3 => self.run_svd3(op),
            OpCode::OrthogonalizeSvd => self.run_orthogonalize_svd(op),
            OpCode::OrthogonalizeMgs => self.run_orthogonalize_mgs(op),
            // Single-process reference semantics: the data is already
            // resident everywhere it needs to be.
            OpCode::Fetch | OpCode::Upload | OpCode::Broadcast | OpCode::Allreduce => {
                let tensor = op.operand(0).unwrap();
                if self.storage.contains_key(&tensor.tensor_hash()) {
                    0
                } else {
                    STATUS_MISSING_STORAGE
                }
            }
        }
    }

    fn run_create(&mut self, op: &TensorOperation) -> i32 {
        let tensor = op.operand(0).unwrap();
        let shape: Vec<usize> = tensor.shape().extents().iter().map(|&e| e as usize).collect();
        self.bytes_used += Self::byte_size(tensor);
        if let Some(old) = self
            .storage
            .insert(tensor.tensor_hash(), ArrayD::zeros(IxDyn(&shape)))
        {
            self.bytes_used -= old.len() * std::mem::size_of::<Complex64>();
        }
        0
    }

    fn run_destroy(&mut self, op: &TensorOperation) -> i32 {
        let tensor = op.operand(0).unwrap();
        match self.storage.remove(&tensor.tensor_hash()) {
            Some(data) => {
                self.bytes_used -= data.len() * std::mem::size_of::<Complex64>();
                0
            }
            None => STATUS_MISSING_STORAGE,
        }
    }

    fn run_transform(&mut self, op: &TensorOperation) -> i32 {
        let tensor = op.operand(0).unwrap();
        let Some(method) = op.method() else {
            return STATUS_MISSING_METHOD;
        };
        match self.storage.get_mut(&tensor.tensor_hash()) {
            Some(data) => {
                method.apply(data);
                0
            }
            None => STATUS_MISSING_STORAGE,
        }
    }

    fn run_add(&mut self, op: &TensorOperation) -> i32 {
        let dst = op.operand(0).unwrap();
        let src = op.operand(1).unwrap();
        let pattern = op.pattern().unwrap();
        let alpha = op.scalar(0);
        let Some(src_data) = self.storage.get(&src.tensor_hash()).cloned() else {
            return STATUS_MISSING_STORAGE;
        };
        let src_view = FactorView::new(
            &src_data,
            &pattern.inputs[0],
            src.signature().base_offsets(),
        );
        let dst_offsets = dst.signature().base_offsets();
        let Some(dst_data) = self.storage.get_mut(&dst.tensor_hash()) else {
            return STATUS_MISSING_STORAGE;
        };
        if dst_data.ndim() != pattern.output.rank() || src_view.rank() != src.rank() {
            return STATUS_SHAPE_MISMATCH;
        }
        let accumulative = pattern.accumulative;
        let labels = pattern.output.indices.clone();
        for (idx, value) in dst_data.indexed_iter_mut() {
            let mut coords = FxHashMap::default();
            for (axis, label) in labels.iter().enumerate() {
                coords.insert(label.as_str(), idx[axis] as u64 + dst_offsets[axis]);
            }
            let incoming = src_view.element(&coords).map(|v| alpha * v);
            match (accumulative, incoming) {
                (true, Some(v)) => *value += v,
                (true, None) => {}
                (false, Some(v)) => *value = v,
                (false, None) => *value = Complex64::new(0.0, 0.0),
            }
        }
        0
    }

    fn run_contract(&mut self, op: &TensorOperation) -> i32 {
        let dst = op.operand(0).unwrap();
        let left = op.operand(1).unwrap();
        let right = op.operand(2).unwrap();
        let pattern = op.pattern().unwrap();
        let alpha = op.scalar(0);
        let beta = op.scalar(1);
        let Ok(kinds) = pattern.classify() else {
            return STATUS_UNSUPPORTED;
        };

        let (Some(left_data), Some(right_data)) = (
            self.storage.get(&left.tensor_hash()).cloned(),
            self.storage.get(&right.tensor_hash()).cloned(),
        ) else {
            return STATUS_MISSING_STORAGE;
        };
        let left_view = FactorView::new(
            &left_data,
            &pattern.inputs[0],
            left.signature().base_offsets(),
        );
        let right_view = FactorView::new(
            &right_data,
            &pattern.inputs[1],
            right.signature().base_offsets(),
        );
        // Sum over traced labels up front.
        let left_view = left_view.sum_traces(&kinds, IndexKind::LeftTrace);
        let right_view = right_view.sum_traces(&kinds, IndexKind::RightTrace);

        // Global iteration windows of the contracted labels.
        let mut contracted: Vec<(&str, std::ops::Range<u64>)> = Vec::new();
        for (label, kind) in &kinds {
            if *kind == IndexKind::Contracted {
                let Some(window) = left_view
                    .window(label)
                    .and_then(|l| right_view.window(label).map(|r| overlap(l, r)))
                else {
                    return STATUS_SHAPE_MISMATCH;
                };
                contracted.push((label.as_str(), window));
            }
        }
        contracted.sort_by_key(|(label, _)| label.to_string());

        let dst_offsets = dst.signature().base_offsets();
        let labels = pattern.output.indices.clone();
        let accumulative = pattern.accumulative;
        let Some(dst_data) = self.storage.get_mut(&dst.tensor_hash()) else {
            return STATUS_MISSING_STORAGE;
        };
        if dst_data.ndim() != labels.len() {
            return STATUS_SHAPE_MISMATCH;
        }

        for (idx, value) in dst_data.indexed_iter_mut() {
            let mut coords: FxHashMap<&str, u64> = FxHashMap::default();
            for (axis, label) in labels.iter().enumerate() {
                coords.insert(label.as_str(), idx[axis] as u64 + dst_offsets[axis]);
            }
            let mut sum = Complex64::new(0.0, 0.0);
            let mut cursor = vec![0u64; contracted.len()];
            'sum: loop {
                for (slot, (label, window)) in contracted.iter().enumerate() {
                    coords.insert(*label, window.start + cursor[slot]);
                }
                if let (Some(l), Some(r)) =
                    (left_view.element(&coords), right_view.element(&coords))
                {
                    sum += l * r;
                }
                // Advance the odometer over the contracted windows.
                for slot in (0..contracted.len()).rev() {
                    let extent = contracted[slot].1.end - contracted[slot].1.start;
                    cursor[slot] += 1;
                    if cursor[slot] < extent {
                        continue 'sum;
                    }
                    cursor[slot] = 0;
                }
                break;
            }
            let contribution = alpha * sum;
            if accumulative {
                *value = beta * *value + contribution;
            } else {
                *value = contribution;
            }
        }
        0
    }

    fn run_slice(&mut self, op: &TensorOperation) -> i32 {
        let slice = op.operand(0).unwrap();
        let full = op.operand(1).unwrap();
        if slice.rank() != full.rank() {
            return STATUS_SHAPE_MISMATCH;
        }
        let Some(full_data) = self.storage.get(&full.tensor_hash()).cloned() else {
            return STATUS_MISSING_STORAGE;
        };
        let slice_offsets = slice.signature().base_offsets();
        let full_offsets = full.signature().base_offsets();
        let Some(slice_data) = self.storage.get_mut(&slice.tensor_hash()) else {
            return STATUS_MISSING_STORAGE;
        };
        for (idx, value) in slice_data.indexed_iter_mut() {
            let mut src = Vec::with_capacity(idx.ndim());
            for axis in 0..idx.ndim() {
                let global = idx[axis] as u64 + slice_offsets[axis];
                if global < full_offsets[axis] {
                    return STATUS_SHAPE_MISMATCH;
                }
                src.push((global - full_offsets[axis]) as usize);
            }
            match full_data.get(IxDyn(&src)) {
                Some(v) => *value = *v,
                None => return STATUS_SHAPE_MISMATCH,
            }
        }
        0
    }

    fn run_insert(&mut self, op: &TensorOperation) -> i32 {
        let full = op.operand(0).unwrap();
        let slice = op.operand(1).unwrap();
        if slice.rank() != full.rank() {
            return STATUS_SHAPE_MISMATCH;
        }
        let Some(slice_data) = self.storage.get(&slice.tensor_hash()).cloned() else {
            return STATUS_MISSING_STORAGE;
        };
        let slice_offsets = slice.signature().base_offsets();
        let full_offsets = full.signature().base_offsets();
        let Some(full_data) = self.storage.get_mut(&full.tensor_hash()) else {
            return STATUS_MISSING_STORAGE;
        };
        for (idx, value) in slice_data.indexed_iter() {
            let mut dst = Vec::with_capacity(idx.ndim());
            for axis in 0..idx.ndim() {
                let global = idx[axis] as u64 + slice_offsets[axis];
                if global < full_offsets[axis] {
                    return STATUS_SHAPE_MISMATCH;
                }
                dst.push((global - full_offsets[axis]) as usize);
            }
            match full_data.get_mut(IxDyn(&dst)) {
                Some(v) => *v = *value,
                None => return STATUS_SHAPE_MISMATCH,
            }
        }
        0
    }

    /// `D = L * R` via SVD of the matricized destination. The contracted
    /// labels between L and R span the singular dimension; `sqrt(sigma)` is
    /// absorbed into both factors.
    fn run_svd2(&mut self, op: &TensorOperation) -> i32 {
        let pattern = op.pattern().unwrap().clone();
        let d = op.operand(2).unwrap().clone();
        self.run_decomposition(op, &pattern, &d, None)
    }

    /// `D = L * S * R` with the singular values in the middle factor and
    /// isometric side factors.
    fn run_svd3(&mut self, op: &TensorOperation) -> i32 {
        let pattern = op.pattern().unwrap();
        if pattern.inputs.len() != 3 {
            return STATUS_UNSUPPORTED;
        }
        // Reduce to the binary form D = L * R for classification, keeping
        // the middle factor's labels as the singular dimensions.
        let mut binary = pattern.clone();
        let middle = binary.inputs.remove(1);
        let d = op.operand(3).unwrap().clone();
        self.run_decomposition(op, &binary, &d, Some(middle))
    }

    /// Shared SVD decomposition driver. `middle` carries the explicit
    /// singular-value factor of a three-way decomposition.
    fn run_decomposition(
        &mut self,
        op: &TensorOperation,
        pattern: &crate::symbolic::IndexPattern,
        d_tensor: &Tensor,
        middle: Option<PatternFactor>,
    ) -> i32 {
        let Ok(kinds) = pattern.classify() else {
            return STATUS_UNSUPPORTED;
        };
        let left_factor = &pattern.inputs[0];
        let right_factor = &pattern.inputs[1];
        // Singular labels: shared by both side factors (middle factor labels
        // for SVD3, plain contracted labels for SVD2).
        let bond_labels: Vec<String> = match &middle {
            Some(mid) => mid.indices.clone(),
            None => match pattern.contracted_labels() {
                Ok(labels) => labels,
                Err(_) => return STATUS_UNSUPPORTED,
            },
        };
        let Some(d_data) = self.storage.get(&d_tensor.tensor_hash()).cloned() else {
            return STATUS_MISSING_STORAGE;
        };

        // Row labels: D labels owned by the left factor; columns: the rest.
        let d_labels = &pattern.output.indices;
        let mut row_axes = Vec::new();
        let mut col_axes = Vec::new();
        for (axis, label) in d_labels.iter().enumerate() {
            match kinds.get(label) {
                Some(IndexKind::Left) | Some(IndexKind::Hyper) => row_axes.push(axis),
                _ => col_axes.push(axis),
            }
        }
        let matrix = matricize(&d_data, &row_axes, &col_axes);
        let (u, sigma, vt) = match matrix.svd(true, true) {
            Ok((Some(u), sigma, Some(vt))) => (u, sigma, vt),
            _ => return STATUS_LINALG,
        };
        let rank = sigma.len();

        let left = op.operand(0).unwrap().clone();
        let bond_volume: usize = bond_labels
            .iter()
            .map(|label| {
                left_factor
                    .position(label)
                    .map(|axis| left.dim_extent(axis as u32) as usize)
                    .unwrap_or(1)
            })
            .product();
        if bond_volume < rank.min(u.nrows().min(vt.ncols())) && middle.is_none() {
            return STATUS_SHAPE_MISMATCH;
        }

        // Scale factors: sqrt(sigma) on both sides for SVD2, the singular
        // values go to the middle factor for SVD3.
        let (left_scale, right_scale): (Vec<f64>, Vec<f64>) = if middle.is_some() {
            (vec![1.0; rank], vec![1.0; rank])
        } else {
            let roots: Vec<f64> = sigma.iter().map(|s| s.sqrt()).collect();
            (roots.clone(), roots)
        };

        let status = self.fill_side_factor(
            &left,
            left_factor,
            d_labels,
            &kinds,
            &bond_labels,
            &u,
            &left_scale,
            true,
        );
        if status != 0 {
            return status;
        }
        let right = op.operand(if middle.is_some() { 2 } else { 1 }).unwrap().clone();
        let status = self.fill_side_factor(
            &right,
            right_factor,
            d_labels,
            &kinds,
            &bond_labels,
            &vt,
            &right_scale,
            false,
        );
        if status != 0 {
            return status;
        }

        if middle.is_some() {
            let s_tensor = op.operand(1).unwrap().clone();
            let shape: Vec<usize> = s_tensor
                .shape()
                .extents()
                .iter()
                .map(|&e| e as usize)
                .collect();
            let mut s_data = ArrayD::zeros(IxDyn(&shape));
            for (flat, value) in sigma.iter().enumerate().take(rank) {
                let Some(idx) = unflatten(flat, &shape) else {
                    break;
                };
                s_data[IxDyn(&idx)] = Complex64::new(*value, 0.0);
            }
            self.set_tensor_data(s_tensor.tensor_hash(), s_data);
        }
        0
    }

    /// Writes one side factor of a decomposition from the corresponding
    /// singular-vector matrix. Open axes follow the destination's ordering;
    /// the bond axes enumerate singular values in flattened order.
    #[allow(clippy::too_many_arguments)]
    fn fill_side_factor(
        &mut self,
        tensor: &Tensor,
        factor: &PatternFactor,
        d_labels: &[String],
        kinds: &FxHashMap<String, IndexKind>,
        bond_labels: &[String],
        vectors: &ndarray::Array2<Complex64>,
        scale: &[f64],
        is_left: bool,
    ) -> i32 {
        let shape: Vec<usize> = tensor.shape().extents().iter().map(|&e| e as usize).collect();
        if shape.len() != factor.rank() {
            return STATUS_SHAPE_MISMATCH;
        }
        // Axes of the factor: open (ordered as in D) and bond.
        let open_labels: Vec<&String> = d_labels
            .iter()
            .filter(|label| {
                factor.position(label).is_some()
                    && !bond_labels.contains(label)
                    && kinds.get(*label) != Some(&IndexKind::Contracted)
            })
            .collect();
        let bond_axes: Vec<usize> = bond_labels
            .iter()
            .filter_map(|label| factor.position(label))
            .collect();
        let bond_extents: Vec<usize> = bond_axes.iter().map(|&a| shape[a]).collect();

        let mut data = ArrayD::zeros(IxDyn(&shape));
        let rank = scale.len();
        for (idx_flat, value) in data.indexed_iter_mut() {
            // Open coordinate -> row/column of the vector matrix.
            let mut open_flat = 0usize;
            for label in &open_labels {
                let axis = factor.position(label).unwrap();
                open_flat = open_flat * shape[axis] + idx_flat[axis];
            }
            // Bond coordinate -> singular value index.
            let mut bond_flat = 0usize;
            for (slot, &axis) in bond_axes.iter().enumerate() {
                bond_flat = bond_flat * bond_extents[slot] + idx_flat[axis];
            }
            if bond_flat >= rank {
                continue;
            }
            let element = if is_left {
                vectors[(open_flat, bond_flat)]
            } else {
                vectors[(bond_flat, open_flat)]
            };
            *value = element * scale[bond_flat];
        }
        self.set_tensor_data(tensor.tensor_hash(), data);
        0
    }

    /// Replaces the tensor by the nearest isometry `U * V^H` of its
    /// matricization; the isometric dimensions span the columns.
    fn run_orthogonalize_svd(&mut self, op: &TensorOperation) -> i32 {
        let tensor = op.operand(0).unwrap();
        if tensor.rank() == 0 {
            return STATUS_SHAPE_MISMATCH;
        }
        let Some(data) = self.storage.get(&tensor.tensor_hash()).cloned() else {
            return STATUS_MISSING_STORAGE;
        };
        let (row_axes, col_axes) = orthogonalization_split(tensor);
        let matrix = matricize(&data, &row_axes, &col_axes);
        let isometry = match matrix.svd(true, true) {
            Ok((Some(u), _, Some(vt))) => u.dot(&vt),
            _ => return STATUS_LINALG,
        };
        let restored = unmatricize(&isometry, &data, &row_axes, &col_axes);
        self.storage.insert(tensor.tensor_hash(), restored);
        0
    }

    /// Orthonormalizes the columns of the matricization by modified
    /// Gram-Schmidt.
    fn run_orthogonalize_mgs(&mut self, op: &TensorOperation) -> i32 {
        let tensor = op.operand(0).unwrap();
        if tensor.rank() == 0 {
            return STATUS_SHAPE_MISMATCH;
        }
        let Some(data) = self.storage.get(&tensor.tensor_hash()).cloned() else {
            return STATUS_MISSING_STORAGE;
        };
        let (row_axes, col_axes) = orthogonalization_split(tensor);
        let mut matrix = matricize(&data, &row_axes, &col_axes);
        let cols = matrix.ncols();
        for j in 0..cols {
            for i in 0..j {
                let projection: Complex64 = (0..matrix.nrows())
                    .map(|r| matrix[(r, i)].conj() * matrix[(r, j)])
                    .sum();
                for r in 0..matrix.nrows() {
                    let correction = projection * matrix[(r, i)];
                    matrix[(r, j)] -= correction;
                }
            }
            let norm: f64 = (0..matrix.nrows())
                .map(|r| matrix[(r, j)].norm_sqr())
                .sum::<f64>()
                .sqrt();
            if norm > 0.0 {
                for r in 0..matrix.nrows() {
                    matrix[(r, j)] /= Complex64::new(norm, 0.0);
                }
            }
        }
        let restored = unmatricize(&matrix, &data, &row_axes, &col_axes);
        self.storage.insert(tensor.tensor_hash(), restored);
        0
    }
}

impl DeviceBackend for DenseBackend {
    fn name(&self) -> &str {
        "default"
    }

    fn submit(&mut self, op: &TensorOperation) -> Result<SubmitStatus> {
        debug_assert!(op.is_set() || op.opcode() == OpCode::Noop);
        if op.opcode() == OpCode::Create {
            let required = Self::byte_size(op.operand(0).unwrap());
            if let Some(capacity) = self.pool_capacity {
                if required > capacity {
                    return Err(Error::ResourceExhausted { required, capacity });
                }
                if self.bytes_used + required > capacity {
                    return Ok(SubmitStatus::Deferred);
                }
            }
        }
        let status = self.execute(op);
        Ok(self.finish(status))
    }

    fn poll(&mut self, handle: ExecHandle) -> Completion {
        self.completions
            .remove(&handle)
            .unwrap_or(Completion::Pending)
    }

    fn prefetch(&mut self, tensor: &Tensor) {
        self.prefetched.insert(tensor.tensor_hash());
    }

    fn tensor_data(&self, tensor_hash: u64) -> Option<ArrayD<Complex64>> {
        self.storage.get(&tensor_hash).cloned()
    }

    fn set_tensor_data(&mut self, tensor_hash: u64, data: ArrayD<Complex64>) {
        let bytes = data.len() * std::mem::size_of::<Complex64>();
        if let Some(old) = self.storage.insert(tensor_hash, data) {
            self.bytes_used -= old.len() * std::mem::size_of::<Complex64>();
        }
        self.bytes_used += bytes;
    }

    fn free_tensor(&mut self, tensor_hash: u64) {
        if let Some(data) = self.storage.remove(&tensor_hash) {
            self.bytes_used -= data.len() * std::mem::size_of::<Complex64>();
        }
        self.prefetched.remove(&tensor_hash);
    }

    fn memory_in_use(&self) -> usize {
        self.bytes_used
    }
}

/// View of one pattern factor over its stored data: labels per axis, base
/// offsets from the signature and the conjugation flag.
struct FactorView<'a> {
    data: std::borrow::Cow<'a, ArrayD<Complex64>>,
    labels: Vec<String>,
    offsets: Vec<u64>,
    conjugated: bool,
}

impl<'a> FactorView<'a> {
    fn new(data: &'a ArrayD<Complex64>, factor: &PatternFactor, offsets: Vec<u64>) -> Self {
        Self {
            data: std::borrow::Cow::Borrowed(data),
            labels: factor.indices.clone(),
            offsets,
            conjugated: factor.conjugated,
        }
    }

    fn rank(&self) -> usize {
        self.labels.len()
    }

    /// Global coordinate window of a label, if present.
    fn window(&self, label: &str) -> Option<std::ops::Range<u64>> {
        let axis = self.labels.iter().position(|l| l == label)?;
        let start = self.offsets[axis];
        Some(start..start + self.data.shape()[axis] as u64)
    }

    /// Element at a global coordinate assignment; `None` when any coordinate
    /// falls outside this factor's window.
    fn element(&self, coords: &FxHashMap<&str, u64>) -> Option<Complex64> {
        let mut idx = Vec::with_capacity(self.labels.len());
        for (axis, label) in self.labels.iter().enumerate() {
            let &global = coords.get(label.as_str())?;
            let local = global.checked_sub(self.offsets[axis])?;
            if local >= self.data.shape()[axis] as u64 {
                return None;
            }
            idx.push(local as usize);
        }
        let value = self.data[IxDyn(&idx)];
        Some(if self.conjugated { value.conj() } else { value })
    }

    /// Sums out every label of the given trace kind.
    fn sum_traces(
        mut self,
        kinds: &FxHashMap<String, IndexKind>,
        trace_kind: IndexKind,
    ) -> FactorView<'a> {
        loop {
            let Some(axis) = self
                .labels
                .iter()
                .position(|label| kinds.get(label) == Some(&trace_kind))
            else {
                return self;
            };
            let reduced = self.data.sum_axis(ndarray::Axis(axis));
            self.data = std::borrow::Cow::Owned(reduced);
            self.labels.remove(axis);
            self.offsets.remove(axis);
        }
    }
}

fn overlap(a: std::ops::Range<u64>, b: std::ops::Range<u64>) -> std::ops::Range<u64> {
    a.start.max(b.start)..a.end.min(b.end)
}

/// Reshapes `data` into a matrix with the given row and column axes.
fn matricize(
    data: &ArrayD<Complex64>,
    row_axes: &[usize],
    col_axes: &[usize],
) -> ndarray::Array2<Complex64> {
    let rows: usize = row_axes.iter().map(|&a| data.shape()[a]).product();
    let cols: usize = col_axes.iter().map(|&a| data.shape()[a]).product();
    let mut matrix = ndarray::Array2::zeros((rows.max(1), cols.max(1)));
    for (idx, &value) in data.indexed_iter() {
        let mut row = 0usize;
        for &axis in row_axes {
            row = row * data.shape()[axis] + idx[axis];
        }
        let mut col = 0usize;
        for &axis in col_axes {
            col = col * data.shape()[axis] + idx[axis];
        }
        matrix[(row, col)] = value;
    }
    matrix
}

/// Inverse of [`matricize`] against a reference layout.
fn unmatricize(
    matrix: &ndarray::Array2<Complex64>,
    reference: &ArrayD<Complex64>,
    row_axes: &[usize],
    col_axes: &[usize],
) -> ArrayD<Complex64> {
    let mut data = ArrayD::zeros(reference.raw_dim());
    for (idx, value) in data.indexed_iter_mut() {
        let mut row = 0usize;
        for &axis in row_axes {
            row = row * reference.shape()[axis] + idx[axis];
        }
        let mut col = 0usize;
        for &axis in col_axes {
            col = col * reference.shape()[axis] + idx[axis];
        }
        *value = matrix[(row, col)];
    }
    data
}

/// Row/column split for orthogonalization: the first isometry group spans
/// the columns; without one, the last dimension does.
fn orthogonalization_split(tensor: &Tensor) -> (Vec<usize>, Vec<usize>) {
    let rank = tensor.rank();
    let col_set: Vec<usize> = match tensor.isometries().first() {
        Some(group) => group.iter().map(|&d| d as usize).collect(),
        None => vec![rank - 1],
    };
    let rows = (0..rank).filter(|a| !col_set.contains(a)).collect();
    (rows, col_set)
}

/// Unflattens a row-major flat index over `shape`; `None` when out of range.
fn unflatten(flat: usize, shape: &[usize]) -> Option<Vec<usize>> {
    let volume: usize = shape.iter().product();
    if flat >= volume {
        return None;
    }
    let mut idx = vec![0usize; shape.len()];
    let mut rest = flat;
    for (axis, &extent) in shape.iter().enumerate().rev() {
        idx[axis] = rest % extent;
        rest /= extent;
    }
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::InitValue;
    use crate::tensor::{make_shared, TensorHandle, TensorShape};
    use float_cmp::approx_eq;
    use std::sync::Arc;

    fn tensor(name: &str, extents: &[u64]) -> TensorHandle {
        make_shared(Tensor::new(name, TensorShape::new(extents.to_vec()).unwrap()))
    }

    fn run(backend: &mut DenseBackend, op: &TensorOperation) {
        match backend.submit(op).unwrap() {
            SubmitStatus::Accepted(handle) => {
                assert_eq!(backend.poll(handle), Completion::Done, "{op:?}");
            }
            SubmitStatus::Deferred => panic!("unexpected deferral"),
        }
    }

    fn create_ones(backend: &mut DenseBackend, t: &TensorHandle) {
        let mut create = TensorOperation::new(OpCode::Create);
        create.set_operand(0, t.clone()).unwrap();
        run(backend, &create);
        let mut init = TensorOperation::new(OpCode::Transform);
        init.set_operand(0, t.clone()).unwrap();
        init.set_method(Arc::new(InitValue(Complex64::new(1.0, 0.0))));
        run(backend, &init);
    }

    #[test]
    fn test_create_transform_destroy() {
        let mut backend = DenseBackend::new();
        let t = tensor("T", &[2, 3]);
        create_ones(&mut backend, &t);
        let data = backend.tensor_data(t.tensor_hash()).unwrap();
        assert_eq!(data.len(), 6);
        assert!(data.iter().all(|v| *v == Complex64::new(1.0, 0.0)));
        assert_eq!(backend.memory_in_use(), 6 * 16);

        let mut destroy = TensorOperation::new(OpCode::Destroy);
        destroy.set_operand(0, t.clone()).unwrap();
        run(&mut backend, &destroy);
        assert!(backend.tensor_data(t.tensor_hash()).is_none());
        assert_eq!(backend.memory_in_use(), 0);
    }

    #[test]
    fn test_contract_matrix_product() {
        let mut backend = DenseBackend::new();
        let d = tensor("D", &[2, 2]);
        let l = tensor("L", &[2, 3]);
        let r = tensor("R", &[3, 2]);
        create_ones(&mut backend, &l);
        create_ones(&mut backend, &r);
        let mut create_d = TensorOperation::new(OpCode::Create);
        create_d.set_operand(0, d.clone()).unwrap();
        run(&mut backend, &create_d);

        let mut contract = TensorOperation::new(OpCode::Contract);
        contract.set_operand(0, d.clone()).unwrap();
        contract.set_operand(1, l.clone()).unwrap();
        contract.set_operand(2, r.clone()).unwrap();
        contract.set_pattern("D(a,b)+=L(a,k)*R(k,b)").unwrap();
        run(&mut backend, &contract);

        let data = backend.tensor_data(d.tensor_hash()).unwrap();
        assert!(data.iter().all(|v| *v == Complex64::new(3.0, 0.0)));
    }

    #[test]
    fn test_contract_full_closure() {
        // Z() = A(i,j) * B(i,j) over unit tensors: 4 summed elements.
        let mut backend = DenseBackend::new();
        let z = tensor("Z", &[]);
        let a = tensor("A", &[2, 2]);
        let b = tensor("B", &[2, 2]);
        create_ones(&mut backend, &a);
        create_ones(&mut backend, &b);
        let mut create_z = TensorOperation::new(OpCode::Create);
        create_z.set_operand(0, z.clone()).unwrap();
        run(&mut backend, &create_z);

        let mut contract = TensorOperation::new(OpCode::Contract);
        contract.set_operand(0, z.clone()).unwrap();
        contract.set_operand(1, a.clone()).unwrap();
        contract.set_operand(2, b.clone()).unwrap();
        contract.set_pattern("Z()+=A(i,j)*B(i,j)").unwrap();
        run(&mut backend, &contract);
        let data = backend.tensor_data(z.tensor_hash()).unwrap();
        assert_eq!(data[IxDyn(&[])], Complex64::new(4.0, 0.0));
    }

    #[test]
    fn test_contract_conjugated_factor() {
        let mut backend = DenseBackend::new();
        let z = tensor("Z", &[]);
        let a = tensor("A", &[2]);
        let b = tensor("B", &[2]);
        for t in [&a, &b] {
            let mut create = TensorOperation::new(OpCode::Create);
            create.set_operand(0, (*t).clone()).unwrap();
            run(&mut backend, &create);
        }
        backend.set_tensor_data(
            a.tensor_hash(),
            ArrayD::from_shape_vec(
                IxDyn(&[2]),
                vec![Complex64::new(0.0, 1.0), Complex64::new(0.0, 1.0)],
            )
            .unwrap(),
        );
        backend.set_tensor_data(
            b.tensor_hash(),
            ArrayD::from_shape_vec(
                IxDyn(&[2]),
                vec![Complex64::new(0.0, 1.0), Complex64::new(0.0, 1.0)],
            )
            .unwrap(),
        );
        let mut create_z = TensorOperation::new(OpCode::Create);
        create_z.set_operand(0, z.clone()).unwrap();
        run(&mut backend, &create_z);

        // <a|b> = sum conj(a_i) b_i = 2 (real), not -2.
        let mut contract = TensorOperation::new(OpCode::Contract);
        contract.set_operand(0, z.clone()).unwrap();
        contract.set_operand(1, a.clone()).unwrap();
        contract.set_operand(2, b.clone()).unwrap();
        contract.set_pattern("Z()+=A(i)+*B(i)").unwrap();
        run(&mut backend, &contract);
        let data = backend.tensor_data(z.tensor_hash()).unwrap();
        assert_eq!(data[IxDyn(&[])], Complex64::new(2.0, 0.0));
    }

    #[test]
    fn test_add_with_permutation() {
        let mut backend = DenseBackend::new();
        let d = tensor("D", &[2, 3]);
        let s = tensor("S", &[3, 2]);
        let mut create = TensorOperation::new(OpCode::Create);
        create.set_operand(0, d.clone()).unwrap();
        run(&mut backend, &create);
        let mut create_s = TensorOperation::new(OpCode::Create);
        create_s.set_operand(0, s.clone()).unwrap();
        run(&mut backend, &create_s);
        backend.set_tensor_data(
            s.tensor_hash(),
            ArrayD::from_shape_fn(IxDyn(&[3, 2]), |idx| {
                Complex64::new((idx[0] * 2 + idx[1]) as f64, 0.0)
            }),
        );

        let mut add = TensorOperation::new(OpCode::Add);
        add.set_operand(0, d.clone()).unwrap();
        add.set_operand(1, s.clone()).unwrap();
        add.set_scalar(0, Complex64::new(2.0, 0.0)).unwrap();
        add.set_pattern("D(a,b)+=S(b,a)").unwrap();
        run(&mut backend, &add);

        let data = backend.tensor_data(d.tensor_hash()).unwrap();
        // D[a][b] = 2 * S[b][a].
        assert_eq!(data[IxDyn(&[0, 2])], Complex64::new(8.0, 0.0));
        assert_eq!(data[IxDyn(&[1, 0])], Complex64::new(2.0, 0.0));
    }

    #[test]
    fn test_slice_insert_round_trip() {
        use crate::tensor::TensorSignature;
        let mut backend = DenseBackend::new();
        let full = tensor("F", &[4, 4]);
        // Slice window [1..3) x [2..4) recorded via the base offsets.
        let slice = make_shared(
            Tensor::with_signature(
                "S",
                TensorShape::from([2, 2]),
                TensorSignature::new(vec![(0, 1), (0, 2)]),
            )
            .unwrap(),
        );
        let mut create = TensorOperation::new(OpCode::Create);
        create.set_operand(0, full.clone()).unwrap();
        run(&mut backend, &create);
        backend.set_tensor_data(
            full.tensor_hash(),
            ArrayD::from_shape_fn(IxDyn(&[4, 4]), |idx| {
                Complex64::new((idx[0] * 4 + idx[1]) as f64, 0.0)
            }),
        );
        let mut create_s = TensorOperation::new(OpCode::Create);
        create_s.set_operand(0, slice.clone()).unwrap();
        run(&mut backend, &create_s);

        let mut slice_op = TensorOperation::new(OpCode::Slice);
        slice_op.set_operand(0, slice.clone()).unwrap();
        slice_op.set_operand(1, full.clone()).unwrap();
        run(&mut backend, &slice_op);
        let s_data = backend.tensor_data(slice.tensor_hash()).unwrap();
        assert_eq!(s_data[IxDyn(&[0, 0])], Complex64::new(6.0, 0.0));
        assert_eq!(s_data[IxDyn(&[1, 1])], Complex64::new(11.0, 0.0));

        // Zero the full tensor, insert the slice back, check the window.
        backend.set_tensor_data(full.tensor_hash(), ArrayD::zeros(IxDyn(&[4, 4])));
        let mut insert = TensorOperation::new(OpCode::Insert);
        insert.set_operand(0, full.clone()).unwrap();
        insert.set_operand(1, slice.clone()).unwrap();
        run(&mut backend, &insert);
        let f_data = backend.tensor_data(full.tensor_hash()).unwrap();
        assert_eq!(f_data[IxDyn(&[1, 2])], Complex64::new(6.0, 0.0));
        assert_eq!(f_data[IxDyn(&[0, 0])], Complex64::new(0.0, 0.0));
    }

    #[test]
    fn test_svd2_round_trip() {
        let mut backend = DenseBackend::new();
        let d = tensor("D", &[2, 2, 2]);
        let l = tensor("L", &[2, 4]);
        let r = tensor("R", &[4, 2, 2]);
        let mut create = TensorOperation::new(OpCode::Create);
        create.set_operand(0, d.clone()).unwrap();
        run(&mut backend, &create);
        backend.set_tensor_data(
            d.tensor_hash(),
            ArrayD::from_shape_fn(IxDyn(&[2, 2, 2]), |idx| {
                Complex64::new((idx[0] + 2 * idx[1]) as f64 + 0.5, idx[2] as f64)
            }),
        );

        let mut svd = TensorOperation::new(OpCode::DecomposeSvd2);
        svd.set_operand(0, l.clone()).unwrap();
        svd.set_operand(1, r.clone()).unwrap();
        svd.set_operand(2, d.clone()).unwrap();
        svd.set_pattern("D(a,b,c)=L(a,k)*R(k,b,c)").unwrap();
        run(&mut backend, &svd);

        // Recontract and compare.
        let check = tensor("Dcheck", &[2, 2, 2]);
        let mut create_c = TensorOperation::new(OpCode::Create);
        create_c.set_operand(0, check.clone()).unwrap();
        run(&mut backend, &create_c);
        let mut contract = TensorOperation::new(OpCode::Contract);
        contract.set_operand(0, check.clone()).unwrap();
        contract.set_operand(1, l.clone()).unwrap();
        contract.set_operand(2, r.clone()).unwrap();
        contract.set_pattern("Dcheck(a,b,c)+=L(a,k)*R(k,b,c)").unwrap();
        run(&mut backend, &contract);

        let original = backend.tensor_data(d.tensor_hash()).unwrap();
        let restored = backend.tensor_data(check.tensor_hash()).unwrap();
        let error: f64 = original
            .iter()
            .zip(restored.iter())
            .map(|(a, b)| (a - b).norm_sqr())
            .sum::<f64>()
            .sqrt();
        assert!(error < 1e-10, "2-norm error {error}");
    }

    #[test]
    fn test_orthogonalize_svd_yields_isometry() {
        let mut backend = DenseBackend::new();
        let t = tensor("T", &[3, 2]);
        let mut create = TensorOperation::new(OpCode::Create);
        create.set_operand(0, t.clone()).unwrap();
        run(&mut backend, &create);
        backend.set_tensor_data(
            t.tensor_hash(),
            ArrayD::from_shape_fn(IxDyn(&[3, 2]), |idx| {
                Complex64::new((1 + idx[0] * 2 + idx[1]) as f64, 0.3)
            }),
        );
        let mut ortho = TensorOperation::new(OpCode::OrthogonalizeSvd);
        ortho.set_operand(0, t.clone()).unwrap();
        run(&mut backend, &ortho);

        // Columns are orthonormal: T^H T = I.
        let data = backend.tensor_data(t.tensor_hash()).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                let dot: Complex64 = (0..3)
                    .map(|r| data[IxDyn(&[r, i])].conj() * data[IxDyn(&[r, j])])
                    .sum();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(approx_eq!(f64, dot.re, expected, epsilon = 1e-12));
                assert!(approx_eq!(f64, dot.im, 0.0, epsilon = 1e-12));
            }
        }
    }

    #[test]
    fn test_mgs_matches_svd_orthogonality() {
        let mut backend = DenseBackend::new();
        let t = tensor("G", &[4, 2]);
        let mut create = TensorOperation::new(OpCode::Create);
        create.set_operand(0, t.clone()).unwrap();
        run(&mut backend, &create);
        backend.set_tensor_data(
            t.tensor_hash(),
            ArrayD::from_shape_fn(IxDyn(&[4, 2]), |idx| {
                Complex64::new((1 + idx[0]) as f64, (idx[1] * idx[0]) as f64)
            }),
        );
        let mut ortho = TensorOperation::new(OpCode::OrthogonalizeMgs);
        ortho.set_operand(0, t.clone()).unwrap();
        run(&mut backend, &ortho);
        let data = backend.tensor_data(t.tensor_hash()).unwrap();
        let dot: Complex64 = (0..4)
            .map(|r| data[IxDyn(&[r, 0])].conj() * data[IxDyn(&[r, 1])])
            .sum();
        assert!(dot.norm() < 1e-12);
    }

    #[test]
    fn test_pool_capacity_defers() {
        let mut backend = DenseBackend::new().with_pool_capacity(100);
        let small = tensor("Sm", &[2]); // 32 bytes
        let mut create = TensorOperation::new(OpCode::Create);
        create.set_operand(0, small.clone()).unwrap();
        run(&mut backend, &create);

        let medium = tensor("Md", &[5]); // 80 bytes, would exceed 100
        let mut create_m = TensorOperation::new(OpCode::Create);
        create_m.set_operand(0, medium.clone()).unwrap();
        assert_eq!(backend.submit(&create_m).unwrap(), SubmitStatus::Deferred);

        // Impossible requests error out instead of deferring forever.
        let huge = tensor("Hg", &[100]);
        let mut create_h = TensorOperation::new(OpCode::Create);
        create_h.set_operand(0, huge.clone()).unwrap();
        assert!(matches!(
            backend.submit(&create_h),
            Err(Error::ResourceExhausted { .. })
        ));

        // Freeing the small tensor lets the deferred creation through.
        backend.free_tensor(small.tensor_hash());
        assert!(matches!(
            backend.submit(&create_m).unwrap(),
            SubmitStatus::Accepted(_)
        ));
    }

    #[test]
    fn test_backend_registry_switching() {
        let mut registry = BackendRegistry::with_default();
        assert_eq!(registry.active_name(), "default");
        assert!(registry.select("cuquantum").is_err());
        registry
            .register("pool_capped", Box::new(DenseBackend::new().with_pool_capacity(1 << 20)))
            .unwrap();
        registry.select("pool_capped").unwrap();
        assert_eq!(registry.active_name(), "pool_capped");
    }
}
