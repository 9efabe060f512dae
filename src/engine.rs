//! The engine object owns every process-wide registry (spaces, tensor
//! handles, transform methods, back-ends), the planner with its plan cache,
//! the process groups and the lazy executor. All submission-time validation
//! (contract checks, existence-domain nesting, composite lowering) happens
//! here, before an operation reaches the scheduler.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};
use num_complex::Complex64;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::io::{self, StorageFormat};
use crate::operation::{InitValue, OpCode, TensorMapper, TensorMethod, TensorOperation};
use crate::planner::{ContractionPlan, Planner};
use crate::process_group::{execution_domain, ProcessGroup};
use crate::runtime::backend::{BackendRegistry, DeviceBackend};
use crate::runtime::executor::LazyExecutor;
use crate::spaces::SpaceRegistry;
use crate::tensor::composite::CompositeTensor;
use crate::tensor::{make_shared, Tensor, TensorHandle, TensorShape};
use crate::tensornetwork::expansion::TensorExpansion;
use crate::tensornetwork::TensorNetwork;
use crate::types::{DimExtent, DimId, ElementType, OpId, SpaceId, SubspaceId, TensorId};

/// Engine configuration. The two log levels are orthogonal: `client` guards
/// messages about user-submitted work, `runtime` guards the scheduler
/// internals; 0 silences either.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: String,
    pub planner_strategy: String,
    pub planner_seed: u64,
    pub plan_cache_path: Option<PathBuf>,
    pub pipeline_depth: Option<usize>,
    pub prefetch_depth: Option<usize>,
    pub client_log_level: u32,
    pub runtime_log_level: u32,
    pub num_processes: usize,
    pub process_rank: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: "default".to_string(),
            planner_strategy: "greed".to_string(),
            planner_seed: 0,
            plan_cache_path: None,
            pipeline_depth: None,
            prefetch_depth: None,
            client_log_level: 0,
            runtime_log_level: 0,
            num_processes: 1,
            process_rank: 0,
        }
    }
}

/// The tensor-network numerics engine.
pub struct Engine {
    config: EngineConfig,
    spaces: SpaceRegistry,
    tensors: FxHashMap<String, TensorHandle>,
    composites: FxHashMap<String, CompositeTensor>,
    methods: FxHashMap<String, Arc<dyn TensorMethod>>,
    domains: FxHashMap<u64, ProcessGroup>,
    backends: BackendRegistry,
    executor: LazyExecutor,
    planner: Planner,
    next_op_id: OpId,
    default_group: ProcessGroup,
    self_group: ProcessGroup,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let mut backends = BackendRegistry::with_default();
        backends.select(&config.backend)?;
        let mut executor = LazyExecutor::new();
        if let Some(depth) = config.pipeline_depth {
            executor.set_pipeline_depth(depth);
        } else {
            executor.set_pipeline_depth(backends.active().preferred_pipeline_depth());
        }
        if let Some(depth) = config.prefetch_depth {
            executor.set_prefetch_depth(depth);
        }
        let mut planner =
            Planner::from_name(&config.planner_strategy)?.with_seed(config.planner_seed);
        if let Some(path) = &config.plan_cache_path {
            if path.exists() {
                planner.cache_mut().load(path)?;
            }
        }
        let default_group = ProcessGroup::world(config.num_processes.max(1));
        let self_group = ProcessGroup::self_group(config.process_rank);
        info!(
            "engine started: backend `{}`, {} process(es)",
            config.backend, config.num_processes
        );
        Ok(Self {
            config,
            spaces: SpaceRegistry::new(),
            tensors: FxHashMap::default(),
            composites: FxHashMap::default(),
            methods: FxHashMap::default(),
            domains: FxHashMap::default(),
            backends,
            executor,
            planner,
            next_op_id: 0,
            default_group,
            self_group,
        })
    }

    /// Drains in-flight work, garbage-collects storage and persists the plan
    /// cache, then tears the engine down.
    pub fn shutdown(mut self) -> Result<()> {
        self.drain()?;
        self.collect_garbage();
        if let Some(path) = self.config.plan_cache_path.clone() {
            self.planner.cache().save(&path)?;
        }
        info!("engine shut down");
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn default_process_group(&self) -> &ProcessGroup {
        &self.default_group
    }

    pub fn self_process_group(&self) -> &ProcessGroup {
        &self.self_group
    }

    pub fn planner_mut(&mut self) -> &mut Planner {
        &mut self.planner
    }

    // ---- space and subspace registry ------------------------------------

    pub fn create_space(&mut self, name: &str, dimension: DimExtent) -> Result<SpaceId> {
        self.spaces.create_space(name, dimension)
    }

    pub fn create_subspace(
        &mut self,
        name: &str,
        space_name: &str,
        bounds: (u64, u64),
    ) -> Result<SubspaceId> {
        self.spaces.create_subspace(name, space_name, bounds)
    }

    pub fn subspace(&self, name: &str) -> Option<&crate::spaces::Subspace> {
        self.spaces.subspace(name)
    }

    /// Destroys a named space. Fails while any registered tensor signature
    /// still refers to it.
    pub fn destroy_space(&mut self, name: &str) -> Result<()> {
        let space = self
            .spaces
            .space_by_name(name)
            .ok_or_else(|| Error::RegistryMiss {
                kind: "space",
                name: name.to_string(),
            })?;
        let space_id = space.id();
        if let Some(tensor) = self
            .tensors
            .values()
            .find(|t| t.signature().attributes().iter().any(|&(s, _)| s == space_id))
        {
            return Err(Error::StillReferenced {
                kind: "space",
                name: name.to_string(),
                tensor: tensor.name().to_string(),
            });
        }
        self.spaces.destroy_space(name)
    }

    pub fn destroy_subspace(&mut self, name: &str) -> Result<()> {
        let subspace = self.spaces.subspace(name).ok_or_else(|| Error::RegistryMiss {
            kind: "subspace",
            name: name.to_string(),
        })?;
        let attr = (subspace.space_id(), subspace.id());
        if let Some(tensor) = self
            .tensors
            .values()
            .find(|t| t.signature().attributes().contains(&attr))
        {
            return Err(Error::StillReferenced {
                kind: "subspace",
                name: name.to_string(),
                tensor: tensor.name().to_string(),
            });
        }
        self.spaces.destroy_subspace(name)
    }

    // ---- tensor registry -------------------------------------------------

    /// Registers a symbolic tensor handle.
    pub fn register_tensor(&mut self, tensor: Tensor) -> Result<TensorHandle> {
        if self.tensors.contains_key(tensor.name()) {
            return Err(Error::Duplicate {
                kind: "tensor",
                name: tensor.name().to_string(),
            });
        }
        let handle = make_shared(tensor);
        self.tensors.insert(handle.name().to_string(), handle.clone());
        Ok(handle)
    }

    pub fn tensor(&self, name: &str) -> Result<TensorHandle> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RegistryMiss {
                kind: "tensor",
                name: name.to_string(),
            })
    }

    /// True when the tensor currently has backend storage.
    pub fn tensor_allocated(&self, name: &str) -> bool {
        self.tensors
            .get(name)
            .map(|t| self.backends.active().tensor_data(t.tensor_hash()).is_some())
            .unwrap_or(false)
    }

    /// Existence domain of a tensor; defaults to the whole default group.
    pub fn existence_domain(&self, tensor: &Tensor) -> &ProcessGroup {
        self.domains
            .get(&tensor.tensor_hash())
            .unwrap_or(&self.default_group)
    }

    // ---- transform methods ----------------------------------------------

    pub fn register_method(&mut self, tag: &str, method: Arc<dyn TensorMethod>) -> Result<()> {
        if self.methods.contains_key(tag) {
            return Err(Error::Duplicate {
                kind: "method",
                name: tag.to_string(),
            });
        }
        self.methods.insert(tag.to_string(), method);
        Ok(())
    }

    pub fn method(&self, tag: &str) -> Result<Arc<dyn TensorMethod>> {
        self.methods
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::RegistryMiss {
                kind: "method",
                name: tag.to_string(),
            })
    }

    // ---- back-end selection ---------------------------------------------

    pub fn register_backend(&mut self, name: &str, backend: Box<dyn DeviceBackend>) -> Result<()> {
        self.backends.register(name, backend)
    }

    /// Switches the active back-end; applies to subsequent submissions only.
    pub fn select_backend(&mut self, name: &str) -> Result<()> {
        self.backends.select(name)?;
        if self.config.pipeline_depth.is_none() {
            let depth = self.backends.active().preferred_pipeline_depth();
            self.executor.set_pipeline_depth(depth);
        }
        Ok(())
    }

    pub fn active_backend(&self) -> &str {
        self.backends.active_name()
    }

    // ---- operation submission -------------------------------------------

    /// Validates and submits one primitive operation: contract checks,
    /// existence-domain nesting and full presence, then composite lowering
    /// and scheduling.
    pub fn submit_op(&mut self, op: TensorOperation) -> Result<()> {
        if !op.is_set() {
            return Err(Error::Contract(format!(
                "operation {} is not fully set ({}/{} operands bound)",
                op.opcode(),
                op.num_operands_set(),
                op.num_operands()
            )));
        }
        // Operand existence domains must form a nested chain; the execution
        // domain is the innermost.
        let operand_domains: Vec<&ProcessGroup> = op
            .operands()
            .map(|(_, t)| self.existence_domain(t))
            .collect();
        if !operand_domains.is_empty() {
            let exec_domain = execution_domain(&operand_domains)?;
            // Full presence: a distributed composite operand is only fully
            // reachable within its whole existence domain.
            for (_, tensor) in op.operands() {
                if let Some(composite) = self.composite_of(tensor) {
                    if composite.num_blocks() > 1 {
                        let domain = self.existence_domain(tensor);
                        if !domain.is_contained_in(exec_domain) {
                            return Err(Error::FullPresence(tensor.name().to_string()));
                        }
                    }
                }
            }
        }

        // Lower composite-tensor operations into block-level operations.
        let has_composite = op
            .operands()
            .any(|(_, t)| self.composite_of(t).is_some());
        if has_composite {
            let lowered = op.decompose(self).ok_or_else(|| {
                Error::Contract(format!(
                    "operation {} on a composite tensor has no defined lowering",
                    op.opcode()
                ))
            })?;
            debug!(
                "lowered composite {} into {} block operations",
                op.opcode(),
                lowered.len()
            );
            for block_op in lowered {
                self.schedule(block_op)?;
            }
            return Ok(());
        }
        self.schedule(op)
    }

    fn schedule(&mut self, mut op: TensorOperation) -> Result<()> {
        self.next_op_id += 1;
        op.assign_id(self.next_op_id);
        if self.config.runtime_log_level > 0 {
            debug!("scheduling {op:?}");
        }
        self.executor.submit(op, self.backends.active_mut())
    }

    // ---- tensor lifecycle ------------------------------------------------

    /// Registers a tensor and allocates its backend storage within the
    /// default process group.
    pub fn create_tensor(
        &mut self,
        name: &str,
        shape: TensorShape,
        element_type: ElementType,
    ) -> Result<TensorHandle> {
        let group = self.default_group.clone();
        self.create_tensor_in(&group, name, shape, element_type)
    }

    /// Registers a tensor whose existence domain is the given group.
    pub fn create_tensor_in(
        &mut self,
        group: &ProcessGroup,
        name: &str,
        shape: TensorShape,
        element_type: ElementType,
    ) -> Result<TensorHandle> {
        let mut tensor = Tensor::new(name, shape);
        tensor.set_element_type(element_type);
        let handle = self.register_tensor(tensor)?;
        self.domains.insert(handle.tensor_hash(), group.clone());
        let mut op = TensorOperation::new(OpCode::Create);
        op.set_operand(0, handle.clone())?;
        op.set_element_type(element_type);
        op.set_process_group(group.clone());
        self.submit_op(op)?;
        Ok(handle)
    }

    /// Registers a block-decomposed tensor and allocates every block. The
    /// existence domain size must be a power of two.
    pub fn create_composite_tensor(
        &mut self,
        group: &ProcessGroup,
        name: &str,
        shape: TensorShape,
        splits: Vec<(DimId, u32)>,
        element_type: ElementType,
    ) -> Result<()> {
        if !group.size().is_power_of_two() {
            return Err(Error::Contract(format!(
                "composite tensor `{name}` needs a power-of-two domain, got {}",
                group.size()
            )));
        }
        let mut base = Tensor::new(name, shape);
        base.set_element_type(element_type);
        let composite = CompositeTensor::new(base, splits)?;
        let handle = composite.base().clone();
        if self.tensors.contains_key(name) {
            return Err(Error::Duplicate {
                kind: "tensor",
                name: name.to_string(),
            });
        }
        self.tensors.insert(name.to_string(), handle.clone());
        self.domains.insert(handle.tensor_hash(), group.clone());
        for (_, block) in composite.blocks() {
            self.domains
                .insert(block.tensor().tensor_hash(), group.clone());
        }
        self.composites.insert(name.to_string(), composite);

        let mut op = TensorOperation::new(OpCode::Create);
        op.set_operand(0, handle)?;
        op.set_element_type(element_type);
        op.set_process_group(group.clone());
        self.submit_op(op)
    }

    pub fn composite(&self, name: &str) -> Option<&CompositeTensor> {
        self.composites.get(name)
    }

    fn composite_of(&self, tensor: &Tensor) -> Option<&CompositeTensor> {
        self.composites
            .values()
            .find(|c| c.base().tensor_hash() == tensor.tensor_hash())
    }

    /// Destroys backend storage for a tensor (handle stays registered until
    /// dropped by its owners).
    pub fn destroy_tensor(&mut self, name: &str) -> Result<()> {
        let handle = self.tensor(name)?;
        if let Some(composite) = self.composites.get(name) {
            let blocks: Vec<TensorHandle> = composite
                .blocks()
                .map(|(_, b)| b.tensor().clone())
                .collect();
            for block in blocks {
                let mut op = TensorOperation::new(OpCode::Destroy);
                op.set_operand(0, block)?;
                self.schedule(op)?;
            }
            self.composites.remove(name);
        } else {
            let mut op = TensorOperation::new(OpCode::Destroy);
            op.set_operand(0, handle)?;
            self.schedule(op)?;
        }
        self.tensors.remove(name);
        Ok(())
    }

    /// Initializes every element of a tensor to a constant.
    pub fn init_tensor(&mut self, name: &str, value: Complex64) -> Result<()> {
        let handle = self.tensor(name)?;
        let mut op = TensorOperation::new(OpCode::Transform);
        op.set_operand(0, handle)?;
        op.set_method(Arc::new(InitValue(value)));
        self.submit_op(op)
    }

    /// Applies a registered transform method to a tensor.
    pub fn transform_tensor(&mut self, name: &str, method_tag: &str) -> Result<()> {
        let handle = self.tensor(name)?;
        let method = self.method(method_tag)?;
        let mut op = TensorOperation::new(OpCode::Transform);
        op.set_operand(0, handle)?;
        op.set_method(method);
        self.submit_op(op)
    }

    /// Builds and submits an operation from a symbolic pattern, binding the
    /// named tensors from the registry. `ADD` patterns take one input
    /// factor, `CONTRACT` patterns two. For the decomposition opcodes the
    /// factors on the right-hand side are the written operands and the
    /// pattern's left-hand tensor binds to the trailing input slot.
    pub fn submit_pattern(&mut self, opcode: OpCode, pattern: &str) -> Result<()> {
        let mut op = TensorOperation::new(opcode);
        op.set_pattern(pattern)?;
        let parsed = op.pattern().unwrap().clone();
        match opcode {
            OpCode::DecomposeSvd2 | OpCode::DecomposeSvd3 => {
                for (i, factor) in parsed.inputs.iter().enumerate() {
                    op.set_operand(i, self.tensor(&factor.name)?)?;
                }
                op.set_operand(parsed.inputs.len(), self.tensor(&parsed.output.name)?)?;
            }
            _ => {
                op.set_operand(0, self.tensor(&parsed.output.name)?)?;
                for (i, factor) in parsed.inputs.iter().enumerate() {
                    op.set_operand(i + 1, self.tensor(&factor.name)?)?;
                }
            }
        }
        self.submit_op(op)
    }

    // ---- network and expansion evaluation -------------------------------

    /// Evaluates a finalized tensor network: plans the contraction sequence
    /// (through the plan cache), submits the pairwise contractions and
    /// leaves the result in the network's output tensor. Evaluation is lazy;
    /// `sync` the output tensor to wait for the value.
    pub fn evaluate(&mut self, network: &TensorNetwork) -> Result<()> {
        if !network.is_finalized() {
            return Err(Error::Contract(format!(
                "network `{}` must be finalized before evaluation",
                network.name()
            )));
        }
        let plan = self.planner.plan(network)?;
        if self.config.client_log_level > 0 {
            debug!(
                "evaluating network `{}`: {} contractions, {:.3e} estimated flops",
                network.name(),
                plan.triples.len(),
                plan.flops
            );
        }
        self.submit_plan(network, &plan)
    }

    fn submit_plan(&mut self, network: &TensorNetwork, plan: &ContractionPlan) -> Result<()> {
        // One label per network edge, shared by both endpoint factors.
        let mut edge_labels: FxHashMap<(TensorId, DimId), String> = FxHashMap::default();
        let mut next_label = 0usize;
        for conn in network.connections() {
            for (dim, leg) in conn.legs().iter().enumerate() {
                let here = (conn.id(), dim as DimId);
                if edge_labels.contains_key(&here) {
                    continue;
                }
                let label = format!("x{next_label}");
                next_label += 1;
                edge_labels.insert(here, label.clone());
                edge_labels.insert((leg.peer_id(), leg.peer_dim()), label);
            }
        }

        // Factor bookkeeping per live tensor id.
        struct Factor {
            tensor: TensorHandle,
            labels: Vec<String>,
            conjugated: bool,
            intermediate: bool,
        }
        let mut factors: FxHashMap<TensorId, Factor> = FxHashMap::default();
        for conn in network.inputs() {
            let labels = (0..conn.rank())
                .map(|dim| edge_labels[&(conn.id(), dim as DimId)].clone())
                .collect();
            factors.insert(
                conn.id(),
                Factor {
                    tensor: conn.tensor().clone(),
                    labels,
                    conjugated: conn.is_conjugated(),
                    intermediate: false,
                },
            );
        }
        let output = network.output();
        let output_labels: Vec<String> = (0..output.rank())
            .map(|dim| edge_labels[&(0, dim as DimId)].clone())
            .collect();

        // Output storage must exist before the final accumulation.
        if self
            .backends
            .active()
            .tensor_data(output.tensor().tensor_hash())
            .is_none()
        {
            let mut create = TensorOperation::new(OpCode::Create);
            create.set_operand(0, output.tensor().clone())?;
            create.set_element_type(output.tensor().element_type());
            self.schedule(create)?;
        }

        // A single-input network reduces to one addition into the output.
        // Generated patterns use placeholder factor names: operands bind by
        // slot, and real tensor names are not restricted to the pattern
        // grammar.
        if plan.triples.is_empty() {
            let (_, factor) = factors.into_iter().next().expect("one input");
            let pattern = format!(
                "d({})+=s({}){}",
                output_labels.join(","),
                factor.labels.join(","),
                if factor.conjugated { "+" } else { "" },
            );
            let mut add = TensorOperation::new(OpCode::Add);
            add.set_pattern(&pattern)?;
            add.set_operand(0, output.tensor().clone())?;
            add.set_operand(1, factor.tensor)?;
            return self.schedule(add);
        }

        let prefix = format!("tmp{:x}", network.topology_fingerprint());
        for (step, triple) in plan.triples.iter().enumerate() {
            let left = factors.remove(&triple.left).ok_or_else(|| {
                Error::Contract(format!("plan references unknown tensor id {}", triple.left))
            })?;
            let right = factors.remove(&triple.right).ok_or_else(|| {
                Error::Contract(format!("plan references unknown tensor id {}", triple.right))
            })?;
            let last = step + 1 == plan.triples.len();

            // Result labels: symmetric difference, left labels first.
            let result_labels: Vec<String> = left
                .labels
                .iter()
                .filter(|l| !right.labels.contains(l))
                .chain(right.labels.iter().filter(|l| !left.labels.contains(l)))
                .cloned()
                .collect();

            let (dest, dest_labels) = if last {
                (output.tensor().clone(), output_labels.clone())
            } else {
                let extent_of = |label: &String| -> DimExtent {
                    let source = if left.labels.contains(label) {
                        (&left, left.labels.iter().position(|l| l == label).unwrap())
                    } else {
                        (
                            &right,
                            right.labels.iter().position(|l| l == label).unwrap(),
                        )
                    };
                    source.0.tensor.dim_extent(source.1 as DimId)
                };
                let extents: Vec<DimExtent> = result_labels.iter().map(extent_of).collect();
                let tensor = Tensor::new(
                    &format!("{prefix}_{}", triple.result),
                    TensorShape::new(extents)?,
                );
                let handle = make_shared(tensor);
                let mut create = TensorOperation::new(OpCode::Create);
                create.set_operand(0, handle.clone())?;
                self.schedule(create)?;
                (handle, result_labels.clone())
            };

            let pattern = format!(
                "d({}){}=l({}){}*r({}){}",
                dest_labels.join(","),
                if last { "+" } else { "" },
                left.labels.join(","),
                if left.conjugated { "+" } else { "" },
                right.labels.join(","),
                if right.conjugated { "+" } else { "" },
            );
            let mut contract = TensorOperation::new(OpCode::Contract);
            contract.set_pattern(&pattern)?;
            contract.set_operand(0, dest.clone())?;
            contract.set_operand(1, left.tensor.clone())?;
            contract.set_operand(2, right.tensor.clone())?;
            self.schedule(contract)?;

            if left.intermediate {
                self.destroy_intermediate(&left.tensor)?;
            }
            if right.intermediate {
                self.destroy_intermediate(&right.tensor)?;
            }
            factors.insert(
                triple.result,
                Factor {
                    tensor: dest,
                    labels: dest_labels,
                    conjugated: false,
                    intermediate: !last,
                },
            );
        }
        Ok(())
    }

    fn destroy_intermediate(&mut self, tensor: &TensorHandle) -> Result<()> {
        let mut op = TensorOperation::new(OpCode::Destroy);
        op.set_operand(0, tensor.clone())?;
        self.schedule(op)
    }

    /// Evaluates every component network of an expansion and accumulates the
    /// scaled results into `accumulator`, which must be congruent with the
    /// component outputs and is zeroed first.
    pub fn evaluate_expansion(
        &mut self,
        expansion: &TensorExpansion,
        accumulator: &str,
    ) -> Result<()> {
        let acc = self.tensor(accumulator)?;
        self.init_tensor(accumulator, Complex64::new(0.0, 0.0))?;
        for component in expansion.components() {
            let output = component.network.output().tensor().clone();
            if !output.is_congruent_to(&acc) {
                return Err(Error::Contract(format!(
                    "expansion component output `{}` is not congruent with accumulator `{accumulator}`",
                    output.name()
                )));
            }
            self.evaluate(&component.network)?;
            let labels: Vec<String> = (0..acc.rank()).map(|d| format!("x{d}")).collect();
            let pattern = format!("d({})+=s({})", labels.join(","), labels.join(","));
            let mut add = TensorOperation::new(OpCode::Add);
            add.set_pattern(&pattern)?;
            add.set_operand(0, acc.clone())?;
            add.set_operand(1, output.clone())?;
            add.set_scalar(0, component.coefficient)?;
            self.schedule(add)?;
            // The component output served its purpose.
            let mut destroy = TensorOperation::new(OpCode::Destroy);
            destroy.set_operand(0, output)?;
            self.schedule(destroy)?;
        }
        Ok(())
    }

    /// Evaluates a closed expansion to its scalar value.
    pub fn evaluate_expansion_scalar(&mut self, expansion: &TensorExpansion) -> Result<Complex64> {
        if expansion.rank() != 0 {
            return Err(Error::Contract(format!(
                "expansion `{}` is not closed",
                expansion.name()
            )));
        }
        let mut total = Complex64::new(0.0, 0.0);
        for component in expansion.components() {
            self.evaluate(&component.network)?;
            let output = component.network.output().tensor().clone();
            self.executor.sync_tensor(
                output.tensor_hash(),
                true,
                self.backends.active_mut(),
            )?;
            let data = self
                .backends
                .active()
                .tensor_data(output.tensor_hash())
                .ok_or_else(|| Error::RegistryMiss {
                    kind: "tensor storage",
                    name: output.name().to_string(),
                })?;
            total += component.coefficient * data[ndarray::IxDyn(&[])];
            let mut destroy = TensorOperation::new(OpCode::Destroy);
            destroy.set_operand(0, output)?;
            self.schedule(destroy)?;
        }
        Ok(total)
    }

    // ---- synchronization and data access --------------------------------

    /// Waits (or tests) for all operations writing the named tensor.
    pub fn sync_tensor(&mut self, name: &str, wait: bool) -> Result<bool> {
        let handle = self.tensor(name)?;
        self.executor
            .sync_tensor(handle.tensor_hash(), wait, self.backends.active_mut())
    }

    /// Drains all submitted operations. With `clean_garbage`, storage of
    /// handles held only by the registry is released afterwards.
    pub fn sync_and_collect(&mut self, clean_garbage: bool) -> Result<()> {
        self.drain()?;
        if clean_garbage {
            self.collect_garbage();
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.executor.sync_all(self.backends.active_mut())
    }

    fn collect_garbage(&mut self) {
        let mut freed = 0usize;
        for handle in self.tensors.values() {
            if Arc::strong_count(handle) == 1 {
                self.backends
                    .active_mut()
                    .free_tensor(handle.tensor_hash());
                freed += 1;
            }
        }
        if freed > 0 && self.config.runtime_log_level > 0 {
            debug!("garbage collector released {freed} tensor bodies");
        }
    }

    /// Copies out the stored body of a tensor after syncing it.
    pub fn tensor_body(&mut self, name: &str) -> Result<ndarray::ArrayD<Complex64>> {
        let handle = self.tensor(name)?;
        self.tensor_body_by_hash(handle.tensor_hash())
    }

    /// Copies out a stored body by tensor hash after syncing its writers.
    pub fn tensor_body_by_hash(&mut self, hash: u64) -> Result<ndarray::ArrayD<Complex64>> {
        self.executor
            .sync_tensor(hash, true, self.backends.active_mut())?;
        self.backends
            .active()
            .tensor_data(hash)
            .ok_or_else(|| Error::RegistryMiss {
                kind: "tensor storage",
                name: format!("{hash:x}"),
            })
    }

    /// Releases backend storage by tensor hash.
    pub fn free_storage_by_hash(&mut self, hash: u64) {
        self.backends.active_mut().free_tensor(hash);
    }

    /// Replaces the stored body of a tensor (imports and tests).
    pub fn set_tensor_body(&mut self, name: &str, data: ndarray::ArrayD<Complex64>) -> Result<()> {
        let handle = self.tensor(name)?;
        if data.shape()
            != handle
                .shape()
                .extents()
                .iter()
                .map(|&e| e as usize)
                .collect::<Vec<_>>()
                .as_slice()
        {
            return Err(Error::Contract(format!(
                "body shape {:?} does not match tensor `{name}` shape {}",
                data.shape(),
                handle.shape()
            )));
        }
        self.backends
            .active_mut()
            .set_tensor_data(handle.tensor_hash(), data);
        Ok(())
    }

    /// Value of a rank-0 tensor.
    pub fn scalar_value(&mut self, name: &str) -> Result<Complex64> {
        let body = self.tensor_body(name)?;
        if body.ndim() != 0 {
            return Err(Error::Contract(format!("tensor `{name}` is not a scalar")));
        }
        Ok(body[ndarray::IxDyn(&[])])
    }

    // ---- tensor file I/O -------------------------------------------------

    /// Writes a tensor to a text file in `dense` or `list` layout.
    pub fn export_tensor(
        &mut self,
        name: &str,
        path: &std::path::Path,
        format: StorageFormat,
    ) -> Result<()> {
        let handle = self.tensor(name)?;
        let body = self.tensor_body(name)?;
        io::write_tensor_file(path, &handle, &body, format)
    }

    /// Reads a tensor file, registering the tensor if needed, and uploads
    /// the body to the active back-end.
    pub fn import_tensor(&mut self, path: &std::path::Path) -> Result<TensorHandle> {
        let (tensor, body) = io::read_tensor_file(path)?;
        let name = tensor.name().to_string();
        let handle = match self.tensors.get(&name) {
            Some(existing) => {
                if !existing.is_congruent_to(&tensor) {
                    return Err(Error::Contract(format!(
                        "imported tensor `{name}` is not congruent with the registered one"
                    )));
                }
                existing.clone()
            }
            None => self.register_tensor(tensor)?,
        };
        self.backends
            .active_mut()
            .set_tensor_data(handle.tensor_hash(), body);
        Ok(handle)
    }
}

impl TensorMapper for Engine {
    fn composite_of(&self, tensor: &Tensor) -> Option<&CompositeTensor> {
        Engine::composite_of(self, tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_create_init_sync() {
        let mut eng = engine();
        eng.create_tensor("A", TensorShape::from([2, 2]), ElementType::Real64)
            .unwrap();
        eng.init_tensor("A", Complex64::new(1.5, 0.0)).unwrap();
        eng.sync_tensor("A", true).unwrap();
        let body = eng.tensor_body("A").unwrap();
        assert!(body.iter().all(|v| *v == Complex64::new(1.5, 0.0)));
    }

    #[test]
    fn test_duplicate_tensor_rejected() {
        let mut eng = engine();
        eng.create_tensor("A", TensorShape::from([2]), ElementType::Real64)
            .unwrap();
        assert!(matches!(
            eng.create_tensor("A", TensorShape::from([2]), ElementType::Real64),
            Err(Error::Duplicate { .. })
        ));
    }

    #[test]
    fn test_space_destroy_guarded_by_live_signature() {
        let mut eng = engine();
        let space_id = eng.create_space("orbitals", 8).unwrap();
        let tensor = Tensor::with_signature(
            "T",
            TensorShape::from([8]),
            crate::tensor::TensorSignature::new(vec![(space_id, 0)]),
        )
        .unwrap();
        eng.register_tensor(tensor).unwrap();
        assert!(matches!(
            eng.destroy_space("orbitals"),
            Err(Error::StillReferenced { .. })
        ));
        eng.tensors.remove("T");
        eng.destroy_space("orbitals").unwrap();
    }

    #[test]
    fn test_contract_via_pattern() {
        let mut eng = engine();
        eng.create_tensor("D", TensorShape::from([2, 2]), ElementType::Real64)
            .unwrap();
        eng.create_tensor("L", TensorShape::from([2, 3]), ElementType::Real64)
            .unwrap();
        eng.create_tensor("R", TensorShape::from([3, 2]), ElementType::Real64)
            .unwrap();
        eng.init_tensor("L", Complex64::new(1.0, 0.0)).unwrap();
        eng.init_tensor("R", Complex64::new(1.0, 0.0)).unwrap();
        eng.submit_pattern(OpCode::Contract, "D(a,b)+=L(a,k)*R(k,b)")
            .unwrap();
        let body = eng.tensor_body("D").unwrap();
        assert!(body.iter().all(|v| *v == Complex64::new(3.0, 0.0)));
    }

    #[test]
    fn test_unknown_tensor_rejected_at_submit() {
        let mut eng = engine();
        assert!(matches!(
            eng.submit_pattern(OpCode::Contract, "D(a,b)+=L(a,k)*R(k,b)"),
            Err(Error::RegistryMiss { .. })
        ));
    }

    #[test]
    fn test_evaluate_expansion_accumulates() {
        use crate::tensornetwork::expansion::TensorExpansion;
        use rustc_hash::FxHashMap as Map;

        let mut eng = engine();
        for (name, extents) in [("A", vec![2u64, 3]), ("B", vec![3, 2])] {
            eng.create_tensor(name, TensorShape::new(extents).unwrap(), ElementType::Real64)
                .unwrap();
            eng.init_tensor(name, Complex64::new(1.0, 0.0)).unwrap();
        }
        eng.create_tensor("Acc", TensorShape::from([2, 2]), ElementType::Real64)
            .unwrap();

        let mut expansion = TensorExpansion::new_ket("sum");
        for k in 0..2 {
            let mut tensors = Map::default();
            tensors.insert("A".to_string(), eng.tensor("A").unwrap());
            tensors.insert("B".to_string(), eng.tensor("B").unwrap());
            tensors.insert(
                format!("Z{k}"),
                make_shared(Tensor::new(&format!("Z{k}"), TensorShape::from([2, 2]))),
            );
            let network = crate::tensornetwork::TensorNetwork::from_symbolic(
                &format!("component{k}"),
                &format!("Z{k}(i,j)=A(i,b)*B(b,j)"),
                &tensors,
            )
            .unwrap();
            expansion
                .append_component(network, Complex64::new((k + 1) as f64, 0.0))
                .unwrap();
        }

        eng.evaluate_expansion(&expansion, "Acc").unwrap();
        let body = eng.tensor_body("Acc").unwrap();
        // Each component evaluates to 3 everywhere; coefficients 1 and 2.
        assert!(body.iter().all(|v| *v == Complex64::new(9.0, 0.0)));
    }

    #[test]
    fn test_backend_switch_unknown() {
        let mut eng = engine();
        assert!(eng.select_backend("cuquantum").is_err());
        assert_eq!(eng.active_backend(), "default");
    }
}
