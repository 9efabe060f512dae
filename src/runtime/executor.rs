//! Lazy cooperative executor. A single pump walks the dependency DAG,
//! issuing ready operations to the active back-end until the pipeline is
//! full, pre-staging operands of upcoming operations within the prefetch
//! window, and retiring completions. `sync` is the only blocking surface; it
//! distinguishes waiting from testing.

use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::operation::TensorOperation;
use crate::runtime::backend::{
    Completion, DeviceBackend, ExecHandle, SubmitStatus, DEFAULT_PIPELINE_DEPTH,
    DEFAULT_PREFETCH_DEPTH,
};
use crate::runtime::dag::{NodeState, OpDag};
use crate::types::OpId;

/// Single-threaded cooperative pump over the operation DAG.
pub struct LazyExecutor {
    dag: OpDag,
    in_flight: Vec<(OpId, ExecHandle)>,
    /// Operations deferred by the back-end (device pool full).
    deferred: VecDeque<OpId>,
    pipeline_depth: usize,
    prefetch_depth: usize,
    total_flops: f64,
}

impl Default for LazyExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LazyExecutor {
    pub fn new() -> Self {
        Self {
            dag: OpDag::new(),
            in_flight: Vec::new(),
            deferred: VecDeque::new(),
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            prefetch_depth: DEFAULT_PREFETCH_DEPTH,
            total_flops: 0.0,
        }
    }

    pub fn pipeline_depth(&self) -> usize {
        self.pipeline_depth
    }

    /// Caps the number of operations in flight. Device-specific back-ends
    /// may request a reduced depth.
    pub fn set_pipeline_depth(&mut self, depth: usize) {
        self.pipeline_depth = depth.max(1);
    }

    pub fn prefetch_depth(&self) -> usize {
        self.prefetch_depth
    }

    /// Regulates the prefetch window (0 turns prefetch off).
    pub fn set_prefetch_depth(&mut self, depth: usize) {
        self.prefetch_depth = depth;
    }

    /// Total flop estimate of the operations executed so far.
    pub fn total_flop_count(&self) -> f64 {
        self.total_flops
    }

    pub fn num_completed(&self) -> u64 {
        self.dag.num_completed()
    }

    pub fn num_failed(&self) -> u64 {
        self.dag.num_failed()
    }

    /// Enqueues one operation and gives the pump a turn.
    pub fn submit(
        &mut self,
        op: TensorOperation,
        backend: &mut dyn DeviceBackend,
    ) -> Result<()> {
        trace!("submitting operation {} ({})", op.id(), op.opcode());
        self.total_flops += op.flop_estimate();
        self.dag.insert(op);
        self.pump(backend)
    }

    /// One cooperative pump turn: retire completions, re-try deferred
    /// operations, issue ready operations up to the pipeline depth and
    /// pre-stage operands within the prefetch window. Never blocks.
    pub fn pump(&mut self, backend: &mut dyn DeviceBackend) -> Result<()> {
        self.retire(backend);

        // Deferred operations retry first; they were ready before.
        while let Some(&id) = self.deferred.front() {
            if self.in_flight.len() >= self.pipeline_depth {
                break;
            }
            match self.dag.node(id).expect("deferred node").op.accept(backend)? {
                SubmitStatus::Accepted(handle) => {
                    self.deferred.pop_front();
                    self.in_flight.push((id, handle));
                }
                SubmitStatus::Deferred => {
                    // Still no room; wait for more retirements.
                    if self.in_flight.is_empty() {
                        warn!("operation {id} deferred with an idle device; retrying");
                    }
                    break;
                }
            }
        }

        let ready: Vec<OpId> = self.dag.ready_ops().collect();
        for id in ready {
            if self.in_flight.len() >= self.pipeline_depth {
                break;
            }
            self.dag.mark_issued(id);
            match self.dag.node(id).expect("issued node").op.accept(backend)? {
                SubmitStatus::Accepted(handle) => {
                    self.in_flight.push((id, handle));
                }
                SubmitStatus::Deferred => {
                    trace!("operation {id} deferred by back-end `{}`", backend.name());
                    self.deferred.push_back(id);
                }
            }
        }

        self.prefetch(backend);
        self.retire(backend);
        Ok(())
    }

    /// Pre-stages the operands of the next `prefetch_depth` unissued
    /// operations.
    fn prefetch(&self, backend: &mut dyn DeviceBackend) {
        if self.prefetch_depth == 0 {
            return;
        }
        let horizon = self
            .in_flight
            .iter()
            .map(|&(id, _)| id)
            .max()
            .unwrap_or(0);
        for node in self
            .dag
            .upcoming_ops(horizon)
            .take(self.prefetch_depth)
        {
            for (_, tensor) in node.op.operands() {
                backend.prefetch(tensor);
            }
        }
    }

    /// Polls in-flight handles and retires finished operations.
    fn retire(&mut self, backend: &mut dyn DeviceBackend) {
        let mut still_in_flight = Vec::with_capacity(self.in_flight.len());
        for (id, handle) in self.in_flight.drain(..) {
            match backend.poll(handle) {
                Completion::Pending => still_in_flight.push((id, handle)),
                Completion::Done => {
                    trace!("operation {id} completed");
                    self.dag.mark_completed(id);
                }
                Completion::Failed(status) => {
                    warn!(
                        "operation {id} failed on back-end `{}` with status {status}",
                        backend.name()
                    );
                    self.dag.mark_failed(id, status);
                }
            }
        }
        self.in_flight = still_in_flight;
    }

    /// True when a deferred operation can never be issued: the device still
    /// refuses it, nothing is in flight or ready, and the last pump turn
    /// retired nothing.
    fn is_stuck(&self, completed_before: u64) -> bool {
        !self.deferred.is_empty()
            && self.in_flight.is_empty()
            && self.dag.ready_ops().next().is_none()
            && self.dag.num_completed() == completed_before
    }

    /// Waits for (or tests) completion of every operation writing the given
    /// tensor. With `wait = false` a single pump turn runs and the current
    /// state is reported. A recorded kernel failure surfaces as an error.
    pub fn sync_tensor(
        &mut self,
        tensor_hash: u64,
        wait: bool,
        backend: &mut dyn DeviceBackend,
    ) -> Result<bool> {
        loop {
            let completed_before = self.dag.num_completed();
            self.pump(backend)?;
            let failures = self.dag.failures_of(tensor_hash);
            if let Some(&(op_id, status)) = failures.first() {
                return Err(Error::Backend {
                    backend: backend.name().to_string(),
                    op_id,
                    status,
                });
            }
            let writers = self.dag.writers_of(tensor_hash);
            if writers.is_empty() {
                return Ok(true);
            }
            if !wait {
                return Ok(false);
            }
            if self.is_stuck(completed_before) {
                return Err(Error::Contract(format!(
                    "operations {writers:?} cannot make progress; device pool exhausted"
                )));
            }
        }
    }

    /// Drains the whole DAG. Returns an error naming the first failed
    /// operation, if any.
    pub fn sync_all(&mut self, backend: &mut dyn DeviceBackend) -> Result<()> {
        loop {
            let completed_before = self.dag.num_completed();
            self.pump(backend)?;
            if self.dag.num_unfinished() == 0 {
                break;
            }
            if self.is_stuck(completed_before) {
                return Err(Error::Contract(
                    "deferred operations cannot make progress; device pool exhausted"
                        .to_string(),
                ));
            }
        }
        if self.dag.num_failed() > 0 {
            debug!("{} operations failed during drain", self.dag.num_failed());
        }
        Ok(())
    }

    /// State of one submitted operation, if it is still tracked.
    pub fn op_state(&self, id: OpId) -> Option<NodeState> {
        self.dag.node(id).map(|node| node.state)
    }
}
