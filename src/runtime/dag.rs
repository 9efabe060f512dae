//! Dependency DAG over submitted tensor operations. Operations are numbered
//! in submission order; operation B depends on operation A iff A writes some
//! operand that B reads or writes and A precedes B. Independent operations
//! may execute concurrently; dependent ones serialize, which also retires
//! writers of a common tensor in submission order.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::operation::TensorOperation;
use crate::types::OpId;

/// Lifecycle of a DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Dependencies outstanding.
    Waiting,
    /// All dependencies satisfied, not yet issued.
    Ready,
    /// Issued to a back-end, in flight.
    Issued,
    /// Completed successfully.
    Completed,
    /// The back-end reported a non-zero status.
    Failed(i32),
}

#[derive(Debug)]
pub struct OpNode {
    pub op: TensorOperation,
    pub state: NodeState,
    /// Unsatisfied dependency count.
    pending_deps: usize,
    /// Nodes waiting on this one.
    dependents: Vec<OpId>,
}

impl OpNode {
    pub fn is_ready(&self) -> bool {
        self.state == NodeState::Ready
    }
}

/// The dependency DAG. Nodes are kept in submission order; completed nodes
/// are pruned once nothing depends on them anymore.
#[derive(Debug, Default)]
pub struct OpDag {
    nodes: BTreeMap<OpId, OpNode>,
    /// Tensor hash -> id of the latest submitted writer.
    last_writer: FxHashMap<u64, OpId>,
    num_completed: u64,
    num_failed: u64,
}

impl OpDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn num_completed(&self) -> u64 {
        self.num_completed
    }

    pub fn num_failed(&self) -> u64 {
        self.num_failed
    }

    pub fn node(&self, id: OpId) -> Option<&OpNode> {
        self.nodes.get(&id)
    }

    /// Inserts an operation, wiring read-after-write and write-after-write
    /// dependencies against earlier submissions.
    pub fn insert(&mut self, op: TensorOperation) {
        let id = op.id();
        let mut deps: Vec<OpId> = Vec::new();
        for (_, tensor) in op.operands() {
            if let Some(&writer) = self.last_writer.get(&tensor.tensor_hash()) {
                if writer != id && !deps.contains(&writer) {
                    // Only still-live writers constrain execution.
                    if let Some(node) = self.nodes.get(&writer) {
                        if !matches!(node.state, NodeState::Completed) {
                            deps.push(writer);
                        }
                    }
                }
            }
        }
        for tensor in op.written_tensors() {
            self.last_writer.insert(tensor.tensor_hash(), id);
        }
        for &dep in &deps {
            self.nodes
                .get_mut(&dep)
                .expect("dependency exists")
                .dependents
                .push(id);
        }
        let state = if deps.is_empty() {
            NodeState::Ready
        } else {
            NodeState::Waiting
        };
        self.nodes.insert(
            id,
            OpNode {
                op,
                state,
                pending_deps: deps.len(),
                dependents: Vec::new(),
            },
        );
    }

    /// Ready nodes in submission order.
    pub fn ready_ops(&self) -> impl Iterator<Item = OpId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_ready())
            .map(|(&id, _)| id)
    }

    /// Operations after `id` (submission order) that are not yet issued;
    /// used to drive the prefetch window.
    pub fn upcoming_ops(&self, after: OpId) -> impl Iterator<Item = &OpNode> {
        self.nodes
            .range(after..)
            .filter(|(_, node)| matches!(node.state, NodeState::Waiting | NodeState::Ready))
            .map(|(_, node)| node)
    }

    pub fn mark_issued(&mut self, id: OpId) {
        let node = self.nodes.get_mut(&id).expect("node exists");
        assert_eq!(node.state, NodeState::Ready);
        node.state = NodeState::Issued;
    }

    /// Marks an issued node completed and releases its dependents. Returns
    /// the newly ready node ids.
    pub fn mark_completed(&mut self, id: OpId) -> Vec<OpId> {
        self.finish(id, NodeState::Completed)
    }

    /// Marks an issued node failed. Dependents are still released: their
    /// submission stays valid, and the failure surfaces through the affected
    /// tensor's completion record.
    pub fn mark_failed(&mut self, id: OpId, status: i32) -> Vec<OpId> {
        self.finish(id, NodeState::Failed(status))
    }

    fn finish(&mut self, id: OpId, state: NodeState) -> Vec<OpId> {
        let node = self.nodes.get_mut(&id).expect("node exists");
        assert_eq!(node.state, NodeState::Issued);
        node.state = state;
        match state {
            NodeState::Completed => self.num_completed += 1,
            NodeState::Failed(_) => self.num_failed += 1,
            _ => unreachable!(),
        }
        let dependents = std::mem::take(&mut self.nodes.get_mut(&id).unwrap().dependents);
        let mut released = Vec::new();
        for dependent in dependents {
            let node = self.nodes.get_mut(&dependent).expect("dependent exists");
            node.pending_deps -= 1;
            if node.pending_deps == 0 && node.state == NodeState::Waiting {
                node.state = NodeState::Ready;
                released.push(dependent);
            }
        }
        self.prune(id);
        released
    }

    /// Drops a finished node unless a failure record must be kept for sync.
    fn prune(&mut self, id: OpId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.state == NodeState::Completed {
            for tensor in self.nodes[&id].op.written_tensors() {
                let hash = tensor.tensor_hash();
                if self.last_writer.get(&hash) == Some(&id) {
                    self.last_writer.remove(&hash);
                }
            }
            self.nodes.remove(&id);
        }
    }

    /// Ids of unfinished operations writing the given tensor.
    pub fn writers_of(&self, tensor_hash: u64) -> Vec<OpId> {
        self.nodes
            .iter()
            .filter(|(_, node)| {
                !matches!(node.state, NodeState::Completed)
                    && node
                        .op
                        .written_tensors()
                        .any(|t| t.tensor_hash() == tensor_hash)
            })
            .map(|(&id, _)| id)
            .collect()
    }

    /// Failure statuses recorded for operations writing the given tensor.
    pub fn failures_of(&self, tensor_hash: u64) -> Vec<(OpId, i32)> {
        self.nodes
            .iter()
            .filter_map(|(&id, node)| match node.state {
                NodeState::Failed(status)
                    if node
                        .op
                        .written_tensors()
                        .any(|t| t.tensor_hash() == tensor_hash) =>
                {
                    Some((id, status))
                }
                _ => None,
            })
            .collect()
    }

    /// Number of nodes that are not yet completed or failed.
    pub fn num_unfinished(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| {
                matches!(
                    node.state,
                    NodeState::Waiting | NodeState::Ready | NodeState::Issued
                )
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OpCode, TensorOperation};
    use crate::tensor::{make_shared, Tensor, TensorHandle, TensorShape};

    fn tensor(name: &str) -> TensorHandle {
        make_shared(Tensor::new(name, TensorShape::from([2, 2])))
    }

    fn create_op(id: OpId, target: &TensorHandle) -> TensorOperation {
        let mut op = TensorOperation::new(OpCode::Create);
        op.set_operand(0, target.clone()).unwrap();
        op.assign_id(id);
        op
    }

    fn add_op(id: OpId, dst: &TensorHandle, src: &TensorHandle) -> TensorOperation {
        let mut op = TensorOperation::new(OpCode::Add);
        op.set_operand(0, dst.clone()).unwrap();
        op.set_operand(1, src.clone()).unwrap();
        op.set_pattern(&format!("{}(a,b)+={}(a,b)", dst.name(), src.name()))
            .unwrap();
        op.assign_id(id);
        op
    }

    #[test]
    fn test_independent_ops_ready() {
        let mut dag = OpDag::new();
        dag.insert(create_op(1, &tensor("A")));
        dag.insert(create_op(2, &tensor("B")));
        assert_eq!(dag.ready_ops().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_write_read_serializes() {
        let a = tensor("A");
        let b = tensor("B");
        let mut dag = OpDag::new();
        dag.insert(create_op(1, &a));
        dag.insert(create_op(2, &b));
        // Op 3 reads A (written by 1) and writes B (written by 2).
        dag.insert(add_op(3, &b, &a));
        assert_eq!(dag.ready_ops().collect::<Vec<_>>(), vec![1, 2]);

        dag.mark_issued(1);
        let released = dag.mark_completed(1);
        assert!(released.is_empty());
        dag.mark_issued(2);
        let released = dag.mark_completed(2);
        assert_eq!(released, vec![3]);
        assert_eq!(dag.ready_ops().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_writers_retire_in_submission_order() {
        let a = tensor("A");
        let b = tensor("B");
        let c = tensor("C");
        let mut dag = OpDag::new();
        dag.insert(create_op(1, &a));
        dag.insert(create_op(2, &b));
        dag.insert(create_op(3, &c));
        dag.insert(add_op(4, &a, &b));
        dag.insert(add_op(5, &a, &c));
        // Both ADDs write A: op 5 must wait for op 4.
        dag.mark_issued(1);
        dag.mark_completed(1);
        dag.mark_issued(2);
        dag.mark_completed(2);
        dag.mark_issued(3);
        dag.mark_completed(3);
        assert_eq!(dag.ready_ops().collect::<Vec<_>>(), vec![4]);
        dag.mark_issued(4);
        assert_eq!(dag.mark_completed(4), vec![5]);
    }

    #[test]
    fn test_failure_is_recorded() {
        let a = tensor("A");
        let mut dag = OpDag::new();
        dag.insert(create_op(1, &a));
        dag.mark_issued(1);
        dag.mark_failed(1, 13);
        let failures = dag.failures_of(a.tensor_hash());
        assert_eq!(failures, vec![(1, 13)]);
        assert_eq!(dag.num_failed(), 1);
    }

    #[test]
    fn test_completed_nodes_pruned() {
        let a = tensor("A");
        let mut dag = OpDag::new();
        dag.insert(create_op(1, &a));
        dag.mark_issued(1);
        dag.mark_completed(1);
        assert!(dag.is_empty());
        assert_eq!(dag.num_completed(), 1);
    }
}
