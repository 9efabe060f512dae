use thiserror::Error;

use crate::types::OpId;

/// Errors surfaced by the engine. Contract violations, registry misses and
/// malformed patterns are detected at submission time, before an operation is
/// scheduled. Backend failures are reported through the completion record of
/// the affected operation and surface on the next `sync`.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong rank, incompatible shape or signature, or a structural rule of
    /// the network model was broken.
    #[error("contract violation: {0}")]
    Contract(String),

    /// The symbolic index pattern could not be parsed.
    #[error("malformed pattern `{pattern}`: {reason}")]
    Pattern { pattern: String, reason: String },

    /// Lookup of a named entity (tensor, space, subspace, backend, method)
    /// failed.
    #[error("unknown {kind} `{name}`")]
    RegistryMiss { kind: &'static str, name: String },

    /// An entity with the same name is already registered.
    #[error("{kind} `{name}` already registered")]
    Duplicate { kind: &'static str, name: String },

    /// A space or subspace is still referenced by a live tensor signature.
    #[error("{kind} `{name}` is still referenced by tensor `{tensor}`")]
    StillReferenced {
        kind: &'static str,
        name: String,
        tensor: String,
    },

    /// The existence domains of the operands cannot be ordered by inclusion.
    #[error("operand existence domains are not nestable: {0}")]
    DomainNesting(String),

    /// The execution domain does not contain every block of an operand.
    #[error("execution domain lacks full presence of tensor `{0}`")]
    FullPresence(String),

    /// The device kernel reported a non-zero status.
    #[error("backend `{backend}` failed on operation {op_id}: status {status}")]
    Backend {
        backend: String,
        op_id: OpId,
        status: i32,
    },

    /// The operation can never be satisfied by the device pool.
    #[error("device pool exhausted: operation needs {required} bytes, pool capacity is {capacity}")]
    ResourceExhausted { required: usize, capacity: usize },

    /// A collective was invoked with mismatched tensor identity across the
    /// participating processes.
    #[error("collective mismatch across process group: {0}")]
    DistributedConsistency(String),

    /// The requested planner strategy or backend integration is not compiled
    /// in.
    #[error("{0} is not available in this build")]
    Unavailable(String),

    #[error("tensor file format error: {0}")]
    FileFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
