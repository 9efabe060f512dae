//! Process groups and existence-domain arithmetic. A process group wraps a
//! message-passing communicator in an opaque, reference-counted proxy and
//! carries the sorted list of participating global ranks plus a per-process
//! memory limit. Existence domains of the operands of a tensor operation
//! must form a nested chain; the execution domain is the innermost of them.

use std::sync::Arc;

use log::trace;

use crate::error::{Error, Result};
use crate::types::ProcessRank;

/// Default per-process memory limit (1 GiB).
pub const DEFAULT_MEM_LIMIT: u64 = 1 << 30;

/// The communicator payload held behind a [`CommProxy`].
pub enum CommHandle {
    /// Single-process communicator (always available).
    SelfComm,
    /// The world communicator of the launch.
    World,
    /// A communicator created by splitting a parent group.
    #[cfg(feature = "mpi")]
    Split(mpi::topology::SimpleCommunicator),
}

impl std::fmt::Debug for CommHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfComm => write!(f, "SelfComm"),
            Self::World => write!(f, "World"),
            #[cfg(feature = "mpi")]
            Self::Split(_) => write!(f, "Split"),
        }
    }
}

/// Opaque value-type wrapper around a communicator. The underlying handle is
/// shared by reference counting; when `destroy_on_free` is set, the last
/// owner releases the communicator on drop (sub-communicators created by
/// `split` are freed exactly once).
#[derive(Debug, Clone)]
pub struct CommProxy {
    handle: Arc<CommHandle>,
    destroy_on_free: bool,
}

impl CommProxy {
    pub fn self_comm() -> Self {
        Self {
            handle: Arc::new(CommHandle::SelfComm),
            destroy_on_free: false,
        }
    }

    pub fn world() -> Self {
        Self {
            handle: Arc::new(CommHandle::World),
            destroy_on_free: false,
        }
    }

    pub fn new(handle: CommHandle, destroy_on_free: bool) -> Self {
        Self {
            handle: Arc::new(handle),
            destroy_on_free,
        }
    }

    pub fn handle(&self) -> &CommHandle {
        &self.handle
    }

    /// Number of owners of the underlying communicator.
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.handle)
    }

    pub fn destroys_on_free(&self) -> bool {
        self.destroy_on_free
    }
}

/// A set of processes executing tensor operations together.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    comm: CommProxy,
    ranks: Vec<ProcessRank>,
    mem_limit: u64,
}

impl ProcessGroup {
    /// The group of all `num_processes` launched processes.
    pub fn world(num_processes: usize) -> Self {
        Self {
            comm: CommProxy::world(),
            ranks: (0..num_processes as ProcessRank).collect(),
            mem_limit: DEFAULT_MEM_LIMIT,
        }
    }

    /// The single-process group of `rank`.
    pub fn self_group(rank: ProcessRank) -> Self {
        Self {
            comm: CommProxy::self_comm(),
            ranks: vec![rank],
            mem_limit: DEFAULT_MEM_LIMIT,
        }
    }

    /// Builds a group from an explicit rank list. Ranks are sorted and must
    /// be unique.
    pub fn new(comm: CommProxy, mut ranks: Vec<ProcessRank>, mem_limit: u64) -> Result<Self> {
        ranks.sort_unstable();
        let before = ranks.len();
        ranks.dedup();
        if ranks.len() != before {
            return Err(Error::Contract(
                "process group ranks must be unique".to_string(),
            ));
        }
        if ranks.is_empty() {
            return Err(Error::Contract(
                "process group must contain at least one rank".to_string(),
            ));
        }
        Ok(Self {
            comm,
            ranks,
            mem_limit,
        })
    }

    pub fn comm(&self) -> &CommProxy {
        &self.comm
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn ranks(&self) -> &[ProcessRank] {
        &self.ranks
    }

    pub fn contains(&self, rank: ProcessRank) -> bool {
        self.ranks.binary_search(&rank).is_ok()
    }

    pub fn memory_limit_per_process(&self) -> u64 {
        self.mem_limit
    }

    pub fn set_memory_limit_per_process(&mut self, limit: u64) {
        self.mem_limit = limit;
    }

    /// True when every rank of `self` belongs to `other`.
    pub fn is_contained_in(&self, other: &ProcessGroup) -> bool {
        self.ranks.iter().all(|&r| other.contains(r))
    }

    /// True when both groups hold exactly the same ranks.
    pub fn is_congruent_to(&self, other: &ProcessGroup) -> bool {
        self.ranks == other.ranks
    }

    /// Splits the group by a local subgroup label: the new group contains
    /// exactly the processes that declared the same label, preserving their
    /// order in the parent. `None` opts the calling process out and yields
    /// no group.
    ///
    /// Without the message-passing layer this is only meaningful for
    /// single-process groups, where the split is the group itself.
    pub fn split(&self, my_subgroup: Option<u32>) -> Result<Option<ProcessGroup>> {
        let Some(label) = my_subgroup else {
            return Ok(None);
        };
        if self.size() == 1 {
            trace!("split of a single-process group is the group itself");
            return Ok(Some(self.clone()));
        }
        #[cfg(feature = "mpi")]
        {
            return crate::mpi::communication::split_group(self, label);
        }
        #[cfg(not(feature = "mpi"))]
        {
            let _ = label;
            Err(Error::Unavailable(
                "splitting a multi-process group (mpi feature)".to_string(),
            ))
        }
    }
}

/// Computes the execution domain of an operation from its operand existence
/// domains: the domains must be totally nestable, and the execution domain
/// is the smallest (innermost) of them.
pub fn execution_domain<'a>(domains: &[&'a ProcessGroup]) -> Result<&'a ProcessGroup> {
    assert!(!domains.is_empty());
    let mut ordered: Vec<&ProcessGroup> = domains.to_vec();
    ordered.sort_by_key(|d| d.size());
    for pair in ordered.windows(2) {
        if !pair[0].is_contained_in(pair[1]) {
            return Err(Error::DomainNesting(format!(
                "domains {:?} and {:?} are not ordered by inclusion",
                pair[0].ranks(),
                pair[1].ranks()
            )));
        }
    }
    Ok(ordered[0])
}
