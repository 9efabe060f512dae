//! Collective communication over process groups via MPI.

use log::debug;
use mpi::collective::SystemOperation;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::{Communicator, CommunicatorCollectives, Root};

use crate::error::{Error, Result};
use crate::process_group::{CommHandle, CommProxy, ProcessGroup};
use crate::types::ProcessRank;

fn communicator_of(group: &ProcessGroup) -> Result<SimpleCommunicator> {
    match group.comm().handle() {
        CommHandle::World => Ok(SimpleCommunicator::world()),
        CommHandle::Split(comm) => Ok(comm.duplicate()),
        CommHandle::SelfComm => Err(Error::Contract(
            "collective called on a single-process communicator".to_string(),
        )),
    }
}

/// Splits `parent` into the subgroup of processes that declared the same
/// label, preserving their parent ordering. Collective over the parent
/// communicator.
pub fn split_group(parent: &ProcessGroup, label: u32) -> Result<Option<ProcessGroup>> {
    let comm = communicator_of(parent)?;
    let my_rank = comm.rank();
    let Some(subcomm) =
        comm.split_by_color_with_key(Color::with_value(label as i32), my_rank)
    else {
        return Ok(None);
    };

    // Translate subgroup-local ranks back to global ranks of the parent.
    let local_global = parent.ranks()[my_rank as usize];
    let size = subcomm.size() as usize;
    let mut globals = vec![0 as ProcessRank; size];
    subcomm.all_gather_into(&local_global, &mut globals[..]);
    debug!("split process group of size {} into subgroup {globals:?}", parent.size());

    let proxy = CommProxy::new(CommHandle::Split(subcomm), true);
    Some(ProcessGroup::new(
        proxy,
        globals,
        parent.memory_limit_per_process(),
    ))
    .transpose()
}

/// Broadcasts a byte buffer from `root` to every process of the group.
pub fn broadcast_bytes(group: &ProcessGroup, root: ProcessRank, data: &mut Vec<u8>) -> Result<()> {
    let comm = communicator_of(group)?;
    let root_process = comm.process_at_rank(root as i32);
    let mut len = data.len() as u64;
    root_process.broadcast_into(&mut len);
    data.resize(len as usize, 0);
    root_process.broadcast_into(&mut data[..]);
    Ok(())
}

/// Element-wise sum all-reduce of an interleaved `re, im` buffer across the
/// group. Every participant must pass a congruent buffer; a length mismatch
/// is a collective consistency error.
pub fn allreduce_sum(group: &ProcessGroup, data: &mut [f64]) -> Result<()> {
    let comm = communicator_of(group)?;
    let mut len = data.len() as u64;
    let mut max_len = len;
    comm.all_reduce_into(&mut len, &mut max_len, SystemOperation::max());
    if max_len != data.len() as u64 {
        return Err(Error::DistributedConsistency(format!(
            "all-reduce buffer lengths differ across the group (local {}, max {max_len})",
            data.len()
        )));
    }
    let local = data.to_vec();
    comm.all_reduce_into(&local[..], data, SystemOperation::sum());
    Ok(())
}
