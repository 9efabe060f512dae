//! Message-passing layer (feature `mpi`): communicator splitting and the
//! collective primitives the engine lowers `BROADCAST`/`ALLREDUCE`
//! operations onto. Without this feature the engine runs with
//! single-process semantics.

pub mod communication;
