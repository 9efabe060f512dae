//! tennet: a distributed tensor-network numerics engine.
//!
//! The crate accepts high-level tensor-network expressions (networks,
//! expansions, operators), compiles them into a directed acyclic graph of
//! primitive tensor operations via a contraction-sequence planner, and
//! executes that DAG through a lazy cooperative pump over pluggable device
//! back-ends. Every tensor carries an existence domain (a nested process
//! group), and operations on block-decomposed composite tensors lower into
//! block-level operations with collectives on the inter-domain edges.
//!
//! The typical flow:
//!
//! ```
//! use num_complex::Complex64;
//! use tennet::engine::{Engine, EngineConfig};
//! use tennet::tensor::TensorShape;
//! use tennet::types::ElementType;
//!
//! let mut engine = Engine::new(EngineConfig::default()).unwrap();
//! engine
//!     .create_tensor("A", TensorShape::from([2, 2]), ElementType::Real64)
//!     .unwrap();
//! engine.init_tensor("A", Complex64::new(1.0, 0.0)).unwrap();
//! engine.sync_tensor("A", true).unwrap();
//! engine.shutdown().unwrap();
//! ```

pub mod engine;
pub mod error;
pub mod io;
pub mod operation;
pub mod planner;
pub mod process_group;
pub mod reconstruction;
pub mod runtime;
pub mod spaces;
pub mod symbolic;
pub mod tensor;
pub mod tensornetwork;
pub mod types;

#[cfg(feature = "mpi")]
pub mod mpi;

pub use engine::{Engine, EngineConfig};
pub use error::{Error, Result};
pub use tensor::{Tensor, TensorShape, TensorSignature};
pub use tensornetwork::TensorNetwork;
