//! Tensor-network operators: linear combinations of tensors whose open legs
//! are partitioned into a ket half and a bra half, mapping a primary space
//! onto a dual one.

use num_complex::Complex64;

use crate::error::{Error, Result};
use crate::tensor::TensorHandle;
use crate::types::DimId;

/// One component of an operator: a tensor together with the leg maps
/// `(global mode, component dimension)` for its ket and bra halves, and an
/// expansion coefficient.
#[derive(Debug, Clone)]
pub struct OperatorComponent {
    tensor: TensorHandle,
    ket_legs: Vec<(DimId, DimId)>,
    bra_legs: Vec<(DimId, DimId)>,
    coefficient: Complex64,
}

impl OperatorComponent {
    pub fn tensor(&self) -> &TensorHandle {
        &self.tensor
    }

    pub fn ket_legs(&self) -> &[(DimId, DimId)] {
        &self.ket_legs
    }

    pub fn bra_legs(&self) -> &[(DimId, DimId)] {
        &self.bra_legs
    }

    pub fn coefficient(&self) -> Complex64 {
        self.coefficient
    }
}

/// A tensor-network operator: an ordered list of components. Every
/// component's leg maps must partition its open dimensions into the ket and
/// bra halves.
#[derive(Debug, Clone, Default)]
pub struct TensorOperator {
    name: String,
    components: Vec<OperatorComponent>,
}

impl TensorOperator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            components: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    pub fn components(&self) -> impl Iterator<Item = &OperatorComponent> {
        self.components.iter()
    }

    /// Appends a tensor component. `ket_legs` and `bra_legs` list
    /// `(global mode, component dimension)` pairs; together they must name
    /// every dimension of the tensor exactly once, and a global mode may
    /// appear at most once per half.
    pub fn append_component(
        &mut self,
        tensor: TensorHandle,
        ket_legs: Vec<(DimId, DimId)>,
        bra_legs: Vec<(DimId, DimId)>,
        coefficient: Complex64,
    ) -> Result<()> {
        let rank = tensor.rank();
        let mut covered = vec![false; rank];
        for &(_, dim) in ket_legs.iter().chain(bra_legs.iter()) {
            let dim = dim as usize;
            if dim >= rank {
                return Err(Error::Contract(format!(
                    "operator `{}`: component `{}` has no dimension {dim}",
                    self.name,
                    tensor.name()
                )));
            }
            if covered[dim] {
                return Err(Error::Contract(format!(
                    "operator `{}`: dimension {dim} of component `{}` mapped twice",
                    self.name,
                    tensor.name()
                )));
            }
            covered[dim] = true;
        }
        if covered.iter().any(|&c| !c) {
            return Err(Error::Contract(format!(
                "operator `{}`: leg maps do not cover every dimension of component `{}`",
                self.name,
                tensor.name()
            )));
        }
        for half in [&ket_legs, &bra_legs] {
            let mut modes: Vec<DimId> = half.iter().map(|&(mode, _)| mode).collect();
            modes.sort_unstable();
            modes.dedup();
            if modes.len() != half.len() {
                return Err(Error::Contract(format!(
                    "operator `{}`: component `{}` maps a global mode twice within one half",
                    self.name,
                    tensor.name()
                )));
            }
        }
        self.components.push(OperatorComponent {
            tensor,
            ket_legs,
            bra_legs,
            coefficient,
        });
        Ok(())
    }
}

impl std::fmt::Display for TensorOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "TensorOperator `{}` [{} components]:",
            self.name,
            self.components.len()
        )?;
        for component in &self.components {
            writeln!(
                f,
                "  {} * {} ket{:?} bra{:?}",
                component.coefficient,
                component.tensor,
                component.ket_legs,
                component.bra_legs
            )?;
        }
        Ok(())
    }
}
