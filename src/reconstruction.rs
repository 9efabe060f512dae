//! Gradient-based reconstruction of a tensor-network expansion: given a ket
//! target and a bra approximant with optimizable tensors, iterate steepest
//! descent on the real residual
//! `<psi|psi> + <phi|phi> - <phi|psi> - <psi|phi>` until the largest
//! gradient magnitude falls below the tolerance. Gradients come from
//! environment networks: the closed overlap networks with the optimizable
//! tensor deleted.

use log::debug;
use ndarray::ArrayD;
use num_complex::Complex64;
use rustc_hash::FxHashMap;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::tensornetwork::expansion::TensorExpansion;
use crate::tensornetwork::TensorNetwork;
use crate::types::TensorId;

pub const DEFAULT_MAX_ITERATIONS: usize = 1000;
pub const DEFAULT_LEARN_RATE: f64 = 0.25;
const MIN_LEARN_RATE: f64 = 1e-8;

/// Reconstructs an approximate expansion for a target expansion by
/// variational optimization of the tensors marked optimizable in the
/// approximant.
pub struct Reconstructor {
    target: TensorExpansion,
    approximant: TensorExpansion,
    tolerance: f64,
    max_iterations: usize,
    learn_rate: f64,
    residual_norm: f64,
    fidelity: f64,
}

impl Reconstructor {
    /// `target` must be a ket, `approximant` a bra of the same rank with at
    /// least one optimizable tensor.
    pub fn new(
        target: TensorExpansion,
        approximant: TensorExpansion,
        tolerance: f64,
    ) -> Result<Self> {
        if !target.is_ket() {
            return Err(Error::Contract(
                "the reconstructed expansion must be a ket".to_string(),
            ));
        }
        if !approximant.is_bra() {
            return Err(Error::Contract(
                "the reconstructing expansion must be a bra".to_string(),
            ));
        }
        if target.rank() != approximant.rank() {
            return Err(Error::Contract(format!(
                "rank mismatch between `{}` and `{}`",
                target.name(),
                approximant.name()
            )));
        }
        let optimizable = optimizable_names(&approximant);
        if optimizable.is_empty() {
            return Err(Error::Contract(format!(
                "approximant `{}` has no optimizable tensors",
                approximant.name()
            )));
        }
        Ok(Self {
            target,
            approximant,
            tolerance,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            learn_rate: DEFAULT_LEARN_RATE,
            residual_norm: 0.0,
            fidelity: 0.0,
        })
    }

    pub fn reset_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    pub fn reset_max_iterations(&mut self, max_iterations: usize) {
        self.max_iterations = max_iterations;
    }

    pub fn reset_learn_rate(&mut self, learn_rate: f64) {
        self.learn_rate = learn_rate;
    }

    pub fn residual_norm(&self) -> f64 {
        self.residual_norm
    }

    pub fn fidelity(&self) -> f64 {
        self.fidelity
    }

    /// Runs the optimization. Returns `(residual, fidelity)` once the
    /// largest gradient magnitude drops below the tolerance or the iteration
    /// budget is spent. The residual decreases monotonically: a step that
    /// would increase it is retried with a halved learning rate.
    pub fn reconstruct(&mut self, engine: &mut Engine) -> Result<(f64, f64)> {
        let mut target_bra = self.target.clone();
        target_bra.conjugate();
        let psi_norm = engine
            .evaluate_expansion_scalar(&TensorExpansion::inner_product(
                &target_bra,
                &self.target,
            )?)?
            .re;

        let optimizable = optimizable_names(&self.approximant);
        let mut residual = self.residual(engine, psi_norm)?;
        let mut step = self.learn_rate;

        for iteration in 0..self.max_iterations {
            let gradients = self.gradients(engine, &optimizable)?;
            let grad_max = gradients
                .values()
                .flat_map(|g| g.iter())
                .map(|v| v.norm())
                .fold(0.0f64, f64::max);
            debug!(
                "reconstruction iteration {iteration}: residual {residual:.6e}, max gradient {grad_max:.6e}"
            );
            if grad_max < self.tolerance {
                break;
            }

            // Steepest descent with backtracking to keep the residual
            // monotone.
            let saved: FxHashMap<String, ArrayD<Complex64>> = optimizable
                .iter()
                .map(|name| Ok((name.clone(), engine.tensor_body(name)?)))
                .collect::<Result<_>>()?;
            loop {
                for (name, gradient) in &gradients {
                    let mut body = saved[name].clone();
                    body.zip_mut_with(gradient, |t, g| {
                        *t -= Complex64::new(step, 0.0) * g.conj();
                    });
                    engine.set_tensor_body(name, body)?;
                }
                let new_residual = self.residual(engine, psi_norm)?;
                if new_residual <= residual || step < MIN_LEARN_RATE {
                    residual = new_residual;
                    break;
                }
                step /= 2.0;
                for (name, body) in &saved {
                    engine.set_tensor_body(name, body.clone())?;
                }
            }
        }

        self.residual_norm = residual;
        let overlap = engine.evaluate_expansion_scalar(&TensorExpansion::inner_product(
            &self.approximant,
            &self.target,
        )?)?;
        let phi_norm = self.phi_norm(engine)?;
        self.fidelity = if phi_norm > 0.0 && psi_norm > 0.0 {
            overlap.norm_sqr() / (phi_norm * psi_norm)
        } else {
            0.0
        };
        Ok((self.residual_norm, self.fidelity))
    }

    fn phi_norm(&self, engine: &mut Engine) -> Result<f64> {
        let mut phi_ket = self.approximant.clone();
        phi_ket.conjugate();
        Ok(engine
            .evaluate_expansion_scalar(&TensorExpansion::inner_product(
                &self.approximant,
                &phi_ket,
            )?)?
            .re)
    }

    /// `<psi|psi> + <phi|phi> - <phi|psi> - <psi|phi>`.
    fn residual(&self, engine: &mut Engine, psi_norm: f64) -> Result<f64> {
        let overlap = engine.evaluate_expansion_scalar(&TensorExpansion::inner_product(
            &self.approximant,
            &self.target,
        )?)?;
        Ok(psi_norm + self.phi_norm(engine)? - 2.0 * overlap.re)
    }

    /// Environment gradients of the residual with respect to the conjugated
    /// occurrences of every optimizable tensor.
    fn gradients(
        &self,
        engine: &mut Engine,
        optimizable: &[String],
    ) -> Result<FxHashMap<String, ArrayD<Complex64>>> {
        let mut phi_ket = self.approximant.clone();
        phi_ket.conjugate();
        let normalization = TensorExpansion::inner_product(&self.approximant, &phi_ket)?;
        let overlap = TensorExpansion::inner_product(&self.approximant, &self.target)?;

        let mut gradients: FxHashMap<String, ArrayD<Complex64>> = FxHashMap::default();
        for name in optimizable {
            let mut total: Option<ArrayD<Complex64>> = None;
            for (expansion, sign) in [(&normalization, 1.0), (&overlap, -1.0)] {
                for component in expansion.components() {
                    for conn_id in conjugated_occurrences(&component.network, name) {
                        let env =
                            environment_body(engine, &component.network, conn_id)?;
                        let scale = component.coefficient * sign;
                        match &mut total {
                            Some(sum) => sum.zip_mut_with(&env, |s, e| *s += scale * e),
                            None => total = Some(env.mapv(|e| scale * e)),
                        }
                    }
                }
            }
            let gradient = total.ok_or_else(|| {
                Error::Contract(format!(
                    "optimizable tensor `{name}` does not appear in the overlap networks"
                ))
            })?;
            gradients.insert(name.clone(), gradient);
        }
        Ok(gradients)
    }
}

/// Names of the optimizable tensors of an expansion.
fn optimizable_names(expansion: &TensorExpansion) -> Vec<String> {
    let mut names = Vec::new();
    for component in expansion.components() {
        for conn in component.network.inputs() {
            if conn.is_optimizable() && !names.contains(&conn.name().to_string()) {
                names.push(conn.name().to_string());
            }
        }
    }
    names
}

/// Ids of the conjugated, optimizable occurrences of `name` in a network.
fn conjugated_occurrences(network: &TensorNetwork, name: &str) -> Vec<TensorId> {
    network
        .inputs()
        .filter(|conn| conn.is_optimizable() && conn.is_conjugated() && conn.name() == name)
        .map(|conn| conn.id())
        .collect()
}

/// Evaluates the environment of one connection of a closed network: the
/// network with that tensor deleted, whose output ranks match the deleted
/// tensor dimension for dimension.
fn environment_body(
    engine: &mut Engine,
    network: &TensorNetwork,
    conn_id: TensorId,
) -> Result<ArrayD<Complex64>> {
    let mut environment = network.clone();
    environment.rename(&format!("{}_env{}", network.name(), conn_id));
    environment.delete_tensor(conn_id)?;
    engine.evaluate(&environment)?;
    let hash = environment.output().tensor().tensor_hash();
    let body = engine.tensor_body_by_hash(hash)?;
    engine.free_storage_by_hash(hash);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{make_shared, Tensor, TensorShape};
    use rustc_hash::FxHashMap as Map;

    fn simple_expansion(ket: bool, optimizable: bool) -> TensorExpansion {
        let mut tensors = Map::default();
        tensors.insert(
            "V".to_string(),
            make_shared(Tensor::new("V", TensorShape::from([2]))),
        );
        tensors.insert(
            "W".to_string(),
            make_shared(Tensor::new("W", TensorShape::from([2]))),
        );
        let mut network =
            TensorNetwork::from_symbolic("v", "W(i)=V(i)", &tensors).unwrap();
        if optimizable {
            network
                .connection_mut(1)
                .unwrap()
                .set_optimizable(true)
                .unwrap();
        }
        let mut expansion = TensorExpansion::new_ket("phi");
        expansion
            .append_component(network, Complex64::new(1.0, 0.0))
            .unwrap();
        if !ket {
            expansion.conjugate();
        }
        expansion
    }

    #[test]
    fn test_requires_ket_and_bra() {
        let ket = simple_expansion(true, true);
        let bra = simple_expansion(false, true);
        assert!(Reconstructor::new(ket.clone(), bra.clone(), 1e-6).is_ok());
        assert!(Reconstructor::new(bra.clone(), bra.clone(), 1e-6).is_err());
        assert!(Reconstructor::new(ket.clone(), ket, 1e-6).is_err());
    }

    #[test]
    fn test_requires_optimizable_tensors() {
        let ket = simple_expansion(true, false);
        let bra = simple_expansion(false, false);
        assert!(matches!(
            Reconstructor::new(ket, bra, 1e-6),
            Err(Error::Contract(_))
        ));
    }
}
