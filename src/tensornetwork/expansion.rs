//! Tensor-network expansions: linear combinations of tensor networks with
//! complex coefficients, living either in the primary (ket) or the dual
//! (bra) space. Expansions combine by direct summation, by `<bra|ket>` inner
//! products and by contraction with a tensor-network operator.

use num_complex::Complex64;

use crate::error::{Error, Result};
use crate::tensor::{make_shared, Tensor, TensorShape, TensorSignature};
use crate::tensornetwork::operator::{OperatorComponent, TensorOperator};
use crate::tensornetwork::{TensorConn, TensorLeg, TensorNetwork};
use crate::types::{DimId, TensorId};

/// One component of an expansion.
#[derive(Debug, Clone)]
pub struct ExpansionComponent {
    pub network: TensorNetwork,
    pub coefficient: Complex64,
}

/// A linear combination of tensor networks with congruent outputs.
#[derive(Debug, Clone)]
pub struct TensorExpansion {
    name: String,
    components: Vec<ExpansionComponent>,
    ket: bool,
}

impl TensorExpansion {
    /// An empty expansion in the primary (ket) space.
    pub fn new_ket(name: &str) -> Self {
        Self {
            name: name.to_string(),
            components: Vec::new(),
            ket: true,
        }
    }

    /// An empty expansion in the dual (bra) space.
    pub fn new_bra(name: &str) -> Self {
        Self {
            name: name.to_string(),
            components: Vec::new(),
            ket: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn is_ket(&self) -> bool {
        self.ket
    }

    pub fn is_bra(&self) -> bool {
        !self.ket
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    pub fn components(&self) -> impl Iterator<Item = &ExpansionComponent> {
        self.components.iter()
    }

    pub fn components_mut(&mut self) -> impl Iterator<Item = &mut ExpansionComponent> {
        self.components.iter_mut()
    }

    /// Rank of the shared output shape (0 for an empty expansion).
    pub fn rank(&self) -> usize {
        self.components
            .first()
            .map(|c| c.network.rank())
            .unwrap_or(0)
    }

    /// Appends one network with a coefficient. The network must be finalized
    /// and congruent with the existing components.
    pub fn append_component(
        &mut self,
        network: TensorNetwork,
        coefficient: Complex64,
    ) -> Result<()> {
        if !network.is_finalized() {
            return Err(Error::Contract(format!(
                "network `{}` must be finalized before joining expansion `{}`",
                network.name(),
                self.name
            )));
        }
        if let Some(first) = self.components.first() {
            if !first.network.is_congruent_to(&network) {
                return Err(Error::Contract(format!(
                    "network `{}` is not congruent with expansion `{}`",
                    network.name(),
                    self.name
                )));
            }
        }
        self.components.push(ExpansionComponent {
            network,
            coefficient,
        });
        Ok(())
    }

    /// Direct sum: appends every component of `other`, scaled by `scale`.
    pub fn append_expansion(&mut self, other: &TensorExpansion, scale: Complex64) -> Result<()> {
        if self.ket != other.ket {
            return Err(Error::Contract(format!(
                "cannot sum ket/bra expansions `{}` and `{}`",
                self.name, other.name
            )));
        }
        for component in &other.components {
            self.append_component(component.network.clone(), component.coefficient * scale)?;
        }
        Ok(())
    }

    /// Transitions between the ket and bra spaces: conjugates every network
    /// and coefficient. An involution.
    pub fn conjugate(&mut self) {
        self.ket = !self.ket;
        for component in &mut self.components {
            component.network.conjugate();
            component.coefficient = component.coefficient.conj();
        }
    }

    /// Full contraction `<bra|ket>`: pairs every component of `bra` with
    /// every component of `ket`, joining their open legs mode by mode. The
    /// result is a ket expansion of closed (scalar) networks.
    pub fn inner_product(bra: &TensorExpansion, ket: &TensorExpansion) -> Result<TensorExpansion> {
        if !bra.is_bra() || !ket.is_ket() {
            return Err(Error::Contract(format!(
                "inner product takes a bra and a ket, got `{}` and `{}`",
                bra.name, ket.name
            )));
        }
        if bra.rank() != ket.rank() {
            return Err(Error::Contract(format!(
                "rank mismatch between `{}` and `{}`",
                bra.name, ket.name
            )));
        }
        let mut product = TensorExpansion::new_ket(&format!("{}|{}", bra.name, ket.name));
        for (i, bra_comp) in bra.components.iter().enumerate() {
            for (j, ket_comp) in ket.components.iter().enumerate() {
                let name = format!("{}|{}_{i}_{j}", bra.name, ket.name);
                let network = glue_overlap(&name, &bra_comp.network, &ket_comp.network)?;
                product.append_component(network, bra_comp.coefficient * ket_comp.coefficient)?;
            }
        }
        Ok(product)
    }

    /// Applies a tensor-network operator to a ket expansion, producing a new
    /// ket expansion with one component per (component, operator-component)
    /// pair.
    pub fn apply_operator(
        ket: &TensorExpansion,
        operator: &TensorOperator,
    ) -> Result<TensorExpansion> {
        if !ket.is_ket() {
            return Err(Error::Contract(format!(
                "operator `{}` applies to a ket expansion, `{}` is a bra",
                operator.name(),
                ket.name
            )));
        }
        let mut result =
            TensorExpansion::new_ket(&format!("{}*{}", operator.name(), ket.name));
        for (i, component) in ket.components.iter().enumerate() {
            for (j, op_component) in operator.components().enumerate() {
                let name = format!("{}*{}_{i}_{j}", operator.name(), ket.name);
                let network = glue_operator(&name, &component.network, op_component)?;
                result.append_component(
                    network,
                    component.coefficient * op_component.coefficient(),
                )?;
            }
        }
        Ok(result)
    }
}

impl std::fmt::Display for TensorExpansion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "TensorExpansion `{}` [{}, {} components]:",
            self.name,
            if self.ket { "ket" } else { "bra" },
            self.components.len()
        )?;
        for component in &self.components {
            writeln!(f, " {} * `{}`", component.coefficient, component.network.name())?;
        }
        Ok(())
    }
}

/// Joins a bra network and a ket network over all their open legs, mode by
/// mode, producing one closed network. Ket inputs keep their ids; bra inputs
/// are renumbered past them.
fn glue_overlap(
    name: &str,
    bra: &TensorNetwork,
    ket: &TensorNetwork,
) -> Result<TensorNetwork> {
    let offset = ket.max_tensor_id();
    let mut inputs: Vec<TensorConn> = Vec::with_capacity(bra.num_inputs() + ket.num_inputs());
    for conn in ket.inputs() {
        inputs.push(conn.clone());
    }
    for conn in bra.inputs() {
        let mut conn = conn.clone();
        conn.id += offset;
        for leg in &mut conn.legs {
            if leg.peer_id != 0 {
                leg.peer_id += offset;
            }
        }
        inputs.push(conn);
    }

    // Mode m: ket open leg m joins the (renumbered) bra open leg m.
    for mode in 0..ket.rank() {
        let ket_leg = *ket.output().leg(mode as DimId);
        let bra_leg = *bra.output().leg(mode as DimId);
        let (kt, kd) = (ket_leg.peer_id(), ket_leg.peer_dim());
        let (bt, bd) = (bra_leg.peer_id() + offset, bra_leg.peer_dim());
        let ket_conn = inputs
            .iter_mut()
            .find(|c| c.id == kt)
            .expect("finalized network legs are valid");
        ket_conn.reset_leg(kd, bt, bd);
        let bra_conn = inputs
            .iter_mut()
            .find(|c| c.id == bt)
            .expect("finalized network legs are valid");
        bra_conn.reset_leg(bd, kt, kd);
    }

    let output = TensorConn::new(make_shared(Tensor::scalar(name)), 0, Vec::new());
    TensorNetwork::from_parts(name, output, inputs)
}

/// Inserts one operator component between the open legs of `ket` (through
/// the component's ket-leg map) and a fresh set of open legs (through its
/// bra-leg map).
fn glue_operator(
    name: &str,
    ket: &TensorNetwork,
    component: &OperatorComponent,
) -> Result<TensorNetwork> {
    let comp_tensor = component.tensor();
    let comp_id: TensorId = ket.max_tensor_id() + 1;
    let rank = ket.rank();

    let mut inputs: Vec<TensorConn> = ket.inputs().cloned().collect();
    let mut comp_legs: Vec<Option<TensorLeg>> = vec![None; comp_tensor.rank()];
    let mut output_legs: Vec<TensorLeg> = ket.output().legs().to_vec();
    let mut output_extents: Vec<u64> = ket.output().tensor().shape().extents().to_vec();
    let mut output_attrs = ket.output().tensor().signature().attributes().to_vec();

    for &(mode, comp_dim) in component.ket_legs() {
        if mode as usize >= rank {
            return Err(Error::Contract(format!(
                "operator component `{}` addresses mode {mode}, ket rank is {rank}",
                comp_tensor.name()
            )));
        }
        let open = output_legs[mode as usize];
        let (t, d) = (open.peer_id(), open.peer_dim());
        if comp_tensor.dim_extent(comp_dim) != ket.output().dim_extent(mode) {
            return Err(Error::Contract(format!(
                "operator component `{}` dimension {comp_dim} does not match mode {mode} extent",
                comp_tensor.name()
            )));
        }
        comp_legs[comp_dim as usize] = Some(TensorLeg::new(t, d));
        inputs
            .iter_mut()
            .find(|c| c.id == t)
            .expect("finalized network legs are valid")
            .reset_leg(d, comp_id, comp_dim);
    }

    for &(mode, comp_dim) in component.bra_legs() {
        if mode as usize >= rank {
            return Err(Error::Contract(format!(
                "operator component `{}` addresses mode {mode}, ket rank is {rank}",
                comp_tensor.name()
            )));
        }
        comp_legs[comp_dim as usize] = Some(TensorLeg::new(0, mode));
        output_legs[mode as usize] = TensorLeg::new(comp_id, comp_dim);
        output_extents[mode as usize] = comp_tensor.dim_extent(comp_dim);
        output_attrs[mode as usize] = comp_tensor.signature().dim_attr(comp_dim);
    }

    let comp_legs: Vec<TensorLeg> = comp_legs
        .into_iter()
        .map(|leg| leg.expect("leg maps partition the component dimensions"))
        .collect();
    inputs.push(TensorConn::new(comp_tensor.clone(), comp_id, comp_legs));

    let output_tensor = Tensor::with_signature(
        name,
        TensorShape::new(output_extents)?,
        TensorSignature::new(output_attrs),
    )?;
    let output = TensorConn::new(make_shared(output_tensor), 0, output_legs);
    TensorNetwork::from_parts(name, output, inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{make_shared, Tensor, TensorShape};
    use crate::tensornetwork::TensorLeg;
    use rustc_hash::FxHashMap;

    /// A 2-site matrix-product state with open physical legs:
    /// `Z(p,q) = A(p,b) * B(b,q)`.
    fn setup_mps2() -> TensorNetwork {
        let mut tensors = FxHashMap::default();
        tensors.insert(
            "Z".to_string(),
            make_shared(Tensor::new("Z", TensorShape::from([2, 2]))),
        );
        tensors.insert(
            "A".to_string(),
            make_shared(Tensor::new("A", TensorShape::from([2, 3]))),
        );
        tensors.insert(
            "B".to_string(),
            make_shared(Tensor::new("B", TensorShape::from([3, 2]))),
        );
        TensorNetwork::from_symbolic("mps2", "Z(p,q)=A(p,b)*B(b,q)", &tensors).unwrap()
    }

    fn setup_ket() -> TensorExpansion {
        let mut ket = TensorExpansion::new_ket("psi");
        ket.append_component(setup_mps2(), Complex64::new(0.5, 0.0))
            .unwrap();
        ket
    }

    #[test]
    fn test_append_requires_congruence() {
        let mut ket = setup_ket();
        let mut tensors = FxHashMap::default();
        tensors.insert(
            "Y".to_string(),
            make_shared(Tensor::new("Y", TensorShape::from([4]))),
        );
        tensors.insert(
            "C".to_string(),
            make_shared(Tensor::new("C", TensorShape::from([4]))),
        );
        let other = TensorNetwork::from_symbolic("other", "Y(i)=C(i)", &tensors).unwrap();
        assert!(ket
            .append_component(other, Complex64::new(1.0, 0.0))
            .is_err());
    }

    #[test]
    fn test_conjugate_is_involution() {
        let mut expansion = setup_ket();
        expansion.components_mut().for_each(|c| {
            c.coefficient = Complex64::new(0.5, 0.25);
        });
        let reference = expansion.clone();
        expansion.conjugate();
        assert!(expansion.is_bra());
        assert_eq!(
            expansion.components().next().unwrap().coefficient,
            Complex64::new(0.5, -0.25)
        );
        expansion.conjugate();
        assert!(expansion.is_ket());
        assert_eq!(
            expansion.components().next().unwrap().coefficient,
            reference.components().next().unwrap().coefficient
        );
        assert_eq!(
            expansion
                .components()
                .next()
                .unwrap()
                .network
                .topology_fingerprint(),
            reference
                .components()
                .next()
                .unwrap()
                .network
                .topology_fingerprint()
        );
    }

    #[test]
    fn test_inner_product_closes_networks() {
        let ket = setup_ket();
        let mut bra = setup_ket();
        bra.conjugate();
        let product = TensorExpansion::inner_product(&bra, &ket).unwrap();
        assert_eq!(product.num_components(), 1);
        let network = &product.components().next().unwrap().network;
        assert_eq!(network.rank(), 0);
        assert_eq!(network.num_inputs(), 4);
        assert!(network.is_finalized());
    }

    #[test]
    fn test_inner_product_requires_bra_and_ket() {
        let ket = setup_ket();
        assert!(TensorExpansion::inner_product(&ket, &ket).is_err());
    }

    #[test]
    fn test_apply_operator() {
        let ket = setup_ket();
        let mut operator = TensorOperator::new("h");
        let h = make_shared(Tensor::new("H", TensorShape::from([2, 2, 2, 2])));
        operator
            .append_component(
                h,
                vec![(0, 2), (1, 3)],
                vec![(0, 0), (1, 1)],
                Complex64::new(1.0, 0.0),
            )
            .unwrap();
        let applied = TensorExpansion::apply_operator(&ket, &operator).unwrap();
        assert_eq!(applied.num_components(), 1);
        let network = &applied.components().next().unwrap().network;
        assert_eq!(network.rank(), 2);
        assert_eq!(network.num_inputs(), 3);

        // The full sandwich <psi|H|psi> closes.
        let mut bra = setup_ket();
        bra.conjugate();
        let sandwich = TensorExpansion::inner_product(&bra, &applied).unwrap();
        assert_eq!(sandwich.components().next().unwrap().network.rank(), 0);
    }

    #[test]
    fn test_direct_sum_scales_coefficients() {
        let mut sum = setup_ket();
        let other = setup_ket();
        sum.append_expansion(&other, Complex64::new(-1.0, 0.0))
            .unwrap();
        assert_eq!(sum.num_components(), 2);
        let coefficients: Vec<Complex64> = sum.components().map(|c| c.coefficient).collect();
        assert_eq!(coefficients[1], Complex64::new(-0.5, 0.0));
    }
}
