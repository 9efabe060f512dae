//! Registry of named vector spaces and their subspaces. Every tensor
//! signature refers to entries of this registry (or to the anonymous space,
//! id 0, which always exists).

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::types::{
    DimExtent, DimOffset, SpaceId, SubspaceId, FULL_SUBSPACE, MAX_SPACE_DIM, SOME_SPACE,
};

/// A registered vector space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorSpace {
    id: SpaceId,
    name: String,
    dimension: DimExtent,
}

impl VectorSpace {
    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> DimExtent {
        self.dimension
    }
}

/// A registered subspace of a vector space, defined by a half-open basis
/// range `[lower, upper)` within its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    id: SubspaceId,
    space_id: SpaceId,
    name: String,
    lower: DimOffset,
    upper: DimOffset,
}

impl Subspace {
    pub fn id(&self) -> SubspaceId {
        self.id
    }

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lower_bound(&self) -> DimOffset {
        self.lower
    }

    /// Exclusive upper bound.
    pub fn upper_bound(&self) -> DimOffset {
        self.upper
    }

    pub fn dimension(&self) -> DimExtent {
        self.upper - self.lower
    }
}

/// Engine-wide registry of vector spaces and subspaces. Single-writer under
/// the pump thread; callers requiring multi-threaded access must serialize
/// externally.
#[derive(Debug)]
pub struct SpaceRegistry {
    spaces: FxHashMap<SpaceId, VectorSpace>,
    space_names: FxHashMap<String, SpaceId>,
    subspaces: FxHashMap<SpaceId, FxHashMap<SubspaceId, Subspace>>,
    subspace_names: FxHashMap<String, (SpaceId, SubspaceId)>,
    next_space_id: SpaceId,
    next_subspace_id: SubspaceId,
}

impl Default for SpaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceRegistry {
    /// Creates a registry holding only the anonymous space.
    pub fn new() -> Self {
        let mut spaces = FxHashMap::default();
        spaces.insert(
            SOME_SPACE,
            VectorSpace {
                id: SOME_SPACE,
                name: String::new(),
                dimension: MAX_SPACE_DIM,
            },
        );
        Self {
            spaces,
            space_names: FxHashMap::default(),
            subspaces: FxHashMap::default(),
            subspace_names: FxHashMap::default(),
            next_space_id: 1,
            next_subspace_id: 1,
        }
    }

    /// Registers a named vector space and returns its id. The full subspace
    /// (id 0) is registered automatically under the space name.
    pub fn create_space(&mut self, name: &str, dimension: DimExtent) -> Result<SpaceId> {
        if name.is_empty() {
            return Err(Error::Contract("space name must not be empty".to_string()));
        }
        if dimension == 0 {
            return Err(Error::Contract(format!(
                "space `{name}` must have a positive dimension"
            )));
        }
        if self.space_names.contains_key(name) {
            return Err(Error::Duplicate {
                kind: "space",
                name: name.to_string(),
            });
        }
        let id = self.next_space_id;
        self.next_space_id += 1;
        self.spaces.insert(
            id,
            VectorSpace {
                id,
                name: name.to_string(),
                dimension,
            },
        );
        self.space_names.insert(name.to_string(), id);
        let full = Subspace {
            id: FULL_SUBSPACE,
            space_id: id,
            name: name.to_string(),
            lower: 0,
            upper: dimension,
        };
        self.subspaces
            .entry(id)
            .or_default()
            .insert(FULL_SUBSPACE, full);
        self.subspace_names
            .insert(name.to_string(), (id, FULL_SUBSPACE));
        Ok(id)
    }

    pub fn space(&self, id: SpaceId) -> Option<&VectorSpace> {
        self.spaces.get(&id)
    }

    pub fn space_by_name(&self, name: &str) -> Option<&VectorSpace> {
        self.space_names.get(name).and_then(|id| self.spaces.get(id))
    }

    /// Destroys a named vector space together with its subspaces.
    pub fn destroy_space(&mut self, name: &str) -> Result<()> {
        let id = *self.space_names.get(name).ok_or_else(|| Error::RegistryMiss {
            kind: "space",
            name: name.to_string(),
        })?;
        self.destroy_space_by_id(id)
    }

    pub fn destroy_space_by_id(&mut self, id: SpaceId) -> Result<()> {
        if id == SOME_SPACE {
            return Err(Error::Contract(
                "the anonymous space cannot be destroyed".to_string(),
            ));
        }
        let space = self.spaces.remove(&id).ok_or_else(|| Error::RegistryMiss {
            kind: "space",
            name: id.to_string(),
        })?;
        self.space_names.remove(&space.name);
        if let Some(subs) = self.subspaces.remove(&id) {
            for subspace in subs.values() {
                self.subspace_names.remove(&subspace.name);
            }
        }
        Ok(())
    }

    /// Registers a named subspace of a named space from inclusive basis
    /// bounds. The range must be strictly inside the parent space.
    pub fn create_subspace(
        &mut self,
        name: &str,
        space_name: &str,
        bounds: (DimOffset, DimOffset),
    ) -> Result<SubspaceId> {
        if self.subspace_names.contains_key(name) {
            return Err(Error::Duplicate {
                kind: "subspace",
                name: name.to_string(),
            });
        }
        let space = self
            .space_by_name(space_name)
            .ok_or_else(|| Error::RegistryMiss {
                kind: "space",
                name: space_name.to_string(),
            })?;
        let (lower, upper_incl) = bounds;
        if lower > upper_incl || upper_incl >= space.dimension {
            return Err(Error::Contract(format!(
                "subspace `{name}` bounds [{lower}:{upper_incl}] do not fit space `{space_name}` of dimension {}",
                space.dimension
            )));
        }
        let space_id = space.id;
        if lower == 0 && upper_incl + 1 == space.dimension {
            return Err(Error::Contract(format!(
                "subspace `{name}` covers all of `{space_name}`; the full subspace is registered implicitly"
            )));
        }
        let id = self.next_subspace_id;
        self.next_subspace_id += 1;
        self.subspaces.entry(space_id).or_default().insert(
            id,
            Subspace {
                id,
                space_id,
                name: name.to_string(),
                lower,
                upper: upper_incl + 1,
            },
        );
        self.subspace_names.insert(name.to_string(), (space_id, id));
        Ok(id)
    }

    pub fn subspace(&self, name: &str) -> Option<&Subspace> {
        let (space_id, subspace_id) = self.subspace_names.get(name)?;
        self.subspaces.get(space_id)?.get(subspace_id)
    }

    pub fn subspace_by_id(&self, space_id: SpaceId, subspace_id: SubspaceId) -> Option<&Subspace> {
        self.subspaces.get(&space_id)?.get(&subspace_id)
    }

    pub fn destroy_subspace(&mut self, name: &str) -> Result<()> {
        let (space_id, subspace_id) =
            self.subspace_names
                .remove(name)
                .ok_or_else(|| Error::RegistryMiss {
                    kind: "subspace",
                    name: name.to_string(),
                })?;
        if subspace_id == FULL_SUBSPACE {
            return Err(Error::Contract(format!(
                "full subspace `{name}` lives and dies with its space"
            )));
        }
        self.subspaces
            .get_mut(&space_id)
            .and_then(|subs| subs.remove(&subspace_id));
        Ok(())
    }
}
