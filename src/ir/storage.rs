use crate::error::{Error, Result};
use crate::tensor::{Tensor, Type};
use std::collections::HashMap;
use std::fmt;

/// Whether instructions may write a location after it has been initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutability {
    Constant,
    Mutable,
}

/// Whether a location is part of the external surface of a compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// May be bound to caller tensors and read back as a result.
    Public,
    /// Internal to the compiled unit.
    Private,
}

impl fmt::Display for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutability::Constant => write!(f, "const"),
            Mutability::Mutable => write!(f, "mut"),
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

/// Stable index of a location inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationId(pub usize);

/// Non-owning handle used by instruction operands.
///
/// `Weight` locations live in the engine-wide arena and survive recompilation;
/// `Activation` locations belong to one compiled function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Weight(LocationId),
    Activation(LocationId),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Weight(id) => write!(f, "%w{}", id.0),
            Value::Activation(id) => write!(f, "%a{}", id.0),
        }
    }
}

/// A named, typed buffer tagged with its mutability and visibility.
///
/// The tags are fixed at creation. `set_mutability` and `set_visibility` only
/// flip the tag; they never touch the payload or any emitted instruction.
#[derive(Debug, Clone)]
pub struct StorageLocation {
    name: String,
    mutability: Mutability,
    visibility: Visibility,
    payload: Tensor,
}

impl StorageLocation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &Type {
        self.payload.ty()
    }

    pub fn mutability(&self) -> Mutability {
        self.mutability
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_constant(&self) -> bool {
        self.mutability == Mutability::Constant
    }

    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }

    pub fn set_mutability(&mut self, mutability: Mutability) {
        self.mutability = mutability;
    }

    pub fn set_visibility(&mut self, visibility: Visibility) {
        self.visibility = visibility;
    }

    pub fn payload(&self) -> &Tensor {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Tensor {
        &mut self.payload
    }
}

/// Flat collection of storage locations with unique names.
#[derive(Debug, Clone, Default)]
pub struct StorageArena {
    locations: Vec<StorageLocation>,
    names: HashMap<String, LocationId>,
}

impl StorageArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero-initialized location.
    pub fn create(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        mutability: Mutability,
        visibility: Visibility,
    ) -> Result<LocationId> {
        self.insert(name.into(), Tensor::zeros(ty), mutability, visibility)
    }

    /// Create a location holding `payload`, which must have type `ty`.
    pub fn create_with_payload(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        mutability: Mutability,
        visibility: Visibility,
        payload: Tensor,
    ) -> Result<LocationId> {
        let name = name.into();
        if payload.ty() != &ty {
            return Err(Error::PayloadMismatch {
                name,
                expected: ty.to_string(),
                got: payload.ty().to_string(),
            });
        }
        self.insert(name, payload, mutability, visibility)
    }

    fn insert(
        &mut self,
        name: String,
        payload: Tensor,
        mutability: Mutability,
        visibility: Visibility,
    ) -> Result<LocationId> {
        if self.names.contains_key(&name) {
            return Err(Error::DuplicateName {
                name,
                scope: "storage arena",
            });
        }
        let id = LocationId(self.locations.len());
        self.names.insert(name.clone(), id);
        self.locations.push(StorageLocation {
            name,
            mutability,
            visibility,
            payload,
        });
        Ok(id)
    }

    pub fn get(&self, id: LocationId) -> Result<&StorageLocation> {
        self.locations
            .get(id.0)
            .ok_or_else(|| Error::UnknownLocation(format!("#{}", id.0)))
    }

    pub fn get_mut(&mut self, id: LocationId) -> Result<&mut StorageLocation> {
        self.locations
            .get_mut(id.0)
            .ok_or_else(|| Error::UnknownLocation(format!("#{}", id.0)))
    }

    pub fn id_of(&self, name: &str) -> Option<LocationId> {
        self.names.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&StorageLocation> {
        self.id_of(name).map(|id| &self.locations[id.0])
    }

    pub fn set_mutability(&mut self, id: LocationId, mutability: Mutability) -> Result<()> {
        self.get_mut(id)?.set_mutability(mutability);
        Ok(())
    }

    pub fn set_visibility(&mut self, id: LocationId, visibility: Visibility) -> Result<()> {
        self.get_mut(id)?.set_visibility(visibility);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (LocationId, &StorageLocation)> {
        self.locations
            .iter()
            .enumerate()
            .map(|(i, loc)| (LocationId(i), loc))
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}
