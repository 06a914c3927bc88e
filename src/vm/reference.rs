//! Metadata references used by helper calls.
//!
//! `VCALL` helpers such as `ECALL`, `BOX` or `LDFLD` name their target through an id into the
//! reference table of the custom stream. Resolving the id into a real metadata token is the
//! job of an external collaborator; this crate only needs the descriptors below to size
//! stack effects and to annotate instructions.

use std::{collections::BTreeMap, fmt};

/// A referenced type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeReference {
    /// Fully qualified type name
    pub name: String,
}

/// A referenced method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodReference {
    /// Declaring type name
    pub declaring_type: String,
    /// Method name
    pub name: String,
    /// Number of declared parameters, not counting `this`
    pub parameter_count: usize,
    /// Whether the method takes an instance parameter
    pub has_this: bool,
    /// Whether the method returns a value
    pub returns_value: bool,
}

/// A referenced field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldReference {
    /// Declaring type name
    pub declaring_type: String,
    /// Field name
    pub name: String,
    /// Whether the field is static
    pub is_static: bool,
}

/// A resolved reference table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A type
    Type(TypeReference),
    /// A method
    Method(MethodReference),
    /// A field
    Field(FieldReference),
}

impl Reference {
    /// Returns the method descriptor, if this is a method reference.
    #[must_use]
    pub fn as_method(&self) -> Option<&MethodReference> {
        match self {
            Reference::Method(method) => Some(method),
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Type(ty) => write!(f, "{}", ty.name),
            Reference::Method(method) => {
                write!(f, "{}::{}", method.declaring_type, method.name)
            }
            Reference::Field(field) => write!(f, "{}::{}", field.declaring_type, field.name),
        }
    }
}

/// Reference id to descriptor map.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    entries: BTreeMap<u32, Reference>,
}

impl ReferenceTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an entry.
    pub fn insert(&mut self, id: u32, reference: Reference) {
        self.entries.insert(id, reference);
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&Reference> {
        self.entries.get(&id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(u32, Reference)> for ReferenceTable {
    fn from_iter<I: IntoIterator<Item = (u32, Reference)>>(iter: I) -> Self {
        ReferenceTable {
            entries: iter.into_iter().collect(),
        }
    }
}
