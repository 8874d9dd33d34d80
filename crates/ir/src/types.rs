//! This module contains partita IR types and object shape definitions.

use std::fmt;

use smallvec::SmallVec;

/// Partita IR value types.
///
/// `Ref` is the only non-numeric kind; it denotes a reference to a heap
/// object or array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    I1,
    I8,
    I16,
    I32,
    I64,
    Ref,
}

impl Type {
    pub fn is_integral(self) -> bool {
        !matches!(self, Self::Ref)
    }

    pub fn is_ref(self) -> bool {
        matches!(self, Self::Ref)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::I1 => f.write_str("i1"),
            Self::I8 => f.write_str("i8"),
            Self::I16 => f.write_str("i16"),
            Self::I32 => f.write_str("i32"),
            Self::I64 => f.write_str("i64"),
            Self::Ref => f.write_str("ref"),
        }
    }
}

/// An opaque reference to [`ShapeData`].
#[derive(Debug, Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct ShapeRef(pub u32);
cranelift_entity::entity_impl!(ShapeRef);

/// The statically known layout of an object allocation: an ordered list of
/// typed fields. Allocations referring to a shape are candidates for
/// scalar replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeData {
    pub name: String,
    pub fields: SmallVec<[Type; 8]>,
}

impl ShapeData {
    pub fn new(name: impl Into<String>, fields: &[Type]) -> Self {
        Self {
            name: name.into(),
            fields: fields.into(),
        }
    }

    pub fn field_num(&self) -> usize {
        self.fields.len()
    }

    pub fn field_ty(&self, field: u32) -> Type {
        self.fields[field as usize]
    }
}
