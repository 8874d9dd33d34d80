//! Memory location identities used for alias disambiguation.
//!
//! Two accesses with different identities are assumed to touch disjoint
//! memory. A write against an identity invalidates all cached knowledge
//! about overlapping identities; [`MemLoc::Any`] overlaps everything.

use std::fmt;

use smallvec::SmallVec;

use crate::{ShapeRef, Type};

/// Identity of a disjoint (or, for `Any`, universal) memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemLoc {
    /// A specific field of a specific object shape.
    Field { shape: ShapeRef, field: u32 },

    /// Any element of an array whose element type is the given type.
    ArrayElem(Type),

    /// An opaque named region, used by raw (byte-offset) accesses.
    Named(u32),

    /// The universal identity; overlaps every other identity.
    Any,
}

impl MemLoc {
    /// Returns `true` if a write against `self` may change memory read
    /// through `other`.
    pub fn overlaps(self, other: MemLoc) -> bool {
        matches!(self, Self::Any) || matches!(other, Self::Any) || self == other
    }

    /// A single, non-aggregate region that raw accesses may legally cache
    /// through. `Any` is aggregate by definition.
    pub fn is_single(self) -> bool {
        !matches!(self, Self::Any)
    }
}

impl fmt::Display for MemLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Field { shape, field } => write!(f, "@{}.{}", shape.0, field),
            Self::ArrayElem(ty) => write!(f, "[{}]", ty),
            Self::Named(id) => write!(f, "named({})", id),
            Self::Any => f.write_str("any"),
        }
    }
}

/// The set of location identities an instruction may write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Kill {
    /// The instruction writes no memory.
    #[default]
    None,

    /// The instruction may write the listed identities only.
    Locations(SmallVec<[MemLoc; 4]>),

    /// The instruction may write anywhere.
    All,
}

impl Kill {
    pub fn locations(locs: &[MemLoc]) -> Self {
        Self::Locations(locs.into())
    }

    /// Returns `true` if this kill set may invalidate `loc`.
    pub fn kills(&self, loc: MemLoc) -> bool {
        match self {
            Self::None => false,
            Self::Locations(locs) => locs.iter().any(|l| l.overlaps(loc)),
            Self::All => true,
        }
    }

    pub fn kills_any(&self) -> bool {
        !matches!(self, Self::None)
    }
}
