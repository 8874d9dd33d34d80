//! Per-object abstract state for the escape analysis.

use smallvec::SmallVec;

use partita_ir::{ShapeRef, Type, Value};

/// An opaque id for a virtual object. Ids are dense and index the block
/// states' object slot arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);
cranelift_entity::entity_impl!(ObjectId);

/// Descriptor of an allocation site that has been virtualized at least
/// once. The descriptor itself is immutable; the mutable part lives in
/// [`ObjectState`].
#[derive(Debug, Clone)]
pub struct VirtualObject {
    /// The canonical IR value of the object: the original allocation's
    /// result. Entries of other virtual objects referring to this object
    /// hold this value.
    pub value: Value,

    /// The original allocation instruction.
    pub alloc: partita_ir::Insn,

    /// The entry values the allocation itself seeds. A materialization
    /// whose entries still equal the seeds can reuse the original
    /// allocation instead of emitting a new one.
    pub seeds: SmallVec<[Value; 8]>,

    pub kind: ObjectKind,
}

#[derive(Debug, Clone, Copy)]
pub enum ObjectKind {
    Struct { shape: ShapeRef },
    Array { elem_ty: Type, len: usize },
}

impl VirtualObject {
    pub fn entry_num(&self) -> usize {
        self.seeds.len()
    }
}

/// The state of one virtual object at one program point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectState {
    Virtual {
        /// Current entry values, one per field/element.
        entries: SmallVec<[Value; 8]>,

        /// How many monitors are virtually held on the object.
        locks: u32,

        /// The object must never be rematerialized.
        ensure_virtualized: bool,
    },

    Materialized {
        /// The concrete allocation that now represents the object.
        value: Value,
    },
}

impl ObjectState {
    pub fn virtual_with(entries: SmallVec<[Value; 8]>) -> Self {
        Self::Virtual {
            entries,
            locks: 0,
            ensure_virtualized: false,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual { .. })
    }

    pub fn entries(&self) -> &[Value] {
        match self {
            Self::Virtual { entries, .. } => entries,
            Self::Materialized { .. } => panic!("object is already materialized"),
        }
    }

    pub fn entry(&self, idx: usize) -> Value {
        self.entries()[idx]
    }

    pub fn materialized_value(&self) -> Option<Value> {
        match self {
            Self::Virtual { .. } => None,
            Self::Materialized { value } => Some(*value),
        }
    }

    pub fn lock_count(&self) -> u32 {
        match self {
            Self::Virtual { locks, .. } => *locks,
            Self::Materialized { .. } => 0,
        }
    }

    pub fn ensure_virtualized(&self) -> bool {
        match self {
            Self::Virtual {
                ensure_virtualized, ..
            } => *ensure_virtualized,
            Self::Materialized { .. } => false,
        }
    }

    pub fn set_ensure_virtualized(&mut self) {
        if let Self::Virtual {
            ensure_virtualized, ..
        } = self
        {
            *ensure_virtualized = true;
        }
    }

    pub fn clear_ensure_virtualized(&mut self) {
        if let Self::Virtual {
            ensure_virtualized, ..
        } = self
        {
            *ensure_virtualized = false;
        }
    }

    pub fn set_entry(&mut self, idx: usize, value: Value) {
        match self {
            Self::Virtual { entries, .. } => entries[idx] = value,
            Self::Materialized { .. } => panic!("object is already materialized"),
        }
    }

    pub fn add_lock(&mut self) {
        match self {
            Self::Virtual { locks, .. } => *locks += 1,
            Self::Materialized { .. } => panic!("object is already materialized"),
        }
    }

    /// Returns `true` if a virtually held lock was released.
    pub fn remove_lock(&mut self) -> bool {
        match self {
            Self::Virtual { locks, .. } if *locks > 0 => {
                *locks -= 1;
                true
            }
            _ => false,
        }
    }
}
