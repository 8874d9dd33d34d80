use cranelift_entity::PrimaryMap;

use crate::Function;

/// A collection of functions. Each function's graph is owned exclusively,
/// so independent functions can be optimized concurrently.
#[derive(Debug, Default)]
pub struct Module {
    /// Holds all functions declared in the module.
    pub funcs: PrimaryMap<FuncRef, Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_function(&mut self, func: Function) -> FuncRef {
        self.funcs.push(func)
    }

    pub fn iter_functions(&self) -> impl Iterator<Item = FuncRef> {
        self.funcs.keys()
    }
}

/// An opaque reference to a [`Function`] in a [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncRef(pub u32);
cranelift_entity::entity_impl!(FuncRef);
