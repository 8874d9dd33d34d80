use crate::{DataFlowGraph, Layout, Type, Value};

#[derive(Debug)]
pub struct Function {
    /// Name of the function.
    pub name: String,

    /// Signature of the function.
    pub sig: Signature,
    pub arg_values: Vec<Value>,

    pub dfg: DataFlowGraph,
    pub layout: Layout,
}

impl Function {
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        let mut dfg = DataFlowGraph::new();
        let arg_values = sig
            .args()
            .iter()
            .enumerate()
            .map(|(idx, arg_ty)| dfg.make_arg_value(*arg_ty, idx))
            .collect();

        Self {
            name: name.into(),
            sig,
            arg_values,
            dfg,
            layout: Layout::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Signature {
    args: Vec<Type>,
    rets: Vec<Type>,
}

impl Signature {
    pub fn new(args: &[Type], rets: &[Type]) -> Self {
        Self {
            args: args.into(),
            rets: rets.into(),
        }
    }

    pub fn args(&self) -> &[Type] {
        &self.args
    }

    pub fn returns(&self) -> &[Type] {
        &self.rets
    }
}
