use smallvec::SmallVec;

use crate::{
    func_cursor::{CursorLocation, FuncCursor, InsnInserter},
    insn::{BinaryOp, InsnData, UnaryOp},
    location::{Kill, MemLoc},
    module::FuncRef,
    Block, Function, Immediate, ShapeData, ShapeRef, Signature, Type, Value,
};

pub struct FunctionBuilder {
    func: Function,
    loc: CursorLocation,
}

macro_rules! impl_unary_insn {
    ($name:ident, $code:path) => {
        pub fn $name(&mut self, lhs: Value) -> Value {
            self.insert_insn(InsnData::unary($code, lhs)).unwrap()
        }
    };
}

macro_rules! impl_binary_insn {
    ($name:ident, $code:path) => {
        pub fn $name(&mut self, lhs: Value, rhs: Value) -> Value {
            self.insert_insn(InsnData::binary($code, lhs, rhs)).unwrap()
        }
    };
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        Self {
            func: Function::new(name, sig),
            loc: CursorLocation::NoWhere,
        }
    }

    pub fn append_block(&mut self) -> Block {
        let block = self.func.dfg.make_block();
        self.func.layout.append_block(block);
        block
    }

    pub fn switch_to_block(&mut self, block: Block) {
        self.loc = CursorLocation::BlockBottom(block);
    }

    pub fn make_imm_value<Imm>(&mut self, imm: Imm) -> Value
    where
        Imm: Into<Immediate>,
    {
        self.func.dfg.make_imm_value(imm)
    }

    pub fn make_null_value(&mut self) -> Value {
        self.func.dfg.make_imm_value(Immediate::Null)
    }

    pub fn declare_shape(&mut self, name: &str, fields: &[Type]) -> ShapeRef {
        self.func.dfg.declare_shape(ShapeData::new(name, fields))
    }

    impl_unary_insn!(not, UnaryOp::Not);
    impl_unary_insn!(neg, UnaryOp::Neg);

    impl_binary_insn!(add, BinaryOp::Add);
    impl_binary_insn!(sub, BinaryOp::Sub);
    impl_binary_insn!(mul, BinaryOp::Mul);
    impl_binary_insn!(eq, BinaryOp::Eq);
    impl_binary_insn!(ne, BinaryOp::Ne);
    impl_binary_insn!(lt, BinaryOp::Lt);
    impl_binary_insn!(gt, BinaryOp::Gt);
    impl_binary_insn!(and, BinaryOp::And);
    impl_binary_insn!(or, BinaryOp::Or);

    pub fn alloc(&mut self, shape: ShapeRef, args: &[Value]) -> Value {
        debug_assert_eq!(self.func.dfg.shape(shape).field_num(), args.len());
        self.insert_insn(InsnData::Alloc {
            shape,
            args: args.into(),
        })
        .unwrap()
    }

    pub fn alloc_array(&mut self, elem_ty: Type, len: Value) -> Value {
        self.insert_insn(InsnData::AllocArray {
            elem_ty,
            args: [len],
        })
        .unwrap()
    }

    pub fn load_field(&mut self, base: Value, shape: ShapeRef, field: u32) -> Value {
        self.insert_insn(InsnData::LoadField {
            args: [base],
            shape,
            field,
            volatile: false,
        })
        .unwrap()
    }

    pub fn load_field_volatile(&mut self, base: Value, shape: ShapeRef, field: u32) -> Value {
        self.insert_insn(InsnData::LoadField {
            args: [base],
            shape,
            field,
            volatile: true,
        })
        .unwrap()
    }

    pub fn store_field(&mut self, base: Value, shape: ShapeRef, field: u32, value: Value) {
        self.insert_insn(InsnData::StoreField {
            args: [base, value],
            shape,
            field,
            volatile: false,
        });
    }

    pub fn store_field_volatile(&mut self, base: Value, shape: ShapeRef, field: u32, value: Value) {
        self.insert_insn(InsnData::StoreField {
            args: [base, value],
            shape,
            field,
            volatile: true,
        });
    }

    pub fn load_elem(&mut self, base: Value, index: Value, elem_ty: Type) -> Value {
        self.insert_insn(InsnData::LoadElem {
            args: [base, index],
            elem_ty,
        })
        .unwrap()
    }

    pub fn store_elem(&mut self, base: Value, index: Value, value: Value, elem_ty: Type) {
        self.insert_insn(InsnData::StoreElem {
            args: [base, index, value],
            elem_ty,
        });
    }

    pub fn raw_load(&mut self, base: Value, offset: Value, loc: MemLoc, ty: Type) -> Value {
        self.insert_insn(InsnData::RawLoad {
            args: [base, offset],
            loc,
            ty,
        })
        .unwrap()
    }

    pub fn raw_store(&mut self, base: Value, offset: Value, value: Value, loc: MemLoc) {
        self.insert_insn(InsnData::RawStore {
            args: [base, offset, value],
            loc,
        });
    }

    pub fn monitor_enter(&mut self, value: Value) {
        self.insert_insn(InsnData::MonitorEnter { args: [value] });
    }

    pub fn monitor_exit(&mut self, value: Value) {
        self.insert_insn(InsnData::MonitorExit { args: [value] });
    }

    pub fn ensure_virtualized(&mut self, value: Value) {
        self.insert_insn(InsnData::EnsureVirtualized { args: [value] });
    }

    pub fn call(
        &mut self,
        callee: FuncRef,
        args: &[Value],
        ret_ty: Option<Type>,
        kill: Kill,
    ) -> Option<Value> {
        self.insert_insn(InsnData::Call {
            callee,
            args: args.into(),
            ret_ty,
            kill,
        })
    }

    pub fn jump(&mut self, dest: Block) {
        self.insert_insn(InsnData::jump(dest));
    }

    pub fn br(&mut self, cond: Value, then: Block, else_: Block) {
        self.insert_insn(InsnData::Branch {
            args: [cond],
            dests: [then, else_],
        });
    }

    pub fn ret(&mut self, arg: Option<Value>) {
        let args: SmallVec<[Value; 2]> = arg.into_iter().collect();
        self.insert_insn(InsnData::Return { args });
    }

    pub fn phi(&mut self, args: &[(Value, Block)]) -> Value {
        let ty = self.func.dfg.value_ty(args[0].0);
        let insn_data = InsnData::Phi {
            values: args.iter().map(|(val, _)| *val).collect(),
            blocks: args.iter().map(|(_, block)| *block).collect(),
            ty,
        };
        self.insert_insn(insn_data).unwrap()
    }

    pub fn append_phi_arg(&mut self, phi_value: Value, value: Value, block: Block) {
        let insn = self
            .func
            .dfg
            .value_insn(phi_value)
            .expect("value must be the result of a phi function");
        debug_assert!(self.func.dfg.is_phi(insn));
        self.func.dfg.append_phi_arg(insn, value, block);
    }

    pub fn args(&self) -> &[Value] {
        &self.func.arg_values
    }

    pub fn type_of(&self, value: Value) -> Type {
        self.func.dfg.value_ty(value)
    }

    pub fn build(self) -> Function {
        self.func
    }

    fn insert_insn(&mut self, data: InsnData) -> Option<Value> {
        let mut inserter = InsnInserter::new(&mut self.func, self.loc);
        let insn = inserter.insert_insn_data(data);
        let result = inserter.make_result(insn);
        if let Some(result) = result {
            inserter.attach_result(insn, result);
        }
        result
    }
}

pub mod test_util {
    use super::*;

    pub fn test_func_builder(args: &[Type], rets: &[Type]) -> FunctionBuilder {
        FunctionBuilder::new("test_func", Signature::new(args, rets))
    }
}
