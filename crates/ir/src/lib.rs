pub mod builder;
pub mod cfg;
pub mod dfg;
pub mod func_cursor;
pub mod function;
pub mod insn;
pub mod ir_writer;
pub mod layout;
pub mod location;
pub mod module;
pub mod types;
pub mod value;

pub use builder::FunctionBuilder;
pub use cfg::ControlFlowGraph;
pub use dfg::{Block, BlockData, DataFlowGraph};
pub use function::{Function, Signature};
pub use insn::{BinaryOp, BranchInfo, Insn, InsnData, UnaryOp};
pub use ir_writer::FuncWriter;
pub use layout::Layout;
pub use location::{Kill, MemLoc};
pub use module::{FuncRef, Module};
pub use types::{ShapeData, ShapeRef, Type};
pub use value::{Immediate, Value, ValueData};

#[cfg(test)]
mod tests {
    use super::{builder::test_util::test_func_builder, FuncWriter, Type};

    #[test]
    fn dump_simple_func() {
        let mut builder = test_func_builder(&[Type::I32, Type::I32], &[Type::I32]);
        let b0 = builder.append_block();

        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        let v2 = builder.add(args[0], args[1]);
        builder.ret(Some(v2));

        let func = builder.build();
        let dumped = FuncWriter::new(&func).dump_string();

        assert_eq!(
            dumped,
            "func %test_func(v0.i32, v1.i32) -> i32 {
    block0:
        v2.i32 = add v0 v1;
        return v2;

}
"
        );
    }

    #[test]
    fn users_follow_replacement() {
        let mut builder = test_func_builder(&[Type::I32], &[Type::I32]);
        let b0 = builder.append_block();

        let arg = builder.args()[0];
        builder.switch_to_block(b0);
        let ten = builder.make_imm_value(10i32);
        let v1 = builder.add(arg, ten);
        let v2 = builder.mul(v1, v1);
        builder.ret(Some(v2));

        let mut func = builder.build();
        assert_eq!(func.dfg.users_num(v1), 1);

        func.dfg.change_to_alias(v1, arg);
        assert_eq!(func.dfg.users_num(v1), 0);
        let mul = func.dfg.value_insn(v2).unwrap();
        assert_eq!(func.dfg.insn_args(mul), &[arg, arg]);
    }

    #[test]
    fn alloc_and_field_access() {
        let mut builder = test_func_builder(&[], &[Type::I64]);
        let b0 = builder.append_block();
        let point = builder.declare_shape("point", &[Type::I64, Type::I64]);

        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i64);
        let two = builder.make_imm_value(2i64);
        let obj = builder.alloc(point, &[one, two]);
        let x = builder.load_field(obj, point, 0);
        builder.ret(Some(x));

        let func = builder.build();
        assert_eq!(func.dfg.value_ty(obj), Type::Ref);
        assert_eq!(func.dfg.value_ty(x), Type::I64);

        let load = func.dfg.value_insn(x).unwrap();
        assert_eq!(func.dfg.insn_args(load), &[obj]);
        assert_eq!(func.dfg.users_num(obj), 1);
    }
}
