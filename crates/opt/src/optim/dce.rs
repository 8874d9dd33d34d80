//! This module contains a solver for dead code elimination.
//!
//! Liveness starts from side-effecting and control instructions and
//! propagates backwards through value arguments. Unreferenced pure
//! instructions, including phis nothing uses, are removed from the layout.
//! Block structure is left untouched; this pass never rewrites branches.

use cranelift_entity::SecondaryMap;

use partita_ir::{
    func_cursor::{CursorLocation, FuncCursor, InsnInserter},
    Function, Insn,
};

pub struct DceSolver {
    live_insts: SecondaryMap<Insn, bool>,
    worklist: Vec<Insn>,
}

impl DceSolver {
    pub fn new() -> Self {
        Self {
            live_insts: SecondaryMap::default(),
            worklist: Vec::default(),
        }
    }

    pub fn clear(&mut self) {
        self.live_insts.clear();
        self.worklist.clear();
    }

    pub fn run(&mut self, func: &mut Function) -> bool {
        self.clear();

        for block in func.layout.iter_block() {
            for insn in func.layout.iter_insn(block) {
                if func.dfg.has_side_effect(insn) || func.dfg.is_terminator(insn) {
                    self.mark_insn(insn);
                }
            }
        }

        while let Some(insn) = self.worklist.pop() {
            self.mark_args(func, insn);
        }

        self.eliminate_dead_code(func)
    }

    fn mark_insn(&mut self, insn: Insn) {
        if !self.live_insts[insn] {
            self.live_insts[insn] = true;
            self.worklist.push(insn);
        }
    }

    fn mark_args(&mut self, func: &Function, insn: Insn) {
        let args: smallvec::SmallVec<[partita_ir::Value; 8]> =
            func.dfg.insn_args(insn).into();
        for arg in args {
            if let Some(value_insn) = func.dfg.value_insn(arg) {
                self.mark_insn(value_insn);
            }
        }
    }

    /// Returns `true` if any instruction was removed.
    fn eliminate_dead_code(&mut self, func: &mut Function) -> bool {
        let entry = match func.layout.entry_block() {
            Some(entry) => entry,
            None => return false,
        };

        let mut changed = false;
        let mut inserter = InsnInserter::new(func, CursorLocation::BlockTop(entry));
        loop {
            match inserter.loc() {
                CursorLocation::At(insn) => {
                    if self.live_insts[insn] {
                        inserter.proceed();
                    } else {
                        inserter.remove_insn();
                        changed = true;
                    }
                }

                CursorLocation::BlockTop(..) | CursorLocation::BlockBottom(..) => {
                    inserter.proceed();
                }

                CursorLocation::NoWhere => break,
            }
        }

        changed
    }
}

impl Default for DceSolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::DceSolver;

    use partita_ir::{builder::test_util::test_func_builder, Type};

    #[test]
    fn removes_unused_pure_insns() {
        let mut builder = test_func_builder(&[Type::I32], &[Type::I32]);
        let b0 = builder.append_block();

        let arg = builder.args()[0];
        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i32);
        let used = builder.add(arg, one);
        let unused = builder.mul(arg, arg);
        let unused2 = builder.add(unused, one);
        builder.ret(Some(used));

        let mut func = builder.build();
        assert!(DceSolver::new().run(&mut func));

        let live: Vec<_> = func.layout.iter_insn(b0).collect();
        assert_eq!(live.len(), 2);
        assert!(func.dfg.value_insn(unused2).is_some());
        assert!(!func
            .layout
            .is_insn_inserted(func.dfg.value_insn(unused2).unwrap()));
    }

    #[test]
    fn keeps_stores_and_their_operands() {
        let mut builder = test_func_builder(&[Type::Ref, Type::I64], &[]);
        let b0 = builder.append_block();
        let shape = builder.declare_shape("cell", &[Type::I64]);

        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i64);
        let sum = builder.add(args[1], one);
        builder.store_field(args[0], shape, 0, sum);
        builder.ret(None);

        let mut func = builder.build();
        assert!(!DceSolver::new().run(&mut func));

        let live: Vec<_> = func.layout.iter_insn(b0).collect();
        assert_eq!(live.len(), 3);
    }
}
