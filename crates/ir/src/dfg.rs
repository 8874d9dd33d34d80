//! This module contains the partita IR data flow graph.

use std::collections::BTreeSet;

use cranelift_entity::{packed_option::PackedOption, PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;

use crate::{
    insn::{BranchInfo, Insn, InsnData},
    types::{ShapeData, ShapeRef},
    value::{Immediate, Value, ValueData},
    Type,
};

/// An opaque reference to [`BlockData`].
#[derive(Debug, Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct Block(pub u32);
cranelift_entity::entity_impl!(Block);

/// A block data definition.
/// A block doesn't hold any layout information; ordering of blocks and
/// instructions is managed by [`crate::Layout`].
#[derive(Debug, Clone, Default)]
pub struct BlockData {}

#[derive(Debug, Default)]
pub struct DataFlowGraph {
    #[doc(hidden)]
    pub blocks: PrimaryMap<Block, BlockData>,
    insns: PrimaryMap<Insn, InsnData>,
    values: PrimaryMap<Value, ValueData>,
    insn_results: SecondaryMap<Insn, PackedOption<Value>>,
    immediates: FxHashMap<Immediate, Value>,
    users: SecondaryMap<Value, BTreeSet<Insn>>,
    shapes: PrimaryMap<ShapeRef, ShapeData>,
}

impl DataFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    pub fn make_insn(&mut self, insn: InsnData) -> Insn {
        let insn = self.insns.push(insn);
        self.attach_user(insn);
        insn
    }

    pub fn make_value(&mut self, value: ValueData) -> Value {
        self.values.push(value)
    }

    pub fn make_imm_value<Imm>(&mut self, imm: Imm) -> Value
    where
        Imm: Into<Immediate>,
    {
        let imm: Immediate = imm.into();
        if let Some(&value) = self.immediates.get(&imm) {
            return value;
        }

        let ty = imm.ty();
        let value = self.make_value(ValueData::Immediate { imm, ty });
        self.immediates.insert(imm, value);
        value
    }

    /// Returns the zero/default value of the given type.
    pub fn make_default_value(&mut self, ty: Type) -> Value {
        self.make_imm_value(Immediate::default_of(ty))
    }

    pub fn make_arg_value(&mut self, ty: Type, idx: usize) -> Value {
        self.make_value(ValueData::Arg { ty, idx })
    }

    pub fn declare_shape(&mut self, data: ShapeData) -> ShapeRef {
        self.shapes.push(data)
    }

    pub fn shape(&self, shape: ShapeRef) -> &ShapeData {
        &self.shapes[shape]
    }

    /// Creates the result value data for the instruction, or `None` if the
    /// instruction doesn't define a value.
    pub fn make_result(&mut self, insn: Insn) -> Option<ValueData> {
        let ty = self.result_ty(insn)?;
        Some(ValueData::Insn { insn, ty })
    }

    fn result_ty(&self, insn: Insn) -> Option<Type> {
        match &self.insns[insn] {
            InsnData::Unary { args, .. } => Some(self.value_ty(args[0])),
            InsnData::Binary { code, args } => {
                use crate::insn::BinaryOp::*;
                match code {
                    Eq | Ne | Lt | Gt => Some(Type::I1),
                    _ => Some(self.value_ty(args[0])),
                }
            }
            InsnData::Alloc { .. } | InsnData::AllocArray { .. } => Some(Type::Ref),
            InsnData::LoadField { shape, field, .. } => Some(self.shapes[*shape].field_ty(*field)),
            InsnData::LoadElem { elem_ty, .. } => Some(*elem_ty),
            InsnData::RawLoad { ty, .. } => Some(*ty),
            InsnData::Call { ret_ty, .. } => *ret_ty,
            InsnData::Proxy { ty, .. } => Some(*ty),
            InsnData::Phi { ty, .. } => Some(*ty),
            _ => None,
        }
    }

    pub fn attach_result(&mut self, insn: Insn, value: Value) {
        debug_assert!(self.insn_results[insn].is_none());
        self.insn_results[insn] = value.into();
    }

    pub fn insn_data(&self, insn: Insn) -> &InsnData {
        &self.insns[insn]
    }

    pub fn insn_data_mut(&mut self, insn: Insn) -> &mut InsnData {
        &mut self.insns[insn]
    }

    pub fn value(&self, value: Value) -> &ValueData {
        &self.values[value]
    }

    pub fn value_ty(&self, value: Value) -> Type {
        match &self.values[value] {
            ValueData::Insn { ty, .. }
            | ValueData::Arg { ty, .. }
            | ValueData::Immediate { ty, .. } => *ty,
        }
    }

    /// Returns the immediate if the value is constant.
    pub fn value_imm(&self, value: Value) -> Option<Immediate> {
        match &self.values[value] {
            ValueData::Immediate { imm, .. } => Some(*imm),
            _ => None,
        }
    }

    /// Returns the instruction defining the value, if any.
    pub fn value_insn(&self, value: Value) -> Option<Insn> {
        match &self.values[value] {
            ValueData::Insn { insn, .. } => Some(*insn),
            _ => None,
        }
    }

    pub fn insn_result(&self, insn: Insn) -> Option<Value> {
        self.insn_results[insn].expand()
    }

    pub fn insn_args(&self, insn: Insn) -> &[Value] {
        self.insns[insn].args()
    }

    pub fn attach_user(&mut self, insn: Insn) {
        for &arg in self.insns[insn].args() {
            self.users[arg].insert(insn);
        }
    }

    pub fn untrack_insn(&mut self, insn: Insn) {
        let args: smallvec::SmallVec<[Value; 8]> = self.insns[insn].args().into();
        for arg in args {
            self.users[arg].remove(&insn);
        }
    }

    pub fn remove_user(&mut self, value: Value, user: Insn) {
        self.users[value].remove(&user);
    }

    /// Returns all instructions that use the `value`.
    pub fn users(&self, value: Value) -> impl Iterator<Item = &Insn> {
        self.users[value].iter()
    }

    pub fn users_num(&self, value: Value) -> usize {
        self.users[value].len()
    }

    /// Rewrites every use of `value` to `alias`.
    pub fn change_to_alias(&mut self, value: Value, alias: Value) {
        let mut users = std::mem::take(&mut self.users[value]);
        for &insn in &users {
            for arg in self.insns[insn].args_mut() {
                if *arg == value {
                    *arg = alias;
                }
            }
        }
        self.users[alias].append(&mut users);
    }

    /// Replaces one occurrence of `old` among the instruction's arguments
    /// with `new`.
    pub fn replace_insn_arg(&mut self, insn: Insn, old: Value, new: Value) {
        let mut replaced = false;
        for arg in self.insns[insn].args_mut() {
            if *arg == old && !replaced {
                *arg = new;
                replaced = true;
            }
        }
        if replaced {
            if !self.insns[insn].args().contains(&old) {
                self.users[old].remove(&insn);
            }
            self.users[new].insert(insn);
        }
    }

    pub fn branch_info(&self, insn: Insn) -> BranchInfo {
        self.insns[insn].analyze_branch()
    }

    pub fn is_branch(&self, insn: Insn) -> bool {
        !matches!(self.branch_info(insn), BranchInfo::NotBranch)
    }

    pub fn is_terminator(&self, insn: Insn) -> bool {
        self.insns[insn].is_terminator()
    }

    pub fn is_phi(&self, insn: Insn) -> bool {
        self.insns[insn].is_phi()
    }

    pub fn has_side_effect(&self, insn: Insn) -> bool {
        self.insns[insn].has_side_effect()
    }

    pub fn append_phi_arg(&mut self, insn: Insn, value: Value, block: Block) {
        self.insns[insn].append_phi_arg(value, block);
        self.users[value].insert(insn);
    }

    /// Sets the phi argument flowing in from `block`, appending it if the
    /// phi has no argument for that block yet. Returns `true` if the phi
    /// was modified.
    pub fn set_phi_arg(&mut self, insn: Insn, value: Value, block: Block) -> bool {
        let old = match self.insns[insn].phi_arg_of(block) {
            Some(old) if old == value => return false,
            old => old,
        };

        match &mut self.insns[insn] {
            InsnData::Phi { values, blocks, .. } => {
                if let Some(pos) = blocks.iter().position(|b| *b == block) {
                    values[pos] = value;
                } else {
                    values.push(value);
                    blocks.push(block);
                }
            }
            _ => panic!("not a phi"),
        }

        if let Some(old) = old {
            if !self.insns[insn].args().contains(&old) {
                self.users[old].remove(&insn);
            }
        }
        self.users[value].insert(insn);
        true
    }

    pub fn rewrite_branch_dest(&mut self, insn: Insn, from: Block, to: Block) {
        self.insns[insn].rewrite_branch_dest(from, to);
    }
}
