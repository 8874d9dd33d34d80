//! Deferred graph mutations.
//!
//! The analysis never touches the layout directly; it records [`Effect`]s
//! into per-block [`EffectList`]s and the driver replays them once the
//! whole iteration is finished. New instructions (phis, proxies,
//! materialized allocations) are created *floating* in the data flow graph
//! during analysis and only enter the layout when their insert effect is
//! applied.
//!
//! Earlier effects may remove the target of a later one. Deletions and
//! input replacements tolerate that and skip; losing the insertion point
//! of a new instruction or the phi a wiring effect targets means the
//! analysis produced an inconsistent plan, which is fatal.

use tracing::trace;

use partita_ir::{Block, Function, Insn, Value};

use super::EscapeError;

/// A single deferred graph mutation.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Insert a floating instruction directly before `before`.
    InsertBefore { insn: Insn, before: Insn },

    /// Prepend a floating instruction (a phi or a proxy) to `block`.
    Prepend { insn: Insn, block: Block },

    /// Set the argument of `phi` flowing in from `block`.
    SetPhiArg {
        phi: Insn,
        value: Value,
        block: Block,
    },

    /// Remove an instruction from the layout.
    Delete { insn: Insn },

    /// Replace all uses of `value` with `alias`.
    ReplaceUses { value: Value, alias: Value },

    /// Replace one `old` input of `insn` with `new`.
    ReplaceInput { insn: Insn, old: Value, new: Value },
}

/// An ordered log of labeled effects.
#[derive(Debug, Default)]
pub struct EffectList {
    effects: Vec<(&'static str, Effect)>,
}

impl EffectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, label: &'static str, effect: Effect) {
        self.effects.push((label, effect));
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn clear(&mut self) {
        self.effects.clear();
    }

    /// Replays the recorded effects against the graph, in order. Returns
    /// `true` if the graph was actually modified; effects whose target is
    /// already gone (or that turn out to be no-ops) don't count.
    ///
    /// `undeleted` lists instructions whose deletion was cancelled because
    /// a pristine rematerialization reuses them.
    pub fn apply(
        &mut self,
        func: &mut Function,
        undeleted: &rustc_hash::FxHashSet<Insn>,
    ) -> Result<bool, EscapeError> {
        let mut modified = false;

        for (label, effect) in self.effects.drain(..) {
            trace!(label, ?effect, "apply effect");
            match effect {
                Effect::InsertBefore { insn, before } => {
                    if func.layout.is_insn_inserted(insn) {
                        continue;
                    }
                    if !func.layout.is_insn_inserted(before) {
                        return Err(EscapeError::DeadEffectTarget(label));
                    }
                    func.layout.insert_insn_before(insn, before);
                    modified = true;
                }

                Effect::Prepend { insn, block } => {
                    if func.layout.is_insn_inserted(insn) {
                        continue;
                    }
                    if !func.layout.is_block_inserted(block) {
                        return Err(EscapeError::DeadEffectTarget(label));
                    }
                    func.layout.prepend_insn(insn, block);
                    modified = true;
                }

                Effect::SetPhiArg { phi, value, block } => {
                    if !func.layout.is_insn_inserted(phi) {
                        return Err(EscapeError::DeadEffectTarget(label));
                    }
                    modified |= func.dfg.set_phi_arg(phi, value, block);
                }

                Effect::Delete { insn } => {
                    if undeleted.contains(&insn) || !func.layout.is_insn_inserted(insn) {
                        continue;
                    }
                    func.dfg.untrack_insn(insn);
                    func.layout.remove_insn(insn);
                    modified = true;
                }

                Effect::ReplaceUses { value, alias } => {
                    if func.dfg.users_num(value) == 0 {
                        continue;
                    }
                    func.dfg.change_to_alias(value, alias);
                    modified = true;
                }

                Effect::ReplaceInput { insn, old, new } => {
                    if !func.layout.is_insn_inserted(insn) {
                        continue;
                    }
                    if func.dfg.insn_args(insn).contains(&old) {
                        func.dfg.replace_insn_arg(insn, old, new);
                        modified = true;
                    }
                }
            }
        }

        Ok(modified)
    }
}
