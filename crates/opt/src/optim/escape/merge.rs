//! Merging predecessor states at control-flow joins.
//!
//! Object states agree on every predecessor: share them. Entries diverge:
//! synthesize a merge phi per entry. Virtual on some paths, materialized
//! on others: materialize at the divergent predecessors' ends and merge
//! the concrete values with a phi. Read cache entries survive a merge
//! only when present on every path. Phis are cached per (block, key) so
//! re-merging a loop header reuses the same synthetic values; that cache
//! is what lets the loop fixed point converge.

use smallvec::SmallVec;
use tracing::trace;

use partita_ir::{Block, Insn, InsnData, Value};

use super::{
    block_state::{make_floating_insn, BlockState, CacheKey},
    closure::{EffectsClosure, PhiKey},
    effects::{Effect, EffectList},
    object_state::{ObjectId, ObjectState},
    EscapeError,
};

impl<'a> EffectsClosure<'a> {
    /// Merges the predecessor states of `block` into one entry state,
    /// resetting and refilling the block's merge effect list.
    pub(super) fn merge_states(
        &mut self,
        block: Block,
        preds: &[Block],
    ) -> Result<BlockState, EscapeError> {
        let mut states: Vec<BlockState> = preds
            .iter()
            .map(|&pred| self.edge_state(pred, block).clone())
            .collect();
        let mut effects = EffectList::new();
        let mut merged = BlockState::new();

        if states.len() == 1 {
            merged = states[0].clone();
        } else if states.len() > 1 {
            trace!(block = block.0, preds = preds.len(), "merge states");
            let ids: Vec<ObjectId> = self.virtuals.keys().collect();
            for id in ids {
                if !states.iter().all(|state| state.has_object(id)) {
                    continue;
                }
                self.merge_object(block, preds, &mut states, id, &mut merged, &mut effects)?;
            }
            self.merge_read_cache(block, preds, &states, &mut merged, &mut effects);
        }

        self.process_phis_at(block, preds, &mut states, &mut effects)?;

        for (&pred, state) in preds.iter().zip(states.into_iter()) {
            self.put_edge_state(pred, block, state);
        }
        self.merge_effects.insert(block, effects);

        Ok(merged)
    }

    fn merge_object(
        &mut self,
        block: Block,
        preds: &[Block],
        states: &mut [BlockState],
        id: ObjectId,
        merged: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeError> {
        let all_virtual = states
            .iter()
            .all(|state| state.object(id).unwrap().is_virtual());

        if all_virtual {
            let first = states[0].object_rc(id).unwrap().clone();
            let locks_match = states
                .iter()
                .all(|state| state.object(id).unwrap().lock_count() == first.lock_count());

            if locks_match {
                if states
                    .iter()
                    .all(|state| *state.object(id).unwrap() == *first)
                {
                    merged.adopt_object(id, first);
                    return Ok(());
                }

                let ensure_virtualized = states
                    .iter()
                    .all(|state| state.object(id).unwrap().ensure_virtualized());
                let entry_num = self.virtuals[id].entry_num();
                let mut entries: SmallVec<[Value; 8]> = SmallVec::with_capacity(entry_num);

                for i in 0..entry_num {
                    let mut values: SmallVec<[Value; 4]> = states
                        .iter()
                        .map(|state| state.object(id).unwrap().entry(i))
                        .collect();

                    if values.iter().all(|&v| v == values[0]) {
                        entries.push(values[0]);
                        continue;
                    }

                    // Divergent entry. Entry values that are themselves
                    // virtual must become concrete before they can feed a
                    // phi.
                    for (j, value) in values.iter_mut().enumerate() {
                        if let Some(entry_id) = self.live_virtual(&states[j], *value) {
                            *value = self.materialize_in_pred(preds[j], &mut states[j], entry_id)?;
                        } else {
                            *value = self.resolve(&states[j], *value);
                        }
                    }
                    if values.iter().all(|&v| v == values[0]) {
                        entries.push(values[0]);
                        continue;
                    }

                    let merged_value =
                        self.merge_phi(block, preds, PhiKey::Entry(id, i), &values, effects);
                    entries.push(merged_value);
                }

                merged.add_object(
                    id,
                    ObjectState::Virtual {
                        entries,
                        locks: first.lock_count(),
                        ensure_virtualized,
                    },
                );
                return Ok(());
            }
            // Lock depths disagree; fall through and merge as
            // materialized values.
        }

        // At least one predecessor has a concrete object (or lock states
        // diverged). If not every path demands virtualization, the
        // guarantee is void for the paths that are about to materialize.
        let all_ensure = states
            .iter()
            .all(|state| state.object(id).unwrap().ensure_virtualized());

        let mut values: SmallVec<[Value; 4]> = SmallVec::with_capacity(states.len());
        for (j, &pred) in preds.iter().enumerate() {
            if !all_ensure {
                states[j].object_mut(id).clear_ensure_virtualized();
            }
            let value = match states[j].object(id).unwrap().materialized_value() {
                Some(value) => value,
                None => self.materialize_in_pred(pred, &mut states[j], id)?,
            };
            values.push(value);
        }

        if values.iter().all(|&v| v == values[0]) {
            merged.add_object(
                id,
                ObjectState::Materialized { value: values[0] },
            );
            return Ok(());
        }

        let merged_value = self.merge_phi(block, preds, PhiKey::Object(id), &values, effects);
        merged.add_object(
            id,
            ObjectState::Materialized {
                value: merged_value,
            },
        );
        Ok(())
    }

    fn merge_read_cache(
        &mut self,
        block: Block,
        preds: &[Block],
        states: &[BlockState],
        merged: &mut BlockState,
        effects: &mut EffectList,
    ) {
        let keys: Vec<CacheKey> = states[0].cache_entries().map(|(key, _)| *key).collect();
        'keys: for key in keys {
            let mut values: SmallVec<[Value; 4]> = SmallVec::with_capacity(states.len());
            for state in states {
                // A location known on only some paths is unknown after
                // the merge.
                match state.get_cache_entry(&key) {
                    Some(value) => values.push(value),
                    None => continue 'keys,
                }
            }

            if values.iter().all(|&v| v == values[0]) {
                merged.add_cache_entry(key, values[0]);
                continue;
            }

            let ty = self.func.dfg.value_ty(values[0]);
            if values.iter().any(|&v| self.func.dfg.value_ty(v) != ty) {
                continue;
            }

            let merged_value = self.merge_phi(block, preds, PhiKey::Cache(key), &values, effects);
            merged.add_cache_entry(key, merged_value);
        }
    }

    /// Aliases program phis to virtual objects when every incoming path
    /// agrees, and otherwise materializes virtual inputs at the
    /// predecessors' ends and rewires the phi's arguments.
    fn process_phis_at(
        &mut self,
        block: Block,
        preds: &[Block],
        states: &mut [BlockState],
        effects: &mut EffectList,
    ) -> Result<(), EscapeError> {
        if preds.is_empty() {
            return Ok(());
        }

        let phis: Vec<Insn> = self
            .func
            .layout
            .iter_insn(block)
            .filter(|&insn| self.func.dfg.is_phi(insn))
            .collect();

        for phi in phis {
            let result = self.func.dfg.insn_result(phi).unwrap();

            let mut args: SmallVec<[Value; 4]> = SmallVec::with_capacity(preds.len());
            for &pred in preds {
                let arg = self
                    .func
                    .dfg
                    .insn_data(phi)
                    .phi_arg_of(pred)
                    .ok_or(EscapeError::PhiInputCountMismatch)?;
                args.push(arg);
            }

            let mut common: Option<ObjectId> = None;
            let mut all_same_virtual = true;
            for (j, &arg) in args.iter().enumerate() {
                match self.live_virtual(&states[j], arg) {
                    Some(id) if common.is_none() || common == Some(id) => common = Some(id),
                    _ => {
                        all_same_virtual = false;
                        break;
                    }
                }
            }

            if all_same_virtual {
                if let Some(id) = common {
                    // The phi is just another name for the object.
                    let canonical = self.virtuals[id].value;
                    self.aliases.insert(result, canonical);
                    continue;
                }
            }

            self.aliases.remove(&result);
            for (j, &arg) in args.iter().enumerate() {
                let new = match self.live_virtual(&states[j], arg) {
                    Some(id) => self.materialize_in_pred(preds[j], &mut states[j], id)?,
                    None => self.resolve(&states[j], arg),
                };
                if new != arg {
                    effects.record(
                        "phi input",
                        Effect::SetPhiArg {
                            phi,
                            value: new,
                            block: preds[j],
                        },
                    );
                }
            }
        }

        Ok(())
    }

    /// Materializes an object at the end of a predecessor block,
    /// recording the effects into that predecessor's list.
    fn materialize_in_pred(
        &mut self,
        pred: Block,
        state: &mut BlockState,
        id: ObjectId,
    ) -> Result<Value, EscapeError> {
        let mut effects = self.block_effects.remove(&pred).unwrap_or_default();
        let before = self.pred_end(pred);
        let result = self.ensure_materialized(state, id, before, &mut effects);
        self.block_effects.insert(pred, effects);
        result
    }

    /// Produces the merged value for divergent per-predecessor values,
    /// wiring a phi in the merge block. Phis are cached per key so a
    /// re-merged loop header converges on the same synthetic values, and
    /// a phi already present in the graph with exactly these inputs is
    /// reused instead of duplicated.
    fn merge_phi(
        &mut self,
        block: Block,
        preds: &[Block],
        key: PhiKey,
        values: &[Value],
        effects: &mut EffectList,
    ) -> Value {
        let (phi, phi_value) = self.get_phi(block, preds, key, values);
        effects.record("merge phi", Effect::Prepend { insn: phi, block });
        for (j, &value) in values.iter().enumerate() {
            effects.record(
                "merge phi input",
                Effect::SetPhiArg {
                    phi,
                    value,
                    block: preds[j],
                },
            );
        }
        phi_value
    }

    fn get_phi(
        &mut self,
        block: Block,
        preds: &[Block],
        key: PhiKey,
        values: &[Value],
    ) -> (Insn, Value) {
        if let Some(&(insn, value)) = self.phi_cache.get(&(block, key)) {
            return (insn, value);
        }
        let found = self.find_existing_phi(block, preds, values).unwrap_or_else(|| {
            let ty = self.func.dfg.value_ty(values[0]);
            let (insn, value) = make_floating_insn(self.func, InsnData::phi(ty));
            (insn, value.unwrap())
        });
        self.phi_cache.insert((block, key), found);
        found
    }

    /// Looks for a phi already inserted in `block` whose arguments equal
    /// `values` per predecessor; re-running the analysis on its own
    /// output then reuses yesterday's phis instead of minting new ones.
    fn find_existing_phi(
        &self,
        block: Block,
        preds: &[Block],
        values: &[Value],
    ) -> Option<(Insn, Value)> {
        for insn in self.func.layout.iter_insn(block) {
            let data = self.func.dfg.insn_data(insn);
            if !data.is_phi() {
                continue;
            }
            let matches = preds
                .iter()
                .zip(values.iter())
                .all(|(&pred, &value)| data.phi_arg_of(pred) == Some(value));
            if matches {
                return Some((insn, self.func.dfg.insn_result(insn).unwrap()));
            }
        }
        None
    }
}
