//! The abstract-interpretation walk shared by object virtualization and
//! read elimination.
//!
//! Blocks are visited in reverse postorder; each instruction runs one
//! transfer function that updates the current [`BlockState`] and records
//! deferred effects. Loops are iterated to a local fixed point, with
//! per-loop phi/proxy caching so repeated merges reuse the same synthetic
//! values instead of diverging forever.

use cranelift_entity::PrimaryMap;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, trace};

use partita_ir::{
    Block, ControlFlowGraph, Function, Insn, InsnData, Kill, MemLoc, Value,
};

use crate::{
    domtree::DomTree,
    loop_analysis::{Loop, LoopTree},
};

use super::{
    block_state::{make_floating_insn, BlockState, CacheKey},
    effects::{Effect, EffectList},
    object_state::{ObjectId, ObjectKind, ObjectState, VirtualObject},
    solver::{Deadline, EaConfig},
    EscapeError,
};

/// Once the cutoff loop nesting depth is reached, no new virtualizations
/// are started; objects that are already virtual keep being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ClosureMode {
    Regular,
    StopNewVirtualizations,
}

/// Memoized set of location identities a loop body may invalidate.
#[derive(Debug, Default)]
pub(super) struct LoopKillCache {
    pub visits: u32,
    pub killed: FxHashSet<MemLoc>,
    pub kills_all: bool,
}

/// Keys for the per-block phi/proxy caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum PhiKey {
    /// The materialized value of an object.
    Object(ObjectId),
    /// One entry of a virtual object.
    Entry(ObjectId, usize),
    /// One read cache entry.
    Cache(CacheKey),
}

pub(super) struct EffectsClosure<'a> {
    pub(super) func: &'a mut Function,
    pub(super) cfg: &'a ControlFlowGraph,
    pub(super) domtree: &'a DomTree,
    pub(super) lpt: &'a LoopTree,
    pub(super) config: &'a EaConfig,
    pub(super) deadline: &'a Deadline,
    pub(super) loop_kills: &'a mut FxHashMap<Block, LoopKillCache>,

    pub(super) virtuals: PrimaryMap<ObjectId, VirtualObject>,
    pub(super) virtual_values: FxHashMap<Value, ObjectId>,
    alloc_objects: FxHashMap<Insn, ObjectId>,
    pub(super) aliases: FxHashMap<Value, Value>,

    pub(super) block_effects: FxHashMap<Block, EffectList>,
    pub(super) merge_effects: FxHashMap<Block, EffectList>,
    pub(super) exit_states: FxHashMap<Block, BlockState>,
    pub(super) edge_states: FxHashMap<(Block, Block), BlockState>,
    pub(super) phi_cache: FxHashMap<(Block, PhiKey), (Insn, Value)>,
    proxy_cache: FxHashMap<(Block, Block, PhiKey), (Insn, Value)>,
    pub(super) undeleted: FxHashSet<Insn>,

    mode: ClosureMode,
    pub(super) expired: bool,
    pub(super) irreducible: bool,
}

impl<'a> EffectsClosure<'a> {
    pub(super) fn new(
        func: &'a mut Function,
        cfg: &'a ControlFlowGraph,
        domtree: &'a DomTree,
        lpt: &'a LoopTree,
        config: &'a EaConfig,
        deadline: &'a Deadline,
        loop_kills: &'a mut FxHashMap<Block, LoopKillCache>,
    ) -> Self {
        Self {
            func,
            cfg,
            domtree,
            lpt,
            config,
            deadline,
            loop_kills,
            virtuals: PrimaryMap::default(),
            virtual_values: FxHashMap::default(),
            alloc_objects: FxHashMap::default(),
            aliases: FxHashMap::default(),
            block_effects: FxHashMap::default(),
            merge_effects: FxHashMap::default(),
            exit_states: FxHashMap::default(),
            edge_states: FxHashMap::default(),
            phi_cache: FxHashMap::default(),
            proxy_cache: FxHashMap::default(),
            undeleted: FxHashSet::default(),
            mode: ClosureMode::Regular,
            expired: false,
            irreducible: false,
        }
    }

    pub(super) fn run(&mut self) -> Result<(), EscapeError> {
        let rpo = self.domtree.rpo().to_vec();
        if rpo.is_empty() {
            return Ok(());
        }

        // Natural loops only. A retreating edge into a block that doesn't
        // dominate its source makes the CFG irreducible; decline to
        // analyze rather than reason with incomplete predecessor states.
        let mut order: FxHashMap<Block, usize> = FxHashMap::default();
        for (i, &block) in rpo.iter().enumerate() {
            order.insert(block, i);
        }
        for &block in &rpo {
            for &pred in self.cfg.preds_of(block) {
                let is_back_edge = order
                    .get(&pred)
                    .map_or(false, |&pi| pi >= order[&block]);
                if is_back_edge && !self.domtree.dominates(block, pred) {
                    debug!("irreducible control flow, skipping analysis");
                    self.irreducible = true;
                    return Ok(());
                }
            }
        }

        for &block in &rpo {
            if self.expired {
                return Ok(());
            }
            match self.lpt.loop_of_block(block) {
                Some(lp) => {
                    let outermost = self.outermost_loop(lp);
                    if self.lpt.loop_header(outermost) == block {
                        self.process_loop(outermost)?;
                    }
                    // Other in-loop blocks were handled by their loop.
                }
                None => self.process_block(block)?,
            }
        }

        Ok(())
    }

    pub(super) fn needs_apply(&self) -> bool {
        self.block_effects.values().any(|e| !e.is_empty())
            || self.merge_effects.values().any(|e| !e.is_empty())
    }

    /// Replays all recorded effects in reverse postorder. Returns `true`
    /// if the graph was actually modified.
    pub(super) fn commit(&mut self) -> Result<bool, EscapeError> {
        let mut modified = false;
        let rpo = self.domtree.rpo().to_vec();
        for &block in &rpo {
            if let Some(mut effects) = self.merge_effects.remove(&block) {
                modified |= effects.apply(self.func, &self.undeleted)?;
            }
            if let Some(mut effects) = self.block_effects.remove(&block) {
                modified |= effects.apply(self.func, &self.undeleted)?;
            }
        }
        Ok(modified)
    }

    fn process_block(&mut self, block: Block) -> Result<(), EscapeError> {
        if self.deadline.is_expired() {
            self.expired = true;
            return Ok(());
        }

        let preds: SmallVec<[Block; 4]> = self
            .cfg
            .preds_of(block)
            .copied()
            .filter(|&p| self.has_edge_state(p, block))
            .collect();

        let has_phis = self
            .func
            .layout
            .first_insn_of(block)
            .map_or(false, |_| {
                self.func
                    .layout
                    .iter_insn(block)
                    .any(|insn| self.func.dfg.is_phi(insn))
            });

        let state = if preds.is_empty() {
            BlockState::new()
        } else if preds.len() == 1 && !has_phis {
            self.edge_state(preds[0], block).clone()
        } else {
            self.merge_states(block, &preds)?
        };

        self.process_block_with(block, state)
    }

    fn process_block_with(&mut self, block: Block, mut state: BlockState) -> Result<(), EscapeError> {
        trace!(block = block.0, "process block");
        let mut effects = EffectList::new();

        let insns: Vec<Insn> = self.func.layout.iter_insn(block).collect();
        for insn in insns {
            self.process_insn(insn, &mut state, &mut effects)?;
        }

        self.block_effects.insert(block, effects);
        self.exit_states.insert(block, state);
        Ok(())
    }

    /// The transfer function: one state transition per instruction.
    fn process_insn(
        &mut self,
        insn: Insn,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeError> {
        let data = self.func.dfg.insn_data(insn).clone();
        match data {
            InsnData::Alloc { shape, args } => {
                let field_num = self.func.dfg.shape(shape).field_num();
                if self.mode == ClosureMode::Regular
                    && field_num <= self.config.max_virtual_entries
                {
                    let entries: SmallVec<[Value; 8]> =
                        args.iter().map(|&a| self.resolve(state, a)).collect();
                    self.virtualize_alloc(insn, entries, ObjectKind::Struct { shape }, state, effects);
                } else {
                    self.process_inputs(insn, state, effects)?;
                }
            }

            InsnData::AllocArray { elem_ty, args } => {
                let len = self
                    .func
                    .dfg
                    .value_imm(self.alias(args[0]))
                    .and_then(|imm| imm.as_usize());
                match len {
                    Some(len)
                        if self.mode == ClosureMode::Regular
                            && len <= self.config.max_virtual_entries =>
                    {
                        let default = self.func.dfg.make_default_value(elem_ty);
                        let entries: SmallVec<[Value; 8]> =
                            std::iter::repeat(default).take(len).collect();
                        self.virtualize_alloc(
                            insn,
                            entries,
                            ObjectKind::Array { elem_ty, len },
                            state,
                            effects,
                        );
                    }
                    _ => self.process_inputs(insn, state, effects)?,
                }
            }

            InsnData::LoadField {
                args: [base],
                shape,
                field,
                volatile,
            } => {
                let result = self.func.dfg.insn_result(insn).unwrap();
                if let Some(id) = self.live_virtual(state, base) {
                    let entry = state.object(id).unwrap().entry(field as usize);
                    self.delete_and_replace(state, insn, result, entry, effects, "scalar replace load");
                } else {
                    self.process_inputs(insn, state, effects)?;
                    if volatile {
                        state.kill_cache_all();
                    } else if self.config.read_elimination {
                        let key = CacheKey {
                            base: self.cache_base(state, base),
                            loc: MemLoc::Field { shape, field },
                            index: None,
                        };
                        self.cached_load(state, insn, result, key, effects);
                    }
                }
            }

            InsnData::StoreField {
                args: [base, value],
                shape,
                field,
                volatile,
            } => {
                if let Some(id) = self.live_virtual(state, base) {
                    let entry = self.resolve(state, value);
                    state.set_entry(id, field as usize, entry);
                    effects.record("scalar replace store", Effect::Delete { insn });
                } else {
                    self.process_inputs(insn, state, effects)?;
                    if volatile {
                        state.kill_cache_all();
                    } else {
                        let key = CacheKey {
                            base: self.cache_base(state, base),
                            loc: MemLoc::Field { shape, field },
                            index: None,
                        };
                        self.cached_store(state, insn, key, value, effects);
                    }
                }
            }

            InsnData::LoadElem {
                args: [base, index],
                elem_ty,
            } => {
                let result = self.func.dfg.insn_result(insn).unwrap();
                let const_index = self
                    .func
                    .dfg
                    .value_imm(self.alias(index))
                    .and_then(|imm| imm.as_usize());
                if let Some(id) = self.live_virtual(state, base) {
                    match const_index {
                        Some(i) if i < self.virtuals[id].entry_num() => {
                            let entry = state.object(id).unwrap().entry(i);
                            self.delete_and_replace(
                                state,
                                insn,
                                result,
                                entry,
                                effects,
                                "scalar replace element load",
                            );
                            return Ok(());
                        }
                        // Unknown or out-of-range index defeats entry
                        // tracking; the object escapes below.
                        _ => {}
                    }
                }
                self.process_inputs(insn, state, effects)?;
                if self.config.read_elimination {
                    if let Some(i) = const_index {
                        let key = CacheKey {
                            base: self.cache_base(state, base),
                            loc: MemLoc::ArrayElem(elem_ty),
                            index: Some(i as i64),
                        };
                        self.cached_load(state, insn, result, key, effects);
                    }
                }
            }

            InsnData::StoreElem {
                args: [base, index, value],
                elem_ty,
            } => {
                let const_index = self
                    .func
                    .dfg
                    .value_imm(self.alias(index))
                    .and_then(|imm| imm.as_usize());
                if let Some(id) = self.live_virtual(state, base) {
                    if let Some(i) = const_index {
                        if i < self.virtuals[id].entry_num() {
                            let entry = self.resolve(state, value);
                            state.set_entry(id, i, entry);
                            effects.record("scalar replace element store", Effect::Delete { insn });
                            return Ok(());
                        }
                    }
                }
                self.process_inputs(insn, state, effects)?;
                let loc = MemLoc::ArrayElem(elem_ty);
                match const_index {
                    Some(i) => {
                        let key = CacheKey {
                            base: self.cache_base(state, base),
                            loc,
                            index: Some(i as i64),
                        };
                        self.cached_store(state, insn, key, value, effects);
                    }
                    None => state.kill_cache(loc),
                }
            }

            InsnData::RawLoad {
                args: [base, offset],
                loc,
                ty,
            } => {
                let result = self.func.dfg.insn_result(insn).unwrap();
                if let Some(id) = self.live_virtual(state, base) {
                    if let Some(field) = self.raw_entry_index(id, loc, ty) {
                        let entry = state.object(id).unwrap().entry(field);
                        self.delete_and_replace(state, insn, result, entry, effects, "scalar replace raw load");
                        return Ok(());
                    }
                }
                self.process_inputs(insn, state, effects)?;
                let const_offset = self.func.dfg.value_imm(self.alias(offset));
                if self.config.read_elimination && loc.is_single() {
                    if let Some(imm) = const_offset.and_then(|imm| imm.as_usize()) {
                        let key = CacheKey {
                            base: self.cache_base(state, base),
                            loc,
                            index: Some(imm as i64),
                        };
                        self.cached_load(state, insn, result, key, effects);
                    }
                }
            }

            InsnData::RawStore {
                args: [base, offset, value],
                loc,
            } => {
                if let Some(id) = self.live_virtual(state, base) {
                    let value_ty = self.func.dfg.value_ty(value);
                    if let Some(field) = self.raw_entry_index(id, loc, value_ty) {
                        let entry = self.resolve(state, value);
                        state.set_entry(id, field, entry);
                        effects.record("scalar replace raw store", Effect::Delete { insn });
                        return Ok(());
                    }
                }
                self.process_inputs(insn, state, effects)?;
                if !loc.is_single() {
                    state.kill_cache_all();
                } else {
                    let const_offset = self
                        .func
                        .dfg
                        .value_imm(self.alias(offset))
                        .and_then(|imm| imm.as_usize());
                    match const_offset {
                        Some(off) => {
                            let key = CacheKey {
                                base: self.cache_base(state, base),
                                loc,
                                index: Some(off as i64),
                            };
                            self.cached_store(state, insn, key, value, effects);
                        }
                        None => state.kill_cache(loc),
                    }
                }
            }

            InsnData::MonitorEnter { args: [value] } => {
                if let Some(id) = self.live_virtual(state, value) {
                    state.object_mut(id).add_lock();
                    effects.record("virtual monitor enter", Effect::Delete { insn });
                } else {
                    self.process_inputs(insn, state, effects)?;
                    state.kill_cache_all();
                }
            }

            InsnData::MonitorExit { args: [value] } => {
                if let Some(id) = self.live_virtual(state, value) {
                    if state.object_mut(id).remove_lock() {
                        effects.record("virtual monitor exit", Effect::Delete { insn });
                        return Ok(());
                    }
                }
                self.process_inputs(insn, state, effects)?;
                state.kill_cache_all();
            }

            InsnData::EnsureVirtualized { args: [value] } => {
                if let Some(id) = self.live_virtual(state, value) {
                    state.object_mut(id).set_ensure_virtualized();
                    effects.record("ensure virtualized", Effect::Delete { insn });
                } else {
                    return Err(EscapeError::EnsureVirtualizedViolated);
                }
            }

            InsnData::Call { ref kill, .. } => {
                self.process_inputs(insn, state, effects)?;
                match kill {
                    Kill::None => {}
                    Kill::Locations(locs) => {
                        for &loc in locs {
                            state.kill_cache(loc);
                        }
                    }
                    Kill::All => state.kill_cache_all(),
                }
            }

            // Phis are handled when their block's predecessor states are
            // merged.
            InsnData::Phi { .. } => {}

            InsnData::Jump { .. } => {}

            _ => {
                if self.has_aliased_inputs(insn) {
                    self.process_inputs(insn, state, effects)?;
                }
            }
        }

        Ok(())
    }

    fn virtualize_alloc(
        &mut self,
        insn: Insn,
        entries: SmallVec<[Value; 8]>,
        kind: ObjectKind,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) {
        let result = self.func.dfg.insn_result(insn).unwrap();
        let id = match self.alloc_objects.get(&insn).copied() {
            Some(id) => {
                self.virtuals[id].seeds = entries.clone();
                id
            }
            None => {
                let id = self.virtuals.push(VirtualObject {
                    value: result,
                    alloc: insn,
                    seeds: entries.clone(),
                    kind,
                });
                self.alloc_objects.insert(insn, id);
                self.virtual_values.insert(result, id);
                id
            }
        };
        trace!(object = id.0, insn = insn.0, "virtualized allocation");
        state.add_object(id, ObjectState::virtual_with(entries));
        effects.record("virtualized allocation", Effect::Delete { insn });
    }

    fn cached_load(
        &mut self,
        state: &mut BlockState,
        insn: Insn,
        result: Value,
        key: CacheKey,
        effects: &mut EffectList,
    ) {
        match state.get_cache_entry(&key) {
            Some(cached)
                if self.func.dfg.value_ty(cached) == self.func.dfg.value_ty(result) =>
            {
                self.delete_and_replace(state, insn, result, cached, effects, "redundant load");
            }
            _ => state.add_cache_entry(key, result),
        }
    }

    fn cached_store(
        &mut self,
        state: &mut BlockState,
        insn: Insn,
        key: CacheKey,
        value: Value,
        effects: &mut EffectList,
    ) {
        let value = self.resolve(state, value);
        if self.config.read_elimination && state.get_cache_entry(&key) == Some(value) {
            // The location already holds this value.
            effects.record("redundant store", Effect::Delete { insn });
            return;
        }
        state.kill_cache(key.loc);
        if self.config.read_elimination {
            state.add_cache_entry(key, value);
        }
    }

    /// Deletes `insn` and redirects its result to `replacement`. If the
    /// replacement is a still-virtual object, users are left in place and
    /// fixed up when they themselves are processed.
    fn delete_and_replace(
        &mut self,
        state: &BlockState,
        insn: Insn,
        result: Value,
        replacement: Value,
        effects: &mut EffectList,
        label: &'static str,
    ) {
        let canonical = self.alias(replacement);
        self.aliases.insert(result, canonical);
        if self.live_virtual(state, canonical).is_none() {
            effects.record(
                label,
                Effect::ReplaceUses {
                    value: result,
                    alias: canonical,
                },
            );
        }
        effects.record(label, Effect::Delete { insn });
    }

    /// Rewrites inputs whose alias points elsewhere, materializing
    /// virtual objects that are about to be observed by an instruction
    /// the analysis doesn't understand.
    pub(super) fn process_inputs(
        &mut self,
        insn: Insn,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeError> {
        let args: SmallVec<[Value; 8]> = self.func.dfg.insn_args(insn).into();
        for arg in args {
            let alias = self.alias(arg);
            if let Some(&id) = self.virtual_values.get(&alias) {
                if state.has_object(id) {
                    let value = match state.object(id).and_then(ObjectState::materialized_value) {
                        Some(value) => value,
                        None => self.ensure_materialized(state, id, insn, effects)?,
                    };
                    if value != arg {
                        effects.record(
                            "replace escaped input",
                            Effect::ReplaceInput {
                                insn,
                                old: arg,
                                new: value,
                            },
                        );
                    }
                }
            } else if alias != arg {
                effects.record(
                    "replace aliased input",
                    Effect::ReplaceInput {
                        insn,
                        old: arg,
                        new: alias,
                    },
                );
            }
        }
        Ok(())
    }

    pub(super) fn ensure_materialized(
        &mut self,
        state: &mut BlockState,
        id: ObjectId,
        before: Insn,
        effects: &mut EffectList,
    ) -> Result<Value, EscapeError> {
        if let Some(value) = state.object(id).and_then(ObjectState::materialized_value) {
            return Ok(value);
        }
        if state.object(id).unwrap().ensure_virtualized() {
            return Err(EscapeError::EnsureVirtualizedViolated);
        }
        debug!(object = id.0, "materializing object");
        Ok(state.materialize_before(
            self.func,
            &self.virtuals,
            &self.virtual_values,
            id,
            before,
            effects,
            &mut self.undeleted,
        ))
    }

    // ---------------------------------------------------------------
    // Loop handling

    fn process_loop(&mut self, lp: Loop) -> Result<(), EscapeError> {
        let header = self.lpt.loop_header(lp);
        let mut body: Vec<Block> = self.lpt.iter_blocks_post_order(self.cfg, lp).collect();
        body.reverse();
        debug_assert_eq!(body.first(), Some(&header));
        trace!(header = header.0, "process loop");

        if self.lpt.loop_depth(lp) > self.config.loop_depth_cutoff {
            self.mode = ClosureMode::StopNewVirtualizations;
        }

        let mut forward: SmallVec<[Block; 4]> = SmallVec::new();
        let mut backs: SmallVec<[Block; 4]> = SmallVec::new();
        for &pred in self.cfg.preds_of(header) {
            if self.lpt.is_in_loop(pred, lp) {
                backs.push(pred);
            } else if self.has_edge_state(pred, header) {
                forward.push(pred);
            }
        }

        let mut entry_state = self.merge_states(header, &forward)?;
        self.strip_killed_loop_locations(header, &mut entry_state);
        let entry_snapshot = entry_state.clone();

        let mut header_state = entry_state;
        let mut converged = self.iterate_loop(header, &body, lp, &forward, &backs, &mut header_state)?;
        if self.expired {
            return Ok(());
        }

        if !converged {
            // The loop state refuses to stabilize; rematerialize every
            // object that entered the loop virtual and run once more with
            // nothing left to track.
            debug!(header = header.0, "loop state overflow, materializing everything");
            self.materialize_all_before_loop(header, &forward)?;
            self.loop_kills.entry(header).or_default().kills_all = true;

            let mut retry_state = self.merge_states(header, &forward)?;
            self.strip_killed_loop_locations(header, &mut retry_state);
            header_state = retry_state;
            converged =
                self.iterate_loop(header, &body, lp, &forward, &backs, &mut header_state)?;
            if self.expired {
                return Ok(());
            }
            if !converged {
                return Err(EscapeError::LoopDidNotConverge);
            }
        }

        self.record_loop_kills(header, &entry_snapshot, &header_state);
        self.process_loop_exits(lp, &body, &entry_snapshot)?;
        Ok(())
    }

    fn iterate_loop(
        &mut self,
        header: Block,
        body: &[Block],
        lp: Loop,
        forward: &[Block],
        backs: &[Block],
        header_state: &mut BlockState,
    ) -> Result<bool, EscapeError> {
        for _round in 0..self.config.loop_merge_bound {
            self.process_loop_body(body, lp, header_state.clone())?;
            if self.expired {
                return Ok(true);
            }

            let mut all_preds: SmallVec<[Block; 4]> = forward.into();
            for &back in backs {
                if self.has_edge_state(back, header) {
                    all_preds.push(back);
                }
            }
            let merged = self.merge_states(header, &all_preds)?;
            if merged.equivalent_to(header_state) {
                *header_state = merged;
                return Ok(true);
            }
            *header_state = merged;
        }
        Ok(false)
    }

    fn process_loop_body(
        &mut self,
        body: &[Block],
        lp: Loop,
        header_state: BlockState,
    ) -> Result<(), EscapeError> {
        self.process_block_with(body[0], header_state)?;
        for &block in &body[1..] {
            if self.expired {
                return Ok(());
            }
            let innermost = self
                .lpt
                .loop_of_block(block)
                .expect("loop body block must map to a loop");
            if innermost == lp {
                self.process_block(block)?;
            } else {
                let child = self.child_loop_under(innermost, lp);
                if self.lpt.loop_header(child) == block {
                    self.process_loop(child)?;
                }
                // Member blocks of inner loops are handled by their loop.
            }
        }
        Ok(())
    }

    fn materialize_all_before_loop(
        &mut self,
        header: Block,
        forward: &[Block],
    ) -> Result<(), EscapeError> {
        let ids: Vec<ObjectId> = self.virtuals.keys().collect();
        for &pred in forward {
            let mut state = self.edge_state(pred, header).clone();
            let mut effects = self.block_effects.remove(&pred).unwrap_or_default();
            let before = self.pred_end(pred);
            for &id in &ids {
                let is_virtual = state
                    .object(id)
                    .map_or(false, ObjectState::is_virtual);
                if is_virtual && !state.object(id).unwrap().ensure_virtualized() {
                    self.ensure_materialized(&mut state, id, before, &mut effects)?;
                }
            }
            self.block_effects.insert(pred, effects);
            self.put_edge_state(pred, header, state);
        }
        Ok(())
    }

    fn strip_killed_loop_locations(&mut self, header: Block, state: &mut BlockState) {
        if let Some(cache) = self.loop_kills.get_mut(&header) {
            cache.visits += 1;
            if cache.visits > self.config.loop_kill_visit_bound {
                cache.kills_all = true;
            }
            if cache.kills_all {
                state.kill_cache_all();
            } else {
                for &loc in &cache.killed {
                    state.kill_cache(loc);
                }
            }
        }
    }

    fn record_loop_kills(&mut self, header: Block, entry: &BlockState, fixpoint: &BlockState) {
        let killed: Vec<MemLoc> = entry
            .cache_entries()
            .filter(|(key, value)| fixpoint.get_cache_entry(key) != Some(*value))
            .map(|(key, _)| key.loc)
            .collect();
        let cache = self.loop_kills.entry(header).or_default();
        cache.killed.extend(killed);
    }

    /// Wraps values leaving the loop in proxies when they differ from the
    /// state at loop entry, and snapshots per-edge states for the exit
    /// blocks.
    fn process_loop_exits(
        &mut self,
        lp: Loop,
        body: &[Block],
        entry_state: &BlockState,
    ) -> Result<(), EscapeError> {
        for &block in body {
            let succs: SmallVec<[Block; 2]> = self
                .cfg
                .succs_of(block)
                .copied()
                .filter(|&s| !self.lpt.is_in_loop(s, lp))
                .collect();
            if succs.is_empty() {
                continue;
            }

            for succ in succs {
                let mut state = self.exit_states[&block].clone();
                let mut effects = self.block_effects.remove(&block).unwrap_or_default();
                let before = self.pred_end(block);

                let ids: Vec<ObjectId> = self.virtuals.keys().collect();
                for id in ids {
                    let Some(object) = state.object(id) else {
                        continue;
                    };
                    match object.clone() {
                        ObjectState::Virtual { entries, .. } => {
                            for (i, &value) in entries.iter().enumerate() {
                                if self.func.dfg.value_imm(value).is_some()
                                    || self.virtual_values.contains_key(&value)
                                {
                                    continue;
                                }
                                let unchanged = matches!(
                                    entry_state.object(id),
                                    Some(ObjectState::Virtual { entries: init, .. })
                                        if init.get(i) == Some(&value)
                                );
                                if unchanged {
                                    continue;
                                }
                                let proxied = self.exit_proxy(
                                    block,
                                    succ,
                                    PhiKey::Entry(id, i),
                                    value,
                                    before,
                                    &mut effects,
                                );
                                state.set_entry(id, i, proxied);
                            }
                        }
                        ObjectState::Materialized { value } => {
                            let unchanged = matches!(
                                entry_state.object(id),
                                Some(ObjectState::Materialized { value: init }) if *init == value
                            );
                            if unchanged || self.func.dfg.value_imm(value).is_some() {
                                continue;
                            }
                            let proxied = self.exit_proxy(
                                block,
                                succ,
                                PhiKey::Object(id),
                                value,
                                before,
                                &mut effects,
                            );
                            state.add_object(id, ObjectState::Materialized { value: proxied });
                        }
                    }
                }

                // Read cache entries survive the exit only through a
                // proxy as well.
                let cache: Vec<(CacheKey, Value)> =
                    state.cache_entries().map(|(k, v)| (*k, v)).collect();
                for (key, value) in cache {
                    if self.func.dfg.value_imm(value).is_some()
                        || entry_state.get_cache_entry(&key) == Some(value)
                    {
                        continue;
                    }
                    let proxied =
                        self.exit_proxy(block, succ, PhiKey::Cache(key), value, before, &mut effects);
                    state.add_cache_entry(key, proxied);
                }

                self.block_effects.insert(block, effects);
                self.edge_states.insert((block, succ), state);
            }
        }
        Ok(())
    }

    fn exit_proxy(
        &mut self,
        block: Block,
        succ: Block,
        key: PhiKey,
        value: Value,
        before: Insn,
        effects: &mut EffectList,
    ) -> Value {
        let (insn, proxied) = match self.proxy_cache.get(&(block, succ, key)).copied() {
            Some((insn, proxied)) => {
                let old = self.func.dfg.insn_args(insn)[0];
                if old != value {
                    self.func.dfg.replace_insn_arg(insn, old, value);
                }
                (insn, proxied)
            }
            None => {
                let ty = self.func.dfg.value_ty(value);
                let (insn, proxied) =
                    make_floating_insn(self.func, InsnData::proxy(value, ty));
                let proxied = proxied.unwrap();
                self.proxy_cache.insert((block, succ, key), (insn, proxied));
                (insn, proxied)
            }
        };
        effects.record("loop exit proxy", Effect::InsertBefore { insn, before });
        proxied
    }

    // ---------------------------------------------------------------
    // Small helpers

    pub(super) fn alias(&self, mut value: Value) -> Value {
        let mut hops = 0;
        while let Some(&next) = self.aliases.get(&value) {
            if next == value || hops > 64 {
                break;
            }
            value = next;
            hops += 1;
        }
        value
    }

    /// Resolves a value the way it should be stored into an entry or the
    /// read cache: through scalar aliases, and through an object's
    /// materialized value if it has one.
    pub(super) fn resolve(&self, state: &BlockState, value: Value) -> Value {
        let alias = self.alias(value);
        match self.virtual_values.get(&alias) {
            Some(&id) => state
                .object(id)
                .and_then(ObjectState::materialized_value)
                .unwrap_or(alias),
            None => alias,
        }
    }

    /// The base value a cache entry should be keyed on.
    fn cache_base(&self, state: &BlockState, base: Value) -> Value {
        self.resolve(state, base)
    }

    /// Returns the object id if the value refers to an object that is
    /// still virtual in this state.
    pub(super) fn live_virtual(&self, state: &BlockState, value: Value) -> Option<ObjectId> {
        let alias = self.alias(value);
        let &id = self.virtual_values.get(&alias)?;
        state
            .object(id)
            .filter(|object| object.is_virtual())
            .map(|_| id)
    }

    fn has_aliased_inputs(&self, insn: Insn) -> bool {
        self.func
            .dfg
            .insn_args(insn)
            .iter()
            .any(|arg| self.aliases.contains_key(arg) || self.virtual_values.contains_key(arg))
    }

    /// Maps a raw access to an entry index: the declared identity must be
    /// a field of the object's own shape with a matching type.
    fn raw_entry_index(&self, id: ObjectId, loc: MemLoc, ty: partita_ir::Type) -> Option<usize> {
        let MemLoc::Field { shape, field } = loc else {
            return None;
        };
        let ObjectKind::Struct { shape: obj_shape } = self.virtuals[id].kind else {
            return None;
        };
        if shape != obj_shape || self.func.dfg.shape(shape).field_ty(field) != ty {
            return None;
        }
        Some(field as usize)
    }

    pub(super) fn pred_end(&self, block: Block) -> Insn {
        self.func
            .layout
            .last_insn_of(block)
            .expect("predecessor block must have a terminator")
    }

    fn has_edge_state(&self, pred: Block, block: Block) -> bool {
        self.edge_states.contains_key(&(pred, block)) || self.exit_states.contains_key(&pred)
    }

    pub(super) fn edge_state(&self, pred: Block, block: Block) -> &BlockState {
        self.edge_states
            .get(&(pred, block))
            .or_else(|| self.exit_states.get(&pred))
            .expect("predecessor state must exist")
    }

    pub(super) fn put_edge_state(&mut self, pred: Block, block: Block, state: BlockState) {
        if self.edge_states.contains_key(&(pred, block)) {
            self.edge_states.insert((pred, block), state);
        } else {
            self.exit_states.insert(pred, state);
        }
    }

    fn outermost_loop(&self, mut lp: Loop) -> Loop {
        while let Some(parent) = self.lpt.parent_loop(lp) {
            lp = parent;
        }
        lp
    }

    fn child_loop_under(&self, mut lp: Loop, ancestor: Loop) -> Loop {
        while self.lpt.parent_loop(lp) != Some(ancestor) {
            lp = self
                .lpt
                .parent_loop(lp)
                .expect("loop must be nested under ancestor");
        }
        lp
    }
}
