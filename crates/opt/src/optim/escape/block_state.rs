//! Per-block abstract state: virtual object slots plus the read cache.
//!
//! Cloning a state at a CFG edge shares every object slot; the first
//! mutation of a slot splits only that slot (`Rc::make_mut`). The read
//! cache is an insertion-ordered map so merges and phi synthesis are
//! deterministic.

use std::rc::Rc;

use cranelift_entity::PrimaryMap;
use indexmap::IndexMap;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::trace;

use partita_ir::{Function, Insn, InsnData, MemLoc, Value};

use super::{
    effects::{Effect, EffectList},
    object_state::{ObjectId, ObjectKind, ObjectState, VirtualObject},
};

/// Key of one read cache entry: which location of which base object, and
/// (for indexed and raw accesses) at which constant index/offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub base: Value,
    pub loc: MemLoc,
    pub index: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct BlockState {
    objects: Vec<Option<Rc<ObjectState>>>,
    cache: IndexMap<CacheKey, Value, FxBuildHasher>,
}

impl BlockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_object(&self, id: ObjectId) -> bool {
        self.objects
            .get(id.0 as usize)
            .map_or(false, |slot| slot.is_some())
    }

    pub fn object(&self, id: ObjectId) -> Option<&ObjectState> {
        self.objects.get(id.0 as usize)?.as_deref()
    }

    /// Copy-on-write access: splits only this object's slot if it is
    /// shared with other states.
    pub fn object_mut(&mut self, id: ObjectId) -> &mut ObjectState {
        let slot = self.objects[id.0 as usize]
            .as_mut()
            .expect("no state for object");
        Rc::make_mut(slot)
    }

    pub fn add_object(&mut self, id: ObjectId, state: ObjectState) {
        self.adopt_object(id, Rc::new(state));
    }

    /// Shares an object slot from another state without copying it.
    pub fn adopt_object(&mut self, id: ObjectId, state: Rc<ObjectState>) {
        let idx = id.0 as usize;
        if self.objects.len() <= idx {
            self.objects.resize(idx + 1, None);
        }
        self.objects[idx] = Some(state);
    }

    pub fn object_rc(&self, id: ObjectId) -> Option<&Rc<ObjectState>> {
        self.objects.get(id.0 as usize)?.as_ref()
    }

    pub fn set_entry(&mut self, id: ObjectId, idx: usize, value: Value) {
        self.object_mut(id).set_entry(idx, value);
    }

    /// Structural equality, used to detect the fixed point at loop
    /// headers.
    pub fn equivalent_to(&self, other: &BlockState) -> bool {
        let len = self.objects.len().max(other.objects.len());
        for i in 0..len {
            let a = self.objects.get(i).and_then(|s| s.as_deref());
            let b = other.objects.get(i).and_then(|s| s.as_deref());
            if a != b {
                return false;
            }
        }
        self.cache == other.cache
    }

    pub fn get_cache_entry(&self, key: &CacheKey) -> Option<Value> {
        self.cache.get(key).copied()
    }

    pub fn add_cache_entry(&mut self, key: CacheKey, value: Value) {
        self.cache.insert(key, value);
    }

    /// Kills every cache entry whose identity overlaps `loc`.
    pub fn kill_cache(&mut self, loc: MemLoc) {
        self.cache.retain(|key, _| !loc.overlaps(key.loc));
    }

    pub fn kill_cache_all(&mut self) {
        self.cache.clear();
    }

    pub fn cache_entries(&self) -> impl Iterator<Item = (&CacheKey, Value)> {
        self.cache.iter().map(|(k, v)| (k, *v))
    }

    /// Returns `true` if the object (and every virtual object reachable
    /// from its entries) can be rematerialized by reusing its original
    /// allocation: nothing about it ever changed, so the deferred deletion
    /// of the allocation is simply cancelled.
    pub fn can_reuse_allocation(
        &self,
        virtuals: &PrimaryMap<ObjectId, VirtualObject>,
        virtual_values: &FxHashMap<Value, ObjectId>,
        id: ObjectId,
        visiting: &mut FxHashSet<ObjectId>,
    ) -> bool {
        if !visiting.insert(id) {
            return true;
        }

        let vo = &virtuals[id];
        match self.object(id) {
            None => false,
            Some(ObjectState::Materialized { value }) => *value == vo.value,
            Some(ObjectState::Virtual { entries, locks, .. }) => {
                if *locks != 0 || entries != &vo.seeds {
                    return false;
                }
                entries.iter().all(|entry| match virtual_values.get(entry) {
                    Some(&nested) if self.has_object(nested) => {
                        self.can_reuse_allocation(virtuals, virtual_values, nested, visiting)
                    }
                    _ => true,
                })
            }
        }
    }

    /// Turns a virtual object back into a concrete allocation in front of
    /// `before`, recursively materializing every virtual object reachable
    /// from its entries. Callers must reject `ensure_virtualized` objects
    /// beforehand.
    ///
    /// A pristine object (entries still equal to the allocation's seeds,
    /// no virtual locks) reuses the original allocation instruction; its
    /// deferred deletion is recorded in `undeleted` and cancelled at
    /// commit. Otherwise a fresh allocation is emitted and entries that
    /// diverged from the seeds are stored explicitly. The object is
    /// flipped to `Materialized` before its entries are visited, so entry
    /// cycles terminate.
    pub fn materialize_before(
        &mut self,
        func: &mut Function,
        virtuals: &PrimaryMap<ObjectId, VirtualObject>,
        virtual_values: &FxHashMap<Value, ObjectId>,
        id: ObjectId,
        before: Insn,
        effects: &mut EffectList,
        undeleted: &mut FxHashSet<Insn>,
    ) -> Value {
        if let Some(value) = self.object(id).and_then(ObjectState::materialized_value) {
            return value;
        }

        let mut visiting = FxHashSet::default();
        if self.can_reuse_allocation(virtuals, virtual_values, id, &mut visiting) {
            return self.reuse_allocation(virtuals, virtual_values, id, undeleted);
        }

        let (entries, locks) = match self.object(id) {
            Some(ObjectState::Virtual { entries, locks, .. }) => (entries.clone(), *locks),
            _ => panic!("no virtual state for object"),
        };
        let vo = &virtuals[id];
        debug_assert!(!self.object(id).unwrap().ensure_virtualized());
        trace!(object = id.0, "materialize");

        // Entries whose referenced object can reuse its original
        // allocation are materialized first, so the new allocation can
        // seed them directly. Everything else is seeded with a default
        // and fixed up with stores after the allocation exists.
        let mut resolved: SmallVec<[Value; 8]> = entries.clone();
        for value in resolved.iter_mut() {
            if let Some(&nested) = virtual_values.get(value) {
                if self.has_object(nested) {
                    let mut visiting = FxHashSet::default();
                    if self.can_reuse_allocation(virtuals, virtual_values, nested, &mut visiting) {
                        *value =
                            self.reuse_allocation(virtuals, virtual_values, nested, undeleted);
                    }
                }
            }
        }

        let mut fixups: SmallVec<[usize; 4]> = SmallVec::new();
        let (alloc_data, elem_ty) = match vo.kind {
            ObjectKind::Struct { shape } => {
                let mut args: SmallVec<[Value; 8]> = SmallVec::with_capacity(resolved.len());
                for (i, &value) in resolved.iter().enumerate() {
                    if is_live_virtual(self, virtual_values, value) {
                        let field_ty = func.dfg.shape(shape).field_ty(i as u32);
                        args.push(func.dfg.make_default_value(field_ty));
                        fixups.push(i);
                    } else {
                        args.push(value);
                    }
                }
                (InsnData::Alloc { shape, args }, None)
            }
            ObjectKind::Array { elem_ty, len } => {
                let len_val = func.dfg.make_imm_value(len as i64);
                (
                    InsnData::AllocArray {
                        elem_ty,
                        args: [len_val],
                    },
                    Some(elem_ty),
                )
            }
        };

        let (alloc, materialized) = make_floating_insn(func, alloc_data);
        let materialized = materialized.unwrap();
        effects.record(
            "materialize allocation",
            Effect::InsertBefore {
                insn: alloc,
                before,
            },
        );

        self.add_object(
            id,
            ObjectState::Materialized {
                value: materialized,
            },
        );

        // Fill in entries the allocation itself couldn't seed.
        match vo.kind {
            ObjectKind::Struct { shape } => {
                for i in fixups {
                    let entry =
                        self.entry_value(func, virtuals, virtual_values, resolved[i], before, effects, undeleted);
                    let (store, _) = make_floating_insn(
                        func,
                        InsnData::StoreField {
                            args: [materialized, entry],
                            shape,
                            field: i as u32,
                            volatile: false,
                        },
                    );
                    effects.record(
                        "materialize entry",
                        Effect::InsertBefore {
                            insn: store,
                            before,
                        },
                    );
                }
            }
            ObjectKind::Array { len, .. } => {
                let elem_ty = elem_ty.unwrap();
                let default = func.dfg.make_default_value(elem_ty);
                for i in 0..len {
                    let entry = self.entry_value(
                        func,
                        virtuals,
                        virtual_values,
                        resolved[i],
                        before,
                        effects,
                        undeleted,
                    );
                    if entry == default {
                        continue;
                    }
                    let index = func.dfg.make_imm_value(i as i64);
                    let (store, _) = make_floating_insn(
                        func,
                        InsnData::StoreElem {
                            args: [materialized, index, entry],
                            elem_ty,
                        },
                    );
                    effects.record(
                        "materialize element",
                        Effect::InsertBefore {
                            insn: store,
                            before,
                        },
                    );
                }
            }
        }

        // Virtually held monitors become real again.
        for _ in 0..locks {
            let (enter, _) = make_floating_insn(
                func,
                InsnData::MonitorEnter {
                    args: [materialized],
                },
            );
            effects.record(
                "materialize lock",
                Effect::InsertBefore {
                    insn: enter,
                    before,
                },
            );
        }

        self.update_entries_for_materialized(vo.value, materialized);
        materialized
    }

    /// Marks the whole pristine closure of `id` as materialized through
    /// its original allocations.
    fn reuse_allocation(
        &mut self,
        virtuals: &PrimaryMap<ObjectId, VirtualObject>,
        virtual_values: &FxHashMap<Value, ObjectId>,
        id: ObjectId,
        undeleted: &mut FxHashSet<Insn>,
    ) -> Value {
        let vo = &virtuals[id];
        if let Some(value) = self.object(id).and_then(ObjectState::materialized_value) {
            return value;
        }
        trace!(object = id.0, "reuse original allocation");

        undeleted.insert(vo.alloc);
        let entries = self.object(id).unwrap().entries().to_vec();
        self.add_object(id, ObjectState::Materialized { value: vo.value });

        for entry in entries {
            if let Some(&nested) = virtual_values.get(&entry) {
                if self.has_object(nested) {
                    self.reuse_allocation(virtuals, virtual_values, nested, undeleted);
                }
            }
        }

        vo.value
    }

    /// Resolves one entry value for a materialization store, materializing
    /// the referenced object if it is still virtual.
    fn entry_value(
        &mut self,
        func: &mut Function,
        virtuals: &PrimaryMap<ObjectId, VirtualObject>,
        virtual_values: &FxHashMap<Value, ObjectId>,
        entry: Value,
        before: Insn,
        effects: &mut EffectList,
        undeleted: &mut FxHashSet<Insn>,
    ) -> Value {
        let Some(&nested) = virtual_values.get(&entry) else {
            return entry;
        };
        if !self.has_object(nested) {
            return entry;
        }
        if let Some(value) = self.object(nested).and_then(ObjectState::materialized_value) {
            return value;
        }
        self.materialize_before(func, virtuals, virtual_values, nested, before, effects, undeleted)
    }

    /// Replaces references to a freshly materialized object in every
    /// remaining virtual object's entries.
    fn update_entries_for_materialized(&mut self, canonical: Value, materialized: Value) {
        if canonical == materialized {
            return;
        }
        for idx in 0..self.objects.len() {
            let Some(slot) = self.objects[idx].as_deref() else {
                continue;
            };
            if let ObjectState::Virtual { entries, .. } = slot {
                if entries.contains(&canonical) {
                    let slot = Rc::make_mut(self.objects[idx].as_mut().unwrap());
                    if let ObjectState::Virtual { entries, .. } = slot {
                        for entry in entries.iter_mut() {
                            if *entry == canonical {
                                *entry = materialized;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Returns `true` if `value` refers to an object that is still virtual in
/// this state.
fn is_live_virtual(
    state: &BlockState,
    virtual_values: &FxHashMap<Value, ObjectId>,
    value: Value,
) -> bool {
    virtual_values
        .get(&value)
        .and_then(|&id| state.object(id))
        .map_or(false, ObjectState::is_virtual)
}

/// Creates an instruction (and its result value) in the data flow graph
/// without inserting it into the layout.
pub(super) fn make_floating_insn(func: &mut Function, data: InsnData) -> (Insn, Option<Value>) {
    let insn = func.dfg.make_insn(data);
    let result = func.dfg.make_result(insn).map(|value_data| {
        let value = func.dfg.make_value(value_data);
        func.dfg.attach_result(insn, value);
        value
    });
    (insn, result)
}
