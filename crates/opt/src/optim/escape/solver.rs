//! The driver running the escape analysis to a fixed point.

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::debug;

use partita_ir::{Block, ControlFlowGraph, Function, InsnData};

use crate::{domtree::DomTree, loop_analysis::LoopTree, optim::dce::DceSolver};

use super::{
    closure::{EffectsClosure, LoopKillCache},
    EscapeError,
};

/// Cooperative cancellation, polled between blocks and iterations. The
/// driver never stops mid-commit; on expiry the current uncommitted
/// analysis is discarded and everything already applied stays.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(duration: Duration) -> Self {
        Self(Some(Instant::now() + duration))
    }

    pub fn is_expired(&self) -> bool {
        self.0.map_or(false, |at| Instant::now() >= at)
    }
}

#[derive(Debug, Clone)]
pub struct EaConfig {
    /// Track and forward memory reads in addition to virtualizing
    /// allocations.
    pub read_elimination: bool,

    /// Allocations with more entries than this are never virtualized.
    pub max_virtual_entries: usize,

    /// Upper bound on full analyze-commit-cleanup rounds.
    pub max_iterations: usize,

    /// Upper bound on merge rounds for a single loop before every object
    /// is materialized in front of it.
    pub loop_merge_bound: usize,

    /// After this many visits, a loop's kill cache degrades to
    /// kills-everything.
    pub loop_kill_visit_bound: u32,

    /// Loops nested deeper than this stop new virtualizations.
    pub loop_depth_cutoff: usize,

    pub deadline: Deadline,
}

impl Default for EaConfig {
    fn default() -> Self {
        Self {
            read_elimination: true,
            max_virtual_entries: 32,
            max_iterations: 2,
            loop_merge_bound: 8,
            loop_kill_visit_bound: 10,
            loop_depth_cutoff: 8,
            deadline: Deadline::none(),
        }
    }
}

/// Escape analysis and read elimination solver.
///
/// Each call to [`EscapeSolver::run`] owns all of its mutable state, so
/// independent functions can be processed by independent solvers
/// concurrently.
pub struct EscapeSolver {
    config: EaConfig,
    cfg: ControlFlowGraph,
    domtree: DomTree,
    lpt: LoopTree,
    loop_kills: FxHashMap<Block, LoopKillCache>,
    dce: DceSolver,
}

impl EscapeSolver {
    pub fn new(config: EaConfig) -> Self {
        Self {
            config,
            cfg: ControlFlowGraph::new(),
            domtree: DomTree::new(),
            lpt: LoopTree::new(),
            loop_kills: FxHashMap::default(),
            dce: DceSolver::new(),
        }
    }

    /// Runs the analysis to a fixed point. Returns `true` if the function
    /// was changed.
    pub fn run(&mut self, func: &mut Function) -> Result<bool, EscapeError> {
        self.loop_kills.clear();

        if func.layout.entry_block().is_none() {
            return Ok(false);
        }
        if !self.config.read_elimination && !has_candidate_allocation(func, &self.config) {
            return Ok(false);
        }

        let mut overall_changed = false;
        for iteration in 0..self.config.max_iterations {
            if self.config.deadline.is_expired() {
                break;
            }

            self.cfg.compute(func);
            self.domtree.compute(&self.cfg);
            self.lpt.compute(&self.cfg, &self.domtree);

            let deadline = self.config.deadline;
            let mut closure = EffectsClosure::new(
                func,
                &self.cfg,
                &self.domtree,
                &self.lpt,
                &self.config,
                &deadline,
                &mut self.loop_kills,
            );
            closure.run()?;

            if closure.expired || closure.irreducible {
                break;
            }
            if !closure.needs_apply() {
                break;
            }

            let modified = closure.commit()?;
            drop(closure);
            if !modified {
                break;
            }

            overall_changed = true;
            self.dce.run(func);
            debug!(iteration, "escape analysis iteration applied");
        }

        Ok(overall_changed)
    }
}

impl Default for EscapeSolver {
    fn default() -> Self {
        Self::new(EaConfig::default())
    }
}

/// Whether the function contains an allocation the analysis could
/// virtualize at all.
fn has_candidate_allocation(func: &Function, config: &EaConfig) -> bool {
    for block in func.layout.iter_block() {
        for insn in func.layout.iter_insn(block) {
            match func.dfg.insn_data(insn) {
                InsnData::Alloc { shape, .. } => {
                    if func.dfg.shape(*shape).field_num() <= config.max_virtual_entries {
                        return true;
                    }
                }
                InsnData::AllocArray { args, .. } => {
                    let len = func.dfg.value_imm(args[0]).and_then(|imm| imm.as_usize());
                    if len.is_some_and(|len| len <= config.max_virtual_entries) {
                        return true;
                    }
                }
                _ => {}
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;
    use std::time::Duration;

    use partita_ir::{
        builder::test_util::test_func_builder, Block, FuncRef, Function, InsnData, Kill, MemLoc,
        Type,
    };

    use super::{Deadline, EaConfig, EscapeSolver};
    use crate::optim::escape::EscapeError;

    fn run(func: &mut Function) -> bool {
        EscapeSolver::default().run(func).unwrap()
    }

    fn block_insns(func: &Function, block: Block) -> Vec<InsnData> {
        func.layout
            .iter_insn(block)
            .map(|insn| func.dfg.insn_data(insn).clone())
            .collect()
    }

    fn count_insns(func: &Function, pred: impl Fn(&InsnData) -> bool) -> usize {
        func.layout
            .iter_block()
            .flat_map(|block| func.layout.iter_insn(block))
            .filter(|&insn| pred(func.dfg.insn_data(insn)))
            .count()
    }

    #[test]
    fn scalar_replaces_simple_allocation() {
        let mut builder = test_func_builder(&[], &[Type::I64]);
        let b0 = builder.append_block();
        let point = builder.declare_shape("point", &[Type::I64, Type::I64]);

        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i64);
        let two = builder.make_imm_value(2i64);
        let obj = builder.alloc(point, &[one, two]);
        let x = builder.load_field(obj, point, 0);
        builder.ret(Some(x));

        let mut func = builder.build();
        assert!(run(&mut func));

        // The allocation and the load are gone; the return reads the
        // constant directly.
        let insns = block_insns(&func, b0);
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0], InsnData::Return { args: smallvec![one] });

        // A second run finds nothing left to do.
        assert!(!run(&mut func));
    }

    #[test]
    fn forwards_store_to_load() {
        let mut builder = test_func_builder(&[Type::Ref, Type::I64], &[Type::I64]);
        let b0 = builder.append_block();
        let cell = builder.declare_shape("cell", &[Type::I64]);

        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        builder.store_field(args[0], cell, 0, args[1]);
        let loaded = builder.load_field(args[0], cell, 0);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        assert!(run(&mut func));

        let insns = block_insns(&func, b0);
        assert_eq!(insns.len(), 2);
        assert!(matches!(insns[0], InsnData::StoreField { .. }));
        assert_eq!(
            insns[1],
            InsnData::Return {
                args: smallvec![args[1]]
            }
        );

        assert!(!run(&mut func));
    }

    #[test]
    fn deletes_noop_store() {
        let mut builder = test_func_builder(&[Type::Ref, Type::I64], &[]);
        let b0 = builder.append_block();
        let cell = builder.declare_shape("cell", &[Type::I64]);

        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        builder.store_field(args[0], cell, 0, args[1]);
        builder.store_field(args[0], cell, 0, args[1]);
        builder.ret(None);

        let mut func = builder.build();
        assert!(run(&mut func));
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::StoreField { .. })),
            1
        );
    }

    #[test]
    fn call_kill_set_invalidates_cache() {
        let cell_fields = [Type::I64];

        // A call that may write the loaded field keeps the load alive.
        let mut builder = test_func_builder(&[Type::Ref, Type::I64], &[Type::I64]);
        let b0 = builder.append_block();
        let cell = builder.declare_shape("cell", &cell_fields);
        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        builder.store_field(args[0], cell, 0, args[1]);
        builder.call(
            FuncRef(0),
            &[],
            None,
            Kill::locations(&[MemLoc::Field {
                shape: cell,
                field: 0,
            }]),
        );
        let loaded = builder.load_field(args[0], cell, 0);
        builder.ret(Some(loaded));
        let mut func = builder.build();
        run(&mut func);
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::LoadField { .. })),
            1
        );

        // A call with an unrelated kill set doesn't.
        let mut builder = test_func_builder(&[Type::Ref, Type::I64], &[Type::I64]);
        let b0 = builder.append_block();
        let cell = builder.declare_shape("cell", &cell_fields);
        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        builder.store_field(args[0], cell, 0, args[1]);
        builder.call(FuncRef(0), &[], None, Kill::locations(&[MemLoc::Named(7)]));
        let loaded = builder.load_field(args[0], cell, 0);
        builder.ret(Some(loaded));
        let mut func = builder.build();
        assert!(run(&mut func));
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::LoadField { .. })),
            0
        );
    }

    #[test]
    fn volatile_access_is_a_barrier() {
        let mut builder = test_func_builder(&[Type::Ref, Type::I64], &[Type::I64]);
        let b0 = builder.append_block();
        let cell = builder.declare_shape("cell", &[Type::I64, Type::I64]);

        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        builder.store_field(args[0], cell, 0, args[1]);
        let _fence = builder.load_field_volatile(args[0], cell, 1);
        let loaded = builder.load_field(args[0], cell, 0);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        run(&mut func);
        // Both loads survive: the volatile access killed the cache.
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::LoadField { .. })),
            2
        );
    }

    #[test]
    fn materializes_on_escaping_branch_only() {
        let mut builder = test_func_builder(&[Type::I1], &[Type::I64]);
        let b0 = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();
        let shape = builder.declare_shape("box", &[Type::I64]);

        let cond = builder.args()[0];
        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i64);
        let obj = builder.alloc(shape, &[one]);
        builder.br(cond, b1, b2);

        builder.switch_to_block(b1);
        builder.call(FuncRef(0), &[obj], None, Kill::All);
        builder.jump(b3);

        builder.switch_to_block(b2);
        let two = builder.make_imm_value(2i64);
        builder.store_field(obj, shape, 0, two);
        builder.jump(b3);

        builder.switch_to_block(b3);
        let loaded = builder.load_field(obj, shape, 0);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        assert!(run(&mut func));

        // The escaping path reuses the original allocation; the local
        // path scalarized its store and rematerializes at the branch
        // end. The merge sees both objects through a fresh phi.
        assert!(matches!(
            block_insns(&func, b0).first(),
            Some(InsnData::Alloc { .. })
        ));
        let b2_insns = block_insns(&func, b2);
        assert!(
            b2_insns
                .iter()
                .any(|data| matches!(data, InsnData::Alloc { .. })),
            "local path must rematerialize before the merge"
        );
        assert!(!b2_insns
            .iter()
            .any(|data| matches!(data, InsnData::StoreField { .. })));
        assert!(matches!(
            block_insns(&func, b3).first(),
            Some(InsnData::Phi { .. })
        ));

        assert!(!run(&mut func));
    }

    #[test]
    fn loop_store_kills_preloop_cache() {
        let mut builder = test_func_builder(&[Type::Ref, Type::I64], &[Type::I64]);
        let b0 = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();
        let cell = builder.declare_shape("cell", &[Type::I64]);

        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        builder.store_field(args[0], cell, 0, args[1]);
        let zero = builder.make_imm_value(0i64);
        builder.jump(b1);

        builder.switch_to_block(b1);
        let i = builder.phi(&[(zero, b0)]);
        let ten = builder.make_imm_value(10i64);
        let cond = builder.lt(i, ten);
        builder.br(cond, b2, b3);

        builder.switch_to_block(b2);
        builder.call(FuncRef(0), &[args[0]], None, Kill::All);
        let one = builder.make_imm_value(1i64);
        let next = builder.add(i, one);
        builder.jump(b1);
        builder.append_phi_arg(i, next, b2);

        builder.switch_to_block(b3);
        let loaded = builder.load_field(args[0], cell, 0);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        run(&mut func);

        // The loop body may overwrite the field, so the pre-loop store
        // must not feed the load after the loop.
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::LoadField { .. })),
            1
        );
    }

    #[test]
    fn cache_survives_loop_that_leaves_location_alone() {
        let mut builder = test_func_builder(&[Type::Ref, Type::I64], &[Type::I64]);
        let b0 = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();
        let cell = builder.declare_shape("cell", &[Type::I64]);

        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        builder.store_field(args[0], cell, 0, args[1]);
        let zero = builder.make_imm_value(0i64);
        builder.jump(b1);

        builder.switch_to_block(b1);
        let i = builder.phi(&[(zero, b0)]);
        let ten = builder.make_imm_value(10i64);
        let cond = builder.lt(i, ten);
        builder.br(cond, b2, b3);

        builder.switch_to_block(b2);
        let one = builder.make_imm_value(1i64);
        let next = builder.add(i, one);
        builder.jump(b1);
        builder.append_phi_arg(i, next, b2);

        builder.switch_to_block(b3);
        let loaded = builder.load_field(args[0], cell, 0);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        assert!(run(&mut func));

        // Nothing in the loop touches the field; the cached store value
        // feeds the load after the loop.
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::LoadField { .. })),
            0
        );
    }

    #[test]
    fn divergent_stores_merge_through_phi() {
        let mut builder = test_func_builder(
            &[Type::I1, Type::Ref, Type::I64, Type::I64],
            &[Type::I64],
        );
        let b0 = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();
        let cell = builder.declare_shape("cell", &[Type::I64]);

        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        builder.br(args[0], b1, b2);

        builder.switch_to_block(b1);
        builder.store_field(args[1], cell, 0, args[2]);
        builder.jump(b3);

        builder.switch_to_block(b2);
        builder.store_field(args[1], cell, 0, args[3]);
        builder.jump(b3);

        builder.switch_to_block(b3);
        let loaded = builder.load_field(args[1], cell, 0);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        assert!(run(&mut func));

        // The load is replaced by a phi over the two stored values.
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::LoadField { .. })),
            0
        );
        let b3_insns = block_insns(&func, b3);
        let phi = b3_insns
            .iter()
            .find_map(|data| match data {
                InsnData::Phi { values, .. } => Some(values.clone()),
                _ => None,
            })
            .expect("merge must synthesize a phi");
        assert!(phi.contains(&args[2]) && phi.contains(&args[3]));
    }

    #[test]
    fn one_sided_cache_entry_dies_at_merge() {
        let mut builder = test_func_builder(&[Type::I1, Type::Ref, Type::I64], &[Type::I64]);
        let b0 = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();
        let cell = builder.declare_shape("cell", &[Type::I64]);

        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        builder.br(args[0], b1, b2);

        builder.switch_to_block(b1);
        builder.store_field(args[1], cell, 0, args[2]);
        builder.jump(b3);

        builder.switch_to_block(b2);
        builder.jump(b3);

        builder.switch_to_block(b3);
        let loaded = builder.load_field(args[1], cell, 0);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        run(&mut func);
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::LoadField { .. })),
            1
        );
    }

    #[test]
    fn materializes_nested_objects_in_dependency_order() {
        let mut builder = test_func_builder(&[], &[]);
        let b0 = builder.append_block();
        let inner = builder.declare_shape("inner", &[Type::I64]);
        let outer = builder.declare_shape("outer", &[Type::Ref]);

        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i64);
        let two = builder.make_imm_value(2i64);
        let inner_obj = builder.alloc(inner, &[one]);
        let outer_obj = builder.alloc(outer, &[inner_obj]);
        // Touch the inner object so neither allocation is pristine.
        builder.store_field(inner_obj, inner, 0, two);
        builder.call(FuncRef(0), &[outer_obj], None, Kill::All);
        builder.ret(None);

        let mut func = builder.build();
        assert!(run(&mut func));

        let insns = block_insns(&func, b0);
        let allocs: Vec<usize> = insns
            .iter()
            .enumerate()
            .filter_map(|(i, data)| matches!(data, InsnData::Alloc { .. }).then_some(i))
            .collect();
        assert_eq!(allocs.len(), 2, "both objects must be rematerialized");

        // The store wiring the inner object into the outer one must come
        // after both allocations and before the call.
        let store = insns
            .iter()
            .position(|data| {
                matches!(data, InsnData::StoreField { shape, .. } if *shape == outer)
            })
            .expect("outer entry must be stored");
        let call = insns
            .iter()
            .position(|data| matches!(data, InsnData::Call { .. }))
            .unwrap();
        assert!(allocs.iter().all(|&a| a < store));
        assert!(store < call);
    }

    #[test]
    fn virtualizes_constant_length_array() {
        let mut builder = test_func_builder(&[Type::I64], &[Type::I64]);
        let b0 = builder.append_block();

        let arg = builder.args()[0];
        builder.switch_to_block(b0);
        let four = builder.make_imm_value(4i64);
        let arr = builder.alloc_array(Type::I64, four);
        let zero = builder.make_imm_value(0i64);
        builder.store_elem(arr, zero, arg, Type::I64);
        let loaded = builder.load_elem(arr, zero, Type::I64);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        assert!(run(&mut func));

        let insns = block_insns(&func, b0);
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0], InsnData::Return { args: smallvec![arg] });
    }

    #[test]
    fn dynamic_length_array_is_left_alone() {
        let mut builder = test_func_builder(&[Type::I64], &[Type::Ref]);
        let b0 = builder.append_block();

        let len = builder.args()[0];
        builder.switch_to_block(b0);
        let arr = builder.alloc_array(Type::I64, len);
        builder.ret(Some(arr));

        let mut func = builder.build();
        assert!(!run(&mut func));
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::AllocArray { .. })),
            1
        );
    }

    #[test]
    fn oversized_allocation_is_not_virtualized() {
        let config = EaConfig {
            max_virtual_entries: 2,
            ..EaConfig::default()
        };

        let mut builder = test_func_builder(&[], &[Type::I64]);
        let b0 = builder.append_block();
        let wide = builder.declare_shape("wide", &[Type::I64, Type::I64, Type::I64]);

        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i64);
        let obj = builder.alloc(wide, &[one, one, one]);
        let loaded = builder.load_field(obj, wide, 0);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        assert!(!EscapeSolver::new(config).run(&mut func).unwrap());
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::Alloc { .. })),
            1
        );
    }

    #[test]
    fn forwards_raw_store_to_raw_load() {
        let mut builder = test_func_builder(&[Type::Ref, Type::I64], &[Type::I64]);
        let b0 = builder.append_block();
        let cell = builder.declare_shape("cell", &[Type::I64]);
        let loc = MemLoc::Field {
            shape: cell,
            field: 0,
        };

        let args = builder.args().to_vec();
        builder.switch_to_block(b0);
        let offset = builder.make_imm_value(8i64);
        builder.raw_store(args[0], offset, args[1], loc);
        let loaded = builder.raw_load(args[0], offset, loc, Type::I64);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        assert!(run(&mut func));

        let insns = block_insns(&func, b0);
        assert_eq!(insns.len(), 2);
        assert!(matches!(insns[0], InsnData::RawStore { .. }));
        assert_eq!(
            insns[1],
            InsnData::Return {
                args: smallvec![args[1]]
            }
        );
    }

    #[test]
    fn loop_carried_object_stays_virtual() {
        let mut builder = test_func_builder(&[], &[Type::I64]);
        let b0 = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();
        let ctr = builder.declare_shape("counter", &[Type::I64]);

        builder.switch_to_block(b0);
        let zero = builder.make_imm_value(0i64);
        let obj = builder.alloc(ctr, &[zero]);
        builder.jump(b1);

        builder.switch_to_block(b1);
        let current = builder.load_field(obj, ctr, 0);
        let ten = builder.make_imm_value(10i64);
        let cond = builder.lt(current, ten);
        builder.br(cond, b2, b3);

        builder.switch_to_block(b2);
        let inc = builder.load_field(obj, ctr, 0);
        let one = builder.make_imm_value(1i64);
        let next = builder.add(inc, one);
        builder.store_field(obj, ctr, 0, next);
        builder.jump(b1);

        builder.switch_to_block(b3);
        let result = builder.load_field(obj, ctr, 0);
        builder.ret(Some(result));

        let mut func = builder.build();
        assert!(run(&mut func));

        // The counter never escapes: no allocation, no memory access is
        // left; the loop-carried value is a phi and leaves the loop
        // through a proxy.
        assert_eq!(
            count_insns(&func, |data| matches!(
                data,
                InsnData::Alloc { .. } | InsnData::LoadField { .. } | InsnData::StoreField { .. }
            )),
            0
        );
        assert!(block_insns(&func, b1)
            .iter()
            .any(|data| matches!(data, InsnData::Phi { .. })));
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::Proxy { .. })),
            1
        );

        assert!(!run(&mut func));
    }

    #[test]
    fn ensure_virtualized_violation_is_fatal() {
        let mut builder = test_func_builder(&[], &[]);
        let b0 = builder.append_block();
        let shape = builder.declare_shape("box", &[Type::I64]);

        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i64);
        let obj = builder.alloc(shape, &[one]);
        builder.ensure_virtualized(obj);
        builder.call(FuncRef(0), &[obj], None, Kill::All);
        builder.ret(None);

        let mut func = builder.build();
        assert_eq!(
            EscapeSolver::default().run(&mut func),
            Err(EscapeError::EnsureVirtualizedViolated)
        );
    }

    #[test]
    fn virtual_monitors_are_elided() {
        let mut builder = test_func_builder(&[], &[Type::I64]);
        let b0 = builder.append_block();
        let shape = builder.declare_shape("box", &[Type::I64]);

        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i64);
        let obj = builder.alloc(shape, &[one]);
        builder.monitor_enter(obj);
        let loaded = builder.load_field(obj, shape, 0);
        builder.monitor_exit(obj);
        builder.ret(Some(loaded));

        let mut func = builder.build();
        assert!(run(&mut func));

        let insns = block_insns(&func, b0);
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0], InsnData::Return { args: smallvec![one] });
    }

    #[test]
    fn expired_deadline_leaves_function_untouched() {
        let config = EaConfig {
            deadline: Deadline::after(Duration::ZERO),
            ..EaConfig::default()
        };

        let mut builder = test_func_builder(&[], &[Type::I64]);
        let b0 = builder.append_block();
        let point = builder.declare_shape("point", &[Type::I64, Type::I64]);

        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i64);
        let two = builder.make_imm_value(2i64);
        let obj = builder.alloc(point, &[one, two]);
        let x = builder.load_field(obj, point, 0);
        builder.ret(Some(x));

        let mut func = builder.build();
        assert!(!EscapeSolver::new(config).run(&mut func).unwrap());
        assert_eq!(
            count_insns(&func, |data| matches!(data, InsnData::Alloc { .. })),
            1
        );
    }
}
