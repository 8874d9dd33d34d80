use cranelift_entity::{entity_impl, packed_option::PackedOption, PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use partita_ir::{Block, ControlFlowGraph};

use crate::domtree::DomTree;

#[derive(Debug, Default)]
pub struct LoopTree {
    /// Stores loops.
    /// The index of an outer loop is guaranteed to be lower than its inner
    /// loops, because loops are found in RPO.
    loops: PrimaryMap<Loop, LoopData>,

    /// Maps blocks to their containing loop.
    /// If a block is contained by multiple nested loops, it is mapped to
    /// the innermost loop.
    block_to_loop: SecondaryMap<Block, PackedOption<Loop>>,
}

impl LoopTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(&mut self, cfg: &ControlFlowGraph, domtree: &DomTree) {
        self.clear();

        // Find loop headers in RPO, so outer loops are guaranteed to be
        // inserted before their inner loops.
        for &block in domtree.rpo() {
            for &pred in cfg.preds_of(block) {
                if domtree.dominates(block, pred) {
                    let loop_data = LoopData {
                        header: block,
                        parent: None.into(),
                        children: SmallVec::new(),
                    };

                    self.loops.push(loop_data);
                    break;
                }
            }
        }

        self.analyze_loops(cfg, domtree);
    }

    /// Returns all loops.
    /// The iterator returns outer loops before their inner loops.
    pub fn loops(&self) -> impl DoubleEndedIterator<Item = Loop> {
        self.loops.keys()
    }

    /// Returns all blocks in the loop, in post order.
    pub fn iter_blocks_post_order<'a, 'b>(
        &'a self,
        cfg: &'b ControlFlowGraph,
        lp: Loop,
    ) -> BlocksInLoopPostOrder<'a, 'b> {
        BlocksInLoopPostOrder::new(self, cfg, lp)
    }

    /// Returns `true` if the `block` is in the `lp`.
    pub fn is_in_loop(&self, block: Block, lp: Loop) -> bool {
        let mut loop_of_block = self.loop_of_block(block);
        while let Some(cur_lp) = loop_of_block {
            if lp == cur_lp {
                return true;
            }
            loop_of_block = self.parent_loop(cur_lp);
        }
        false
    }

    /// Returns the number of loops found.
    pub fn loop_num(&self) -> usize {
        self.loops.len()
    }

    /// Map `block` to `lp`.
    pub fn map_block(&mut self, block: Block, lp: Loop) {
        self.block_to_loop[block] = lp.into();
    }

    pub fn clear(&mut self) {
        self.loops.clear();
        self.block_to_loop.clear();
    }

    /// Returns the header block of the `lp`.
    pub fn loop_header(&self, lp: Loop) -> Block {
        self.loops[lp].header
    }

    /// Returns the loop whose header is `block`, if any.
    pub fn loop_of_header(&self, block: Block) -> Option<Loop> {
        let lp = self.loop_of_block(block)?;
        (self.loops[lp].header == block).then_some(lp)
    }

    /// Returns the nesting depth of the loop; outermost loops have depth 1.
    pub fn loop_depth(&self, lp: Loop) -> usize {
        let mut depth = 1;
        let mut current = lp;
        while let Some(parent) = self.parent_loop(current) {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Get the parent loop of the `lp` if it exists.
    pub fn parent_loop(&self, lp: Loop) -> Option<Loop> {
        self.loops[lp].parent.expand()
    }

    /// Returns the loop that the `block` belongs to.
    /// If the `block` belongs to multiple loops, returns the innermost one.
    pub fn loop_of_block(&self, block: Block) -> Option<Loop> {
        self.block_to_loop[block].expand()
    }

    /// Analyze loops. This method
    /// 1. maps each block to its containing loop,
    /// 2. sets the parent and children of each loop.
    fn analyze_loops(&mut self, cfg: &ControlFlowGraph, domtree: &DomTree) {
        let mut worklist = vec![];

        // Iterate loops in reverse to analyze inner loops first.
        for cur_lp in self.loops.keys().rev() {
            let cur_lp_header = self.loop_header(cur_lp);

            // Add predecessors of the loop header to the worklist.
            for &block in cfg.preds_of(cur_lp_header) {
                if domtree.dominates(cur_lp_header, block) {
                    worklist.push(block);
                }
            }

            while let Some(block) = worklist.pop() {
                match self.block_to_loop[block].expand() {
                    Some(lp_of_block) => {
                        let outermost_parent = self.outermost_parent(lp_of_block);

                        // If the outermost parent is the current loop, the
                        // block is already visited.
                        if outermost_parent == cur_lp {
                            continue;
                        } else {
                            self.loops[cur_lp].children.push(outermost_parent);
                            self.loops[outermost_parent].parent = cur_lp.into();

                            let lp_header_of_block = self.loop_header(lp_of_block);
                            worklist.extend(cfg.preds_of(lp_header_of_block));
                        }
                    }

                    // If the block is not mapped to any loop, map it now.
                    None => {
                        self.map_block(block, cur_lp);
                        // If the block is not the loop header, add its
                        // predecessors to the worklist.
                        if block != cur_lp_header {
                            worklist.extend(cfg.preds_of(block));
                        }
                    }
                }
            }
        }
    }

    /// Returns the outermost parent loop of `lp`. If `lp` doesn't have any
    /// parent, returns `lp` itself.
    fn outermost_parent(&self, mut lp: Loop) -> Loop {
        while let Some(parent) = self.parent_loop(lp) {
            lp = parent;
        }
        lp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Loop(u32);
entity_impl!(Loop);

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoopData {
    /// The header of the loop.
    header: Block,

    /// The parent loop that contains the loop.
    parent: PackedOption<Loop>,

    /// Child loops that the loop contains.
    children: SmallVec<[Loop; 4]>,
}

pub struct BlocksInLoopPostOrder<'a, 'b> {
    lpt: &'a LoopTree,
    cfg: &'b ControlFlowGraph,
    lp: Loop,
    stack: Vec<Block>,
    block_state: FxHashMap<Block, BlockState>,
}

impl<'a, 'b> BlocksInLoopPostOrder<'a, 'b> {
    fn new(lpt: &'a LoopTree, cfg: &'b ControlFlowGraph, lp: Loop) -> Self {
        let loop_header = lpt.loop_header(lp);

        Self {
            lpt,
            cfg,
            lp,
            stack: vec![loop_header],
            block_state: FxHashMap::default(),
        }
    }
}

impl<'a, 'b> Iterator for BlocksInLoopPostOrder<'a, 'b> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&block) = self.stack.last() {
            match self.block_state.get(&block) {
                // The block is already visited but not yet returned from
                // the iterator, so mark it `Finished` and return it.
                Some(BlockState::Visited) => {
                    let block = self.stack.pop().unwrap();
                    self.block_state.insert(block, BlockState::Finished);
                    return Some(block);
                }

                // The block is already returned, so just remove it from
                // the stack.
                Some(BlockState::Finished) => {
                    self.stack.pop().unwrap();
                }

                // The block is not visited yet, so push its unvisited
                // in-loop successors to the stack and mark it `Visited`.
                None => {
                    self.block_state.insert(block, BlockState::Visited);
                    for &succ in self.cfg.succs_of(block) {
                        if self.block_state.get(&succ).is_none()
                            && self.lpt.is_in_loop(succ, self.lp)
                        {
                            self.stack.push(succ);
                        }
                    }
                }
            }
        }

        None
    }
}

enum BlockState {
    Visited,
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;

    use partita_ir::{builder::test_util::test_func_builder, Function, Type};

    fn compute_loop(func: &Function) -> LoopTree {
        let mut cfg = ControlFlowGraph::new();
        let mut domtree = DomTree::new();
        let mut lpt = LoopTree::new();
        cfg.compute(func);
        domtree.compute(&cfg);
        lpt.compute(&cfg, &domtree);
        lpt
    }

    #[test]
    fn simple_loop() {
        let mut builder = test_func_builder(&[], &[]);
        let b0 = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();

        builder.switch_to_block(b0);
        let v0 = builder.make_imm_value(0i32);
        builder.jump(b1);

        builder.switch_to_block(b1);
        let v1 = builder.phi(&[(v0, b0)]);
        let c0 = builder.make_imm_value(10i32);
        let v2 = builder.eq(v1, c0);
        builder.br(v2, b3, b2);

        builder.switch_to_block(b2);
        let c1 = builder.make_imm_value(1i32);
        let v3 = builder.add(v1, c1);
        builder.jump(b1);
        builder.append_phi_arg(v1, v3, b2);

        builder.switch_to_block(b3);
        builder.ret(None);

        let func = builder.build();
        let lpt = compute_loop(&func);

        assert_eq!(lpt.loop_num(), 1);
        let lp0 = lpt.loops().next().unwrap();
        assert_eq!(lpt.loop_of_block(b0), None);
        assert_eq!(lpt.loop_of_block(b1), Some(lp0));
        assert_eq!(lpt.loop_of_block(b2), Some(lp0));
        assert_eq!(lpt.loop_of_block(b3), None);

        assert_eq!(lpt.loop_header(lp0), b1);
    }

    #[test]
    fn nested_loop() {
        let mut builder = test_func_builder(&[Type::I1], &[]);
        let b0 = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();
        let b4 = builder.append_block();

        let arg = builder.args()[0];

        builder.switch_to_block(b0);
        builder.jump(b1);

        builder.switch_to_block(b1);
        builder.jump(b2);

        builder.switch_to_block(b2);
        builder.br(arg, b2, b3);

        builder.switch_to_block(b3);
        builder.br(arg, b1, b4);

        builder.switch_to_block(b4);
        builder.ret(None);

        let func = builder.build();
        let lpt = compute_loop(&func);

        assert_eq!(lpt.loop_num(), 2);
        let outer = lpt.loop_of_block(b1).unwrap();
        let inner = lpt.loop_of_block(b2).unwrap();

        assert_eq!(lpt.loop_of_block(b0), None);
        assert_eq!(lpt.loop_of_block(b3), Some(outer));
        assert_eq!(lpt.loop_of_block(b4), None);

        assert_eq!(lpt.parent_loop(inner), Some(outer));
        assert_eq!(lpt.loop_header(outer), b1);
        assert_eq!(lpt.loop_header(inner), b2);
        assert_eq!(lpt.loop_depth(outer), 1);
        assert_eq!(lpt.loop_depth(inner), 2);
    }
}
