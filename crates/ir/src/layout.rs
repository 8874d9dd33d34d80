//! This module contains function layout information, including block order
//! and instruction order within blocks.
//!
//! An instruction that exists in the data flow graph but is not inserted
//! in the layout is *floating*: it has no program point yet (or no
//! longer). Deferred graph mutations create instructions floating and
//! insert them at commit time.

use rustc_hash::FxHashMap;

use crate::{dfg::Block, insn::Insn};

#[derive(Debug, Default)]
pub struct Layout {
    blocks: FxHashMap<Block, BlockNode>,
    insns: FxHashMap<Insn, InsnNode>,
    first_block: Option<Block>,
    last_block: Option<Block>,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_block(&self) -> Option<Block> {
        self.first_block
    }

    pub fn last_block(&self) -> Option<Block> {
        self.last_block
    }

    pub fn is_block_inserted(&self, block: Block) -> bool {
        self.blocks.contains_key(&block)
    }

    pub fn is_insn_inserted(&self, insn: Insn) -> bool {
        self.insns.contains_key(&insn)
    }

    pub fn prev_block_of(&self, block: Block) -> Option<Block> {
        self.blocks[&block].prev
    }

    pub fn next_block_of(&self, block: Block) -> Option<Block> {
        self.blocks[&block].next
    }

    pub fn append_block(&mut self, block: Block) {
        debug_assert!(!self.is_block_inserted(block));

        let mut block_node = BlockNode::default();

        if let Some(last_block) = self.last_block {
            let last_block_node = self.blocks.get_mut(&last_block).unwrap();
            last_block_node.next = Some(block);
            block_node.prev = Some(last_block);
        } else {
            self.first_block = Some(block);
        }

        self.blocks.insert(block, block_node);
        self.last_block = Some(block);
    }

    pub fn insert_block_before(&mut self, block: Block, before: Block) {
        debug_assert!(!self.is_block_inserted(block) && self.is_block_inserted(before));

        let mut block_node = BlockNode::default();
        let prev = self.blocks[&before].prev;

        block_node.prev = prev;
        block_node.next = Some(before);

        match prev {
            Some(prev) => self.blocks.get_mut(&prev).unwrap().next = Some(block),
            None => self.first_block = Some(block),
        }
        self.blocks.get_mut(&before).unwrap().prev = Some(block);

        self.blocks.insert(block, block_node);
    }

    pub fn insert_block_after(&mut self, block: Block, after: Block) {
        debug_assert!(!self.is_block_inserted(block) && self.is_block_inserted(after));

        let mut block_node = BlockNode::default();
        let next = self.blocks[&after].next;

        block_node.prev = Some(after);
        block_node.next = next;

        match next {
            Some(next) => self.blocks.get_mut(&next).unwrap().prev = Some(block),
            None => self.last_block = Some(block),
        }
        self.blocks.get_mut(&after).unwrap().next = Some(block);

        self.blocks.insert(block, block_node);
    }

    pub fn remove_block(&mut self, block: Block) {
        debug_assert!(self.is_block_inserted(block));
        debug_assert!(self.blocks[&block].first_insn.is_none());

        let node = self.blocks.remove(&block).unwrap();
        match node.prev {
            Some(prev) => self.blocks.get_mut(&prev).unwrap().next = node.next,
            None => self.first_block = node.next,
        }
        match node.next {
            Some(next) => self.blocks.get_mut(&next).unwrap().prev = node.prev,
            None => self.last_block = node.prev,
        }
    }

    pub fn iter_block(&self) -> impl Iterator<Item = Block> + '_ {
        BlockIter {
            next: self.first_block,
            blocks: &self.blocks,
        }
    }

    pub fn first_insn_of(&self, block: Block) -> Option<Insn> {
        self.blocks[&block].first_insn
    }

    pub fn last_insn_of(&self, block: Block) -> Option<Insn> {
        self.blocks[&block].last_insn
    }

    pub fn prev_insn_of(&self, insn: Insn) -> Option<Insn> {
        self.insns[&insn].prev
    }

    pub fn next_insn_of(&self, insn: Insn) -> Option<Insn> {
        self.insns[&insn].next
    }

    pub fn insn_block(&self, insn: Insn) -> Block {
        self.insns[&insn].block
    }

    pub fn append_insn(&mut self, insn: Insn, block: Block) {
        debug_assert!(!self.is_insn_inserted(insn) && self.is_block_inserted(block));

        let mut insn_node = InsnNode::new(block);
        let block_node = self.blocks.get_mut(&block).unwrap();

        if let Some(last_insn) = block_node.last_insn {
            insn_node.prev = Some(last_insn);
            self.insns.get_mut(&last_insn).unwrap().next = Some(insn);
        } else {
            block_node.first_insn = Some(insn);
        }

        self.blocks.get_mut(&block).unwrap().last_insn = Some(insn);
        self.insns.insert(insn, insn_node);
    }

    pub fn prepend_insn(&mut self, insn: Insn, block: Block) {
        debug_assert!(!self.is_insn_inserted(insn) && self.is_block_inserted(block));

        let mut insn_node = InsnNode::new(block);
        let block_node = self.blocks.get_mut(&block).unwrap();

        if let Some(first_insn) = block_node.first_insn {
            insn_node.next = Some(first_insn);
            self.insns.get_mut(&first_insn).unwrap().prev = Some(insn);
        } else {
            block_node.last_insn = Some(insn);
        }

        self.blocks.get_mut(&block).unwrap().first_insn = Some(insn);
        self.insns.insert(insn, insn_node);
    }

    pub fn insert_insn_before(&mut self, insn: Insn, before: Insn) {
        debug_assert!(!self.is_insn_inserted(insn) && self.is_insn_inserted(before));

        let block = self.insns[&before].block;
        let prev = self.insns[&before].prev;

        let mut insn_node = InsnNode::new(block);
        insn_node.prev = prev;
        insn_node.next = Some(before);

        match prev {
            Some(prev) => self.insns.get_mut(&prev).unwrap().next = Some(insn),
            None => self.blocks.get_mut(&block).unwrap().first_insn = Some(insn),
        }
        self.insns.get_mut(&before).unwrap().prev = Some(insn);

        self.insns.insert(insn, insn_node);
    }

    pub fn insert_insn_after(&mut self, insn: Insn, after: Insn) {
        debug_assert!(!self.is_insn_inserted(insn) && self.is_insn_inserted(after));

        let block = self.insns[&after].block;
        let next = self.insns[&after].next;

        let mut insn_node = InsnNode::new(block);
        insn_node.prev = Some(after);
        insn_node.next = next;

        match next {
            Some(next) => self.insns.get_mut(&next).unwrap().prev = Some(insn),
            None => self.blocks.get_mut(&block).unwrap().last_insn = Some(insn),
        }
        self.insns.get_mut(&after).unwrap().next = Some(insn);

        self.insns.insert(insn, insn_node);
    }

    pub fn remove_insn(&mut self, insn: Insn) {
        debug_assert!(self.is_insn_inserted(insn));

        let node = self.insns.remove(&insn).unwrap();
        let block = node.block;
        match node.prev {
            Some(prev) => self.insns.get_mut(&prev).unwrap().next = node.next,
            None => self.blocks.get_mut(&block).unwrap().first_insn = node.next,
        }
        match node.next {
            Some(next) => self.insns.get_mut(&next).unwrap().prev = node.prev,
            None => self.blocks.get_mut(&block).unwrap().last_insn = node.prev,
        }
    }

    pub fn iter_insn(&self, block: Block) -> impl Iterator<Item = Insn> + '_ {
        InsnIter {
            next: self.blocks[&block].first_insn,
            insns: &self.insns,
        }
    }
}

struct BlockIter<'a> {
    next: Option<Block>,
    blocks: &'a FxHashMap<Block, BlockNode>,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let next = self.next?;
        self.next = self.blocks[&next].next;
        Some(next)
    }
}

struct InsnIter<'a> {
    next: Option<Insn>,
    insns: &'a FxHashMap<Insn, InsnNode>,
}

impl<'a> Iterator for InsnIter<'a> {
    type Item = Insn;

    fn next(&mut self) -> Option<Insn> {
        let next = self.next?;
        self.next = self.insns[&next].next;
        Some(next)
    }
}

#[derive(Default, Debug, Clone)]
struct BlockNode {
    prev: Option<Block>,
    next: Option<Block>,
    first_insn: Option<Insn>,
    last_insn: Option<Insn>,
}

#[derive(Debug, Clone)]
struct InsnNode {
    /// The block in which the insn exists.
    block: Block,
    prev: Option<Insn>,
    next: Option<Insn>,
}

impl InsnNode {
    fn new(block: Block) -> Self {
        Self {
            block,
            prev: None,
            next: None,
        }
    }
}
