//! Adjacency heap: contiguous power-of-two blocks for multipath groups
//! (spec SPEC_FULL §3.5, §4.4), generalizing the teacher's slot-registry
//! idiom (`drivers/src/net/netdev.rs`'s fixed-array-plus-freelist registry)
//! to variable-size block allocation.

use std::collections::HashMap;

use vswitch_types::{AdjIndex, HwIfIndex, NextIndex, NodeIndex, SwIfIndex};

/// Discriminator for `lookup_next_index` — a tagged sum type replacing the
/// source's raw index-into-a-dispatch-table (spec SPEC_FULL Design Notes).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LookupNext {
    Miss,
    Drop,
    Punt,
    Local,
    Arp,
    Rewrite,
}

/// Cached L2 (and optional VLAN) header, prepended to a packet immediately
/// before its current L3 byte on the rewrite path.
#[derive(Clone, Copy)]
pub struct RewriteHeader {
    pub sw_if_index: SwIfIndex,
    pub node_index: NodeIndex,
    pub next_index: NextIndex,
    pub max_l3_packet_bytes: u16,
    pub data_len: u8,
    pub data: [u8; 64],
}

impl RewriteHeader {
    pub fn empty() -> Self {
        RewriteHeader {
            sw_if_index: SwIfIndex::INVALID,
            node_index: NodeIndex::INVALID,
            next_index: NextIndex::INVALID,
            max_l3_packet_bytes: u16::MAX,
            data_len: 0,
            data: [0; 64],
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.data_len as usize]
    }

    pub fn set_bytes(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.data.len(), "rewrite header exceeds inline bound");
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.data_len = bytes.len() as u8;
    }
}

/// A forwarding decision record (spec SPEC_FULL §3.5).
#[derive(Clone, Copy)]
pub struct Adjacency {
    pub lookup_next: LookupNext,
    /// Power-of-two block size this adjacency belongs to (1 for a plain
    /// single-path adjacency).
    pub n_adj: u32,
    pub if_address_index: Option<u32>,
    pub rewrite: RewriteHeader,
    pub hw_if_index: HwIfIndex,
    refcount: u32,
}

impl Adjacency {
    pub fn template(lookup_next: LookupNext) -> Self {
        Adjacency {
            lookup_next,
            n_adj: 1,
            if_address_index: None,
            rewrite: RewriteHeader::empty(),
            hw_if_index: HwIfIndex::INVALID,
            refcount: 0,
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }
}

/// Heap of adjacencies, able to hand out contiguous power-of-two-sized
/// blocks for multipath groups and reclaim them when every block member's
/// refcount reaches zero.
pub struct AdjacencyHeap {
    slots: Vec<Option<Adjacency>>,
    /// Free contiguous ranges, bucketed by block size (always a power of
    /// two), each entry the base index of a free block of that size.
    free_blocks: HashMap<u32, Vec<u32>>,
}

impl AdjacencyHeap {
    pub fn new() -> Self {
        AdjacencyHeap {
            slots: Vec::new(),
            free_blocks: HashMap::new(),
        }
    }

    fn alloc_block(&mut self, block_size: u32) -> u32 {
        debug_assert!(block_size.is_power_of_two());
        if let Some(base) = self.free_blocks.get_mut(&block_size).and_then(Vec::pop) {
            return base;
        }
        let base = self.slots.len() as u32;
        self.slots
            .resize_with(self.slots.len() + block_size as usize, || None);
        base
    }

    /// `add_adjacency(template, block_size)`: copies `template` into every
    /// slot of a freshly allocated contiguous block and returns the block
    /// head's index.
    pub fn add_adjacency(&mut self, mut template: Adjacency, block_size: u32) -> AdjIndex {
        let block_size = block_size.max(1).next_power_of_two();
        let base = self.alloc_block(block_size);
        template.n_adj = block_size;
        for i in 0..block_size {
            self.slots[(base + i) as usize] = Some(template);
        }
        AdjIndex::new(base)
    }

    pub fn get(&self, index: AdjIndex) -> Option<&Adjacency> {
        self.slots.get(index.as_usize()).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, index: AdjIndex) -> Option<&mut Adjacency> {
        self.slots.get_mut(index.as_usize()).and_then(|s| s.as_mut())
    }

    /// Member at `base + offset` within a multipath block, `offset` already
    /// reduced modulo `n_adj` by the caller (the rewrite node's flow-hash
    /// selector).
    pub fn member(&self, base: AdjIndex, offset: u32) -> Option<&Adjacency> {
        self.get(base).and_then(|head| {
            let n_adj = head.n_adj;
            self.slots
                .get(base.as_usize() + (offset % n_adj.max(1)) as usize)
                .and_then(|s| s.as_ref())
        })
    }

    pub fn incref(&mut self, index: AdjIndex) {
        if let Some(adj) = self.get_mut(index) {
            adj.refcount += 1;
        }
    }

    /// `del_adjacency(index)`: only actually frees the block once every
    /// slot's refcount has dropped to zero (decremented by the caller before
    /// calling this, matching the FIB's "del at tail of add_del_route"
    /// ordering).
    pub fn decref_and_maybe_free(&mut self, index: AdjIndex) {
        let Some(adj) = self.get_mut(index) else {
            return;
        };
        debug_assert!(adj.refcount > 0, "adjacency refcount underflow");
        adj.refcount -= 1;
        if adj.refcount > 0 {
            return;
        }
        let n_adj = adj.n_adj;
        let base = index.0;
        for i in 0..n_adj {
            self.slots[(base + i) as usize] = None;
        }
        self.free_blocks.entry(n_adj).or_default().push(base);
    }
}

impl Default for AdjacencyHeap {
    fn default() -> Self {
        Self::new()
    }
}
