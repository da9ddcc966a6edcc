//! Multipath canonicalization and the lazy remap scheme (spec SPEC_FULL
//! §4.4, §9). New relative to the teacher (which has no multipath concept);
//! grounded directly on spec.md §4.4 and
//! `examples/original_source/vnet/ip/ip4_forward.c`'s
//! `ip4_add_del_route_next_hop` multipath-adjacency machinery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use vswitch_types::AdjIndex;

use crate::adjacency::{Adjacency, AdjacencyHeap, LookupNext};

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Normalize a next-hop set into a `(adj_index, weight)` vector sorted by
/// adjacency index, weights reduced by their GCD. Two prefixes with
/// identical next-hop sets normalize identically and therefore share a
/// multipath block.
pub fn canonicalize(mut next_hops: Vec<(AdjIndex, u32)>) -> Vec<(AdjIndex, u32)> {
    next_hops.sort_by_key(|(adj, _)| adj.0);
    let g = next_hops.iter().fold(0u32, |acc, (_, w)| gcd(acc, *w));
    if g > 1 {
        for (_, w) in next_hops.iter_mut() {
            *w /= g;
        }
    }
    next_hops
}

/// Content-addressed table from a normalized next-hop vector to the
/// multipath-adjacency block realizing it, plus the lazy remap table that
/// lets `maybe_remap_adjacencies` avoid an O(n_prefixes) walk on every
/// underlying adjacency change.
pub struct MultipathTable {
    by_vector: HashMap<Vec<(AdjIndex, u32)>, AdjIndex>,
    refcounts: HashMap<AdjIndex, u32>,
    remap: HashMap<AdjIndex, Option<AdjIndex>>,
    n_remaps: AtomicU64,
}

impl MultipathTable {
    pub fn new() -> Self {
        MultipathTable {
            by_vector: HashMap::new(),
            refcounts: HashMap::new(),
            remap: HashMap::new(),
            n_remaps: AtomicU64::new(0),
        }
    }

    pub fn n_adjacency_remaps(&self) -> u64 {
        self.n_remaps.load(Ordering::Relaxed)
    }

    /// Find or build the multipath block for `normalized`, incrementing its
    /// reference count. The block's size is `round_up_to_power_of_two(Σ
    /// weights)`, filled by distributing weighted replicas of each
    /// next-hop's own adjacency.
    pub fn get_or_build(
        &mut self,
        heap: &mut AdjacencyHeap,
        normalized: Vec<(AdjIndex, u32)>,
    ) -> AdjIndex {
        if normalized.len() == 1 && normalized[0].1 == 1 {
            // Single next-hop, unit weight: no multipath block needed, the
            // caller's prefix points straight at the per-interface adj.
            let (adj, _) = normalized[0];
            *self.refcounts.entry(adj).or_insert(0) += 1;
            return adj;
        }

        if let Some(&existing) = self.by_vector.get(&normalized) {
            *self.refcounts.entry(existing).or_insert(0) += 1;
            return existing;
        }

        let total_weight: u32 = normalized.iter().map(|(_, w)| *w).sum();
        let block_size = total_weight.max(1).next_power_of_two();
        let template = heap
            .get(normalized[0].0)
            .copied()
            .unwrap_or_else(|| Adjacency::template(LookupNext::Drop));
        let block = heap.add_adjacency(template, block_size);

        // Distribute weighted replicas round-robin so no next-hop's
        // share of the block is ever off by more than one slot.
        let mut counts = vec![0u32; normalized.len()];
        for slot in 0..block_size {
            let mut best = 0usize;
            let mut best_score = f64::MIN;
            for (i, (_, w)) in normalized.iter().enumerate() {
                let share = counts[i] as f64 / (*w as f64);
                let score = -share;
                if score > best_score {
                    best_score = score;
                    best = i;
                }
            }
            counts[best] += 1;
            let (member_adj, _) = normalized[best];
            if let Some(member) = heap.get(member_adj).copied() {
                if let Some(target) = heap.get_mut(AdjIndex::new(block.0 + slot)) {
                    *target = member;
                    target.n_adj = block_size;
                }
            }
        }
        for (adj, _) in &normalized {
            heap.incref(*adj);
        }

        self.by_vector.insert(normalized, block);
        self.refcounts.insert(block, 1);
        block
    }

    /// Release one reference to `block`; frees it via the adjacency heap
    /// once the last referring prefix is gone.
    pub fn release(&mut self, heap: &mut AdjacencyHeap, block: AdjIndex) {
        if let Some(count) = self.refcounts.get_mut(&block) {
            *count -= 1;
            if *count == 0 {
                self.refcounts.remove(&block);
                self.by_vector.retain(|_, v| *v != block);
                heap.incref(block);
                heap.decref_and_maybe_free(block);
            }
        }
    }

    /// Record that `old` has been remapped to `new` (or removed, if `new`
    /// is `None`). Subscribers pick this up lazily via `take_remap`.
    pub fn record_remap(&mut self, old: AdjIndex, new: Option<AdjIndex>) {
        self.remap.insert(old, new);
        self.n_remaps.fetch_add(1, Ordering::Relaxed);
    }

    /// Fast-path check: `n_adjacency_remaps == 0` short-circuits the FIB's
    /// `maybe_remap_adjacencies` walk entirely.
    pub fn has_pending_remaps(&self) -> bool {
        !self.remap.is_empty()
    }

    pub fn resolve(&self, adj: AdjIndex) -> Option<AdjIndex> {
        self.remap.get(&adj).copied().flatten()
    }

    /// Drain every pending remap for `Ipv4Fib::maybe_remap_adjacencies`,
    /// clearing the table so `has_pending_remaps` goes false again until the
    /// next underlying adjacency change.
    pub fn drain_remaps(&mut self) -> HashMap<AdjIndex, Option<AdjIndex>> {
        std::mem::take(&mut self.remap)
    }
}

impl Default for MultipathTable {
    fn default() -> Self {
        Self::new()
    }
}
