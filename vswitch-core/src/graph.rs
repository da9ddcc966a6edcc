//! Node registry and run-to-completion scheduler (spec SPEC_FULL §4.2, §5).
//!
//! There is no preemption and no concurrency within one `Graph` instance —
//! matching the source's single-threaded-per-worker model. Multiple `Graph`
//! instances are independent; the data they share (FIB, adjacency heap,
//! interface table, living in `vswitch-fib`) is guarded by the
//! redistribution channel, not by locks taken on this struct.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, trace};
use vswitch_types::{BufferIndex, ForwardError, NextIndex, NodeIndex};

use crate::buffer::BufferPool;
use crate::frame::Frame;
use crate::node::{Node, NodeDescriptor, NodeKind, NodeState};
use crate::process::ProcessSlot;

/// Handed to a node's function for the duration of one invocation. Provides
/// the only mechanism by which a node may move buffers onward: enqueueing to
/// a next-edge, obtained in advance via `Graph::add_next`.
pub struct Dispatch<'g> {
    from: NodeIndex,
    targets: &'g [Option<NodeIndex>],
    pending: &'g mut HashMap<(NodeIndex, NextIndex), Frame>,
    ready: &'g mut VecDeque<(NodeIndex, Frame)>,
    pool: &'g mut BufferPool,
    error_counters: &'g mut Vec<u64>,
}

impl<'g> Dispatch<'g> {
    pub fn pool(&mut self) -> &mut BufferPool {
        self.pool
    }

    /// `get_next_frame(next) -> cursor`, generalized: returns the in-progress
    /// frame for this node's `next` edge, allocating one if this is the
    /// first write since the last flush.
    pub fn get_next_frame(&mut self, next: NextIndex) -> &mut Frame {
        self.pending
            .entry((self.from, next))
            .or_insert_with(Frame::new)
    }

    /// `put_next_frame`: flush the named next-edge's frame onward if it has
    /// filled to `FRAME_SIZE`. A partially-filled frame is left in place and
    /// picked up again on the node's next invocation, unless the caller
    /// calls `flush_next` to force delivery (e.g. at end-of-burst).
    pub fn put_next_frame(&mut self, next: NextIndex) {
        self.flush_next_if(next, Frame::is_full);
    }

    /// Force delivery of whatever has accumulated on `next`, full or not.
    /// The graph scheduler calls this on every pending edge at the end of a
    /// node invocation so that a burst that didn't fill a frame is still
    /// forwarded within one pass rather than stalling.
    pub fn flush_next(&mut self, next: NextIndex) {
        self.flush_next_if(next, |_| true);
    }

    fn flush_next_if(&mut self, next: NextIndex, should_flush: impl Fn(&Frame) -> bool) {
        let key = (self.from, next);
        let ready = matches!(self.pending.get(&key), Some(f) if !f.is_empty() && should_flush(f));
        if !ready {
            return;
        }
        let frame = self.pending.remove(&key).unwrap();
        if let Some(target) = self.targets.get(next.as_usize()).copied().flatten() {
            self.ready.push_back((target, frame));
        } else {
            trace!(from = ?self.from, next = ?next, "next-edge has no bound target, dropping frame");
        }
    }

    /// Dispatch a single buffer to `next`, flushing the frame onward once it
    /// fills. This is the x1 form of the source's
    /// `validate_buffer_enqueue_x1/x2`: the single mechanism by which a node
    /// may send different buffers to different next edges within one call.
    pub fn enqueue_x1(&mut self, next: NextIndex, bi: BufferIndex) {
        self.get_next_frame(next).push(bi);
        self.put_next_frame(next);
    }

    pub fn enqueue_x2(&mut self, next: NextIndex, bi0: BufferIndex, bi1: BufferIndex) {
        self.enqueue_x1(next, bi0);
        self.enqueue_x1(next, bi1);
    }

    pub fn count_error(&mut self, code: ForwardError) {
        let idx = code as usize;
        if idx < self.error_counters.len() {
            self.error_counters[idx] += 1;
        }
    }

    pub fn set_buffer_error(&mut self, bi: BufferIndex, node: NodeIndex, code: ForwardError) {
        self.pool.get_mut(bi).error = Some((node, code));
    }
}

/// A graph instance: node registry plus its buffer pool and the pending /
/// ready frame queues that make up the scheduler's state.
pub struct Graph {
    nodes: Vec<Node>,
    names: HashMap<&'static str, NodeIndex>,
    next_targets: Vec<Vec<Option<NodeIndex>>>,
    pub pool: BufferPool,
    pending: HashMap<(NodeIndex, NextIndex), Frame>,
    ready: VecDeque<(NodeIndex, Frame)>,
    started_at: Instant,
    event_queues: Vec<VecDeque<(u32, u32)>>,
    processes: HashMap<NodeIndex, ProcessSlot>,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            nodes: Vec::new(),
            names: HashMap::new(),
            next_targets: Vec::new(),
            pool: BufferPool::new(0),
            pending: HashMap::new(),
            ready: VecDeque::new(),
            started_at: Instant::now(),
            event_queues: Vec::new(),
            processes: HashMap::new(),
        }
    }

    /// Register a process node's state machine alongside its graph entry.
    /// Call after `register_node` with the same index.
    pub fn register_process(&mut self, node: NodeIndex, slot: ProcessSlot) {
        self.processes.insert(node, slot);
    }

    pub fn signal_process_event(&mut self, node: NodeIndex, event_type: u32, data: u32) {
        if let Some(slot) = self.processes.get_mut(&node) {
            slot.signal(event_type, data);
        }
    }

    /// Poll every registered process node once, each against the current
    /// graph clock. Separate from `run_once`'s input/internal dispatch since
    /// processes are driven by events/deadlines, not frames.
    pub fn run_processes(&mut self) {
        let now = self.time_now();
        for slot in self.processes.values_mut() {
            slot.poll(now);
        }
    }

    pub fn register_node(&mut self, descriptor: NodeDescriptor) -> NodeIndex {
        let idx = NodeIndex::new(self.nodes.len() as u32);
        let mut node = Node::new(descriptor.name, descriptor.kind, descriptor.state)
            .with_function(descriptor.function)
            .with_error_strings(&descriptor.error_strings);
        for next in &descriptor.next_names {
            node.add_next(next);
        }
        self.nodes.push(node);
        self.next_targets.push(Vec::new());
        self.event_queues.push(VecDeque::new());
        self.names.insert(descriptor.name, idx);
        // Resolve any next-edges whose target was registered earlier than
        // this node (forward references are resolved lazily by add_next).
        for other in 0..self.nodes.len() {
            let other_idx = NodeIndex::new(other as u32);
            self.rebind(other_idx);
        }
        idx
    }

    /// Declare (or fetch, if already declared) a next-edge from `from` named
    /// `name`, binding it to the node currently registered under that name
    /// if one exists.
    pub fn add_next(&mut self, from: NodeIndex, name: &'static str) -> NextIndex {
        let slot = self.nodes[from.as_usize()].add_next(name);
        let targets = &mut self.next_targets[from.as_usize()];
        if targets.len() <= slot.as_usize() {
            targets.resize(slot.as_usize() + 1, None);
        }
        if let Some(&target) = self.names.get(name) {
            targets[slot.as_usize()] = Some(target);
        }
        slot
    }

    fn rebind(&mut self, node: NodeIndex) {
        let names: Vec<&'static str> = {
            let n = &self.nodes[node.as_usize()];
            (0..n.n_next())
                .map(|i| n.next_name(NextIndex::new(i as u32)))
                .collect()
        };
        let targets = &mut self.next_targets[node.as_usize()];
        targets.resize(names.len(), None);
        for (i, name) in names.iter().enumerate() {
            if let Some(&target) = self.names.get(name) {
                targets[i] = Some(target);
            }
        }
    }

    pub fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.names.get(name).copied()
    }

    pub fn set_node_state(&mut self, node: NodeIndex, state: NodeState) {
        self.nodes[node.as_usize()].state = state;
    }

    pub fn signal_interrupt(&self, node: NodeIndex) {
        self.nodes[node.as_usize()].state.signal_interrupt();
    }

    /// Inject a pre-built frame directly onto a node's ready queue, as a
    /// driver or test harness would after filling buffers from a free list.
    pub fn enqueue_input(&mut self, node: NodeIndex, frame: Frame) {
        self.ready.push_back((node, frame));
    }

    /// `process_signal_event`: coalesce an event into the target process
    /// node's queue, delivered on its next wake.
    pub fn signal_event(&mut self, node: NodeIndex, event_type: u32, data: u32) {
        self.event_queues[node.as_usize()].push_back((event_type, data));
    }

    pub fn time_now(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Run one scheduler pass: drain at most one ready frame for an internal
    /// node, then poll every input/process node whose state says it's
    /// runnable this pass. Returns `true` if any node was dispatched.
    pub fn run_once(&mut self) -> bool {
        let mut did_work = false;

        if let Some((node_idx, frame)) = self.ready.pop_front() {
            self.dispatch(node_idx, frame);
            did_work = true;
        }

        for i in 0..self.nodes.len() {
            let node_idx = NodeIndex::new(i as u32);
            let runnable = matches!(self.nodes[i].kind, NodeKind::Input)
                && self.nodes[i].should_run();
            if runnable {
                self.dispatch(node_idx, Frame::new());
                did_work = true;
            }
        }

        did_work
    }

    fn dispatch(&mut self, node_idx: NodeIndex, frame: Frame) {
        let mut function = self.nodes[node_idx.as_usize()].function.take();
        let targets = std::mem::take(&mut self.next_targets[node_idx.as_usize()]);
        let mut error_counters = std::mem::take(&mut self.nodes[node_idx.as_usize()].error_counters);

        if let Some(f) = function.as_mut() {
            let mut dispatch = Dispatch {
                from: node_idx,
                targets: &targets,
                pending: &mut self.pending,
                ready: &mut self.ready,
                pool: &mut self.pool,
                error_counters: &mut error_counters,
            };
            f(&mut dispatch, frame.as_slice());
            // End-of-invocation flush: a burst that didn't fill a frame must
            // still be forwarded within this pass rather than stall.
            let pending_keys: Vec<NextIndex> = dispatch
                .pending
                .keys()
                .filter(|(n, _)| *n == node_idx)
                .map(|(_, next)| *next)
                .collect();
            for next in pending_keys {
                dispatch.flush_next(next);
            }
        }

        self.next_targets[node_idx.as_usize()] = targets;
        self.nodes[node_idx.as_usize()].error_counters = error_counters;
        self.nodes[node_idx.as_usize()].function = function;
        debug!(node = self.nodes[node_idx.as_usize()].name, "dispatched");
    }

    pub fn error_count(&self, node: NodeIndex, code: ForwardError) -> u64 {
        self.nodes[node.as_usize()].error_counters[code as usize]
    }

    pub fn node_name(&self, node: NodeIndex) -> &'static str {
        self.nodes[node.as_usize()].name
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic cycle counter, falling back to an `Instant`-derived value on
/// platforms with no cheap cycle-counter intrinsic.
pub fn cpu_time_now() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeState;
    use vswitch_types::SwIfIndex;

    fn passthrough_node(name: &'static str, next: &'static str) -> NodeDescriptor {
        NodeDescriptor {
            name,
            kind: NodeKind::Internal,
            state: NodeState::Polling,
            next_names: vec![next],
            error_strings: vec![],
            function: Box::new(move |d, frame| {
                let next_idx = NextIndex::new(0);
                for &bi in frame {
                    d.enqueue_x1(next_idx, BufferIndex::new(bi));
                }
                d.flush_next(next_idx);
            }),
        }
    }

    #[test]
    fn frame_flows_across_wired_edge() {
        let mut graph = Graph::new();
        let drop_hits = std::rc::Rc::new(std::cell::RefCell::new(0u32));
        let drop_hits2 = drop_hits.clone();
        let drop_idx = graph.register_node(NodeDescriptor {
            name: "test-drop",
            kind: NodeKind::Drop,
            state: NodeState::Polling,
            next_names: vec![],
            error_strings: vec![],
            function: Box::new(move |_d, frame| {
                *drop_hits2.borrow_mut() += frame.len() as u32;
            }),
        });
        let relay_idx = graph.register_node(passthrough_node("relay", "test-drop"));
        assert_eq!(graph.node_index("test-drop"), Some(drop_idx));

        let mut frame = Frame::new();
        frame.push(BufferIndex::new(7));
        graph.enqueue_input(relay_idx, frame);

        // First pass dispatches `relay`, queuing a frame for `test-drop`.
        assert!(graph.run_once());
        // Second pass (no input nodes registered, so this just dequeues the
        // frame already queued for `test-drop`).
        assert!(graph.run_once());
        assert_eq!(*drop_hits.borrow(), 1);
    }

    #[test]
    fn unbound_next_edge_drops_silently_without_panicking() {
        let mut graph = Graph::new();
        let node = graph.register_node(passthrough_node("dangling", "nowhere"));
        let mut frame = Frame::new();
        frame.push(BufferIndex::new(1));
        graph.enqueue_input(node, frame);
        assert!(graph.run_once());
    }

    #[test]
    fn sw_if_index_defaults_to_invalid_on_fresh_buffer() {
        let mut graph = Graph::new();
        let mut out = [BufferIndex::INVALID; 1];
        graph.pool.alloc_from_free_list(&mut out, 1);
        assert_eq!(graph.pool.get(out[0]).sw_if_index_rx, SwIfIndex::INVALID);
    }
}
