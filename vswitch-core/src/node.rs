//! Node registry types (spec SPEC_FULL §3.4, §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use vswitch_types::{ForwardError, NextIndex, NodeIndex};

/// A node's role in the graph (spec SPEC_FULL §2).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    Input,
    Internal,
    Output,
    Process,
    Drop,
    Punt,
}

/// Scheduling state of an input node. Interrupt-state nodes are only
/// dispatched when their single wakeup bit is set (simulating an ISR),
/// matching the source's `runtime_data[0]` mask.
pub enum NodeState {
    Disabled,
    Polling,
    Interrupt { pending: AtomicBool },
}

impl NodeState {
    pub fn interrupt() -> Self {
        NodeState::Interrupt {
            pending: AtomicBool::new(false),
        }
    }

    pub fn signal_interrupt(&self) {
        if let NodeState::Interrupt { pending } = self {
            pending.store(true, Ordering::Release);
        }
    }

    fn take_interrupt(&self) -> bool {
        match self {
            NodeState::Interrupt { pending } => pending.swap(false, Ordering::AcqRel),
            _ => false,
        }
    }
}

/// A node's batch handler. Receives the frame of buffer indices dispatched
/// to it and the dispatcher used to forward buffers onward.
pub type NodeFn = Box<dyn for<'g> FnMut(&mut crate::graph::Dispatch<'g>, &[u32])>;

/// A registered graph node (spec SPEC_FULL §3.4).
pub struct Node {
    pub name: &'static str,
    pub kind: NodeKind,
    pub state: NodeState,
    /// `FRAME_NO_FREE_AFTER_DISPATCH` — punt-style nodes that retain
    /// ownership of the frame instead of having it freed after dispatch.
    pub frame_no_free_after_dispatch: bool,
    next_names: Vec<&'static str>,
    next_by_name: HashMap<&'static str, NextIndex>,
    pub(crate) function: Option<NodeFn>,
    pub error_counters: Vec<u64>,
    pub error_strings: Vec<&'static str>,
    /// Cached most-recently-used next index, for branch prediction in the
    /// x1/x2 dispatch helpers.
    pub(crate) cached_next: Option<NextIndex>,
}

impl Node {
    pub fn new(name: &'static str, kind: NodeKind, state: NodeState) -> Self {
        Node {
            name,
            kind,
            state,
            frame_no_free_after_dispatch: false,
            next_names: Vec::new(),
            next_by_name: HashMap::new(),
            function: None,
            error_counters: Vec::new(),
            error_strings: Vec::new(),
            cached_next: None,
        }
    }

    pub fn with_function(mut self, f: NodeFn) -> Self {
        self.function = Some(f);
        self
    }

    pub fn with_error_strings(mut self, strings: &[&'static str]) -> Self {
        self.error_strings = strings.to_vec();
        self.error_counters = vec![0; strings.len()];
        self
    }

    /// Append a next-edge slot if it doesn't already exist, returning its
    /// index either way. Next-edges are append-only: registering the same
    /// name twice returns the same slot.
    pub fn add_next(&mut self, name: &'static str) -> NextIndex {
        if let Some(&idx) = self.next_by_name.get(name) {
            return idx;
        }
        let idx = NextIndex::new(self.next_names.len() as u32);
        self.next_names.push(name);
        self.next_by_name.insert(name, idx);
        idx
    }

    pub fn next_index_by_name(&self, name: &str) -> Option<NextIndex> {
        self.next_by_name.get(name).copied()
    }

    pub fn next_name(&self, idx: NextIndex) -> &'static str {
        self.next_names[idx.as_usize()]
    }

    pub fn n_next(&self) -> usize {
        self.next_names.len()
    }

    pub fn count_error(&mut self, code: ForwardError) {
        let code_idx = code as usize;
        if code_idx < self.error_counters.len() {
            self.error_counters[code_idx] += 1;
        }
    }

    /// `true` if this node should be visited on the current scheduler pass:
    /// always for `Polling`, only if the interrupt bit was set for
    /// `Interrupt`, never for `Disabled`.
    pub fn should_run(&self) -> bool {
        match &self.state {
            NodeState::Disabled => false,
            NodeState::Polling => true,
            NodeState::Interrupt { .. } => self.state.take_interrupt(),
        }
    }
}

/// Display strings for every `ForwardError` variant, in discriminant order.
/// `Dispatch::count_error`/`Graph::error_count` index a node's error counters
/// directly by `code as usize` against one shared code namespace rather than
/// a per-node-local enum, so any node that counts errors must register with
/// `with_error_strings(&FORWARD_ERROR_NAMES)` to size its counters to cover
/// every code it might see.
pub const FORWARD_ERROR_NAMES: [&str; 16] = [
    "no error",
    "ttl expired",
    "mtu exceeded",
    "tcp checksum mismatch",
    "udp checksum mismatch",
    "udp length mismatch",
    "unknown l4 protocol",
    "source lookup miss",
    "destination lookup miss",
    "adjacency drop",
    "adjacency punt",
    "arp request rate-limited",
    "arp request sent",
    "rx data error",
    "ipv4 checksum error",
    "tx full drops",
];

pub struct NodeDescriptor {
    pub name: &'static str,
    pub kind: NodeKind,
    pub state: NodeState,
    pub next_names: Vec<&'static str>,
    pub error_strings: Vec<&'static str>,
    pub function: NodeFn,
}
