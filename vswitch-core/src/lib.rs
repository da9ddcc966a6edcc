//! Buffer/frame substrate and node graph scheduler.
//!
//! This crate supplies the vectorized core every protocol node in
//! `vswitch-forward` runs on top of: a buffer arena addressed by 32-bit
//! index, frames that batch those indices between nodes, and a
//! run-to-completion scheduler over polling/interrupt/process nodes.

pub mod buffer;
pub mod counter;
pub mod frame;
pub mod graph;
pub mod node;
pub mod process;

pub use buffer::{Buffer, BufferPool};
pub use counter::{CombinedCounters, SimpleCounters};
pub use frame::{Frame, FRAME_SIZE};
pub use graph::{cpu_time_now, Dispatch, Graph};
pub use node::{Node, NodeDescriptor, NodeFn, NodeKind, NodeState, FORWARD_ERROR_NAMES};
pub use process::{ProcessContext, ProcessFn, ProcessPoll, ProcessSlot, EVENT_TIMER_ONLY};
