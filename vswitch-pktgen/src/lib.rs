//! Packet generator: configured streams synthesized at a target rate into
//! the graph's buffer pool for test and benchmark traffic (spec SPEC_FULL
//! §4.7), concretized from `examples/original_source/vnet/pg/input.c`.

pub mod stream;

pub use stream::{Edit, SizePolicy, Stream};

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use tracing::debug;
use vswitch_core::frame::FRAME_SIZE;
use vswitch_core::graph::Dispatch;
use vswitch_types::StreamIndex;

/// Owns every configured stream (spec SPEC_FULL §4.7). Captured by
/// `Rc<RefCell<_>>` into the `pg-input` node closure the same way
/// `vswitch_forward::ip4::Ipv4Forwarder` is: run-to-completion scheduling
/// guarantees no second live borrow across node boundaries (spec SPEC_FULL
/// §5).
pub struct PacketGenerator {
    streams: Vec<Stream>,
}

impl PacketGenerator {
    pub fn new() -> Self {
        PacketGenerator { streams: Vec::new() }
    }

    pub fn add_stream(&mut self, stream: Stream) -> StreamIndex {
        let idx = StreamIndex::new(self.streams.len() as u32);
        self.streams.push(stream);
        idx
    }

    pub fn stream_mut(&mut self, idx: StreamIndex) -> Option<&mut Stream> {
        self.streams.get_mut(idx.as_usize())
    }

    pub fn enable(&mut self, idx: StreamIndex) {
        if let Some(s) = self.stream_mut(idx) {
            s.enable();
        }
    }

    pub fn disable(&mut self, idx: StreamIndex) {
        if let Some(s) = self.stream_mut(idx) {
            s.disable();
        }
    }

    pub fn total_generated(&self) -> u64 {
        self.streams.iter().map(|s| s.n_generated()).sum()
    }
}

impl Default for PacketGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// `pg-input` node body. Registered as an `Input`-kind node, it is invoked
/// with an empty frame on every scheduler pass where at least one stream is
/// enabled; each enabled stream tops up its own emission against the shared
/// rate clock and dispatches straight onto its bound next-edge, mirroring
/// the source's `pg_input` walking `pg->enabled_streams`.
pub fn pg_input(dispatch: &mut Dispatch, _frame: &[u32], state: &Rc<RefCell<PacketGenerator>>) {
    let now = Instant::now();
    let mut rng = rand::thread_rng();
    let mut gen = state.borrow_mut();
    let mut total = 0usize;
    for stream in gen.streams.iter_mut() {
        let n = stream.tick(dispatch, now, FRAME_SIZE, &mut rng);
        total += n;
    }
    if total > 0 {
        debug!(total, "pg-input generated buffers");
    }
}
