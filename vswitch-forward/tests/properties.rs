//! Property test for the TTL/checksum rewrite invariant (spec SPEC_FULL
//! §8, invariant 1): for every packet with TTL >= 2 under the adjacency's
//! MTU, `ip4-rewrite` must decrement TTL by exactly one, leave a checksum
//! equal to a full recompute over the decremented header, and stamp
//! `sw_if_index[TX]` with the selected adjacency's outgoing interface.
//!
//! `buffer.rs`'s own `incremental_ttl_checksum_matches_full_recompute` unit
//! test already pins the checksum formula for one fixed header; this drives
//! the same invariant through the real `ip4_rewrite` node body across many
//! random TTLs and addresses.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;

use vswitch_core::buffer::compute_ipv4_checksum;
use vswitch_core::graph::Graph;
use vswitch_core::node::{NodeDescriptor, NodeKind, NodeState};
use vswitch_fib::{Adjacency, LookupNext, RewriteHeader};
use vswitch_forward::ip4::{ip4_rewrite, Ipv4Forwarder};
use vswitch_types::{AdjIndex, BufferIndex, Ipv4Addr, NextIndex, SwIfIndex};

fn build_ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, ttl: u8) -> Vec<u8> {
    let mut pkt = vec![0u8; 20 + 8];
    pkt[0] = 0x45;
    let total_len = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&total_len.to_be_bytes());
    pkt[8] = ttl;
    pkt[9] = 17; // UDP
    pkt[12..16].copy_from_slice(&src.0);
    pkt[16..20].copy_from_slice(&dst.0);
    let csum = compute_ipv4_checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&csum.to_be_bytes());
    pkt
}

proptest! {
    #[test]
    fn ttl_decrement_and_checksum_survive_rewrite(
        src_octets in any::<[u8; 4]>(),
        dst_octets in any::<[u8; 4]>(),
        ttl in 2u8..=255u8,
    ) {
        let mut graph = Graph::new();
        let state = Rc::new(RefCell::new(Ipv4Forwarder::new(AdjIndex::new(0))));

        let captured: Rc<RefCell<Option<(Vec<u8>, SwIfIndex)>>> = Rc::new(RefCell::new(None));
        let captured_for_node = captured.clone();
        graph.register_node(NodeDescriptor {
            name: "eth-output",
            kind: NodeKind::Output,
            state: NodeState::Polling,
            next_names: vec![],
            error_strings: vec![],
            function: Box::new(move |d, frame| {
                for &raw in frame {
                    let bi = BufferIndex::new(raw);
                    let buf = d.pool().get(bi);
                    *captured_for_node.borrow_mut() = Some((buf.payload().to_vec(), buf.sw_if_index_tx));
                }
            }),
        });
        graph.register_node(NodeDescriptor {
            name: "ip4-drop",
            kind: NodeKind::Drop,
            state: NodeState::Polling,
            next_names: vec![],
            error_strings: vec![],
            function: Box::new(|_d, _f| {}),
        });

        let rewrite_state = state.clone();
        let rewrite_node = graph.register_node(NodeDescriptor {
            name: "ip4-rewrite",
            kind: NodeKind::Internal,
            state: NodeState::Polling,
            next_names: vec!["ip4-drop", "eth-output"],
            error_strings: vec![],
            function: Box::new(move |d, frame| {
                ip4_rewrite(d, frame, &rewrite_state, NextIndex::new(0));
            }),
        });

        let sw_if_index = SwIfIndex::new(7);
        let mut rewrite_header = RewriteHeader::empty();
        rewrite_header.sw_if_index = sw_if_index;
        rewrite_header.next_index = NextIndex::new(1);
        rewrite_header.max_l3_packet_bytes = u16::MAX;
        let mut adj = Adjacency::template(LookupNext::Rewrite);
        adj.rewrite = rewrite_header;
        let adj_index = state.borrow_mut().adjacencies.add_adjacency(adj, 1);

        let src = Ipv4Addr::new(src_octets[0], src_octets[1], src_octets[2], src_octets[3]);
        let dst = Ipv4Addr::new(dst_octets[0], dst_octets[1], dst_octets[2], dst_octets[3]);
        let pkt = build_ipv4_packet(src, dst, ttl);

        let mut out = [BufferIndex::INVALID; 1];
        graph.pool.alloc_from_free_list(&mut out, 1);
        graph.pool.get_mut(out[0]).append(&pkt).unwrap();
        graph.pool.get_mut(out[0]).opaque[0] = adj_index.0;
        graph.pool.get_mut(out[0]).opaque[1] = 0;

        let mut frame = vswitch_core::Frame::new();
        frame.push(out[0]);
        graph.enqueue_input(rewrite_node, frame);
        while graph.run_once() {}

        let (out_payload, out_sw_if) = captured.borrow_mut().take().expect("packet must reach eth-output");
        prop_assert_eq!(out_payload[8], ttl - 1);
        prop_assert_eq!(out_sw_if, sw_if_index);

        let mut recomputed_header = out_payload[..20].to_vec();
        recomputed_header[10] = 0;
        recomputed_header[11] = 0;
        let full = compute_ipv4_checksum(&recomputed_header);
        let on_wire = u16::from_be_bytes([out_payload[10], out_payload[11]]);
        prop_assert_eq!(on_wire, full);
    }
}
