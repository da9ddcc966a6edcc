//! Ethernet ingress/egress: the `ethernet-input` node and rewrite-header
//! construction for the IPv4/IPv6 rewrite path (spec SPEC_FULL §4.4's
//! "ask the interface's hw-class for a serialized L2 header").
//!
//! Grounded on the teacher's `ethernet.rs` module boundary (a thin re-export
//! point in the source) plus `arp.rs`'s raw Ethernet-header byte layout,
//! generalized from "parse, then call a fixed handler" to "parse, then
//! dispatch via the node graph's named next-edges".

use vswitch_core::graph::Dispatch;
use vswitch_types::{EtherType, MacAddr};

pub const ETH_HEADER_LEN: u16 = 14;

/// Build a 14-byte Ethernet header into `out` (must be at least 14 bytes).
/// This is the "guess Ethernet" fast path the rewrite node's contract calls
/// for; VLAN sub-interfaces use [`build_vlan_header`] instead.
pub fn build_header(out: &mut [u8], dst: MacAddr, src: MacAddr, ethertype: EtherType) {
    out[0..6].copy_from_slice(&dst.0);
    out[6..12].copy_from_slice(&src.0);
    out[12..14].copy_from_slice(&ethertype.as_u16().to_be_bytes());
}

pub const VLAN_HEADER_LEN: u16 = 18;

/// A longer rewrite header for a VLAN sub-interface: Ethernet + 4-byte
/// 802.1Q tag, carrying the real ethertype after the tag.
pub fn build_vlan_header(out: &mut [u8], dst: MacAddr, src: MacAddr, vlan_tag: u16, ethertype: EtherType) {
    out[0..6].copy_from_slice(&dst.0);
    out[6..12].copy_from_slice(&src.0);
    out[12..14].copy_from_slice(&EtherType::Vlan.as_u16().to_be_bytes());
    out[14..16].copy_from_slice(&vlan_tag.to_be_bytes());
    out[16..18].copy_from_slice(&ethertype.as_u16().to_be_bytes());
}

/// `ethernet-input`: strips the 14-byte header, reads the ethertype, and
/// dispatches to `ip4-input`/`ip6-input`/`arp-input` by next-edge name.
/// Unknown ethertypes go to `error-drop` (the next-edge the graph wires
/// unconditionally — see `register_forwarding_nodes`).
pub fn ethernet_input(
    dispatch: &mut Dispatch,
    frame: &[u32],
    next_ip4: vswitch_types::NextIndex,
    next_ip6: vswitch_types::NextIndex,
    next_arp: vswitch_types::NextIndex,
    next_drop: vswitch_types::NextIndex,
) {
    for &raw in frame {
        let bi = vswitch_types::BufferIndex::new(raw);
        let ethertype = {
            let buf = dispatch.pool().get_mut(bi);
            if buf.current_length < ETH_HEADER_LEN {
                None
            } else {
                let header = buf.payload()[..14].to_vec();
                buf.pull_header(ETH_HEADER_LEN);
                EtherType::from_u16(u16::from_be_bytes([header[12], header[13]]))
            }
        };
        match ethertype {
            Some(EtherType::Ipv4) => dispatch.enqueue_x1(next_ip4, bi),
            Some(EtherType::Ipv6) => dispatch.enqueue_x1(next_ip6, bi),
            Some(EtherType::Arp) => dispatch.enqueue_x1(next_arp, bi),
            _ => dispatch.enqueue_x1(next_drop, bi),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vswitch_core::{BufferPool, Frame};
    use vswitch_types::{BufferIndex, NextIndex, NodeIndex};
    use vswitch_core::node::{NodeDescriptor, NodeKind, NodeState};
    use vswitch_core::graph::Graph;

    #[test]
    fn header_round_trips_fields() {
        let mut out = [0u8; 14];
        let dst = MacAddr::new([1, 2, 3, 4, 5, 6]);
        let src = MacAddr::new([7, 8, 9, 10, 11, 12]);
        build_header(&mut out, dst, src, EtherType::Ipv4);
        assert_eq!(&out[0..6], &dst.0);
        assert_eq!(&out[6..12], &src.0);
        assert_eq!(EtherType::from_u16(u16::from_be_bytes([out[12], out[13]])), Some(EtherType::Ipv4));
    }

    fn passthrough(name: &'static str) -> NodeDescriptor {
        NodeDescriptor {
            name,
            kind: NodeKind::Drop,
            state: NodeState::Polling,
            next_names: vec![],
            error_strings: vec![],
            function: Box::new(|_d, _f| {}),
        }
    }

    #[test]
    fn dispatches_ipv4_ethertype_to_ip4_next_edge() {
        let mut graph = Graph::new();
        graph.register_node(passthrough("ip4-input"));
        graph.register_node(passthrough("ip6-input"));
        graph.register_node(passthrough("arp-input"));
        graph.register_node(passthrough("error-drop"));

        let eth_in = graph.register_node(NodeDescriptor {
            name: "ethernet-input",
            kind: NodeKind::Internal,
            state: NodeState::Polling,
            next_names: vec!["ip4-input", "ip6-input", "arp-input", "error-drop"],
            error_strings: vec![],
            function: Box::new(|d, frame| {
                ethernet_input(
                    d,
                    frame,
                    NextIndex::new(0),
                    NextIndex::new(1),
                    NextIndex::new(2),
                    NextIndex::new(3),
                )
            }),
        });

        let mut out = [BufferIndex::INVALID; 1];
        graph.pool.alloc_from_free_list(&mut out, 1);
        {
            let buf = graph.pool.get_mut(out[0]);
            let mut hdr = [0u8; 14];
            build_header(&mut hdr, MacAddr::BROADCAST, MacAddr::ZERO, EtherType::Ipv4);
            buf.append(&hdr).unwrap();
        }
        let mut frame = Frame::new();
        frame.push(out[0]);
        graph.enqueue_input(eth_in, frame);
        assert!(graph.run_once());
        let _ = NodeIndex::new(0);
    }
}
