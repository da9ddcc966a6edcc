//! IPv4 forwarding nodes: `ip4-input`, `ip4-lookup`, `ip4-rewrite`,
//! `ip4-local` (spec SPEC_FULL §4.5, §8 S1-S6), plus `set_interface_address`
//! (§3.9, §6). Grounded on `drivers/src/net/ipv4.rs`'s validation sequence
//! (version/IHL/length/checksum/TTL) generalized from "validate then hand to
//! the socket layer" to "validate then run the lookup → rewrite/local/arp/
//! drop/punt state machine" the graph scheduler drives.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};
use vswitch_core::buffer::{
    compute_ipv4_checksum, compute_tcp_checksum, compute_udp_checksum, incremental_ttl_checksum,
};
use vswitch_core::graph::Dispatch;
use vswitch_fib::{Adjacency, AdjacencyHeap, Ipv4Fib, LookupNext, MultipathTable};
use vswitch_types::{
    AdjIndex, BufferFlags, BufferIndex, ForwardError, IpProtocol, Ipv4Addr, MacAddr, NextIndex,
    RouteFlags, SwIfIndex,
};

use crate::arp::{jenkins3_finalize, resolve_or_request, ArpOutcome, ArpRateLimiter};
use crate::iface::InterfaceTable;
use crate::listener::ListenerTable;

pub const IPV4_MIN_HEADER_LEN: u16 = 20;

/// Read-only view of the fields `ip4-lookup`/`ip4-rewrite`/`ip4-local` need,
/// borrowed out of the buffer's header bytes without copying the payload.
struct Ipv4HeaderView {
    ihl_bytes: u16,
    total_len: u16,
    ttl: u8,
    protocol: u8,
    checksum: u16,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

fn parse_header(data: &[u8]) -> Option<Ipv4HeaderView> {
    if data.len() < IPV4_MIN_HEADER_LEN as usize {
        return None;
    }
    let version = data[0] >> 4;
    if version != 4 {
        return None;
    }
    let ihl_bytes = ((data[0] & 0x0F) as u16) * 4;
    if ihl_bytes < IPV4_MIN_HEADER_LEN || (ihl_bytes as usize) > data.len() {
        return None;
    }
    Some(Ipv4HeaderView {
        ihl_bytes,
        total_len: u16::from_be_bytes([data[2], data[3]]),
        ttl: data[8],
        protocol: data[9],
        checksum: u16::from_be_bytes([data[10], data[11]]),
        src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
    })
}

/// Shared forwarding state, captured by `Rc<RefCell<_>>` across every node
/// closure registered into one `Graph` — safe because spec SPEC_FULL §5
/// guarantees run-to-completion, single-threaded dispatch within one graph
/// instance, so there is never a second live borrow across node boundaries.
pub struct Ipv4Forwarder {
    pub fib: Ipv4Fib,
    pub adjacencies: AdjacencyHeap,
    pub multipath: MultipathTable,
    pub ifaces: InterfaceTable,
    pub listeners: ListenerTable,
    pub arp_limiter: ArpRateLimiter,
    /// Interfaces with RX reverse-path checking enabled (spec SPEC_FULL's
    /// `source-check-via-rx` feature, S6).
    pub rpf_enabled: std::collections::HashSet<SwIfIndex>,
    /// Per-prefix next-hop set, tracked so `add_del_route_next_hop` can
    /// re-canonicalize after each add/del instead of needing an exact-match
    /// read-back from the FIB (which only exposes longest-prefix `lookup`).
    next_hop_sets: std::collections::HashMap<(Ipv4Addr, u8), Vec<(AdjIndex, u32)>>,
    /// The multipath block each prefix currently points at, so a later
    /// `add_del_route_next_hop` call can release the old block once the
    /// normalized vector changes.
    route_blocks: std::collections::HashMap<(Ipv4Addr, u8), AdjIndex>,
}

impl Ipv4Forwarder {
    pub fn new(miss_adj: AdjIndex) -> Self {
        Ipv4Forwarder {
            fib: Ipv4Fib::new(miss_adj),
            adjacencies: AdjacencyHeap::new(),
            multipath: MultipathTable::new(),
            ifaces: InterfaceTable::new(),
            listeners: ListenerTable::new(),
            arp_limiter: ArpRateLimiter::new(),
            rpf_enabled: std::collections::HashSet::new(),
            next_hop_sets: std::collections::HashMap::new(),
            route_blocks: std::collections::HashMap::new(),
        }
    }

    pub fn enable_rpf(&mut self, sw_if_index: SwIfIndex) {
        self.rpf_enabled.insert(sw_if_index);
    }

    /// `add_del_route` (spec SPEC_FULL §4.3). Applies `KEEP_OLD_ADJACENCY`
    /// and frees the superseded adjacency otherwise, matching the FIB's "del
    /// at the tail of add_del_route" invariant.
    pub fn add_del_route(&mut self, flags: RouteFlags, dst: Ipv4Addr, len: u8, adj: AdjIndex) {
        let old = self.fib.add_del_route(flags, dst, len, adj);
        if let Some(old_adj) = old {
            if old_adj != adj && !flags.contains(RouteFlags::KEEP_OLD_ADJACENCY) {
                self.adjacencies.decref_and_maybe_free(old_adj);
            }
        }
        if !flags.contains(RouteFlags::DEL) {
            self.adjacencies.incref(adj);
        }
    }

    /// §3.9: installs the interface's own `/32` as a local route, the
    /// covering prefix as a connected (ARP-next, initially unresolved)
    /// route, and registers the address in the local-address bitmap.
    pub fn set_interface_address(&mut self, sw_if_index: SwIfIndex, addr: Ipv4Addr, prefix_len: u8) {
        let local_adj = self
            .adjacencies
            .add_adjacency(Adjacency::template(LookupNext::Local), 1);
        self.add_del_route(RouteFlags::ADD, addr, 32, local_adj);

        let hw_if_index = self
            .ifaces
            .sw(sw_if_index)
            .map(|sw| sw.hw_if_index)
            .unwrap_or_default();
        let mut connected = Adjacency::template(LookupNext::Arp);
        connected.hw_if_index = hw_if_index;
        let connected_adj = self.adjacencies.add_adjacency(connected, 1);
        self.add_del_route(RouteFlags::ADD, addr.masked(prefix_len), prefix_len, connected_adj);

        self.ifaces.add_local_address(sw_if_index, addr);
        debug!(?addr, prefix_len, sw_if_index = sw_if_index.0, "interface address installed");
    }

    /// `add_del_route_next_hop` (spec SPEC_FULL §4.3/§4.4): the multipath
    /// entry point. Folds `next_hop_adj`/`weight` into the prefix's tracked
    /// next-hop set, canonicalizes it, and re-routes the prefix to whichever
    /// multipath block matches the new vector — releasing the old block's
    /// reference only after the new one is installed, never before, so a
    /// concurrent reader never observes the prefix pointing at nothing.
    pub fn add_del_route_next_hop(
        &mut self,
        flags: RouteFlags,
        dst: Ipv4Addr,
        len: u8,
        next_hop_adj: AdjIndex,
        weight: u32,
    ) {
        let key = (dst.masked(len), len);
        let mut set = self.next_hop_sets.get(&key).cloned().unwrap_or_default();
        if flags.contains(RouteFlags::DEL) {
            set.retain(|(adj, _)| *adj != next_hop_adj);
        } else if let Some(entry) = set.iter_mut().find(|(adj, _)| *adj == next_hop_adj) {
            entry.1 = weight;
        } else {
            set.push((next_hop_adj, weight));
        }

        let old_block = self.route_blocks.remove(&key);

        if set.is_empty() {
            if let Some(old) = old_block {
                self.add_del_route(RouteFlags::DEL, key.0, len, old);
                self.multipath.release(&mut self.adjacencies, old);
            }
            self.next_hop_sets.remove(&key);
            return;
        }

        let normalized = vswitch_fib::canonicalize(set.clone());
        let new_block = self.multipath.get_or_build(&mut self.adjacencies, normalized);

        if old_block != Some(new_block) {
            self.add_del_route(RouteFlags::ADD, key.0, len, new_block);
            if let Some(old) = old_block {
                self.multipath.release(&mut self.adjacencies, old);
            }
        }

        self.route_blocks.insert(key, new_block);
        self.next_hop_sets.insert(key, set);
    }

    /// Flow hash over the 5-tuple (spec SPEC_FULL §4.4/§9). Any hash with
    /// good avalanche on the 5-tuple satisfies the "same flow, same member"
    /// contract; this reuses the rate-limiter's Jenkins mixer rather than
    /// introduce a second hash implementation.
    fn flow_hash(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, sport: u16, dport: u16) -> u32 {
        let a = src.to_u32_be() ^ ((protocol as u32) << 24);
        let b = dst.to_u32_be();
        let c = ((sport as u32) << 16) | dport as u32;
        jenkins3_finalize(a, b, c)
    }

    /// `maybe_remap_adjacencies`, wired through from the multipath table's
    /// lazy remap scheme into the FIB's rewrite-every-matching-entry pass
    /// (spec SPEC_FULL §4.3/§4.4). A no-op unless a multipath release left
    /// pending remaps behind.
    pub fn drain_pending_remaps(&mut self) {
        if !self.multipath.has_pending_remaps() {
            return;
        }
        let remap = self.multipath.drain_remaps();
        self.fib.maybe_remap_adjacencies(&remap);
    }
}

/// `ip4-input`: validates the header (version/IHL/total-length/TTL>0) and
/// runs the optional uRPF feature before handing off to the lookup state
/// machine. Failing validation silently drops the buffer back to the pool —
/// the source's `ip4-input` node does the same (no counted error for a
/// malformed packet that never reached a real protocol state).
pub fn ip4_input(
    dispatch: &mut Dispatch,
    frame: &[u32],
    state: &Rc<RefCell<Ipv4Forwarder>>,
    next_lookup: NextIndex,
    next_drop: NextIndex,
) {
    for &raw in frame {
        let bi = BufferIndex::new(raw);
        let rx_if = dispatch.pool().get(bi).sw_if_index_rx;
        let valid = {
            let buf = dispatch.pool().get(bi);
            parse_header(buf.payload()).map(|h| h.ttl > 0 && h.total_len as usize <= buf.payload().len())
        };
        if valid != Some(true) {
            dispatch.pool().free_no_next(bi);
            continue;
        }

        let rpf_needed = state.borrow().rpf_enabled.contains(&rx_if);
        if rpf_needed {
            let src = {
                let buf = dispatch.pool().get(bi);
                parse_header(buf.payload()).map(|h| h.src)
            };
            let rpf_ok = match src {
                Some(src) => {
                    let s = state.borrow();
                    let rpf_adj = s.fib.lookup(src);
                    let expected_hw = s.ifaces.sw(rx_if).map(|sw| sw.hw_if_index).unwrap_or_default();
                    s.adjacencies
                        .get(rpf_adj)
                        .map(|adj| adj.hw_if_index == expected_hw)
                        .unwrap_or(false)
                }
                None => false,
            };
            if !rpf_ok {
                dispatch.count_error(ForwardError::SrcLookupMiss);
                dispatch.enqueue_x1(next_drop, bi);
                continue;
            }
        }
        dispatch.enqueue_x1(next_lookup, bi);
    }
}

/// `ip4-lookup`: masks/scans the FIB, classifies the resulting adjacency's
/// `lookup_next_index`, and dispatches accordingly (spec SPEC_FULL §4.5's
/// state table). The resolved adjacency index is stashed in `opaque[0]` so
/// `ip4-rewrite` doesn't need to re-look-up; `opaque[1]` carries the flow
/// hash for multipath member selection.
pub fn ip4_lookup(
    dispatch: &mut Dispatch,
    frame: &[u32],
    state: &Rc<RefCell<Ipv4Forwarder>>,
    next_local: NextIndex,
    next_arp: NextIndex,
    next_rewrite: NextIndex,
    next_drop: NextIndex,
    next_punt: NextIndex,
    next_miss: NextIndex,
) {
    let s = state.borrow();
    for &raw in frame {
        let bi = BufferIndex::new(raw);
        let header = {
            let buf = dispatch.pool().get(bi);
            parse_header(buf.payload())
        };
        let Some(header) = header else {
            dispatch.enqueue_x1(next_drop, bi);
            continue;
        };

        let adj_index = s.fib.lookup(header.dst);
        dispatch.pool().get_mut(bi).opaque[0] = adj_index.0;

        let lookup_next = s.adjacencies.get(adj_index).map(|a| a.lookup_next);
        match lookup_next {
            None | Some(LookupNext::Miss) => {
                dispatch.count_error(ForwardError::DstLookupMiss);
                dispatch.enqueue_x1(next_miss, bi);
            }
            Some(LookupNext::Drop) => {
                dispatch.count_error(ForwardError::AdjacencyDrop);
                dispatch.enqueue_x1(next_drop, bi);
            }
            Some(LookupNext::Punt) => {
                dispatch.count_error(ForwardError::AdjacencyPunt);
                dispatch.enqueue_x1(next_punt, bi);
            }
            Some(LookupNext::Local) => dispatch.enqueue_x1(next_local, bi),
            Some(LookupNext::Arp) => dispatch.enqueue_x1(next_arp, bi),
            Some(LookupNext::Rewrite) => {
                let (sport, dport) = {
                    let buf = dispatch.pool().get(bi);
                    let l4 = &buf.payload()[header.ihl_bytes as usize..];
                    if l4.len() >= 4 {
                        (
                            u16::from_be_bytes([l4[0], l4[1]]),
                            u16::from_be_bytes([l4[2], l4[3]]),
                        )
                    } else {
                        (0, 0)
                    }
                };
                let flow_hash =
                    Ipv4Forwarder::flow_hash(header.src, header.dst, header.protocol, sport, dport);
                dispatch.pool().get_mut(bi).opaque[1] = flow_hash;
                dispatch.enqueue_x1(next_rewrite, bi);
            }
        }
    }
}

/// `ip4-arp`: rate-limited neighbor-resolution request emission for
/// connected-subnet (glean) adjacencies (spec SPEC_FULL §4.5, §9). The
/// triggering packet is always dropped afterward — there is no
/// pending-resolution retry queue (§1's non-goal) — and, unless the rate
/// limiter suppresses it, a freshly allocated ARP request is dispatched on
/// `next_request`. `our_mac`/`our_ip` are fixed per node instance, mirroring
/// the source's per-interface request template built at configure time
/// (`ip4_arp_request_packet_template`).
pub fn ip4_arp(
    dispatch: &mut Dispatch,
    frame: &[u32],
    state: &Rc<RefCell<Ipv4Forwarder>>,
    now: f64,
    our_mac: MacAddr,
    our_ip: Ipv4Addr,
    next_request: NextIndex,
    next_drop: NextIndex,
) {
    for &raw in frame {
        let bi = BufferIndex::new(raw);
        let rx_if = dispatch.pool().get(bi).sw_if_index_rx;
        let dst = {
            let buf = dispatch.pool().get(bi);
            parse_header(buf.payload()).map(|h| h.dst)
        };
        let Some(dst) = dst else {
            dispatch.pool().free_no_next(bi);
            continue;
        };

        let outcome = {
            let mut s = state.borrow_mut();
            resolve_or_request(&mut s.arp_limiter, now, dst, rx_if, our_mac, our_ip)
        };
        dispatch.count_error(crate::arp::error_code(&outcome));
        dispatch.enqueue_x1(next_drop, bi);

        if let ArpOutcome::RequestSent { request } = outcome {
            let mut out = [BufferIndex::INVALID; 1];
            let allocated = dispatch.pool().alloc_from_free_list(&mut out, 1);
            if allocated == 1 {
                let buf = dispatch.pool().get_mut(out[0]);
                buf.sw_if_index_tx = rx_if;
                buf.flags.insert(BufferFlags::LOCALLY_GENERATED);
                if buf.append(&request).is_some() {
                    dispatch.enqueue_x1(next_request, out[0]);
                } else {
                    dispatch.pool().free_no_next(out[0]);
                }
            }
        }
    }
}

/// `ip4-rewrite`: TTL/checksum update, header prepend, and TX dispatch
/// (spec SPEC_FULL §4.5 rewrite contract, invariant 1, scenarios S1-S3).
pub fn ip4_rewrite(
    dispatch: &mut Dispatch,
    frame: &[u32],
    state: &Rc<RefCell<Ipv4Forwarder>>,
    next_drop: NextIndex,
) {
    let s = state.borrow();
    for &raw in frame {
        let bi = BufferIndex::new(raw);
        let opaque = dispatch.pool().get(bi).opaque;
        let adj_index = AdjIndex::new(opaque[0]);
        let member_offset = opaque[1];
        let Some(adj) = s.adjacencies.member(adj_index, member_offset).copied() else {
            dispatch.enqueue_x1(next_drop, bi);
            continue;
        };

        let locally_generated = dispatch.pool().get(bi).flags.contains(BufferFlags::LOCALLY_GENERATED);
        let header = {
            let buf = dispatch.pool().get(bi);
            parse_header(buf.payload())
        };
        let Some(header) = header else {
            dispatch.enqueue_x1(next_drop, bi);
            continue;
        };

        if !locally_generated {
            if header.ttl <= 1 {
                dispatch.set_buffer_error(bi, vswitch_types::NodeIndex::INVALID, ForwardError::TimeExpired);
                dispatch.count_error(ForwardError::TimeExpired);
                dispatch.enqueue_x1(next_drop, bi);
                continue;
            }
            let new_checksum = incremental_ttl_checksum(header.checksum);
            let buf = dispatch.pool().get_mut(bi);
            let payload = buf.payload_mut();
            payload[8] -= 1;
            payload[10..12].copy_from_slice(&new_checksum.to_be_bytes());
        }

        if dispatch.pool().length_in_chain(bi) > adj.rewrite.max_l3_packet_bytes as u32 {
            dispatch.count_error(ForwardError::MtuExceeded);
            dispatch.enqueue_x1(next_drop, bi);
            continue;
        }

        let rewrite_bytes = adj.rewrite.bytes().to_vec();
        let buf = dispatch.pool().get_mut(bi);
        if let Some(dst) = buf.push_header(rewrite_bytes.len() as u16) {
            dst.copy_from_slice(&rewrite_bytes);
        }
        buf.sw_if_index_tx = adj.rewrite.sw_if_index;
        dispatch.enqueue_x1(adj.rewrite.next_index, bi);
    }
}

/// Verify the L4 checksum of a TCP/UDP segment against its pseudo-header
/// (spec SPEC_FULL §4.5 local-node contract). `None` means "verified or not
/// applicable"; `Some(err)` names the error to count and drop on. UDP's
/// zero-checksum-means-not-computed rule (RFC 768) is honored; TCP has no
/// such escape hatch. Protocols other than TCP/UDP have no checksum of this
/// shape and are passed through untouched.
fn verify_l4_checksum(proto: Option<IpProtocol>, src: Ipv4Addr, dst: Ipv4Addr, l4: &[u8]) -> Option<ForwardError> {
    match proto {
        Some(IpProtocol::Udp) => {
            if l4.len() < 8 {
                return Some(ForwardError::UdpLength);
            }
            let declared_len = u16::from_be_bytes([l4[4], l4[5]]) as usize;
            if declared_len != l4.len() {
                return Some(ForwardError::UdpLength);
            }
            let on_wire = u16::from_be_bytes([l4[6], l4[7]]);
            if on_wire == 0 {
                return None;
            }
            if compute_udp_checksum(src, dst, l4) != on_wire {
                return Some(ForwardError::UdpChecksum);
            }
            None
        }
        Some(IpProtocol::Tcp) => {
            if l4.len() < 20 {
                return Some(ForwardError::TcpChecksum);
            }
            let on_wire = u16::from_be_bytes([l4[16], l4[17]]);
            if compute_tcp_checksum(src, dst, l4) != on_wire {
                return Some(ForwardError::TcpChecksum);
            }
            None
        }
        _ => None,
    }
}

/// `ip4-local`: L4 checksum verification and dispatch by destination port
/// to a registered listener (spec SPEC_FULL §4.5, §8 S6). `UNKNOWN_PROTOCOL`
/// is reserved for protocols with no registered listener.
pub fn ip4_local(
    dispatch: &mut Dispatch,
    frame: &[u32],
    state: &Rc<RefCell<Ipv4Forwarder>>,
    next_drop: NextIndex,
) {
    for &raw in frame {
        let bi = BufferIndex::new(raw);
        let header = {
            let buf = dispatch.pool().get(bi);
            parse_header(buf.payload())
        };
        let Some(header) = header else {
            dispatch.enqueue_x1(next_drop, bi);
            continue;
        };

        let checksum_err = {
            let buf = dispatch.pool().get(bi);
            let l4 = &buf.payload()[header.ihl_bytes as usize..];
            let proto = IpProtocol::from_u8(header.protocol);
            verify_l4_checksum(proto, header.src, header.dst, l4)
        };
        if let Some(err) = checksum_err {
            dispatch.pool().get_mut(bi).flags.insert(BufferFlags::L4_CHECKSUM_COMPUTED);
            dispatch.count_error(err);
            dispatch.enqueue_x1(next_drop, bi);
            continue;
        }
        dispatch
            .pool()
            .get_mut(bi)
            .flags
            .insert(BufferFlags::L4_CHECKSUM_COMPUTED | BufferFlags::L4_CHECKSUM_CORRECT);

        let dst_port = {
            let buf = dispatch.pool().get(bi);
            let l4 = &buf.payload()[header.ihl_bytes as usize..];
            if l4.len() < 4 {
                None
            } else {
                Some(u16::from_be_bytes([l4[2], l4[3]]))
            }
        };
        let Some(dst_port) = dst_port else {
            dispatch.enqueue_x1(next_drop, bi);
            continue;
        };

        let mut s = state.borrow_mut();
        match s.listeners.lookup(dst_port, header.dst) {
            Some(listener_idx) => {
                trace!(dst_port, "delivering to local listener");
                let payload = {
                    let buf = dispatch.pool().get(bi);
                    let l4 = &buf.payload()[header.ihl_bytes as usize..];
                    l4[8.min(l4.len())..].to_vec()
                };
                s.listeners.get_mut(listener_idx).deliver(header.src, header.dst, &payload);
                drop(s);
                dispatch.pool().free_no_next(bi);
            }
            None => {
                drop(s);
                dispatch.count_error(ForwardError::UnknownProtocol);
                dispatch.enqueue_x1(next_drop, bi);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vswitch_core::graph::Graph;
    use vswitch_core::node::{NodeDescriptor, NodeKind, NodeState, FORWARD_ERROR_NAMES};
    use vswitch_core::Frame;
    use vswitch_fib::RewriteHeader;
    use vswitch_types::{MacAddr, NodeIndex};

    fn build_ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, ttl: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 20 + payload.len()];
        pkt[0] = 0x45;
        let total_len = pkt.len() as u16;
        pkt[2..4].copy_from_slice(&total_len.to_be_bytes());
        pkt[8] = ttl;
        pkt[9] = 17; // UDP
        pkt[12..16].copy_from_slice(&src.0);
        pkt[16..20].copy_from_slice(&dst.0);
        let csum = compute_ipv4_checksum(&pkt[..20]);
        pkt[10..12].copy_from_slice(&csum.to_be_bytes());
        pkt[20..].copy_from_slice(payload);
        pkt
    }

    fn passthrough_drop(name: &'static str) -> NodeDescriptor {
        NodeDescriptor {
            name,
            kind: NodeKind::Drop,
            state: NodeState::Polling,
            next_names: vec![],
            error_strings: vec![],
            function: Box::new(|_d, _f| {}),
        }
    }

    struct Harness {
        graph: Graph,
        lookup: NodeIndex,
        rewrite: NodeIndex,
        state: Rc<RefCell<Ipv4Forwarder>>,
    }

    fn build_harness() -> Harness {
        let mut graph = Graph::new();
        let miss_adj = AdjIndex::new(0);
        let state = Rc::new(RefCell::new(Ipv4Forwarder::new(miss_adj)));
        {
            let mut s = state.borrow_mut();
            s.adjacencies.add_adjacency(Adjacency::template(LookupNext::Miss), 1);
        }

        graph.register_node(passthrough_drop("ip4-drop"));
        graph.register_node(passthrough_drop("ip4-punt"));
        graph.register_node(passthrough_drop("ip4-miss"));
        graph.register_node(passthrough_drop("ip4-local"));
        graph.register_node(passthrough_drop("ip4-arp"));
        graph.register_node(passthrough_drop("eth1-output"));

        let rewrite_state = state.clone();
        let rewrite = graph.register_node(NodeDescriptor {
            name: "ip4-rewrite",
            kind: NodeKind::Internal,
            state: NodeState::Polling,
            next_names: vec!["ip4-drop", "eth1-output"],
            error_strings: FORWARD_ERROR_NAMES.to_vec(),
            function: Box::new(move |d, frame| {
                ip4_rewrite(d, frame, &rewrite_state, NextIndex::new(0));
            }),
        });

        let lookup_state = state.clone();
        let lookup = graph.register_node(NodeDescriptor {
            name: "ip4-lookup",
            kind: NodeKind::Internal,
            state: NodeState::Polling,
            next_names: vec!["ip4-local", "ip4-arp", "ip4-rewrite", "ip4-drop", "ip4-punt", "ip4-miss"],
            error_strings: FORWARD_ERROR_NAMES.to_vec(),
            function: Box::new(move |d, frame| {
                ip4_lookup(
                    d,
                    frame,
                    &lookup_state,
                    NextIndex::new(0),
                    NextIndex::new(1),
                    NextIndex::new(2),
                    NextIndex::new(3),
                    NextIndex::new(4),
                    NextIndex::new(5),
                );
            }),
        });

        Harness { graph, lookup, rewrite, state }
    }

    fn inject(harness: &mut Harness, node: NodeIndex, packet: &[u8]) {
        let mut out = [BufferIndex::INVALID; 1];
        harness.graph.pool.alloc_from_free_list(&mut out, 1);
        harness.graph.pool.get_mut(out[0]).append(packet).unwrap();
        let mut frame = Frame::new();
        frame.push(out[0]);
        harness.graph.enqueue_input(node, frame);
    }

    fn install_rewrite_route(harness: &mut Harness, dst_net: Ipv4Addr, len: u8) {
        harness.graph.add_next(harness.rewrite, "eth1-output");
        let next_hop_mac = MacAddr::new([0xaa, 0xbb, 0xcc, 0, 0, 1]);
        let our_mac = MacAddr::new([0, 1, 2, 3, 4, 5]);
        let mut rewrite_header = RewriteHeader::empty();
        rewrite_header.sw_if_index = SwIfIndex::new(1);
        rewrite_header.next_index = NextIndex::new(1); // eth1-output, slot 1 on ip4-rewrite
        rewrite_header.max_l3_packet_bytes = 1500;
        let mut hdr_bytes = [0u8; 14];
        crate::ethernet::build_header(&mut hdr_bytes, next_hop_mac, our_mac, vswitch_types::EtherType::Ipv4);
        rewrite_header.set_bytes(&hdr_bytes);

        let mut adj = Adjacency::template(LookupNext::Rewrite);
        adj.rewrite = rewrite_header;
        let adj_idx = {
            let mut s = harness.state.borrow_mut();
            s.adjacencies.add_adjacency(adj, 1)
        };
        harness.state.borrow_mut().add_del_route(RouteFlags::ADD, dst_net, len, adj_idx);
    }

    #[test]
    fn s1_simple_forward_decrements_ttl_and_reaches_rewrite_next_edge() {
        let mut harness = build_harness();
        install_rewrite_route(&mut harness, Ipv4Addr::new(10, 0, 0, 0), 8);

        let packet = build_ipv4_packet(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(10, 1, 2, 3), 64, b"AAAAAAAAAAAAAAAA");
        let lookup = harness.lookup;
        inject(&mut harness, lookup, &packet);

        assert!(harness.graph.run_once()); // ip4-lookup dispatches into ip4-rewrite
        assert!(harness.graph.run_once()); // ip4-rewrite dispatches into eth1-output

        assert_eq!(harness.graph.error_count(lookup, ForwardError::DstLookupMiss), 0);
        assert_eq!(harness.graph.error_count(harness.rewrite, ForwardError::TimeExpired), 0);
    }

    #[test]
    fn s2_ttl_one_drops_with_time_expired() {
        let mut harness = build_harness();
        install_rewrite_route(&mut harness, Ipv4Addr::new(10, 0, 0, 0), 8);

        let packet = build_ipv4_packet(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(10, 1, 2, 3), 1, b"X");
        let lookup = harness.lookup;
        inject(&mut harness, lookup, &packet);
        assert!(harness.graph.run_once());
        assert!(harness.graph.run_once());

        assert_eq!(harness.graph.error_count(harness.rewrite, ForwardError::TimeExpired), 1);
    }

    #[test]
    fn s3_mtu_exceeded_drops_oversized_packet() {
        let mut harness = build_harness();
        install_rewrite_route(&mut harness, Ipv4Addr::new(10, 0, 0, 0), 8);
        {
            let mut s = harness.state.borrow_mut();
            let adj_idx = s.fib.lookup(Ipv4Addr::new(10, 1, 2, 3));
            s.adjacencies.get_mut(adj_idx).unwrap().rewrite.max_l3_packet_bytes = 32;
        }

        let packet = build_ipv4_packet(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(10, 1, 2, 3), 64, &[0u8; 64]);
        let lookup = harness.lookup;
        inject(&mut harness, lookup, &packet);
        assert!(harness.graph.run_once());
        assert!(harness.graph.run_once());

        assert_eq!(harness.graph.error_count(harness.rewrite, ForwardError::MtuExceeded), 1);
    }

    #[test]
    fn s6_src_lookup_miss_blocks_delivery_when_rpf_fails() {
        let mut input_graph = Graph::new();
        let miss_adj = AdjIndex::new(0);
        let state = Rc::new(RefCell::new(Ipv4Forwarder::new(miss_adj)));
        let rx_if;
        {
            let mut s = state.borrow_mut();
            // Reserve index 0 so it matches `miss_adj` and carries a real
            // (invalid) hw_if_index rather than colliding with whatever the
            // next `add_adjacency` call happens to allocate first.
            s.adjacencies.add_adjacency(Adjacency::template(LookupNext::Miss), 1);
            let (_, sw) = s.ifaces.register_interface(
                "eth1",
                MacAddr::new([0, 1, 2, 3, 4, 5]),
                1500,
                NodeIndex::new(0),
                NodeIndex::new(1),
            );
            rx_if = sw;
            s.enable_rpf(rx_if);

            let local_adj = s.adjacencies.add_adjacency(Adjacency::template(LookupNext::Local), 1);
            s.add_del_route(RouteFlags::ADD, Ipv4Addr::new(192, 0, 2, 2), 32, local_adj);
            s.listeners
                .register(53, NodeIndex::new(0), vec![Ipv4Addr::new(192, 0, 2, 2)])
                .unwrap();
        }

        input_graph.register_node(passthrough_drop("ip4-drop"));
        input_graph.register_node(passthrough_drop("ip4-lookup"));
        let input = input_graph.register_node(NodeDescriptor {
            name: "ip4-input",
            kind: NodeKind::Internal,
            state: NodeState::Polling,
            next_names: vec!["ip4-lookup", "ip4-drop"],
            error_strings: FORWARD_ERROR_NAMES.to_vec(),
            function: Box::new(move |d, frame| {
                ip4_input(d, frame, &state, NextIndex::new(0), NextIndex::new(1));
            }),
        });

        let pkt = build_ipv4_packet(Ipv4Addr::new(10, 9, 9, 9), Ipv4Addr::new(192, 0, 2, 2), 64, b"hi");
        let mut out = [BufferIndex::INVALID; 1];
        input_graph.pool.alloc_from_free_list(&mut out, 1);
        input_graph.pool.get_mut(out[0]).sw_if_index_rx = rx_if;
        input_graph.pool.get_mut(out[0]).append(&pkt).unwrap();
        let mut frame = Frame::new();
        frame.push(out[0]);
        input_graph.enqueue_input(input, frame);
        assert!(input_graph.run_once());
        assert_eq!(input_graph.error_count(input, ForwardError::SrcLookupMiss), 1);
    }

    fn build_udp_datagram(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut seg = vec![0u8; 8 + payload.len()];
        seg[0..2].copy_from_slice(&sport.to_be_bytes());
        seg[2..4].copy_from_slice(&dport.to_be_bytes());
        seg[4..6].copy_from_slice(&(seg.len() as u16).to_be_bytes());
        seg[8..].copy_from_slice(payload);
        let csum = compute_udp_checksum(src, dst, &seg);
        seg[6..8].copy_from_slice(&csum.to_be_bytes());
        seg
    }

    fn build_local_graph() -> (Graph, NodeIndex, NodeIndex, Rc<RefCell<Ipv4Forwarder>>) {
        let miss_adj = AdjIndex::new(0);
        let state = Rc::new(RefCell::new(Ipv4Forwarder::new(miss_adj)));
        state
            .borrow_mut()
            .listeners
            .register(53, NodeIndex::new(0), vec![Ipv4Addr::new(192, 0, 2, 2)])
            .unwrap();

        let mut graph = Graph::new();
        let drop_node = graph.register_node(passthrough_drop("ip4-drop"));
        let local_state = state.clone();
        let local = graph.register_node(NodeDescriptor {
            name: "ip4-local",
            kind: NodeKind::Internal,
            state: NodeState::Polling,
            next_names: vec!["ip4-drop"],
            error_strings: FORWARD_ERROR_NAMES.to_vec(),
            function: Box::new(move |d, frame| {
                ip4_local(d, frame, &local_state, NextIndex::new(0));
            }),
        });
        (graph, local, drop_node, state)
    }

    fn inject_local(graph: &mut Graph, node: NodeIndex, packet: &[u8]) {
        let mut out = [BufferIndex::INVALID; 1];
        graph.pool.alloc_from_free_list(&mut out, 1);
        graph.pool.get_mut(out[0]).append(packet).unwrap();
        let mut frame = Frame::new();
        frame.push(out[0]);
        graph.enqueue_input(node, frame);
    }

    #[test]
    fn local_delivery_accepts_correct_udp_checksum() {
        let (mut graph, local, drop_node, state) = build_local_graph();
        let delivered = Rc::new(RefCell::new(false));
        let delivered2 = delivered.clone();
        {
            let mut s = state.borrow_mut();
            let idx = s.listeners.lookup(53, Ipv4Addr::new(192, 0, 2, 2)).unwrap();
            s.listeners
                .set_on_deliver(idx, Box::new(move |_, _, _| *delivered2.borrow_mut() = true));
        }

        let udp = build_udp_datagram(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(192, 0, 2, 2), 4000, 53, b"hi");
        let pkt = build_ipv4_packet(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(192, 0, 2, 2), 64, &udp);
        inject_local(&mut graph, local, &pkt);

        assert!(graph.run_once());
        assert!(*delivered.borrow());
        assert_eq!(graph.error_count(local, ForwardError::UdpChecksum), 0);
        assert_eq!(graph.error_count(drop_node, ForwardError::UdpChecksum), 0);
    }

    #[test]
    fn local_delivery_rejects_corrupt_udp_checksum() {
        let (mut graph, local, _drop_node, state) = build_local_graph();
        let delivered = Rc::new(RefCell::new(false));
        let delivered2 = delivered.clone();
        {
            let mut s = state.borrow_mut();
            let idx = s.listeners.lookup(53, Ipv4Addr::new(192, 0, 2, 2)).unwrap();
            s.listeners
                .set_on_deliver(idx, Box::new(move |_, _, _| *delivered2.borrow_mut() = true));
        }

        let mut udp = build_udp_datagram(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(192, 0, 2, 2), 4000, 53, b"hi");
        udp[6] ^= 0xFF; // corrupt the checksum field itself
        let pkt = build_ipv4_packet(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(192, 0, 2, 2), 64, &udp);
        inject_local(&mut graph, local, &pkt);

        assert!(graph.run_once());
        assert!(!*delivered.borrow());
        assert_eq!(graph.error_count(local, ForwardError::UdpChecksum), 1);
    }

    #[test]
    fn local_delivery_accepts_zero_udp_checksum_as_not_computed() {
        let (mut graph, local, _drop_node, state) = build_local_graph();
        let delivered = Rc::new(RefCell::new(false));
        let delivered2 = delivered.clone();
        {
            let mut s = state.borrow_mut();
            let idx = s.listeners.lookup(53, Ipv4Addr::new(192, 0, 2, 2)).unwrap();
            s.listeners
                .set_on_deliver(idx, Box::new(move |_, _, _| *delivered2.borrow_mut() = true));
        }

        let mut udp = build_udp_datagram(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(192, 0, 2, 2), 4000, 53, b"hi");
        udp[6..8].copy_from_slice(&[0, 0]); // RFC 768: zero means "not computed"
        let pkt = build_ipv4_packet(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(192, 0, 2, 2), 64, &udp);
        inject_local(&mut graph, local, &pkt);

        assert!(graph.run_once());
        assert!(*delivered.borrow());
        assert_eq!(graph.error_count(local, ForwardError::UdpChecksum), 0);
    }

    #[test]
    fn local_delivery_rejects_udp_length_mismatch() {
        let (mut graph, local, _drop_node, state) = build_local_graph();
        let _ = state;
        let mut udp = build_udp_datagram(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(192, 0, 2, 2), 4000, 53, b"hi");
        udp[4..6].copy_from_slice(&(udp.len() as u16 + 4).to_be_bytes()); // claim 4 extra bytes
        let pkt = build_ipv4_packet(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(192, 0, 2, 2), 64, &udp);
        inject_local(&mut graph, local, &pkt);

        assert!(graph.run_once());
        assert_eq!(graph.error_count(local, ForwardError::UdpLength), 1);
    }
}
