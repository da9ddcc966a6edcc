//! IPv6 forwarding nodes: `ip6-input`, `ip6-lookup`, `ip6-rewrite`,
//! `ip6-local` (spec SPEC_FULL §4.5). Structurally the same state machine as
//! [`crate::ip4`], minus the header-checksum step IPv6 has no field for —
//! the fixed 40-byte header carries `hop_limit` where IPv4 carries `ttl` and
//! `next_header` where IPv4 carries `protocol`, with no equivalent of the
//! IPv4 header checksum to maintain on every hop.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};
use vswitch_core::buffer::{compute_tcp_checksum_v6, compute_udp_checksum_v6};
use vswitch_core::graph::Dispatch;
use vswitch_fib::{Adjacency, AdjacencyHeap, Ipv6Fib, LookupNext, MultipathTable};
use vswitch_types::{
    AdjIndex, BufferFlags, BufferIndex, ForwardError, IpProtocol, Ipv6Addr, NextIndex, RouteFlags,
};

use crate::listener::ListenerTable;

pub const IPV6_HEADER_LEN: u16 = 40;

/// Read-only view of the fixed IPv6 header's fields, mirroring `ip4.rs`'s
/// header view minus the checksum field IPv6 doesn't have.
struct Ipv6HeaderView {
    payload_len: u16,
    next_header: u8,
    hop_limit: u8,
    src: Ipv6Addr,
    dst: Ipv6Addr,
}

fn parse_header(data: &[u8]) -> Option<Ipv6HeaderView> {
    if data.len() < IPV6_HEADER_LEN as usize {
        return None;
    }
    let version = data[0] >> 4;
    if version != 6 {
        return None;
    }
    let mut src = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&data[24..40]);
    Some(Ipv6HeaderView {
        payload_len: u16::from_be_bytes([data[4], data[5]]),
        next_header: data[6],
        hop_limit: data[7],
        src: Ipv6Addr(src),
        dst: Ipv6Addr(dst),
    })
}

/// Shared IPv6 forwarding state, captured the same way as
/// [`crate::ip4::Ipv4Forwarder`] — `Rc<RefCell<_>>` across node closures,
/// safe under the scheduler's single-threaded run-to-completion contract.
/// Keeps its own listener table rather than sharing the IPv4 side's: spec
/// SPEC_FULL's listener model is keyed by `Ipv4Addr` (§9 notes IPv6 listener
/// binding as deferred), so a shared table would only ever match on the
/// unspecified address anyway.
pub struct Ipv6Forwarder {
    pub fib: Ipv6Fib,
    pub adjacencies: AdjacencyHeap,
    pub multipath: MultipathTable,
    pub listeners: ListenerTable,
}

impl Ipv6Forwarder {
    pub fn new(miss_adj: AdjIndex) -> Self {
        Ipv6Forwarder {
            fib: Ipv6Fib::new(miss_adj),
            adjacencies: AdjacencyHeap::new(),
            multipath: MultipathTable::new(),
            listeners: ListenerTable::new(),
        }
    }

    /// `add_del_route`, identical contract to the IPv4 side (spec SPEC_FULL
    /// §4.3): frees the superseded adjacency unless `KEEP_OLD_ADJACENCY` is
    /// set, and increfs the installed one unless this is itself a delete.
    pub fn add_del_route(&mut self, flags: RouteFlags, dst: Ipv6Addr, len: u8, adj: AdjIndex) {
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

    /// Installs the interface's own `/128` as a local route and the
    /// covering prefix as a connected route. Unlike IPv4's `set_interface_
    /// address` this crate has no IPv6 neighbor-discovery node yet (spec
    /// SPEC_FULL §9's "ND glean" is out of scope), so the covering prefix is
    /// installed straight to `Drop` — a configured IPv6 next-hop route
    /// always overwrites it via a later `add_del_route`.
    pub fn set_interface_address(&mut self, addr: Ipv6Addr, prefix_len: u8) {
        let local_adj = self
            .adjacencies
            .add_adjacency(Adjacency::template(LookupNext::Local), 1);
        self.add_del_route(RouteFlags::ADD, addr, 128, local_adj);

        let connected_adj = self
            .adjacencies
            .add_adjacency(Adjacency::template(LookupNext::Drop), 1);
        self.add_del_route(RouteFlags::ADD, addr.masked(prefix_len), prefix_len, connected_adj);
        debug!(?addr, prefix_len, "ipv6 interface address installed");
    }

    pub fn drain_pending_remaps(&mut self) {
        if !self.multipath.has_pending_remaps() {
            return;
        }
        let remap = self.multipath.drain_remaps();
        self.fib.maybe_remap_adjacencies(&remap);
    }
}

/// `ip6-input`: validates the fixed header (version/hop_limit>0) and hands
/// off to lookup. No uRPF here — spec SPEC_FULL's source-check feature is
/// defined over the IPv4 FIB only (§4.6's feature-arc list names
/// `ip4-source-check` specifically).
pub fn ip6_input(
    dispatch: &mut Dispatch,
    frame: &[u32],
    next_lookup: NextIndex,
    next_drop: NextIndex,
) {
    for &raw in frame {
        let bi = BufferIndex::new(raw);
        let valid = {
            let buf = dispatch.pool().get(bi);
            parse_header(buf.payload())
                .map(|h| h.hop_limit > 0 && IPV6_HEADER_LEN as usize + h.payload_len as usize <= buf.payload().len())
        };
        if valid == Some(true) {
            dispatch.enqueue_x1(next_lookup, bi);
        } else {
            dispatch.pool().free_no_next(bi);
        }
    }
}

/// `ip6-lookup`: identical state table to `ip4-lookup`, minus the flow-hash
/// stash since this crate's IPv6 path doesn't yet build multipath groups
/// (spec SPEC_FULL §9 Open Question: IPv6 ECMP deferred, single-path only).
pub fn ip6_lookup(
    dispatch: &mut Dispatch,
    frame: &[u32],
    state: &Rc<RefCell<Ipv6Forwarder>>,
    next_local: NextIndex,
    next_rewrite: NextIndex,
    next_drop: NextIndex,
    next_punt: NextIndex,
    next_miss: NextIndex,
) {
    let s = state.borrow();
    for &raw in frame {
        let bi = BufferIndex::new(raw);
        let dst = {
            let buf = dispatch.pool().get(bi);
            parse_header(buf.payload()).map(|h| h.dst)
        };
        let Some(dst) = dst else {
            dispatch.enqueue_x1(next_drop, bi);
            continue;
        };

        let adj_index = s.fib.lookup(dst);
        dispatch.pool().get_mut(bi).opaque[0] = adj_index.0;

        let lookup_next = s.adjacencies.get(adj_index).map(|a| a.lookup_next);
        match lookup_next {
            None | Some(LookupNext::Miss) => {
                dispatch.count_error(ForwardError::DstLookupMiss);
                dispatch.enqueue_x1(next_miss, bi);
            }
            Some(LookupNext::Drop) | Some(LookupNext::Arp) => {
                dispatch.count_error(ForwardError::AdjacencyDrop);
                dispatch.enqueue_x1(next_drop, bi);
            }
            Some(LookupNext::Punt) => {
                dispatch.count_error(ForwardError::AdjacencyPunt);
                dispatch.enqueue_x1(next_punt, bi);
            }
            Some(LookupNext::Local) => dispatch.enqueue_x1(next_local, bi),
            Some(LookupNext::Rewrite) => dispatch.enqueue_x1(next_rewrite, bi),
        }
    }
}

/// `ip6-rewrite`: hop-limit decrement, MTU check, header prepend — no
/// checksum update, since IPv6 carries none at the network layer (spec
/// SPEC_FULL §4.5's rewrite contract, the one step this crate's IPv6 path
/// genuinely drops relative to IPv4's).
pub fn ip6_rewrite(
    dispatch: &mut Dispatch,
    frame: &[u32],
    state: &Rc<RefCell<Ipv6Forwarder>>,
    next_drop: NextIndex,
) {
    let s = state.borrow();
    for &raw in frame {
        let bi = BufferIndex::new(raw);
        let opaque0 = dispatch.pool().get(bi).opaque[0];
        let adj_index = AdjIndex::new(opaque0);
        let Some(adj) = s.adjacencies.get(adj_index).copied() else {
            dispatch.enqueue_x1(next_drop, bi);
            continue;
        };

        let locally_generated = dispatch.pool().get(bi).flags.contains(BufferFlags::LOCALLY_GENERATED);
        let hop_limit = {
            let buf = dispatch.pool().get(bi);
            parse_header(buf.payload()).map(|h| h.hop_limit)
        };
        let Some(hop_limit) = hop_limit else {
            dispatch.enqueue_x1(next_drop, bi);
            continue;
        };

        if !locally_generated {
            if hop_limit <= 1 {
                dispatch.set_buffer_error(bi, vswitch_types::NodeIndex::INVALID, ForwardError::TimeExpired);
                dispatch.count_error(ForwardError::TimeExpired);
                dispatch.enqueue_x1(next_drop, bi);
                continue;
            }
            dispatch.pool().get_mut(bi).payload_mut()[7] -= 1;
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

/// Same check as `ip4.rs`'s `verify_l4_checksum`, over the IPv6 pseudo
/// header instead of the IPv4 one (spec SPEC_FULL §4.5 local-node contract
/// applies identically to both address families).
fn verify_l4_checksum(proto: Option<IpProtocol>, src: Ipv6Addr, dst: Ipv6Addr, l4: &[u8]) -> Option<ForwardError> {
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
            if compute_udp_checksum_v6(src, dst, l4) != on_wire {
                return Some(ForwardError::UdpChecksum);
            }
            None
        }
        Some(IpProtocol::Tcp) => {
            if l4.len() < 20 {
                return Some(ForwardError::TcpChecksum);
            }
            let on_wire = u16::from_be_bytes([l4[16], l4[17]]);
            if compute_tcp_checksum_v6(src, dst, l4) != on_wire {
                return Some(ForwardError::TcpChecksum);
            }
            None
        }
        _ => None,
    }
}

/// `ip6-local`: same destination-port dispatch as `ip4-local`, reading the
/// listener table by IPv4 address — so IPv6 local delivery only reaches a
/// listener bound to the unspecified address set, matching §9's note that
/// per-listener IPv6 address binding is deferred.
pub fn ip6_local(
    dispatch: &mut Dispatch,
    frame: &[u32],
    state: &Rc<RefCell<Ipv6Forwarder>>,
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
            let l4 = &buf.payload()[IPV6_HEADER_LEN as usize..];
            let proto = IpProtocol::from_u8(header.next_header);
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
            let l4 = &buf.payload()[IPV6_HEADER_LEN as usize..];
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
        match s.listeners.lookup(dst_port, vswitch_types::Ipv4Addr::UNSPECIFIED) {
            Some(listener_idx) => {
                trace!(dst_port, next_header = header.next_header, "delivering ipv6 packet to local listener");
                let payload = {
                    let buf = dispatch.pool().get(bi);
                    let l4 = &buf.payload()[IPV6_HEADER_LEN as usize..];
                    l4[8.min(l4.len())..].to_vec()
                };
                s.listeners
                    .get_mut(listener_idx)
                    .deliver(vswitch_types::Ipv4Addr::UNSPECIFIED, vswitch_types::Ipv4Addr::UNSPECIFIED, &payload);
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
