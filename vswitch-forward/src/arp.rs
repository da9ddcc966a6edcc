//! ARP/ND node: rate-limited request emission and the neighbor-resolution
//! path (spec SPEC_FULL §4.5, §9). The rate limiter is concretized directly
//! from `examples/original_source/vnet/ip/ip4_forward.c`'s `ip4_arp`: a
//! 256-bit bitmap reseeded every ~1ms, probed via a Jenkins lookup3 mix of
//! `(dst_addr, sw_if_index, seed)`. Per spec.md §1 the exact hash is an
//! implementation choice; the rate-limit *contract* (one request per
//! dst/interface per ~1ms, memory-bounded) is the requirement, and per
//! SPEC_FULL §9 Open Questions this crate scopes the bitmap per-interface
//! rather than reproducing the source's global-bitmap cross-interface
//! false-suppression bug.

use std::collections::HashMap;

use rand::RngCore;
use tracing::trace;
use vswitch_types::{ForwardError, Ipv4Addr, MacAddr, SwIfIndex};

const BITMAP_WORDS: usize = 4; // 256 bits
const EPOCH_SECS: f64 = 0.001;

/// Jenkins lookup3 32-bit finalizer (`hash_v3_finalize32` in the source),
/// transcribed as a free function since spec.md §9 doesn't mandate bit-exact
/// reproduction of the rate-limiter's hash.
pub(crate) fn jenkins3_finalize(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(24));
    c
}

/// Per-(dst, sw_if_index) probabilistic rate limiter. One bitmap per
/// interface, reseeded from a CSPRNG draw whenever an epoch (~1ms) elapses.
pub struct ArpRateLimiter {
    per_if: HashMap<SwIfIndex, (u32, [u64; BITMAP_WORDS])>,
    last_reseed: f64,
    epoch: f64,
}

impl ArpRateLimiter {
    pub fn new() -> Self {
        ArpRateLimiter {
            per_if: HashMap::new(),
            last_reseed: f64::NEG_INFINITY,
            epoch: EPOCH_SECS,
        }
    }

    #[cfg(test)]
    pub fn with_epoch(epoch: f64) -> Self {
        ArpRateLimiter {
            per_if: HashMap::new(),
            last_reseed: f64::NEG_INFINITY,
            epoch,
        }
    }

    /// `true` if a request for `(dst, sw_if_index)` should be suppressed
    /// (already requested this epoch); `false` if this call claims the slot
    /// and the caller should actually send a request.
    pub fn should_suppress(&mut self, now: f64, dst: Ipv4Addr, sw_if_index: SwIfIndex) -> bool {
        if now - self.last_reseed >= self.epoch {
            self.last_reseed = now;
            for (_, bitmap) in self.per_if.values_mut() {
                *bitmap = [0u64; BITMAP_WORDS];
            }
        }
        let entry = self
            .per_if
            .entry(sw_if_index)
            .or_insert_with(|| (rand::thread_rng().next_u32(), [0u64; BITMAP_WORDS]));
        let seed = entry.0;
        let bucket = jenkins3_finalize(dst.to_u32_be(), sw_if_index.0, seed) & 255;
        let word = (bucket / 64) as usize;
        let bit = 1u64 << (bucket % 64);
        let already_set = entry.1[word] & bit != 0;
        entry.1[word] |= bit;
        already_set
    }
}

impl Default for ArpRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// One ARP lookup attempt, as seen by the `ip4-arp` node: suppressed
/// (counted `ArpDrop`) or a request actually queued (counted
/// `ArpRequestSent`), per spec SPEC_FULL §4.5/§7.
pub enum ArpOutcome {
    Suppressed,
    RequestSent { request: Vec<u8> },
}

/// `ip4-arp` node body, extracted from the frame-dispatch shell so it can be
/// unit tested without a full `Graph`. `our_mac`/`our_ip` are the outgoing
/// interface's own addresses, used to fill in the ARP request's sender
/// fields (spec SPEC_FULL §4.5, grounded on `ip4_forward.c`'s
/// `ip4_arp_request_packet_template`/`memcpy`-then-fill pattern).
pub fn resolve_or_request(
    limiter: &mut ArpRateLimiter,
    now: f64,
    dst: Ipv4Addr,
    sw_if_index: SwIfIndex,
    our_mac: MacAddr,
    our_ip: Ipv4Addr,
) -> ArpOutcome {
    if limiter.should_suppress(now, dst, sw_if_index) {
        trace!(?dst, sw_if_index = sw_if_index.0, "arp request suppressed, rate limited");
        return ArpOutcome::Suppressed;
    }
    ArpOutcome::RequestSent {
        request: build_request(our_mac, our_ip, dst),
    }
}

pub const ARP_HEADER_LEN: usize = 28;

/// Build a 28-byte ARP-over-Ethernet request body (Ethernet header is
/// prepended separately by the caller via `ethernet::build_header`).
pub fn build_request(our_mac: MacAddr, our_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let mut out = vec![0u8; ARP_HEADER_LEN];
    out[0..2].copy_from_slice(&1u16.to_be_bytes()); // htype: ethernet
    out[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // ptype: ipv4
    out[4] = 6; // hlen
    out[5] = 4; // plen
    out[6..8].copy_from_slice(&1u16.to_be_bytes()); // oper: request
    out[8..14].copy_from_slice(&our_mac.0);
    out[14..18].copy_from_slice(&our_ip.0);
    out[18..24].copy_from_slice(&[0; 6]);
    out[24..28].copy_from_slice(&target_ip.0);
    out
}

/// Parse an ARP-over-Ethernet body, returning `(is_reply, sender_mac,
/// sender_ip, target_ip)`.
pub fn parse(data: &[u8]) -> Option<(bool, MacAddr, Ipv4Addr, Ipv4Addr)> {
    if data.len() < ARP_HEADER_LEN {
        return None;
    }
    let oper = u16::from_be_bytes([data[6], data[7]]);
    let sender_mac = MacAddr::new(data[8..14].try_into().unwrap());
    let sender_ip = Ipv4Addr::new(data[14], data[15], data[16], data[17]);
    let target_ip = Ipv4Addr::new(data[24], data[25], data[26], data[27]);
    Some((oper == 2, sender_mac, sender_ip, target_ip))
}

pub fn error_code(outcome: &ArpOutcome) -> ForwardError {
    match outcome {
        ArpOutcome::Suppressed => ForwardError::ArpDrop,
        ArpOutcome::RequestSent { .. } => ForwardError::ArpRequestSent,
    }
}
