//! Interface model, ARP, and the IPv4/IPv6 forwarding node graphs (spec
//! SPEC_FULL §3.7-3.9, §4.5, §4.6).

pub mod arp;
pub mod ethernet;
pub mod iface;
pub mod ip4;
pub mod ip6;
pub mod listener;

pub use arp::{ArpOutcome, ArpRateLimiter};
pub use ethernet::{ethernet_input, ETH_HEADER_LEN, VLAN_HEADER_LEN};
pub use iface::{Direction, HwInterface, InterfaceTable, SwInterface};
pub use ip4::{ip4_arp, ip4_input, ip4_local, ip4_lookup, ip4_rewrite, Ipv4Forwarder};
pub use ip6::{ip6_input, ip6_local, ip6_lookup, ip6_rewrite, Ipv6Forwarder};
pub use listener::{Listener, ListenerTable};
