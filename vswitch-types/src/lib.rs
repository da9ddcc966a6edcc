//! Shared newtypes for the forwarding plane: addresses, arena indices,
//! bitflags, and the error taxonomy.
//!
//! Every other crate in the workspace depends on this one and none of it
//! depends back, mirroring how `slopos_lib`'s low-level types sit underneath
//! the rest of that workspace.

mod addr;
mod error;
mod flags;
mod index;
mod proto;

pub use addr::{Ipv4Addr, Ipv6Addr, MacAddr};
pub use error::{ForwardError, NetError};
pub use flags::{BufferFlags, InterfaceFlags, RouteFlags};
pub use index::{
    AdjIndex, BufferIndex, FibIndex, HwIfIndex, ListenerIndex, NextIndex, NodeIndex, StreamIndex,
    SwIfIndex,
};
pub use proto::{EtherType, IpProtocol};
