//! FIB, adjacency heap, multipath table, and the control-plane redistribution
//! channel (spec SPEC_FULL §4.3, §4.4, §4.6 redistribution, §6).

pub mod adjacency;
pub mod fib;
pub mod multipath;
pub mod redistribute;

pub use adjacency::{Adjacency, AdjacencyHeap, LookupNext, RewriteHeader};
pub use fib::{FibCallback, FibEvent, Ipv4Fib, Ipv6Fib};
pub use multipath::{canonicalize, MultipathTable};
pub use redistribute::{RedistributeChannel, RedistributeMessage, WIRE_VERSION};
