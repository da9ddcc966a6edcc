use thiserror::Error;

/// Per-packet forwarding error codes (spec.md §7's "IP forwarding" and "ARP"
/// taxonomies). Attached to a buffer as a packed `(node_index, code)` pair —
/// this enum is `Copy` and carries no allocation so it stays cheap on the
/// hot path; `thiserror` only gives it a human-readable `Display`, it is
/// never the vehicle for control-plane `Result`s.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum ForwardError {
    #[error("no error")]
    None,
    #[error("ttl expired")]
    TimeExpired,
    #[error("mtu exceeded")]
    MtuExceeded,
    #[error("tcp checksum mismatch")]
    TcpChecksum,
    #[error("udp checksum mismatch")]
    UdpChecksum,
    #[error("udp length mismatch")]
    UdpLength,
    #[error("unknown l4 protocol")]
    UnknownProtocol,
    #[error("source-address reverse-path lookup miss")]
    SrcLookupMiss,
    #[error("destination lookup miss")]
    DstLookupMiss,
    #[error("adjacency administratively dropped")]
    AdjacencyDrop,
    #[error("adjacency punted")]
    AdjacencyPunt,
    #[error("arp request rate-limited")]
    ArpDrop,
    #[error("arp request sent")]
    ArpRequestSent,
    #[error("driver rx data error")]
    RxDataError,
    #[error("driver detected bad ipv4 checksum")]
    Ipv4ChecksumError,
    #[error("tx ring full, packet dropped")]
    TxFullDrops,
}

impl Default for ForwardError {
    fn default() -> Self {
        ForwardError::None
    }
}

/// Control-plane error surface: everything that can go wrong calling into
/// the FIB, adjacency table, or interface registry from outside the data
/// plane. Generalizes the source's flat `NetError`, trimmed of socket-layer
/// variants this forwarding-only system has no use for.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("no buffers available from free list")]
    NoBufferSpace,
    #[error("prefix length {0} is out of range")]
    InvalidPrefixLength(u8),
    #[error("adjacency index {0:?} does not exist")]
    UnknownAdjacency(crate::AdjIndex),
    #[error("interface index {0:?} does not exist")]
    UnknownInterface(crate::SwIfIndex),
    #[error("node {0:?} has no next-edge named {1:?}")]
    UnknownNextEdge(crate::NodeIndex, &'static str),
    #[error("route table is full")]
    RouteTableFull,
    #[error("listener already registered on port {0}")]
    ListenerExists(u16),
    #[error("redistribution stream version skew: expected {expected}, got {got}")]
    VersionSkew { expected: u8, got: u8 },
    #[error("malformed redistribution message: {0}")]
    MalformedMessage(&'static str),
}
