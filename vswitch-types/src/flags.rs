use bitflags::bitflags;

bitflags! {
    /// Per-buffer flags, generalizing the source's buffer flag word.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct BufferFlags: u32 {
        /// `next_buffer` holds a valid index continuing this packet's chain.
        const NEXT_PRESENT        = 1 << 0;
        /// Buffer is being traced for diagnostics.
        const IS_TRACED           = 1 << 1;
        /// The L4 checksum field has been computed/verified already.
        const L4_CHECKSUM_COMPUTED = 1 << 2;
        /// The computed/verified L4 checksum was correct.
        const L4_CHECKSUM_CORRECT  = 1 << 3;
        /// Packet originated locally (e.g. an ARP reply we built); rewrite
        /// must not decrement its TTL.
        const LOCALLY_GENERATED    = 1 << 4;
    }
}

bitflags! {
    /// Administrative/link state flags for an interface.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct InterfaceFlags: u32 {
        const ADMIN_UP = 1 << 0;
        const LINK_UP  = 1 << 1;
    }
}

bitflags! {
    /// Flags accepted by `add_del_route` / `add_del_route_next_hop`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct RouteFlags: u32 {
        const ADD                  = 1 << 0;
        const DEL                  = 1 << 1;
        const FIB_INDEX            = 1 << 2;
        const TABLE_ID             = 1 << 3;
        const KEEP_OLD_ADJACENCY   = 1 << 4;
        const NO_REDISTRIBUTE      = 1 << 5;
        const NOT_LAST_IN_GROUP    = 1 << 6;
        const NEIGHBOR             = 1 << 7;
    }
}
