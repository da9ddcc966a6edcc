use core::fmt;

macro_rules! arena_index {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            /// Sentinel meaning "no index" / "miss", matching the source's `~0` convention.
            pub const INVALID: $name = $name(u32::MAX);

            #[inline]
            pub const fn new(raw: u32) -> Self {
                $name(raw)
            }

            #[inline]
            pub const fn is_valid(self) -> bool {
                self.0 != u32::MAX
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::INVALID
            }
        }

        impl From<u32> for $name {
            fn from(v: u32) -> Self {
                $name(v)
            }
        }

        impl From<usize> for $name {
            fn from(v: usize) -> Self {
                $name(v as u32)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                } else {
                    write!(f, concat!(stringify!($name), "(INVALID)"))
                }
            }
        }
    };
}

arena_index!(BufferIndex, "Index into a `BufferPool`'s buffer arena.");
arena_index!(AdjIndex, "Index into an `AdjacencyHeap`; may be a multipath block head.");
arena_index!(NodeIndex, "Index into a `Graph`'s node registry.");
arena_index!(NextIndex, "Index of a next-edge slot on a specific node.");
arena_index!(SwIfIndex, "Index of a software interface.");
arena_index!(HwIfIndex, "Index of a hardware interface.");
arena_index!(FibIndex, "Index of a FIB table (supports multiple routing tables).");
arena_index!(ListenerIndex, "Index into the local-delivery listener table.");
arena_index!(StreamIndex, "Index into a packet generator's stream table.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_not_valid() {
        assert!(!AdjIndex::INVALID.is_valid());
        assert!(AdjIndex::new(0).is_valid());
    }

    #[test]
    fn default_is_invalid() {
        assert_eq!(SwIfIndex::default(), SwIfIndex::INVALID);
    }
}
