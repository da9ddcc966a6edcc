//! Redistribution channel: the message-passing substitute for
//! shared-mutable-state locking across graph instances (spec SPEC_FULL §4.6,
//! §6, §9). No serialization crate in the retrieval pack reaches for
//! bincode/postcard/rkyv for this kind of internal wire format, so this is a
//! hand-rolled byte codec in the same manual style as the teacher's own
//! checksum code (`drivers/src/net/packetbuf.rs`).

use vswitch_types::{AdjIndex, Ipv4Addr, NetError, RouteFlags};

/// Current wire format version. A peer receiving any other value is a fatal
/// version-skew error (spec SPEC_FULL §6/§7) — this system has no forward-
/// compatibility story for the redistribute stream.
pub const WIRE_VERSION: u8 = 1;

const MSG_ADD_DEL_ROUTE: u8 = 1;
const MSG_SET_INTERFACE_FLAGS: u8 = 2;

/// A control-plane mutation, as replayed to peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedistributeMessage {
    AddDelRoute {
        flags: RouteFlags,
        dst: Ipv4Addr,
        len: u8,
        adj: AdjIndex,
    },
    SetInterfaceFlags {
        sw_if_index: u32,
        admin_up: bool,
    },
}

impl RedistributeMessage {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(WIRE_VERSION);
        match *self {
            RedistributeMessage::AddDelRoute { flags, dst, len, adj } => {
                out.push(MSG_ADD_DEL_ROUTE);
                out.extend_from_slice(&flags.bits().to_be_bytes());
                out.extend_from_slice(&dst.to_u32_be().to_be_bytes());
                out.push(len);
                out.extend_from_slice(&adj.0.to_be_bytes());
            }
            RedistributeMessage::SetInterfaceFlags { sw_if_index, admin_up } => {
                out.push(MSG_SET_INTERFACE_FLAGS);
                out.extend_from_slice(&sw_if_index.to_be_bytes());
                out.push(admin_up as u8);
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), NetError> {
        if buf.len() < 2 {
            return Err(NetError::MalformedMessage("message shorter than header"));
        }
        let version = buf[0];
        if version != WIRE_VERSION {
            return Err(NetError::VersionSkew {
                expected: WIRE_VERSION,
                got: version,
            });
        }
        match buf[1] {
            MSG_ADD_DEL_ROUTE => {
                if buf.len() < 2 + 4 + 4 + 1 + 4 {
                    return Err(NetError::MalformedMessage("truncated add_del_route"));
                }
                let flags = RouteFlags::from_bits_truncate(u32::from_be_bytes(
                    buf[2..6].try_into().unwrap(),
                ));
                let dst = Ipv4Addr::from_u32_be(u32::from_be_bytes(buf[6..10].try_into().unwrap()));
                let len = buf[10];
                let adj = AdjIndex::new(u32::from_be_bytes(buf[11..15].try_into().unwrap()));
                Ok((
                    RedistributeMessage::AddDelRoute { flags, dst, len, adj },
                    15,
                ))
            }
            MSG_SET_INTERFACE_FLAGS => {
                if buf.len() < 2 + 4 + 1 {
                    return Err(NetError::MalformedMessage("truncated set_interface_flags"));
                }
                let sw_if_index = u32::from_be_bytes(buf[2..6].try_into().unwrap());
                let admin_up = buf[6] != 0;
                Ok((
                    RedistributeMessage::SetInterfaceFlags { sw_if_index, admin_up },
                    7,
                ))
            }
            other => Err(NetError::MalformedMessage(match other {
                _ => "unknown message type",
            })),
        }
    }
}

/// In-process stand-in for the multicast channel: each mutation is encoded
/// then handed to every registered peer's replay handler. `NO_REDISTRIBUTE`
/// is the caller's job to check before calling `publish` at all — this
/// channel has no opinion on it, matching the flag's role as a suppression
/// applied by the sender, not the transport.
pub struct RedistributeChannel {
    peers: Vec<Box<dyn FnMut(RedistributeMessage)>>,
}

impl RedistributeChannel {
    pub fn new() -> Self {
        RedistributeChannel { peers: Vec::new() }
    }

    pub fn subscribe(&mut self, peer: Box<dyn FnMut(RedistributeMessage)>) {
        self.peers.push(peer);
    }

    pub fn publish(&mut self, message: RedistributeMessage) {
        let mut wire = Vec::new();
        message.encode(&mut wire);
        let (decoded, _) = RedistributeMessage::decode(&wire).expect("self-encoded message must decode");
        for peer in self.peers.iter_mut() {
            peer(decoded);
        }
    }
}

impl Default for RedistributeChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_add_del_route() {
        let msg = RedistributeMessage::AddDelRoute {
            flags: RouteFlags::ADD,
            dst: Ipv4Addr::new(10, 0, 0, 0),
            len: 8,
            adj: AdjIndex::new(42),
        };
        let mut wire = Vec::new();
        msg.encode(&mut wire);
        let (decoded, consumed) = RedistributeMessage::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn version_skew_is_rejected() {
        let mut wire = vec![WIRE_VERSION + 1, MSG_SET_INTERFACE_FLAGS, 0, 0, 0, 1, 1];
        wire[0] = 99;
        let err = RedistributeMessage::decode(&wire).unwrap_err();
        assert!(matches!(err, NetError::VersionSkew { got: 99, .. }));
    }

    #[test]
    fn publish_replays_to_every_peer() {
        let mut channel = RedistributeChannel::new();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            channel.subscribe(Box::new(move |msg| seen.borrow_mut().push(msg)));
        }
        channel.publish(RedistributeMessage::SetInterfaceFlags {
            sw_if_index: 3,
            admin_up: true,
        });
        assert_eq!(seen.borrow().len(), 2);
    }
}
