//! Local-delivery listener table (spec SPEC_FULL §3.8, §6).
//!
//! A listener is registered once per destination port; the local node only
//! dispatches to it if the packet's destination address is bit-set in the
//! listener's own local-adjacency bitmap — this is what lets `ip4-local`
//! distinguish "UDP port 53 bound to 192.0.2.2" from "bound to any of our
//! addresses" without the listener having to know about the FIB.

use std::collections::HashMap;

use vswitch_types::{Ipv4Addr, ListenerIndex, NodeIndex};

/// `{dst_port, valid_local_adjacency_bitmap, next_node_index}`. The event
/// callback the spec mentions is represented as an optional closure invoked
/// when a packet is actually delivered — tests mostly just assert on
/// `next_node_index` dispatch instead of wiring a callback.
pub struct Listener {
    pub dst_port: u16,
    pub next_node_index: NodeIndex,
    valid_addresses: Vec<Ipv4Addr>,
    on_deliver: Option<Box<dyn FnMut(Ipv4Addr, Ipv4Addr, &[u8])>>,
}

impl Listener {
    pub fn accepts(&self, dst: Ipv4Addr) -> bool {
        self.valid_addresses.iter().any(|a| *a == dst)
    }

    pub fn deliver(&mut self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) {
        if let Some(cb) = self.on_deliver.as_mut() {
            cb(src, dst, payload);
        }
    }
}

#[derive(Default)]
pub struct ListenerTable {
    listeners: Vec<Listener>,
    by_port: HashMap<u16, ListenerIndex>,
}

impl ListenerTable {
    pub fn new() -> Self {
        ListenerTable::default()
    }

    /// `register_listener(dst_port, next_node_index) -> listener_id`.
    /// Re-registering an already-bound port is rejected — see
    /// `vswitch_types::NetError::ListenerExists`.
    pub fn register(
        &mut self,
        dst_port: u16,
        next_node_index: NodeIndex,
        valid_addresses: Vec<Ipv4Addr>,
    ) -> Result<ListenerIndex, vswitch_types::NetError> {
        if self.by_port.contains_key(&dst_port) {
            return Err(vswitch_types::NetError::ListenerExists(dst_port));
        }
        let idx = ListenerIndex::new(self.listeners.len() as u32);
        self.listeners.push(Listener {
            dst_port,
            next_node_index,
            valid_addresses,
            on_deliver: None,
        });
        self.by_port.insert(dst_port, idx);
        Ok(idx)
    }

    pub fn set_on_deliver(
        &mut self,
        idx: ListenerIndex,
        callback: Box<dyn FnMut(Ipv4Addr, Ipv4Addr, &[u8])>,
    ) {
        if let Some(l) = self.listeners.get_mut(idx.as_usize()) {
            l.on_deliver = Some(callback);
        }
    }

    /// `dst_port -> listener`, gated on the destination address bitmap.
    pub fn lookup(&self, dst_port: u16, dst_addr: Ipv4Addr) -> Option<ListenerIndex> {
        let idx = *self.by_port.get(&dst_port)?;
        let listener = &self.listeners[idx.as_usize()];
        listener.accepts(dst_addr).then_some(idx)
    }

    pub fn get_mut(&mut self, idx: ListenerIndex) -> &mut Listener {
        &mut self.listeners[idx.as_usize()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_respects_address_bitmap() {
        let mut table = ListenerTable::new();
        let bound = Ipv4Addr::new(192, 0, 2, 2);
        let other = Ipv4Addr::new(192, 0, 2, 9);
        table.register(53, NodeIndex::new(1), vec![bound]).unwrap();
        assert!(table.lookup(53, bound).is_some());
        assert!(table.lookup(53, other).is_none());
        assert!(table.lookup(54, bound).is_none());
    }

    #[test]
    fn duplicate_port_registration_is_rejected() {
        let mut table = ListenerTable::new();
        table.register(53, NodeIndex::new(1), vec![]).unwrap();
        assert!(table.register(53, NodeIndex::new(2), vec![]).is_err());
    }
}
