//! Interface model: hw/sw interface pools, admin/link state, feature chains,
//! and counters (spec SPEC_FULL §3.7, §4.6).
//!
//! Generalizes the teacher's `NetDeviceRegistry` (`drivers/src/net/netdev.rs`)
//! fixed-`[Option<T>; MAX_DEVICES]`-plus-freelist idiom from "at most 8 NICs"
//! to a growable `Vec<Option<T>>` with a free-index stack, keeping the same
//! "stable handle, mutate only at (un)registration" discipline.

use std::collections::HashMap;

use tracing::{debug, info};
use vswitch_core::{CombinedCounters, SimpleCounters};
use vswitch_types::{HwIfIndex, InterfaceFlags, Ipv4Addr, MacAddr, NodeIndex, SwIfIndex};

/// Direction a feature chain or combined counter applies to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Direction {
    Rx,
    Tx,
}

/// A physical port: driver class, device class, output/TX node, MAC, MTU.
/// `dev_class`/`hw_class` are out of scope (§1's NIC-driver non-goal) so this
/// only keeps the fields the scheduler/rewrite path actually consult.
pub struct HwInterface {
    pub name: String,
    pub mac: MacAddr,
    pub mtu: u16,
    pub output_node: NodeIndex,
    pub tx_node: NodeIndex,
    pub sw_if_index: SwIfIndex,
}

/// A logical interface; may be a VLAN sub-interface of a `HwInterface`.
pub struct SwInterface {
    pub hw_if_index: HwIfIndex,
    pub vlan_tag: Option<u16>,
    pub flags: InterfaceFlags,
    /// Feature-chain config index per direction, `None` until configured.
    pub feature_config: HashMap<Direction, String>,
}

/// Hook run on admin/link state transitions; the ARP subsystem uses
/// `link_up_down` to install its default input next-edges per interface.
pub type LinkUpDownCallback = Box<dyn FnMut(SwIfIndex, bool)>;

/// hw/sw interface pools, feature-chain registry, and counters — the
/// control-plane object every forwarding node reads interface state from.
pub struct InterfaceTable {
    hw: Vec<Option<HwInterface>>,
    sw: Vec<Option<SwInterface>>,
    hw_free: Vec<u32>,
    sw_free: Vec<u32>,
    /// `vnet_config_add_feature`/`del_feature`: reference-counted node
    /// sequences keyed by config string, e.g. `"source-check-via-rx,lookup"`.
    feature_chains: HashMap<String, (Vec<NodeIndex>, u32)>,
    link_up_down_callbacks: Vec<LinkUpDownCallback>,
    pub drop_counters: SimpleCounters,
    pub punt_counters: SimpleCounters,
    pub rx_counters: CombinedCounters,
    pub tx_counters: CombinedCounters,
    /// Addresses configured on any interface, consulted by `ip4-local`'s
    /// "is this address one of ours" destination check.
    local_addresses: HashMap<Ipv4Addr, SwIfIndex>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        InterfaceTable {
            hw: Vec::new(),
            sw: Vec::new(),
            hw_free: Vec::new(),
            sw_free: Vec::new(),
            feature_chains: HashMap::new(),
            link_up_down_callbacks: Vec::new(),
            drop_counters: SimpleCounters::new(),
            punt_counters: SimpleCounters::new(),
            rx_counters: CombinedCounters::new(),
            tx_counters: CombinedCounters::new(),
            local_addresses: HashMap::new(),
        }
    }

    /// `register_interface`: allocates a hw_interface and its owning
    /// sw_interface, reusing a previously deleted pair if one is free.
    pub fn register_interface(
        &mut self,
        name: impl Into<String>,
        mac: MacAddr,
        mtu: u16,
        output_node: NodeIndex,
        tx_node: NodeIndex,
    ) -> (HwIfIndex, SwIfIndex) {
        let sw_idx = if let Some(i) = self.sw_free.pop() {
            SwIfIndex::new(i)
        } else {
            let i = self.sw.len() as u32;
            self.sw.push(None);
            SwIfIndex::new(i)
        };
        let hw_idx = if let Some(i) = self.hw_free.pop() {
            HwIfIndex::new(i)
        } else {
            let i = self.hw.len() as u32;
            self.hw.push(None);
            HwIfIndex::new(i)
        };

        self.sw[sw_idx.as_usize()] = Some(SwInterface {
            hw_if_index: hw_idx,
            vlan_tag: None,
            flags: InterfaceFlags::empty(),
            feature_config: HashMap::new(),
        });
        self.hw[hw_idx.as_usize()] = Some(HwInterface {
            name: name.into(),
            mac,
            mtu,
            output_node,
            tx_node,
            sw_if_index: sw_idx,
        });
        info!(hw_if_index = hw_idx.0, sw_if_index = sw_idx.0, "interface registered");
        (hw_idx, sw_idx)
    }

    /// Allocates a VLAN sub-interface sharing `hw_if_index` with an already
    /// registered hw_interface. The new sw_interface is distinct from the
    /// hw_interface's primary `sw_if_index`, which is what makes it a
    /// sub-interface rather than the port's own logical interface.
    pub fn register_sub_interface(&mut self, hw_if_index: HwIfIndex, vlan_tag: u16) -> Option<SwIfIndex> {
        if self.hw(hw_if_index).is_none() {
            return None;
        }
        let sw_idx = if let Some(i) = self.sw_free.pop() {
            SwIfIndex::new(i)
        } else {
            let i = self.sw.len() as u32;
            self.sw.push(None);
            SwIfIndex::new(i)
        };
        self.sw[sw_idx.as_usize()] = Some(SwInterface {
            hw_if_index,
            vlan_tag: Some(vlan_tag),
            flags: InterfaceFlags::empty(),
            feature_config: HashMap::new(),
        });
        info!(hw_if_index = hw_if_index.0, sw_if_index = sw_idx.0, vlan_tag, "sub-interface registered");
        Some(sw_idx)
    }

    /// The owning hw_interface's primary sw_if_index, if `sw_if_index` names
    /// a sub-interface of it (i.e. isn't already that primary interface).
    fn parent_sw_if_index(&self, sw_if_index: SwIfIndex) -> Option<SwIfIndex> {
        let sw = self.sw(sw_if_index)?;
        let hw = self.hw(sw.hw_if_index)?;
        if hw.sw_if_index != sw_if_index {
            Some(hw.sw_if_index)
        } else {
            None
        }
    }

    pub fn hw(&self, idx: HwIfIndex) -> Option<&HwInterface> {
        self.hw.get(idx.as_usize()).and_then(|s| s.as_ref())
    }

    pub fn hw_mut(&mut self, idx: HwIfIndex) -> Option<&mut HwInterface> {
        self.hw.get_mut(idx.as_usize()).and_then(|s| s.as_mut())
    }

    pub fn sw(&self, idx: SwIfIndex) -> Option<&SwInterface> {
        self.sw.get(idx.as_usize()).and_then(|s| s.as_ref())
    }

    pub fn sw_mut(&mut self, idx: SwIfIndex) -> Option<&mut SwInterface> {
        self.sw.get_mut(idx.as_usize()).and_then(|s| s.as_mut())
    }

    pub fn register_link_up_down(&mut self, callback: LinkUpDownCallback) {
        self.link_up_down_callbacks.push(callback);
    }

    /// Admin-up/down: sets the flag and, if link state also actually
    /// changed, fires every `link_up_down` callback (the ARP subsystem's
    /// per-interface default-next-edge install runs from here).
    pub fn set_interface_flags(&mut self, idx: SwIfIndex, admin_up: bool) {
        let was_up;
        {
            let Some(sw) = self.sw_mut(idx) else { return };
            was_up = sw.flags.contains(InterfaceFlags::ADMIN_UP);
            sw.flags.set(InterfaceFlags::ADMIN_UP, admin_up);
            sw.flags.set(InterfaceFlags::LINK_UP, admin_up);
        }
        if was_up != admin_up {
            debug!(sw_if_index = idx.0, admin_up, "interface admin state changed");
            for cb in self.link_up_down_callbacks.iter_mut() {
                cb(idx, admin_up);
            }
        }
    }

    /// `vnet_config_add_feature`: bump the refcount of the config string's
    /// node sequence, creating it on first use.
    pub fn add_feature(
        &mut self,
        sw_if_index: SwIfIndex,
        direction: Direction,
        config: &str,
        nodes: Vec<NodeIndex>,
    ) {
        let entry = self
            .feature_chains
            .entry(config.to_string())
            .or_insert_with(|| (nodes, 0));
        entry.1 += 1;
        if let Some(sw) = self.sw_mut(sw_if_index) {
            sw.feature_config.insert(direction, config.to_string());
        }
    }

    /// `vnet_config_del_feature`: decrement the refcount, dropping the
    /// sequence entirely once no interface references it.
    pub fn del_feature(&mut self, sw_if_index: SwIfIndex, direction: Direction) {
        let Some(sw) = self.sw_mut(sw_if_index) else {
            return;
        };
        if let Some(config) = sw.feature_config.remove(&direction) {
            if let Some(entry) = self.feature_chains.get_mut(&config) {
                entry.1 -= 1;
                if entry.1 == 0 {
                    self.feature_chains.remove(&config);
                }
            }
        }
    }

    pub fn feature_chain(&self, sw_if_index: SwIfIndex, direction: Direction) -> &[NodeIndex] {
        self.sw(sw_if_index)
            .and_then(|sw| sw.feature_config.get(&direction))
            .and_then(|config| self.feature_chains.get(config))
            .map(|(nodes, _)| nodes.as_slice())
            .unwrap_or(&[])
    }

    /// §3.9: register `addr` as one of ours, consulted by `ip4-local`'s
    /// destination check. The covering-prefix/glean-route install (the
    /// other two legs of `set_interface_address`) lives in `ip4.rs`, which
    /// owns the FIB handle this table does not.
    pub fn add_local_address(&mut self, sw_if_index: SwIfIndex, addr: Ipv4Addr) {
        self.local_addresses.insert(addr, sw_if_index);
    }

    pub fn remove_local_address(&mut self, addr: Ipv4Addr) {
        self.local_addresses.remove(&addr);
    }

    pub fn is_local_address(&self, addr: Ipv4Addr) -> bool {
        self.local_addresses.contains_key(&addr)
    }

    /// Record one RX packet on `sw_if_index`, and also on its parent
    /// hw_interface's counter if `sw_if_index` is a sub-interface (spec
    /// SPEC_FULL §4.6: "sub-interfaces also increment their parent hw
    /// interface's counter").
    pub fn count_rx(&mut self, sw_if_index: SwIfIndex, n_bytes: u64) {
        self.rx_counters.increment(sw_if_index.as_usize(), n_bytes);
        if let Some(parent) = self.parent_sw_if_index(sw_if_index) {
            self.rx_counters.increment(parent.as_usize(), n_bytes);
        }
    }

    pub fn count_tx(&mut self, sw_if_index: SwIfIndex, n_bytes: u64) {
        self.tx_counters.increment(sw_if_index.as_usize(), n_bytes);
        if let Some(parent) = self.parent_sw_if_index(sw_if_index) {
            self.tx_counters.increment(parent.as_usize(), n_bytes);
        }
    }
}

impl Default for InterfaceTable {
    fn default() -> Self {
        Self::new()
    }
}
