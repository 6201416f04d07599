//! Link deinterlacing.
//!
//! Captures that merge several links (interfaces, VLANs) can carry identical IP-layer tuples that
//! belong to unrelated conversations. The deinterlacer registers one record per link-identifying
//! tuple and hands out its creation index as an *anchor*. Deinterlaced conversations carry the
//! anchor as an extra key element, which partitions the IP-layer key space per link.

use super::address::Address;
use super::element::{ConvKey, ConversationType, Element};
use super::options::ConvOptions;
use super::packet::PacketInfo;
use super::record::ConversationId;
use super::store::builtin;
use super::ConversationTable;

use bitmask_enum::bitmask;

/// Link fields that distinguish deinterlaced conversations.
#[bitmask(u32)]
#[bitmask_config(vec_debug)]
pub enum DeinterlaceKey {
    /// Capture interface identifier.
    Interface,
    /// 802.1Q VLAN identifier.
    Vlan,
}

/// Link-layer context of a packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkContext {
    /// Link-layer source address.
    pub dl_src: Address,
    /// Link-layer destination address.
    pub dl_dst: Address,
    /// Capture interface, if the capture records one.
    pub interface_id: Option<u32>,
    /// VLAN id, `0` when untagged.
    pub vlan_id: u32,
}

impl LinkContext {
    pub fn new(dl_src: impl Into<Address>, dl_dst: impl Into<Address>) -> Self {
        LinkContext {
            dl_src: dl_src.into(),
            dl_dst: dl_dst.into(),
            interface_id: None,
            vlan_id: 0,
        }
    }

    pub fn with_interface(mut self, interface_id: u32) -> Self {
        self.interface_id = Some(interface_id);
        self
    }

    pub fn with_vlan(mut self, vlan_id: u32) -> Self {
        self.vlan_id = vlan_id;
        self
    }

    /// Deinterlacer kind and the two link keys used for this link under `key`.
    ///
    /// The interface id is used only if it is both configured and present; the VLAN id only if it
    /// is configured and non-zero. Unused keys are `0`.
    pub fn deinterlacer_kind(&self, key: DeinterlaceKey) -> (ConversationType, u32, u32) {
        let use_vlan = key.contains(DeinterlaceKey::Vlan) && self.vlan_id > 0;
        match self.interface_id {
            Some(iface) if key.contains(DeinterlaceKey::Interface) => {
                if use_vlan {
                    (ConversationType::EthIV, iface, self.vlan_id)
                } else {
                    (ConversationType::EthIN, iface, 0)
                }
            }
            _ => {
                if use_vlan {
                    (ConversationType::EthNV, 0, self.vlan_id)
                } else {
                    (ConversationType::EthNN, 0, 0)
                }
            }
        }
    }
}

/// `address,address,uint,uint,uint,endpoint`
fn link_key(
    addr1: &Address,
    addr2: &Address,
    kind: ConversationType,
    key1: u32,
    key2: u32,
    key3: u32,
) -> ConvKey {
    ConvKey::from_raw(vec![
        Element::Address(addr1.clone()),
        Element::Address(addr2.clone()),
        Element::Uint(key1),
        Element::Uint(key2),
        Element::Uint(key3),
        Element::Endpoint(kind),
    ])
}

/// Anchored key: `address,address,port,port,uint,endpoint`, or `address,address,uint,endpoint`
/// without ports.
pub(crate) fn anchored_key(
    addr1: &Address,
    addr2: &Address,
    kind: ConversationType,
    ports: Option<(u32, u32)>,
    anchor: u32,
) -> ConvKey {
    let mut elements = vec![
        Element::Address(addr1.clone()),
        Element::Address(addr2.clone()),
    ];
    if let Some((port1, port2)) = ports {
        elements.push(Element::Port(port1));
        elements.push(Element::Port(port2));
    }
    elements.push(Element::Uint(anchor));
    elements.push(Element::Endpoint(kind));
    ConvKey::from_raw(elements)
}

impl ConversationTable {
    /// Registers the link identified by the given tuple, returning its record.
    ///
    /// Registering a tuple that is already registered in the same direction returns the existing
    /// record: the one in effect at `frame`, or the earliest one if `frame` predates them all. The anchor of a link is the [index](ConversationId::index) of its record.
    #[allow(clippy::too_many_arguments)]
    pub fn register_link(
        &mut self,
        frame: u32,
        addr1: &Address,
        addr2: &Address,
        kind: ConversationType,
        key1: u32,
        key2: u32,
        key3: u32,
    ) -> ConversationId {
        let key = link_key(addr1, addr2, kind, key1, key2, key3);
        let existing = self
            .lookup(builtin::DEINTERLACER, frame, &key)
            .or_else(|| self.registry.table(builtin::DEINTERLACER).head(&key));
        if let Some(slot) = existing {
            return self.id(slot);
        }
        let slot = self.alloc(frame, key, ConvOptions::none());
        log::debug!(
            "Registered {} link {} <-> {} ({}, {}, {}) as anchor {}",
            kind,
            addr1,
            addr2,
            key1,
            key2,
            key3,
            slot
        );
        self.id(slot)
    }

    /// Finds the link record for the tuple in either direction, preferring the more recently
    /// registered one if both exist.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve_link(
        &mut self,
        frame: u32,
        addr1: &Address,
        addr2: &Address,
        kind: ConversationType,
        key1: u32,
        key2: u32,
        key3: u32,
    ) -> Option<ConversationId> {
        let fwd = link_key(addr1, addr2, kind, key1, key2, key3);
        let rev = link_key(addr2, addr1, kind, key1, key2, key3);
        self.lookup_either(builtin::DEINTERLACER, frame, &fwd, &rev)
            .map(|slot| self.id(slot))
    }

    /// Registers the link `pinfo` was observed on, using the configured deinterlacing key.
    ///
    /// Returns `None` if deinterlacing is disabled or the packet carries no link context.
    pub fn register_link_for(&mut self, pinfo: &PacketInfo) -> Option<ConversationId> {
        if !self.deinterlacing_enabled() {
            return None;
        }
        let link = pinfo.link.as_ref()?;
        if let Some(id) = self.resolve_link_for(pinfo) {
            return Some(id);
        }
        let (kind, key1, key2) = link.deinterlacer_kind(self.deinterlace_key);
        Some(self.register_link(pinfo.num, &link.dl_src, &link.dl_dst, kind, key1, key2, 0))
    }

    /// Resolves the link `pinfo` was observed on, using the configured deinterlacing key.
    pub fn resolve_link_for(&mut self, pinfo: &PacketInfo) -> Option<ConversationId> {
        if !self.deinterlacing_enabled() {
            return None;
        }
        let link = pinfo.link.as_ref()?;
        let (kind, key1, key2) = link.deinterlacer_kind(self.deinterlace_key);
        self.resolve_link(pinfo.num, &link.dl_src, &link.dl_dst, kind, key1, key2, 0)
    }

    /// Creates a conversation partitioned by the link `anchor`.
    ///
    /// The key holds both addresses, both ports unless `options` has [ConvOptions::NoPorts], and
    /// the anchor. Wildcard options are recorded but do not shape the key.
    #[allow(clippy::too_many_arguments)]
    pub fn create_deinterlaced(
        &mut self,
        frame: u32,
        addr1: &Address,
        addr2: &Address,
        kind: ConversationType,
        port1: u32,
        port2: u32,
        anchor: u32,
        options: ConvOptions,
    ) -> ConversationId {
        let ports = if options.contains(ConvOptions::NoPorts) {
            None
        } else {
            Some((port1, port2))
        };
        let key = anchored_key(addr1, addr2, kind, ports, anchor);
        let slot = self.alloc(frame, key, options);
        log::debug!(
            "Created deinterlaced conversation {} on anchor {}: {}",
            slot,
            anchor,
            self.records[slot as usize].key
        );
        self.id(slot)
    }
}
