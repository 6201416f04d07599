//! Per-packet conversation lookups.
//!
//! Decoders usually resolve conversations straight from the packet they are dissecting.
//! [PacketInfo] carries what the conversation table needs from a packet: the observation number,
//! the network and transport endpoints, the link context for deinterlacing, and an optional
//! override of the endpoints a decoder wants conversations keyed on.

use super::address::Address;
use super::deinterlace::LinkContext;
use super::element::{ConvKey, ConversationType, Element, PortType};
use super::options::{ConvOptions, SearchOptions};
use super::record::ConversationId;
use super::ConversationTable;

/// Endpoints a decoder keys its conversations on instead of the packet's own addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvEndpoints {
    /// Address/port tuple.
    AddrPort {
        addr1: Address,
        addr2: Address,
        kind: ConversationType,
        port1: u32,
        port2: u32,
    },
    /// Arbitrary key.
    Elements(ConvKey),
}

/// Conversation-relevant view of a packet.
#[derive(Debug, Clone, Default)]
pub struct PacketInfo {
    /// Observation number.
    pub num: u32,
    /// Network-layer source address.
    pub src: Address,
    /// Network-layer destination address.
    pub dst: Address,
    pub src_port: u32,
    pub dst_port: u32,
    /// Transport carrying `src_port` and `dst_port`.
    pub port_type: PortType,
    /// Link-layer context, used for deinterlacing.
    pub link: Option<LinkContext>,
    /// Endpoint override. The most recently set override wins.
    pub endpoints: Option<ConvEndpoints>,
}

impl PacketInfo {
    pub fn new(num: u32) -> Self {
        PacketInfo {
            num,
            ..Default::default()
        }
    }

    pub fn with_addresses(mut self, src: impl Into<Address>, dst: impl Into<Address>) -> Self {
        self.src = src.into();
        self.dst = dst.into();
        self
    }

    pub fn with_ports(mut self, port_type: PortType, src_port: u32, dst_port: u32) -> Self {
        self.port_type = port_type;
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    pub fn with_link(mut self, link: LinkContext) -> Self {
        self.link = Some(link);
        self
    }

    /// Conversation kind implied by the packet's port type.
    #[inline]
    pub fn conversation_type(&self) -> ConversationType {
        ConversationType::from_port_type(self.port_type)
    }

    /// Keys conversations of this packet on the given address/port tuple.
    pub fn set_endpoints(
        &mut self,
        addr1: &Address,
        addr2: &Address,
        kind: ConversationType,
        port1: u32,
        port2: u32,
    ) {
        self.endpoints = Some(ConvEndpoints::AddrPort {
            addr1: addr1.clone(),
            addr2: addr2.clone(),
            kind,
            port1,
            port2,
        });
    }

    /// Keys conversations of this packet on `key`.
    pub fn set_elements(&mut self, key: ConvKey) {
        self.endpoints = Some(ConvEndpoints::Elements(key));
    }

    /// Keys conversations of this packet on a bare numeric id.
    pub fn set_elements_by_id(&mut self, kind: ConversationType, id: u32) {
        self.set_elements(ConvKey::by_id(kind, id));
    }

    /// Returns the id set by [set_elements_by_id](PacketInfo::set_elements_by_id).
    ///
    /// Returns `0` if the override is not an id key, or if it was set for a different kind and
    /// `options` lacks [SearchOptions::UseLastEndpoint].
    pub fn id_from_elements(&self, kind: ConversationType, options: SearchOptions) -> u32 {
        let key = match &self.endpoints {
            Some(ConvEndpoints::Elements(key)) => key,
            _ => return 0,
        };
        match key.elements() {
            [Element::Uint(id), Element::Endpoint(ctype), ..] => {
                if *ctype != kind && !options.contains(SearchOptions::UseLastEndpoint) {
                    return 0;
                }
                *id
            }
            _ => 0,
        }
    }
}

impl ConversationTable {
    /// Finds the conversation of `pinfo` and advances its last observation to the packet.
    ///
    /// An endpoint override is looked up as set, with no wildcards. Otherwise the packet's own
    /// addresses and ports are resolved with `options`. Only the classic tables are searched:
    /// deinterlaced conversations are found through
    /// [find_conversation_pinfo_ro](ConversationTable::find_conversation_pinfo_ro) or
    /// [find_strat](ConversationTable::find_strat).
    pub fn find_conversation_pinfo(
        &mut self,
        pinfo: &PacketInfo,
        options: SearchOptions,
    ) -> Option<ConversationId> {
        let id = self.find_pinfo(pinfo, options, false)?;
        self.records[id.slot as usize].touch(pinfo.num);
        Some(id)
    }

    /// Like [find_conversation_pinfo](ConversationTable::find_conversation_pinfo), without
    /// advancing the last observation. Packets without an override are resolved through
    /// [find_strat](ConversationTable::find_strat), so deinterlaced conversations are found too.
    pub fn find_conversation_pinfo_ro(
        &mut self,
        pinfo: &PacketInfo,
        options: SearchOptions,
    ) -> Option<ConversationId> {
        self.find_pinfo(pinfo, options, true)
    }

    fn find_pinfo(
        &mut self,
        pinfo: &PacketInfo,
        options: SearchOptions,
        strat: bool,
    ) -> Option<ConversationId> {
        match &pinfo.endpoints {
            Some(ConvEndpoints::AddrPort {
                addr1,
                addr2,
                kind,
                port1,
                port2,
            }) => self.find_conversation(
                pinfo.num,
                addr1,
                addr2,
                *kind,
                *port1,
                *port2,
                SearchOptions::none(),
            ),
            Some(ConvEndpoints::Elements(key)) => self.find_conversation_full(pinfo.num, key),
            None if strat => self.find_strat(pinfo, pinfo.conversation_type(), options),
            None => self.find_conversation(
                pinfo.num,
                &pinfo.src,
                &pinfo.dst,
                pinfo.conversation_type(),
                pinfo.src_port,
                pinfo.dst_port,
                options,
            ),
        }
    }

    /// Finds the conversation of `pinfo`, creating it if there is none.
    ///
    /// Like [find_conversation_pinfo](ConversationTable::find_conversation_pinfo), this never
    /// deinterlaces; use [create_strat](ConversationTable::create_strat) for that.
    pub fn find_or_create_conversation(&mut self, pinfo: &PacketInfo) -> ConversationId {
        if let Some(id) = self.find_conversation_pinfo(pinfo, SearchOptions::none()) {
            return id;
        }
        log::debug!("No conversation for frame {}, creating one", pinfo.num);
        match &pinfo.endpoints {
            Some(ConvEndpoints::AddrPort {
                addr1,
                addr2,
                kind,
                port1,
                port2,
            }) => self.create_conversation(
                pinfo.num,
                addr1,
                addr2,
                *kind,
                *port1,
                *port2,
                ConvOptions::none(),
            ),
            Some(ConvEndpoints::Elements(key)) => {
                self.create_conversation_from_elements(pinfo.num, key.clone())
            }
            None => self.create_conversation(
                pinfo.num,
                &pinfo.src,
                &pinfo.dst,
                pinfo.conversation_type(),
                pinfo.src_port,
                pinfo.dst_port,
                ConvOptions::none(),
            ),
        }
    }

    /// Finds the conversation keyed by `id` as of `pinfo`, creating it if there is none.
    pub fn find_or_create_conversation_by_id(
        &mut self,
        pinfo: &PacketInfo,
        kind: ConversationType,
        id: u32,
    ) -> ConversationId {
        match self.find_conversation_by_id(pinfo.num, kind, id) {
            Some(conv) => conv,
            None => self.create_conversation_by_id(pinfo.num, kind, id),
        }
    }
}
