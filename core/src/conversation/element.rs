//! Conversation keys.
//!
//! A key is a short ordered list of typed [Element]s terminated by an [Element::Endpoint] that
//! carries the [ConversationType]. Keys of different layouts never compare equal: the store
//! buckets them by [shape](ConvKey::shape_name) before any value comparison happens.

use super::address::Address;

use std::fmt;
use std::hash::{Hash, Hasher};

use itertools::Itertools;
use strum_macros::Display;
use thiserror::Error;

/// Maximum number of elements in a key, including the terminating endpoint.
pub const MAX_CONVERSATION_ELEMENTS: usize = 8;

/// Element slots of address/port keys. The full (exact) layout is
/// `address,port,address,port,endpoint`; wildcarded layouts drop the second address and/or port.
pub(crate) const ADDR1_IDX: usize = 0;
pub(crate) const PORT1_IDX: usize = 1;
pub(crate) const ADDR2_IDX: usize = 2;
pub(crate) const PORT2_IDX: usize = 3;
pub(crate) const PORT2_NO_ADDR2_IDX: usize = 2;
pub(crate) const EXACT_IDX_COUNT: usize = 5;

/// Type tag of a key element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ElementKind {
    #[strum(serialize = "endpoint")]
    Endpoint,
    #[strum(serialize = "address")]
    Address,
    #[strum(serialize = "port")]
    Port,
    #[strum(serialize = "string")]
    String,
    #[strum(serialize = "uint")]
    Uint,
    #[strum(serialize = "uint64")]
    Uint64,
    #[strum(serialize = "int")]
    Int,
    #[strum(serialize = "int64")]
    Int64,
    #[strum(serialize = "blob")]
    Blob,
}

/// The kind of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConversationType {
    None,
    Sctp,
    Tcp,
    Udp,
    Dccp,
    Ipx,
    Ncp,
    /// Fibre Channel exchange.
    Exchg,
    Ddp,
    Sbccs,
    Idp,
    Tipc,
    Usb,
    I2c,
    /// InfiniBand queue pair.
    Ibqp,
    Bluetooth,
    IwarpMpa,
    Mctp,
    Log,
    Ip,
    /// Deinterlacer: Ethernet, no interface id, no VLAN.
    #[strum(serialize = "eth_nn")]
    EthNN,
    /// Deinterlacer: Ethernet, no interface id, VLAN.
    #[strum(serialize = "eth_nv")]
    EthNV,
    /// Deinterlacer: Ethernet, interface id, no VLAN.
    #[strum(serialize = "eth_in")]
    EthIN,
    /// Deinterlacer: Ethernet, interface id and VLAN.
    #[strum(serialize = "eth_iv")]
    EthIV,
    /// Decoder-defined kind.
    Custom(u32),
}

const CUSTOM_BASE: u32 = 0x0001_0000;

impl ConversationType {
    /// Raw discriminator, used for hashing.
    pub fn raw(&self) -> u32 {
        match self {
            ConversationType::None => 0,
            ConversationType::Sctp => 1,
            ConversationType::Tcp => 2,
            ConversationType::Udp => 3,
            ConversationType::Dccp => 4,
            ConversationType::Ipx => 5,
            ConversationType::Ncp => 6,
            ConversationType::Exchg => 7,
            ConversationType::Ddp => 8,
            ConversationType::Sbccs => 9,
            ConversationType::Idp => 10,
            ConversationType::Tipc => 11,
            ConversationType::Usb => 12,
            ConversationType::I2c => 13,
            ConversationType::Ibqp => 14,
            ConversationType::Bluetooth => 15,
            ConversationType::IwarpMpa => 16,
            ConversationType::Mctp => 17,
            ConversationType::Log => 18,
            ConversationType::Ip => 19,
            ConversationType::EthNN => 20,
            ConversationType::EthNV => 21,
            ConversationType::EthIN => 22,
            ConversationType::EthIV => 23,
            ConversationType::Custom(n) => CUSTOM_BASE.wrapping_add(*n),
        }
    }

    /// Returns `true` for kinds without a handshake. Conversations of these kinds never have
    /// wildcarded endpoints filled in, and templates of these kinds are never spawned from.
    #[inline]
    pub fn is_connectionless(&self) -> bool {
        matches!(self, ConversationType::Udp)
    }

    /// Returns `false` for kinds whose identifiers are never swapped between directions, so that
    /// a reversed fully-wildcarded lookup could land on an unrelated conversation.
    #[inline]
    pub fn allows_reverse_lookup(&self) -> bool {
        !matches!(self, ConversationType::Ibqp)
    }

    /// Maps a packet's transport port type to its conversation kind.
    pub fn from_port_type(pt: PortType) -> Self {
        match pt {
            PortType::None => ConversationType::None,
            PortType::Sctp => ConversationType::Sctp,
            PortType::Tcp => ConversationType::Tcp,
            PortType::Udp => ConversationType::Udp,
            PortType::Dccp => ConversationType::Dccp,
            PortType::Ipx => ConversationType::Ipx,
            PortType::Ddp => ConversationType::Ddp,
            PortType::Idp => ConversationType::Idp,
            PortType::Usb => ConversationType::Usb,
            PortType::I2c => ConversationType::I2c,
            PortType::Ibqp => ConversationType::Ibqp,
            PortType::Bluetooth => ConversationType::Bluetooth,
            PortType::IwarpMpa => ConversationType::IwarpMpa,
            PortType::Mctp => ConversationType::Mctp,
        }
    }
}

/// Transport port type of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PortType {
    #[default]
    None,
    Sctp,
    Tcp,
    Udp,
    Dccp,
    Ipx,
    Ddp,
    Idp,
    Usb,
    I2c,
    Ibqp,
    Bluetooth,
    IwarpMpa,
    Mctp,
}

/// A single typed key element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Address(Address),
    Port(u32),
    String(String),
    Uint(u32),
    Uint64(u64),
    Int(i32),
    Int64(i64),
    Blob(Vec<u8>),
    /// Terminates every key.
    Endpoint(ConversationType),
}

impl Element {
    /// Returns the type tag of the element.
    pub fn kind(&self) -> ElementKind {
        match self {
            Element::Address(_) => ElementKind::Address,
            Element::Port(_) => ElementKind::Port,
            Element::String(_) => ElementKind::String,
            Element::Uint(_) => ElementKind::Uint,
            Element::Uint64(_) => ElementKind::Uint64,
            Element::Int(_) => ElementKind::Int,
            Element::Int64(_) => ElementKind::Int64,
            Element::Blob(_) => ElementKind::Blob,
            Element::Endpoint(_) => ElementKind::Endpoint,
        }
    }

    /// Folds the element's bytes into a running one-at-a-time hash.
    fn hash_into(&self, hash: u32) -> u32 {
        match self {
            Element::Address(addr) => addr.with_bytes(|b| oaat_add(hash, b)),
            Element::Port(port) => oaat_add(hash, &port.to_ne_bytes()),
            Element::String(s) => {
                let hash = oaat_add(hash, &(s.len() as u32).to_ne_bytes());
                oaat_add(hash, s.as_bytes())
            }
            Element::Uint(v) => oaat_add(hash, &v.to_ne_bytes()),
            Element::Uint64(v) => oaat_add(hash, &v.to_ne_bytes()),
            Element::Int(v) => oaat_add(hash, &v.to_ne_bytes()),
            Element::Int64(v) => oaat_add(hash, &v.to_ne_bytes()),
            Element::Blob(data) => {
                let hash = oaat_add(hash, &(data.len() as u32).to_ne_bytes());
                oaat_add(hash, data)
            }
            Element::Endpoint(ctype) => oaat_add(hash, &ctype.raw().to_ne_bytes()),
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Address(addr) => write!(f, "address={}", addr),
            Element::Port(port) => write!(f, "port={}", port),
            Element::String(s) => write!(f, "string={}", s),
            Element::Uint(v) => write!(f, "uint={}", v),
            Element::Uint64(v) => write!(f, "uint64={}", v),
            Element::Int(v) => write!(f, "int={}", v),
            Element::Int64(v) => write!(f, "int64={}", v),
            Element::Blob(data) => {
                write!(f, "blob=")?;
                for b in data {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Element::Endpoint(ctype) => write!(f, "endpoint={}", ctype),
        }
    }
}

/// Malformed key.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("key has no endpoint element")]
    MissingEndpoint,

    #[error("key exceeds {} elements", MAX_CONVERSATION_ELEMENTS)]
    TooManyElements,

    #[error("key contains only an endpoint element")]
    EndpointOnly,

    #[error("string element contains a NUL byte")]
    NulInString,
}

/// Returns the number of elements in `elements` up to and including the terminating endpoint.
pub fn count_elements(elements: &[Element]) -> Result<usize, KeyError> {
    let mut count = 0;
    loop {
        match elements.get(count) {
            Some(Element::Endpoint(_)) => break,
            Some(_) => {
                count += 1;
                if count >= MAX_CONVERSATION_ELEMENTS {
                    return Err(KeyError::TooManyElements);
                }
            }
            None => return Err(KeyError::MissingEndpoint),
        }
    }
    count += 1;
    if count < 2 {
        return Err(KeyError::EndpointOnly);
    }
    Ok(count)
}

/// A conversation key.
///
/// Equality and hashing stop at the terminating endpoint element.
#[derive(Debug, Clone)]
pub struct ConvKey(Vec<Element>);

impl ConvKey {
    /// Creates a key from `elements`.
    ///
    /// # Panics
    ///
    /// Panics if the elements do not form a valid key; see [ConvKey::try_new].
    pub fn new(elements: Vec<Element>) -> Self {
        match Self::try_new(elements) {
            Ok(key) => key,
            Err(e) => panic!("invalid conversation key: {}", e),
        }
    }

    /// Creates a key from `elements`, which must contain at least one data element followed by an
    /// endpoint within [MAX_CONVERSATION_ELEMENTS]. Elements after the endpoint are dropped.
    pub fn try_new(mut elements: Vec<Element>) -> Result<Self, KeyError> {
        let count = count_elements(&elements)?;
        elements.truncate(count);
        if elements
            .iter()
            .any(|e| matches!(e, Element::String(s) if s.as_bytes().contains(&0)))
        {
            return Err(KeyError::NulInString);
        }
        Ok(ConvKey(elements))
    }

    /// Single-identifier key: `uint,endpoint`.
    pub fn by_id(ctype: ConversationType, id: u32) -> Self {
        ConvKey(vec![Element::Uint(id), Element::Endpoint(ctype)])
    }

    /// Builds a key the crate already knows to be well-formed.
    #[inline]
    pub(crate) fn from_raw(elements: Vec<Element>) -> Self {
        debug_assert!(count_elements(&elements).is_ok());
        ConvKey(elements)
    }

    /// Returns the key's elements.
    #[inline]
    pub fn elements(&self) -> &[Element] {
        &self.0
    }

    /// Number of elements including the endpoint.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Keys are never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns the conversation type carried by the endpoint.
    pub fn conversation_type(&self) -> ConversationType {
        match self.0.iter().find_map(|e| match e {
            Element::Endpoint(ctype) => Some(*ctype),
            _ => None,
        }) {
            Some(ctype) => ctype,
            None => panic!("conversation key without endpoint"),
        }
    }

    /// Canonical name of the key's layout, e.g. `address,port,address,port,endpoint`.
    pub fn shape_name(&self) -> String {
        self.0.iter().map(|e| e.kind()).join(",")
    }

    /// One-at-a-time hash over each element's bytes, finalized with the standard avalanche.
    pub fn oaat_hash(&self) -> u32 {
        let mut hash = 0u32;
        for element in self.0.iter() {
            hash = element.hash_into(hash);
            if let Element::Endpoint(_) = element {
                break;
            }
        }
        hash = hash.wrapping_add(hash << 3);
        hash ^= hash >> 11;
        hash = hash.wrapping_add(hash << 15);
        hash
    }

    /// Element-wise comparison. A type mismatch at any position is inequality; reaching equal
    /// endpoints is equality.
    pub fn matches(&self, other: &ConvKey) -> bool {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            if a.kind() != b.kind() {
                return false;
            }
            match (a, b) {
                (Element::Endpoint(x), Element::Endpoint(y)) => return x == y,
                _ => {
                    if a != b {
                        return false;
                    }
                }
            }
        }
        false
    }

    fn is_addr_port(&self) -> bool {
        matches!(
            (self.0.get(ADDR1_IDX), self.0.get(PORT1_IDX)),
            (Some(Element::Address(_)), Some(Element::Port(_)))
        )
    }

    /// `address,port,port,endpoint`
    pub(crate) fn is_no_addr2(&self) -> bool {
        self.is_addr_port()
            && matches!(self.0.get(PORT2_NO_ADDR2_IDX), Some(Element::Port(_)))
            && matches!(self.0.get(3), Some(Element::Endpoint(_)))
    }

    /// `address,port,address,endpoint`
    pub(crate) fn is_no_port2(&self) -> bool {
        self.is_addr_port()
            && matches!(self.0.get(ADDR2_IDX), Some(Element::Address(_)))
            && matches!(self.0.get(3), Some(Element::Endpoint(_)))
    }

    /// `address,port,endpoint`
    pub(crate) fn is_no_addr2_port2(&self) -> bool {
        self.is_addr_port() && matches!(self.0.get(2), Some(Element::Endpoint(_)))
    }

    /// First address, or the null address if the key has none.
    pub fn addr1(&self) -> &Address {
        match self.0.get(ADDR1_IDX) {
            Some(Element::Address(addr)) => addr,
            _ => &NULL_ADDRESS,
        }
    }

    /// First port of an address/port key, or `0`.
    pub fn port1(&self) -> u32 {
        match (self.0.get(ADDR1_IDX), self.0.get(PORT1_IDX)) {
            (Some(Element::Address(_)), Some(Element::Port(port))) => *port,
            _ => 0,
        }
    }

    /// Second address of an address/port key, or the null address.
    pub fn addr2(&self) -> &Address {
        if !self.is_addr_port() {
            return &NULL_ADDRESS;
        }
        match self.0.get(ADDR2_IDX) {
            Some(Element::Address(addr)) => addr,
            _ => &NULL_ADDRESS,
        }
    }

    /// Second port of an address/port key, or `0`.
    pub fn port2(&self) -> u32 {
        if !self.is_addr_port() {
            return 0;
        }
        match (self.0.get(ADDR2_IDX), self.0.get(PORT2_IDX)) {
            (Some(Element::Address(_)), Some(Element::Port(port))) => *port,
            (Some(Element::Port(port)), _) => *port,
            _ => 0,
        }
    }

    /// Fills in the second address: `address,port[,port],endpoint` becomes
    /// `address,port,address[,port],endpoint`.
    pub(crate) fn insert_addr2(&mut self, addr: Address) {
        self.0.insert(ADDR2_IDX, Element::Address(addr));
    }

    /// Fills in the second port just before the endpoint.
    pub(crate) fn insert_port2(&mut self, port: u32) {
        let endpoint = self.0.len() - 1;
        self.0.insert(endpoint, Element::Port(port));
    }
}

static NULL_ADDRESS: Address = Address::None;

impl PartialEq for ConvKey {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl Eq for ConvKey {}

impl Hash for ConvKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.oaat_hash());
    }
}

impl fmt::Display for ConvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().join(","))
    }
}

/// One step of the one-at-a-time hash over `bytes`.
#[inline]
pub(crate) fn oaat_add(mut hash: u32, bytes: &[u8]) -> u32 {
    for &b in bytes {
        hash = hash.wrapping_add(b as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash
}
