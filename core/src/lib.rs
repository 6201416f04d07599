//! A conversation tracking engine for packet dissection.
//!
//! Protocol decoders observe packets one at a time and need to know which logical exchange a
//! packet belongs to, so that state gathered from earlier packets (negotiated parameters, the
//! dissector chosen for the payload) is available when later packets, including replies, arrive.
//! This crate groups packets into *conversations* keyed on typed tuples of addresses, ports and
//! protocol identifiers, and lets decoders attach data and dissectors to them.
//!
//! The engine supports:
//!
//! - Arbitrary key layouts, bucketed by shape, alongside the common address/port tuple
//! - Temporal versioning: the same tuple can resolve to different conversations at different
//!   observations, including when records are created out of order
//! - Wildcard endpoints that are filled in by the first matching packet, and templates that spawn
//!   a fresh conversation per concrete endpoint
//! - Deinterlacing of captures that merge several links, keyed on interface and/or VLAN ids
//!
//! The following example creates a conversation for a TCP request and resolves its reply:
//!
//! ```rust
//! use convtrack_core::config::default_config;
//! use convtrack_core::conversation::{
//!     Address, ConvOptions, ConversationTable, ConversationType, SearchOptions,
//! };
//! use std::net::Ipv4Addr;
//!
//! let client = Address::from(Ipv4Addr::new(10, 0, 0, 1));
//! let server = Address::from(Ipv4Addr::new(10, 0, 0, 2));
//!
//! let cfg = default_config();
//! let mut table = ConversationTable::new(&cfg.conversation);
//! let conv = table.create_conversation(
//!     1,
//!     &client,
//!     &server,
//!     ConversationType::Tcp,
//!     40000,
//!     443,
//!     ConvOptions::none(),
//! );
//! let reply = table.find_conversation(
//!     2,
//!     &server,
//!     &client,
//!     ConversationType::Tcp,
//!     443,
//!     40000,
//!     SearchOptions::none(),
//! );
//! assert_eq!(reply, Some(conv));
//! ```

pub mod config;
pub mod conversation;

pub use self::conversation::{
    Address, ConvKey, ConvOptions, Conversation, ConversationId, ConversationTable,
    ConversationType, DissectorHandle, Element, PacketInfo, SearchOptions,
};
