//! Conversation tracking.
//!
//! A [ConversationTable] groups observations (packets) into conversations: logical bidirectional
//! exchanges between two endpoints, identified by a typed [ConvKey]. Keys are bucketed by shape in
//! a process-wide [ShapeRegistry]; within a shape, every key maps to a version chain of the
//! conversations that used it over time, so the same endpoint pair can resolve to different
//! conversations at different observations.
//!
//! Decoders typically call [find_or_create_conversation](ConversationTable::find_or_create_conversation)
//! once per packet and then attach protocol data or a dissector to the returned conversation:
//!
//! ```
//! use convtrack_core::config::default_config;
//! use convtrack_core::conversation::{ConversationTable, PacketInfo, PortType};
//! use std::net::Ipv4Addr;
//!
//! let config = default_config();
//! let mut table = ConversationTable::new(&config.conversation);
//!
//! let request = PacketInfo::new(1)
//!     .with_addresses(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
//!     .with_ports(PortType::Tcp, 40000, 80);
//! let conv = table.find_or_create_conversation(&request);
//! table.conversation_mut(conv).add_proto_data(6, String::from("GET /"));
//!
//! let reply = PacketInfo::new(2)
//!     .with_addresses(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1))
//!     .with_ports(PortType::Tcp, 80, 40000);
//! assert_eq!(table.find_or_create_conversation(&reply), conv);
//! ```

pub mod address;
mod chain;
pub mod deinterlace;
pub mod element;
pub mod options;
pub mod packet;
pub mod record;
mod resolver;
pub mod store;

pub use self::address::Address;
pub use self::chain::ChainError;
pub use self::deinterlace::{DeinterlaceKey, LinkContext};
pub use self::element::{
    ConvKey, ConversationType, Element, ElementKind, KeyError, PortType, MAX_CONVERSATION_ELEMENTS,
};
pub use self::options::{ConvOptions, SearchOptions};
pub use self::packet::{ConvEndpoints, PacketInfo};
pub use self::record::{Conversation, ConversationId, DissectorHandle};
pub use self::store::{ShapeId, ShapeRegistry};

use self::element::EXACT_IDX_COUNT;
use self::store::builtin;
use crate::config::ConversationConfig;

use std::any::Any;

/// Conversation state for one analysis session.
///
/// Records are never freed individually: they live in an arena that is torn down as a whole by
/// [reset](ConversationTable::reset). The [ShapeRegistry] outlives sessions and can be moved
/// between tables with [with_registry](ConversationTable::with_registry) and
/// [into_registry](ConversationTable::into_registry).
#[derive(Debug)]
pub struct ConversationTable {
    /// Link fields used by the deinterlacer. Empty disables it.
    deinterlace_key: DeinterlaceKey,
    /// Panic instead of warning when a record is missing from its chain.
    strict_remove: bool,
    /// Shapes and their chains.
    registry: ShapeRegistry,
    /// Session arena, indexed by creation order.
    records: Vec<Conversation>,
    /// Bumped on every reset to detect stale ids.
    generation: u32,
}

impl ConversationTable {
    /// Creates a table with a fresh shape registry.
    pub fn new(config: &ConversationConfig) -> Self {
        Self::with_registry(config, ShapeRegistry::new())
    }

    /// Creates a table that stores its chains in an existing `registry`.
    ///
    /// Any chains left in the registry by a previous session are dropped.
    pub fn with_registry(config: &ConversationConfig, mut registry: ShapeRegistry) -> Self {
        registry.clear_chains();
        ConversationTable {
            deinterlace_key: config.deinterlacing_key(),
            strict_remove: config.strict_remove,
            registry,
            records: Vec::with_capacity(config.initial_capacity),
            generation: 0,
        }
    }

    /// Consumes the table, returning its registry with all chains dropped.
    pub fn into_registry(mut self) -> ShapeRegistry {
        self.registry.clear_chains();
        self.registry
    }

    /// Ends the current session.
    ///
    /// Drops every conversation along with its side tables and restarts creation indices at 0.
    /// Registered shapes are kept. Ids handed out before the reset become stale.
    pub fn reset(&mut self) {
        log::info!(
            "Resetting conversation table: {} conversations, {} shapes",
            self.records.len(),
            self.registry.len()
        );
        self.records.clear();
        self.registry.clear_chains();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Number of conversations created in this session, deinterlacer records included.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns `true` if deinterlacing is configured.
    #[inline]
    pub fn deinterlacing_enabled(&self) -> bool {
        !self.deinterlace_key.is_none()
    }

    /// Read access to the shape registry.
    #[inline]
    pub fn registry(&self) -> &ShapeRegistry {
        &self.registry
    }

    /// Registered shape names with the number of chains stored under each.
    pub fn shapes(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.registry.shapes()
    }

    /* ------------------------------------------------------------------------------ */

    /// Returns the conversation for `id`, or `None` if the id is stale.
    pub fn get(&self, id: ConversationId) -> Option<&Conversation> {
        if id.generation != self.generation {
            return None;
        }
        self.records.get(id.slot as usize)
    }

    /// Mutable variant of [get](ConversationTable::get).
    pub fn get_mut(&mut self, id: ConversationId) -> Option<&mut Conversation> {
        if id.generation != self.generation {
            return None;
        }
        self.records.get_mut(id.slot as usize)
    }

    /// Returns the conversation for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was issued before the last [reset](ConversationTable::reset).
    pub fn conversation(&self, id: ConversationId) -> &Conversation {
        let slot = self.slot(id);
        &self.records[slot as usize]
    }

    /// Mutable variant of [conversation](ConversationTable::conversation).
    pub fn conversation_mut(&mut self, id: ConversationId) -> &mut Conversation {
        let slot = self.slot(id);
        &mut self.records[slot as usize]
    }

    /// Ids of the version chain `id` belongs to, from head to tail.
    pub fn chain(&self, id: ConversationId) -> Vec<ConversationId> {
        let key = &self.conversation(id).key;
        match self.registry.find_shape(key) {
            Some(shape) => self
                .registry
                .table(shape)
                .walk(&self.records, key)
                .into_iter()
                .map(|slot| self.id(slot))
                .collect(),
            None => vec![],
        }
    }

    /* ------------------------------------------------------------------------------ */

    /// Creates an address/port conversation set up at `frame`.
    ///
    /// `options` decides which of the second address and port are wildcards and therefore left
    /// out of the key, or keys on the two addresses alone with [ConvOptions::NoPorts].
    ///
    /// # Panics
    ///
    /// Panics if `options` combines `NoPorts` with any second-endpoint wildcard.
    #[allow(clippy::too_many_arguments)]
    pub fn create_conversation(
        &mut self,
        frame: u32,
        addr1: &Address,
        addr2: &Address,
        kind: ConversationType,
        port1: u32,
        port2: u32,
        options: ConvOptions,
    ) -> ConversationId {
        options.check();
        let mut elements = Vec::with_capacity(EXACT_IDX_COUNT);
        elements.push(Element::Address(addr1.clone()));
        if !options.contains(ConvOptions::NoPorts) {
            elements.push(Element::Port(port1));
        }
        if options.contains(ConvOptions::NoAddr2) {
            if !options.port2_wildcarded() {
                elements.push(Element::Port(port2));
            }
        } else {
            elements.push(Element::Address(addr2.clone()));
            if !options.port2_wildcarded() && !options.contains(ConvOptions::NoPorts) {
                elements.push(Element::Port(port2));
            }
        }
        elements.push(Element::Endpoint(kind));

        let slot = self.alloc(frame, ConvKey::from_raw(elements), options);
        log::debug!(
            "Created conversation {} at frame {}: {}",
            slot,
            frame,
            self.records[slot as usize].key
        );
        self.id(slot)
    }

    /// Creates a conversation keyed by a bare numeric session id.
    pub fn create_conversation_by_id(
        &mut self,
        frame: u32,
        kind: ConversationType,
        id: u32,
    ) -> ConversationId {
        let slot = self.alloc(frame, ConvKey::by_id(kind, id), ConvOptions::none());
        self.id(slot)
    }

    /// Creates a conversation with an arbitrary key.
    pub fn create_conversation_from_elements(&mut self, frame: u32, key: ConvKey) -> ConversationId {
        let slot = self.alloc(frame, key, ConvOptions::none());
        self.id(slot)
    }

    /// Finds the conversation keyed by `id` that was established by `frame`.
    pub fn find_conversation_by_id(
        &mut self,
        frame: u32,
        kind: ConversationType,
        id: u32,
    ) -> Option<ConversationId> {
        let key = ConvKey::by_id(kind, id);
        self.lookup(builtin::ID, frame, &key)
            .map(|slot| self.id(slot))
    }

    /// Finds the conversation with exactly `key` that was established by `frame`.
    pub fn find_conversation_full(&mut self, frame: u32, key: &ConvKey) -> Option<ConversationId> {
        let shape = self.registry.find_shape(key)?;
        self.lookup(shape, frame, key).map(|slot| self.id(slot))
    }

    /* ------------------------------------------------------------------------------ */

    /// Attaches `data` for protocol `proto` to a conversation.
    pub fn add_proto_data<T: Any>(&mut self, id: ConversationId, proto: i32, data: T) {
        self.conversation_mut(id).add_proto_data(proto, data)
    }

    /// Returns the data attached to a conversation for `proto`.
    pub fn proto_data<T: Any>(&self, id: ConversationId, proto: i32) -> Option<&T> {
        self.conversation(id).proto_data(proto)
    }

    pub fn proto_data_mut<T: Any>(&mut self, id: ConversationId, proto: i32) -> Option<&mut T> {
        self.conversation_mut(id).proto_data_mut(proto)
    }

    pub fn delete_proto_data(&mut self, id: ConversationId, proto: i32) {
        self.conversation_mut(id).delete_proto_data(proto)
    }

    /// Assigns a dissector to a conversation from `start_frame` onwards.
    pub fn set_dissector_from(
        &mut self,
        id: ConversationId,
        start_frame: u32,
        handle: DissectorHandle,
    ) {
        self.conversation_mut(id)
            .set_dissector_from(start_frame, handle)
    }

    pub fn set_dissector(&mut self, id: ConversationId, handle: DissectorHandle) {
        self.conversation_mut(id).set_dissector(handle)
    }

    /// Returns the dissector a conversation uses at `frame`.
    pub fn dissector(&self, id: ConversationId, frame: u32) -> Option<DissectorHandle> {
        self.conversation(id).dissector(frame)
    }

    /* ------------------------------------------------------------------------------ */

    #[inline]
    fn id(&self, slot: u32) -> ConversationId {
        ConversationId {
            slot,
            generation: self.generation,
        }
    }

    fn slot(&self, id: ConversationId) -> u32 {
        assert!(
            id.generation == self.generation && (id.slot as usize) < self.records.len(),
            "stale conversation id {} (session generation {})",
            id,
            self.generation
        );
        id.slot
    }

    /// Adds a record to the arena and links it into the chain for its key.
    fn alloc(&mut self, frame: u32, key: ConvKey, options: ConvOptions) -> u32 {
        let slot = self.records.len() as u32;
        self.records
            .push(Conversation::new(slot, key, frame, options));
        self.link(slot);
        slot
    }

    /// Links a record under its current key, registering the key's shape if needed.
    fn link(&mut self, slot: u32) {
        let shape = self.registry.shape_of(&self.records[slot as usize].key);
        self.registry
            .table_mut(shape)
            .insert(&mut self.records, slot);
    }

    /// Unlinks a record from the chain for its current key.
    fn unlink(&mut self, slot: u32) {
        let res = match self.registry.find_shape(&self.records[slot as usize].key) {
            Some(shape) => self
                .registry
                .table_mut(shape)
                .remove(&mut self.records, slot),
            None => Err(ChainError::NotInChain { index: slot }),
        };
        if let Err(e) = res {
            if self.strict_remove {
                panic!("{}", e);
            }
            log::warn!("{}", e);
        }
    }

    /// Chain lookup in a known shape table.
    #[inline]
    fn lookup(&mut self, shape: ShapeId, frame: u32, key: &ConvKey) -> Option<u32> {
        self.registry
            .table(shape)
            .lookup(&mut self.records, frame, key)
    }

    /// Looks up `fwd` and `rev` in the same table, preferring the more recently created match.
    fn lookup_either(
        &mut self,
        shape: ShapeId,
        frame: u32,
        fwd: &ConvKey,
        rev: &ConvKey,
    ) -> Option<u32> {
        let found = self.lookup(shape, frame, fwd);
        match self.lookup(shape, frame, rev) {
            Some(other) => match found {
                Some(slot) if slot >= other => Some(slot),
                _ => Some(other),
            },
            None => found,
        }
    }
}

impl Default for ConversationTable {
    fn default() -> Self {
        Self::new(&ConversationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(last: u8) -> Address {
        Address::Ipv4(Ipv4Addr::new(192, 168, 0, last))
    }

    fn table() -> ConversationTable {
        ConversationTable::new(&ConversationConfig::default())
    }

    #[test]
    fn table_create_shapes() {
        let mut table = table();
        let exact = table.create_conversation(
            1,
            &v4(1),
            &v4(2),
            ConversationType::Tcp,
            1000,
            80,
            ConvOptions::none(),
        );
        assert_eq!(
            table.conversation(exact).key().shape_name(),
            "address,port,address,port,endpoint"
        );

        let no_addr2 = table.create_conversation(
            1,
            &v4(1),
            &Address::None,
            ConversationType::Tcp,
            1000,
            80,
            ConvOptions::NoAddr2,
        );
        assert_eq!(
            table.conversation(no_addr2).key().shape_name(),
            "address,port,port,endpoint"
        );

        let no_port2 = table.create_conversation(
            1,
            &v4(1),
            &v4(2),
            ConversationType::Tcp,
            1000,
            0,
            ConvOptions::NoPort2Force,
        );
        assert_eq!(
            table.conversation(no_port2).key().shape_name(),
            "address,port,address,endpoint"
        );

        let wild = table.create_conversation(
            1,
            &v4(1),
            &Address::None,
            ConversationType::Tcp,
            1000,
            0,
            ConvOptions::NoAddr2 | ConvOptions::NoPort2,
        );
        assert_eq!(
            table.conversation(wild).key().shape_name(),
            "address,port,endpoint"
        );

        let addrs = table.create_conversation(
            1,
            &v4(1),
            &v4(2),
            ConversationType::Ip,
            0,
            0,
            ConvOptions::NoPorts,
        );
        assert_eq!(
            table.conversation(addrs).key().shape_name(),
            "address,address,endpoint"
        );
        assert_eq!(table.len(), 5);
        assert_eq!(addrs.index(), 4);
    }

    #[test]
    #[should_panic(expected = "NO_PORTS cannot be combined")]
    fn table_create_rejects_conflicting_options() {
        let mut table = table();
        table.create_conversation(
            1,
            &v4(1),
            &v4(2),
            ConversationType::Tcp,
            1,
            2,
            ConvOptions::NoPorts | ConvOptions::NoPort2,
        );
    }

    #[test]
    fn table_reset_keeps_shapes() {
        let mut table = table();
        let key = ConvKey::new(vec![
            Element::String("call-id".to_string()),
            Element::Endpoint(ConversationType::Custom(3)),
        ]);
        let before = table.create_conversation_from_elements(5, key.clone());
        assert_eq!(table.find_conversation_full(5, &key), Some(before));
        let shapes = table.registry().len();

        table.reset();
        assert!(table.is_empty());
        assert_eq!(table.registry().len(), shapes);
        assert_eq!(table.find_conversation_full(5, &key), None);
        assert!(table.get(before).is_none());
        assert!(table.shapes().all(|(_, chains)| chains == 0));

        let after = table.create_conversation_from_elements(5, key.clone());
        assert_eq!(after.index(), 0);
        assert_ne!(before, after);
    }

    #[test]
    #[should_panic(expected = "stale conversation id")]
    fn table_stale_id_panics() {
        let mut table = table();
        let id = table.create_conversation_by_id(1, ConversationType::Tcp, 9);
        table.reset();
        table.add_proto_data(id, 1, 1u8);
    }

    #[test]
    fn table_registry_survives_sessions() {
        let mut first = table();
        let key = ConvKey::new(vec![
            Element::Uint64(1),
            Element::Int(-1),
            Element::Endpoint(ConversationType::Log),
        ]);
        first.create_conversation_from_elements(1, key.clone());
        let registry = first.into_registry();
        assert!(registry.find_shape(&key).is_some());

        let mut second = ConversationTable::with_registry(&ConversationConfig::default(), registry);
        assert_eq!(second.find_conversation_full(1, &key), None);
        assert!(second.registry().find_shape(&key).is_some());
    }

    #[test]
    fn table_side_tables_through_ids() {
        let mut table = table();
        let id = table.create_conversation_by_id(3, ConversationType::Custom(1), 0xabcd);
        table.add_proto_data(id, 17, vec![1u8, 2]);
        table.proto_data_mut::<Vec<u8>>(id, 17).unwrap().push(3);
        assert_eq!(table.proto_data::<Vec<u8>>(id, 17), Some(&vec![1, 2, 3]));
        table.delete_proto_data(id, 17);
        assert!(table.proto_data::<Vec<u8>>(id, 17).is_none());

        let handle = DissectorHandle::new(4, "rtp");
        table.set_dissector_from(id, 10, handle);
        assert_eq!(table.dissector(id, 9), None);
        assert_eq!(table.dissector(id, 10), Some(handle));
    }
}
