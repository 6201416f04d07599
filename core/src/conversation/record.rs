//! Conversation records and their per-conversation side tables.

use super::element::{ConvKey, ConversationType};
use super::options::ConvOptions;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

/// Identifies a conversation within one session.
///
/// Ids carry the generation of the session that created them. Using an id after the session
/// has been [reset](crate::conversation::ConversationTable::reset) is a caller error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl ConversationId {
    /// Creation index of the conversation within its session.
    #[inline]
    pub fn index(&self) -> u32 {
        self.slot
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conv#{}@{}", self.slot, self.generation)
    }
}

/// Opaque handle to a protocol dissector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DissectorHandle {
    id: u32,
    name: &'static str,
}

impl DissectorHandle {
    pub const fn new(id: u32, name: &'static str) -> Self {
        DissectorHandle { id, name }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A conversation.
///
/// Records live in the session arena and are linked into a version chain of records sharing the
/// same key. Only the head of a chain carries valid `last` and `latest_found` links.
pub struct Conversation {
    /// Creation order within the session.
    pub(crate) index: u32,
    /// Key currently indexing this record in the store.
    pub(crate) key: ConvKey,
    /// Observation that established the conversation.
    pub(crate) setup_frame: u32,
    /// Most recent observation matched to the conversation.
    pub(crate) last_frame: u32,
    pub(crate) options: ConvOptions,
    /// Next record in the version chain.
    pub(crate) next: Option<u32>,
    /// Chain tail (head only).
    pub(crate) last: Option<u32>,
    /// Cached result of the last lookup (head only).
    pub(crate) latest_found: Option<u32>,
    proto_data: BTreeMap<i32, Box<dyn Any>>,
    dissectors: BTreeMap<u32, DissectorHandle>,
}

impl Conversation {
    pub(crate) fn new(index: u32, key: ConvKey, setup_frame: u32, options: ConvOptions) -> Self {
        Conversation {
            index,
            key,
            setup_frame,
            last_frame: setup_frame,
            options,
            next: None,
            last: None,
            latest_found: None,
            proto_data: BTreeMap::new(),
            dissectors: BTreeMap::new(),
        }
    }

    /// Creation index within the session.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn key(&self) -> &ConvKey {
        &self.key
    }

    #[inline]
    pub fn conversation_type(&self) -> ConversationType {
        self.key.conversation_type()
    }

    #[inline]
    pub fn setup_frame(&self) -> u32 {
        self.setup_frame
    }

    #[inline]
    pub fn last_frame(&self) -> u32 {
        self.last_frame
    }

    #[inline]
    pub fn options(&self) -> ConvOptions {
        self.options
    }

    /// Records a later observation of the conversation.
    #[inline]
    pub(crate) fn touch(&mut self, frame: u32) {
        if frame > self.last_frame {
            self.last_frame = frame;
        }
    }

    /// Attaches `data` for protocol `proto`, replacing any previous value.
    pub fn add_proto_data<T: Any>(&mut self, proto: i32, data: T) {
        self.proto_data.insert(proto, Box::new(data));
    }

    /// Returns the data attached for `proto`, if it exists and is a `T`.
    pub fn proto_data<T: Any>(&self, proto: i32) -> Option<&T> {
        self.proto_data.get(&proto)?.downcast_ref::<T>()
    }

    /// Mutable access to the data attached for `proto`.
    pub fn proto_data_mut<T: Any>(&mut self, proto: i32) -> Option<&mut T> {
        self.proto_data.get_mut(&proto)?.downcast_mut::<T>()
    }

    /// Removes the data attached for `proto`.
    pub fn delete_proto_data(&mut self, proto: i32) {
        self.proto_data.remove(&proto);
    }

    /// Uses `handle` for observations from `start_frame` onwards.
    pub fn set_dissector_from(&mut self, start_frame: u32, handle: DissectorHandle) {
        self.dissectors.insert(start_frame, handle);
    }

    /// Uses `handle` for the whole conversation.
    pub fn set_dissector(&mut self, handle: DissectorHandle) {
        self.set_dissector_from(0, handle);
    }

    /// Returns the dissector assigned with the greatest start frame not after `frame`.
    pub fn dissector(&self, frame: u32) -> Option<DissectorHandle> {
        self.dissectors
            .range(..=frame)
            .next_back()
            .map(|(_, handle)| *handle)
    }

    pub(crate) fn inherit_dissectors(&mut self, from: &Conversation) {
        self.dissectors = from.dissectors.clone();
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("index", &self.index)
            .field("key", &self.key.to_string())
            .field("setup_frame", &self.setup_frame)
            .field("last_frame", &self.last_frame)
            .field("options", &self.options)
            .field("next", &self.next)
            .field("last", &self.last)
            .field("proto_data", &self.proto_data.keys().collect::<Vec<_>>())
            .field("dissectors", &self.dissectors)
            .finish()
    }
}
