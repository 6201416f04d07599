//! Keyed conversation store.
//!
//! The store is a map of maps. The outer map, the [ShapeRegistry], is keyed by the canonical
//! shape name of a key (e.g. `address,port,address,port,endpoint`) and lives for the whole
//! process. Each inner [ShapeTable] maps a concrete key to the head of the version chain of
//! conversations sharing that key, and is emptied at every session reset.

use super::element::{ConvKey, ElementKind};

use hashlink::LinkedHashMap;
use indexmap::IndexMap;
use itertools::Itertools;

/// Index of a shape table in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeId(usize);

/// Shapes registered when a registry is created.
pub(crate) mod builtin {
    use super::ShapeId;

    /// `address,port,address,port,endpoint`
    pub(crate) const EXACT: ShapeId = ShapeId(0);
    /// `address,address,endpoint`
    pub(crate) const ADDRS: ShapeId = ShapeId(1);
    /// `address,port,port,endpoint`
    pub(crate) const NO_ADDR2: ShapeId = ShapeId(2);
    /// `address,port,address,endpoint`
    pub(crate) const NO_PORT2: ShapeId = ShapeId(3);
    /// `address,port,endpoint`
    pub(crate) const NO_ADDR2_PORT2: ShapeId = ShapeId(4);
    /// `uint,endpoint`
    pub(crate) const ID: ShapeId = ShapeId(5);
    /// `address,address,uint,uint,uint,endpoint`
    pub(crate) const DEINTERLACER: ShapeId = ShapeId(6);
    /// `address,address,port,port,uint,endpoint`
    pub(crate) const EXACT_ANC: ShapeId = ShapeId(7);
    /// `address,address,uint,endpoint`
    pub(crate) const ADDRS_ANC: ShapeId = ShapeId(8);
}

use super::element::ElementKind::{Address as A, Endpoint as E, Port as P, Uint as U};

/// Layouts of the builtin shapes, in [builtin] id order.
const BUILTIN_SHAPES: [&[ElementKind]; 9] = [
    &[A, P, A, P, E],
    &[A, A, E],
    &[A, P, P, E],
    &[A, P, A, E],
    &[A, P, E],
    &[U, E],
    &[A, A, U, U, U, E],
    &[A, A, P, P, U, E],
    &[A, A, U, E],
];

/// Chain heads for all keys of one shape.
#[derive(Debug, Default)]
pub(crate) struct ShapeTable {
    pub(crate) heads: LinkedHashMap<ConvKey, u32>,
}

impl ShapeTable {
    /// Number of distinct keys (chains) in the table.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.heads.len()
    }

    /// Head of the chain for `key`.
    #[inline]
    pub(crate) fn head(&self, key: &ConvKey) -> Option<u32> {
        self.heads.get(key).copied()
    }
}

/// Process-wide registry of key shapes.
///
/// Shapes are a static property of the decoders in use, so the registry outlives sessions;
/// only the chains stored in its tables are per-session.
#[derive(Debug)]
pub struct ShapeRegistry {
    tables: IndexMap<String, ShapeTable>,
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeRegistry {
    /// Creates a registry holding the builtin address/port, identifier and deinterlacer shapes.
    pub fn new() -> Self {
        let mut tables = IndexMap::with_capacity(BUILTIN_SHAPES.len());
        for shape in BUILTIN_SHAPES.iter() {
            tables.insert(shape.iter().join(","), ShapeTable::default());
        }
        ShapeRegistry { tables }
    }

    /// Returns the table for `key`'s shape, registering the shape if it is new.
    pub fn shape_of(&mut self, key: &ConvKey) -> ShapeId {
        let name = key.shape_name();
        if let Some(idx) = self.tables.get_index_of(&name) {
            return ShapeId(idx);
        }
        log::info!("Registering conversation shape: {}", name);
        let (idx, _) = self.tables.insert_full(name, ShapeTable::default());
        ShapeId(idx)
    }

    /// Returns the table for `key`'s shape, if the shape is registered.
    pub fn find_shape(&self, key: &ConvKey) -> Option<ShapeId> {
        self.tables.get_index_of(&key.shape_name()).map(ShapeId)
    }

    /// Number of registered shapes.
    #[inline]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Registered shape names with the number of chains currently stored under each.
    pub fn shapes(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.tables
            .iter()
            .map(|(name, table)| (name.as_str(), table.len()))
    }

    pub(crate) fn table(&self, id: ShapeId) -> &ShapeTable {
        match self.tables.get_index(id.0) {
            Some((_, table)) => table,
            None => panic!("unknown shape id {:?}", id),
        }
    }

    pub(crate) fn table_mut(&mut self, id: ShapeId) -> &mut ShapeTable {
        match self.tables.get_index_mut(id.0) {
            Some((_, table)) => table,
            None => panic!("unknown shape id {:?}", id),
        }
    }

    /// Drops every chain while keeping the registered shapes.
    pub(crate) fn clear_chains(&mut self) {
        for table in self.tables.values_mut() {
            table.heads.clear();
        }
    }
}
