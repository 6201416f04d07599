//! Wildcard resolution.
//!
//! Address/port conversations may be created before their second endpoint is known. Such
//! records are keyed without the unknown fields and live in their own shape tables. Resolution
//! walks from the most specific table to the least specific one, in both directions, and fills in
//! the wildcarded fields of a hit from the query (or spawns a concrete copy if the hit is a
//! template).

use super::address::Address;
use super::deinterlace::anchored_key;
use super::element::{ConvKey, ConversationType, Element};
use super::options::{ConvOptions, SearchOptions};
use super::packet::PacketInfo;
use super::record::{ConversationId, DissectorHandle};
use super::store::builtin;
use super::ConversationTable;

fn exact_key(
    addr1: &Address,
    port1: u32,
    addr2: &Address,
    port2: u32,
    kind: ConversationType,
) -> ConvKey {
    ConvKey::from_raw(vec![
        Element::Address(addr1.clone()),
        Element::Port(port1),
        Element::Address(addr2.clone()),
        Element::Port(port2),
        Element::Endpoint(kind),
    ])
}

fn no_addr2_key(addr1: &Address, port1: u32, port2: u32, kind: ConversationType) -> ConvKey {
    ConvKey::from_raw(vec![
        Element::Address(addr1.clone()),
        Element::Port(port1),
        Element::Port(port2),
        Element::Endpoint(kind),
    ])
}

fn no_port2_key(addr1: &Address, port1: u32, addr2: &Address, kind: ConversationType) -> ConvKey {
    ConvKey::from_raw(vec![
        Element::Address(addr1.clone()),
        Element::Port(port1),
        Element::Address(addr2.clone()),
        Element::Endpoint(kind),
    ])
}

fn no_addr2_port2_key(addr1: &Address, port1: u32, kind: ConversationType) -> ConvKey {
    ConvKey::from_raw(vec![
        Element::Address(addr1.clone()),
        Element::Port(port1),
        Element::Endpoint(kind),
    ])
}

fn addrs_key(addr1: &Address, addr2: &Address, kind: ConversationType) -> ConvKey {
    ConvKey::from_raw(vec![
        Element::Address(addr1.clone()),
        Element::Address(addr2.clone()),
        Element::Endpoint(kind),
    ])
}

impl ConversationTable {
    /// Finds the conversation between A and B established by `frame`.
    ///
    /// Lookups run from most to least specific, first match wins:
    ///
    /// 1. exact tuple in both directions, unless B is wildcarded in `options`;
    /// 2. records without a second address, upgraded with the observed address on a hit;
    /// 3. records without a second port, upgraded with the observed port on a hit;
    /// 4. records without either, in both directions;
    /// 5. with [SearchOptions::NoPortX], the address-only tuple in both directions.
    ///
    /// Upgrades never apply to connectionless kinds. Template hits spawn a concrete conversation
    /// and return it, leaving the template in place.
    #[allow(clippy::too_many_arguments)]
    pub fn find_conversation(
        &mut self,
        frame: u32,
        addr_a: &Address,
        addr_b: &Address,
        kind: ConversationType,
        port_a: u32,
        port_b: u32,
        options: SearchOptions,
    ) -> Option<ConversationId> {
        self.resolve(frame, addr_a, addr_b, kind, port_a, port_b, options)
            .map(|slot| self.id(slot))
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve(
        &mut self,
        frame: u32,
        addr_a: &Address,
        addr_b: &Address,
        kind: ConversationType,
        port_a: u32,
        port_b: u32,
        options: SearchOptions,
    ) -> Option<u32> {
        // Fibre Channel exchange ids are not swapped along with the addresses.
        let fc = addr_a.is_fibre_channel();

        let no_b = SearchOptions::NoAddrB | SearchOptions::NoPortB;
        if !options.intersects(no_b | SearchOptions::NoPortX) {
            log::debug!(
                "Exact lookup at frame {}: {}:{} <-> {}:{} ({})",
                frame,
                addr_a,
                port_a,
                addr_b,
                port_b,
                kind
            );
            let mut found = self.lookup_either(
                builtin::EXACT,
                frame,
                &exact_key(addr_a, port_a, addr_b, port_b, kind),
                &exact_key(addr_b, port_b, addr_a, port_a, kind),
            );
            if found.is_none() && fc {
                found = self.lookup(
                    builtin::EXACT,
                    frame,
                    &exact_key(addr_b, port_a, addr_a, port_b, kind),
                );
            }
            if found.is_some() {
                return found;
            }
        }

        if !options.intersects(SearchOptions::NoPortB | SearchOptions::NoPortX) {
            log::debug!(
                "No-addr2 lookup at frame {}: {}:{} -> *:{}",
                frame,
                addr_a,
                port_a,
                port_b
            );
            let mut found = self.lookup(
                builtin::NO_ADDR2,
                frame,
                &no_addr2_key(addr_a, port_a, port_b, kind),
            );
            if found.is_none() && fc {
                found = self.lookup(
                    builtin::NO_ADDR2,
                    frame,
                    &no_addr2_key(addr_b, port_a, port_b, kind),
                );
            }
            if let Some(slot) = found {
                let addr2 = (!options.contains(SearchOptions::NoAddrB)).then(|| addr_b);
                return Some(self.concretize(slot, addr2, None));
            }

            if !options.contains(SearchOptions::NoAddrB) {
                let rev = no_addr2_key(addr_b, port_b, port_a, kind);
                if let Some(slot) = self.lookup(builtin::NO_ADDR2, frame, &rev) {
                    return Some(self.concretize(slot, Some(addr_a), None));
                }
            }
        }

        if !options.intersects(SearchOptions::NoAddrB | SearchOptions::NoPortX) {
            log::debug!(
                "No-port2 lookup at frame {}: {}:{} -> {}:*",
                frame,
                addr_a,
                port_a,
                addr_b
            );
            let mut found = self.lookup(
                builtin::NO_PORT2,
                frame,
                &no_port2_key(addr_a, port_a, addr_b, kind),
            );
            if found.is_none() && fc {
                found = self.lookup(
                    builtin::NO_PORT2,
                    frame,
                    &no_port2_key(addr_b, port_a, addr_a, kind),
                );
            }
            if let Some(slot) = found {
                let port2 = (!options.contains(SearchOptions::NoPortB)).then(|| port_b);
                return Some(self.concretize(slot, None, port2));
            }

            if !options.contains(SearchOptions::NoPortB) {
                let rev = no_port2_key(addr_b, port_b, addr_a, kind);
                if let Some(slot) = self.lookup(builtin::NO_PORT2, frame, &rev) {
                    return Some(self.concretize(slot, None, Some(port_a)));
                }
            }
        }

        log::debug!(
            "No-addr2-port2 lookup at frame {}: {}:{} -> *:*",
            frame,
            addr_a,
            port_a
        );
        let fwd = no_addr2_port2_key(addr_a, port_a, kind);
        if let Some(slot) = self.lookup(builtin::NO_ADDR2_PORT2, frame, &fwd) {
            let addr2 = (!options.contains(SearchOptions::NoAddrB)).then(|| addr_b);
            let port2 = (!options.contains(SearchOptions::NoPortB)).then(|| port_b);
            return Some(self.concretize(slot, addr2, port2));
        }
        if kind.allows_reverse_lookup() {
            let rev = if fc {
                no_addr2_port2_key(addr_b, port_a, kind)
            } else {
                no_addr2_port2_key(addr_b, port_b, kind)
            };
            if let Some(slot) = self.lookup(builtin::NO_ADDR2_PORT2, frame, &rev) {
                return Some(self.concretize(slot, Some(addr_a), Some(port_a)));
            }
        }

        if options.contains(SearchOptions::NoPortX) {
            log::debug!(
                "Address-only lookup at frame {}: {} <-> {}",
                frame,
                addr_a,
                addr_b
            );
            let found = self.lookup(builtin::ADDRS, frame, &addrs_key(addr_a, addr_b, kind));
            if found.is_some() {
                return found;
            }
            return self.lookup(builtin::ADDRS, frame, &addrs_key(addr_b, addr_a, kind));
        }

        None
    }

    /// Fills in the wildcarded fields of a resolved record with the observed values.
    ///
    /// Templates are left alone; a concrete conversation is spawned instead, provided the query
    /// supplies every field the template lacks. Returns the slot the query resolves to.
    fn concretize(&mut self, slot: u32, addr2: Option<&Address>, port2: Option<u32>) -> u32 {
        let conv = &self.records[slot as usize];
        if conv.conversation_type().is_connectionless() {
            return slot;
        }
        let options = conv.options;
        if options.contains(ConvOptions::Template) {
            if (options.contains(ConvOptions::NoAddr2) && addr2.is_none())
                || (options.contains(ConvOptions::NoPort2) && port2.is_none())
            {
                return slot;
            }
            let addr2 = addr2.cloned().unwrap_or_default();
            return self.spawn(slot, &addr2, port2.unwrap_or(0));
        }
        if let Some(addr) = addr2 {
            self.set_addr2(slot, addr);
        }
        if let Some(port) = port2 {
            self.set_port2(slot, port);
        }
        slot
    }

    /// Creates a concrete conversation from a template, which stays in place for other endpoints.
    ///
    /// The new conversation shares the template's setup frame and inherits its dissectors but not
    /// its protocol data.
    fn spawn(&mut self, template: u32, addr2: &Address, port2: u32) -> u32 {
        let (options, key, setup_frame) = {
            let t = &self.records[template as usize];
            (t.options, t.key.clone(), t.setup_frame)
        };
        let kind = key.conversation_type();
        if !options.contains(ConvOptions::Template) || kind.is_connectionless() {
            return template;
        }

        let new_options =
            options & (ConvOptions::Template | ConvOptions::NoAddr2 | ConvOptions::NoPort2).not();
        let id = if options.contains(ConvOptions::NoAddr2)
            && options.contains(ConvOptions::NoPort2)
            && key.is_no_addr2_port2()
        {
            self.create_conversation(
                setup_frame,
                key.addr1(),
                addr2,
                kind,
                key.port1(),
                port2,
                new_options,
            )
        } else if options.contains(ConvOptions::NoPort2) && key.is_no_port2() {
            self.create_conversation(
                setup_frame,
                key.addr1(),
                key.addr2(),
                kind,
                key.port1(),
                port2,
                new_options,
            )
        } else if options.contains(ConvOptions::NoAddr2) && key.is_no_addr2() {
            self.create_conversation(
                setup_frame,
                key.addr1(),
                addr2,
                kind,
                key.port1(),
                key.port2(),
                new_options,
            )
        } else {
            return template;
        };

        let (head, tail) = self.records.split_at_mut(id.slot as usize);
        tail[0].inherit_dissectors(&head[template as usize]);
        log::debug!(
            "Spawned conversation {} from template {}",
            id.slot,
            template
        );
        id.slot
    }

    /// Fills in the second address of a conversation created with [ConvOptions::NoAddr2], moving
    /// it to the table for its new key shape. Returns `false` if the address is not wildcarded or
    /// the key has no slot for it, as with deinterlaced conversations.
    ///
    /// # Panics
    ///
    /// Panics if the conversation is a template.
    pub fn set_second_address(&mut self, id: ConversationId, addr: &Address) -> bool {
        let slot = self.slot(id);
        let updated = self.set_addr2(slot, addr);
        if !updated {
            log::warn!("Second address of conversation {} is not wildcarded", id);
        }
        updated
    }

    /// Fills in the second port of a conversation created with [ConvOptions::NoPort2], moving it
    /// to the table for its new key shape. Returns `false` if the port is not wildcarded, is
    /// forced to stay a wildcard, or has no slot in the key.
    ///
    /// # Panics
    ///
    /// Panics if the conversation is a template.
    pub fn set_second_port(&mut self, id: ConversationId, port: u32) -> bool {
        let slot = self.slot(id);
        let updated = self.set_port2(slot, port);
        if !updated {
            log::warn!("Second port of conversation {} is not wildcarded", id);
        }
        updated
    }

    fn set_addr2(&mut self, slot: u32, addr: &Address) -> bool {
        let options = self.records[slot as usize].options;
        assert!(
            !options.contains(ConvOptions::Template),
            "cannot set the second address of template conversation {}",
            slot
        );
        let key = &self.records[slot as usize].key;
        let has_slot = key.is_no_addr2() || key.is_no_addr2_port2();
        if !options.contains(ConvOptions::NoAddr2) || !has_slot {
            return false;
        }
        self.unlink(slot);
        let conv = &mut self.records[slot as usize];
        conv.options &= ConvOptions::NoAddr2.not();
        conv.key.insert_addr2(addr.clone());
        log::debug!("Conversation {} upgraded to {}", slot, conv.key);
        self.link(slot);
        true
    }

    fn set_port2(&mut self, slot: u32, port: u32) -> bool {
        let options = self.records[slot as usize].options;
        assert!(
            !options.contains(ConvOptions::Template),
            "cannot set the second port of template conversation {}",
            slot
        );
        if !options.contains(ConvOptions::NoPort2) || options.contains(ConvOptions::NoPort2Force) {
            return false;
        }
        let key = &self.records[slot as usize].key;
        if !(key.is_no_port2() || key.is_no_addr2_port2()) {
            return false;
        }
        self.unlink(slot);
        let conv = &mut self.records[slot as usize];
        conv.options &= ConvOptions::NoPort2.not();
        conv.key.insert_port2(port);
        log::debug!("Conversation {} upgraded to {}", slot, conv.key);
        self.link(slot);
        true
    }

    /* ------------------------------------------------------------------------------ */

    /// Finds a conversation partitioned by the link `anchor`.
    ///
    /// Without wildcards this is an exact lookup in both directions. With any of `NoAddrB`,
    /// `NoPortB` or `NoPortX` only the addresses and the anchor are matched; with `NoAnc` the
    /// anchor is ignored and the address-only conversations are searched instead.
    #[allow(clippy::too_many_arguments)]
    pub fn find_deinterlaced(
        &mut self,
        frame: u32,
        addr_a: &Address,
        addr_b: &Address,
        kind: ConversationType,
        port_a: u32,
        port_b: u32,
        anchor: u32,
        options: SearchOptions,
    ) -> Option<ConversationId> {
        let found = if !options.intersects(
            SearchOptions::NoAddrB
                | SearchOptions::NoPortB
                | SearchOptions::NoPortX
                | SearchOptions::NoAnc,
        ) {
            self.lookup_either(
                builtin::EXACT_ANC,
                frame,
                &anchored_key(addr_a, addr_b, kind, Some((port_a, port_b)), anchor),
                &anchored_key(addr_b, addr_a, kind, Some((port_b, port_a)), anchor),
            )
        } else if !options.contains(SearchOptions::NoAnc) {
            self.lookup_either(
                builtin::ADDRS_ANC,
                frame,
                &anchored_key(addr_a, addr_b, kind, None, anchor),
                &anchored_key(addr_b, addr_a, kind, None, anchor),
            )
        } else {
            self.lookup_either(
                builtin::ADDRS,
                frame,
                &addrs_key(addr_a, addr_b, kind),
                &addrs_key(addr_b, addr_a, kind),
            )
        };
        found.map(|slot| self.id(slot))
    }

    /// Finds the conversation of a packet, deinterlaced if the packet's link resolves to an
    /// anchor and classic otherwise.
    pub fn find_strat(
        &mut self,
        pinfo: &PacketInfo,
        kind: ConversationType,
        options: SearchOptions,
    ) -> Option<ConversationId> {
        match self.resolve_link_for(pinfo) {
            Some(link) => self.find_deinterlaced(
                pinfo.num,
                &pinfo.src,
                &pinfo.dst,
                kind,
                pinfo.src_port,
                pinfo.dst_port,
                link.index(),
                options,
            ),
            None => self.find_conversation(
                pinfo.num,
                &pinfo.src,
                &pinfo.dst,
                kind,
                pinfo.src_port,
                pinfo.dst_port,
                options,
            ),
        }
    }

    /// Creates the conversation of a packet, deinterlaced if the packet's link resolves to an
    /// anchor and classic otherwise.
    pub fn create_strat(
        &mut self,
        pinfo: &PacketInfo,
        kind: ConversationType,
        options: ConvOptions,
    ) -> ConversationId {
        match self.resolve_link_for(pinfo) {
            Some(link) => self.create_deinterlaced(
                pinfo.num,
                &pinfo.src,
                &pinfo.dst,
                kind,
                pinfo.src_port,
                pinfo.dst_port,
                link.index(),
                options,
            ),
            None => self.create_conversation(
                pinfo.num,
                &pinfo.src,
                &pinfo.dst,
                kind,
                pinfo.src_port,
                pinfo.dst_port,
                options,
            ),
        }
    }

    /* ------------------------------------------------------------------------------ */

    /// Returns the dissector assigned to the conversation between A and B at `frame`.
    ///
    /// Tries an exact query first, then the wildcard queries requested in `options`
    /// (`NoAddrB`, `NoPortB`, then both). The first conversation found with a dissector valid at
    /// `frame` wins.
    #[allow(clippy::too_many_arguments)]
    pub fn try_conversation_dissector(
        &mut self,
        frame: u32,
        addr_a: &Address,
        addr_b: &Address,
        kind: ConversationType,
        port_a: u32,
        port_b: u32,
        options: SearchOptions,
    ) -> Option<DissectorHandle> {
        let mut attempts = vec![SearchOptions::none()];
        if options.contains(SearchOptions::NoAddrB) {
            attempts.push(SearchOptions::NoAddrB);
        }
        if options.contains(SearchOptions::NoPortB) {
            attempts.push(SearchOptions::NoPortB);
        }
        if options.intersects(SearchOptions::NoAddrB | SearchOptions::NoPortB) {
            attempts.push(SearchOptions::NoAddrB | SearchOptions::NoPortB);
        }
        for attempt in attempts {
            let handle = self
                .resolve(frame, addr_a, addr_b, kind, port_a, port_b, attempt)
                .and_then(|slot| self.records[slot as usize].dissector(frame));
            if handle.is_some() {
                return handle;
            }
        }
        None
    }

    /// Returns the dissector assigned at `frame` to the conversation keyed by `id`.
    pub fn try_conversation_dissector_by_id(
        &mut self,
        frame: u32,
        kind: ConversationType,
        id: u32,
    ) -> Option<DissectorHandle> {
        let conv = self.find_conversation_by_id(frame, kind, id)?;
        self.conversation(conv).dissector(frame)
    }
}
