//! Version chains.
//!
//! Every key of a [ShapeTable] maps to the head of a singly-linked chain of conversations that
//! shared that key over time, ordered by setup frame. Records live in the session arena and are
//! linked by arena slot, so splicing never touches the records themselves.

use super::element::ConvKey;
use super::record::Conversation;
use super::store::ShapeTable;

use thiserror::Error;

/// Chain maintenance failure.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChainError {
    #[error("conversation {index} is not in the chain for its key")]
    NotInChain { index: u32 },
}

#[inline]
fn at(records: &[Conversation], slot: u32) -> &Conversation {
    &records[slot as usize]
}

#[inline]
fn at_mut(records: &mut [Conversation], slot: u32) -> &mut Conversation {
    &mut records[slot as usize]
}

/// Chain order: setup frame, then creation index.
#[inline]
fn rank(records: &[Conversation], slot: u32) -> (u32, u32) {
    (at(records, slot).setup_frame, slot)
}

impl ShapeTable {
    /// Links `conv` into the chain for its key, keeping the chain sorted by setup frame. Records
    /// sharing a setup frame are kept in creation order.
    ///
    /// Appending is O(1). Out-of-order records are spliced in after a linear scan and may become
    /// the new head.
    pub(crate) fn insert(&mut self, records: &mut [Conversation], conv: u32) {
        let head = match self.head(&at(records, conv).key) {
            Some(head) => head,
            None => {
                let c = at_mut(records, conv);
                c.next = None;
                c.last = Some(conv);
                c.latest_found = None;
                self.heads.insert(c.key.clone(), conv);
                log::debug!("New conversation chain: {}", c.key);
                return;
            }
        };

        let tail = at(records, head).last.unwrap_or(head);
        let rank_conv = rank(records, conv);
        if rank_conv > rank(records, tail) {
            let c = at_mut(records, conv);
            c.next = None;
            c.last = None;
            c.latest_found = None;
            at_mut(records, tail).next = Some(conv);
            at_mut(records, head).last = Some(conv);
            log::debug!("Appended conversation {} after {}", conv, tail);
            return;
        }

        let mut prev = None;
        let mut cur = head;
        while rank_conv > rank(records, cur) {
            match at(records, cur).next {
                Some(next) => {
                    prev = Some(cur);
                    cur = next;
                }
                None => break,
            }
        }

        match prev {
            None => {
                let old = at_mut(records, head);
                old.last = None;
                old.latest_found = None;
                let c = at_mut(records, conv);
                c.next = Some(head);
                c.last = Some(tail);
                c.latest_found = None;
                if let Some(entry) = self.heads.get_mut(&c.key) {
                    *entry = conv;
                }
                log::debug!("Conversation {} replaces {} as chain head", conv, head);
            }
            Some(prev) => {
                let c = at_mut(records, conv);
                c.next = Some(cur);
                c.last = None;
                c.latest_found = None;
                at_mut(records, prev).next = Some(conv);
                log::debug!("Spliced conversation {} between {} and {}", conv, prev, cur);
            }
        }
    }

    /// Unlinks `conv` from the chain for its current key.
    ///
    /// Removing the only member drops the key from the table. Fails if `conv` is not a member of
    /// the chain, which means the caller picked the wrong table.
    pub(crate) fn remove(
        &mut self,
        records: &mut [Conversation],
        conv: u32,
    ) -> Result<(), ChainError> {
        let head = match self.head(&at(records, conv).key) {
            Some(head) => head,
            None => return Err(ChainError::NotInChain { index: conv }),
        };

        if head == conv {
            let c = at(records, conv);
            match c.next {
                None => {
                    let key = c.key.clone();
                    self.heads.remove(&key);
                    log::debug!("Dropped conversation chain: {}", key);
                }
                Some(succ) => {
                    let last = c.last;
                    let latest_found = match c.latest_found {
                        Some(found) if found == conv => None,
                        other => other,
                    };
                    let s = at_mut(records, succ);
                    s.last = last;
                    s.latest_found = latest_found;
                    if let Some(entry) = self.heads.get_mut(&at(records, conv).key) {
                        *entry = succ;
                    }
                    log::debug!("Conversation {} promoted to chain head", succ);
                }
            }
            unlinked(at_mut(records, conv));
            return Ok(());
        }

        let mut prev = head;
        let mut cur = at(records, head).next;
        while let Some(slot) = cur {
            if slot == conv {
                let next = at(records, conv).next;
                at_mut(records, prev).next = next;
                let h = at_mut(records, head);
                if next.is_none() {
                    h.last = Some(prev);
                }
                if h.latest_found == Some(conv) {
                    h.latest_found = Some(prev);
                }
                unlinked(at_mut(records, conv));
                log::debug!("Unlinked conversation {} after {}", conv, prev);
                return Ok(());
            }
            prev = slot;
            cur = at(records, slot).next;
        }
        Err(ChainError::NotInChain { index: conv })
    }

    /// Returns the member of `key`'s chain with the greatest setup frame not after `frame`. Among
    /// members sharing that setup frame, the most recently created one wins.
    ///
    /// Caches the answer on the chain head, which is why the arena is borrowed mutably.
    pub(crate) fn lookup(
        &self,
        records: &mut [Conversation],
        frame: u32,
        key: &ConvKey,
    ) -> Option<u32> {
        let head = self.head(key)?;
        if at(records, head).setup_frame > frame {
            return None;
        }

        let tail = at(records, head).last.unwrap_or(head);
        if at(records, tail).setup_frame <= frame {
            return Some(tail);
        }

        let mut found = match at(records, head).latest_found {
            Some(cached) if at(records, cached).setup_frame <= frame => cached,
            _ => head,
        };
        let mut cur = at(records, found).next;
        while let Some(slot) = cur {
            if at(records, slot).setup_frame > frame {
                break;
            }
            found = slot;
            cur = at(records, slot).next;
        }

        at_mut(records, head).latest_found = Some(found);
        Some(found)
    }

    /// Returns the slots of `key`'s chain from head to tail.
    pub(crate) fn walk(&self, records: &[Conversation], key: &ConvKey) -> Vec<u32> {
        let mut slots = vec![];
        let mut cur = self.head(key);
        while let Some(slot) = cur {
            slots.push(slot);
            cur = at(records, slot).next;
        }
        slots
    }
}

fn unlinked(conv: &mut Conversation) {
    conv.next = None;
    conv.last = None;
    conv.latest_found = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::element::ConversationType;
    use crate::conversation::options::ConvOptions;

    fn key() -> ConvKey {
        ConvKey::by_id(ConversationType::Tcp, 42)
    }

    fn arena(setups: &[u32]) -> Vec<Conversation> {
        setups
            .iter()
            .enumerate()
            .map(|(i, s)| Conversation::new(i as u32, key(), *s, ConvOptions::none()))
            .collect()
    }

    fn setups(table: &ShapeTable, records: &[Conversation]) -> Vec<u32> {
        table
            .walk(records, &key())
            .iter()
            .map(|s| records[*s as usize].setup_frame)
            .collect()
    }

    fn assert_valid(table: &ShapeTable, records: &[Conversation]) {
        let walk = table.walk(records, &key());
        if let Some(head) = walk.first() {
            assert_eq!(records[*head as usize].last, walk.last().copied());
            for slot in walk.iter().skip(1) {
                assert_eq!(records[*slot as usize].last, None);
            }
        }
        let s = setups(table, records);
        assert!(s.windows(2).all(|w| w[0] <= w[1]), "unsorted chain {:?}", s);
    }

    fn permutations(n: u32) -> Vec<Vec<u32>> {
        if n == 0 {
            return vec![vec![]];
        }
        let mut out = vec![];
        for p in permutations(n - 1) {
            for pos in 0..=p.len() {
                let mut q = p.clone();
                q.insert(pos, n - 1);
                out.push(q);
            }
        }
        out
    }

    #[test]
    fn chain_insert_in_order() {
        let mut records = arena(&[1, 5, 5, 9]);
        let mut table = ShapeTable::default();
        for slot in 0..4 {
            table.insert(&mut records, slot);
        }
        assert_eq!(table.walk(&records, &key()), vec![0, 1, 2, 3]);
        assert_valid(&table, &records);
    }

    #[test]
    fn chain_insert_out_of_order_sorted() {
        let frames = [7, 3, 11, 3, 1, 9];
        for order in permutations(frames.len() as u32) {
            let mut records = arena(&frames);
            let mut table = ShapeTable::default();
            for slot in order.iter() {
                table.insert(&mut records, *slot);
                assert_valid(&table, &records);
            }
            assert_eq!(setups(&table, &records), vec![1, 3, 3, 7, 9, 11]);
            assert_eq!(table.len(), 1);
        }
    }

    #[test]
    fn chain_new_head_repoints_table() {
        let mut records = arena(&[10, 5]);
        let mut table = ShapeTable::default();
        table.insert(&mut records, 0);
        table.insert(&mut records, 1);
        assert_eq!(table.head(&key()), Some(1));
        assert_eq!(records[1].last, Some(0));
        assert_eq!(records[0].last, None);

        assert_eq!(table.lookup(&mut records, 7, &key()), Some(1));
        assert_eq!(table.lookup(&mut records, 10, &key()), Some(0));
        assert_eq!(table.lookup(&mut records, 4, &key()), None);
    }

    #[test]
    fn chain_lookup_latest_not_after() {
        let frames = [2, 4, 4, 8, 16];
        let mut records = arena(&frames);
        let mut table = ShapeTable::default();
        for slot in [3, 0, 4, 1, 2] {
            table.insert(&mut records, slot);
        }
        // Query in a scrambled order so the cached result is sometimes stale.
        for t in [0, 17, 5, 3, 8, 1, 15, 4, 2, 9, 16, 7] {
            let expected = frames.iter().filter(|s| **s <= t).max().copied();
            let got = table
                .lookup(&mut records, t, &key())
                .map(|slot| records[slot as usize].setup_frame);
            assert_eq!(got, expected, "query at {}", t);
        }
    }

    #[test]
    fn chain_lookup_equal_setups_prefer_newest() {
        let mut records = arena(&[5, 5, 10, 5]);
        let mut table = ShapeTable::default();
        table.insert(&mut records, 0);
        table.insert(&mut records, 1);
        assert_eq!(table.lookup(&mut records, 7, &key()), Some(1));

        // A later version must not change which record earlier frames resolve to.
        table.insert(&mut records, 2);
        assert_eq!(table.lookup(&mut records, 7, &key()), Some(1));
        assert_eq!(table.lookup(&mut records, 10, &key()), Some(2));

        // Spliced in behind the later version, but still the newest record set up at 5.
        table.insert(&mut records, 3);
        assert_eq!(table.walk(&records, &key()), vec![0, 1, 3, 2]);
        assert_valid(&table, &records);
        assert_eq!(table.lookup(&mut records, 5, &key()), Some(3));
        assert_eq!(table.lookup(&mut records, 9, &key()), Some(3));
    }

    #[test]
    fn chain_equal_setups_any_insert_order() {
        let frames = [4, 4, 2, 4];
        for order in permutations(frames.len() as u32) {
            let mut records = arena(&frames);
            let mut table = ShapeTable::default();
            for slot in order.iter() {
                table.insert(&mut records, *slot);
            }
            assert_eq!(table.walk(&records, &key()), vec![2, 0, 1, 3]);
            assert_eq!(table.lookup(&mut records, 3, &key()), Some(2));
            assert_eq!(table.lookup(&mut records, 4, &key()), Some(3));
        }
    }

    #[test]
    fn chain_lookup_missing_key() {
        let mut records = arena(&[1]);
        let table = ShapeTable::default();
        assert_eq!(table.lookup(&mut records, 100, &key()), None);
    }

    #[test]
    fn chain_remove_any_order() {
        let frames = [1, 3, 3, 6];
        for order in permutations(frames.len() as u32) {
            let mut records = arena(&frames);
            let mut table = ShapeTable::default();
            for slot in 0..frames.len() as u32 {
                table.insert(&mut records, slot);
            }
            // Warm the lookup cache so removal has to fix it up.
            table.lookup(&mut records, 4, &key());
            for (i, slot) in order.iter().enumerate() {
                table.remove(&mut records, *slot).unwrap();
                assert_valid(&table, &records);
                assert_eq!(table.walk(&records, &key()).len(), frames.len() - i - 1);
                if let Some(head) = table.head(&key()) {
                    if let Some(found) = records[head as usize].latest_found {
                        assert_ne!(found, *slot);
                    }
                }
            }
            assert_eq!(table.head(&key()), None);
            assert_eq!(table.len(), 0);
        }
    }

    #[test]
    fn chain_remove_absent() {
        let mut records = arena(&[1, 2, 3]);
        let mut table = ShapeTable::default();
        table.insert(&mut records, 0);
        table.insert(&mut records, 1);
        assert_eq!(
            table.remove(&mut records, 2),
            Err(ChainError::NotInChain { index: 2 })
        );
        assert_eq!(table.walk(&records, &key()), vec![0, 1]);

        let mut empty = ShapeTable::default();
        assert_eq!(
            empty.remove(&mut records, 0),
            Err(ChainError::NotInChain { index: 0 })
        );
    }
}
