//! Generational slot storage backing the device's resource tables.
//!
//! A slot goes through three states: occupied, zombie and free. Retiring an occupied slot moves
//! its value out and leaves the slot as a zombie with its version unchanged, so that the index
//! can't be handed out again. Releasing a zombie bumps the version and pushes the index onto the
//! free-list.

use crate::Id;
use std::{iter::FusedIterator, marker::PhantomData, mem, slice};

const NIL: u32 = u32::MAX;

pub(crate) struct SlotTable<K, V> {
    slots: Vec<Slot<V>>,
    len: u32,
    capacity: u32,
    free_list_head: u32,
    marker: PhantomData<fn(K) -> K>,
}

struct Slot<V> {
    version: u64,
    state: SlotState<V>,
}

enum SlotState<V> {
    Occupied(V),
    Zombie,
    Free { next_free: u32 },
    Retired,
}

impl<K, V> SlotTable<K, V> {
    /// Creates a table that never holds more than `capacity` live or zombie slots.
    ///
    /// # Panics
    ///
    /// - Panics if `capacity` exceeds the index space of an [`Id`].
    pub(crate) fn new(capacity: u32) -> Self {
        assert!(
            u64::from(capacity) <= Id::<()>::INDEX_MASK + 1,
            "a resource table can't hold more than 2^{} slots",
            Id::<()>::INDEX_BITS,
        );

        SlotTable {
            slots: Vec::new(),
            len: 0,
            capacity,
            free_list_head: NIL,
            marker: PhantomData,
        }
    }

    /// Returns the number of occupied slots.
    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    /// Returns the number of slots that were ever allocated.
    #[inline]
    pub(crate) fn reserved_len(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Returns the maximum number of live and zombie slots.
    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Inserts `value`, reusing the most recently freed slot if there is one. Gives `value` back
    /// if the table is full.
    pub(crate) fn insert(&mut self, value: V) -> Result<Id<K>, V> {
        if self.free_list_head != NIL {
            let index = self.free_list_head;
            let slot = &mut self.slots[index as usize];

            let SlotState::Free { next_free } = slot.state else {
                unreachable!("slot {index} on the free-list isn't free");
            };

            self.free_list_head = next_free;
            slot.state = SlotState::Occupied(value);
            self.len += 1;

            Ok(Id::new(index, slot.version))
        } else {
            if self.slots.len() as u32 >= self.capacity {
                return Err(value);
            }

            let index = self.slots.len() as u32;

            self.slots.push(Slot {
                version: 1,
                state: SlotState::Occupied(value),
            });
            self.len += 1;

            Ok(Id::new(index, 1))
        }
    }

    #[inline]
    pub(crate) fn get(&self, id: Id<K>) -> Option<&V> {
        let slot = self.slots.get(id.index() as usize)?;

        match &slot.state {
            SlotState::Occupied(value) if slot.version == id.version() => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: Id<K>) -> Option<&mut V> {
        let slot = self.slots.get_mut(id.index() as usize)?;

        match &mut slot.state {
            SlotState::Occupied(value) if slot.version == id.version() => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn contains(&self, id: Id<K>) -> bool {
        self.get(id).is_some()
    }

    /// Moves the value out of the slot and marks the slot as a zombie. The slot's index stays
    /// reserved until [`release`] is called with it.
    ///
    /// [`release`]: Self::release
    pub(crate) fn retire(&mut self, id: Id<K>) -> Option<V> {
        let slot = self.slots.get_mut(id.index() as usize)?;

        if slot.version != id.version() || !matches!(slot.state, SlotState::Occupied(_)) {
            return None;
        }

        let SlotState::Occupied(value) = mem::replace(&mut slot.state, SlotState::Zombie) else {
            unreachable!();
        };

        self.len -= 1;

        Some(value)
    }

    /// Frees a zombie slot, bumping its version so that IDs pointing to the old occupant become
    /// stale.
    pub(crate) fn release(&mut self, index: u32) {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            debug_assert!(false, "released slot {index} is out of bounds");
            log::warn!("ignoring release of out-of-bounds slot {index}");
            return;
        };

        if !matches!(slot.state, SlotState::Zombie) {
            debug_assert!(false, "released slot {index} is not a zombie");
            log::warn!("ignoring release of slot {index}, which is not a zombie");
            return;
        }

        if slot.version == Id::<K>::MAX_VERSION {
            // The next version would alias the index bits, so the slot is never reused.
            slot.state = SlotState::Retired;
            log::debug!("retiring slot {index} after exhausting its versions");
            return;
        }

        slot.version += 1;
        slot.state = SlotState::Free {
            next_free: self.free_list_head,
        };
        self.free_list_head = index;
    }

    /// Moves the values out of every occupied slot, leaving them as zombies.
    pub(crate) fn retire_all(&mut self) -> Vec<(u32, V)> {
        let mut values = Vec::with_capacity(self.len as usize);

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot.state, SlotState::Occupied(_)) {
                if let SlotState::Occupied(value) = mem::replace(&mut slot.state, SlotState::Zombie)
                {
                    values.push((index as u32, value));
                }
            }
        }

        self.len = 0;

        values
    }

    #[inline]
    pub(crate) fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            inner: self.slots.iter().enumerate(),
            marker: PhantomData,
        }
    }
}

pub(crate) struct Iter<'a, K, V> {
    inner: std::iter::Enumerate<slice::Iter<'a, Slot<V>>>,
    marker: PhantomData<fn(K) -> K>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (Id<K>, &'a V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (index, slot) = self.inner.next()?;

            if let SlotState::Occupied(value) = &slot.state {
                break Some((Id::new(index as u32, slot.version), value));
            }
        }
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.inner.len()))
    }
}

impl<K, V> FusedIterator for Iter<'_, K, V> {}
