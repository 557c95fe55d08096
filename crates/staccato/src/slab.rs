// src/slab.rs
//
// Fixed-capacity arena with an intrusive free list. Keys carry a generation
// that is bumped on every free, so a key kept past a close (a late epoll
// token, a connection coming back from a worker) can never reach the next
// occupant of the same slot.

/// Stable handle to a slot: index plus the generation it was issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    /// Pack into an epoll token.
    #[inline]
    pub fn to_token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

enum Slot<T> {
    Vacant { next_free: Option<u32> },
    Occupied(T),
    /// The value is out on loan (e.g. in the worker queue); the slot stays
    /// reserved until it is restored or removed.
    Lent,
}

struct Entry<T> {
    generation: u32,
    slot: Slot<T>,
}

pub struct Slab<T> {
    entries: Box<[Entry<T>]>,
    head_free: Option<u32>,
    active_count: usize,
}

impl<T> Slab<T> {
    /// Allocate every slot once, up front.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        let entries: Vec<Entry<T>> = (0..capacity)
            .map(|i| Entry {
                generation: 0,
                slot: Slot::Vacant {
                    next_free: (i + 1 < capacity).then_some(i as u32 + 1),
                },
            })
            .collect();

        Self {
            entries: entries.into_boxed_slice(),
            head_free: (capacity > 0).then_some(0),
            active_count: 0,
        }
    }

    /// O(1) insert. Returns `None` when every slot is taken.
    pub fn insert(&mut self, value: T) -> Option<Key> {
        let index = self.head_free?;
        let entry = &mut self.entries[index as usize];
        let Slot::Vacant { next_free } = entry.slot else {
            return None;
        };
        self.head_free = next_free;
        entry.slot = Slot::Occupied(value);
        self.active_count += 1;
        Some(Key {
            index,
            generation: entry.generation,
        })
    }

    fn entry(&self, key: Key) -> Option<&Entry<T>> {
        self.entries
            .get(key.index as usize)
            .filter(|entry| entry.generation == key.generation)
    }

    fn entry_mut(&mut self, key: Key) -> Option<&mut Entry<T>> {
        self.entries
            .get_mut(key.index as usize)
            .filter(|entry| entry.generation == key.generation)
    }

    /// Whether `key` names a live slot (present or lent).
    pub fn contains(&self, key: Key) -> bool {
        self.entry(key)
            .is_some_and(|entry| !matches!(entry.slot, Slot::Vacant { .. }))
    }

    pub fn get(&self, key: Key) -> Option<&T> {
        match &self.entry(key)?.slot {
            Slot::Occupied(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        match &mut self.entry_mut(key)?.slot {
            Slot::Occupied(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_lent(&self, key: Key) -> bool {
        self.entry(key).is_some_and(|entry| matches!(entry.slot, Slot::Lent))
    }

    /// Move the value out, keeping the slot reserved for `restore`.
    pub fn lend(&mut self, key: Key) -> Option<T> {
        let entry = self.entry_mut(key)?;
        match std::mem::replace(&mut entry.slot, Slot::Lent) {
            Slot::Occupied(value) => Some(value),
            other => {
                entry.slot = other;
                None
            }
        }
    }

    /// Put a lent value back. Hands the value back if the slot was freed or
    /// reused in the meantime.
    pub fn restore(&mut self, key: Key, value: T) -> Result<(), T> {
        match self.entry_mut(key) {
            Some(entry) if matches!(entry.slot, Slot::Lent) => {
                entry.slot = Slot::Occupied(value);
                Ok(())
            }
            _ => Err(value),
        }
    }

    /// Free the slot (present or lent), bumping its generation. Returns the
    /// value if it was present.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        let head_free = self.head_free;
        let entry = self.entry_mut(key)?;
        if matches!(entry.slot, Slot::Vacant { .. }) {
            return None; // Double free prevention
        }
        let old = std::mem::replace(
            &mut entry.slot,
            Slot::Vacant {
                next_free: head_free,
            },
        );
        entry.generation = entry.generation.wrapping_add(1);
        self.head_free = Some(key.index);
        self.active_count -= 1;
        match old {
            Slot::Occupied(value) => Some(value),
            _ => None,
        }
    }

    /// Present (not lent) values with their keys.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, entry)| match &entry.slot {
            Slot::Occupied(value) => Some((
                Key {
                    index: i as u32,
                    generation: entry.generation,
                },
                value,
            )),
            _ => None,
        })
    }

    /// Live slots, lent ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.head_free.is_none()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
