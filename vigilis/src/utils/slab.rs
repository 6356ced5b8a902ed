/// A stable handle into a [`Slab`].
///
/// The generation makes a key taken before a removal useless afterwards,
/// even when its slot has been reused by a later insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Key {
    index: u32,
    generation: u32,
}

/// Generations use 31 bits so that the high bit of a tag stays free.
const GENERATION_MASK: u32 = 0x7fff_ffff;

impl Key {
    /// Packs the key into an opaque 64-bit kernel tag.
    #[inline]
    pub(crate) fn tag(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Inverse of [`Key::tag`].
    #[inline]
    pub(crate) fn from_tag(tag: u64) -> Self {
        Self {
            index: tag as u32,
            generation: (tag >> 32) as u32 & GENERATION_MASK,
        }
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// A slab allocator with generational keys.
///
/// Values live in a contiguous array; freed slots are recycled through a
/// free stack and the array grows exponentially when it runs out.
pub(crate) struct Slab<T> {
    slots: Vec<Slot<T>>,
    /// Stack of free indices that can be reused.
    free: Vec<u32>,
    len: usize,
}

impl<T> Slab<T> {
    /// Creates a slab with `size` free slots.
    pub(crate) fn new(size: usize) -> Self {
        let slots = (0..size)
            .map(|_| Slot {
                value: None,
                generation: 0,
            })
            .collect();
        let free = (0..size as u32).rev().collect();

        Self {
            slots,
            free,
            len: 0,
        }
    }

    /// Inserts a value and returns its key.
    pub(crate) fn insert(&mut self, value: T) -> Key {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                let len = self.slots.len();
                let new_len = if len == 0 { 1 } else { 2 * len };

                self.slots.extend((len..new_len).map(|_| Slot {
                    value: None,
                    generation: 0,
                }));
                self.free.extend(((len + 1) as u32..new_len as u32).rev());

                len as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.len += 1;

        Key {
            index,
            generation: slot.generation,
        }
    }

    /// Removes the value for `key`, if the key is still current.
    pub(crate) fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }

        let value = slot.value.take()?;
        slot.generation = (slot.generation + 1) & GENERATION_MASK;
        self.free.push(key.index);
        self.len -= 1;

        Some(value)
    }

    pub(crate) fn get(&self, key: Key) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Iterates over every occupied slot.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.value.as_mut())
    }
}
