//! Generational arena for scheduled playback buffers
//!
//! Every buffer handed to the output gets a `BufferHandle`. The registry is
//! the single place iterated on interruption and teardown. A handle whose
//! slot has been reused carries an old generation, so a completion that
//! races with an interruption can never remove a newer buffer.

use std::fmt;

/// Index + generation pair identifying one scheduled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of live entries addressed by `BufferHandle`
#[derive(Debug)]
pub struct BufferRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for BufferRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BufferRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store a value and return its handle
    pub fn insert(&mut self, value: T) -> BufferHandle {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return BufferHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        BufferHandle {
            index,
            generation: 0,
        }
    }

    /// Remove the entry for `handle`. Stale or unknown handles return `None`.
    pub fn remove(&mut self, handle: BufferHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, handle: BufferHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Remove every entry, returning them with their handles in slot order
    pub fn drain(&mut self) -> Vec<(BufferHandle, T)> {
        let mut drained = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                drained.push((
                    BufferHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                ));
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
        drained
    }

    /// Iterate live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (BufferHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    BufferHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let mut registry = BufferRegistry::new();
        let a = registry.insert("a");
        let b = registry.insert("b");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a), Some(&"a"));
        assert_eq!(registry.remove(b), Some("b"));
        assert_eq!(registry.remove(b), None);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(a));
    }

    #[test]
    fn test_reused_slot_rejects_stale_handle() {
        let mut registry = BufferRegistry::new();
        let old = registry.insert(1);
        registry.remove(old);

        let new = registry.insert(2);
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        // The old handle must not touch the new occupant
        assert_eq!(registry.remove(old), None);
        assert_eq!(registry.get(new), Some(&2));
    }

    #[test]
    fn test_drain_empties_and_invalidates_handles() {
        let mut registry = BufferRegistry::new();
        let handles: Vec<_> = (0..4).map(|i| registry.insert(i)).collect();

        let drained = registry.drain();
        assert_eq!(drained.len(), 4);
        assert_eq!(
            drained.iter().map(|(h, _)| *h).collect::<Vec<_>>(),
            handles
        );
        assert!(registry.is_empty());
        assert!(handles.iter().all(|h| !registry.contains(*h)));
    }

    #[test]
    fn test_iter_skips_removed_entries() {
        let mut registry = BufferRegistry::new();
        let a = registry.insert('a');
        let b = registry.insert('b');
        let c = registry.insert('c');
        registry.remove(b);

        let live: Vec<_> = registry.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(live, vec![(a, 'a'), (c, 'c')]);
    }

    #[test]
    fn test_handle_display() {
        let mut registry = BufferRegistry::new();
        let h = registry.insert(());
        assert_eq!(h.to_string(), "buf#0v0");
    }
}
