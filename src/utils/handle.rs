use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Generational index into a [`Pool`].
///
/// A handle stays valid until its slot is released; releasing bumps the slot
/// generation so stale copies of the handle no longer resolve.
pub struct Handle<T> {
    pub slot: u32,
    pub generation: u32,
    phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self {
            slot,
            generation,
            phantom: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.slot, self.generation)
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

/// Slot table handing out [`Handle`]s.
///
/// Slots are recycled LIFO. The table grows on demand up to `max_slots`.
pub struct Pool<T> {
    items: Vec<Option<T>>,
    empty: Vec<u32>,
    generation: Vec<u32>,
    max_slots: usize,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new(64)
    }
}

impl<T> Pool<T> {
    pub fn new(initial_size: usize) -> Self {
        Self::with_limit(initial_size, u32::MAX as usize)
    }

    pub fn with_limit(initial_size: usize, max_slots: usize) -> Self {
        let initial_size = initial_size.min(max_slots);
        let mut p = Pool {
            items: Vec::with_capacity(initial_size),
            empty: Vec::with_capacity(initial_size),
            generation: vec![0; initial_size],
            max_slots,
        };

        p.empty = (0..initial_size as u32).rev().collect();
        p.items.resize_with(initial_size, || None);
        p
    }

    fn grow(&mut self) -> bool {
        let len = self.items.len();
        if len >= self.max_slots {
            return false;
        }

        let new_len = (len.max(1) * 2).min(self.max_slots);
        self.items.resize_with(new_len, || None);
        self.generation.resize(new_len, 0);
        self.empty.extend((len as u32..new_len as u32).rev());
        true
    }

    /// Store `item`, returning `None` once `max_slots` are occupied.
    pub fn insert(&mut self, item: T) -> Option<Handle<T>> {
        if self.empty.is_empty() && !self.grow() {
            return None;
        }

        let empty_slot = self.empty.pop()?;
        self.items[empty_slot as usize] = Some(item);

        Some(Handle::new(empty_slot, self.generation[empty_slot as usize]))
    }

    /// Remove the item behind `item`. Stale handles are ignored.
    pub fn release(&mut self, item: Handle<T>) -> Option<T> {
        let slot = item.slot as usize;
        if !self.is_live(item) {
            return None;
        }

        let value = self.items[slot].take();
        self.generation[slot] = self.generation[slot].wrapping_add(1);
        self.empty.push(item.slot);
        value
    }

    pub fn is_live(&self, item: Handle<T>) -> bool {
        let slot = item.slot as usize;
        slot < self.items.len()
            && self.generation[slot] == item.generation
            && self.items[slot].is_some()
    }

    pub fn get_ref(&self, item: Handle<T>) -> Option<&T> {
        if self.is_live(item) {
            self.items[item.slot as usize].as_ref()
        } else {
            None
        }
    }

    pub fn get_mut_ref(&mut self, item: Handle<T>) -> Option<&mut T> {
        if self.is_live(item) {
            self.items[item.slot as usize].as_mut()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.items.len() - self.empty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_each_occupied<F: FnMut(Handle<T>, &T)>(&self, mut func: F) {
        for (slot, item) in self.items.iter().enumerate() {
            if let Some(item) = item {
                func(Handle::new(slot as u32, self.generation[slot]), item);
            }
        }
    }

    /// Remove every live item, invalidating all outstanding handles.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        for slot in 0..self.items.len() {
            if let Some(item) = self.items[slot].take() {
                self.generation[slot] = self.generation[slot].wrapping_add(1);
                self.empty.push(slot as u32);
                out.push(item);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_handle_does_not_resolve() {
        let mut pool: Pool<u32> = Pool::new(2);
        let a = pool.insert(7).unwrap();
        assert_eq!(pool.release(a), Some(7));

        let b = pool.insert(9).unwrap();
        assert_eq!(a.slot, b.slot);
        assert_ne!(a, b);
        assert!(pool.get_ref(a).is_none());
        assert_eq!(pool.get_ref(b), Some(&9));
        assert_eq!(pool.release(a), None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn grows_until_limit() {
        let mut pool: Pool<usize> = Pool::with_limit(1, 3);
        let handles: Vec<_> = (0..3).map(|i| pool.insert(i).unwrap()).collect();
        assert!(pool.insert(3).is_none());
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(pool.get_ref(*h), Some(&i));
        }
    }

    #[test]
    fn drain_invalidates_everything() {
        let mut pool: Pool<&str> = Pool::default();
        let a = pool.insert("a").unwrap();
        let b = pool.insert("b").unwrap();
        let mut drained = pool.drain();
        drained.sort();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(pool.is_empty());
        assert!(!pool.is_live(a));
        assert!(!pool.is_live(b));
    }
}
