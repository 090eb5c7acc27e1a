//! The in-flight operation set.
//!
//! Slab-backed storage with a per-slot generation counter. Removal bumps the
//! generation, so a token minted for an earlier occupant of the same slot
//! stops resolving — stale kernel completions fall through harmlessly.

use crate::io::driver::OpToken;
use slab::Slab;

pub(crate) struct OpRegistry<T> {
    slab: Slab<T>,
    generations: Vec<u32>,
}

impl<T> OpRegistry<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn insert(&mut self, entry: T) -> OpToken {
        let key = self.slab.insert(entry);
        if key >= self.generations.len() {
            self.generations.resize(key + 1, 0);
        }
        OpToken::new(key as u32, self.generations[key])
    }

    pub(crate) fn remove(&mut self, token: OpToken) -> Option<T> {
        let key = token.index();
        if !self.is_current(token) {
            return None;
        }
        self.generations[key] = self.generations[key].wrapping_add(1);
        Some(self.slab.remove(key))
    }

    pub(crate) fn get_mut(&mut self, token: OpToken) -> Option<&mut T> {
        if !self.is_current(token) {
            return None;
        }
        self.slab.get_mut(token.index())
    }

    pub(crate) fn contains(&self, token: OpToken) -> bool {
        self.is_current(token)
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    fn is_current(&self, token: OpToken) -> bool {
        let key = token.index();
        self.slab.contains(key) && self.generations.get(key) == Some(&token.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove() {
        let mut reg = OpRegistry::with_capacity(4);
        let t1 = reg.insert("a");
        let t2 = reg.insert("b");

        assert!(reg.contains(t1));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.remove(t1), Some("a"));
        assert!(!reg.contains(t1));
        assert_eq!(reg.remove(t1), None);
        assert_eq!(reg.remove(t2), Some("b"));
        assert!(reg.is_empty());
    }

    #[test]
    fn stale_token_does_not_resolve_after_slot_reuse() {
        let mut reg = OpRegistry::with_capacity(4);
        let old = reg.insert(1);
        reg.remove(old);

        // Slab reuses the slot; the generation must differ.
        let fresh = reg.insert(2);
        assert_eq!(fresh.index(), old.index());
        assert_ne!(fresh.generation(), old.generation());

        assert!(!reg.contains(old));
        assert_eq!(reg.get_mut(old), None);
        assert_eq!(reg.remove(old), None);
        assert_eq!(reg.remove(fresh), Some(2));
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut reg = OpRegistry::with_capacity(2);
        let t = reg.insert(10);
        if let Some(v) = reg.get_mut(t) {
            *v = 11;
        }
        assert_eq!(reg.remove(t), Some(11));
    }
}
