// Copyright (c) 2023 Marceline Cramer
// SPDX-License-Identifier: AGPL-3.0-or-later
//
// This file is part of Capbus.
//
// Capbus is free software: you can redistribute it and/or modify it under the
// terms of the GNU Affero General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Capbus is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with Capbus. If not, see <https://www.gnu.org/licenses/>.

//! Fixed-capacity slot arrays.
//!
//! A [SlotArray] is sized once and never grows or shrinks afterwards. Every
//! slot is independently empty or holds exactly one value, and dropping or
//! clearing the array releases whatever the occupied slots hold.

use std::fmt;

use crate::error::Result;

pub struct SlotArray<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for SlotArray<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T: fmt::Debug> fmt::Debug for SlotArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.slots.iter()).finish()
    }
}

impl<T> SlotArray<T> {
    /// Allocates `n` empty slots, failing with
    /// [OutOfMemory](crate::Error::OutOfMemory) instead of aborting.
    pub fn with_capacity(n: usize) -> Result<Self> {
        let mut array = Self::default();
        array.reset(n)?;
        Ok(array)
    }

    /// Releases all occupied slots and resizes to `n` empty slots, reusing
    /// the existing allocation when it is large enough.
    pub fn reset(&mut self, n: usize) -> Result<()> {
        self.slots.clear();
        self.slots.try_reserve_exact(n)?;
        self.slots.resize_with(n, || None);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots the current allocation can hold without growing.
    pub fn allocated(&self) -> usize {
        self.slots.capacity()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    pub fn is_occupied(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Stores `value` in slot `index`, returning the previous occupant.
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize, value: T) -> Option<T> {
        self.slots[index].replace(value)
    }

    pub fn take(&mut self, index: usize) -> Option<T> {
        self.slots.get_mut(index)?.take()
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&T>> + '_ {
        self.slots.iter().map(Option::as_ref)
    }

    pub fn iter_occupied(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots.iter().flatten()
    }

    /// Empties every slot while keeping the slot count.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| drop(slot.take()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn starts_empty() {
        let slots = SlotArray::<u32>::with_capacity(4).unwrap();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots.occupied(), 0);
        assert!(slots.iter().all(|slot| slot.is_none()));
    }

    #[test]
    fn set_get_take() {
        let mut slots = SlotArray::with_capacity(3).unwrap();
        assert_eq!(slots.set(1, "one"), None);
        assert_eq!(slots.set(1, "uno"), Some("one"));
        assert_eq!(slots.get(1), Some(&"uno"));
        assert!(!slots.is_occupied(0));
        assert_eq!(slots.get(7), None);
        assert_eq!(slots.take(1), Some("uno"));
        assert_eq!(slots.take(1), None);
        assert_eq!(slots.len(), 3);
    }

    #[test]
    #[should_panic]
    fn set_out_of_bounds() {
        let mut slots = SlotArray::with_capacity(1).unwrap();
        slots.set(1, 0u8);
    }

    #[test]
    fn drop_releases_occupied() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut slots = SlotArray::with_capacity(4).unwrap();
        slots.set(0, Counted(drops.clone()));
        slots.set(3, Counted(drops.clone()));
        drop(slots);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reset_keeps_allocation() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut slots = SlotArray::with_capacity(8).unwrap();
        slots.set(2, Counted(drops.clone()));
        let allocated = slots.allocated();

        slots.reset(4).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(slots.len(), 4);
        assert_eq!(slots.occupied(), 0);
        assert_eq!(slots.allocated(), allocated);
    }

    #[test]
    fn clear_keeps_len() {
        let mut slots = SlotArray::with_capacity(2).unwrap();
        slots.set(0, 10);
        slots.set(1, 20);
        slots.clear();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots.occupied(), 0);
    }

    #[test]
    fn iter_occupied_in_order() {
        let mut slots = SlotArray::with_capacity(4).unwrap();
        slots.set(3, 'c');
        slots.set(0, 'a');
        let seen: Vec<_> = slots.iter_occupied().copied().collect();
        assert_eq!(seen, vec!['a', 'c']);
    }

    #[test]
    fn oversized_is_out_of_memory() {
        let result = SlotArray::<u64>::with_capacity(usize::MAX);
        assert_eq!(result.unwrap_err(), crate::Error::OutOfMemory);
    }
}
