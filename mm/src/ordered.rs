//! Sorted fixed-capacity index of 32-bit values, used to keep the heap's free blocks in address
//! order.

use arrayvec::ArrayVec;

use crate::error::MemoryError;

/// Ascending array of unique values. Insertion fails once `N` values are stored.
#[derive(Debug, Clone)]
pub struct OrderedArray<const N: usize> {
    items: ArrayVec<u32, N>,
}

impl<const N: usize> OrderedArray<N> {
    pub const fn new() -> Self {
        Self {
            items: ArrayVec::new_const(),
        }
    }

    /// Inserts `value` behind all smaller values and returns its index.
    pub fn insert(&mut self, value: u32) -> Result<usize, MemoryError> {
        if self.items.is_full() {
            return Err(MemoryError::IndexFull);
        }
        let index = self.insertion_point(value);
        self.items.insert(index, value);
        Ok(index)
    }

    /// Removes the value at `index`, shifting all later values down by one.
    pub fn remove(&mut self, index: usize) -> Option<u32> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    /// Overwrites the value at `index`. The new value must sort into the same position.
    pub fn replace(&mut self, index: usize, value: u32) -> Option<u32> {
        if index >= self.items.len() {
            return None;
        }
        debug_assert!(index == 0 || self.items[index - 1] < value);
        debug_assert!(index + 1 >= self.items.len() || value < self.items[index + 1]);
        let slot = self.items.get_mut(index)?;
        Some(core::mem::replace(slot, value))
    }

    pub fn find(&self, value: u32) -> Option<usize> {
        self.items.iter().position(|&item| item == value)
    }

    pub fn get(&self, index: usize) -> Option<u32> {
        self.items.get(index).copied()
    }

    /// Number of stored values smaller than `value`, i.e. where `value` would be inserted.
    pub fn insertion_point(&self, value: u32) -> usize {
        self.items.partition_point(|&item| item < value)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.is_full()
    }
}

impl<const N: usize> Default for OrderedArray<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_values_sorted() {
        let mut array = OrderedArray::<8>::new();
        assert_eq!(array.insert(30), Ok(0));
        assert_eq!(array.insert(10), Ok(0));
        assert_eq!(array.insert(20), Ok(1));
        assert_eq!(array.insert(40), Ok(3));
        assert_eq!(
            (0..array.len()).filter_map(|i| array.get(i)).collect::<Vec<_>>(),
            [10, 20, 30, 40]
        );
    }

    #[test]
    fn remove_shifts_down() {
        let mut array = OrderedArray::<4>::new();
        for value in [1, 2, 3] {
            array.insert(value).unwrap();
        }
        assert_eq!(array.remove(0), Some(1));
        assert_eq!(array.get(0), Some(2));
        assert_eq!(array.get(1), Some(3));
        assert_eq!(array.get(2), None);
        assert_eq!(array.remove(2), None);
    }

    #[test]
    fn replace_keeps_position() {
        let mut array = OrderedArray::<4>::new();
        for value in [10, 20, 30] {
            array.insert(value).unwrap();
        }
        assert_eq!(array.replace(1, 25), Some(20));
        assert_eq!(array.get(1), Some(25));
        assert_eq!(array.replace(3, 40), None);
    }

    #[test]
    fn find_and_insertion_point() {
        let mut array = OrderedArray::<4>::new();
        array.insert(0x100).unwrap();
        array.insert(0x300).unwrap();
        assert_eq!(array.find(0x300), Some(1));
        assert_eq!(array.find(0x200), None);
        assert_eq!(array.insertion_point(0x200), 1);
        assert_eq!(array.insertion_point(0x400), 2);
    }

    #[test]
    fn insertion_fails_at_capacity() {
        let mut array = OrderedArray::<2>::new();
        array.insert(5).unwrap();
        array.insert(6).unwrap();
        assert!(array.is_full());
        assert_eq!(array.insert(7), Err(MemoryError::IndexFull));
        assert_eq!(array.len(), 2);
    }
}
