//! Index-addressed slot storage. A slot index is handed out on insertion and
//! never reused, so a handle always names the same instance.

#[derive(Debug, Clone)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next insertion will receive.
    pub fn next_index(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn insert(&mut self, value: T) -> u32 {
        let index = self.next_index();
        self.slots.push(Some(value));
        index
    }

    /// Insert with the value knowing its own index up front.
    pub fn insert_with(&mut self, make: impl FnOnce(u32) -> T) -> u32 {
        let index = self.next_index();
        self.slots.push(Some(make(index)));
        index
    }

    pub fn get(&self, index: u32) -> Option<&T> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        self.slots.get_mut(index as usize).and_then(Option::as_mut)
    }

    /// Replace an occupied slot, returning the previous value.
    pub fn replace(&mut self, index: u32, value: T) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.is_none() {
            return None;
        }
        slot.replace(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i as u32, v)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_not_reused() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!((a, b), (0, 1));
        assert_eq!(arena.next_index(), 2);
        let c = arena.insert("c");
        assert_eq!(c, 2);
        assert_eq!(arena.len(), 3);
        assert!(arena.get(3).is_none());
        assert!(!arena.is_empty());
    }

    #[test]
    fn test_replace_requires_occupied_slot() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        assert_eq!(arena.replace(a, 2), Some(1));
        assert_eq!(arena.get(a), Some(&2));
        assert_eq!(arena.replace(7, 3), None);
        let idx = arena.insert_with(|i| i * 10);
        assert_eq!(arena.get(idx), Some(&10));
    }
}
