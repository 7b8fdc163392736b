/// Fixed-capacity ring of the most recent values.
///
/// Slots are allocated up to `capacity` and then overwritten in place, so a
/// full ring never reallocates.
#[derive(Debug, Clone)]
pub(crate) struct RingBuffer<T> {
    slots: Vec<T>,
    capacity: usize,
    /// Slot the next push writes to; the oldest value once full.
    next: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty ring holding at most `capacity` values (at least one).
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    /// Appends `value`, overwriting the oldest one when full.
    pub(crate) fn push(&mut self, value: T) {
        if self.slots.len() < self.capacity {
            self.slots.push(value);
        } else {
            self.slots[self.next] = value;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Oldest value still held.
    pub(crate) fn first(&self) -> Option<&T> {
        if self.slots.len() == self.capacity {
            self.slots.get(self.next)
        } else {
            self.slots.first()
        }
    }

    /// Most recently pushed value.
    pub(crate) fn last(&self) -> Option<&T> {
        if self.slots.is_empty() {
            return None;
        }
        self.slots.get((self.next + self.capacity - 1) % self.capacity)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partially_filled_ring() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.first(), None);
        assert_eq!(ring.last(), None);

        ring.push('a');
        ring.push('b');
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.first(), Some(&'a'));
        assert_eq!(ring.last(), Some(&'b'));
    }

    #[test]
    fn overwrites_oldest_in_order() {
        let mut ring = RingBuffer::new(3);
        for i in 1..=7 {
            ring.push(i);
            assert_eq!(ring.last(), Some(&i));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.first(), Some(&5));
        assert_eq!(ring.last(), Some(&7));
    }

    #[test]
    fn zero_capacity_holds_one() {
        let mut ring = RingBuffer::new(0);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.first(), Some(&2));
        assert_eq!(ring.last(), Some(&2));
    }
}
