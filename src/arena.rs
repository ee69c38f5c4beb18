//! Stack-discipline scratch storage.
//!
//! The effective operator keeps its diagonal and per-call scratch vectors in a
//! [`StackArena`]. Buffers are addressed by generation-checked [`Handle`]s and
//! must be released in reverse order of allocation. A [`Mark`] records the
//! stack depth so that everything allocated after it can be released in one
//! call, which is how the solver entry points return their scratch.
//!
//! Out-of-order release and access through a stale handle are programming
//! errors and panic.

/// Generation-checked index into a [`StackArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

/// Stack depth snapshot returned by [`StackArena::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    data: Vec<T>,
}

#[derive(Debug)]
pub struct StackArena<T> {
    slots: Vec<Slot<T>>,
    next_generation: u64,
}

impl<T> Default for StackArena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            next_generation: 0,
        }
    }
}

impl<T: Clone + Default> StackArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a zero-initialized buffer of `len` elements.
    pub fn alloc(&mut self, len: usize) -> Handle {
        self.push(vec![T::default(); len])
    }

    /// Pushes a buffer holding a copy of `src`.
    pub fn alloc_copy(&mut self, src: &[T]) -> Handle {
        self.push(src.to_vec())
    }

    fn push(&mut self, data: Vec<T>) -> Handle {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.slots.push(Slot { generation, data });
        Handle {
            index: self.slots.len() - 1,
            generation,
        }
    }

    /// Pops the most recent allocation, which must be `handle`.
    pub fn release(&mut self, handle: Handle) {
        let top = self.slots.len().checked_sub(1);
        assert_eq!(
            top,
            Some(handle.index),
            "arena release out of stack order: releasing slot {} but top is {:?}",
            handle.index,
            top
        );
        assert_eq!(
            self.slots[handle.index].generation, handle.generation,
            "arena release through a stale handle"
        );
        self.slots.pop();
    }

    pub fn mark(&self) -> Mark {
        Mark(self.slots.len())
    }

    /// Releases everything allocated after `mark`, newest first.
    pub fn release_to(&mut self, mark: Mark) {
        assert!(
            mark.0 <= self.slots.len(),
            "arena mark {} lies above the current depth {}",
            mark.0,
            self.slots.len()
        );
        self.slots.truncate(mark.0);
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, handle: Handle) -> &Slot<T> {
        let slot = self
            .slots
            .get(handle.index)
            .unwrap_or_else(|| panic!("arena handle {} was already released", handle.index));
        assert_eq!(slot.generation, handle.generation, "stale arena handle");
        slot
    }

    pub fn get(&self, handle: Handle) -> &[T] {
        &self.slot(handle).data
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut [T] {
        self.slot(handle);
        &mut self.slots[handle.index].data
    }

    /// Mutable access to two distinct buffers at once.
    pub fn get2_mut(&mut self, a: Handle, b: Handle) -> (&mut [T], &mut [T]) {
        let [a, b] = self.get_many_mut([a, b]);
        (a, b)
    }

    /// Mutable access to `N` distinct buffers at once, in the order given.
    pub fn get_many_mut<const N: usize>(&mut self, handles: [Handle; N]) -> [&mut [T]; N] {
        for handle in handles {
            self.slot(handle);
        }
        let mut slots: Vec<Option<&mut [T]>> = self.slots.iter_mut().map(|s| Some(s.data.as_mut_slice())).collect();
        handles.map(|handle| {
            slots[handle.index]
                .take()
                .unwrap_or_else(|| panic!("aliasing arena handles for slot {}", handle.index))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_alloc_release() {
        let mut arena = StackArena::<f64>::new();
        let a = arena.alloc(3);
        let b = arena.alloc_copy(&[1.0, 2.0]);
        assert_eq!(arena.get(a), &[0.0; 3]);
        arena.get_mut(a)[1] = 4.0;
        let (x, y) = arena.get2_mut(b, a);
        x[0] += y[1];
        assert_eq!(arena.get(b), &[5.0, 2.0]);
        arena.release(b);
        arena.release(a);
        assert!(arena.is_empty());
    }

    #[test]
    #[should_panic(expected = "arena release out of stack order")]
    fn test_out_of_order_release_panics() {
        let mut arena = StackArena::<f64>::new();
        let a = arena.alloc(1);
        let _b = arena.alloc(1);
        arena.release(a);
    }

    #[test]
    fn test_release_to_mark() {
        let mut arena = StackArena::<f64>::new();
        let keep = arena.alloc(2);
        let mark = arena.mark();
        arena.alloc(5);
        arena.alloc(7);
        arena.release_to(mark);
        assert_eq!(arena.depth(), 1);
        assert_eq!(arena.get(keep).len(), 2);
    }

    #[test]
    #[should_panic(expected = "stale arena handle")]
    fn test_stale_handle_panics() {
        let mut arena = StackArena::<f64>::new();
        let old = arena.alloc(1);
        arena.release(old);
        let _new = arena.alloc(1);
        arena.get(old);
    }

    #[test]
    fn test_many_buffers_borrowed_together() {
        let mut arena = StackArena::<f64>::new();
        let handles = [arena.alloc(2), arena.alloc(2), arena.alloc(2)];
        let [a, b, c] = arena.get_many_mut([handles[2], handles[0], handles[1]]);
        a[0] = 1.0;
        b[0] = 2.0;
        c[0] = a[0] + b[0];
        assert_eq!(arena.get(handles[1]), &[3.0, 0.0]);
    }

    #[test]
    #[should_panic(expected = "aliasing arena handles")]
    fn test_aliased_handles_panic() {
        let mut arena = StackArena::<f64>::new();
        let a = arena.alloc(1);
        arena.get_many_mut([a, a]);
    }
}
