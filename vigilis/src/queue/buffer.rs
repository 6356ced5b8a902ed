/// Reusable storage for raw kernel event records.
///
/// Sized to the largest `wait` seen so far and never shrunk, so steady-state
/// waits do not allocate.
pub(crate) struct EventBuffer<R> {
    records: Vec<R>,
    empty: R,
}

impl<R: Copy> EventBuffer<R> {
    pub(crate) fn new(capacity: usize, empty: R) -> Self {
        Self {
            records: vec![empty; capacity],
            empty,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Grows to exactly `wanted` records if currently smaller.
    ///
    /// Returns whether the buffer was reallocated.
    pub(crate) fn reserve(&mut self, wanted: usize) -> bool {
        if wanted <= self.records.len() {
            return false;
        }
        self.records = vec![self.empty; wanted];
        true
    }

    /// Doubles the capacity, for when a wait filled the buffer completely.
    pub(crate) fn grow(&mut self) -> usize {
        let next = self.records.len().saturating_mul(2).max(1);
        self.reserve(next);
        next
    }

    /// The first `n` slots, handed to the kernel.
    pub(crate) fn slots(&mut self, n: usize) -> &mut [R] {
        &mut self.records[..n]
    }

    /// Records filled by the last kernel call.
    pub(crate) fn filled(&self, n: usize) -> &[R] {
        &self.records[..n]
    }
}
