use crate::events::Events;
use crate::utils::{Key, Slab};

use std::collections::HashMap;
use std::mem;
use std::os::fd::RawFd;

/// One watched descriptor.
pub(crate) struct Entry<T> {
    pub(crate) fd: RawFd,
    pub(crate) object: T,
    /// Last interest applied to the kernel.
    pub(crate) events: Events,
    /// Whether the registration exists in the current kernel set.
    ///
    /// Cleared when the kernel set is replaced after a fork; the entry
    /// itself stays as bookkeeping until the caller registers again.
    pub(crate) live: bool,
}

/// Descriptor number to watched object, shared by a queue family.
///
/// Entries live in a slab so that the kernel only ever carries a small
/// generational key. A key that outlived its entry resolves to nothing,
/// which keeps late events for a removed descriptor from being attributed
/// to whatever reused the slot.
pub(crate) struct InterestTable<T> {
    entries: Slab<Entry<T>>,
    by_fd: HashMap<RawFd, Key>,
}

impl<T> InterestTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Slab::new(16),
            by_fd: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<&Entry<T>> {
        self.by_fd.get(&fd).and_then(|key| self.entries.get(*key))
    }

    /// Resolves a tag delivered by the kernel.
    pub(crate) fn lookup(&self, key: Key) -> Option<&Entry<T>> {
        self.entries.get(key)
    }

    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        self.by_fd.contains_key(&fd)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_fd.len()
    }

    /// Allocates a key for a registration that has not reached the kernel yet.
    ///
    /// The entry is invisible to [`get`](Self::get) until
    /// [`commit`](Self::commit) is called.
    pub(crate) fn stage(&mut self, fd: RawFd, object: T, events: Events) -> Key {
        self.entries.insert(Entry {
            fd,
            object,
            events,
            live: false,
        })
    }

    /// Publishes a staged entry, returning the entry it replaced.
    pub(crate) fn commit(&mut self, key: Key) -> Option<Entry<T>> {
        let entry = self.entries.get_mut(key)?;
        entry.live = true;
        let fd = entry.fd;

        let displaced = self.by_fd.insert(fd, key)?;
        self.entries.remove(displaced)
    }

    /// Drops a staged entry whose kernel call failed.
    pub(crate) fn abort(&mut self, key: Key) -> Option<T> {
        self.entries.remove(key).map(|entry| entry.object)
    }

    pub(crate) fn remove(&mut self, fd: RawFd) -> Option<Entry<T>> {
        let key = self.by_fd.remove(&fd)?;
        self.entries.remove(key)
    }

    /// Marks every entry as absent from the kernel.
    ///
    /// `release` sees each object that was live until now.
    pub(crate) fn forget_kernel_state(&mut self, mut release: impl FnMut(&T)) {
        for entry in self.entries.iter_mut().filter(|entry| entry.live) {
            entry.live = false;
            release(&entry.object);
        }
    }

    /// Marks the registration of `fd` as gone from the kernel, returning its
    /// object if it was live until now.
    pub(crate) fn forget(&mut self, fd: RawFd) -> Option<&T> {
        let key = *self.by_fd.get(&fd)?;
        let entry = self.entries.get_mut(key)?;
        mem::take(&mut entry.live).then_some(&entry.object)
    }

    /// Empties the table and returns the objects that were live.
    pub(crate) fn clear(&mut self) -> Vec<T> {
        let fds: Vec<RawFd> = self.by_fd.keys().copied().collect();
        let live = fds
            .into_iter()
            .filter_map(|fd| self.remove(fd))
            .filter(|entry| entry.live)
            .map(|entry| entry.object)
            .collect();
        debug_assert_eq!(self.entries.len(), 0, "staged entry outlived its write lock");
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn register(table: &mut InterestTable<&'static str>, fd: RawFd, object: &'static str) -> Key {
        let key = table.stage(fd, object, Events::READABLE);
        table.commit(key);
        key
    }

    #[test]
    fn staged_entries_are_invisible_until_committed() {
        let mut table = InterestTable::new();
        let key = table.stage(3, "a", Events::READABLE);

        assert!(!table.contains(3));
        assert!(table.lookup(key).is_some());

        assert!(table.commit(key).is_none());
        assert!(table.contains(3));
        assert!(table.get(3).unwrap().live);
    }

    #[test]
    fn aborted_entries_disappear() {
        let mut table = InterestTable::new();
        let key = table.stage(3, "a", Events::READABLE);

        assert_eq!(table.abort(key), Some("a"));
        assert!(table.lookup(key).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn commit_displaces_the_previous_entry() {
        let mut table = InterestTable::new();
        let old = register(&mut table, 3, "a");

        let new = table.stage(3, "b", Events::WRITABLE);
        let displaced = table.commit(new).unwrap();

        assert_eq!(displaced.object, "a");
        assert!(table.lookup(old).is_none());
        assert_eq!(table.get(3).unwrap().object, "b");
        assert_eq!(table.get(3).unwrap().events, Events::WRITABLE);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn forgetting_kernel_state_keeps_bookkeeping() {
        let mut table = InterestTable::new();
        register(&mut table, 3, "a");
        register(&mut table, 4, "b");

        let mut released = Vec::new();
        table.forget_kernel_state(|object| released.push(*object));
        released.sort();
        assert_eq!(released, vec!["a", "b"]);

        assert!(table.contains(3));
        assert!(!table.get(3).unwrap().live);

        let mut again = 0;
        table.forget_kernel_state(|_| again += 1);
        assert_eq!(again, 0);
    }

    #[test]
    fn clear_releases_only_live_entries() {
        let mut table = InterestTable::new();
        register(&mut table, 3, "a");
        table.forget_kernel_state(|_| {});
        register(&mut table, 4, "b");

        assert_eq!(table.clear(), vec!["b"]);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn forget_hands_back_a_live_object_once() {
        let mut table = InterestTable::new();
        register(&mut table, 3, "a");

        assert_eq!(table.forget(3), Some(&"a"));
        assert_eq!(table.forget(3), None);
        assert_eq!(table.forget(4), None);

        assert!(table.contains(3));
        assert!(!table.get(3).unwrap().live);
    }
}
