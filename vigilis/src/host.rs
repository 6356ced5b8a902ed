//! Collaborators supplied by the embedding runtime.
//!
//! A queue keeps a strong handle to each watched object, which is enough in
//! plain Rust. Runtimes with their own collector additionally need to know
//! when the kernel may hand an object back to them, so they can keep it
//! reachable; [`Host::pin`] and [`Host::release`] bracket exactly that window.

use std::time::Instant;

/// Environment hooks used by a queue family.
///
/// All methods have no-op defaults; [`DefaultHost`] uses them as is.
pub trait Host<T>: Send + Sync + 'static {
    /// `object` is now referenced by a kernel registration.
    ///
    /// Runs after the queue has released its locks, as does
    /// [`release`](Host::release).
    fn pin(&self, _object: &T) {}

    /// `object` is no longer referenced by any kernel registration.
    fn release(&self, _object: &T) {}

    /// Asks the host collector to run once.
    ///
    /// Only called on the descriptor/memory exhaustion retry path. A retried
    /// registration holds the interest table while it collects, so this hook
    /// must not call back into a queue of the same family.
    fn collect(&self) {}

    /// Monotonic clock used for wait deadlines.
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Host with no collector.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHost;

impl<T> Host<T> for DefaultHost {}
