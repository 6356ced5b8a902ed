use crate::backend::{Backend, DefaultBackend};
use crate::error::Result;
use crate::host::{DefaultHost, Host};
use crate::queue::Queue;

use std::sync::Arc;

/// Event buffer capacity and `wait_default` batch size.
pub(crate) const DEFAULT_MAX_EVENTS: usize = 64;

/// Builder for configuring and opening a queue.
///
/// `QueueBuilder` allows customizing a queue before its kernel object is
/// created: the close-on-exec flag, the initial event buffer capacity, the
/// host collaborator and the kernel backend.
///
/// # Examples
///
/// ```rust,ignore
/// let queue: Queue<u32> = QueueBuilder::new()
///     .capacity(256)
///     .cloexec(false)
///     .open()?;
/// ```
pub struct QueueBuilder<T, B = DefaultBackend> {
    /// Close the kernel descriptor on `exec`.
    cloexec: bool,
    /// Initial event buffer capacity.
    capacity: usize,
    host: Arc<dyn Host<T>>,
    backend: B,
}

impl<T> QueueBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new `QueueBuilder` with default configuration.
    ///
    /// By default the descriptor is close-on-exec, the event buffer holds
    /// 64 records, and the platform's default backend is used with a host
    /// that has no collector.
    pub fn new() -> Self {
        Self {
            cloexec: true,
            capacity: DEFAULT_MAX_EVENTS,
            host: Arc::new(DefaultHost),
            backend: DefaultBackend::default(),
        }
    }
}

impl<T, B> QueueBuilder<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: Backend,
{
    pub fn cloexec(mut self, cloexec: bool) -> Self {
        self.cloexec = cloexec;
        self
    }

    /// Sets the initial event buffer capacity.
    ///
    /// The buffer still grows on demand.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn capacity(mut self, n: usize) -> Self {
        assert!(n > 0, "capacity must be > 0");

        self.capacity = n;
        self
    }

    /// Sets the collaborator notified about pinned objects and asked to
    /// collect on resource exhaustion.
    pub fn host(mut self, host: impl Host<T>) -> Self {
        self.host = Arc::new(host);
        self
    }

    /// Switches to another backend.
    pub fn backend<B2: Backend>(self, backend: B2) -> QueueBuilder<T, B2> {
        QueueBuilder {
            cloexec: self.cloexec,
            capacity: self.capacity,
            host: self.host,
            backend,
        }
    }

    /// Creates the kernel object and returns the queue.
    pub fn open(self) -> Result<Queue<T, B>> {
        Queue::from_builder(self.backend, self.host, self.cloexec, self.capacity)
    }
}

impl<T> Default for QueueBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a default `QueueBuilder`.
    fn default() -> Self {
        Self::new()
    }
}
