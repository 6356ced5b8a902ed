//! # Vigilis
//!
//! **Vigilis** is a readiness multiplexer for the **Nebula** ecosystem: one
//! blocking "wait for readiness" primitive per queue over Linux `epoll` and
//! BSD/macOS `kqueue`, built to stay correct when the process forks and when
//! several threads share the same kernel event set.
//!
//! It does not schedule anything. A [`Queue`] watches descriptors on behalf of
//! caller-supplied objects and hands each event back together with its
//! object; the event loop around it belongs to the caller.
//!
//! - **Attribution by tag**: every registration carries a generational key,
//!   so an event always reaches the object it was registered for, even when a
//!   descriptor number was reused in the meantime
//! - **Self-healing registration**: `EEXIST` on add and `ENOENT` on modify
//!   fall back to the complementary call once
//! - **Duplicates**: [`Queue::duplicate`] gives each thread its own descriptor
//!   on one shared kernel set and interest table
//! - **Fork recovery**: after [`after_fork`], queues lazily recreate their
//!   kernel object on next use
//! - **Interrupt-safe waits**: `EINTR` resumes with the remaining timeout,
//!   and [`Queue::close`] wakes a wait blocked on the same queue
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::net::TcpListener;
//! use vigilis::{Events, Queue, Timeout};
//!
//! let listener = TcpListener::bind("127.0.0.1:0")?;
//! let queue: Queue<&str> = Queue::open(true)?;
//! queue.register(&listener, "listener", Events::READABLE)?;
//!
//! loop {
//!     queue.wait(64, Timeout::Forever, |events, name| {
//!         println!("{name} is ready: {events:?}");
//!     })?;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`backend`]: kernel adapters (`epoll`, `kqueue`)
//! - [`notify`]: `eventfd`, `timerfd`, `inotify` and `signalfd` descriptors (Linux)

mod builder;
mod descriptor;
mod error;
mod events;
mod host;
mod queue;
mod utils;

pub mod backend;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod notify;

pub use backend::{Backend, DefaultBackend};
pub use builder::QueueBuilder;
pub use descriptor::AsDescriptor;
pub use error::{Error, Result};
pub use events::{Events, Timeout};
pub use host::{DefaultHost, Host};
pub use queue::{Queue, after_fork};
