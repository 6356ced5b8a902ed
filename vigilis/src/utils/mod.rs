//! Internal data structures.
//!
//! [`Slab`] stores interest entries and hands out the small generational
//! keys that travel through the kernel as opaque event tags.

mod slab;

pub(crate) use slab::{Key, Slab};
