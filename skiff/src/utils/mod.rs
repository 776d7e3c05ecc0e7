//! Internal containers.
//!
//! [`Slab`] gives the reactor stable `usize` tokens for registered sources,
//! reusing the slots of closed ones.

mod slab;

pub(crate) use slab::Slab;
