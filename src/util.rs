//! Synchronization primitives shared by all coordinators.

pub(crate) use {inbox::*, state::*};

mod inbox;
mod state;
