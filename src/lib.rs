//! Blackrock Bluetooth LE central session coordination.
//!
//! A hardware adapter accepts one scan, one connection attempt per device, and
//! one notification toggle per characteristic at a time, and reports results
//! through a single stream of callbacks. This crate multiplexes any number of
//! independent logical requests onto such an adapter. Each request returns a
//! [`futures_core::Stream`] that is registered when the call returns and torn
//! down when it is dropped. Shared hardware operations are started for the
//! first subscriber and stopped after the last one goes away.
//!
//! The adapter itself is supplied by the caller through the [`Adapter`] trait
//! and feeds its callbacks back as [`AdapterEvent`]s via [`Central`].

#![warn(missing_debug_implementations)]

pub use {
    adapter::*, central::*, config::*, conn::*, error::*, event::*, gatt::*, notify::*, scan::*,
    types::*, uuid::*,
};

mod adapter;
mod central;
mod config;
mod conn;
mod error;
mod event;
mod gatt;
mod notify;
mod scan;
mod serial;
mod types;
mod util;
mod uuid;
