//! Stateful pieces of the tunnel data plane.
//!
//! # Overview
//!
//! `tunnel-cell` knows what a cell looks like.  This crate knows what to
//! do with one:
//!
//! * [`crypto`] and [`hop`]: the per-hop layer keys, and adding or
//!   removing one layer of encryption from a cell or reply record.
//! * [`route`]: a tunnel we built, with every hop's keys.
//! * [`batch`]: packing queued messages into cells at a gateway.
//! * [`reassembly`] and [`fragment`]: getting messages back out of
//!   cells at an endpoint.
//! * [`pool`]: fixed-size buffers for fragments that are waiting for
//!   the rest of their message.
//!
//! None of this touches the network.  The `tunnel-dispatch` crate ties
//! these pieces to transports and routing decisions.
//!
//! # Limitations
//!
//! Key material is zeroed when a hop is destroyed, but copies that the
//! block cipher keeps internally are only zeroed when the cipher is
//! dropped.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::large_stack_arrays)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::rc_buffer)]

pub mod batch;
pub mod config;
pub mod crypto;
pub mod fragment;
pub mod hop;
pub mod pool;
pub mod reassembly;
pub mod route;
mod util;

pub use util::err::Error;
pub use util::stats::{BatchStats, Counter, ReassemblyStats};

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
