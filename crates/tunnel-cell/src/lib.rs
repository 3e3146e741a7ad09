//! Coding and decoding for the cells that carry messages through tunnels.
//!
//! A tunnel moves I2NP messages across a chain of hops in fixed
//! 1024-byte cells.  At the gateway, messages are cut into fragments
//! and packed, with per-fragment delivery instructions, into cells; at
//! the endpoint the fragments are parsed back out.  This crate holds the
//! wire formats for all of that:
//!
//! * [`cell`]: cell framing (IV, checksum, padding, terminator).
//! * [`frag`]: the instruction-plus-fragment records inside a cell.
//! * [`delivery`]: where a message goes when it leaves a tunnel.
//! * [`i2np`]: the standard I2NP header, and the few message bodies
//!   the data plane needs to look inside.
//! * [`ids`]: tunnel ids, message ids, and router hashes.
//!
//! Nothing here does encryption, or keeps any state: see `tunnel-proto`
//! for that.
//!
//! # Limitations
//!
//! Extended delivery options are parsed and skipped, never generated.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::large_stack_arrays)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]

pub mod cell;
pub mod delivery;
mod err;
pub mod frag;
pub mod i2np;
pub mod ids;

pub use err::Error;

/// An error type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
