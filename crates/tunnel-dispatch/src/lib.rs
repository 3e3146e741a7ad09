//! Move tunnel traffic between this router and its neighbours.
//!
//! # Overview
//!
//! `tunnel-proto` can encrypt a cell, pack messages into cells, and get
//! them back out again.  This crate decides which of those things to
//! do with each message that reaches the router, and when.
//!
//! The entry point is [`DispatchTable`].  Each tunnel this router is
//! part of is registered with it under the tunnel id its traffic
//! arrives on, in one of these roles:
//!
//! * **Outbound gateway**: one of our own outbound tunnels.  Messages
//!   we send are queued at a [`Gateway`](gateway::Gateway), batched
//!   into cells by the [`Pump`](pump::Pump) workers, pre-encrypted for
//!   every relay, and sent to the first hop.
//! * **Participant**: a middle hop of someone else's tunnel.  Each cell
//!   is peeled once and forwarded.
//! * **Outbound endpoint**: the last hop of someone else's outbound
//!   tunnel.  Cells are peeled, reassembled into messages, and sent
//!   where their delivery instructions say.
//! * **Inbound gateway**: the first hop of someone's inbound tunnel.
//!   Messages wrapped in TunnelGateway messages are queued and sent as
//!   cells, like at an outbound gateway.
//! * **Inbound endpoint**: the end of one of our own inbound tunnels.
//!   Cells are decrypted and reassembled, and the messages checked
//!   against an allow-list before anything acts on them.
//!
//! Traffic we carry for others is shaped before it costs us anything:
//! see [`shaper`].
//!
//! Everything this crate needs from the rest of the router, such as
//! the transport, the network database, and whatever consumes messages
//! addressed to us, is a trait in [`traits`].
//!
//! # Limitations
//!
//! Tunnel building lives elsewhere: this crate only learns about a
//! tunnel once it has been built or agreed to.  Garlic messages are
//! delivered as a unit; their cloves are not unpacked here.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
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

pub mod config;
mod context;
mod dispatch;
mod err;
pub mod gateway;
pub mod pump;
mod role;
pub mod shaper;
pub mod stats;
#[cfg(test)]
mod testing;
pub mod traits;

pub use dispatch::DispatchTable;
pub use err::Error;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
