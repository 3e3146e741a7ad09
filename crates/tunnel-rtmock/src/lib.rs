//! Support for mocking time in tests of the tunnel data plane.
//!
//! # Overview
//!
//! Batching delays, reassembly timeouts and expiration windows are all
//! measured against a [`tunnel_rtcompat::Runtime`].  Tests use
//! [`MockRuntime`] so that "50 milliseconds later" happens instantly
//! and deterministically, by calling [`MockRuntime::advance`].

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::clone_on_ref_ptr)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_pass_by_value)]

pub mod time;

pub use time::MockRuntime;
