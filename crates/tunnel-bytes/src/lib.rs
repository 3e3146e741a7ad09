//! `tunnel-bytes`: Utilities to decode and encode tunnel records.
//!
//! # Overview
//!
//! Every byte that crosses a tunnel hop lives inside a fixed-size
//! cell, and most of what's inside a cell is a sequence of small
//! records: control bytes, tunnel ids, router hashes, message ids and
//! length-prefixed fragments.  This crate provides the cursor and
//! buffer types that the rest of the workspace uses to read and write
//! them.
//!
//! It is meant for things that are already in memory and that are
//! small (a few kilobytes at most).  It isn't suitable for streaming
//! IO.
//!
//! # Contents
//!
//! * [`Reader`]: a bounds-checked view of a byte slice.
//! * [`Writer`]: a trait for growable buffers (`Vec<u8>`,
//!   [`bytes::BytesMut`]) and for [`SliceWriter`], which fills a
//!   fixed buffer in place.
//! * [`Readable`] and [`Writeable`]: traits for types that know how to
//!   decode and encode themselves.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::large_stack_arrays)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![deny(clippy::unnecessary_wraps)]

mod err;
mod reader;
mod writer;

pub use err::Error;
pub use reader::Reader;
pub use writer::{SliceWriter, Writer};

/// Result type returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for an object that can be encoded onto a [`Writer`].
///
/// # Example
///
/// ```
/// use tunnel_bytes::{Writeable, Writer};
/// struct FollowOn { ctrl: u8, msg_id: u32, len: u16 }
///
/// impl Writeable for FollowOn {
///     fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
///         b.write_u8(self.ctrl);
///         b.write_u32(self.msg_id);
///         b.write_u16(self.len);
///     }
/// }
///
/// let mut v: Vec<u8> = Vec::new();
/// v.write(&FollowOn { ctrl: 0x83, msg_id: 7, len: 4 });
/// assert_eq!(v, &[0x83, 0, 0, 0, 7, 0, 4]);
/// ```
pub trait Writeable {
    /// Encode this object into the writer `b`.
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B);
}

/// Trait for an object that can be decoded from a [`Reader`].
///
/// Implementations should be cheap and should do no validation beyond
/// what the wire layout itself requires.  Semantic checks belong to
/// the caller.
pub trait Readable: Sized {
    /// Try to extract an object of this type from a Reader.
    fn take_from(b: &mut Reader<'_>) -> Result<Self>;
}

impl Readable for u8 {
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        b.take_u8()
    }
}

impl Readable for u16 {
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        b.take_u16()
    }
}

impl Readable for u32 {
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        b.take_u32()
    }
}

impl Readable for u64 {
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        b.take_u64()
    }
}

impl<const N: usize> Readable for [u8; N] {
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        b.take_array()
    }
}
