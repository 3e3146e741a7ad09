//! Layered tunnel cryptography.
//!
//! Every hop of a tunnel shares a few symmetric keys with the tunnel's
//! creator.  A relay removes exactly one layer from each cell it
//! handles; the creator adds (or removes) all of them at once, so that
//! what comes out the far end is the plaintext the gateway framed.
//!
//! Two different kinds of layer use that contract:
//!
//! * [`TunnelLayer`]: the data-plane layer on every 1024-byte cell.
//! * [`AesReplyLayer`] and [`AeadReplyLayer`]: the layers on the
//!   records of a tunnel-build reply, which each hop encrypts on the
//!   way back to the creator.
//!
//! All three implement [`HopLayer`].

pub(crate) mod layer;
pub mod reply;

pub use layer::TunnelLayer;
pub use reply::{AeadReplyLayer, AesReplyLayer};

use crate::Result;

/// One hop's layer of onion encryption.
pub trait HopLayer {
    /// Remove this hop's layer from `buf`, in place.
    ///
    /// Layers that authenticate their input return an error, and leave
    /// `buf` in an unspecified state, if the input is not genuine.
    fn peel_one_hop(&self, buf: &mut [u8]) -> Result<()>;
}
