//! Utilities used for the tunnel protocol.

pub(crate) mod ct;
pub(crate) mod err;
pub(crate) mod stats;
