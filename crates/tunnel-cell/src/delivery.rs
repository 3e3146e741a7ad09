//! Delivery instructions: where a message goes once it leaves a tunnel.

use crate::ids::{RouterHash, TunnelId};

/// The kind of delivery requested by the first fragment of a message.
///
/// These are the two "type" bits of an initial fragment's control byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryType {
    /// Deliver to the router at the tunnel endpoint.
    Local,
    /// Send to an inbound gateway on another router.
    Tunnel,
    /// Send directly to another router.
    Router,
}

impl DeliveryType {
    /// Return the two-bit wire code for this type.
    pub fn code(self) -> u8 {
        match self {
            DeliveryType::Local => 0,
            DeliveryType::Tunnel => 1,
            DeliveryType::Router => 2,
        }
    }
    /// Decode a two-bit wire code.  Code 3 is reserved, and yields None.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DeliveryType::Local),
            1 => Some(DeliveryType::Tunnel),
            2 => Some(DeliveryType::Router),
            _ => None,
        }
    }
}

/// The target of a message leaving a tunnel.
///
/// Only the first fragment of a message carries this.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// The message is for the endpoint router itself.
    Local,
    /// The message goes to the given router.
    Router(RouterHash),
    /// The message goes into the given tunnel, whose gateway is `router`.
    Tunnel {
        /// The gateway router.
        router: RouterHash,
        /// The gateway's receive tunnel id.
        tunnel: TunnelId,
    },
}

impl Delivery {
    /// Return the delivery type of this target.
    pub fn delivery_type(&self) -> DeliveryType {
        match self {
            Delivery::Local => DeliveryType::Local,
            Delivery::Router(_) => DeliveryType::Router,
            Delivery::Tunnel { .. } => DeliveryType::Tunnel,
        }
    }
    /// Return the router named by this target, if any.
    pub fn router(&self) -> Option<&RouterHash> {
        match self {
            Delivery::Local => None,
            Delivery::Router(r) => Some(r),
            Delivery::Tunnel { router, .. } => Some(router),
        }
    }
    /// Return the tunnel named by this target, if any.
    pub fn tunnel(&self) -> Option<TunnelId> {
        match self {
            Delivery::Tunnel { tunnel, .. } => Some(*tunnel),
            _ => None,
        }
    }
    /// Build a target from an optional router and tunnel.
    ///
    /// A tunnel without a router makes no sense, and is treated as local.
    pub fn from_parts(router: Option<RouterHash>, tunnel: Option<TunnelId>) -> Self {
        match (router, tunnel) {
            (Some(router), Some(tunnel)) => Delivery::Tunnel { router, tunnel },
            (Some(r), None) => Delivery::Router(r),
            (None, _) => Delivery::Local,
        }
    }
    /// Return the number of bytes this target adds to an instruction.
    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            Delivery::Local => 0,
            Delivery::Router(_) => 32,
            Delivery::Tunnel { .. } => 4 + 32,
        }
    }
}

impl Default for Delivery {
    fn default() -> Self {
        Delivery::Local
    }
}
