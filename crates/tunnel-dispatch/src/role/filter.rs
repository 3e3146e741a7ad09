//! Which messages may leave one of our inbound tunnels.
//!
//! Anyone can send anything down an inbound tunnel once they know its
//! gateway.  If we acted on, say, a lookup that arrived down a client
//! tunnel, we would answer as ourselves and link the client to this
//! router.  So each tunnel exit admits only the types that make sense
//! for its trust level, and everything else is refused.

use tracing::debug;
use tunnel_cell::i2np::{DatabaseStoreHeader, I2npMessage, MessageType};

/// What an inbound tunnel is for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TunnelTrust {
    /// Serves one client destination.
    Client,
    /// Serves the router itself.
    Exploratory,
}

/// The filter's decision about one message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Hand it on.
    Accept,
    /// Don't hand it on, but nothing suspicious happened.
    Ignore(&'static str),
    /// Refuse it: someone is probing for who owns this tunnel.
    Dangerous(&'static str),
}

/// Decide whether `msg` may leave an inbound tunnel of the given trust.
///
/// Unknown and unlisted types are always refused.
pub(crate) fn check(trust: TunnelTrust, msg: &I2npMessage) -> Verdict {
    let ty = msg.msg_type();
    match ty {
        MessageType::DATABASE_STORE => check_store(trust, msg),
        MessageType::DATABASE_SEARCH_REPLY
        | MessageType::DELIVERY_STATUS
        | MessageType::GARLIC
        | MessageType::OUTBOUND_TUNNEL_BUILD_REPLY
        | MessageType::TUNNEL_BUILD_REPLY
        | MessageType::VARIABLE_TUNNEL_BUILD_REPLY => Verdict::Accept,
        _ => match trust {
            TunnelTrust::Client => Verdict::Dangerous("message type not allowed down a client tunnel"),
            TunnelTrust::Exploratory => {
                Verdict::Dangerous("message type not allowed down an exploratory tunnel")
            }
        },
    }
}

/// Apply the rules for a DatabaseStore.
fn check_store(trust: TunnelTrust, msg: &I2npMessage) -> Verdict {
    let hdr = match DatabaseStoreHeader::parse(msg.payload()) {
        Ok(h) => h,
        Err(e) => {
            debug!("Unparseable DatabaseStore at tunnel exit: {}", e);
            return Verdict::Dangerous("malformed DatabaseStore");
        }
    };
    match trust {
        TunnelTrust::Client if hdr.is_router_info() => {
            Verdict::Ignore("RouterInfo store down a client tunnel")
        }
        TunnelTrust::Client | TunnelTrust::Exploratory if hdr.wants_reply() => {
            Verdict::Dangerous("DatabaseStore with reply token down a tunnel")
        }
        TunnelTrust::Client | TunnelTrust::Exploratory => Verdict::Accept,
    }
}
