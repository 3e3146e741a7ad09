//! Identifiers that appear in tunnel records.

use std::fmt;

use tunnel_bytes::{Readable, Reader, Writeable, Writer};

/// The length of a router identity hash.
pub const ROUTER_HASH_LEN: usize = 32;

/// Hop-local identifier for a tunnel.
///
/// A hop receives cells on one tunnel id and sends them on another;
/// neither id means anything to any other hop.  The value 0 means
/// "unset": the receive id of a gateway, the send id of an endpoint.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord, Default)]
pub struct TunnelId(u32);

impl TunnelId {
    /// Return true if this is the reserved "unset" id.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
    /// Return the numeric value of this id.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for TunnelId {
    fn from(v: u32) -> Self {
        TunnelId(v)
    }
}
impl From<TunnelId> for u32 {
    fn from(id: TunnelId) -> u32 {
        id.0
    }
}
impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Readable for TunnelId {
    fn take_from(r: &mut Reader<'_>) -> tunnel_bytes::Result<Self> {
        Ok(TunnelId(r.take_u32()?))
    }
}
impl Writeable for TunnelId {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
        b.write_u32(self.0);
    }
}

/// Identifier of a message inside a tunnel, as used to match fragments.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct MessageId(u32);

impl MessageId {
    /// Return the numeric value of this id.
    pub fn get(self) -> u32 {
        self.0
    }
}
impl From<u32> for MessageId {
    fn from(v: u32) -> Self {
        MessageId(v)
    }
}
impl From<MessageId> for u32 {
    fn from(id: MessageId) -> u32 {
        id.0
    }
}
impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Readable for MessageId {
    fn take_from(r: &mut Reader<'_>) -> tunnel_bytes::Result<Self> {
        Ok(MessageId(r.take_u32()?))
    }
}
impl Writeable for MessageId {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
        b.write_u32(self.0);
    }
}

/// The SHA-256 hash of a router's identity.
///
/// This is all a hop ever learns about its neighbors.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouterHash([u8; ROUTER_HASH_LEN]);

impl RouterHash {
    /// Construct a RouterHash from its bytes.
    pub fn new(bytes: [u8; ROUTER_HASH_LEN]) -> Self {
        RouterHash(bytes)
    }
    /// Return the bytes of this hash.
    pub fn as_bytes(&self) -> &[u8; ROUTER_HASH_LEN] {
        &self.0
    }
}

impl From<[u8; ROUTER_HASH_LEN]> for RouterHash {
    fn from(bytes: [u8; ROUTER_HASH_LEN]) -> Self {
        RouterHash(bytes)
    }
}
impl AsRef<[u8]> for RouterHash {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}
impl fmt::Display for RouterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Routers are conventionally abbreviated to their first bytes.
        write!(f, "[{}]", hex::encode(&self.0[..4]))
    }
}
impl fmt::Debug for RouterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterHash({})", hex::encode(&self.0[..]))
    }
}
impl Readable for RouterHash {
    fn take_from(r: &mut Reader<'_>) -> tunnel_bytes::Result<Self> {
        Ok(RouterHash(r.take_array()?))
    }
}
impl Writeable for RouterHash {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
        b.write_all(&self.0[..]);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_forms() {
        let h = RouterHash::new([0xab; 32]);
        assert_eq!(h.to_string(), "[abababab]");
        assert!(format!("{:?}", h).starts_with("RouterHash(abab"));
        assert_eq!(TunnelId::from(77).to_string(), "77");
        assert!(TunnelId::default().is_zero());
        assert_eq!(u32::from(MessageId::from(9)), 9);
    }

    #[test]
    fn read_write_ids() {
        let mut v = Vec::new();
        v.write(&TunnelId::from(0x0102_0304));
        v.write(&RouterHash::new([7; 32]));
        assert_eq!(&v[..4], &[1, 2, 3, 4]);
        let mut r = Reader::from_slice(&v);
        let t: TunnelId = r.extract().unwrap();
        let h: RouterHash = r.extract().unwrap();
        assert_eq!(t.get(), 0x0102_0304);
        assert_eq!(h.as_bytes(), &[7; 32]);
        r.should_be_exhausted().unwrap();
    }
}
