//! Framing for the I2NP messages that tunnels carry.
//!
//! The tunnel data plane treats almost every message as opaque bytes.
//! It only needs to understand the standard 16-byte header (to learn a
//! message's type and expiration), the two tunnel-transport messages
//! ([`TunnelData`] and [`TunnelGateway`]), and just enough of a
//! `DatabaseStore` to apply the delivery-safety rules at a tunnel exit.

use bytes::Bytes;
use caret::caret_int;
use sha2::{Digest, Sha256};
use tunnel_bytes::{Reader, Writer};

use crate::cell::CELL_LEN;
use crate::ids::{MessageId, RouterHash, TunnelId};
use crate::{Error, Result};

/// Length of the standard I2NP message header.
pub const HEADER_LEN: usize = 16;

caret_int! {
    /// The type of an I2NP message.
    #[derive(Hash)]
    pub struct MessageType(u8) {
        /// Store a RouterInfo or LeaseSet in the network database.
        DATABASE_STORE = 1,
        /// Look up an entry in the network database.
        DATABASE_LOOKUP = 2,
        /// Reply to a failed lookup, with closer peers.
        DATABASE_SEARCH_REPLY = 3,
        /// Acknowledgement of a message id.
        DELIVERY_STATUS = 10,
        /// Encrypted bundle of cloves.
        GARLIC = 11,
        /// One tunnel cell, between two hops.
        TUNNEL_DATA = 18,
        /// A message to be injected at an inbound gateway.
        TUNNEL_GATEWAY = 19,
        /// Opaque application data.
        DATA = 20,
        /// Fixed-size tunnel build request.
        TUNNEL_BUILD = 21,
        /// Fixed-size tunnel build reply.
        TUNNEL_BUILD_REPLY = 22,
        /// Variable-size tunnel build request.
        VARIABLE_TUNNEL_BUILD = 23,
        /// Variable-size tunnel build reply.
        VARIABLE_TUNNEL_BUILD_REPLY = 24,
        /// Short-record tunnel build request.
        SHORT_TUNNEL_BUILD = 25,
        /// Reply to a short-record build, delivered via an outbound tunnel.
        OUTBOUND_TUNNEL_BUILD_REPLY = 26,
    }
}

impl MessageType {
    /// Return true if this message is part of tunnel construction.
    ///
    /// Build traffic is small and time-sensitive, so the shaper is far
    /// less eager to drop it.
    pub fn is_tunnel_build(self) -> bool {
        matches!(
            self,
            MessageType::TUNNEL_BUILD
                | MessageType::TUNNEL_BUILD_REPLY
                | MessageType::VARIABLE_TUNNEL_BUILD
                | MessageType::VARIABLE_TUNNEL_BUILD_REPLY
                | MessageType::SHORT_TUNNEL_BUILD
                | MessageType::OUTBOUND_TUNNEL_BUILD_REPLY
        )
    }
}

/// An I2NP message: a standard header and an opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct I2npMessage {
    /// What kind of message this is.
    msg_type: MessageType,
    /// Unique id for this message.
    id: MessageId,
    /// Expiration, in milliseconds since the UNIX epoch.
    expiration: u64,
    /// The message body.
    payload: Bytes,
}

impl I2npMessage {
    /// Construct a new message.
    pub fn new(msg_type: MessageType, id: MessageId, expiration: u64, payload: Bytes) -> Self {
        I2npMessage {
            msg_type,
            id,
            expiration,
            payload,
        }
    }
    /// Return the type of this message.
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }
    /// Return the id of this message.
    pub fn id(&self) -> MessageId {
        self.id
    }
    /// Change the id of this message.
    pub fn set_id(&mut self, id: MessageId) {
        self.id = id;
    }
    /// Return this message's expiration (ms since the epoch).
    pub fn expiration(&self) -> u64 {
        self.expiration
    }
    /// Change this message's expiration (ms since the epoch).
    pub fn set_expiration(&mut self, expiration: u64) {
        self.expiration = expiration;
    }
    /// Return the payload of this message.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
    /// Return the length of this message once encoded.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode this message, header and all, onto `w`.
    pub fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
        if self.payload.len() > u16::MAX as usize {
            return Err(Error::BadMessage("payload too long"));
        }
        let digest = Sha256::digest(&self.payload[..]);
        w.write_u8(self.msg_type.into());
        w.write_u32(self.id.into());
        w.write_u64(self.expiration);
        w.write_u16(self.payload.len() as u16);
        w.write_u8(digest[0]);
        w.write_all(&self.payload[..]);
        Ok(())
    }

    /// Encode this message into a new buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut v = Vec::with_capacity(self.encoded_len());
        self.encode_onto(&mut v)?;
        Ok(v.into())
    }

    /// Decode a message that occupies the entirety of `b`.
    pub fn decode(b: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(b);
        let m = Self::take_from(&mut r)?;
        r.should_be_exhausted()?;
        Ok(m)
    }

    /// Decode one message from the front of `r`.
    pub fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let msg_type: MessageType = r.take_u8()?.into();
        let id = MessageId::from(r.take_u32()?);
        let expiration = r.take_u64()?;
        let len = r.take_u16()? as usize;
        let cksum = r.take_u8()?;
        let payload = r.take(len)?;
        if Sha256::digest(payload)[0] != cksum {
            return Err(Error::BadMessage("header checksum mismatch"));
        }
        Ok(I2npMessage {
            msg_type,
            id,
            expiration,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// The body of a TunnelData message: one cell, bound for one hop.
#[derive(Clone)]
pub struct TunnelData {
    /// The receiving hop's tunnel id.
    tunnel_id: TunnelId,
    /// The cell itself.
    cell: Box<[u8; CELL_LEN]>,
}

impl TunnelData {
    /// Length of an encoded TunnelData body.
    pub const LEN: usize = 4 + CELL_LEN;

    /// Construct a new TunnelData body.
    pub fn new(tunnel_id: TunnelId, cell: Box<[u8; CELL_LEN]>) -> Self {
        TunnelData { tunnel_id, cell }
    }
    /// Return the tunnel id this cell is addressed to.
    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }
    /// Replace the tunnel id, as a participant does before forwarding.
    pub fn set_tunnel_id(&mut self, id: TunnelId) {
        self.tunnel_id = id;
    }
    /// Return a reference to the cell.
    pub fn cell(&self) -> &[u8; CELL_LEN] {
        &self.cell
    }
    /// Return a mutable reference to the cell.
    pub fn cell_mut(&mut self) -> &mut [u8; CELL_LEN] {
        &mut self.cell
    }
    /// Consume this body, returning the cell.
    pub fn into_cell(self) -> Box<[u8; CELL_LEN]> {
        self.cell
    }
    /// Encode this body.
    pub fn to_bytes(&self) -> Bytes {
        let mut v = Vec::with_capacity(Self::LEN);
        v.write_u32(self.tunnel_id.into());
        v.write_all(&self.cell[..]);
        v.into()
    }
    /// Decode a TunnelData body.
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() != Self::LEN {
            return Err(Error::BadCellLength(b.len()));
        }
        let mut r = Reader::from_slice(b);
        let tunnel_id = r.extract()?;
        let cell: [u8; CELL_LEN] = r.take_array()?;
        Ok(TunnelData {
            tunnel_id,
            cell: Box::new(cell),
        })
    }
    /// Wrap this body in an I2NP message.
    pub fn into_message(self, id: MessageId, expiration: u64) -> I2npMessage {
        I2npMessage::new(MessageType::TUNNEL_DATA, id, expiration, self.to_bytes())
    }
}

impl std::fmt::Debug for TunnelData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelData")
            .field("tunnel_id", &self.tunnel_id)
            .finish()
    }
}

/// The body of a TunnelGateway message: a message to be sent down the
/// inbound tunnel whose gateway receives it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelGateway {
    /// The gateway's receive tunnel id.
    tunnel_id: TunnelId,
    /// The message to inject.
    inner: I2npMessage,
}

impl TunnelGateway {
    /// Construct a new TunnelGateway body.
    pub fn new(tunnel_id: TunnelId, inner: I2npMessage) -> Self {
        TunnelGateway { tunnel_id, inner }
    }
    /// Return the gateway's tunnel id.
    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }
    /// Return the wrapped message.
    pub fn inner(&self) -> &I2npMessage {
        &self.inner
    }
    /// Consume this body, returning the wrapped message.
    pub fn into_inner(self) -> I2npMessage {
        self.inner
    }
    /// Encode this body.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let len = self.inner.encoded_len();
        if len > u16::MAX as usize {
            return Err(Error::BadMessage("gateway message too long"));
        }
        let mut v = Vec::with_capacity(6 + len);
        v.write_u32(self.tunnel_id.into());
        v.write_u16(len as u16);
        self.inner.encode_onto(&mut v)?;
        Ok(v.into())
    }
    /// Decode a TunnelGateway body.
    pub fn decode(b: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(b);
        let tunnel_id = r.extract()?;
        let len = r.take_u16()? as usize;
        let inner = I2npMessage::decode(r.take(len)?)?;
        r.should_be_exhausted()?;
        Ok(TunnelGateway { tunnel_id, inner })
    }
    /// Wrap this body in an I2NP message.
    pub fn into_message(self, id: MessageId, expiration: u64) -> Result<I2npMessage> {
        Ok(I2npMessage::new(
            MessageType::TUNNEL_GATEWAY,
            id,
            expiration,
            self.to_bytes()?,
        ))
    }
}

/// The fixed header of a DatabaseStore message.
///
/// We never parse the stored entry itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseStoreHeader {
    /// The key being stored.
    pub key: RouterHash,
    /// Entry type: 0 is a RouterInfo, everything else a LeaseSet variant.
    pub entry_type: u8,
    /// Nonzero if the sender wants a DeliveryStatus acknowledgement.
    pub reply_token: u32,
    /// Where to send the acknowledgement, if the token is nonzero.
    pub reply_via: Option<(TunnelId, RouterHash)>,
}

impl DatabaseStoreHeader {
    /// Parse the header at the front of a DatabaseStore payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(payload);
        let key = r.extract()?;
        let entry_type = r.take_u8()?;
        let reply_token = r.take_u32()?;
        let reply_via = if reply_token != 0 {
            Some((r.extract()?, r.extract()?))
        } else {
            None
        };
        Ok(DatabaseStoreHeader {
            key,
            entry_type,
            reply_token,
            reply_via,
        })
    }
    /// Encode this header, as a payload prefix.
    pub fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) {
        w.write(&self.key);
        w.write_u8(self.entry_type);
        w.write_u32(self.reply_token);
        if self.reply_token != 0 {
            if let Some((tid, gw)) = &self.reply_via {
                w.write(tid);
                w.write(gw);
            } else {
                w.write_zeros(4 + 32);
            }
        }
    }
    /// Return true if this stores a RouterInfo.
    pub fn is_router_info(&self) -> bool {
        self.entry_type == 0
    }
    /// Return true if the sender asked for an acknowledgement.
    pub fn wants_reply(&self) -> bool {
        self.reply_token != 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn header_layout() {
        let m = I2npMessage::new(
            MessageType::DATA,
            MessageId::from(0x0a0b_0c0d),
            0x0000_0170_0000_0000,
            Bytes::from_static(b"abc"),
        );
        let b = m.to_bytes().unwrap();
        // sha256("abc") begins with ba.
        assert_eq!(
            &b[..],
            &hex!("14 0a0b0c0d 0000017000000000 0003 ba 616263")[..]
        );
        assert_eq!(I2npMessage::decode(&b).unwrap(), m);
        assert_eq!(m.encoded_len(), b.len());
    }

    #[test]
    fn header_rejects() {
        let bad_cksum = hex!("14 00000001 0000000000000000 0003 00 616263");
        assert_eq!(
            I2npMessage::decode(&bad_cksum[..]),
            Err(Error::BadMessage("header checksum mismatch"))
        );
        let short = hex!("14 00000001 0000000000000000 0009 ba 616263");
        assert!(matches!(
            I2npMessage::decode(&short[..]),
            Err(Error::BytesErr(_))
        ));
    }

    #[test]
    fn message_types() {
        assert!(MessageType::SHORT_TUNNEL_BUILD.is_tunnel_build());
        assert!(!MessageType::GARLIC.is_tunnel_build());
        assert_eq!(u8::from(MessageType::TUNNEL_GATEWAY), 19);
        assert!(!MessageType::from(99).is_recognized());
    }

    #[test]
    fn gateway_wrapping() {
        let inner = I2npMessage::new(
            MessageType::DELIVERY_STATUS,
            MessageId::from(5),
            1000,
            Bytes::from_static(&[0; 12]),
        );
        let gw = TunnelGateway::new(TunnelId::from(44), inner.clone());
        let b = gw.to_bytes().unwrap();
        assert_eq!(&b[..6], &hex!("0000002c 001c")[..]);
        let back = TunnelGateway::decode(&b).unwrap();
        assert_eq!(back.tunnel_id(), TunnelId::from(44));
        assert_eq!(back.into_inner(), inner);
    }

    #[test]
    fn tunnel_data_length() {
        let td = TunnelData::new(TunnelId::from(3), Box::new([9; CELL_LEN]));
        let b = td.to_bytes();
        assert_eq!(b.len(), TunnelData::LEN);
        let back = TunnelData::decode(&b).unwrap();
        assert_eq!(back.tunnel_id(), TunnelId::from(3));
        assert_eq!(back.cell()[1023], 9);
        assert_eq!(
            TunnelData::decode(&b[..100]).unwrap_err(),
            Error::BadCellLength(100)
        );
    }

    #[test]
    fn dbstore_header() {
        let mut v = Vec::new();
        let h = DatabaseStoreHeader {
            key: RouterHash::new([1; 32]),
            entry_type: 0,
            reply_token: 7,
            reply_via: Some((TunnelId::from(2), RouterHash::new([3; 32]))),
        };
        h.encode_onto(&mut v);
        v.extend_from_slice(b"entry");
        let back = DatabaseStoreHeader::parse(&v).unwrap();
        assert_eq!(back, h);
        assert!(back.is_router_info() && back.wants_reply());

        let plain = hex!(
            "0101010101010101010101010101010101010101010101010101010101010101"
            "01 00000000"
        );
        let back = DatabaseStoreHeader::parse(&plain).unwrap();
        assert!(!back.is_router_info());
        assert!(!back.wants_reply());
        assert_eq!(back.reply_via, None);
    }
}
