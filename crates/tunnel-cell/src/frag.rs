//! Fragment records: the instruction-plus-body units packed into a cell.
//!
//! A cell's payload, after its padding terminator, is a sequence of
//! records.  Each record is a short delivery instruction followed by a
//! fragment body:
//!
//! ```text
//!  initial:   ctrl | [tunnel id 4] | [router 32] | [msg id 4] | [ext] | len 2 | body
//!  follow-on: ctrl | msg id 4 | len 2 | body
//! ```
//!
//! The high bit of the control byte says which kind of record it is.

use tunnel_bytes::{Reader, Writer};

use crate::delivery::{Delivery, DeliveryType};
use crate::ids::{MessageId, TunnelId};
use crate::{Error, Result};

/// Control-byte bit: this is a follow-on fragment.
const FLAG_FOLLOW_ON: u8 = 0x80;
/// Control-byte bits: delivery type, in an initial fragment.
const TYPE_MASK: u8 = 0x60;
/// Shift for the delivery type bits.
const TYPE_SHIFT: u8 = 5;
/// Control-byte bit: the message continues in follow-on fragments.
const FLAG_FRAGMENTED: u8 = 0x08;
/// Control-byte bit: an extended-options block is present.
const FLAG_EXTENDED: u8 = 0x04;
/// Control-byte bits: fragment number, in a follow-on fragment.
const FRAG_NUM_MASK: u8 = 0x7E;
/// Control-byte bit: this follow-on fragment is the last one.
const FLAG_LAST: u8 = 0x01;

/// Length of a follow-on fragment's instruction.
pub const FOLLOW_ON_INSTRUCTION_LEN: usize = 1 + 4 + 2;

/// Largest fragment number a follow-on record can carry.
pub const MAX_FRAGMENT_NUM: u8 = 63;

/// Return the length of an initial fragment's instruction.
///
/// An unfragmented message needs no message id; a fragmented one does.
pub fn first_instruction_len(delivery: &Delivery, fragmented: bool) -> usize {
    let msg_id = if fragmented { 4 } else { 0 };
    1 + delivery.encoded_len() + msg_id + 2
}

/// The first fragment of a message, or a whole unfragmented message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirstFragment<'a> {
    /// Where the message should go.
    pub delivery: Delivery,
    /// The message id, present only if more fragments follow.
    pub msg_id: Option<MessageId>,
    /// Extended options, if any.  We carry these but never act on them.
    pub extended: Option<&'a [u8]>,
    /// The fragment body.
    pub body: &'a [u8],
}

/// A follow-on fragment of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FollowOnFragment<'a> {
    /// The message this fragment belongs to.
    pub msg_id: MessageId,
    /// Fragment number, 1 through 63.
    pub frag_num: u8,
    /// True if this is the final fragment of the message.
    pub is_last: bool,
    /// The fragment body.
    pub body: &'a [u8],
}

/// One record decoded from a cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record<'a> {
    /// An initial fragment.
    First(FirstFragment<'a>),
    /// A follow-on fragment.
    FollowOn(FollowOnFragment<'a>),
}

impl<'a> Record<'a> {
    /// Decode one record from `r`, rejecting bodies larger than
    /// `max_fragment` bytes.
    pub fn take_from(r: &mut Reader<'a>, max_fragment: usize) -> Result<Self> {
        let ctrl = r.take_u8()?;
        if ctrl & FLAG_FOLLOW_ON != 0 {
            let frag_num = (ctrl & FRAG_NUM_MASK) >> 1;
            if frag_num == 0 {
                return Err(Error::BadFragmentNumber(frag_num));
            }
            let msg_id = r.extract()?;
            let body = take_body(r, max_fragment)?;
            return Ok(Record::FollowOn(FollowOnFragment {
                msg_id,
                frag_num,
                is_last: ctrl & FLAG_LAST != 0,
                body,
            }));
        }

        let dtype = DeliveryType::from_code((ctrl & TYPE_MASK) >> TYPE_SHIFT)
            .ok_or(Error::UndefinedDeliveryType)?;
        let delivery = match dtype {
            DeliveryType::Local => Delivery::Local,
            DeliveryType::Tunnel => {
                let tunnel: TunnelId = r.extract()?;
                if tunnel.is_zero() {
                    return Err(Error::ZeroTunnelId);
                }
                Delivery::Tunnel {
                    tunnel,
                    router: r.extract()?,
                }
            }
            DeliveryType::Router => Delivery::Router(r.extract()?),
        };
        let msg_id = if ctrl & FLAG_FRAGMENTED != 0 {
            Some(r.extract()?)
        } else {
            None
        };
        let extended = if ctrl & FLAG_EXTENDED != 0 {
            let n = r.take_u8()? as usize;
            Some(r.take(n)?)
        } else {
            None
        };
        let body = take_body(r, max_fragment)?;
        Ok(Record::First(FirstFragment {
            delivery,
            msg_id,
            extended,
            body,
        }))
    }
}

/// Read a two-byte length and that many bytes of fragment body.
fn take_body<'a>(r: &mut Reader<'a>, max_fragment: usize) -> Result<&'a [u8]> {
    let len = r.take_u16()? as usize;
    if len > max_fragment {
        return Err(Error::FragmentTooLarge(len));
    }
    Ok(r.take(len)?)
}

/// Encode an initial fragment onto `w`.
///
/// `msg_id` must be present exactly when the message does not fit in
/// this one fragment.
pub fn write_first<W: Writer + ?Sized>(
    w: &mut W,
    delivery: &Delivery,
    msg_id: Option<MessageId>,
    body: &[u8],
) -> Result<()> {
    if body.len() > u16::MAX as usize {
        return Err(Error::FragmentTooLarge(body.len()));
    }
    let mut ctrl = delivery.delivery_type().code() << TYPE_SHIFT;
    if msg_id.is_some() {
        ctrl |= FLAG_FRAGMENTED;
    }
    w.write_u8(ctrl);
    match delivery {
        Delivery::Local => {}
        Delivery::Router(router) => w.write(router),
        Delivery::Tunnel { router, tunnel } => {
            if tunnel.is_zero() {
                return Err(Error::ZeroTunnelId);
            }
            w.write(tunnel);
            w.write(router);
        }
    }
    if let Some(id) = msg_id {
        w.write(&id);
    }
    w.write_u16(body.len() as u16);
    w.write_all(body);
    Ok(())
}

/// Encode a follow-on fragment onto `w`.
pub fn write_follow_on<W: Writer + ?Sized>(
    w: &mut W,
    msg_id: MessageId,
    frag_num: u8,
    is_last: bool,
    body: &[u8],
) -> Result<()> {
    if frag_num == 0 || frag_num > MAX_FRAGMENT_NUM {
        return Err(Error::BadFragmentNumber(frag_num));
    }
    if body.len() > u16::MAX as usize {
        return Err(Error::FragmentTooLarge(body.len()));
    }
    let mut ctrl = FLAG_FOLLOW_ON | ((frag_num << 1) & FRAG_NUM_MASK);
    if is_last {
        ctrl |= FLAG_LAST;
    }
    w.write_u8(ctrl);
    w.write(&msg_id);
    w.write_u16(body.len() as u16);
    w.write_all(body);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ids::RouterHash;
    use hex_literal::hex;

    #[test]
    fn instruction_lengths() {
        let r = RouterHash::new([0; 32]);
        assert_eq!(first_instruction_len(&Delivery::Local, false), 3);
        assert_eq!(first_instruction_len(&Delivery::Local, true), 7);
        assert_eq!(first_instruction_len(&Delivery::Router(r), false), 35);
        let t = Delivery::Tunnel {
            router: r,
            tunnel: 1.into(),
        };
        assert_eq!(first_instruction_len(&t, true), 43);
    }

    #[test]
    fn follow_on_bytes() {
        let mut v = Vec::new();
        write_follow_on(&mut v, MessageId::from(12345), 1, true, b"xyz").unwrap();
        assert_eq!(v, hex!("83 00003039 0003 78797a"));
        let mut r = Reader::from_slice(&v);
        match Record::take_from(&mut r, 996).unwrap() {
            Record::FollowOn(f) => {
                assert_eq!(f.frag_num, 1);
                assert!(f.is_last);
                assert_eq!(f.body, b"xyz");
            }
            other => panic!("{:?}", other),
        }
        assert!(write_follow_on(&mut v, MessageId::from(1), 0, false, b"").is_err());
        assert!(write_follow_on(&mut v, MessageId::from(1), 64, false, b"").is_err());
    }

    #[test]
    fn first_bytes() {
        let mut v = Vec::new();
        write_first(&mut v, &Delivery::Local, Some(MessageId::from(2)), b"hi").unwrap();
        assert_eq!(v, hex!("08 00000002 0002 6869"));

        let r = RouterHash::new([0x11; 32]);
        let d = Delivery::Tunnel {
            router: r,
            tunnel: 9.into(),
        };
        let mut v = Vec::new();
        write_first(&mut v, &d, None, b"!").unwrap();
        assert_eq!(v[0], 0x20);
        assert_eq!(v.len(), first_instruction_len(&d, false) + 1);
        let mut rd = Reader::from_slice(&v);
        let rec = Record::take_from(&mut rd, 996).unwrap();
        assert_eq!(
            rec,
            Record::First(FirstFragment {
                delivery: d,
                msg_id: None,
                extended: None,
                body: b"!",
            })
        );
    }

    #[test]
    fn extended_block_skipped() {
        let rec = hex!("0c 00000005 02 aabb 0001 7a");
        let mut r = Reader::from_slice(&rec);
        match Record::take_from(&mut r, 996).unwrap() {
            Record::First(f) => {
                assert_eq!(f.msg_id, Some(MessageId::from(5)));
                assert_eq!(f.extended, Some(&hex!("aabb")[..]));
                assert_eq!(f.body, b"z");
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn corrupt_records() {
        let undef = hex!("60 0001 00");
        assert_eq!(
            Record::take_from(&mut Reader::from_slice(&undef), 996),
            Err(Error::UndefinedDeliveryType)
        );
        let zero_tunnel = hex!("20 00000000");
        assert_eq!(
            Record::take_from(&mut Reader::from_slice(&zero_tunnel), 996),
            Err(Error::ZeroTunnelId)
        );
        let too_big = hex!("00 03e5");
        assert_eq!(
            Record::take_from(&mut Reader::from_slice(&too_big), 996),
            Err(Error::FragmentTooLarge(997))
        );
        let short = hex!("00 0010 0102");
        assert!(matches!(
            Record::take_from(&mut Reader::from_slice(&short), 996),
            Err(Error::BytesErr(_))
        ));
        let frag_zero = hex!("80 00000001 0000");
        assert_eq!(
            Record::take_from(&mut Reader::from_slice(&frag_zero), 996),
            Err(Error::BadFragmentNumber(0))
        );
    }
}
