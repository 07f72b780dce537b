//! Framing for BER-encoded LDAP messages.
//!
//! Every frame on the wire is one universal SEQUENCE, constructed
//! (`0x30`); anything else up front is a protocol error rather than a
//! partial read. Decoding is streaming: a frame split across reads
//! yields `None` until the rest arrives.

use std::convert::TryFrom;

use bytes::{Buf, BytesMut};
use log::trace;
use tokio_util::codec::{Decoder, Encoder};

use lber::parse::parse_tag;
use lber::structure::StructureTag;
use lber::write;

use crate::error::GatewayError;
use crate::proto::LdapMsg;

const SEQUENCE_CONSTRUCTED: u8 = 0x30;

pub struct LdapCodec;

impl Decoder for LdapCodec {
    type Item = LdapMsg;
    type Error = GatewayError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<LdapMsg>, GatewayError> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != SEQUENCE_CONSTRUCTED {
            return Err(GatewayError::Protocol(format!(
                "unexpected request tag 0x{:02x}",
                buf[0]
            )));
        }
        let (consumed, tag) = match parse_tag(buf) {
            Ok((rest, tag)) => (buf.len() - rest.len(), tag),
            Err(nom::Err::Incomplete(_)) => return Ok(None),
            Err(_) => return Err(GatewayError::Protocol("malformed BER frame".to_string())),
        };
        buf.advance(consumed);
        trace!("received {:?}", tag);
        LdapMsg::try_from(tag).map(Some)
    }
}

impl Encoder<StructureTag> for LdapCodec {
    type Error = GatewayError;

    fn encode(&mut self, msg: StructureTag, buf: &mut BytesMut) -> Result<(), GatewayError> {
        trace!("sending {:?}", msg);
        write::encode_into(buf, msg)?;
        Ok(())
    }
}
