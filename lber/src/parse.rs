use crate::common::{TagClass, TagStructure};
use crate::structure::{StructureTag, PL};

use nom::bytes::streaming::take;
use nom::error::{Error, ErrorKind};
use nom::number::streaming::be_u8;
use nom::{Err, IResult};

/// Parse a BER type header: tag class, primitive/constructed bit, tag number.
///
/// High tag numbers (an initial tag number of 31, continued in subsequent
/// octets) are rejected; LDAP never produces them.
pub fn parse_type_header(i: &[u8]) -> IResult<&[u8], (TagClass, TagStructure, u64)> {
    let (rest, b) = be_u8(i)?;
    let class = match TagClass::from_u8(b >> 6) {
        Some(class) => class,
        None => return Err(Err::Error(Error::new(i, ErrorKind::Tag))),
    };
    let structure = match TagStructure::from_u8((b >> 5) & 0x01) {
        Some(structure) => structure,
        None => return Err(Err::Error(Error::new(i, ErrorKind::Tag))),
    };
    let id = u64::from(b & 0x1f);
    if id == 0x1f {
        return Err(Err::Error(Error::new(i, ErrorKind::Tag)));
    }
    Ok((rest, (class, structure, id)))
}

/// Parse a BER length, short or long form. Indefinite lengths are rejected.
pub fn parse_length(i: &[u8]) -> IResult<&[u8], u64> {
    let (rest, b) = be_u8(i)?;
    if b & 0x80 == 0 {
        return Ok((rest, u64::from(b)));
    }
    let noctets = usize::from(b & 0x7f);
    if noctets == 0 || noctets > 8 {
        return Err(Err::Error(Error::new(i, ErrorKind::LengthValue)));
    }
    let (rest, octets) = take(noctets)(rest)?;
    Ok((rest, ber_to_u64(octets)))
}

/// Fold big-endian content octets into an unsigned integer.
pub fn ber_to_u64(octets: &[u8]) -> u64 {
    octets.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Decode the content octets of an INTEGER or ENUMERATED, sign-extending.
/// Returns `None` for an empty or over-long encoding.
pub fn ber_to_i64(octets: &[u8]) -> Option<i64> {
    if octets.is_empty() || octets.len() > 8 {
        return None;
    }
    let mut acc: i64 = if octets[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in octets {
        acc = (acc << 8) | i64::from(b);
    }
    Some(acc)
}

/// Parse one complete BER tag, recursing into constructed payloads.
///
/// The input is treated as a stream: a short read surfaces as
/// `Err::Incomplete`, letting the framing layer wait for more bytes. A
/// truncated child *inside* a fully-received constructed payload is
/// corruption instead, and maps to a hard error.
pub fn parse_tag(i: &[u8]) -> IResult<&[u8], StructureTag> {
    let (i, (class, structure, id)) = parse_type_header(i)?;
    let (i, len) = parse_length(i)?;
    let (i, content) = take(len as usize)(i)?;

    let payload = match structure {
        TagStructure::Primitive => PL::P(content.to_vec()),
        TagStructure::Constructed => {
            let mut children: Vec<StructureTag> = Vec::new();
            let mut inner = content;
            while !inner.is_empty() {
                let (rest, child) = parse_tag(inner).map_err(|e| match e {
                    Err::Incomplete(_) => Err::Error(Error::new(inner, ErrorKind::Complete)),
                    e => e,
                })?;
                inner = rest;
                children.push(child);
            }
            PL::C(children)
        }
    };

    Ok((
        i,
        StructureTag {
            class,
            id,
            payload,
        },
    ))
}
