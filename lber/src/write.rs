use std::io;
use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use bytes::BytesMut;

use crate::common::{TagClass, TagStructure};
use crate::structure::{StructureTag, PL};

/// Serialize a tag tree into `buf` as one definite-length BER value.
pub fn encode_into(buf: &mut BytesMut, tag: StructureTag) -> io::Result<()> {
    let mut out: Vec<u8> = Vec::new();
    encode_tag(&mut out, tag)?;
    buf.extend_from_slice(&out);
    Ok(())
}

fn encode_tag(out: &mut Vec<u8>, tag: StructureTag) -> io::Result<()> {
    let StructureTag { class, id, payload } = tag;
    match payload {
        PL::P(content) => {
            write_header(out, class, TagStructure::Primitive, id, content.len())?;
            out.write_all(&content)?;
        }
        PL::C(children) => {
            let mut inner: Vec<u8> = Vec::new();
            for child in children {
                encode_tag(&mut inner, child)?;
            }
            write_header(out, class, TagStructure::Constructed, id, inner.len())?;
            out.write_all(&inner)?;
        }
    }
    Ok(())
}

fn write_header(
    out: &mut Vec<u8>,
    class: TagClass,
    structure: TagStructure,
    id: u64,
    len: usize,
) -> io::Result<()> {
    // Tag numbers stay below 31 for the LDAP subset; the high-tag-number
    // form is never emitted.
    out.write_u8(((class as u8) << 6) | ((structure as u8) << 5) | (id as u8))?;
    write_length(out, len)
}

fn write_length(out: &mut Vec<u8>, len: usize) -> io::Result<()> {
    if len < 128 {
        out.write_u8(len as u8)
    } else {
        let mut noctets = 1;
        while len >> (8 * noctets) != 0 {
            noctets += 1;
        }
        out.write_u8(0x80 | noctets as u8)?;
        out.write_uint::<BigEndian>(len as u64, noctets)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parse::parse_tag;
    use crate::structures::{ASNTag, Integer, OctetString, Sequence, Tag};

    #[test]
    fn short_and_long_length_forms() {
        let mut short = Vec::new();
        write_length(&mut short, 127).unwrap();
        assert_eq!(short, vec![127]);

        let mut long = Vec::new();
        write_length(&mut long, 128).unwrap();
        assert_eq!(long, vec![0x81, 128]);

        let mut longer = Vec::new();
        write_length(&mut longer, 0x0102).unwrap();
        assert_eq!(longer, vec![0x82, 0x01, 0x02]);
    }

    #[test]
    fn round_trip() {
        let tag = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: 77,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: b"hello".to_vec(),
                    ..Default::default()
                }),
            ],
            ..Default::default()
        });
        let expected = tag.clone().into_structure();
        let mut buf = BytesMut::new();
        encode_into(&mut buf, tag.into_structure()).unwrap();
        let (rest, parsed) = parse_tag(&buf).expect("parse");
        assert!(rest.is_empty());
        assert_eq!(parsed, expected);
    }
}
