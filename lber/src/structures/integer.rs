use std::default;

use super::ASNTag;
use crate::common::TagClass;
use crate::structure;
use crate::universal;

/// Integer value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Integer {
    pub id: u64,
    pub class: TagClass,
    pub inner: i64,
}

/// Integer with a different universal tag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Enumerated {
    pub id: u64,
    pub class: TagClass,
    pub inner: i64,
}

fn int_into_structure(id: u64, class: TagClass, inner: i64) -> structure::StructureTag {
    // Minimal two's-complement content octets: strip leading octets that
    // only repeat the sign, keeping the sign bit of the first remaining
    // octet intact.
    let bytes = inner.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let sign_only = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !sign_only {
            break;
        }
        start += 1;
    }

    structure::StructureTag {
        id,
        class,
        payload: structure::PL::P(bytes[start..].to_vec()),
    }
}

impl ASNTag for Integer {
    fn into_structure(self) -> structure::StructureTag {
        int_into_structure(self.id, self.class, self.inner)
    }
}

impl ASNTag for Enumerated {
    fn into_structure(self) -> structure::StructureTag {
        int_into_structure(self.id, self.class, self.inner)
    }
}

impl default::Default for Integer {
    fn default() -> Integer {
        Integer {
            id: universal::Types::Integer as u64,
            class: TagClass::Universal,
            inner: 0,
        }
    }
}

impl default::Default for Enumerated {
    fn default() -> Enumerated {
        Enumerated {
            id: universal::Types::Enumerated as u64,
            class: TagClass::Universal,
            inner: 0,
        }
    }
}
