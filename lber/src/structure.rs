//! Generic BER value representation.
//!
//! Every tag, whatever its typed origin, lowers to a [`StructureTag`]:
//! class, tag number, and a payload which is either raw primitive bytes
//! or a vector of child tags. Parsing produces this form directly, and
//! consumers pick it apart with the `match_*`/`expect_*` helpers.

use crate::common::TagClass;

/// Payload of a BER tag.
#[derive(Clone, Debug, PartialEq)]
pub enum PL {
    /// Primitive contents.
    P(Vec<u8>),
    /// Constructed: an ordered list of child tags.
    C(Vec<StructureTag>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructureTag {
    pub class: TagClass,
    pub id: u64,
    pub payload: PL,
}

impl StructureTag {
    pub fn match_class(self, class: TagClass) -> Option<StructureTag> {
        if self.class == class {
            Some(self)
        } else {
            None
        }
    }

    pub fn match_id(self, id: u64) -> Option<StructureTag> {
        if self.id == id {
            Some(self)
        } else {
            None
        }
    }

    pub fn expect_constructed(self) -> Option<Vec<StructureTag>> {
        match self.payload {
            PL::C(tags) => Some(tags),
            PL::P(_) => None,
        }
    }

    pub fn expect_primitive(self) -> Option<Vec<u8>> {
        match self.payload {
            PL::P(data) => Some(data),
            PL::C(_) => None,
        }
    }
}
