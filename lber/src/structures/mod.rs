use crate::structure;

pub mod boolean;
pub mod explicit;
pub mod integer;
pub mod null;
pub mod octetstring;
pub mod sequence;

pub use self::boolean::Boolean;
pub use self::explicit::ExplicitTag;
pub use self::integer::{Enumerated, Integer};
pub use self::null::Null;
pub use self::octetstring::OctetString;
pub use self::sequence::{Sequence, Set};

pub trait ASNTag {
    /// Lower a typed tag into the generic wire-ready form.
    ///
    /// Only the payload encoding differs between types; class and id are
    /// encoded uniformly once everything is a `StructureTag`.
    fn into_structure(self) -> structure::StructureTag;
}

/// The ASN.1 types needed for the LDAP subset, not the full standard.
#[derive(Clone, Debug, PartialEq)]
pub enum Tag {
    Integer(integer::Integer),
    Enumerated(integer::Enumerated),
    Sequence(sequence::Sequence),
    Set(sequence::Set),
    OctetString(octetstring::OctetString),
    Boolean(boolean::Boolean),
    Null(null::Null),
    ExplicitTag(explicit::ExplicitTag),
    StructureTag(structure::StructureTag),
}

impl ASNTag for Tag {
    fn into_structure(self) -> structure::StructureTag {
        match self {
            Tag::Integer(i) => i.into_structure(),
            Tag::Enumerated(i) => i.into_structure(),
            Tag::Sequence(i) => i.into_structure(),
            Tag::Set(i) => i.into_structure(),
            Tag::OctetString(i) => i.into_structure(),
            Tag::Boolean(i) => i.into_structure(),
            Tag::Null(i) => i.into_structure(),
            Tag::ExplicitTag(i) => i.into_structure(),
            Tag::StructureTag(s) => s,
        }
    }
}
