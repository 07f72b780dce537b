//! Translation of LDAP filters into Exchange GAL criteria.
//!
//! The GAL only answers prefix searches on a handful of indexed codes, so
//! only the filter shapes common mail clients emit are honored: a
//! presence test on `objectclass`, substring terms, and an OR of
//! substring terms. Everything else is logged and dropped.

use std::collections::HashMap;

use lazy_static::lazy_static;
use log::warn;

use lber::common::TagClass;
use lber::structure::{StructureTag, PL};

use crate::proto::decode_string;

pub const LDAP_FILTER_AND: u64 = 0;
pub const LDAP_FILTER_OR: u64 = 1;
pub const LDAP_FILTER_NOT: u64 = 2;
pub const LDAP_FILTER_EQUALITY: u64 = 3;
pub const LDAP_FILTER_SUBSTRINGS: u64 = 4;
pub const LDAP_FILTER_GE: u64 = 5;
pub const LDAP_FILTER_LE: u64 = 6;
pub const LDAP_FILTER_PRESENT: u64 = 7;
pub const LDAP_FILTER_APPROX: u64 = 8;

pub const LDAP_SUBSTRING_INITIAL: u64 = 0;
pub const LDAP_SUBSTRING_ANY: u64 = 1;
pub const LDAP_SUBSTRING_FINAL: u64 = 2;

lazy_static! {
    /// LDAP attribute name to indexed Exchange GAL search code.
    static ref CRITERIA_MAP: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("mail", "FN");
        map.insert("displayname", "DN");
        map.insert("cn", "DN");
        map.insert("givenname", "FN");
        map.insert("sn", "LN");
        map.insert("title", "TL");
        map.insert("company", "CP");
        map.insert("o", "CP");
        map.insert("l", "OF");
        map.insert("department", "DP");
        map
    };
}

/// Exchange search criteria: GAL code to search string. The special pair
/// `objectclass = *` marks a match-everything filter.
pub type SearchCriteria = HashMap<String, String>;

pub fn parse_filter(filter: StructureTag) -> SearchCriteria {
    let mut criteria = SearchCriteria::new();
    collect(filter, &mut criteria);
    criteria
}

fn collect(filter: StructureTag, criteria: &mut SearchCriteria) {
    if filter.class != TagClass::Context {
        warn!("Unsupported filter tag class {:?}", filter.class);
        return;
    }
    match (filter.id, filter.payload) {
        (LDAP_FILTER_PRESENT, PL::P(octets)) => {
            let attribute = decode_string(octets).to_lowercase();
            if attribute == "objectclass" {
                criteria.insert("objectclass".to_string(), "*".to_string());
            } else {
                warn!("Unsupported presence filter attribute: {}", attribute);
            }
        }
        (LDAP_FILTER_OR, PL::C(children)) => {
            for child in children {
                if child.class == TagClass::Context && child.id == LDAP_FILTER_SUBSTRINGS {
                    collect(child, criteria);
                } else {
                    warn!("Unsupported filter type {} inside OR", child.id);
                }
            }
        }
        (LDAP_FILTER_SUBSTRINGS, PL::C(children)) => {
            collect_substrings(children, criteria);
        }
        (id, _) => {
            // AND, NOT, GE, LE, APPROX, EQUALITY and anything newer.
            warn!("Unsupported filter type: {}", id);
        }
    }
}

fn collect_substrings(children: Vec<StructureTag>, criteria: &mut SearchCriteria) {
    let mut parts = children.into_iter();
    let attribute = match parts.next().and_then(|t| t.expect_primitive()) {
        Some(octets) => decode_string(octets).to_lowercase(),
        None => {
            warn!("Malformed substring filter: missing attribute");
            return;
        }
    };
    // The substrings sequence holds initial/any/final terms; whichever
    // comes first is used as the search prefix, since the GAL cannot
    // express anything more precise.
    let value = parts
        .next()
        .and_then(|t| t.expect_constructed())
        .and_then(|subs| subs.into_iter().next())
        .filter(|sub| sub.class == TagClass::Context && sub.id <= LDAP_SUBSTRING_FINAL)
        .and_then(|sub| sub.expect_primitive())
        .map(decode_string);
    let value = match value {
        Some(value) => value,
        None => {
            warn!("Malformed substring filter for attribute {}", attribute);
            return;
        }
    };
    match CRITERIA_MAP.get(attribute.as_str()) {
        Some(code) => {
            criteria.insert((*code).to_string(), value);
        }
        None => warn!("Unsupported filter attribute: {}", attribute),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use lber::structures::{ASNTag, OctetString, Sequence, Tag};

    fn substring_filter(attribute: &str, prefix: &str) -> Tag {
        Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: LDAP_FILTER_SUBSTRINGS,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: attribute.as_bytes().to_vec(),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: vec![Tag::OctetString(OctetString {
                        id: LDAP_SUBSTRING_INITIAL,
                        class: TagClass::Context,
                        inner: prefix.as_bytes().to_vec(),
                    })],
                    ..Default::default()
                }),
            ],
        })
    }

    fn present_filter(attribute: &str) -> Tag {
        Tag::OctetString(OctetString {
            id: LDAP_FILTER_PRESENT,
            class: TagClass::Context,
            inner: attribute.as_bytes().to_vec(),
        })
    }

    #[test]
    fn objectclass_presence() {
        let criteria = parse_filter(present_filter("objectClass").into_structure());
        assert_eq!(criteria.len(), 1);
        assert_eq!(criteria.get("objectclass").map(String::as_str), Some("*"));
    }

    #[test]
    fn substring_translates_attribute() {
        let criteria = parse_filter(substring_filter("cn", "sm").into_structure());
        assert_eq!(criteria.get("DN").map(String::as_str), Some("sm"));
    }

    #[test]
    fn or_of_substrings_merges() {
        let or = Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: LDAP_FILTER_OR,
            inner: vec![
                substring_filter("givenname", "jo"),
                substring_filter("sn", "do"),
            ],
        });
        let criteria = parse_filter(or.into_structure());
        assert_eq!(criteria.get("FN").map(String::as_str), Some("jo"));
        assert_eq!(criteria.get("LN").map(String::as_str), Some("do"));
    }

    #[test]
    fn unmapped_attribute_is_dropped() {
        let criteria = parse_filter(substring_filter("carLicense", "x").into_structure());
        assert!(criteria.is_empty());
    }

    #[test]
    fn unsupported_shapes_are_dropped() {
        let and = Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: LDAP_FILTER_AND,
            inner: vec![substring_filter("cn", "sm")],
        });
        assert!(parse_filter(and.into_structure()).is_empty());
    }

    #[test]
    fn final_substring_still_used_as_prefix() {
        let filter = Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: LDAP_FILTER_SUBSTRINGS,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: b"mail".to_vec(),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: vec![Tag::OctetString(OctetString {
                        id: LDAP_SUBSTRING_FINAL,
                        class: TagClass::Context,
                        inner: b"smith".to_vec(),
                    })],
                    ..Default::default()
                }),
            ],
        });
        let criteria = parse_filter(filter.into_structure());
        assert_eq!(criteria.get("FN").map(String::as_str), Some("smith"));
    }
}
