//! LDAP message types for the subset a GAL gateway serves.
//!
//! Requests are picked apart from the generic [`StructureTag`] form
//! ([RFC 4511, section 4.1.1](https://tools.ietf.org/html/rfc4511#section-4.1.1));
//! responses are assembled from typed `lber` tags and lowered back for
//! encoding. Controls on requests are tolerated and ignored.

use std::convert::TryFrom;

use lber::common::TagClass;
use lber::parse::ber_to_i64;
use lber::structure::StructureTag;
use lber::structures::{ASNTag, Enumerated, Integer, OctetString, Sequence, Set, Tag};
use lber::universal::Types;

use crate::error::GatewayError;

// Application-class operation tags.
pub const LDAP_REQ_BIND: u64 = 0;
pub const LDAP_REQ_UNBIND: u64 = 2;
pub const LDAP_REQ_SEARCH: u64 = 3;

pub const LDAP_REP_BIND: u64 = 1;
pub const LDAP_REP_SEARCH: u64 = 4;
pub const LDAP_REP_RESULT: u64 = 5;

// Result codes.
pub const LDAP_SUCCESS: i64 = 0;
pub const LDAP_SIZE_LIMIT_EXCEEDED: i64 = 4;
pub const LDAP_INVALID_CREDENTIALS: i64 = 49;
pub const LDAP_OTHER: i64 = 80;

// Search scopes.
pub const SCOPE_BASE_OBJECT: i64 = 0;

/// One framed client request: the echoed message ID and the operation.
#[derive(Debug, Clone, PartialEq)]
pub struct LdapMsg {
    pub msgid: i32,
    pub op: LdapOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LdapOp {
    BindRequest {
        version: i32,
        dn: String,
        password: String,
    },
    UnbindRequest,
    SearchRequest(SearchRequest),
    /// Anything this gateway does not implement. The dispatcher answers
    /// these with an "Unsupported operation" result.
    Unknown(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: i64,
    pub size_limit: i64,
    /// The raw filter term, translated later into Exchange criteria.
    pub filter: Option<StructureTag>,
}

impl TryFrom<StructureTag> for LdapMsg {
    type Error = GatewayError;

    fn try_from(value: StructureTag) -> Result<Self, GatewayError> {
        let seq = value
            .match_class(TagClass::Universal)
            .and_then(|t| t.match_id(Types::Sequence as u64))
            .and_then(|t| t.expect_constructed())
            .ok_or_else(|| GatewayError::Protocol("expected LDAPMessage sequence".to_string()))?;

        // messageID, protocolOp, then optional controls we ignore.
        let mut parts = seq.into_iter();
        let msgid = parts
            .next()
            .and_then(|t| t.match_class(TagClass::Universal))
            .and_then(|t| t.match_id(Types::Integer as u64))
            .and_then(|t| t.expect_primitive())
            .and_then(|octets| ber_to_i64(&octets))
            .map(|i| i as i32)
            .ok_or_else(|| GatewayError::Protocol("bad messageID".to_string()))?;
        let op = parts
            .next()
            .ok_or_else(|| GatewayError::Protocol("missing protocolOp".to_string()))?;
        // From here on the messageID is known; a bad operation body is
        // answered with LDAP_OTHER rather than closing the connection.
        let op = LdapOp::try_from(op).map_err(|e| match e {
            GatewayError::Protocol(text) => GatewayError::Request { msgid, text },
            e => e,
        })?;

        Ok(LdapMsg { msgid, op })
    }
}

impl TryFrom<StructureTag> for LdapOp {
    type Error = GatewayError;

    fn try_from(value: StructureTag) -> Result<Self, GatewayError> {
        if value.class != TagClass::Application {
            return Ok(LdapOp::Unknown(value.id));
        }
        match value.id {
            LDAP_REQ_BIND => {
                let inner = value
                    .expect_constructed()
                    .ok_or_else(|| GatewayError::Protocol("bind request not constructed".to_string()))?;
                parse_bind(inner)
            }
            LDAP_REQ_UNBIND => Ok(LdapOp::UnbindRequest),
            LDAP_REQ_SEARCH => {
                let inner = value
                    .expect_constructed()
                    .ok_or_else(|| GatewayError::Protocol("search request not constructed".to_string()))?;
                Ok(LdapOp::SearchRequest(SearchRequest::try_from(inner)?))
            }
            id => Ok(LdapOp::Unknown(id)),
        }
    }
}

fn parse_bind(inner: Vec<StructureTag>) -> Result<LdapOp, GatewayError> {
    let mut parts = inner.into_iter();
    let version = parts
        .next()
        .and_then(|t| t.match_class(TagClass::Universal))
        .and_then(|t| t.match_id(Types::Integer as u64))
        .and_then(|t| t.expect_primitive())
        .and_then(|octets| ber_to_i64(&octets))
        .map(|i| i as i32)
        .ok_or_else(|| GatewayError::Protocol("bad bind version".to_string()))?;
    let dn = parts
        .next()
        .and_then(|t| t.match_class(TagClass::Universal))
        .and_then(|t| t.match_id(Types::OctetString as u64))
        .and_then(|t| t.expect_primitive())
        .map(decode_string)
        .ok_or_else(|| GatewayError::Protocol("bad bind DN".to_string()))?;
    // Simple authentication is context tag 0; a SASL choice (or nothing)
    // leaves the password empty, which the dispatcher treats as anonymous.
    let password = parts
        .next()
        .and_then(|t| t.match_class(TagClass::Context))
        .and_then(|t| t.match_id(0))
        .and_then(|t| t.expect_primitive())
        .map(decode_string)
        .unwrap_or_default();

    Ok(LdapOp::BindRequest {
        version,
        dn,
        password,
    })
}

impl TryFrom<Vec<StructureTag>> for SearchRequest {
    type Error = GatewayError;

    fn try_from(inner: Vec<StructureTag>) -> Result<Self, GatewayError> {
        let mut parts = inner.into_iter();
        let base = parts
            .next()
            .and_then(|t| t.expect_primitive())
            .map(decode_string)
            .ok_or_else(|| GatewayError::Protocol("bad search base".to_string()))?;
        let scope = take_int(parts.next(), "bad search scope")?;
        // derefAliases is parsed to advance and then ignored.
        take_int(parts.next(), "bad derefAliases")?;
        let size_limit = take_int(parts.next(), "bad sizeLimit")?;
        // timeLimit and typesOnly are likewise ignored.
        take_int(parts.next(), "bad timeLimit")?;
        parts
            .next()
            .ok_or_else(|| GatewayError::Protocol("bad typesOnly".to_string()))?;
        let filter = parts.next();

        Ok(SearchRequest {
            base,
            scope,
            size_limit,
            filter,
        })
    }
}

fn take_int(tag: Option<StructureTag>, what: &str) -> Result<i64, GatewayError> {
    tag.and_then(|t| t.expect_primitive())
        .and_then(|octets| ber_to_i64(&octets))
        .ok_or_else(|| GatewayError::Protocol(what.to_string()))
}

/// Decode a request string: UTF-8 with an ISO-8859-1 fallback for
/// pre-version-3 clients.
pub fn decode_string(octets: Vec<u8>) -> String {
    match String::from_utf8(octets) {
        Ok(s) => s,
        Err(e) => e.into_bytes().iter().map(|&b| b as char).collect(),
    }
}

/// Encode a response string: UTF-8 for LDAPv3, ISO-8859-1 otherwise.
/// Characters outside Latin-1 have no v2 representation and degrade to `?`.
pub fn encode_string(s: &str, utf8: bool) -> Vec<u8> {
    if utf8 {
        s.as_bytes().to_vec()
    } else {
        s.chars()
            .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
            .collect()
    }
}

fn ldap_message(msgid: i32, op: Tag) -> StructureTag {
    Tag::Sequence(Sequence {
        inner: vec![
            Tag::Integer(Integer {
                inner: i64::from(msgid),
                ..Default::default()
            }),
            op,
        ],
        ..Default::default()
    })
    .into_structure()
}

fn ldap_result(id: u64, msgid: i32, rc: i64, message: &str, utf8: bool) -> StructureTag {
    ldap_message(
        msgid,
        Tag::Sequence(Sequence {
            class: TagClass::Application,
            id,
            inner: vec![
                Tag::Enumerated(Enumerated {
                    inner: rc,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    // matchedDN, always empty here
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: encode_string(message, utf8),
                    ..Default::default()
                }),
            ],
        }),
    )
}

pub fn bind_response(msgid: i32, rc: i64, message: &str, utf8: bool) -> StructureTag {
    ldap_result(LDAP_REP_BIND, msgid, rc, message, utf8)
}

pub fn search_result_done(msgid: i32, rc: i64, message: &str, utf8: bool) -> StructureTag {
    ldap_result(LDAP_REP_RESULT, msgid, rc, message, utf8)
}

/// One search result entry: the DN and a partial attribute list, each
/// attribute a sequence of type name plus a set of values.
pub fn search_result_entry(
    msgid: i32,
    dn: &str,
    attributes: &[(String, Vec<String>)],
    utf8: bool,
) -> StructureTag {
    let attr_list = attributes
        .iter()
        .map(|(name, values)| {
            Tag::Sequence(Sequence {
                inner: vec![
                    Tag::OctetString(OctetString {
                        inner: encode_string(name, utf8),
                        ..Default::default()
                    }),
                    Tag::Set(Set {
                        inner: values
                            .iter()
                            .map(|v| {
                                Tag::OctetString(OctetString {
                                    inner: encode_string(v, utf8),
                                    ..Default::default()
                                })
                            })
                            .collect(),
                        ..Default::default()
                    }),
                ],
                ..Default::default()
            })
        })
        .collect();

    ldap_message(
        msgid,
        Tag::Sequence(Sequence {
            class: TagClass::Application,
            id: LDAP_REP_SEARCH,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: encode_string(dn, utf8),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: attr_list,
                    ..Default::default()
                }),
            ],
        }),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn simple_bind(msgid: i32, dn: &str, password: &str) -> StructureTag {
        ldap_message(
            msgid,
            Tag::Sequence(Sequence {
                class: TagClass::Application,
                id: LDAP_REQ_BIND,
                inner: vec![
                    Tag::Integer(Integer {
                        inner: 3,
                        ..Default::default()
                    }),
                    Tag::OctetString(OctetString {
                        inner: dn.as_bytes().to_vec(),
                        ..Default::default()
                    }),
                    Tag::OctetString(OctetString {
                        id: 0,
                        class: TagClass::Context,
                        inner: password.as_bytes().to_vec(),
                    }),
                ],
            }),
        )
    }

    #[test]
    fn parses_simple_bind() {
        let msg = LdapMsg::try_from(simple_bind(7, "jdoe", "secret")).expect("parse");
        assert_eq!(msg.msgid, 7);
        assert_eq!(
            msg.op,
            LdapOp::BindRequest {
                version: 3,
                dn: "jdoe".to_string(),
                password: "secret".to_string(),
            }
        );
    }

    #[test]
    fn malformed_operation_body_carries_msgid() {
        let msg = ldap_message(
            7,
            Tag::Sequence(Sequence {
                class: TagClass::Application,
                id: LDAP_REQ_BIND,
                inner: vec![],
            }),
        );
        match LdapMsg::try_from(msg) {
            Err(GatewayError::Request { msgid, .. }) => assert_eq!(msgid, 7),
            other => panic!("expected Request error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_operation_keeps_msgid() {
        let msg = ldap_message(
            42,
            Tag::Sequence(Sequence {
                class: TagClass::Application,
                id: 10, // DelRequest, unsupported
                inner: vec![],
            }),
        );
        let msg = LdapMsg::try_from(msg).expect("parse");
        assert_eq!(msg.msgid, 42);
        assert_eq!(msg.op, LdapOp::Unknown(10));
    }

    #[test]
    fn string_encoding_by_version() {
        assert_eq!(encode_string("héllo", true), "héllo".as_bytes().to_vec());
        assert_eq!(
            encode_string("héllo", false),
            vec![b'h', 0xe9, b'l', b'l', b'o']
        );
        // Latin-1 bytes survive a decode round trip.
        assert_eq!(decode_string(vec![b'h', 0xe9]), "hé".to_string());
        for b in 0u32..256 {
            let c = char::from_u32(b).expect("latin-1 char");
            let encoded = encode_string(&c.to_string(), false);
            assert_eq!(encoded, vec![b as u8]);
        }
    }
}
