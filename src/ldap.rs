//! The LDAP connection: per-socket request loop, request dispatch, and
//! search entry serialization.
//!
//! A connection is single-threaded end to end: requests are handled in
//! receive order and every response is fully written before the next
//! request is read. Binding acquires an Exchange session; Unbind or
//! connection close releases it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::codec::LdapCodec;
use crate::error::GatewayError;
use crate::exchange::{ExchangeSession, Person, SessionFactory};
use crate::filter::{self, SearchCriteria};
use crate::proto::{
    self, LdapMsg, LdapOp, SearchRequest, LDAP_INVALID_CREDENTIALS, LDAP_OTHER,
    LDAP_SIZE_LIMIT_EXCEEDED, LDAP_SUCCESS, SCOPE_BASE_OBJECT,
};
use crate::settings::Settings;

/// DN suffix under which every GAL entry is published.
pub const BASE_CONTEXT: &str = "ou=people";

/// Hard ceiling on search result size, whatever the client asks for.
pub const MAX_SIZE_LIMIT: i64 = 100;

/// Result sets at most this large get the per-entry gallookup enrichment.
const GAL_LOOKUP_THRESHOLD: usize = 10;

lazy_static! {
    /// LDAP attribute name to source Exchange GAL field, in emission order.
    static ref ATTRIBUTE_MAP: Vec<(&'static str, &'static str)> = vec![
        ("uid", "AN"),
        ("mail", "EM"),
        ("displayName", "DN"),
        ("telephoneNumber", "PH"),
        ("l", "OFFICE"),
        ("company", "CP"),
        ("title", "TL"),
        ("cn", "DN"),
        ("givenName", "first"),
        ("initials", "initials"),
        ("sn", "last"),
        ("street", "street"),
        ("st", "state"),
        ("postalCode", "zip"),
        ("c", "country"),
        ("departement", "department"),
        ("mobile", "mobile"),
    ];
}

enum Flow {
    Continue,
    Close,
}

pub struct LdapConnection {
    factory: Arc<dyn SessionFactory>,
    settings: Arc<Settings>,
    version: i32,
    session: Option<Arc<dyn ExchangeSession>>,
}

impl LdapConnection {
    pub fn new(factory: Arc<dyn SessionFactory>, settings: Arc<Settings>) -> LdapConnection {
        LdapConnection {
            factory,
            settings,
            version: 3,
            session: None,
        }
    }

    fn utf8(&self) -> bool {
        self.version >= 3
    }

    /// Drive one client connection to completion. Read timeouts and EOF
    /// end the loop silently; a malformed operation body with a known
    /// messageID is answered with LDAP_OTHER, while framing-level
    /// errors close the connection.
    pub async fn run<S>(mut self, stream: S, read_timeout: Duration)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, LdapCodec);
        loop {
            let msg = match timeout(read_timeout, framed.next()).await {
                Err(_) => {
                    debug!("client read timed out, closing");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(GatewayError::Io { source }))) => {
                    debug!("client i/o error: {}", source);
                    break;
                }
                Ok(Some(Err(GatewayError::Request { msgid, text }))) => {
                    warn!("bad request: {}", text);
                    let utf8 = self.utf8();
                    match framed
                        .send(proto::search_result_done(msgid, LDAP_OTHER, &text, utf8))
                        .await
                    {
                        Ok(()) => continue,
                        Err(e) => {
                            debug!("failed to write error response: {}", e);
                            break;
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    // Framing is lost; there is no messageID to echo.
                    warn!("closing connection: {}", e);
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };
            match self.handle(msg, &mut framed).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    debug!("failed to write response: {}", e);
                    break;
                }
            }
        }
        if let Some(session) = self.session.take() {
            self.factory.release(session).await;
        }
    }

    /// Dispatch one request. `Err` here means the client socket is gone;
    /// anything recoverable has already been answered on the wire.
    async fn handle<S>(
        &mut self,
        msg: LdapMsg,
        framed: &mut Framed<S, LdapCodec>,
    ) -> Result<Flow, GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match msg.op {
            LdapOp::BindRequest {
                version,
                dn,
                password,
            } => {
                self.version = version;
                let utf8 = self.utf8();
                if !dn.is_empty() && !password.is_empty() {
                    match self.factory.acquire(&dn, &password).await {
                        Ok(session) => {
                            info!("LDAP bind for {}", dn);
                            self.session = Some(session);
                            framed
                                .send(proto::bind_response(msg.msgid, LDAP_SUCCESS, "", utf8))
                                .await?;
                        }
                        Err(GatewayError::AuthFailed) => {
                            warn!("LDAP bind failed for {}", dn);
                            framed
                                .send(proto::bind_response(
                                    msg.msgid,
                                    LDAP_INVALID_CREDENTIALS,
                                    "",
                                    utf8,
                                ))
                                .await?;
                        }
                        Err(e) => {
                            warn!("LDAP bind error for {}: {}", dn, e);
                            framed
                                .send(proto::bind_response(
                                    msg.msgid,
                                    LDAP_OTHER,
                                    &e.to_string(),
                                    utf8,
                                ))
                                .await?;
                        }
                    }
                } else {
                    debug!("anonymous LDAP bind");
                    framed
                        .send(proto::bind_response(msg.msgid, LDAP_SUCCESS, "", utf8))
                        .await?;
                }
                Ok(Flow::Continue)
            }
            LdapOp::UnbindRequest => {
                // No response to an Unbind.
                Ok(Flow::Close)
            }
            LdapOp::SearchRequest(request) => {
                match self.search(msg.msgid, request, framed).await {
                    Ok(()) => {}
                    Err(e @ GatewayError::Io { .. }) => return Err(e),
                    Err(e) => {
                        warn!("search failed: {}", e);
                        framed
                            .send(proto::search_result_done(
                                msg.msgid,
                                LDAP_OTHER,
                                &e.to_string(),
                                self.utf8(),
                            ))
                            .await?;
                    }
                }
                Ok(Flow::Continue)
            }
            LdapOp::Unknown(id) => {
                debug!("unsupported operation {}", id);
                framed
                    .send(proto::search_result_done(
                        msg.msgid,
                        LDAP_OTHER,
                        "Unsupported operation",
                        self.utf8(),
                    ))
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn search<S>(
        &mut self,
        msgid: i32,
        request: SearchRequest,
        framed: &mut Framed<S, LdapCodec>,
    ) -> Result<(), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let utf8 = self.utf8();
        let size_limit = effective_size_limit(request.size_limit);
        let base = request.base.as_str();
        let mut persons: BTreeMap<String, Person> = BTreeMap::new();

        if request.scope == SCOPE_BASE_OBJECT {
            if base.is_empty() {
                debug!("root DSE search");
                framed
                    .send(proto::search_result_entry(
                        msgid,
                        "Root DSE",
                        &[
                            ("objectClass".to_string(), vec!["top".to_string()]),
                            ("namingContexts".to_string(), vec![BASE_CONTEXT.to_string()]),
                        ],
                        utf8,
                    ))
                    .await?;
                framed
                    .send(proto::search_result_done(msgid, LDAP_SUCCESS, "", utf8))
                    .await?;
                return Ok(());
            } else if let Some(uid) = uid_from_dn(base) {
                if let Some(session) = self.session.clone() {
                    merge(
                        &mut persons,
                        session.gal_find("AN", uid).await?,
                        size_limit,
                    );
                }
            } else if base.eq_ignore_ascii_case(BASE_CONTEXT) {
                let url = self.settings.get_string("davmail.url", "");
                framed
                    .send(proto::search_result_entry(
                        msgid,
                        BASE_CONTEXT,
                        &[
                            (
                                "objectClass".to_string(),
                                vec!["top".to_string(), "organizationalUnit".to_string()],
                            ),
                            (
                                "description".to_string(),
                                vec![format!("DavMail Gateway LDAP for {}", url)],
                            ),
                        ],
                        utf8,
                    ))
                    .await?;
                framed
                    .send(proto::search_result_done(msgid, LDAP_SUCCESS, "", utf8))
                    .await?;
                return Ok(());
            }
        } else if base.eq_ignore_ascii_case(BASE_CONTEXT) {
            match self.session.clone() {
                Some(session) => {
                    let criteria = match request.filter {
                        Some(filter) => filter::parse_filter(filter),
                        None => SearchCriteria::new(),
                    };
                    self.gal_search(&session, &criteria, &mut persons, size_limit)
                        .await?;
                }
                None => debug!("unauthenticated search on {} ignored", base),
            }
        } else {
            debug!("search base {} out of scope", base);
        }

        if !persons.is_empty() && persons.len() <= GAL_LOOKUP_THRESHOLD {
            if let Some(session) = self.session.clone() {
                for person in persons.values_mut() {
                    if let Err(e) = session.gal_lookup(person).await {
                        warn!("gallookup failed: {}", e);
                    }
                }
            }
        }

        let count = persons.len();
        for (account_name, person) in persons {
            let dn = format!("uid={},{}", account_name, BASE_CONTEXT);
            framed
                .send(proto::search_result_entry(
                    msgid,
                    &dn,
                    &person_attributes(&person),
                    utf8,
                ))
                .await?;
        }
        let rc = if count == size_limit {
            LDAP_SIZE_LIMIT_EXCEEDED
        } else {
            LDAP_SUCCESS
        };
        framed
            .send(proto::search_result_done(msgid, rc, "", utf8))
            .await?;
        Ok(())
    }

    /// Resolve filter criteria against the GAL. A bare `objectclass=*`
    /// becomes a sweep over account name initials, since the GAL has no
    /// match-everything query.
    async fn gal_search(
        &self,
        session: &Arc<dyn ExchangeSession>,
        criteria: &SearchCriteria,
        persons: &mut BTreeMap<String, Person>,
        size_limit: usize,
    ) -> Result<(), GatewayError> {
        let match_all = criteria.len() == 1
            && criteria.get("objectclass").map(String::as_str) == Some("*");
        if match_all {
            for initial in b'A'..b'Z' {
                if persons.len() == size_limit {
                    break;
                }
                let initial = (initial as char).to_string();
                merge(persons, session.gal_find("AN", &initial).await?, size_limit);
            }
        } else {
            for (code, value) in criteria {
                if code == "objectclass" {
                    continue;
                }
                if persons.len() == size_limit {
                    break;
                }
                merge(persons, session.gal_find(code, value).await?, size_limit);
            }
        }
        Ok(())
    }
}

fn effective_size_limit(requested: i64) -> usize {
    if requested <= 0 || requested > MAX_SIZE_LIMIT {
        MAX_SIZE_LIMIT as usize
    } else {
        requested as usize
    }
}

/// Extract `<uid>` from a `uid=<uid>,...` DN.
fn uid_from_dn(dn: &str) -> Option<&str> {
    let rest = dn.strip_prefix("uid=")?;
    rest.find(',').map(|comma| &rest[..comma])
}

/// Merge a galFind result set, keyed by account name; an entry seen
/// under two keys keeps the latest record. Stops at the size limit.
fn merge(
    persons: &mut BTreeMap<String, Person>,
    found: std::collections::HashMap<String, Person>,
    size_limit: usize,
) {
    for (account_name, person) in found {
        if persons.len() == size_limit && !persons.contains_key(&account_name) {
            break;
        }
        persons.insert(account_name, person);
    }
}

/// Project a person record into LDAP attributes, omitting absent fields.
fn person_attributes(person: &Person) -> Vec<(String, Vec<String>)> {
    ATTRIBUTE_MAP
        .iter()
        .filter_map(|(attribute, field)| {
            person
                .get(*field)
                .map(|value| (attribute.to_string(), vec![value.clone()]))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn size_limit_normalization() {
        assert_eq!(effective_size_limit(0), 100);
        assert_eq!(effective_size_limit(500), 100);
        assert_eq!(effective_size_limit(50), 50);
        assert_eq!(effective_size_limit(100), 100);
        assert_eq!(effective_size_limit(-1), 100);
    }

    #[test]
    fn uid_extraction() {
        assert_eq!(uid_from_dn("uid=jdoe,ou=people"), Some("jdoe"));
        assert_eq!(uid_from_dn("uid=jdoe"), None);
        assert_eq!(uid_from_dn("cn=jdoe,ou=people"), None);
    }

    #[test]
    fn attributes_follow_gal_fields() {
        let mut person = Person::new();
        person.insert("AN".to_string(), "jdoe".to_string());
        person.insert("DN".to_string(), "John Doe".to_string());
        person.insert("department".to_string(), "Sales".to_string());
        let attributes = person_attributes(&person);
        assert!(attributes.contains(&("uid".to_string(), vec!["jdoe".to_string()])));
        // displayName and cn both project from the DN field.
        assert!(attributes.contains(&("displayName".to_string(), vec!["John Doe".to_string()])));
        assert!(attributes.contains(&("cn".to_string(), vec!["John Doe".to_string()])));
        // The historical attribute spelling, not "department".
        assert!(attributes.contains(&("departement".to_string(), vec!["Sales".to_string()])));
        assert!(!attributes.iter().any(|(name, _)| name == "mail"));
    }

    #[test]
    fn merge_stops_at_limit() {
        let mut persons = BTreeMap::new();
        let mut found = std::collections::HashMap::new();
        for i in 0..5 {
            let mut person = Person::new();
            person.insert("AN".to_string(), format!("user{}", i));
            found.insert(format!("user{}", i), person);
        }
        merge(&mut persons, found, 3);
        assert_eq!(persons.len(), 3);
    }
}
