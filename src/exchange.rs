//! Exchange session interface and its OWA-backed implementation.
//!
//! The LDAP core only needs two operations: a prefix search on one
//! indexed GAL code, and a per-entry lookup that fills the extended
//! fields. Both are served by the Outlook Web Access `galfind` and
//! `gallookup` commands, which answer with XML when the IE user agent is
//! presented.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use xml::reader::{EventReader, XmlEvent};

use crate::error::GatewayError;
use crate::http_client::{Credentials, HttpClientFacade};
use crate::settings::Settings;

/// One Global Address List entry: short Exchange codes (`AN`, `EM`,
/// `DN`, …) to values. `gal_lookup` adds the extended fields (`first`,
/// `initials`, `last`, `street`, `state`, `zip`, `country`,
/// `department`, `mobile`).
pub type Person = HashMap<String, String>;

#[async_trait]
pub trait ExchangeSession: Send + Sync {
    /// Case-insensitive GAL prefix search on one indexed Exchange code
    /// (`AN`, `FN`, `LN`, `DN`, `TL`, `CP`, `OF`, `DP`), returning
    /// matches keyed by account name.
    async fn gal_find(
        &self,
        code: &str,
        value: &str,
    ) -> Result<HashMap<String, Person>, GatewayError>;

    /// Fill the extended fields of a person record in place.
    async fn gal_lookup(&self, person: &mut Person) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Authenticate against Exchange and hand out a session.
    /// Bad credentials surface as [`GatewayError::AuthFailed`].
    async fn acquire(
        &self,
        user: &str,
        password: &str,
    ) -> Result<Arc<dyn ExchangeSession>, GatewayError>;

    /// Return a session once its connection unbinds or closes.
    async fn release(&self, session: Arc<dyn ExchangeSession>);
}

pub struct DavSessionFactory {
    http: Arc<HttpClientFacade>,
    settings: Arc<Settings>,
}

impl DavSessionFactory {
    pub fn new(http: Arc<HttpClientFacade>, settings: Arc<Settings>) -> DavSessionFactory {
        DavSessionFactory { http, settings }
    }
}

#[async_trait]
impl SessionFactory for DavSessionFactory {
    async fn acquire(
        &self,
        user: &str,
        password: &str,
    ) -> Result<Arc<dyn ExchangeSession>, GatewayError> {
        let url = self.settings.get_string("davmail.url", "");
        let credentials = Credentials {
            user: user.to_string(),
            password: password.to_string(),
        };
        let response = self
            .http
            .execute_follow_redirects(&url, Some(&credentials))
            .await?;
        let status = response.status().as_u16();
        let _ = response.bytes().await;
        match status {
            200 => {
                debug!("Exchange session opened for {}", user);
                Ok(Arc::new(DavExchangeSession {
                    http: self.http.clone(),
                    credentials,
                }))
            }
            401 | 403 | 440 => Err(GatewayError::AuthFailed),
            status => Err(GatewayError::Backend(format!(
                "unexpected status {} from {}",
                status, url
            ))),
        }
    }

    async fn release(&self, _session: Arc<dyn ExchangeSession>) {
        // Sessions hold no server-side state beyond the pooled
        // connections, which outlive them by design.
    }
}

pub struct DavExchangeSession {
    http: Arc<HttpClientFacade>,
    credentials: Credentials,
}

#[async_trait]
impl ExchangeSession for DavExchangeSession {
    async fn gal_find(
        &self,
        code: &str,
        value: &str,
    ) -> Result<HashMap<String, Person>, GatewayError> {
        let path = format!(
            "/public/?Cmd=galfind&{}={}",
            code,
            utf8_percent_encode(value, NON_ALPHANUMERIC)
        );
        let response = self
            .http
            .execute_follow_redirects(&path, Some(&self.credentials))
            .await?;
        let body = response.text().await?;
        let mut results = HashMap::new();
        for person in parse_gal_items(&body)? {
            match person.get("AN") {
                Some(an) => {
                    results.insert(an.clone(), person);
                }
                None => warn!("galfind item without AN dropped"),
            }
        }
        debug!("galfind {}={} returned {} entries", code, value, results.len());
        Ok(results)
    }

    async fn gal_lookup(&self, person: &mut Person) -> Result<(), GatewayError> {
        let address = match person.get("EM") {
            Some(address) => address.clone(),
            // Nothing to look up without a mail address.
            None => return Ok(()),
        };
        let path = format!(
            "/public/?Cmd=gallookup&ADDR={}",
            utf8_percent_encode(&address, NON_ALPHANUMERIC)
        );
        let response = self
            .http
            .execute_follow_redirects(&path, Some(&self.credentials))
            .await?;
        let body = response.text().await?;
        for item in parse_gal_items(&body)? {
            for (field, value) in item {
                person.entry(field).or_insert(value);
            }
        }
        Ok(())
    }
}

/// Parse the `<item>` elements of a galfind/gallookup response into
/// field maps. Child element names are the Exchange field codes.
pub fn parse_gal_items(body: &str) -> Result<Vec<Person>, GatewayError> {
    let mut items = Vec::new();
    let mut current: Option<Person> = None;
    let mut field: Option<String> = None;
    for event in EventReader::new(body.as_bytes()) {
        let event =
            event.map_err(|e| GatewayError::Backend(format!("invalid galfind XML: {}", e)))?;
        match event {
            XmlEvent::StartElement { name, .. } => {
                if name.local_name == "item" {
                    current = Some(Person::new());
                } else if current.is_some() {
                    field = Some(name.local_name);
                }
            }
            XmlEvent::Characters(text) => {
                if let (Some(person), Some(field)) = (current.as_mut(), field.as_ref()) {
                    person.insert(field.clone(), text);
                }
            }
            XmlEvent::EndElement { name } => {
                if name.local_name == "item" {
                    if let Some(person) = current.take() {
                        items.push(person);
                    }
                }
                field = None;
            }
            _ => {}
        }
    }
    Ok(items)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_galfind_items() {
        let body = r#"<?xml version="1.0"?>
            <galfind>
              <search>sm</search>
              <item>
                <AN>jsmith</AN>
                <DN>John Smith</DN>
                <EM>jsmith@example.net</EM>
                <PH>555-0100</PH>
              </item>
              <item>
                <AN>asmithee</AN>
                <DN>Alan Smithee</DN>
              </item>
            </galfind>"#;
        let items = parse_gal_items(body).expect("parse");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].get("AN").map(String::as_str), Some("jsmith"));
        assert_eq!(items[0].get("DN").map(String::as_str), Some("John Smith"));
        assert_eq!(items[0].get("PH").map(String::as_str), Some("555-0100"));
        assert_eq!(items[1].get("AN").map(String::as_str), Some("asmithee"));
    }

    #[test]
    fn empty_response_yields_no_items() {
        let body = r#"<?xml version="1.0"?><galfind><search>zz</search></galfind>"#;
        assert!(parse_gal_items(body).expect("parse").is_empty());
    }
}
