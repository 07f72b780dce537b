//! Shared pooled HTTP/WebDAV client toward Exchange.
//!
//! One facade instance serves the whole process. Redirects are followed
//! manually (the pooled client is built with redirects off), DIGEST is
//! preferred over BASIC on challenge, and NTLM is never selected for the
//! origin server even though `DOMAIN\user` credentials are accepted for
//! the proxy. Connections idle for sixty seconds are evicted by the
//! pool's reaper.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use md5::{Digest, Md5};
use reqwest::header::{AUTHORIZATION, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Method, Response};
use std::sync::Arc;
use url::Url;
use xml::reader::{EventReader, XmlEvent};

use crate::error::GatewayError;
use crate::settings::Settings;

/// The back-end requires an IE user agent to answer galfind/gallookup
/// commands with XML.
pub const IE_USER_AGENT: &str = "Mozilla/4.0 (compatible; MSIE 6.0; Windows NT 5.1; SV1)";

pub const MAX_REDIRECTS: u32 = 10;
const MAX_CONNECTIONS_PER_HOST: usize = 100;
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Exchange account credentials carried by a bound session.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

pub struct HttpClientFacade {
    settings: Arc<Settings>,
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpClientFacade {
    pub fn new(settings: Arc<Settings>) -> HttpClientFacade {
        HttpClientFacade {
            settings,
            client: RwLock::new(None),
        }
    }

    /// Build the pooled client. Idempotent.
    pub fn start(&self) -> Result<(), GatewayError> {
        let mut guard = match self.client.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(build_client(&self.settings)?);
        Ok(())
    }

    /// Drop the pooled client, closing its connections as in-flight
    /// requests finish. Idempotent; later calls observe the stopped state.
    pub fn stop(&self) {
        let mut guard = match self.client.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }

    fn client(&self) -> Result<reqwest::Client, GatewayError> {
        let guard = match self.client.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .clone()
            .ok_or_else(|| GatewayError::Backend("HTTP client facade is stopped".to_string()))
    }

    /// Resolve a request path against the configured gateway URL.
    fn absolute_url(&self, path: &str) -> Result<Url, GatewayError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path)
                .map_err(|e| GatewayError::Backend(format!("invalid URL {}: {}", path, e)));
        }
        let base = self.settings.get_string("davmail.url", "");
        Url::parse(&base)
            .and_then(|base| base.join(path))
            .map_err(|e| GatewayError::Backend(format!("invalid URL {}{}: {}", base, path, e)))
    }

    /// Probe a URL with authentication disabled; only the status matters.
    pub async fn get_status(&self, url: &str) -> Result<u16, GatewayError> {
        let response = self.client()?.get(url).send().await?;
        let status = response.status().as_u16();
        // Drain the body so the connection returns to the pool.
        let _ = response.bytes().await;
        Ok(status)
    }

    /// GET, following 301/302/303/307 by hand up to [`MAX_REDIRECTS`] hops.
    /// The connection of every intermediate hop is released before the
    /// next request; the caller consumes the final response.
    pub async fn execute_follow_redirects(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Response, GatewayError> {
        let mut url = self.absolute_url(url)?;
        let mut hops = 0;
        loop {
            let response = self
                .execute_with_auth(Method::GET, url.clone(), &[], None, credentials)
                .await?;
            if !matches!(response.status().as_u16(), 301 | 302 | 303 | 307) {
                return Ok(response);
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let location = match location {
                Some(location) => location,
                None => return Ok(response),
            };
            let _ = response.bytes().await;
            if hops >= MAX_REDIRECTS {
                return Err(GatewayError::TooManyRedirects(MAX_REDIRECTS));
            }
            hops += 1;
            url = url
                .join(&location)
                .map_err(|e| GatewayError::Backend(format!("invalid Location {}: {}", location, e)))?;
            debug!("following redirect to {}", url);
        }
    }

    /// WebDAV SEARCH with a SQL query body; requires 207 Multi-Status.
    pub async fn execute_search_method(
        &self,
        path: &str,
        sql: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<MultiStatusResponse>, GatewayError> {
        let body = format!(
            "<?xml version=\"1.0\"?>\n\
             <d:searchrequest xmlns:d=\"DAV:\">\n\
             <d:sql>{}</d:sql>\n\
             </d:searchrequest>",
            xml_encode(sql)
        );
        self.execute_dav("SEARCH", path, &[], body, credentials).await
    }

    /// WebDAV PROPFIND for the named properties at the given depth;
    /// requires 207 Multi-Status.
    pub async fn execute_prop_find(
        &self,
        path: &str,
        depth: u32,
        properties: &[&str],
        credentials: Option<&Credentials>,
    ) -> Result<Vec<MultiStatusResponse>, GatewayError> {
        let mut body = String::from("<?xml version=\"1.0\"?>\n<d:propfind xmlns:d=\"DAV:\"><d:prop>");
        for property in properties {
            body.push_str("<d:");
            body.push_str(property);
            body.push_str("/>");
        }
        body.push_str("</d:prop></d:propfind>");
        self.execute_dav(
            "PROPFIND",
            path,
            &[("Depth", depth.to_string())],
            body,
            credentials,
        )
        .await
    }

    /// Execute a DAV method and parse the mandatory 207 Multi-Status
    /// response. The connection is released on every exit path: the body
    /// is consumed on success and on error alike.
    pub async fn execute_dav(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, String)],
        body: String,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<MultiStatusResponse>, GatewayError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| GatewayError::Backend(format!("invalid method {}: {}", method, e)))?;
        let url = self.absolute_url(path)?;
        let mut all_headers = vec![("Content-Type", "text/xml; charset=UTF-8".to_string())];
        all_headers.extend(headers.iter().map(|(k, v)| (*k, v.clone())));
        let response = self
            .execute_with_auth(method, url, &all_headers, Some(body), credentials)
            .await?;
        let status = response.status().as_u16();
        if status != 207 {
            return Err(consume_into_exception(response).await);
        }
        let text = response.text().await?;
        parse_multistatus(&text)
    }

    /// DELETE; an already-absent resource (404) counts as success.
    pub async fn execute_delete(
        &self,
        path: &str,
        credentials: Option<&Credentials>,
    ) -> Result<u16, GatewayError> {
        let url = self.absolute_url(path)?;
        let response = self
            .execute_with_auth(Method::DELETE, url, &[], None, credentials)
            .await?;
        match response.status().as_u16() {
            200 | 404 => {
                let _ = response.bytes().await;
                Ok(200)
            }
            _ => Err(consume_into_exception(response).await),
        }
    }

    /// Send a request, answering one authentication challenge with the
    /// preferred scheme: DIGEST first, then BASIC. NTLM challenges are
    /// skipped.
    async fn execute_with_auth(
        &self,
        method: Method,
        url: Url,
        headers: &[(&str, String)],
        body: Option<String>,
        credentials: Option<&Credentials>,
    ) -> Result<Response, GatewayError> {
        let client = self.client()?;
        let build = |authorization: Option<String>| {
            let mut request = client.request(method.clone(), url.clone());
            for (name, value) in headers {
                request = request.header(*name, value.as_str());
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
            }
            if let Some(authorization) = authorization {
                request = request.header(AUTHORIZATION, authorization);
            }
            request
        };

        let response = build(None).send().await?;
        let credentials = match credentials {
            Some(credentials) if response.status().as_u16() == 401 => credentials,
            _ => return Ok(response),
        };
        let challenges: Vec<String> = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let _ = response.bytes().await;

        let authorization = authorization_for(&challenges, method.as_str(), &url, credentials)?;
        Ok(build(Some(authorization)).send().await?)
    }
}

fn build_client(settings: &Settings) -> Result<reqwest::Client, GatewayError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(IE_USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(MAX_CONNECTIONS_PER_HOST)
        .pool_idle_timeout(IDLE_CONNECTION_TIMEOUT);

    if settings.get_bool("davmail.enableProxy") {
        let host = settings.get_string("davmail.proxyHost", "");
        let port = settings.get_int("davmail.proxyPort", 8080);
        let mut proxy = reqwest::Proxy::all(format!("http://{}:{}", host, port))
            .map_err(|e| GatewayError::Backend(format!("invalid proxy: {}", e)))?;
        if let Some(user) = settings.get("davmail.proxyUser") {
            // A DOMAIN\user name means NTLM-capable proxy credentials;
            // they are passed through untouched. The origin scheme
            // priority still excludes NTLM.
            if user.contains('\\') {
                debug!("using NTLM-style proxy credentials");
            }
            let password = settings.get_string("davmail.proxyPassword", "");
            proxy = proxy.basic_auth(user, &password);
        }
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

/// Translate a failure status, consuming the response body so the
/// connection is not poisoned.
async fn consume_into_exception(response: Response) -> GatewayError {
    let status = response.status().as_u16();
    let reason = response
        .status()
        .canonical_reason()
        .unwrap_or("")
        .to_string();
    let _ = response.bytes().await;
    build_http_exception(status, &reason)
}

/// Map an HTTP failure to the gateway taxonomy. Exchange answers 440
/// "Login Timeout" where 403 is meant.
pub fn build_http_exception(status: u16, reason: &str) -> GatewayError {
    if status == 440 {
        GatewayError::Http {
            status: 403,
            text: "Forbidden".to_string(),
        }
    } else {
        GatewayError::Http {
            status,
            text: reason.to_string(),
        }
    }
}

/// Escape `&`, `<` and `>` for an XML text node.
pub fn xml_encode(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn authorization_for(
    challenges: &[String],
    method: &str,
    url: &Url,
    credentials: &Credentials,
) -> Result<String, GatewayError> {
    let parsed: Vec<(String, HashMap<String, String>)> =
        challenges.iter().map(|c| parse_challenge(c)).collect();
    let uri = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    if let Some((_, params)) = parsed.iter().find(|(scheme, _)| scheme == "digest") {
        return Ok(digest_authorization(
            params,
            method,
            &uri,
            &credentials.user,
            &credentials.password,
        ));
    }
    if parsed.iter().any(|(scheme, _)| scheme == "basic") {
        let token = BASE64.encode(format!("{}:{}", credentials.user, credentials.password));
        return Ok(format!("Basic {}", token));
    }
    warn!(
        "no supported authentication scheme offered: {}",
        challenges.join(", ")
    );
    Err(GatewayError::Backend(
        "no supported authentication scheme".to_string(),
    ))
}

fn parse_challenge(header: &str) -> (String, HashMap<String, String>) {
    let (scheme, rest) = match header.split_once(' ') {
        Some((scheme, rest)) => (scheme, rest),
        None => (header, ""),
    };
    let mut params = HashMap::new();
    for part in rest.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            params.insert(
                key.trim().to_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    (scheme.trim().to_lowercase(), params)
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn digest_authorization(
    params: &HashMap<String, String>,
    method: &str,
    uri: &str,
    user: &str,
    password: &str,
) -> String {
    let empty = String::new();
    let realm = params.get("realm").unwrap_or(&empty);
    let nonce = params.get("nonce").unwrap_or(&empty);
    let qop_auth = params
        .get("qop")
        .map(|qop| qop.split(',').any(|q| q.trim() == "auth"))
        .unwrap_or(false);
    let ha1 = md5_hex(&format!("{}:{}:{}", user, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    let mut authorization;
    if qop_auth {
        let nc = "00000001";
        let cnonce = cnonce();
        let response = digest_response(&ha1, nonce, nc, &cnonce, &ha2);
        authorization = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
             qop=auth, nc={}, cnonce=\"{}\", response=\"{}\"",
            user, realm, nonce, uri, nc, cnonce, response
        );
    } else {
        let response = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));
        authorization = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            user, realm, nonce, uri, response
        );
    }
    if let Some(opaque) = params.get("opaque") {
        authorization.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    authorization
}

fn digest_response(ha1: &str, nonce: &str, nc: &str, cnonce: &str, ha2: &str) -> String {
    md5_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2))
}

fn cnonce() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    md5_hex(&format!("{}:{}", nanos, std::process::id()))[..16].to_string()
}

/// One `<response>` element of a 207 Multi-Status body: the href, the
/// returned properties by local name, and the propstat status line.
#[derive(Clone, Debug, Default)]
pub struct MultiStatusResponse {
    pub href: String,
    pub properties: HashMap<String, String>,
    pub status: Option<String>,
}

pub fn parse_multistatus(body: &str) -> Result<Vec<MultiStatusResponse>, GatewayError> {
    let mut responses = Vec::new();
    let mut current: Option<MultiStatusResponse> = None;
    let mut path: Vec<String> = Vec::new();
    for event in EventReader::new(body.as_bytes()) {
        let event =
            event.map_err(|e| GatewayError::Backend(format!("invalid multistatus XML: {}", e)))?;
        match event {
            XmlEvent::StartElement { name, .. } => {
                let local = name.local_name.to_lowercase();
                if local == "response" {
                    current = Some(MultiStatusResponse::default());
                }
                path.push(local);
            }
            XmlEvent::Characters(text) => {
                if let (Some(response), Some(leaf)) = (current.as_mut(), path.last()) {
                    match leaf.as_str() {
                        "href" => response.href.push_str(text.trim()),
                        "status" => response.status = Some(text.trim().to_string()),
                        "multistatus" | "response" | "propstat" | "prop" => {}
                        name => {
                            response
                                .properties
                                .insert(name.to_string(), text.trim().to_string());
                        }
                    }
                }
            }
            XmlEvent::EndElement { name } => {
                if name.local_name.eq_ignore_ascii_case("response") {
                    if let Some(response) = current.take() {
                        responses.push(response);
                    }
                }
                path.pop();
            }
            _ => {}
        }
    }
    Ok(responses)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn xml_encoding() {
        assert_eq!(
            xml_encode("a < b && c > d"),
            "a &lt; b &amp;&amp; c &gt; d"
        );
    }

    #[test]
    fn http_exception_translates_440() {
        match build_http_exception(440, "Login Timeout") {
            GatewayError::Http { status, text } => {
                assert_eq!(status, 403);
                assert_eq!(text, "Forbidden");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        match build_http_exception(503, "Service Unavailable") {
            GatewayError::Http { status, text } => {
                assert_eq!(status, 503);
                assert_eq!(text, "Service Unavailable");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn digest_matches_rfc2617_vector() {
        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = md5_hex("GET:/dir/index.html");
        let response = digest_response(
            &ha1,
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "00000001",
            "0a4f113b",
            &ha2,
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn digest_preferred_over_basic_and_ntlm_skipped() {
        let challenges = vec![
            "NTLM".to_string(),
            "Basic realm=\"x\"".to_string(),
            "Digest realm=\"x\", nonce=\"abc\", qop=\"auth\"".to_string(),
        ];
        let url = Url::parse("http://host/exchange/").expect("url");
        let credentials = Credentials {
            user: "u".to_string(),
            password: "p".to_string(),
        };
        let authorization =
            authorization_for(&challenges, "GET", &url, &credentials).expect("auth");
        assert!(authorization.starts_with("Digest "));

        let basic_only = vec!["NTLM".to_string(), "Basic realm=\"x\"".to_string()];
        let authorization =
            authorization_for(&basic_only, "GET", &url, &credentials).expect("auth");
        assert_eq!(authorization, format!("Basic {}", BASE64.encode("u:p")));

        let ntlm_only = vec!["NTLM".to_string()];
        assert!(authorization_for(&ntlm_only, "GET", &url, &credentials).is_err());
    }

    #[test]
    fn parses_multistatus_body() {
        let body = r#"<?xml version="1.0"?>
            <D:multistatus xmlns:D="DAV:">
              <D:response>
                <D:href>/public/folder/item.eml</D:href>
                <D:propstat>
                  <D:prop><D:displayname>item</D:displayname><D:getcontentlength>42</D:getcontentlength></D:prop>
                  <D:status>HTTP/1.1 200 OK</D:status>
                </D:propstat>
              </D:response>
              <D:response>
                <D:href>/public/folder/other.eml</D:href>
              </D:response>
            </D:multistatus>"#;
        let responses = parse_multistatus(body).expect("parse");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].href, "/public/folder/item.eml");
        assert_eq!(
            responses[0].properties.get("displayname").map(String::as_str),
            Some("item")
        );
        assert_eq!(
            responses[0].properties.get("getcontentlength").map(String::as_str),
            Some("42")
        );
        assert_eq!(
            responses[0].status.as_deref(),
            Some("HTTP/1.1 200 OK")
        );
        assert_eq!(responses[1].href, "/public/folder/other.eml");
    }
}
