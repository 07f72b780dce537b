//! Protocol-neutral listener: bind a TCP or TLS socket, filter peers,
//! and hand accepted sockets to a per-protocol connection handler, one
//! task each.

use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig, SupportedProtocolVersion};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

use crate::error::GatewayError;
use crate::settings::Settings;

/// Seconds a client may stay silent before its connection is closed.
const DEFAULT_CLIENT_SO_TIMEOUT: i64 = 300;

/// An accepted client socket, TLS-wrapped or plain.
pub trait ClientStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ClientStream for T {}

pub struct Listener {
    protocol_name: &'static str,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    allow_remote: bool,
    client_timeout: Duration,
}

impl Listener {
    /// Bind on `davmail.bindAddress` (or all interfaces) at the
    /// configured port, falling back to the protocol default when the
    /// port is 0 or absent. A configured keystore upgrades the listener
    /// to TLS.
    pub async fn bind(
        settings: &Settings,
        protocol_name: &'static str,
        port_key: &str,
        default_port: u16,
    ) -> Result<Listener, GatewayError> {
        let port = settings.get_port(port_key, default_port);
        let address = settings.get_string("davmail.bindAddress", "0.0.0.0");
        let listener = TcpListener::bind((address.as_str(), port)).await?;
        let tls = match settings.get("davmail.ssl.keystoreFile") {
            Some(_) => Some(TlsAcceptor::from(Arc::new(tls_server_config(settings)?))),
            None => None,
        };
        info!(
            "{} listener bound on {}{}",
            protocol_name,
            listener.local_addr()?,
            if tls.is_some() { " (TLS)" } else { "" }
        );
        Ok(Listener {
            protocol_name,
            listener,
            tls,
            allow_remote: settings.get_bool("davmail.allowRemote"),
            client_timeout: Duration::from_secs(
                settings.get_int("davmail.clientSoTimeout", DEFAULT_CLIENT_SO_TIMEOUT) as u64,
            ),
        })
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until shut down, spawning `handler` on its own task for
    /// every admitted socket. Accept errors are logged and accepting
    /// continues; the shutdown signal ends the loop quietly.
    pub async fn serve<F, Fut>(self, handler: F, mut shutdown: broadcast::Receiver<()>)
    where
        F: Fn(Box<dyn ClientStream>, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.recv() => {
                    info!("{} listener shutting down", self.protocol_name);
                    return;
                }
            };
            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("{} accept error: {}", self.protocol_name, e);
                    continue;
                }
            };
            if !peer_allowed(self.allow_remote, peer.ip()) {
                // Dropping the socket closes it before any handler runs.
                warn!(
                    "{} connection from external client {} refused",
                    self.protocol_name, peer
                );
                continue;
            }
            debug!("{} connection from {}", self.protocol_name, peer);
            let tls = self.tls.clone();
            let handler = handler.clone();
            let protocol_name = self.protocol_name;
            tokio::spawn(async move {
                let stream: Box<dyn ClientStream> = match tls {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(stream) => Box::new(stream),
                        Err(e) => {
                            warn!("{} TLS handshake with {} failed: {}", protocol_name, peer, e);
                            return;
                        }
                    },
                    None => Box::new(socket),
                };
                handler(stream, peer).await;
            });
        }
    }

}

fn peer_allowed(allow_remote: bool, ip: IpAddr) -> bool {
    if allow_remote || ip.is_loopback() {
        return true;
    }
    // Some IPv6 stacks report fe80::1 as the peer of loopback
    // connections.
    ip == IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))
}

/// TLS protocol versions offered on listeners: anything whose name
/// starts with `SSL` stays disabled (POODLE, CVE-2014-3566).
pub fn enabled_protocol_versions() -> Vec<&'static SupportedProtocolVersion> {
    rustls::ALL_VERSIONS
        .iter()
        .filter(|v| !format!("{:?}", v.version).starts_with("SSL"))
        .copied()
        .collect()
}

/// Build the listener TLS configuration from the keystore and, when
/// client-certificate authentication is requested, the truststore.
pub fn tls_server_config(settings: &Settings) -> Result<ServerConfig, GatewayError> {
    let keystore = settings.get_string("davmail.ssl.keystoreFile", "");
    let certs = load_certificates(&keystore)?;
    let key = load_private_key(&keystore)?;

    let builder = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&enabled_protocol_versions())
        .map_err(|e| GatewayError::Backend(format!("TLS configuration error: {}", e)))?;

    let config = if settings.get_bool("davmail.ssl.needClientAuth") {
        let truststore = settings.get_string("davmail.ssl.truststoreFile", "");
        let mut roots = RootCertStore::empty();
        for cert in load_certificates(&truststore)? {
            roots
                .add(&cert)
                .map_err(|e| GatewayError::Backend(format!("bad truststore certificate: {}", e)))?;
        }
        builder
            .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots))
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    };
    config.map_err(|e| GatewayError::Backend(format!("bad keystore: {}", e)))
}

fn load_certificates(path: &str) -> Result<Vec<Certificate>, GatewayError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(GatewayError::Backend(format!(
            "no certificate found in {}",
            path
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey, GatewayError> {
    let mut reader = BufReader::new(File::open(path)?);
    while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    Err(GatewayError::Backend(format!(
        "no private key found in {}",
        path
    )))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loopback_gate() {
        assert!(peer_allowed(false, "127.0.0.1".parse().unwrap()));
        assert!(peer_allowed(false, "::1".parse().unwrap()));
        assert!(peer_allowed(false, "fe80::1".parse().unwrap()));
        assert!(!peer_allowed(false, "192.0.2.7".parse().unwrap()));
        assert!(!peer_allowed(false, "fe80::2".parse().unwrap()));
        assert!(peer_allowed(true, "192.0.2.7".parse().unwrap()));
    }

    #[test]
    fn no_ssl_protocol_enabled() {
        let versions = enabled_protocol_versions();
        assert!(!versions.is_empty());
        for version in versions {
            let name = format!("{:?}", version.version);
            assert!(!name.starts_with("SSL"), "SSL protocol enabled: {}", name);
        }
    }
}
