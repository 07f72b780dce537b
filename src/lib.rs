//! LDAP gateway to the Exchange Global Address List.
//!
//! Mail clients bind and search over a BER-framed LDAP subset; lookups
//! are resolved against Exchange through a shared pooled HTTP/WebDAV
//! client. One listener task accepts sockets, one task runs per
//! connection, and requests within a connection are strictly serial.

pub mod codec;
pub mod error;
pub mod exchange;
pub mod filter;
pub mod http_client;
pub mod ldap;
pub mod proto;
pub mod server;
pub mod settings;

pub use error::GatewayError;
pub use exchange::{DavSessionFactory, ExchangeSession, Person, SessionFactory};
pub use http_client::HttpClientFacade;
pub use ldap::LdapConnection;
pub use server::{ClientStream, Listener};
pub use settings::Settings;

/// Default LDAP listener port, used when `davmail.ldapPort` is 0 or absent.
pub const DEFAULT_LDAP_PORT: u16 = 1389;
