use std::io;

use thiserror::Error;

/// Gateway-wide error type.
///
/// Recoverable variants are translated to on-the-wire LDAP result codes at
/// the dispatcher boundary; transport failures terminate the connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed BER, unknown operation, unsupported filter shape.
    #[error("LDAP protocol error: {0}")]
    Protocol(String),

    /// Malformed operation body inside a well-framed message. The
    /// messageID already parsed, so the error is answered on the wire
    /// instead of closing the connection.
    #[error("LDAP request error: {text}")]
    Request { msgid: i32, text: String },

    /// Bad Exchange credentials on bind.
    #[error("authentication failed")]
    AuthFailed,

    /// Redirect chain exhausted the hop cap.
    #[error("too many redirects ({0})")]
    TooManyRedirects(u32),

    /// Unexpected HTTP status from the back-end.
    #[error("{status} {text}")]
    Http { status: u16, text: String },

    /// HTTP or WebDAV failure talking to Exchange.
    #[error("backend error: {0}")]
    Backend(String),

    /// I/O failure on the client socket.
    #[error("io: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> GatewayError {
        GatewayError::Backend(e.to_string())
    }
}
