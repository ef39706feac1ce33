//! Error taxonomy for the push channel.
//!
//! Every variant is fatal to the connection that produced it: the socket is
//! closed before the error reaches the caller, and retrying is the caller's
//! business.

use thiserror::Error;

/// Broad category of an [`XmppError`], used by the job loop for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed bytes on the wire.
    Parse,
    /// The server answered with an error/failure stanza or something unexpected.
    Protocol,
    /// Socket-level fault: dial, TLS, reset, EOF, timeout.
    Connection,
}

#[derive(Debug, Error)]
pub enum XmppError {
    #[error("malformed XML from server: {0}")]
    Parse(String),

    #[error("server returned <{tag}>: {detail}")]
    Protocol { tag: String, detail: String },

    #[error("authentication rejected ({condition}){}", auth_text_suffix(.text))]
    Auth {
        /// SASL failure condition, e.g. `not-authorized`.
        condition: String,
        /// Optional human-readable `<text>` from the failure stanza.
        text: Option<String>,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("timed out after {secs}s waiting for {waiting_for}")]
    Timeout { secs: u64, waiting_for: String },
}

fn auth_text_suffix(text: &Option<String>) -> String {
    text.as_deref().map(|t| format!(": {t}")).unwrap_or_default()
}

impl XmppError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub fn protocol(tag: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Protocol {
            tag: tag.into(),
            detail: detail.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_) => ErrorKind::Parse,
            Self::Protocol { .. } | Self::Auth { .. } => ErrorKind::Protocol,
            Self::Connection(_) | Self::Io(_) | Self::Tls(_) | Self::Timeout { .. } => {
                ErrorKind::Connection
            }
        }
    }
}
