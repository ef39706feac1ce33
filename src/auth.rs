//! Account credentials for the push channel.
//!
//! Tokens are minted and refreshed elsewhere; this module only carries them
//! into the SASL exchange. A `CredentialSource` is consulted before every
//! connect so a rotated token is picked up on the next reconnect.

use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

/// How the token is packed into the SASL `<auth>` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenEncoding {
    /// base64 of `\0jid\0token`.
    #[default]
    JidToken,
    /// The bearer token itself, unmodified.
    Bearer,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub jid: String,
    pub token: String,
}

impl Credentials {
    pub fn new(jid: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            token: token.into(),
        }
    }

    pub fn sasl_payload(&self, encoding: TokenEncoding) -> String {
        match encoding {
            TokenEncoding::JidToken => STANDARD.encode(format!("\0{}\0{}", self.jid, self.token)),
            TokenEncoding::Bearer => self.token.clone(),
        }
    }
}

// Tokens must never reach the log file.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("jid", &self.jid)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Supplies credentials for the next connect attempt.
pub trait CredentialSource: Send + Sync {
    fn credentials(&self) -> anyhow::Result<Credentials>;
}

impl CredentialSource for Credentials {
    fn credentials(&self) -> anyhow::Result<Credentials> {
        Ok(self.clone())
    }
}

/// Token kept in a file by an external refresher; re-read on every connect.
#[derive(Debug, Clone)]
pub struct TokenFile {
    jid: String,
    path: PathBuf,
}

impl TokenFile {
    pub fn new(jid: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            jid: jid.into(),
            path: path.into(),
        }
    }
}

impl CredentialSource for TokenFile {
    fn credentials(&self) -> anyhow::Result<Credentials> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read token file {}", self.path.display()))?;
        let token = contents.trim();
        if token.is_empty() {
            bail!("token file {} is empty", self.path.display());
        }
        Ok(Credentials::new(self.jid.clone(), token))
    }
}
