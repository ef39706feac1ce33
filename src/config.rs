use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::auth::{CredentialSource, Credentials, TokenEncoding, TokenFile};
use crate::xmpp::{parse_server_input, Endpoint, XmppSettings, TCP_CONNECT_TIMEOUT};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub xmpp: XmppConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XmppConfig {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_mechanism")]
    pub mechanism: String,
    #[serde(default)]
    pub token_encoding: TokenEncoding,
    #[serde(default)]
    pub dangerous_insecure_tls: bool,
}

impl Default for XmppConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            domain: default_domain(),
            resource: default_resource(),
            channel: default_channel(),
            keepalive_secs: default_keepalive_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            mechanism: default_mechanism(),
            token_encoding: TokenEncoding::default(),
            dangerous_insecure_tls: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub jid: String,
    pub token: Option<String>,
    /// File holding the current token, kept fresh by an external refresher.
    pub token_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    #[serde(default = "default_fast_poll_secs")]
    pub fast_poll_secs: u64,
    #[serde(default)]
    pub fast_poll: bool,
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
    /// Command run once per cycle to fetch and print jobs (argv form).
    pub job_command: Option<Vec<String>>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
            fast_poll_secs: default_fast_poll_secs(),
            fast_poll: false,
            retry_secs: default_retry_secs(),
            job_command: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    jid: Option<String>,
    token: Option<String>,
    server: Option<String>,
}

fn default_server() -> String {
    "talk.google.com:5223".to_string()
}

fn default_domain() -> String {
    "gmail.com".to_string()
}

fn default_resource() -> String {
    "cloud_print".to_string()
}

fn default_channel() -> String {
    "cloudprint.google.com".to_string()
}

fn default_keepalive_secs() -> u64 {
    600
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    TCP_CONNECT_TIMEOUT.as_secs()
}

fn default_mechanism() -> String {
    "X-OAUTH2".to_string()
}

fn default_poll_secs() -> u64 {
    3600
}

fn default_fast_poll_secs() -> u64 {
    30
}

fn default_retry_secs() -> u64 {
    60
}

const DEFAULT_CONFIG_TOML: &str = r#"[account]
jid = ""
# token = "..."
# token_file = "/var/lib/cloudprint/token"

[xmpp]
server = "talk.google.com:5223"
domain = "gmail.com"
resource = "cloud_print"
channel = "cloudprint.google.com"
keepalive_secs = 600
handshake_timeout_secs = 30
connect_timeout_secs = 15
mechanism = "X-OAUTH2"
token_encoding = "jid-token"
dangerous_insecure_tls = false

[daemon]
poll_secs = 3600
fast_poll_secs = 30
fast_poll = false
retry_secs = 60
# job_command = ["/usr/local/bin/cloudprint-jobs", "--once"]
"#;

impl Config {
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        parse_server_input(&self.xmpp.server).map_err(|message| ConfigError::InvalidValue {
            field: "xmpp.server".to_string(),
            message,
        })
    }

    pub fn xmpp_settings(&self) -> XmppSettings {
        XmppSettings {
            domain: self.xmpp.domain.clone(),
            resource: self.xmpp.resource.clone(),
            channel: self.xmpp.channel.clone(),
            keepalive: Duration::from_secs(self.xmpp.keepalive_secs),
            handshake_timeout: Duration::from_secs(self.xmpp.handshake_timeout_secs),
            mechanism: self.xmpp.mechanism.clone(),
            token_encoding: self.xmpp.token_encoding,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.xmpp.connect_timeout_secs)
    }

    /// Static token, or the token file when no token is set inline.
    pub fn credential_source(&self) -> Box<dyn CredentialSource> {
        let token = self.account.token.as_deref().filter(|t| !t.is_empty());
        match (token, &self.account.token_file) {
            (Some(token), _) => Box::new(Credentials::new(self.account.jid.clone(), token)),
            (None, Some(path)) => Box::new(TokenFile::new(self.account.jid.clone(), path.clone())),
            (None, None) => Box::new(Credentials::new(self.account.jid.clone(), String::new())),
        }
    }

    /// Job poll period, which doubles as the notification wait timeout.
    pub fn poll_period(&self) -> Duration {
        if self.daemon.fast_poll {
            Duration::from_secs(self.daemon.fast_poll_secs)
        } else {
            Duration::from_secs(self.daemon.poll_secs)
        }
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_secs(self.daemon.retry_secs)
    }
}

/// Return the platform configuration file path.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("cloudprint").join("cloudprint.toml"))
        .unwrap_or_else(|| PathBuf::from("cloudprint.toml"))
}

/// Load configuration, merging environment variable overrides.
///
/// An explicit path must exist. When the default path is missing, a commented
/// template is written there and the defaults are used, so a deployment that
/// supplies everything through `CLOUDPRINT_*` variables still starts.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    match explicit {
        Some(path) => load_config_from(path),
        None => {
            let path = config_path();
            let overrides = config_overrides_from_env();
            match std::fs::read_to_string(&path) {
                Ok(contents) => load_config_from_str_with_overrides(&contents, overrides),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    create_default_config(&path)?;
                    load_config_from_str_with_overrides(DEFAULT_CONFIG_TOML, overrides)
                }
                Err(e) => Err(ConfigError::Io(e)),
            }
        }
    }
}

/// Load configuration from a specific path.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

fn load_config_from_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(toml_str: &str, overrides: ConfigOverrides) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before.rfind('\n').map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        jid: std::env::var("CLOUDPRINT_JID").ok(),
        token: std::env::var("CLOUDPRINT_TOKEN").ok(),
        server: std::env::var("CLOUDPRINT_SERVER").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(jid) = overrides.jid {
        config.account.jid = jid;
    }
    if let Some(token) = overrides.token {
        config.account.token = Some(token);
        config.account.token_file = None;
    }
    if let Some(server) = overrides.server {
        config.xmpp.server = server;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    if config.account.jid.trim().is_empty() {
        missing.push("account.jid".to_string());
    }
    let has_token = config.account.token.as_deref().is_some_and(|t| !t.is_empty());
    if !has_token && config.account.token_file.is_none() {
        missing.push("account.token".to_string());
    }
    for (field, value) in [
        ("xmpp.domain", &config.xmpp.domain),
        ("xmpp.resource", &config.xmpp.resource),
        ("xmpp.channel", &config.xmpp.channel),
        ("xmpp.mechanism", &config.xmpp.mechanism),
    ] {
        if value.trim().is_empty() {
            missing.push(field.to_string());
        }
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    if has_token && config.account.token_file.is_some() {
        return Err(ConfigError::InvalidValue {
            field: "account.token".to_string(),
            message: "set either token or token_file, not both".to_string(),
        });
    }

    if !config.account.jid.contains('@') {
        return Err(ConfigError::InvalidValue {
            field: "account.jid".to_string(),
            message: format!("'{}' is not of the form user@domain", config.account.jid),
        });
    }

    config.endpoint()?;

    for (field, value) in [
        ("xmpp.keepalive_secs", config.xmpp.keepalive_secs),
        ("xmpp.handshake_timeout_secs", config.xmpp.handshake_timeout_secs),
        ("xmpp.connect_timeout_secs", config.xmpp.connect_timeout_secs),
        ("daemon.poll_secs", config.daemon.poll_secs),
        ("daemon.fast_poll_secs", config.daemon.fast_poll_secs),
        ("daemon.retry_secs", config.daemon.retry_secs),
    ] {
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
    }

    if let Some(command) = &config.daemon.job_command {
        if command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "daemon.job_command".to_string(),
                message: "must name a program to run".to_string(),
            });
        }
    }

    Ok(())
}

fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
