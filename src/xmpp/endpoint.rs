//! Push server endpoint parsing.
//!
//! The push channel always talks direct TLS to a fixed host, so there is no
//! SRV lookup and no STARTTLS: the configured string is parsed once into an
//! `Endpoint` and dialed as-is on every reconnect.

use std::fmt;

/// Port used when the server string carries none.
pub const DEFAULT_PORT: u16 = 5223;

/// Host used when no server is configured.
pub const DEFAULT_HOST: &str = "talk.google.com";

/// Direct-TLS endpoint of the push server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Name to present for TLS SNI and certificate checks when it differs
    /// from the dialed host (e.g. connecting by IP address).
    pub domain: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            domain: None,
        }
    }

    /// Hostname used for TLS SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tls://{}:{}", self.host, self.port)?;
        if let Some(domain) = &self.domain {
            write!(f, "?domain={domain}")?;
        }
        Ok(())
    }
}

/// Extract optional `?domain=` parameter.
/// Returns (host_port_part, optional_domain).
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (
            host_port,
            query
                .strip_prefix("domain=")
                .filter(|d| !d.is_empty())
                .map(str::to_string),
        ),
        None => (input, None),
    }
}

/// Split `host[:port]`, using `rsplit_once` so bracketed IPv6 literals keep
/// their colons.
fn split_host_port(host_port: &str) -> Result<(String, u16), String> {
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port_str)) if !host.ends_with(':') && !port_str.contains(']') => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| format!("invalid port '{port_str}'"))?;
            (host, port)
        }
        _ => (host_port, DEFAULT_PORT),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err("missing host".to_string());
    }
    if port == 0 {
        return Err("port must be non-zero".to_string());
    }
    Ok((host.to_string(), port))
}

/// Parse a configured server string.
///
/// Supported formats:
/// - `host`                      → direct TLS on port 5223
/// - `host:port`                 → direct TLS on `port`
/// - `tls://host[:port]`         → same, explicit scheme
/// - `tls://host:port?domain=d`  → dial `host`, verify the certificate for `d`
///
/// `tcp://` is rejected: the push channel is TLS-only.
pub fn parse_server_input(server: &str) -> Result<Endpoint, String> {
    let trimmed = server.trim();
    if trimmed.is_empty() {
        return Err("server is empty".to_string());
    }

    if trimmed.starts_with("tcp://") {
        return Err(format!(
            "'{trimmed}': plaintext tcp:// endpoints are not supported, use tls://"
        ));
    }

    let (rest, domain) = match trimmed.strip_prefix("tls://") {
        Some(rest) => split_domain_param(rest),
        None if trimmed.contains("://") => {
            return Err(format!("'{trimmed}': unsupported scheme"));
        }
        None => (trimmed, None),
    };

    let (host, port) = split_host_port(rest).map_err(|e| format!("'{trimmed}': {e}"))?;
    Ok(Endpoint { host, port, domain })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_host_uses_default_port() {
        assert_eq!(
            parse_server_input("talk.google.com").unwrap(),
            Endpoint::new("talk.google.com", 5223)
        );
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_server_input("push.example.com:5270").unwrap(),
            Endpoint::new("push.example.com", 5270)
        );
    }

    #[test]
    fn test_parse_tls_uri_with_domain() {
        let endpoint = parse_server_input("tls://10.0.0.5:5223?domain=push.example.com").unwrap();
        assert_eq!(endpoint.host, "10.0.0.5");
        assert_eq!(endpoint.port, 5223);
        assert_eq!(endpoint.tls_name(), "push.example.com");
    }

    #[test]
    fn test_parse_tls_uri_no_port() {
        let endpoint = parse_server_input("tls://push.example.com").unwrap();
        assert_eq!(endpoint, Endpoint::new("push.example.com", DEFAULT_PORT));
        assert_eq!(endpoint.tls_name(), "push.example.com");
    }

    #[test]
    fn test_parse_ipv6_literal() {
        assert_eq!(
            parse_server_input("[::1]:5223").unwrap(),
            Endpoint::new("::1", 5223)
        );
    }

    #[test]
    fn test_parse_trims_whitespace() {
        assert_eq!(
            parse_server_input("  push.example.com:5223 \n").unwrap(),
            Endpoint::new("push.example.com", 5223)
        );
    }

    #[test]
    fn test_parse_rejects_plaintext_and_garbage() {
        assert!(parse_server_input("tcp://push.example.com:5222").is_err());
        assert!(parse_server_input("ws://push.example.com").is_err());
        assert!(parse_server_input("push.example.com:http").is_err());
        assert!(parse_server_input("push.example.com:0").is_err());
        assert!(parse_server_input("").is_err());
        assert!(parse_server_input("tls://:5223").is_err());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let endpoint = parse_server_input("tls://10.0.0.5:5223?domain=push.example.com").unwrap();
        assert_eq!(endpoint.to_string(), "tls://10.0.0.5:5223?domain=push.example.com");
        assert_eq!(parse_server_input(&endpoint.to_string()).unwrap(), endpoint);
    }

    #[test]
    fn test_default_endpoint() {
        assert_eq!(Endpoint::default().to_string(), "tls://talk.google.com:5223");
    }
}
