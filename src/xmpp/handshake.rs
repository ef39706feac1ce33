//! Request builders and response checks for the connect sequence.
//!
//! The I/O lives in `connection.rs`; everything here is pure so each step's
//! wire shape and acceptance rule can be tested without a socket.

use quick_xml::escape::escape;

use super::stanza::{ns, Incoming, Stanza};
use crate::error::XmppError;

/// Whitespace keepalive written when the socket has been idle for a period.
pub const KEEPALIVE: &[u8] = b" ";

pub const BIND_ID: &str = "bind";
pub const SESSION_ID: &str = "session";
pub const SUBSCRIBE_ID: &str = "subscribe";

/// Opening tag of the client stream, sent before auth and again after it.
pub fn stream_open(domain: &str) -> String {
    format!(
        "<stream:stream to=\"{}\" xml:lang=\"en\" version=\"1.0\" xmlns:stream=\"{}\" xmlns=\"{}\">",
        escape(domain),
        ns::STREAM,
        ns::JABBER_CLIENT
    )
}

pub fn auth_request(mechanism: &str, payload: &str) -> String {
    format!(
        "<auth xmlns=\"{}\" mechanism=\"{}\">{}</auth>",
        ns::SASL,
        escape(mechanism),
        escape(payload)
    )
}

pub fn bind_request(resource: &str) -> String {
    format!(
        "<iq type=\"set\" id=\"{BIND_ID}\"><bind xmlns=\"{}\"><resource>{}</resource></bind></iq>",
        ns::BIND,
        escape(resource)
    )
}

pub fn session_request() -> String {
    format!(
        "<iq type=\"set\" id=\"{SESSION_ID}\"><session xmlns=\"{}\"/></iq>",
        ns::SESSION
    )
}

pub fn subscribe_request(bare_jid: &str, channel: &str) -> String {
    let channel = escape(channel);
    format!(
        "<iq type=\"set\" id=\"{SUBSCRIBE_ID}\" to=\"{}\"><subscribe xmlns=\"{}\"><item channel=\"{channel}\" from=\"{channel}\"/></subscribe></iq>",
        escape(bare_jid),
        ns::PUSH
    )
}

/// `user@domain/resource` → `user@domain`.
pub fn bare_jid(full: &str) -> &str {
    full.split_once('/').map_or(full, |(bare, _)| bare)
}

/// Turn an error/failure stanza into the matching error.
fn failure_error(stanza: &Stanza) -> XmppError {
    let condition = stanza.condition().unwrap_or("undefined-condition");
    match stanza.child("text") {
        Some(text) if !text.text().is_empty() => {
            XmppError::protocol(stanza.name(), format!("{condition}: {}", text.text()))
        }
        _ => XmppError::protocol(stanza.name(), condition),
    }
}

/// Unwrap an ordinary stanza; failures become `Protocol` errors.
fn ordinary(incoming: Incoming, waiting_for: &str) -> Result<Stanza, XmppError> {
    match incoming {
        Incoming::Stanza(stanza) => Ok(stanza),
        Incoming::Failure(stanza) => Err(failure_error(&stanza)),
        Incoming::Empty => Err(XmppError::protocol(
            "none",
            format!("no stanza while waiting for {waiting_for}"),
        )),
    }
}

/// Accept `<stream:features>`.
pub fn expect_features(incoming: Incoming) -> Result<Stanza, XmppError> {
    let stanza = ordinary(incoming, "stream features")?;
    if stanza.name() != "features" || stanza.namespace() != Some(ns::STREAM) {
        return Err(XmppError::protocol(
            stanza.name(),
            "expected stream features",
        ));
    }
    Ok(stanza)
}

/// Accept SASL `<success>`; a `<failure>` becomes [`XmppError::Auth`].
pub fn expect_auth_success(incoming: Incoming) -> Result<(), XmppError> {
    match incoming {
        Incoming::Failure(stanza) if stanza.namespace() == Some(ns::SASL) => {
            Err(XmppError::Auth {
                condition: stanza
                    .condition()
                    .unwrap_or("undefined-condition")
                    .to_string(),
                text: stanza
                    .child("text")
                    .map(|t| t.text().to_string())
                    .filter(|t| !t.is_empty()),
            })
        }
        other => {
            let stanza = ordinary(other, "auth result")?;
            if stanza.name() != "success" {
                return Err(XmppError::protocol(stanza.name(), "expected auth success"));
            }
            Ok(())
        }
    }
}

/// Accept an `<iq type="result">` answering request `id`.
pub fn expect_iq_result(incoming: Incoming, id: &str) -> Result<Stanza, XmppError> {
    let stanza = ordinary(incoming, id)?;
    if stanza.name() != "iq" {
        return Err(XmppError::protocol(
            stanza.name(),
            format!("expected iq result for '{id}'"),
        ));
    }
    if stanza.is_error_iq() {
        let detail = stanza
            .child("error")
            .and_then(Stanza::condition)
            .unwrap_or("undefined-condition");
        return Err(XmppError::protocol("iq", format!("'{id}' failed: {detail}")));
    }
    if stanza.attr("type") != Some("result") {
        return Err(XmppError::protocol(
            "iq",
            format!("'{id}' answered with type {:?}", stanza.attr("type")),
        ));
    }
    Ok(stanza)
}

/// Full JID assigned by the bind result.
pub fn bound_jid(bind_result: &Stanza) -> Result<String, XmppError> {
    match bind_result.find(&["bind", "jid"]).map(Stanza::text) {
        Some(jid) if !jid.trim().is_empty() => Ok(jid.trim().to_string()),
        _ => Err(XmppError::protocol("iq", "bind result carries no <jid>")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn node(name: &str, namespace: &str, attrs: &[(&str, &str)], children: Vec<Stanza>, text: &str) -> Stanza {
        Stanza::new(
            name.to_string(),
            Some(namespace.to_string()),
            attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            children,
            text.to_string(),
        )
    }

    #[test]
    fn test_stream_open_shape() {
        assert_eq!(
            stream_open("gmail.com"),
            "<stream:stream to=\"gmail.com\" xml:lang=\"en\" version=\"1.0\" xmlns:stream=\"http://etherx.jabber.org/streams\" xmlns=\"jabber:client\">"
        );
    }

    #[test]
    fn test_interpolated_values_are_escaped() {
        let request = subscribe_request("a&b@example.com", "chan\"nel");
        assert!(request.contains("to=\"a&amp;b@example.com\""));
        assert!(request.contains("channel=\"chan&quot;nel\""));
        assert!(bind_request("<res>").contains("<resource>&lt;res&gt;</resource>"));
    }

    #[test]
    fn test_subscribe_request_shape() {
        assert_eq!(
            subscribe_request("foo@example.com", "cloudprint.google.com"),
            "<iq type=\"set\" id=\"subscribe\" to=\"foo@example.com\"><subscribe xmlns=\"google:push\"><item channel=\"cloudprint.google.com\" from=\"cloudprint.google.com\"/></subscribe></iq>"
        );
    }

    #[test]
    fn test_bare_jid_truncates_resource() {
        assert_eq!(bare_jid("foo@example.com/res"), "foo@example.com");
        assert_eq!(bare_jid("foo@example.com/res/with/slash"), "foo@example.com");
        assert_eq!(bare_jid("foo@example.com"), "foo@example.com");
    }

    #[test]
    fn test_auth_failure_becomes_auth_error() {
        let failure = node(
            "failure",
            ns::SASL,
            &[],
            vec![
                node("not-authorized", ns::SASL, &[], vec![], ""),
                node("text", ns::SASL, &[], vec![], "2-step verification enabled"),
            ],
            "",
        );
        match expect_auth_success(Incoming::Failure(failure)) {
            Err(XmppError::Auth { condition, text }) => {
                assert_eq!(condition, "not-authorized");
                assert_eq!(text.as_deref(), Some("2-step verification enabled"));
            }
            other => panic!("expected auth error, got {other:?}"),
        }
    }

    #[test]
    fn test_auth_success_accepted() {
        let success = node("success", ns::SASL, &[], vec![], "");
        assert!(expect_auth_success(Incoming::Stanza(success)).is_ok());
    }

    #[test]
    fn test_features_wait_rejects_failure_stanza() {
        let error = node("error", ns::STREAM, &[], vec![node("host-unknown", "urn:ietf:params:xml:ns:xmpp-streams", &[], vec![], "")], "");
        let err = expect_features(Incoming::Failure(error)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("host-unknown"));
    }

    #[test]
    fn test_features_wait_rejects_other_stanza() {
        let message = node("message", ns::JABBER_CLIENT, &[], vec![], "");
        assert!(expect_features(Incoming::Stanza(message)).is_err());
    }

    #[test]
    fn test_error_iq_is_protocol_failure() {
        let iq = node(
            "iq",
            ns::JABBER_CLIENT,
            &[("type", "error"), ("id", "bind")],
            vec![node("error", ns::JABBER_CLIENT, &[("type", "cancel")], vec![node("conflict", "urn:ietf:params:xml:ns:xmpp-stanzas", &[], vec![], "")], "")],
            "",
        );
        let err = expect_iq_result(Incoming::Stanza(iq), BIND_ID).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("conflict"));
    }

    #[test]
    fn test_bound_jid_extracted_and_required() {
        let result = node(
            "iq",
            ns::JABBER_CLIENT,
            &[("type", "result"), ("id", "bind")],
            vec![node("bind", ns::BIND, &[], vec![node("jid", ns::BIND, &[], vec![], "foo@example.com/res")], "")],
            "",
        );
        let result = expect_iq_result(Incoming::Stanza(result), BIND_ID).unwrap();
        assert_eq!(bound_jid(&result).unwrap(), "foo@example.com/res");

        let empty = node("iq", ns::JABBER_CLIENT, &[("type", "result")], vec![], "");
        assert!(bound_jid(&empty).is_err());
    }
}
