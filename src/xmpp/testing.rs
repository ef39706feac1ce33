//! In-memory push server used by connection and daemon tests.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::{Dialer, Endpoint};
use crate::error::XmppError;

pub const HEADER: &str = "<stream:stream from=\"gmail.com\" id=\"5F2A\" version=\"1.0\" xmlns:stream=\"http://etherx.jabber.org/streams\" xmlns=\"jabber:client\">";
pub const FEATURES: &str = "<stream:features><mechanisms xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"><mechanism>X-OAUTH2</mechanism></mechanisms></stream:features>";
pub const BIND_FEATURES: &str = "<stream:features><bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"/><session xmlns=\"urn:ietf:params:xml:ns:xmpp-session\"/></stream:features>";
pub const SUCCESS: &str = "<success xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"/>";
pub const BIND_RESULT: &str = "<iq type=\"result\" id=\"bind\"><bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"><jid>foo@example.com/res</jid></bind></iq>";
pub const SESSION_RESULT: &str = "<iq type=\"result\" id=\"session\"/>";
pub const SUBSCRIBE_RESULT: &str = "<iq type=\"result\" id=\"subscribe\" to=\"foo@example.com/res\"/>";
pub const PUSH: &str = "<message from=\"cloudprint.google.com\" to=\"foo@example.com/res\"><push:push xmlns:push=\"google:push\" channel=\"cloudprint.google.com\"><push:recipient to=\"foo@example.com\"/><push:data>cHJpbnRlcg==</push:data></push:push></message>";

/// Hands out pre-made in-memory streams, one per dial.
pub struct ScriptedDialer {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl ScriptedDialer {
    pub fn new(streams: Vec<DuplexStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
        }
    }
}

impl Dialer for ScriptedDialer {
    type Stream = DuplexStream;

    fn dial(&self, _endpoint: &Endpoint) -> impl Future<Output = Result<DuplexStream, XmppError>> + Send {
        let next = self.streams.lock().unwrap().pop_front();
        async move { next.ok_or_else(|| XmppError::connection("no scripted stream left")) }
    }
}

/// Server side of one scripted session: for each step, read until the
/// client has sent `expect`, then write `reply`.
pub async fn serve(mut server: DuplexStream, script: Vec<(&'static str, String)>) -> (DuplexStream, String) {
    let mut transcript = String::new();
    let mut pending = String::new();
    let mut buf = [0u8; 4096];

    for (expect, reply) in script {
        while !pending.contains(expect) {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up while server waited for {expect:?}");
            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
            transcript.push_str(&chunk);
            pending.push_str(&chunk);
        }
        pending.clear();
        server.write_all(reply.as_bytes()).await.unwrap();
    }

    (server, transcript)
}

/// Full successful handshake; `after_subscribe` rides along with the last ack.
pub fn happy_script(after_subscribe: &str) -> Vec<(&'static str, String)> {
    vec![
        ("<stream:stream", format!("{HEADER}{FEATURES}")),
        ("</auth>", SUCCESS.to_string()),
        ("<stream:stream", format!("{HEADER}{BIND_FEATURES}")),
        ("id=\"bind\"", BIND_RESULT.to_string()),
        ("id=\"session\"", SESSION_RESULT.to_string()),
        ("id=\"subscribe\"", format!("{SUBSCRIBE_RESULT}{after_subscribe}")),
    ]
}
