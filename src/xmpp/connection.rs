//! Connection lifecycle: handshake, notification wait and teardown.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument, Span};

use super::endpoint::Endpoint;
use super::framing::StanzaParser;
use super::handshake::{self, BIND_ID, KEEPALIVE, SESSION_ID, SUBSCRIBE_ID};
use super::stanza::Incoming;
use super::{Dialer, TlsDialer};
use crate::auth::{Credentials, TokenEncoding};
use crate::error::XmppError;

/// Bound on the polite shutdown in [`XmppConnection::close`].
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

const READ_BUFFER_SIZE: usize = 8192;

/// Where a connection is in its lifecycle. Moves forward only within one
/// `connect()`; `close()` and failures return it to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    StreamOpening,
    Authenticating,
    Binding,
    SessionEstablishing,
    Subscribing,
    Active,
    Failed,
}

/// Fixed per-deployment values; nothing here is negotiated with the server.
#[derive(Debug, Clone)]
pub struct XmppSettings {
    /// Service domain addressed by the stream header.
    pub domain: String,
    pub resource: String,
    /// Push channel to subscribe to.
    pub channel: String,
    /// Idle period after which a whitespace keepalive is written.
    pub keepalive: Duration,
    /// Bound on each blocking read of the handshake.
    pub handshake_timeout: Duration,
    /// SASL mechanism name.
    pub mechanism: String,
    pub token_encoding: TokenEncoding,
}

impl Default for XmppSettings {
    fn default() -> Self {
        Self {
            domain: "gmail.com".to_string(),
            resource: "cloud_print".to_string(),
            channel: "cloudprint.google.com".to_string(),
            keepalive: Duration::from_secs(600),
            handshake_timeout: Duration::from_secs(30),
            mechanism: "X-OAUTH2".to_string(),
            token_encoding: TokenEncoding::JidToken,
        }
    }
}

/// Socket, parser and keepalive clock of one connection attempt.
struct Session<S> {
    stream: S,
    parser: StanzaParser,
    read_buf: Vec<u8>,
    keepalive: Duration,
    keepalive_deadline: Instant,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    fn new(stream: S, keepalive: Duration) -> Self {
        Self {
            stream,
            parser: StanzaParser::new(),
            read_buf: vec![0u8; READ_BUFFER_SIZE],
            keepalive,
            keepalive_deadline: Instant::now() + keepalive,
        }
    }

    fn touch(&mut self) {
        self.keepalive_deadline = Instant::now() + self.keepalive;
    }

    /// Write `data`; `shown` is what the wire log gets instead of the raw bytes.
    async fn send(&mut self, data: &[u8], shown: &str) -> Result<(), XmppError> {
        debug!(bytes = data.len(), data = shown, "SEND");
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        self.touch();
        Ok(())
    }

    /// One read from the socket into the parser. Cancel-safe: dropping the
    /// future before the read completes loses no bytes.
    async fn read(&mut self) -> Result<(), XmppError> {
        let n = self.stream.read(&mut self.read_buf).await?;
        if n == 0 {
            return Err(XmppError::connection("socket closed by server"));
        }
        self.touch();
        let data = &self.read_buf[..n];
        debug!(bytes = n, data = %String::from_utf8_lossy(data), "RECV");
        self.parser.feed(data)
    }
}

/// Why the notification wait woke up.
enum Wake {
    Read(Result<(), XmppError>),
    Timer,
}

/// Push-channel connection. Construct idle, then [`connect`](Self::connect).
///
/// All events are emitted inside the span passed to [`new`](Self::new).
pub struct XmppConnection<D: Dialer = TlsDialer> {
    dialer: D,
    settings: XmppSettings,
    span: Span,
    state: ConnectionState,
    connected: bool,
    bound_jid: Option<String>,
    session: Option<Session<D::Stream>>,
}

impl<D: Dialer> XmppConnection<D> {
    pub fn new(dialer: D, settings: XmppSettings, span: Span) -> Self {
        Self {
            dialer,
            settings,
            span,
            state: ConnectionState::Disconnected,
            connected: false,
            bound_jid: None,
            session: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Cached liveness flag. Never touches the socket.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Full JID assigned by the server during bind, while connected.
    pub fn bound_jid(&self) -> Option<&str> {
        self.bound_jid.as_deref()
    }

    /// Dial `host:port` over TLS and run the whole handshake.
    pub async fn connect(&mut self, host: &str, port: u16, credentials: &Credentials) -> Result<(), XmppError> {
        self.connect_endpoint(&Endpoint::new(host, port), credentials).await
    }

    /// Like [`connect`](Self::connect) with a parsed endpoint (custom TLS name).
    pub async fn connect_endpoint(
        &mut self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<(), XmppError> {
        self.close().await;

        let span = self.span.clone();
        let started = Instant::now();
        let result = self.handshake(endpoint, credentials).instrument(span.clone()).await;

        match result {
            Ok(()) => {
                self.state = ConnectionState::Active;
                self.connected = true;
                span.in_scope(|| {
                    info!(
                        endpoint = %endpoint,
                        jid = ?self.bound_jid,
                        channel = %self.settings.channel,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Push channel active"
                    )
                });
                Ok(())
            }
            Err(e) => {
                let failed_in = self.state;
                self.state = ConnectionState::Failed;
                span.in_scope(|| {
                    warn!(
                        endpoint = %endpoint,
                        state = ?failed_in,
                        error = %e,
                        error_kind = ?e.kind(),
                        "Push channel handshake failed"
                    )
                });
                self.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self, endpoint: &Endpoint, credentials: &Credentials) -> Result<(), XmppError> {
        self.state = ConnectionState::StreamOpening;
        let stream = self.dialer.dial(endpoint).await?;
        self.session = Some(Session::new(stream, self.settings.keepalive));

        let open = handshake::stream_open(&self.settings.domain);
        handshake::expect_features(self.exchange(&open, &open, "stream features").await?)?;

        self.state = ConnectionState::Authenticating;
        let payload = credentials.sasl_payload(self.settings.token_encoding);
        let auth = handshake::auth_request(&self.settings.mechanism, &payload);
        let shown = format!("<auth mechanism=\"{}\">(redacted)</auth>", self.settings.mechanism);
        handshake::expect_auth_success(self.exchange(&auth, &shown, "auth result").await?)?;
        debug!(jid = %credentials.jid, "Authenticated, restarting stream");

        handshake::expect_features(self.exchange(&open, &open, "post-auth stream features").await?)?;

        self.state = ConnectionState::Binding;
        let bind = handshake::bind_request(&self.settings.resource);
        let bound = handshake::expect_iq_result(self.exchange(&bind, &bind, "bind result").await?, BIND_ID)?;
        let full_jid = handshake::bound_jid(&bound)?;
        let bare_jid = handshake::bare_jid(&full_jid).to_string();
        debug!(jid = %full_jid, "Resource bound");

        self.state = ConnectionState::SessionEstablishing;
        let session = handshake::session_request();
        handshake::expect_iq_result(
            self.exchange(&session, &session, "session result").await?,
            SESSION_ID,
        )?;

        self.state = ConnectionState::Subscribing;
        let subscribe = handshake::subscribe_request(&bare_jid, &self.settings.channel);
        handshake::expect_iq_result(
            self.exchange(&subscribe, &subscribe, "subscribe result").await?,
            SUBSCRIBE_ID,
        )?;

        self.bound_jid = Some(full_jid);
        if let Some(session) = self.session.as_mut() {
            session.touch();
        }
        Ok(())
    }

    /// Write `request` (logged as `shown`), then read until one stanza is queued.
    async fn exchange(&mut self, request: &str, shown: &str, waiting_for: &str) -> Result<Incoming, XmppError> {
        let timeout = self.settings.handshake_timeout;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| XmppError::connection("not connected"))?;

        session.send(request.as_bytes(), shown).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let next = session.parser.consume_next();
            if !next.is_empty() {
                return Ok(next);
            }
            tokio::time::timeout_at(deadline, session.read())
                .await
                .map_err(|_| XmppError::Timeout {
                    secs: timeout.as_secs(),
                    waiting_for: waiting_for.to_string(),
                })??;
        }
    }

    /// Wait for the next stanza from the server.
    ///
    /// Returns `Ok(true)` once a stanza is available, `Ok(false)` when
    /// `timeout` runs out first. `None` waits indefinitely, writing keepalives
    /// whenever the socket sits idle for the keepalive period. Any error
    /// closes the connection before it is returned.
    pub async fn await_notification(&mut self, timeout: Option<Duration>) -> Result<bool, XmppError> {
        let span = self.span.clone();
        let result = self.wait(timeout).instrument(span.clone()).await;
        if let Err(e) = &result {
            span.in_scope(|| warn!(error = %e, error_kind = ?e.kind(), "Push channel lost"));
            self.close().await;
        }
        result
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Result<bool, XmppError> {
        let caller_deadline = timeout.map(|t| Instant::now() + t);
        let session = match self.session.as_mut() {
            Some(session) if self.connected => session,
            _ => return Err(XmppError::connection("not connected")),
        };

        loop {
            match session.parser.consume_next() {
                Incoming::Stanza(stanza) => {
                    if stanza.is_push_notification() {
                        info!(from = stanza.attr("from").unwrap_or_default(), "Push notification received");
                    } else {
                        debug!(stanza = stanza.name(), "Non-notification stanza received");
                    }
                    return Ok(true);
                }
                Incoming::Failure(stanza) => {
                    return Err(XmppError::protocol(
                        stanza.name(),
                        stanza.condition().unwrap_or("undefined-condition"),
                    ));
                }
                Incoming::Empty => {}
            }

            let keepalive_at = session.keepalive_deadline;
            let wake_at = caller_deadline.map_or(keepalive_at, |d| d.min(keepalive_at));

            let wake = tokio::select! {
                biased;
                read = session.read() => Wake::Read(read),
                _ = tokio::time::sleep_until(wake_at) => Wake::Timer,
            };

            match wake {
                Wake::Read(read) => {
                    read?;
                    // A peer that keeps the socket readable without completing
                    // a stanza would otherwise starve the timer arm.
                    if !session.parser.has_pending() && caller_deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(false);
                    }
                }
                Wake::Timer => {
                    let now = Instant::now();
                    if now >= session.keepalive_deadline {
                        session.send(KEEPALIVE, "(keepalive)").await?;
                    }
                    if caller_deadline.is_some_and(|d| now >= d) {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Tear down the socket. Never fails; always ends `Disconnected`.
    pub async fn close(&mut self) {
        let was_active = self.connected;
        self.connected = false;
        self.bound_jid = None;

        if let Some(mut session) = self.session.take() {
            async move {
                let shutdown = async {
                    if was_active {
                        session.stream.write_all(b"</stream:stream>").await?;
                    }
                    session.stream.shutdown().await
                };
                match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
                    Ok(Ok(())) => debug!("Socket closed"),
                    Ok(Err(e)) => debug!(error = %e, "Socket shutdown failed, dropping"),
                    Err(_) => debug!("Socket shutdown timed out, dropping"),
                }
            }
            .instrument(self.span.clone())
            .await;
        }

        self.state = ConnectionState::Disconnected;
    }
}
