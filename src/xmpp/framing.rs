//! Incremental stanza framing over the raw TLS byte stream.
//!
//! The server opens one `<stream:stream>` document per session and never
//! closes it while we are connected, so the parser tracks element depth below
//! the stream wrapper and emits each top-level child as soon as its closing tag
//! arrives. Bytes are buffered until a whole stanza is present; every `feed`
//! rescans the pending bytes, so a tag, attribute or text run may be split at
//! any byte.

use std::collections::VecDeque;

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use tracing::{debug, error};

use super::stanza::{Incoming, Stanza};
use crate::error::XmppError;

/// Upper bound on bytes held while waiting for a stanza to complete.
///
/// Typical push-channel stanzas are well under a kilobyte; anything that grows
/// past this without closing is treated as a broken peer.
pub const MAX_PENDING_BYTES: usize = 1_024 * 1_024;

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Namespace declarations in scope: `(prefix, uri)`, empty prefix = default.
type Declarations = Vec<(String, String)>;

/// Stateful stanza parser. One per connection; dropped with it.
#[derive(Debug, Default)]
pub struct StanzaParser {
    buffer: Vec<u8>,
    queue: VecDeque<Incoming>,
    stream_scope: Declarations,
    stream_id: Option<String>,
    stream_headers: usize,
}

/// Outcome of scanning the front of the pending buffer.
#[derive(Debug)]
enum Scan {
    /// `<stream:stream ...>` header, `len` bytes including any preceding prolog.
    StreamOpen {
        len: usize,
        declarations: Declarations,
        id: Option<String>,
    },
    /// `</stream:stream>` (or a self-closed stream element).
    StreamClose,
    /// A complete top-level element occupying `start..end`.
    Element { start: usize, end: usize },
    /// No complete item; the first `skip` bytes were inter-stanza filler.
    Incomplete { skip: usize },
}

impl StanzaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes from the socket and enqueue every stanza they complete.
    ///
    /// An `Err` is fatal: the connection owning this parser must be closed.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), XmppError> {
        self.buffer.extend_from_slice(data);

        let mut consumed = 0;
        loop {
            match scan(&self.buffer[consumed..])? {
                Scan::StreamOpen {
                    len,
                    declarations,
                    id,
                } => {
                    debug!(stream_id = ?id, restarts = self.stream_headers, "Stream header received");
                    self.stream_scope = declarations;
                    self.stream_id = id;
                    self.stream_headers += 1;
                    consumed += len;
                }
                Scan::StreamClose => {
                    self.buffer.clear();
                    return Err(XmppError::connection("stream closed by server"));
                }
                Scan::Element { start, end } => {
                    let bytes = &self.buffer[consumed + start..consumed + end];
                    let stanza = build_stanza(bytes, &self.stream_scope)?;
                    self.queue.push_back(if stanza.is_failure() {
                        Incoming::Failure(stanza)
                    } else {
                        Incoming::Stanza(stanza)
                    });
                    consumed += end;
                }
                Scan::Incomplete { skip } => {
                    consumed += skip;
                    break;
                }
            }
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }

        if self.buffer.len() > MAX_PENDING_BYTES {
            error!(
                pending_bytes = self.buffer.len(),
                limit = MAX_PENDING_BYTES,
                "Pending stanza exceeded size limit"
            );
            return Err(XmppError::parse(format!(
                "incomplete stanza exceeds {MAX_PENDING_BYTES} bytes"
            )));
        }

        Ok(())
    }

    /// Oldest completed stanza not yet handed out. Never blocks.
    pub fn consume_next(&mut self) -> Incoming {
        self.queue.pop_front().unwrap_or(Incoming::Empty)
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Bytes buffered for a stanza that has not completed yet.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// `id` attribute of the most recent stream header.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// Number of stream headers seen (2 after a post-auth restart).
    pub fn stream_headers(&self) -> usize {
        self.stream_headers
    }
}

fn is_stream_tag(name: QName<'_>) -> bool {
    name.as_ref() == b"stream:stream" || name.local_name().as_ref() == b"stream"
}

fn qname_str<'a>(name: &'a QName<'_>) -> Result<&'a str, XmppError> {
    std::str::from_utf8(name.as_ref())
        .map_err(|e| XmppError::parse(format!("element name is not UTF-8: {e}")))
}

/// Whether a construct the reader could not finish, starting at `tail[0] == b'<'`,
/// may still become well-formed once more bytes arrive.
fn is_truncated(cause: SyntaxError, tail: &[u8]) -> bool {
    fn could_become(tail: &[u8], opener: &[u8]) -> bool {
        let n = tail.len().min(opener.len());
        tail[..n].eq_ignore_ascii_case(&opener[..n])
    }

    match cause {
        // `<!` with nothing after it yet.
        SyntaxError::InvalidBangMarkup => tail.len() <= 2,
        SyntaxError::UnclosedComment => could_become(tail, b"<!--"),
        SyntaxError::UnclosedCData => could_become(tail, b"<![CDATA["),
        SyntaxError::UnclosedDoctype => could_become(tail, b"<!DOCTYPE"),
        // Names are checked once the tag's `>` arrives.
        SyntaxError::UnclosedPIOrXmlDecl | SyntaxError::UnclosedTag => true,
    }
}

/// Loose XML name check: rejects the empty and whitespace-led names the
/// reader hands back for input like `< foo>` or `<>`.
fn is_name(name: &[u8]) -> bool {
    let Some((&first, rest)) = name.split_first() else {
        return false;
    };
    let start_ok = first.is_ascii_alphabetic() || first == b'_' || first == b':' || first >= 0x80;
    start_ok
        && rest
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b':' | b'-' | b'.') || b >= 0x80)
}

fn check_name(name: &[u8]) -> Result<(), XmppError> {
    if is_name(name) {
        Ok(())
    } else {
        Err(XmppError::parse(format!(
            "invalid element name '{}'",
            String::from_utf8_lossy(name)
        )))
    }
}

/// Find the next complete item at the front of `buffer`.
fn scan(buffer: &[u8]) -> Result<Scan, XmppError> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    // End tags are matched against `open` below so a mismatch becomes a ParseError.
    reader.config_mut().check_end_names = false;

    let mut open: Vec<Vec<u8>> = Vec::new();
    let mut stanza_start = 0;
    let mut idle_end = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                if open.is_empty() {
                    idle_end = reader.buffer_position() as usize;
                }
            }
            Ok(Event::Text(t)) => {
                // Whitespace keepalives between stanzas land here and are dropped.
                if open.is_empty() {
                    if let Err(e) = std::str::from_utf8(&t) {
                        // Only a character cut off by the end of the buffer may still complete.
                        if e.error_len().is_none() && reader.buffer_position() as usize == buffer.len() {
                            return Ok(Scan::Incomplete { skip: idle_end });
                        }
                        return Err(XmppError::parse(format!(
                            "text between stanzas is not valid UTF-8: {e}"
                        )));
                    }
                    idle_end = reader.buffer_position() as usize;
                }
            }
            Ok(Event::CData(c)) => {
                if open.is_empty() {
                    std::str::from_utf8(&c)
                        .map_err(|e| XmppError::parse(format!("CDATA is not valid UTF-8: {e}")))?;
                    idle_end = reader.buffer_position() as usize;
                }
            }
            Ok(Event::Start(e)) => {
                check_name(e.name().as_ref())?;
                if open.is_empty() && is_stream_tag(e.name()) {
                    let (_, attrs, declarations) = element_parts(&e)?;
                    let id = attrs
                        .into_iter()
                        .find(|(key, _)| key == "id")
                        .map(|(_, value)| value);
                    return Ok(Scan::StreamOpen {
                        len: reader.buffer_position() as usize,
                        declarations,
                        id,
                    });
                }
                if open.is_empty() {
                    stanza_start = pos;
                }
                open.push(e.name().as_ref().to_vec());
            }
            Ok(Event::Empty(e)) => {
                check_name(e.name().as_ref())?;
                if open.is_empty() {
                    if is_stream_tag(e.name()) {
                        return Ok(Scan::StreamClose);
                    }
                    return Ok(Scan::Element {
                        start: pos,
                        end: reader.buffer_position() as usize,
                    });
                }
            }
            Ok(Event::End(e)) => {
                check_name(e.name().as_ref())?;
                match open.pop() {
                    None if is_stream_tag(e.name()) => return Ok(Scan::StreamClose),
                    None => {
                        return Err(XmppError::parse(format!(
                            "closing tag </{}> without matching start",
                            String::from_utf8_lossy(e.name().as_ref())
                        )));
                    }
                    Some(expected) => {
                        if expected != e.name().as_ref() {
                            return Err(XmppError::parse(format!(
                                "mismatched closing tag </{}>, expected </{}>",
                                String::from_utf8_lossy(e.name().as_ref()),
                                String::from_utf8_lossy(&expected)
                            )));
                        }
                        if open.is_empty() {
                            return Ok(Scan::Element {
                                start: stanza_start,
                                end: reader.buffer_position() as usize,
                            });
                        }
                    }
                }
            }
            Ok(Event::Eof) => return Ok(Scan::Incomplete { skip: idle_end }),
            Err(quick_xml::Error::Syntax(cause)) => {
                // The reader stops at the end of the buffer for both a cut-off
                // construct and a malformed one; only the first may complete.
                let tail = &buffer[pos..];
                let tail = tail
                    .iter()
                    .position(|&b| b == b'<')
                    .map_or(tail, |start| &tail[start..]);
                if is_truncated(cause, tail) {
                    return Ok(Scan::Incomplete { skip: idle_end });
                }
                error!(error = %cause, "Malformed markup");
                return Err(XmppError::parse(format!(
                    "malformed markup '{}': {cause}",
                    String::from_utf8_lossy(&tail[..tail.len().min(32)])
                )));
            }
            Err(e) => {
                error!(error = ?e, "XML parsing error");
                return Err(XmppError::parse(e.to_string()));
            }
        }
    }
}

/// Split a start tag into its qualified name, plain attributes and
/// namespace declarations.
fn element_parts(e: &BytesStart<'_>) -> Result<(String, Vec<(String, String)>, Declarations), XmppError> {
    let name = e.name();
    let name = qname_str(&name)?.to_string();

    let mut attrs = Vec::new();
    let mut declarations = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| XmppError::parse(format!("invalid attribute on <{name}>: {err}")))?;
        let key = qname_str(&attr.key)?.to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| XmppError::parse(format!("invalid attribute value on <{name}>: {err}")))?
            .into_owned();

        if key == "xmlns" {
            declarations.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declarations.push((prefix.to_string(), value));
        } else {
            attrs.push((key, value));
        }
    }

    Ok((name, attrs, declarations))
}

/// Element under construction while walking a stanza's events.
struct Node {
    local: String,
    namespace: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Stanza>,
    text: String,
}

impl Node {
    fn finish(self) -> Stanza {
        Stanza::new(self.local, self.namespace, self.attrs, self.children, self.text)
    }
}

fn resolve(prefix: Option<&str>, scopes: &[Declarations]) -> Result<Option<String>, XmppError> {
    let wanted = prefix.unwrap_or("");
    if wanted == "xml" {
        return Ok(Some(XML_NAMESPACE.to_string()));
    }
    let found = scopes
        .iter()
        .rev()
        .flat_map(|scope| scope.iter().rev())
        .find(|(p, _)| p == wanted)
        .map(|(_, uri)| uri.clone());

    match (found, prefix) {
        (Some(uri), _) => Ok(Some(uri)),
        (None, None) => Ok(None),
        (None, Some(p)) => Err(XmppError::parse(format!("unbound namespace prefix '{p}'"))),
    }
}

fn open_node(e: &BytesStart<'_>, scopes: &mut Vec<Declarations>) -> Result<Node, XmppError> {
    let (name, attrs, declarations) = element_parts(e)?;
    scopes.push(declarations);

    let (prefix, local) = match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, name.as_str()),
    };
    let namespace = resolve(prefix, scopes)?;

    Ok(Node {
        local: local.to_string(),
        namespace,
        attrs,
        children: Vec::new(),
        text: String::new(),
    })
}

/// Build a [`Stanza`] tree from the bytes of one complete top-level element.
fn build_stanza(bytes: &[u8], stream_scope: &Declarations) -> Result<Stanza, XmppError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| XmppError::parse(format!("stanza is not valid UTF-8: {e}")))?;

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    let mut scopes: Vec<Declarations> = vec![stream_scope.clone()];
    let mut stack: Vec<Node> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let node = open_node(&e, &mut scopes)?;
                stack.push(node);
            }
            Ok(Event::Empty(e)) => {
                let node = open_node(&e, &mut scopes)?;
                scopes.pop();
                let stanza = node.finish();
                match stack.last_mut() {
                    Some(parent) => parent.children.push(stanza),
                    None => return Ok(stanza),
                }
            }
            Ok(Event::End(_)) => {
                scopes.pop();
                let Some(node) = stack.pop() else {
                    return Err(XmppError::parse("unbalanced closing tag"));
                };
                let stanza = node.finish();
                match stack.last_mut() {
                    Some(parent) => parent.children.push(stanza),
                    None => return Ok(stanza),
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(node) = stack.last_mut() {
                    let unescaped = t
                        .unescape()
                        .map_err(|e| XmppError::parse(format!("invalid character data: {e}")))?;
                    node.text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(node) = stack.last_mut() {
                    let data = std::str::from_utf8(&c)
                        .map_err(|e| XmppError::parse(format!("CDATA is not valid UTF-8: {e}")))?;
                    node.text.push_str(data);
                }
            }
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {}
            Ok(Event::Eof) => return Err(XmppError::parse("stanza ended before its closing tag")),
            Err(e) => return Err(XmppError::parse(e.to_string())),
        }
    }
}
