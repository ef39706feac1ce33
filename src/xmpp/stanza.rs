//! Parsed top-level stream elements.

/// Namespace URIs used on the push channel.
pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const PUSH: &str = "google:push";
}

/// One completed XML element from the stream.
///
/// Built once by the parser and never mutated afterwards. `name` is the local
/// name; the prefix, if any, has been resolved into `namespace`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    name: String,
    namespace: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Stanza>,
    text: String,
}

impl Stanza {
    pub(crate) fn new(
        name: String,
        namespace: Option<String>,
        attrs: Vec<(String, String)>,
        children: Vec<Stanza>,
        text: String,
    ) -> Self {
        Self {
            name,
            namespace,
            attrs,
            children,
            text,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Attribute value by qualified name (`to`, `type`, `xml:lang`, ...).
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First direct child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Stanza> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Walk direct children by local name, e.g. `["bind", "jid"]`.
    pub fn find(&self, path: &[&str]) -> Option<&Stanza> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    /// Concatenated character data directly inside this element.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Error and failure elements (`failure`, `stream:error`, ...) by tag name.
    pub fn is_failure(&self) -> bool {
        self.name.ends_with("error") || self.name.ends_with("failure")
    }

    /// An `<iq type="error">`: the tag alone does not mark it as a failure.
    pub fn is_error_iq(&self) -> bool {
        self.name == "iq" && self.attr("type") == Some("error")
    }

    /// A `message` carrying a push payload from the subscribed channel.
    pub fn is_push_notification(&self) -> bool {
        self.name == "message"
            && self
                .children
                .iter()
                .any(|c| c.namespace() == Some(ns::PUSH))
    }

    /// Name of the first child element, typically the SASL condition or the
    /// defined condition of a stream error.
    pub fn condition(&self) -> Option<&str> {
        self.children
            .iter()
            .map(|c| c.name())
            .find(|name| *name != "text")
    }
}

/// Result of asking the parser for the next stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// An ordinary stanza.
    Stanza(Stanza),
    /// A stanza whose tag ends in `error` or `failure`.
    Failure(Stanza),
    /// Nothing completed yet.
    Empty,
}

impl Incoming {
    pub fn is_empty(&self) -> bool {
        matches!(self, Incoming::Empty)
    }
}
