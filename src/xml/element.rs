use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// XML parse errors.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed xml: {0}")]
    Malformed(String),
    #[error("unexpected end of input")]
    UnexpectedEof,
}

/// A qualified name: local part plus namespace.
///
/// For elements `space` is the resolved namespace URI (or the verbatim
/// prefix when it cannot be resolved). For attributes it is the literal
/// prefix, so `xmlns:stream` is stored as `{space: "xmlns", local: "stream"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Name {
    pub local: String,
    pub space: String,
}

impl Name {
    pub fn new(local: impl Into<String>, space: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            space: space.into(),
        }
    }
}

/// A single attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub name: Name,
    pub value: String,
}

/// An in-memory XML element with ordered children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: Name,
    pub attrs: Vec<Attr>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn new(local: impl Into<String>, space: impl Into<String>) -> Self {
        Self {
            name: Name::new(local, space),
            ..Default::default()
        }
    }

    /// First attribute whose local name matches; the namespace is ignored.
    pub fn attr(&self, local: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name.local == local)
            .map(|a| a.value.as_str())
    }

    /// Update the first attribute with this local name, or append a new
    /// un-namespaced attribute.
    pub fn set_attr(&mut self, local: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(attr) = self.attrs.iter_mut().find(|a| a.name.local == local) {
            attr.value = value;
            return;
        }
        self.attrs.push(Attr {
            name: Name::new(local, ""),
            value,
        });
    }

    /// First child whose local name matches.
    pub fn child(&self, local: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name.local == local)
    }

    /// Parse a standalone XML document into an element tree.
    pub fn parse(input: &str) -> Result<Element, XmlError> {
        parse_scoped(input.as_bytes(), &NsScope::default())
    }
}

/// Escape text for use in attribute values or character data.
pub fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

impl fmt::Display for Element {
    /// Serialize to the wire form: `xmlns` from the resolved namespace on
    /// every namespaced element, attributes in order (a literal bare `xmlns`
    /// attribute is dropped since the declaration is already emitted),
    /// children before character data, and an explicit end tag.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name.local)?;
        if !self.name.space.is_empty() {
            write!(f, " xmlns=\"{}\"", escape(&self.name.space))?;
        }
        for attr in &self.attrs {
            if attr.name.space.is_empty() && attr.name.local == "xmlns" {
                continue;
            }
            if attr.name.space.is_empty() {
                write!(f, " {}=\"{}\"", attr.name.local, escape(&attr.value))?;
            } else {
                write!(
                    f,
                    " {}:{}=\"{}\"",
                    attr.name.space,
                    attr.name.local,
                    escape(&attr.value)
                )?;
            }
        }
        f.write_str(">")?;
        for child in &self.children {
            fmt::Display::fmt(child, f)?;
        }
        if !self.text.is_empty() {
            f.write_str(&escape(&self.text))?;
        }
        write!(f, "</{}>", self.name.local)
    }
}

/// Namespace declarations in scope at some element.
#[derive(Debug, Clone, Default)]
pub(crate) struct NsScope {
    default_ns: String,
    prefixes: Vec<(String, String)>,
}

impl NsScope {
    /// Scope for a child element, folding in any `xmlns` / `xmlns:*`
    /// declarations among its attributes.
    fn child_scope(&self, attrs: &[Attr]) -> NsScope {
        let mut scope = self.clone();
        for attr in attrs {
            if attr.name.space.is_empty() && attr.name.local == "xmlns" {
                scope.default_ns = attr.value.clone();
            } else if attr.name.space == "xmlns" {
                scope
                    .prefixes
                    .retain(|(prefix, _)| prefix != &attr.name.local);
                scope.prefixes.push((attr.name.local.clone(), attr.value.clone()));
            }
        }
        scope
    }

    /// Resolve an element-name prefix. No prefix takes the default
    /// namespace; an unknown prefix is preserved verbatim.
    fn resolve(&self, prefix: &str) -> String {
        if prefix.is_empty() {
            return self.default_ns.clone();
        }
        self.prefixes
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.clone())
            .unwrap_or_else(|| prefix.to_string())
    }
}

fn split_prefix(raw: &str) -> (&str, &str) {
    match raw.split_once(':') {
        Some((prefix, local)) => (prefix, local),
        None => ("", raw),
    }
}

fn unescape_value(raw: &str) -> Result<String, XmlError> {
    quick_xml::escape::unescape(raw)
        .map(|cow| cow.into_owned())
        .map_err(|e| XmlError::Malformed(e.to_string()))
}

/// Read an element's name and attributes from a start tag and derive the
/// namespace scope its children see.
pub(crate) fn read_tag(
    start: &BytesStart<'_>,
    parent: &NsScope,
) -> Result<(Element, NsScope), XmlError> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Malformed(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let (prefix, local) = split_prefix(&key);
        let value = unescape_value(&String::from_utf8_lossy(&attr.value))?;
        attrs.push(Attr {
            name: Name::new(local, prefix),
            value,
        });
    }
    let scope = parent.child_scope(&attrs);
    let raw_name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let (prefix, local) = split_prefix(&raw_name);
    let element = Element {
        name: Name::new(local, scope.resolve(prefix)),
        attrs,
        children: Vec::new(),
        text: String::new(),
    };
    Ok((element, scope))
}

/// Parse a complete XML fragment into an element, resolving namespaces
/// against the given outer scope.
pub(crate) fn parse_scoped(input: &[u8], scope: &NsScope) -> Result<Element, XmlError> {
    let mut reader = Reader::from_reader(input);
    let mut stack: Vec<(Element, NsScope)> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref start)) => {
                let parent = stack.last().map(|(_, s)| s).unwrap_or(scope);
                let entry = read_tag(start, parent)?;
                stack.push(entry);
            }
            Ok(Event::Empty(ref start)) => {
                let parent = stack.last().map(|(_, s)| s).unwrap_or(scope);
                let (element, _) = read_tag(start, parent)?;
                match stack.last_mut() {
                    Some((top, _)) => top.children.push(element),
                    None => return Ok(element),
                }
            }
            Ok(Event::End(_)) => {
                let (element, _) = stack.pop().ok_or_else(|| {
                    XmlError::Malformed("end tag without matching start".into())
                })?;
                match stack.last_mut() {
                    Some((top, _)) => top.children.push(element),
                    None => return Ok(element),
                }
            }
            Ok(Event::Text(ref text)) => {
                // The last character-data run wins, matching the stream
                // decoder this wire format was built against.
                if let Some((top, _)) = stack.last_mut() {
                    top.text = unescape_value(&String::from_utf8_lossy(text.as_ref()))?;
                }
            }
            Ok(Event::CData(ref data)) => {
                if let Some((top, _)) = stack.last_mut() {
                    top.text = String::from_utf8_lossy(data.as_ref()).into_owned();
                }
            }
            Ok(Event::Eof) => return Err(XmlError::UnexpectedEof),
            Ok(_) => {}
            Err(e) => return Err(XmlError::Malformed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Attributes as a set, ignoring namespace declarations: the namespace
    /// itself round-trips through `name.space`, while the serializer
    /// re-materializes `xmlns` attributes on each element.
    fn attrs_as_set(e: &Element) -> Vec<(String, String, String)> {
        let mut set: Vec<_> = e
            .attrs
            .iter()
            .filter(|a| {
                !(a.name.space.is_empty() && a.name.local == "xmlns") && a.name.space != "xmlns"
            })
            .map(|a| (a.name.space.clone(), a.name.local.clone(), a.value.clone()))
            .collect();
        set.sort();
        set
    }

    fn structurally_equal(a: &Element, b: &Element) -> bool {
        a.name == b.name
            && a.text == b.text
            && attrs_as_set(a) == attrs_as_set(b)
            && a.children.len() == b.children.len()
            && a.children
                .iter()
                .zip(&b.children)
                .all(|(x, y)| structurally_equal(x, y))
    }

    #[test]
    fn test_parse_simple() {
        let e = Element::parse("<message to='bob@localhost' type='chat'><body>hi</body></message>")
            .unwrap();
        assert_eq!(e.name.local, "message");
        assert_eq!(e.attr("to"), Some("bob@localhost"));
        assert_eq!(e.attr("type"), Some("chat"));
        assert_eq!(e.child("body").unwrap().text, "hi");
    }

    #[test]
    fn test_attr_first_match_on_local_name() {
        let mut e = Element::new("x", "");
        e.attrs.push(Attr {
            name: Name::new("lang", "xml"),
            value: "en".into(),
        });
        e.attrs.push(Attr {
            name: Name::new("lang", ""),
            value: "de".into(),
        });
        // Namespace is ignored; the first local-name match wins.
        assert_eq!(e.attr("lang"), Some("en"));
        e.set_attr("lang", "fr");
        assert_eq!(e.attrs[0].value, "fr");
        assert_eq!(e.attrs[1].value, "de");
    }

    #[test]
    fn test_set_attr_appends_when_missing() {
        let mut e = Element::new("presence", "");
        e.set_attr("to", "room1@conference.localhost");
        assert_eq!(e.attr("to"), Some("room1@conference.localhost"));
    }

    #[test]
    fn test_namespace_resolution() {
        let e = Element::parse("<query xmlns='jabber:iq:auth'><username>a</username></query>")
            .unwrap();
        assert_eq!(e.name.space, "jabber:iq:auth");
        // The default namespace applies to unprefixed children too.
        assert_eq!(e.child("username").unwrap().name.space, "jabber:iq:auth");
    }

    #[test]
    fn test_prefixed_namespace_resolution() {
        let e = Element::parse(
            "<stream:error xmlns:stream='http://etherx.jabber.org/streams'><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'></conflict></stream:error>",
        )
        .unwrap();
        assert_eq!(e.name.local, "error");
        assert_eq!(e.name.space, "http://etherx.jabber.org/streams");
        assert_eq!(
            e.children[0].name.space,
            "urn:ietf:params:xml:ns:xmpp-streams"
        );
    }

    #[test]
    fn test_unknown_prefix_preserved() {
        let e = Element::parse("<foo:bar></foo:bar>").unwrap();
        assert_eq!(e.name.local, "bar");
        assert_eq!(e.name.space, "foo");
    }

    #[test]
    fn test_xmlns_not_duplicated_on_serialize() {
        let e = Element::parse("<query xmlns='jabber:iq:auth'></query>").unwrap();
        let s = e.to_string();
        assert_eq!(s.matches("xmlns").count(), 1);
        assert_eq!(s, "<query xmlns=\"jabber:iq:auth\"></query>");
    }

    #[test]
    fn test_serialize_text_after_children() {
        let mut e = Element::new("message", "");
        e.children.push(Element::new("body", ""));
        e.text = "trailing".into();
        assert_eq!(e.to_string(), "<message><body></body>trailing</message>");
    }

    #[test]
    fn test_serialize_never_self_closes() {
        let e = Element::new("presence", "");
        assert_eq!(e.to_string(), "<presence></presence>");
    }

    #[test]
    fn test_serialize_escapes() {
        let mut e = Element::new("body", "");
        e.set_attr("from", "a<b>&'\"");
        e.text = "<ChatMsg Type=\"8\"/> & more".into();
        let s = e.to_string();
        assert!(!s.contains("<ChatMsg"));
        assert!(s.contains("&lt;ChatMsg"));
        assert!(s.contains("&amp; more"));
        assert!(s.starts_with("<body from=\""));
    }

    #[test]
    fn test_last_text_run_wins() {
        let e = Element::parse("<a>foo<b></b>bar</a>").unwrap();
        assert_eq!(e.text, "bar");
        assert_eq!(e.children.len(), 1);
    }

    #[test]
    fn test_round_trip_structural_equality() {
        let samples = [
            "<message xmlns='jabber:client' to='bob@localhost' type='groupchat'><body>hello &amp; goodbye</body><subject>s</subject></message>",
            "<iq id='a1' type='set'><query xmlns='jabber:iq:auth'><username>alice</username><password>hunter2</password><resource>game</resource></query></iq>",
            "<presence to='room1@conference.localhost'></presence>",
        ];
        for sample in samples {
            let parsed = Element::parse(sample).unwrap();
            let reparsed = Element::parse(&parsed.to_string()).unwrap();
            assert!(
                structurally_equal(&parsed, &reparsed),
                "round trip changed {sample}"
            );
        }
    }

    #[test]
    fn test_parse_rejects_mismatched_tags() {
        assert!(matches!(
            Element::parse("<a><b></a></b>"),
            Err(XmlError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_truncated_input() {
        assert!(matches!(
            Element::parse("<a><b>"),
            Err(XmlError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_parse_chatmsg_body() {
        let e = Element::parse("<ChatMsg Type=\"8\"><From>alice</From><Msg>/kick bob</Msg></ChatMsg>")
            .unwrap();
        assert_eq!(e.name.local, "ChatMsg");
        assert_eq!(e.attr("Type"), Some("8"));
        assert_eq!(e.child("Msg").unwrap().text, "/kick bob");
    }
}
