//! Minimal XML tree used for RPC envelopes and replies.
//!
//! Replies are parsed with `quick-xml` into an owned [`Element`] tree. The
//! tree can be pretty-printed, searched by local name and converted into a
//! `serde_json::Value` for callers that want structured data.

use std::borrow::Cow;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::{Map, Value};

use crate::error::DeviceError;

/// Child of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    /// Pre-serialized XML inserted verbatim (filters, XML configuration).
    Raw(String),
}

/// An XML element with attributes and ordered children.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

fn xml_err(err: impl std::fmt::Display) -> DeviceError {
    DeviceError::Xml(err.to_string())
}

fn local(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, l)| l).unwrap_or(name)
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.children.push(Node::Raw(raw.into()));
        self
    }

    /// Set an attribute, replacing an existing one with the same name.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Element name without a namespace prefix.
    pub fn local_name(&self) -> &str {
        local(&self.name)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key || local(k) == key)
            .map(|(_, v)| v.as_str())
    }

    /// Direct child elements.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
    }

    /// First direct child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|el| el.local_name() == name)
    }

    /// First descendant (depth first, self excluded) with the given local name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        for el in self.elements() {
            if el.local_name() == name {
                return Some(el);
            }
            if let Some(found) = el.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with the given local name, in document order.
    pub fn find_all<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for el in self.elements() {
            if el.local_name() == name {
                out.push(el);
            }
            el.find_all(name, out);
        }
    }

    /// Trimmed text of the first descendant with the given local name.
    pub fn find_text(&self, name: &str) -> Option<String> {
        self.find(name).map(|el| el.text().trim().to_string())
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    pub fn has_element_children(&self) -> bool {
        self.children
            .iter()
            .any(|node| matches!(node, Node::Element(_) | Node::Raw(_)))
    }

    /// Remove namespace prefixes and `xmlns` declarations throughout the tree.
    pub fn strip_namespaces(&mut self) {
        self.name = local(&self.name).to_string();
        self.attributes
            .retain(|(k, _)| k != "xmlns" && !k.starts_with("xmlns:"));
        for node in &mut self.children {
            if let Node::Element(el) = node {
                el.strip_namespaces();
            }
        }
    }

    /// Parse a document and return its root element.
    pub fn parse(input: &str) -> Result<Element, DeviceError> {
        Self::parse_with_depth(input, None)
    }

    /// Parse a document, rejecting nesting deeper than `max_depth`.
    pub fn parse_with_depth(input: &str, max_depth: Option<usize>) -> Result<Element, DeviceError> {
        let mut reader = Reader::from_str(input);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(start) => {
                    if let Some(max) = max_depth
                        && stack.len() >= max
                    {
                        return Err(xml_err(format!(
                            "document nesting exceeds {max} levels; enable huge_tree to parse it"
                        )));
                    }
                    stack.push(Self::from_start(&start)?);
                }
                Event::Empty(start) => {
                    let el = Self::from_start(&start)?;
                    Self::attach(&mut stack, &mut root, el)?;
                }
                Event::End(_) => {
                    let el = stack
                        .pop()
                        .ok_or_else(|| xml_err("unbalanced closing tag"))?;
                    Self::attach(&mut stack, &mut root, el)?;
                }
                Event::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = text.unescape().map_err(xml_err)?;
                        if !text.trim().is_empty() {
                            parent.children.push(Node::Text(text.into_owned()));
                        }
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                        parent.children.push(Node::Text(text));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(xml_err(format!(
                "unexpected end of document inside <{}>",
                stack.last().map(|el| el.name.as_str()).unwrap_or_default()
            )));
        }
        root.ok_or_else(|| xml_err("document has no root element"))
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Element, DeviceError> {
        let mut el = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
        for attr in start.attributes() {
            let attr = attr.map_err(xml_err)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_err)?.into_owned();
            el.attributes.push((key, value));
        }
        Ok(el)
    }

    fn attach(
        stack: &mut [Element],
        root: &mut Option<Element>,
        el: Element,
    ) -> Result<(), DeviceError> {
        match stack.last_mut() {
            Some(parent) => {
                parent.children.push(Node::Element(el));
                Ok(())
            }
            None if root.is_none() => {
                *root = Some(el);
                Ok(())
            }
            None => Err(xml_err(format!("second root element <{}>", el.name))),
        }
    }

    fn write_open(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
    }

    /// Compact serialization.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_compact(&mut out);
        out
    }

    fn write_compact(&self, out: &mut String) {
        self.write_open(out);
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_compact(out),
                Node::Text(t) => out.push_str(&escape(t.as_str())),
                Node::Raw(raw) => out.push_str(raw),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Indented serialization, two spaces per level, trailing newline.
    pub fn to_pretty(&self) -> String {
        let mut out = String::new();
        self.write_pretty(&mut out, 0);
        out
    }

    fn write_pretty(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        out.push_str(&indent);
        self.write_open(out);
        if self.children.is_empty() {
            out.push_str("/>\n");
            return;
        }
        if !self.has_element_children() {
            out.push('>');
            out.push_str(&escape(self.text().as_str()));
            out.push_str("</");
            out.push_str(&self.name);
            out.push_str(">\n");
            return;
        }
        out.push_str(">\n");
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_pretty(out, depth + 1),
                Node::Text(t) => {
                    out.push_str(&indent);
                    out.push_str("  ");
                    out.push_str(&escape(t.trim()));
                    out.push('\n');
                }
                Node::Raw(raw) => {
                    out.push_str(&indent);
                    out.push_str("  ");
                    out.push_str(raw.trim());
                    out.push('\n');
                }
            }
        }
        out.push_str(&indent);
        out.push_str("</");
        out.push_str(&self.name);
        out.push_str(">\n");
    }

    /// Structured form: `{ "<name>": <content> }`.
    ///
    /// Leaf elements become strings, repeated siblings become arrays and
    /// attributes are dropped.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.local_name().to_string(), self.content_value());
        Value::Object(map)
    }

    fn content_value(&self) -> Value {
        if !self.elements().any(|_| true) {
            return Value::String(self.text());
        }
        let mut map = Map::new();
        for el in self.elements() {
            insert_repeated(&mut map, el.local_name(), el.content_value());
        }
        Value::Object(map)
    }

    /// Dictionary form with `@attr` keys and `#text`, as consumed by the
    /// session broker.
    pub fn to_dict(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.name.clone(), self.dict_content());
        Value::Object(map)
    }

    fn dict_content(&self) -> Value {
        let text = self.text();
        let text = text.trim();
        if self.attributes.is_empty() && !self.elements().any(|_| true) {
            return if text.is_empty() {
                Value::Null
            } else {
                Value::String(text.to_string())
            };
        }
        let mut map = Map::new();
        for (k, v) in &self.attributes {
            map.insert(format!("@{k}"), Value::String(v.clone()));
        }
        for el in self.elements() {
            insert_repeated(&mut map, &el.name, el.dict_content());
        }
        if !text.is_empty() {
            map.insert("#text".to_string(), Value::String(text.to_string()));
        }
        Value::Object(map)
    }
}

fn insert_repeated(map: &mut Map<String, Value>, key: &str, value: Value) {
    match map.get_mut(key) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key.to_string(), value);
        }
    }
}

/// Escape text for inclusion in element content.
pub fn escape_text(text: &str) -> Cow<'_, str> {
    escape(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const REPLY: &str = r#"<?xml version="1.0"?>
<rpc-reply xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" xmlns:junos="http://xml.juniper.net/junos/*/junos" message-id="3">
  <interface-information>
    <physical-interface><name>ge-0/0/0</name><oper-status>up</oper-status></physical-interface>
    <physical-interface><name>ge-0/0/1</name><oper-status>down</oper-status></physical-interface>
  </interface-information>
</rpc-reply>"#;

    #[test]
    fn parse_builds_tree_and_finds_descendants() {
        let root = Element::parse(REPLY).expect("parse");
        assert_eq!(root.local_name(), "rpc-reply");
        assert_eq!(root.attr("message-id"), Some("3"));
        let mut names = Vec::new();
        root.find_all("name", &mut names);
        assert_eq!(names.len(), 2);
        assert_eq!(root.find_text("oper-status").as_deref(), Some("up"));
    }

    #[test]
    fn repeated_siblings_become_arrays() {
        let root = Element::parse(REPLY).expect("parse");
        let info = root.child("interface-information").expect("info");
        assert_eq!(
            info.to_value(),
            json!({"interface-information": {"physical-interface": [
                {"name": "ge-0/0/0", "oper-status": "up"},
                {"name": "ge-0/0/1", "oper-status": "down"}
            ]}})
        );
    }

    #[test]
    fn pretty_print_indents_and_escapes() {
        let el = Element::new("get-config")
            .with_attr("format", "text")
            .with_child(Element::new("filter").with_text("a<b"))
            .with_child(Element::new("terse"));
        assert_eq!(
            el.to_pretty(),
            "<get-config format=\"text\">\n  <filter>a&lt;b</filter>\n  <terse/>\n</get-config>\n"
        );
        assert_eq!(
            el.to_xml(),
            "<get-config format=\"text\"><filter>a&lt;b</filter><terse/></get-config>"
        );
    }

    #[test]
    fn strip_namespaces_removes_prefixes_and_declarations() {
        let mut root =
            Element::parse(r#"<nc:rpc-reply xmlns:nc="urn:x"><nc:ok/></nc:rpc-reply>"#).unwrap();
        root.strip_namespaces();
        assert_eq!(root.name, "rpc-reply");
        assert!(root.attributes.is_empty());
        assert!(root.child("ok").is_some());
    }

    #[test]
    fn unbalanced_document_is_rejected() {
        assert!(matches!(
            Element::parse("<a><b></b>"),
            Err(DeviceError::Xml(_))
        ));
        assert!(Element::parse("").is_err());
    }

    #[test]
    fn depth_limit_rejects_deep_documents() {
        let deep = format!("{}{}", "<a>".repeat(10), "</a>".repeat(10));
        assert!(Element::parse_with_depth(&deep, Some(5)).is_err());
        assert!(Element::parse_with_depth(&deep, Some(10)).is_ok());
    }

    #[test]
    fn dict_form_keeps_attributes() {
        let el = Element::new("get-interface-information")
            .with_attr("format", "text")
            .with_child(Element::new("terse"))
            .with_child(Element::new("interface-name").with_text("lo0"));
        assert_eq!(
            el.to_dict(),
            json!({"get-interface-information": {
                "@format": "text",
                "terse": null,
                "interface-name": "lo0"
            }})
        );
    }
}
