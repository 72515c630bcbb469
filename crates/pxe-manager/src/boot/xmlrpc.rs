//! Minimal XML-RPC codec for the boot controller.
//!
//! Covers the value kinds Cobbler actually sends and receives: scalars,
//! arrays and structs. Calls are written as plain strings; responses are read
//! into a small element tree with `quick-xml` and then interpreted.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::BootError;

/// An XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `<int>` / `<i4>` / `<i8>`.
    Int(i64),
    /// `<boolean>`.
    Bool(bool),
    /// `<string>` or untyped text.
    String(String),
    /// `<double>`.
    Double(f64),
    /// `<array>`.
    Array(Vec<Value>),
    /// `<struct>`.
    Struct(BTreeMap<String, Value>),
    /// `<nil/>`.
    Nil,
}

impl Value {
    /// String content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Member of a struct.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Struct(members) => members.get(name),
            _ => None,
        }
    }

    /// Whether the value reads as success: `true`, non-zero, or any string.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::String(_) | Self::Array(_) | Self::Struct(_) | Self::Double(_) => true,
            Self::Nil => false,
        }
    }

    fn write(&self, out: &mut String) {
        out.push_str("<value>");
        match self {
            Self::Int(i) => {
                let _ = write!(out, "<int>{i}</int>");
            }
            Self::Bool(b) => {
                let _ = write!(out, "<boolean>{}</boolean>", u8::from(*b));
            }
            Self::String(s) => {
                let _ = write!(out, "<string>{}</string>", escape(s));
            }
            Self::Double(d) => {
                let _ = write!(out, "<double>{d}</double>");
            }
            Self::Array(items) => {
                out.push_str("<array><data>");
                for item in items {
                    item.write(out);
                }
                out.push_str("</data></array>");
            }
            Self::Struct(members) => {
                out.push_str("<struct>");
                for (name, value) in members {
                    let _ = write!(out, "<member><name>{}</name>", escape(name));
                    value.write(out);
                    out.push_str("</member>");
                }
                out.push_str("</struct>");
            }
            Self::Nil => out.push_str("<nil/>"),
        }
        out.push_str("</value>");
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Encode a `methodCall` document.
#[must_use]
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall>");
    let _ = write!(out, "<methodName>{}</methodName><params>", escape(method));
    for param in params {
        out.push_str("<param>");
        param.write(&mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Element tree built from the response document.
#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn named(name: &[u8]) -> Self {
        Self {
            name: String::from_utf8_lossy(name).into_owned(),
            ..Self::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn require(&self, name: &str) -> Result<&Node, BootError> {
        self.child(name).ok_or_else(|| {
            BootError::Protocol(format!("<{}> is missing <{name}>", self.name))
        })
    }
}

fn parse_tree(xml: &str) -> Result<Node, BootError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack = vec![Node::default()];
    loop {
        let event = reader
            .read_event()
            .map_err(|e| BootError::Protocol(format!("Malformed XML: {e}")))?;
        match event {
            Event::Start(start) => stack.push(Node::named(start.name().as_ref())),
            Event::Empty(empty) => {
                let node = Node::named(empty.name().as_ref());
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| BootError::Protocol(format!("Bad text: {e}")))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| BootError::Protocol("Unbalanced XML".into()))?;
                let parent = stack
                    .last_mut()
                    .ok_or_else(|| BootError::Protocol("Unbalanced XML".into()))?;
                parent.children.push(node);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    match stack.pop() {
        Some(root) if stack.is_empty() => Ok(root),
        _ => Err(BootError::Protocol("Truncated XML document".into())),
    }
}

fn parse_value(node: &Node) -> Result<Value, BootError> {
    let Some(typed) = node.children.first() else {
        // Untyped content is a string.
        return Ok(Value::String(node.text.clone()));
    };

    let bad = |kind: &str| BootError::Protocol(format!("Invalid <{kind}>: '{}'", typed.text));
    match typed.name.as_str() {
        "int" | "i4" | "i8" => typed.text.trim().parse().map(Value::Int).map_err(|_| bad("int")),
        "boolean" => match typed.text.trim() {
            "1" => Ok(Value::Bool(true)),
            "0" => Ok(Value::Bool(false)),
            _ => Err(bad("boolean")),
        },
        "string" => Ok(Value::String(typed.text.clone())),
        "double" => typed
            .text
            .trim()
            .parse()
            .map(Value::Double)
            .map_err(|_| bad("double")),
        "nil" => Ok(Value::Nil),
        "array" => typed
            .require("data")?
            .children
            .iter()
            .filter(|c| c.name == "value")
            .map(parse_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        "struct" => typed
            .children
            .iter()
            .filter(|c| c.name == "member")
            .map(|member| {
                let name = member.require("name")?.text.clone();
                let value = parse_value(member.require("value")?)?;
                Ok::<_, BootError>((name, value))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Value::Struct),
        other => Err(BootError::Protocol(format!("Unsupported value type <{other}>"))),
    }
}

/// Decode a `methodResponse` into its single return value.
///
/// # Errors
/// Returns [`BootError::Fault`] for a fault response and
/// [`BootError::Protocol`] when the document is not a valid response.
pub fn decode_response(xml: &str) -> Result<Value, BootError> {
    let root = parse_tree(xml)?;
    let response = root.require("methodResponse")?;

    if let Some(fault) = response.child("fault") {
        let fault = parse_value(fault.require("value")?)?;
        let code = match fault.get("faultCode") {
            Some(Value::Int(code)) => *code,
            _ => 0,
        };
        let message = fault
            .get("faultString")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(BootError::Fault { code, message });
    }

    let value = response
        .require("params")?
        .require("param")?
        .require("value")?;
    parse_value(value)
}
