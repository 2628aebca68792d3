//! XML-RPC codec for the XAPI control plane.
//!
//! Calls are rendered with plain string building, responses are parsed into a
//! small element tree with quick-xml and then interpreted as [`Value`]s.

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;

use crate::error::{Result, XapiError};

/// An XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Bool(bool),
    Double(f64),
    DateTime(String),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::DateTime(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Result<String> {
        match self {
            Value::String(s) | Value::DateTime(s) => Ok(s),
            other => Err(XapiError::Malformed(format!(
                "expected string, got {other:?}"
            ))),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(XapiError::Malformed(format!(
                "expected boolean, got {other:?}"
            ))),
        }
    }

    pub fn into_array(self) -> Result<Vec<Value>> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(XapiError::Malformed(format!(
                "expected array, got {other:?}"
            ))),
        }
    }

    pub fn into_strings(self) -> Result<Vec<String>> {
        self.into_array()?
            .into_iter()
            .map(Value::into_string)
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Struct(members) => members.get(key),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

/// Render a `methodCall` document.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<methodCall>");
    xml.push_str(&format!("<methodName>{}</methodName><params>", escape(method)));
    for param in params {
        xml.push_str("<param>");
        encode_value(param, &mut xml);
        xml.push_str("</param>");
    }
    xml.push_str("</params></methodCall>\n");
    xml
}

fn encode_value(value: &Value, xml: &mut String) {
    xml.push_str("<value>");
    match value {
        Value::String(s) => xml.push_str(&format!("<string>{}</string>", escape(s.as_str()))),
        // XML-RPC ints are 32-bit; XAPI carries wider ints as strings.
        Value::Int(i) => match i32::try_from(*i) {
            Ok(i) => xml.push_str(&format!("<int>{i}</int>")),
            Err(_) => xml.push_str(&format!("<string>{i}</string>")),
        },
        Value::Bool(b) => xml.push_str(&format!("<boolean>{}</boolean>", u8::from(*b))),
        Value::Double(d) => xml.push_str(&format!("<double>{d}</double>")),
        Value::DateTime(s) => xml.push_str(&format!(
            "<dateTime.iso8601>{}</dateTime.iso8601>",
            escape(s.as_str())
        )),
        Value::Array(items) => {
            xml.push_str("<array><data>");
            for item in items {
                encode_value(item, xml);
            }
            xml.push_str("</data></array>");
        }
        Value::Struct(members) => {
            xml.push_str("<struct>");
            for (name, member) in members {
                xml.push_str(&format!("<member><name>{}</name>", escape(name.as_str())));
                encode_value(member, xml);
                xml.push_str("</member>");
            }
            xml.push_str("</struct>");
        }
    }
    xml.push_str("</value>");
}

/// Decode a `methodResponse` document into its single return value.
pub fn decode_response(xml: &str) -> Result<Value> {
    let root = parse_tree(xml)?;
    let response = root
        .child("methodResponse")
        .ok_or_else(|| malformed("missing methodResponse"))?;

    if let Some(fault) = response.child("fault") {
        let value = decode_value(
            fault
                .child("value")
                .ok_or_else(|| malformed("fault without value"))?,
        )?;
        let code = match value.get("faultCode") {
            Some(Value::Int(code)) => *code,
            _ => 0,
        };
        let message = value
            .get("faultString")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(XapiError::Fault { code, message });
    }

    let value = response
        .child("params")
        .and_then(|p| p.child("param"))
        .and_then(|p| p.child("value"))
        .ok_or_else(|| malformed("missing params/param/value"))?;
    decode_value(value)
}

/// Unwrap the XAPI `{Status, Value | ErrorDescription}` envelope.
pub fn unwrap_envelope(value: Value) -> Result<Value> {
    let Value::Struct(mut members) = value else {
        return Err(malformed("response is not a struct"));
    };

    match members.get("Status").and_then(Value::as_str) {
        Some("Success") => Ok(members
            .remove("Value")
            .unwrap_or_else(|| Value::String(String::new()))),
        Some("Failure") => {
            let description = members
                .remove("ErrorDescription")
                .ok_or_else(|| malformed("failure without ErrorDescription"))?
                .into_strings()?;
            Err(XapiError::from_error_description(description))
        }
        other => Err(malformed(&format!("unexpected Status {other:?}"))),
    }
}

/// Decode a full XAPI response document.
pub fn decode_api_response(xml: &str) -> Result<Value> {
    unwrap_envelope(decode_response(xml)?)
}

/// `task.get_result` hands back an XML fragment like `<value>OpaqueRef:..</value>`.
pub fn unwrap_task_result(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    match parse_tree(trimmed)
        .ok()
        .and_then(|root| root.child("value").map(|v| decode_value(v).ok()))
        .flatten()
    {
        Some(Value::String(s)) => s,
        _ => trimmed.to_string(),
    }
}

fn malformed(msg: &str) -> XapiError {
    XapiError::Malformed(msg.to_string())
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn parse_tree(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    let mut stack = vec![Element::default()];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(Element {
                name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                ..Default::default()
            }),
            Ok(Event::Empty(e)) => {
                let element = Element {
                    name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    ..Default::default()
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(element);
                }
            }
            Ok(Event::End(_)) => {
                let element = stack.pop().ok_or_else(|| malformed("unbalanced end tag"))?;
                stack
                    .last_mut()
                    .ok_or_else(|| malformed("unbalanced end tag"))?
                    .children
                    .push(element);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| XapiError::Malformed(e.to_string()))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(XapiError::Malformed(e.to_string())),
        }
    }

    if stack.len() != 1 {
        return Err(malformed("unexpected end of document"));
    }
    stack.pop().ok_or_else(|| malformed("empty document"))
}

fn decode_value(element: &Element) -> Result<Value> {
    let Some(inner) = element.children.first() else {
        // <value>text</value> is a string
        return Ok(Value::String(element.text.clone()));
    };

    match inner.name.as_str() {
        "string" => Ok(Value::String(inner.text.clone())),
        "int" | "i4" | "i8" => inner
            .text
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|e| XapiError::Malformed(format!("bad int {:?}: {e}", inner.text))),
        "boolean" => match inner.text.trim() {
            "1" => Ok(Value::Bool(true)),
            "0" => Ok(Value::Bool(false)),
            other => Err(XapiError::Malformed(format!("bad boolean {other:?}"))),
        },
        "double" => inner
            .text
            .trim()
            .parse()
            .map(Value::Double)
            .map_err(|e| XapiError::Malformed(format!("bad double {:?}: {e}", inner.text))),
        "dateTime.iso8601" => Ok(Value::DateTime(inner.text.trim().to_string())),
        "array" => {
            let data = inner
                .child("data")
                .ok_or_else(|| malformed("array without data"))?;
            data.children_named("value")
                .map(decode_value)
                .collect::<Result<Vec<_>>>()
                .map(Value::Array)
        }
        "struct" => {
            let mut members = BTreeMap::new();
            for member in inner.children_named("member") {
                let name = member
                    .child("name")
                    .ok_or_else(|| malformed("member without name"))?
                    .text
                    .clone();
                let value = member
                    .child("value")
                    .ok_or_else(|| malformed("member without value"))?;
                members.insert(name, decode_value(value)?);
            }
            Ok(Value::Struct(members))
        }
        other => Err(XapiError::Malformed(format!("unsupported type <{other}>"))),
    }
}

/// Build a success envelope.
#[cfg(any(test, feature = "test-util"))]
pub fn success_response(value: &Value) -> String {
    let mut members = BTreeMap::new();
    members.insert("Status".to_string(), Value::from("Success"));
    members.insert("Value".to_string(), value.clone());
    response_document(&Value::Struct(members))
}

/// Build a failure envelope.
#[cfg(any(test, feature = "test-util"))]
pub fn failure_response(description: &[&str]) -> String {
    let mut members = BTreeMap::new();
    members.insert("Status".to_string(), Value::from("Failure"));
    members.insert(
        "ErrorDescription".to_string(),
        Value::Array(description.iter().map(|s| Value::from(*s)).collect()),
    );
    response_document(&Value::Struct(members))
}

#[cfg(any(test, feature = "test-util"))]
fn response_document(value: &Value) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<methodResponse><params><param>");
    encode_value(value, &mut xml);
    xml.push_str("</param></params></methodResponse>\n");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_login_call() {
        let xml = encode_call(
            "session.login_with_password",
            &[Value::from("root"), Value::from("p<w&"), Value::from("1.0")],
        );
        assert!(xml.contains("<methodName>session.login_with_password</methodName>"));
        assert!(xml.contains("<string>p&lt;w&amp;</string>"));
        assert_eq!(xml.matches("<param>").count(), 3);
    }

    #[test]
    fn wide_ints_are_sent_as_strings() {
        let xml = encode_call(
            "VM.set_memory",
            &[Value::Int(42), Value::Int(-7), Value::Int(8 * 1024 * 1024 * 1024)],
        );
        assert!(xml.contains("<int>42</int>"));
        assert!(xml.contains("<int>-7</int>"));
        assert!(xml.contains("<string>8589934592</string>"));
        assert!(!xml.contains("<i4>"));
    }

    #[test]
    fn decodes_success_envelope() {
        let xml = r#"<?xml version="1.0"?>
<methodResponse>
  <params>
    <param>
      <value><struct>
        <member><name>Status</name><value>Success</value></member>
        <member><name>Value</name><value>OpaqueRef:abc</value></member>
      </struct></value>
    </param>
  </params>
</methodResponse>"#;
        let value = decode_api_response(xml).unwrap();
        assert_eq!(value, Value::from("OpaqueRef:abc"));
    }

    #[test]
    fn decodes_failure_envelope() {
        let xml = failure_response(&["HOST_IS_SLAVE", "192.168.1.10"]);
        match decode_api_response(&xml) {
            Err(XapiError::HostIsSlave { master }) => assert_eq!(master, "192.168.1.10"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_nested_types() {
        let xml = r#"<methodResponse><params><param><value><array><data>
            <value><boolean>1</boolean></value>
            <value><i4>-7</i4></value>
            <value><double>1.5</double></value>
            <value><string>a &amp; b</string></value>
            <value><struct><member><name>k</name><value><int>3</int></value></member></struct></value>
        </data></array></value></param></params></methodResponse>"#;
        let items = decode_response(xml).unwrap().into_array().unwrap();
        assert_eq!(items[0], Value::Bool(true));
        assert_eq!(items[1], Value::Int(-7));
        assert_eq!(items[2], Value::Double(1.5));
        assert_eq!(items[3], Value::from("a & b"));
        assert_eq!(items[4].get("k"), Some(&Value::Int(3)));
    }

    #[test]
    fn fault_becomes_error() {
        let xml = r#"<methodResponse><fault><value><struct>
            <member><name>faultCode</name><value><int>4</int></value></member>
            <member><name>faultString</name><value><string>Too many parameters</string></value></member>
        </struct></value></fault></methodResponse>"#;
        match decode_response(xml) {
            Err(XapiError::Fault { code, message }) => {
                assert_eq!(code, 4);
                assert_eq!(message, "Too many parameters");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_response("<html><body>502 Bad Gateway"),
            Err(XapiError::Malformed(_))
        ));
        assert!(matches!(
            decode_response("<methodResponse></methodResponse>"),
            Err(XapiError::Malformed(_))
        ));
    }

    #[test]
    fn encode_then_decode_struct() {
        let mut members = BTreeMap::new();
        members.insert("live".to_string(), Value::from("true"));
        let xml = success_response(&Value::Struct(members.clone()));
        assert_eq!(decode_api_response(&xml).unwrap(), Value::Struct(members));
    }

    #[test]
    fn unwraps_task_result_fragment() {
        assert_eq!(unwrap_task_result("<value>OpaqueRef:vm</value>"), "OpaqueRef:vm");
        assert_eq!(unwrap_task_result(""), "");
        assert_eq!(unwrap_task_result("plain"), "plain");
    }
}
