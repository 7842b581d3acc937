use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Header name to value(s), ordered by name so serialized stubs diff cleanly.
pub type Headers = BTreeMap<String, HeaderField>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderField {
    One(String),
    Many(Vec<String>),
    /// Non-string values written by other tooling (numbers, booleans); kept verbatim.
    Raw(Value),
}

impl HeaderField {
    pub fn first_str(&self) -> Option<&str> {
        match self {
            Self::One(value) => Some(value),
            Self::Many(values) => values.first().map(String::as_str),
            Self::Raw(value) => value.as_str(),
        }
    }
}

/// One recorded request/response pair as persisted in a stub file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StubRecord {
    pub request: StubRequest,
    pub response: StubResponse,
    /// Top-level fields added by hand or by other tools. Merges leave them alone.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StubRequest {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub body: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StubResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub body: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// A `null` body on disk is a value, not an absent field; keep it through a rewrite.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Identity of a stub within a collection: the url plus the uppercased method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StubKey {
    pub url: String,
    pub method: String,
}

impl StubKey {
    pub fn new(url: impl Into<String>, method: &str) -> Self {
        Self {
            url: url.into(),
            method: method.to_ascii_uppercase(),
        }
    }

    /// `url + METHOD`, compared byte-wise when ordering a collection.
    pub fn sort_key(&self) -> String {
        let mut key = String::with_capacity(self.url.len() + self.method.len());
        key.push_str(&self.url);
        key.push_str(&self.method);
        key
    }
}

impl std::fmt::Display for StubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

impl StubRecord {
    pub fn key(&self) -> StubKey {
        StubKey::new(self.request.url.clone(), &self.request.method)
    }

    pub fn matches(&self, key: &StubKey) -> bool {
        self.request.url == key.url && self.request.method.eq_ignore_ascii_case(&key.method)
    }

    pub fn sort_key(&self) -> String {
        self.key().sort_key()
    }
}

/// A request or response payload as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    /// Data the transport already decoded into a structured value.
    Json(Value),
}

impl Payload {
    /// Raw bytes become text when they are valid UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::Text(text.to_owned()),
            Err(_) => Self::Bytes(bytes.to_vec()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            Self::Empty | Self::Json(_) => None,
        }
    }

    /// Wire bytes of the payload, as sent to the real upstream.
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            Self::Empty => Vec::new(),
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Bytes(bytes) => bytes.clone(),
            Self::Json(value) => value.to_string().into_bytes(),
        }
    }

    /// The form written into a stub file; `Empty` is omitted entirely.
    pub fn into_stored(self) -> Option<Value> {
        match self {
            Self::Empty => None,
            Self::Text(text) => Some(Value::String(text)),
            Self::Bytes(bytes) => Some(Value::Array(
                bytes.into_iter().map(Value::from).collect(),
            )),
            Self::Json(value) => Some(value),
        }
    }
}

pub fn headers_from_http(headers: &hyper::HeaderMap) -> Headers {
    let mut out = Headers::new();
    for name in headers.keys() {
        let mut values: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect();
        let field = if values.len() == 1 {
            HeaderField::One(values.remove(0))
        } else {
            HeaderField::Many(values)
        };
        out.insert(name.as_str().to_owned(), field);
    }
    out
}

#[cfg(test)]
mod tests {
    use hyper::header::{HeaderMap, HeaderValue};
    use serde_json::json;

    use super::{HeaderField, Payload, StubKey, StubRecord, headers_from_http};

    #[test]
    fn key_uppercases_method_and_sort_key_concatenates() {
        let key = StubKey::new("/a", "post");
        assert_eq!(key.method, "POST");
        assert_eq!(key.sort_key(), "/aPOST");
        assert_eq!(key.to_string(), "POST /a");
    }

    #[test]
    fn matches_compares_method_case_insensitively() {
        let stub: StubRecord = serde_json::from_value(json!({
            "request": {"method": "get", "url": "/a"},
            "response": {"status": 200}
        }))
        .unwrap();
        assert!(stub.matches(&StubKey::new("/a", "GET")));
        assert!(!stub.matches(&StubKey::new("/a", "POST")));
        assert!(!stub.matches(&StubKey::new("/b", "GET")));
    }

    #[test]
    fn absent_fields_are_omitted_and_null_body_survives() {
        let stub: StubRecord = serde_json::from_value(json!({
            "request": {"method": "GET", "url": "/a"},
            "response": {"status": 204, "body": null},
            "description": "hand written"
        }))
        .unwrap();
        assert_eq!(stub.request.body, None);
        assert_eq!(stub.response.body, Some(serde_json::Value::Null));

        let value = serde_json::to_value(&stub).unwrap();
        assert_eq!(
            value,
            json!({
                "request": {"method": "GET", "url": "/a"},
                "response": {"status": 204, "body": null},
                "description": "hand written"
            })
        );
    }

    #[test]
    fn header_fields_accept_strings_lists_and_numbers() {
        let stub: StubRecord = serde_json::from_value(json!({
            "request": {"method": "GET", "url": "/a"},
            "response": {
                "status": 200,
                "headers": {
                    "content-length": 12,
                    "content-type": "text/plain",
                    "set-cookie": ["a=1", "b=2"]
                }
            }
        }))
        .unwrap();
        let headers = stub.response.headers.unwrap();
        assert_eq!(headers["content-length"], HeaderField::Raw(json!(12)));
        assert_eq!(headers["content-type"].first_str(), Some("text/plain"));
        assert_eq!(
            headers["set-cookie"],
            HeaderField::Many(vec!["a=1".to_owned(), "b=2".to_owned()])
        );
    }

    #[test]
    fn payload_storage_forms() {
        assert_eq!(Payload::Empty.into_stored(), None);
        assert_eq!(
            Payload::from_bytes(b"plain").into_stored(),
            Some(json!("plain"))
        );
        assert_eq!(
            Payload::from_bytes(&[0xff, 0x00]).into_stored(),
            Some(json!([255, 0]))
        );
        assert_eq!(
            Payload::Json(json!({"x": 1})).into_stored(),
            Some(json!({"x": 1}))
        );
    }

    #[test]
    fn repeated_http_headers_become_lists() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let converted = headers_from_http(&headers);
        assert_eq!(
            converted["set-cookie"],
            HeaderField::Many(vec!["a=1".to_owned(), "b=2".to_owned()])
        );
        assert_eq!(
            converted["content-type"],
            HeaderField::One("application/json".to_owned())
        );
    }
}
