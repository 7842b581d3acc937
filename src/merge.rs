use hyper::{HeaderMap, Method, header};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    recorder::{InterceptedRequest, ObservedResponse},
    stub::{Headers, Payload, StubKey, StubRecord, StubRequest, StubResponse, headers_from_http},
};

const JSON_CONTENT_TYPE: &str = "application/json";

/// What to do when a loaded collection already holds more than one stub for a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateKeyPolicy {
    /// Update the first stub for the key and leave later duplicates untouched.
    #[default]
    Shadow,
    /// Refuse to merge into a collection with duplicate keys.
    Reject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    pub include_headers: bool,
    pub duplicate_keys: DuplicateKeyPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
}

impl MergeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
        }
    }
}

#[derive(Debug)]
pub enum MergeError {
    InvalidRequestBody {
        key: StubKey,
        source: serde_json::Error,
    },
    DuplicateKey {
        key: StubKey,
        count: usize,
    },
}

impl MergeError {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequestBody { .. } => "invalid_request_body",
            Self::DuplicateKey { .. } => "duplicate_key",
        }
    }
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequestBody { key, .. } => {
                write!(f, "parse JSON request body of `{key}`")
            }
            Self::DuplicateKey { key, count } => {
                write!(f, "stub file holds {count} stubs for `{key}`")
            }
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidRequestBody { source, .. } => Some(source),
            Self::DuplicateKey { .. } => None,
        }
    }
}

/// Finds the stub for the observed request's key (or appends a new one) and replaces its
/// `request` and `response` with the observed values.
pub fn merge_observation(
    stubs: &mut Vec<StubRecord>,
    request: &InterceptedRequest,
    response: &ObservedResponse,
    options: &CaptureOptions,
) -> Result<MergeOutcome, MergeError> {
    let key = StubKey::new(request.url.clone(), request.method.as_str());
    let request_body = extract_request_body(&key, request)?;

    let matching = stubs.iter().filter(|stub| stub.matches(&key)).count();
    if matching > 1 {
        match options.duplicate_keys {
            DuplicateKeyPolicy::Reject => {
                return Err(MergeError::DuplicateKey {
                    key,
                    count: matching,
                });
            }
            DuplicateKeyPolicy::Shadow => {
                tracing::warn!(
                    key = %key,
                    count = matching,
                    "stub file holds duplicate stubs; updating the first and leaving the rest"
                );
            }
        }
    }

    let captured_request = StubRequest {
        method: key.method.clone(),
        url: key.url.clone(),
        headers: captured_headers(&request.headers, options),
        body: request_body,
        extra: Map::new(),
    };
    let captured_response = StubResponse {
        status: response.status.as_u16(),
        headers: captured_headers(&response.headers, options),
        body: response.body.clone().into_stored(),
        extra: Map::new(),
    };

    match stubs.iter_mut().find(|stub| stub.matches(&key)) {
        Some(existing) => {
            existing.request = captured_request;
            existing.response = captured_response;
            Ok(MergeOutcome::Updated)
        }
        None => {
            stubs.push(StubRecord {
                request: captured_request,
                response: captured_response,
                extra: Map::new(),
            });
            Ok(MergeOutcome::Inserted)
        }
    }
}

fn captured_headers(headers: &HeaderMap, options: &CaptureOptions) -> Option<Headers> {
    options.include_headers.then(|| headers_from_http(headers))
}

/// JSON bodies of POST and PUT requests are stored parsed; everything else is stored raw.
fn extract_request_body(
    key: &StubKey,
    request: &InterceptedRequest,
) -> Result<Option<Value>, MergeError> {
    if !(is_body_method(&request.method) && declares_json(&request.headers)) {
        return Ok(request.body.clone().into_stored());
    }

    let parsed = match &request.body {
        Payload::Empty => return Ok(None),
        Payload::Json(value) => return Ok(Some(value.clone())),
        Payload::Text(text) if text.is_empty() => return Ok(None),
        Payload::Text(text) => serde_json::from_str(text),
        Payload::Bytes(bytes) => serde_json::from_slice(bytes),
    };
    parsed
        .map(Some)
        .map_err(|source| MergeError::InvalidRequestBody {
            key: key.clone(),
            source,
        })
}

fn is_body_method(method: &Method) -> bool {
    let method = method.as_str();
    method.eq_ignore_ascii_case("POST") || method.eq_ignore_ascii_case("PUT")
}

fn declares_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|content_type| content_type.contains(JSON_CONTENT_TYPE))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use hyper::{
        HeaderMap, Method, StatusCode,
        header::{self, HeaderValue},
    };
    use serde_json::{Value, json};

    use super::{CaptureOptions, DuplicateKeyPolicy, MergeError, MergeOutcome, merge_observation};
    use crate::{
        recorder::{InterceptedRequest, ObservedResponse},
        stub::{HeaderField, Payload, StubRecord},
    };

    fn request(method: Method, url: &str, body: Payload) -> InterceptedRequest {
        InterceptedRequest {
            method,
            url: url.to_owned(),
            headers: HeaderMap::new(),
            body,
        }
    }

    fn json_request(method: Method, url: &str, body: &str) -> InterceptedRequest {
        let mut request = request(method, url, Payload::Text(body.to_owned()));
        request.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        request
    }

    fn response(status: StatusCode, body: Value) -> ObservedResponse {
        let mut headers = HeaderMap::new();
        headers.insert("x-upstream", HeaderValue::from_static("yes"));
        ObservedResponse {
            status,
            headers,
            body: Payload::Json(body),
            raw_body: Bytes::new(),
        }
    }

    fn stub(value: Value) -> StubRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn new_key_is_appended_without_headers_by_default() {
        let mut stubs = Vec::new();
        let outcome = merge_observation(
            &mut stubs,
            &request(Method::GET, "/a", Payload::Empty),
            &response(StatusCode::OK, json!({"x": 1})),
            &CaptureOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome, MergeOutcome::Inserted);
        assert_eq!(
            serde_json::to_value(&stubs).unwrap(),
            json!([{
                "request": {"method": "GET", "url": "/a"},
                "response": {"status": 200, "body": {"x": 1}}
            }])
        );
    }

    #[test]
    fn existing_key_is_overwritten_not_accumulated() {
        let mut stubs = vec![stub(json!({
            "request": {"method": "post", "url": "/a", "body": {"old": true}, "note": "stale"},
            "response": {"status": 500, "body": "old", "headers": {"x-old": "1"}},
            "description": "kept"
        }))];

        let outcome = merge_observation(
            &mut stubs,
            &json_request(Method::POST, "/a", r#"{"y":2}"#),
            &response(StatusCode::CREATED, json!({"ok": true})),
            &CaptureOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome, MergeOutcome::Updated);
        assert_eq!(
            serde_json::to_value(&stubs).unwrap(),
            json!([{
                "request": {"method": "POST", "url": "/a", "body": {"y": 2}},
                "response": {"status": 201, "body": {"ok": true}},
                "description": "kept"
            }])
        );
    }

    #[test]
    fn headers_are_captured_only_when_enabled() {
        let mut stubs = Vec::new();
        let mut observed = request(Method::GET, "/a", Payload::Empty);
        observed
            .headers
            .insert(header::ACCEPT, HeaderValue::from_static("text/plain"));

        let with_headers = CaptureOptions {
            include_headers: true,
            ..CaptureOptions::default()
        };
        merge_observation(
            &mut stubs,
            &observed,
            &response(StatusCode::OK, json!(1)),
            &with_headers,
        )
        .unwrap();
        let request_headers = stubs[0].request.headers.as_ref().unwrap();
        assert_eq!(
            request_headers["accept"],
            HeaderField::One("text/plain".to_owned())
        );
        assert!(stubs[0].response.headers.is_some());

        merge_observation(
            &mut stubs,
            &observed,
            &response(StatusCode::OK, json!(1)),
            &CaptureOptions::default(),
        )
        .unwrap();
        assert_eq!(stubs.len(), 1);
        assert!(stubs[0].request.headers.is_none());
        assert!(stubs[0].response.headers.is_none());
    }

    #[test]
    fn non_json_post_body_is_stored_verbatim() {
        let mut stubs = Vec::new();
        merge_observation(
            &mut stubs,
            &request(Method::POST, "/form", Payload::Text("a=1&b={".to_owned())),
            &response(StatusCode::OK, json!(null)),
            &CaptureOptions::default(),
        )
        .unwrap();
        assert_eq!(stubs[0].request.body, Some(json!("a=1&b={")));
    }

    #[test]
    fn json_body_of_get_is_not_parsed() {
        let mut stubs = Vec::new();
        merge_observation(
            &mut stubs,
            &json_request(Method::GET, "/a", r#"{"y":2}"#),
            &response(StatusCode::OK, json!(null)),
            &CaptureOptions::default(),
        )
        .unwrap();
        assert_eq!(stubs[0].request.body, Some(json!(r#"{"y":2}"#)));
    }

    #[test]
    fn lowercase_put_with_json_body_is_parsed() {
        let mut stubs = Vec::new();
        let method = Method::from_bytes(b"put").unwrap();
        merge_observation(
            &mut stubs,
            &json_request(method, "/a", "[1,2]"),
            &response(StatusCode::OK, json!(null)),
            &CaptureOptions::default(),
        )
        .unwrap();
        assert_eq!(stubs[0].request.method, "PUT");
        assert_eq!(stubs[0].request.body, Some(json!([1, 2])));
    }

    #[test]
    fn invalid_json_body_is_rejected_without_mutation() {
        let mut stubs = Vec::new();
        let err = merge_observation(
            &mut stubs,
            &json_request(Method::POST, "/a", "{not json"),
            &response(StatusCode::OK, json!(null)),
            &CaptureOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::InvalidRequestBody { .. }), "{err}");
        assert!(stubs.is_empty());
    }

    fn duplicates() -> Vec<StubRecord> {
        vec![
            stub(json!({"request": {"method": "GET", "url": "/a"}, "response": {"status": 1}})),
            stub(json!({"request": {"method": "get", "url": "/a"}, "response": {"status": 2}})),
        ]
    }

    #[test]
    fn duplicate_keys_shadow_updates_first_only() {
        let mut stubs = duplicates();
        merge_observation(
            &mut stubs,
            &request(Method::GET, "/a", Payload::Empty),
            &response(StatusCode::OK, json!(null)),
            &CaptureOptions::default(),
        )
        .unwrap();
        assert_eq!(stubs[0].response.status, 200);
        assert_eq!(stubs[1].response.status, 2);
    }

    #[test]
    fn duplicate_keys_reject_fails_fast() {
        let mut stubs = duplicates();
        let options = CaptureOptions {
            duplicate_keys: DuplicateKeyPolicy::Reject,
            ..CaptureOptions::default()
        };
        let err = merge_observation(
            &mut stubs,
            &request(Method::GET, "/a", Payload::Empty),
            &response(StatusCode::OK, json!(null)),
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::DuplicateKey { count: 2, .. }), "{err}");
        assert_eq!(stubs, duplicates());
    }
}
