use std::collections::HashSet;

use serde_json::Value;

use crate::{
    canonical::StubTransform,
    stub::{HeaderField, Headers, StubRecord},
};

pub const DEFAULT_REDACTION_PLACEHOLDER: &str = "[REDACTED]";

/// Replaces configured header values and JSON body fields with a placeholder.
///
/// Names are matched case-insensitively. Body keys are matched at any depth of request and
/// response bodies.
#[derive(Debug, Clone)]
pub struct RedactTransform {
    headers_lc: HashSet<String>,
    body_keys_lc: HashSet<String>,
    placeholder: String,
}

impl RedactTransform {
    pub fn new<H, K>(headers: H, body_keys: K, placeholder: impl Into<String>) -> Self
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        K: IntoIterator,
        K::Item: AsRef<str>,
    {
        Self {
            headers_lc: headers
                .into_iter()
                .map(|name| name.as_ref().to_ascii_lowercase())
                .collect(),
            body_keys_lc: body_keys
                .into_iter()
                .map(|name| name.as_ref().to_ascii_lowercase())
                .collect(),
            placeholder: placeholder.into(),
        }
    }

    fn scrub_headers(&self, headers: &mut Option<Headers>) {
        let Some(headers) = headers.as_mut() else {
            return;
        };
        for (name, value) in headers.iter_mut() {
            if self.headers_lc.contains(&name.to_ascii_lowercase()) {
                *value = HeaderField::One(self.placeholder.clone());
            }
        }
    }

    fn scrub_body(&self, body: &mut Option<Value>) {
        if self.body_keys_lc.is_empty() {
            return;
        }
        if let Some(body) = body.as_mut() {
            self.scrub_json_value(body);
        }
    }

    fn scrub_json_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, nested) in map.iter_mut() {
                    if self.body_keys_lc.contains(&key.to_ascii_lowercase()) {
                        *nested = Value::String(self.placeholder.clone());
                        continue;
                    }
                    self.scrub_json_value(nested);
                }
            }
            Value::Array(values) => {
                for nested in values {
                    self.scrub_json_value(nested);
                }
            }
            _ => {}
        }
    }
}

impl StubTransform for RedactTransform {
    fn transform(&self, mut stub: StubRecord) -> StubRecord {
        self.scrub_headers(&mut stub.request.headers);
        self.scrub_headers(&mut stub.response.headers);
        self.scrub_body(&mut stub.request.body);
        self.scrub_body(&mut stub.response.body);
        stub
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{DEFAULT_REDACTION_PLACEHOLDER, RedactTransform};
    use crate::{canonical::StubTransform, stub::StubRecord};

    fn secret_stub() -> StubRecord {
        serde_json::from_value(json!({
            "request": {
                "method": "POST",
                "url": "/login",
                "headers": {"Authorization": "Bearer abc", "accept": "*/*"},
                "body": {"user": "ann", "Password": "hunter2"}
            },
            "response": {
                "status": 200,
                "headers": {"set-cookie": ["sid=1", "sid=2"]},
                "body": {"items": [{"token": "t1"}, {"token": "t2"}]}
            }
        }))
        .unwrap()
    }

    fn transform() -> RedactTransform {
        RedactTransform::new(
            ["authorization", "Set-Cookie"],
            ["password", "token"],
            DEFAULT_REDACTION_PLACEHOLDER,
        )
    }

    #[test]
    fn scrubs_headers_and_nested_body_keys() {
        let redacted = transform().transform(secret_stub());
        assert_eq!(
            serde_json::to_value(&redacted).unwrap(),
            json!({
                "request": {
                    "method": "POST",
                    "url": "/login",
                    "headers": {"Authorization": "[REDACTED]", "accept": "*/*"},
                    "body": {"user": "ann", "Password": "[REDACTED]"}
                },
                "response": {
                    "status": 200,
                    "headers": {"set-cookie": "[REDACTED]"},
                    "body": {"items": [{"token": "[REDACTED]"}, {"token": "[REDACTED]"}]}
                }
            })
        );
    }

    #[test]
    fn redaction_is_idempotent() {
        let once = transform().transform(secret_stub());
        let twice = transform().transform(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn identity_fields_are_untouched() {
        let redacted = RedactTransform::new(["url"], ["method", "url"], "x").transform(secret_stub());
        assert_eq!(redacted.request.url, "/login");
        assert_eq!(redacted.request.method, "POST");
    }
}
