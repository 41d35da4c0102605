use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::ExceptionRecord;
use crate::frames::Frame;
use crate::raised::RaisedError;
use crate::scrubber::scrub_headers;

pub const SDK_NAME: &str = "booboo-sdk";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const RUNTIME_NAME: &str = "Rust";

/// Version of the compiler this crate was built with.
pub fn runtime_version() -> &'static str {
    option_env!("BOOBOO_RUSTC_VERSION").unwrap_or("unknown")
}

/// Who was affected. Any key beyond the well-known ones is kept as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl User {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    /// Attach an arbitrary key. The well-known keys (`id`, `email`, `username`,
    /// `ip_address`) set their field instead, so they are never sent twice.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_extra(key.into(), value.into());
        self
    }

    fn set_extra(&mut self, key: String, value: Value) {
        let field = match key.as_str() {
            "id" => &mut self.id,
            "email" => &mut self.email,
            "username" => &mut self.username,
            "ip_address" => &mut self.ip_address,
            _ => {
                self.extra.insert(key, value);
                return;
            }
        };

        *field = match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        };
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.email.is_none()
            && self.username.is_none()
            && self.ip_address.is_none()
            && self.extra.is_empty()
    }

    /// Overlay the fields set in `other` on top of ours.
    pub fn merge(&mut self, other: User) {
        if other.id.is_some() {
            self.id = other.id;
        }
        if other.email.is_some() {
            self.email = other.email;
        }
        if other.username.is_some() {
            self.username = other.username;
        }
        if other.ip_address.is_some() {
            self.ip_address = other.ip_address;
        }
        for (key, value) in other.extra {
            self.set_extra(key, value);
        }
    }
}

/// The HTTP request being served when the error was raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query_string: String,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the headers, scrubbing sensitive values on the way in.
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.headers = scrub_headers(headers);
        self
    }

    pub fn with_query_string(mut self, query_string: impl Into<String>) -> Self {
        self.query_string = query_string.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sdk {
    pub name: String,
    pub version: String,
}

impl Default for Sdk {
    fn default() -> Self {
        Self {
            name: SDK_NAME.to_owned(),
            version: SDK_VERSION.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    pub name: String,
    pub version: String,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            name: RUNTIME_NAME.to_owned(),
            version: runtime_version().to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub sdk: Sdk,
    pub runtime: Runtime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Error,
}

/// One error report, as sent to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub message: String,
    pub exception_type: String,
    pub level: Level,
    pub stacktrace: Vec<Frame>,
    pub exceptions: Vec<ExceptionRecord>,
    pub context: Context,
    pub tags: HashMap<String, String>,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,
}

/// Assemble the report for `error` from its already extracted chain.
///
/// The user is the persistent one with the per-call fields laid over it, and is
/// left out when neither sets anything. Request headers are scrubbed again, so
/// a request built by hand can't leak credentials.
pub fn build_payload(
    error: &RaisedError,
    chain: Vec<ExceptionRecord>,
    request: Option<Request>,
    user: Option<User>,
    environment: &str,
    persistent_user: Option<&User>,
) -> EventPayload {
    let mut merged = persistent_user.cloned().unwrap_or_default();
    if let Some(user) = user {
        merged.merge(user);
    }
    let user = (!merged.is_empty()).then_some(merged);

    let request = request.map(|request| Request {
        headers: scrub_headers(request.headers),
        ..request
    });

    let stacktrace = chain
        .first()
        .map(|record| record.stacktrace.clone())
        .unwrap_or_default();

    EventPayload {
        message: error.to_string(),
        exception_type: error.type_name().to_owned(),
        level: Level::Error,
        stacktrace,
        exceptions: chain,
        context: Context {
            user,
            ..Default::default()
        },
        tags: HashMap::from([("runtime".to_owned(), "rust".to_owned())]),
        environment: environment.to_owned(),
        request,
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    use super::*;
    use crate::chain::extract_exception_chain;
    use crate::scrubber::FILTERED;
    use crate::snapshot::{FrameSnapshot, StackSnapshot};

    fn value_error() -> RaisedError {
        let stack = StackSnapshot::new()
            .with_frame(FrameSnapshot::new("src/main.rs", "main", 10))
            .with_frame(
                FrameSnapshot::new("src/orders.rs", "place_order", 42).with_local("quantity", 3),
            );
        RaisedError::new("ValueError", "test error").with_stack(stack)
    }

    fn payload_for(
        error: &RaisedError,
        request: Option<Request>,
        user: Option<User>,
        persistent_user: Option<&User>,
    ) -> EventPayload {
        let chain = extract_exception_chain(error);
        build_payload(error, chain, request, user, "", persistent_user)
    }

    #[test]
    fn test_end_to_end_value_error() {
        let error = value_error();

        let payload = payload_for(&error, None, None, None);
        let body = serde_json::to_value(&payload).unwrap();

        assert_json_include!(
            actual: body.clone(),
            expected: json!({
                "message": "test error",
                "exception_type": "ValueError",
                "level": "error",
                "tags": {"runtime": "rust"},
                "environment": "",
                "context": {
                    "sdk": {"name": "booboo-sdk", "version": SDK_VERSION},
                    "runtime": {"name": "Rust"},
                },
            })
        );
        assert_eq!(payload.stacktrace.len(), 2);
        assert_eq!(payload.exceptions.len(), 1);
        assert_eq!(payload.stacktrace, payload.exceptions[0].stacktrace);
        assert!(body.get("request").is_none());
        assert!(body["context"].get("user").is_none());
    }

    #[test]
    fn test_frames_are_serialized_in_full() {
        let error = value_error();

        let body = serde_json::to_value(payload_for(&error, None, None, None)).unwrap();

        assert_json_include!(
            actual: body["stacktrace"][1].clone(),
            expected: json!({
                "filename": "src/orders.rs",
                "function": "place_order",
                "lineno": 42,
                "context_line": "",
                "pre_context": [],
                "post_context": [],
                "vars": {"quantity": "3"},
                "in_app": true,
            })
        );
    }

    #[test]
    fn test_user_merge() {
        let error = value_error();
        let persistent = User::default().with_id("1").with_email("a@b.com");
        let per_call = User::default().with_ip_address("1.2.3.4");

        let payload = payload_for(&error, None, Some(per_call), Some(&persistent));
        let body = serde_json::to_value(&payload).unwrap();

        assert_eq!(
            body["context"]["user"],
            json!({"id": "1", "email": "a@b.com", "ip_address": "1.2.3.4"})
        );
    }

    #[test]
    fn test_per_call_user_wins() {
        let error = value_error();
        let persistent = User::default()
            .with_id("1")
            .with_username("alice")
            .with_extra("plan", "free");
        let per_call = User::default().with_id("2").with_extra("plan", "pro");

        let payload = payload_for(&error, None, Some(per_call), Some(&persistent));

        let user = payload.context.user.expect("user is set");
        assert_eq!(user.id.as_deref(), Some("2"));
        assert_eq!(user.username.as_deref(), Some("alice"));
        assert_eq!(user.extra["plan"], json!("pro"));
    }

    #[test]
    fn test_well_known_extra_keys_set_their_field() {
        let user = User::default()
            .with_id("1")
            .with_extra("id", 2)
            .with_extra("email", "a@b.com")
            .with_extra("plan", "pro");

        assert_eq!(user.id.as_deref(), Some("2"));
        assert_eq!(user.email.as_deref(), Some("a@b.com"));
        assert_eq!(
            serde_json::to_string(&user).unwrap(),
            r#"{"id":"2","email":"a@b.com","plan":"pro"}"#
        );
    }

    #[test]
    fn test_merge_routes_well_known_extra_keys() {
        let mut user = User::default().with_username("alice");
        let mut other = User::default();
        other.extra.insert("username".to_owned(), json!("bob"));

        user.merge(other);

        assert_eq!(user.username.as_deref(), Some("bob"));
        assert!(user.extra.is_empty());
    }

    #[test]
    fn test_only_persistent_user() {
        let error = value_error();
        let persistent = User::default().with_id("7");

        let payload = payload_for(&error, None, None, Some(&persistent));

        assert_eq!(payload.context.user, Some(persistent));
    }

    #[test]
    fn test_empty_users_are_omitted() {
        let error = value_error();

        let payload = payload_for(&error, None, Some(User::default()), Some(&User::default()));

        assert!(payload.context.user.is_none());
    }

    #[test]
    fn test_user_extra_keys_are_flattened() {
        let user = User::default().with_id("1").with_extra("org", json!({"id": 9}));

        assert_eq!(
            serde_json::to_value(&user).unwrap(),
            json!({"id": "1", "org": {"id": 9}})
        );
    }

    #[test]
    fn test_request_headers_are_scrubbed() {
        let error = value_error();
        let request = Request {
            method: "POST".to_owned(),
            url: "https://shop.example.com/checkout".to_owned(),
            headers: HashMap::from([
                ("Authorization".to_owned(), "Bearer abc".to_owned()),
                ("Accept".to_owned(), "text/html".to_owned()),
            ]),
            query_string: "step=2".to_owned(),
        };

        let payload = payload_for(&error, Some(request), None, None);
        let body = serde_json::to_value(&payload).unwrap();

        assert_eq!(
            body["request"],
            json!({
                "method": "POST",
                "url": "https://shop.example.com/checkout",
                "headers": {"Authorization": FILTERED, "Accept": "text/html"},
                "query_string": "step=2",
            })
        );
    }

    #[test]
    fn test_request_builder_scrubs() {
        let request = Request::new("GET", "/")
            .with_headers([("Cookie", "a=b"), ("Host", "example.com")])
            .with_query_string("q=1");

        assert_eq!(request.headers["Cookie"], FILTERED);
        assert_eq!(request.headers["Host"], "example.com");
        assert_eq!(request.query_string, "q=1");
    }

    #[test]
    fn test_environment_is_reported() {
        let error = value_error();
        let chain = extract_exception_chain(&error);

        let payload = build_payload(&error, chain, None, None, "production", None);

        assert_eq!(payload.environment, "production");
    }

    #[test]
    fn test_chained_payload() {
        let error = value_error().into_ref();
        error.set_cause(Some(RaisedError::new("KeyError", "'sku'").into_ref()));

        let payload = payload_for(&error, None, None, None);

        assert_eq!(payload.exceptions.len(), 2);
        assert_eq!(payload.stacktrace.len(), 2);
        assert_eq!(payload.exceptions[1].exception_type, "KeyError");
    }

    #[test]
    fn test_empty_chain_degrades_to_empty_stacktrace() {
        let error = value_error();

        let payload = build_payload(&error, Vec::new(), None, None, "", None);

        assert!(payload.stacktrace.is_empty());
        assert!(payload.exceptions.is_empty());
        assert_eq!(payload.message, "test error");
    }
}
