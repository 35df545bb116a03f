//! Request and response envelopes exchanged between workers and the coordinator.
//!
//! Workers publish `produce_testdata` messages carrying `{uid, cid, request}`;
//! the coordinator answers every one of them with exactly one
//! `consume_testdata` message carrying `{uid, response}`, addressed to the
//! worker identified by `cid`.
//!
//! ```text
//! worker ──produce_testdata{uid, cid, request}──▶ coordinator
//! worker ◀──consume_testdata{uid, response}────── coordinator
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Topic for worker → coordinator requests.
pub const PRODUCE_TESTDATA: &str = "produce_testdata";
/// Topic for coordinator → worker replies.
pub const CONSUME_TESTDATA: &str = "consume_testdata";

/// Which coordinator engine a request is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Testdata,
    Keystore,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Testdata => "testdata",
            MessageKind::Keystore => "keystore",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "testdata" => Some(MessageKind::Testdata),
            "keystore" => Some(MessageKind::Keystore),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Keystore primitives understood by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeystoreAction {
    Get,
    Set,
    Inc,
    Push,
    Pop,
    Del,
}

impl KeystoreAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeystoreAction::Get => "get",
            KeystoreAction::Set => "set",
            KeystoreAction::Inc => "inc",
            KeystoreAction::Push => "push",
            KeystoreAction::Pop => "pop",
            KeystoreAction::Del => "del",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "get" => Some(KeystoreAction::Get),
            "set" => Some(KeystoreAction::Set),
            "inc" => Some(KeystoreAction::Inc),
            "push" => Some(KeystoreAction::Push),
            "pop" => Some(KeystoreAction::Pop),
            "del" => Some(KeystoreAction::Del),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeystoreAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request envelope sent by a worker.
///
/// `message` and `action` are kept as raw strings so that an unknown kind or
/// action still deserializes and can be answered with an error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub message: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// `None` when the field is absent; an explicit `null` is `Some(Value::Null)`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub data: Option<Value>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Request {
    /// Request the next iteration of testdata for a scenario.
    pub fn testdata(identifier: impl Into<String>) -> Self {
        Self {
            message: MessageKind::Testdata.as_str().to_string(),
            identifier: identifier.into(),
            action: None,
            key: None,
            data: None,
        }
    }

    /// Request a keystore primitive.
    pub fn keystore(
        identifier: impl Into<String>,
        action: KeystoreAction,
        key: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            message: MessageKind::Keystore.as_str().to_string(),
            identifier: identifier.into(),
            action: Some(action.as_str().to_string()),
            key: Some(key.into()),
            data,
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_str(&self.message)
    }
}

/// Keystore reply. `error` is always serialized, `null` on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeystoreResponse {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl KeystoreResponse {
    pub fn success(request: &Request, data: Value) -> Self {
        Self {
            action: request.action.clone(),
            key: request.key.clone(),
            data,
            error: None,
        }
    }

    pub fn error(request: &Request, message: impl Into<String>) -> Self {
        Self {
            action: request.action.clone(),
            key: request.key.clone(),
            data: Value::Null,
            error: Some(message.into()),
        }
    }
}

/// What a scenario should do with a testdata reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestdataAction {
    Consume,
    Stop,
}

impl TestdataAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestdataAction::Consume => "consume",
            TestdataAction::Stop => "stop",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "consume" => Some(TestdataAction::Consume),
            "stop" => Some(TestdataAction::Stop),
            _ => None,
        }
    }
}

/// Materialized variables for one iteration.
///
/// Aliases are flattened next to `variables` on the wire:
/// `{"variables": {"rows.user.name": "bob"}, "username": "bob"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestdataPayload {
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(flatten)]
    pub aliases: Map<String, Value>,
}

/// Testdata reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestdataResponse {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<TestdataPayload>,
}

impl TestdataResponse {
    pub fn stop() -> Self {
        Self {
            action: TestdataAction::Stop.as_str().to_string(),
            data: None,
        }
    }

    pub fn consume(payload: TestdataPayload) -> Self {
        Self {
            action: TestdataAction::Consume.as_str().to_string(),
            data: Some(payload),
        }
    }

    pub fn testdata_action(&self) -> Option<TestdataAction> {
        TestdataAction::from_str(&self.action)
    }
}

/// Body of a `produce_testdata` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProduceTestdata {
    pub uid: u64,
    pub cid: String,
    pub request: Request,
}

/// Body of a `consume_testdata` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeTestdata {
    pub uid: u64,
    pub response: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keystore_request_wire_format() {
        let request = Request::keystore("Checkout", KeystoreAction::Push, "orders", Some(json!(42)));
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(
            value,
            json!({
                "message": "keystore",
                "identifier": "Checkout",
                "action": "push",
                "key": "orders",
                "data": 42
            })
        );
    }

    #[test]
    fn test_unknown_kind_still_deserializes() {
        let request: Request =
            serde_json::from_value(json!({"message": "metrics", "identifier": "X"})).unwrap();
        assert_eq!(request.kind(), None);
        assert!(request.key.is_none());
    }

    #[test]
    fn test_explicit_null_data_is_kept() {
        let request = Request::keystore("X", KeystoreAction::Set, "k", Some(Value::Null));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["data"], Value::Null);
        assert!(value.as_object().unwrap().contains_key("data"));

        let parsed: Request = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.data, Some(Value::Null));

        let absent: Request =
            serde_json::from_value(json!({"message": "keystore", "action": "get", "key": "k"})).unwrap();
        assert_eq!(absent.data, None);
    }

    #[test]
    fn test_keystore_response_always_carries_error_field() {
        let request = Request::keystore("X", KeystoreAction::Get, "k", None);
        let json = serde_json::to_string(&KeystoreResponse::success(&request, json!("v"))).unwrap();
        assert!(json.contains("\"error\":null"));
    }

    #[test]
    fn test_testdata_payload_flattens_aliases() {
        let mut payload = TestdataPayload::default();
        payload.variables.insert("rows.user.name".into(), json!("bob"));
        payload.aliases.insert("username".into(), json!("bob"));

        let value = serde_json::to_value(TestdataResponse::consume(payload.clone())).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "consume",
                "data": {"variables": {"rows.user.name": "bob"}, "username": "bob"}
            })
        );

        let parsed: TestdataResponse = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.data, Some(payload));
        assert_eq!(parsed.testdata_action(), Some(TestdataAction::Consume));
    }

    #[test]
    fn test_stop_response_has_no_data() {
        let value = serde_json::to_value(TestdataResponse::stop()).unwrap();
        assert_eq!(value, json!({"action": "stop"}));
    }

    #[test]
    fn test_action_names_roundtrip() {
        for action in [
            KeystoreAction::Get,
            KeystoreAction::Set,
            KeystoreAction::Inc,
            KeystoreAction::Push,
            KeystoreAction::Pop,
            KeystoreAction::Del,
        ] {
            assert_eq!(KeystoreAction::from_str(action.as_str()), Some(action));
        }
        assert_eq!(KeystoreAction::from_str("append"), None);
    }
}
