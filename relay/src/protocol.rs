//! Test Agent wire protocol.
//!
//! Every frame on the socket is a JSON array `[event, data]`. The `test data`
//! event carries a second, string-encoded `[event, data]` pair produced by the
//! remote mocha reporter, which the runner forwards without re-validating.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ProtocolError;

// Top-level event names
pub const EVENT_RUN_TESTS: &str = "run tests";
pub const EVENT_SET_TEST_ENVS: &str = "set test envs";
pub const EVENT_TEST_DATA: &str = "test data";

// Nested reporter event names
pub const NESTED_START: &str = "start";
pub const NESTED_SUITE: &str = "suite";
pub const NESTED_SUITE_END: &str = "suite end";
pub const NESTED_PASS: &str = "pass";
pub const NESTED_FAIL: &str = "fail";
pub const NESTED_END: &str = "end";

/// Key in nested event data naming the environment the event belongs to.
pub const ENV_ID_KEY: &str = "testAgentEnvId";

/// Environment used when a nested event carries no `testAgentEnvId`.
pub const GLOBAL_ENV: &str = "global";

/// Params of the outbound `run tests` command
#[derive(Debug, Serialize)]
pub struct RunTestsParams {
    pub tests: Vec<String>,
}

/// A decoded top-level message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub event: String,
    pub data: Value,
}

/// A decoded reporter event from inside a `test data` message
#[derive(Debug, Clone, PartialEq)]
pub struct NestedEvent {
    pub event: String,
    pub data: Value,
}

impl NestedEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Environment this event is grouped under.
    pub fn env_id(&self) -> &str {
        self.str_field(ENV_ID_KEY).unwrap_or(GLOBAL_ENV)
    }

    /// Suite title, carried by `suite` and `suite end`.
    pub fn title(&self) -> &str {
        self.str_field("title").unwrap_or_default()
    }

    /// Full test title, carried by `pass` and `fail`.
    pub fn full_title(&self) -> &str {
        self.str_field("fullTitle").unwrap_or_default()
    }

    /// `err.message` of a `fail` event, when the reporter sent one.
    pub fn error_message(&self) -> Option<&str> {
        self.data
            .get("err")
            .and_then(|err| err.get("message"))
            .and_then(Value::as_str)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Encode an `[event, data]` pair as a text frame.
pub fn encode<T: Serialize>(event: &str, data: T) -> String {
    let data = serde_json::to_value(data).unwrap_or(Value::Null);
    Value::Array(vec![Value::String(event.to_string()), data]).to_string()
}

/// Decode a text frame into its `[event, data]` pair.
pub fn decode(text: &str) -> Result<Message, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::MalformedMessage(format!("invalid JSON: {e}")))?;

    let (event, data) = into_pair(value).map_err(ProtocolError::MalformedMessage)?;
    Ok(Message { event, data })
}

/// Decode the payload of a `test data` message.
///
/// The payload is either the encoded string itself or a one-element array
/// holding it.
pub fn decode_nested(data: &Value) -> Result<NestedEvent, ProtocolError> {
    let encoded = match data {
        Value::String(s) => s.as_str(),
        Value::Array(items) if items.len() == 1 => items[0].as_str().ok_or_else(|| {
            ProtocolError::MalformedNestedMessage("payload element is not a string".to_string())
        })?,
        other => {
            return Err(ProtocolError::MalformedNestedMessage(format!(
                "expected encoded string, got {}",
                json_kind(other)
            )))
        }
    };

    let value: Value = serde_json::from_str(encoded)
        .map_err(|e| ProtocolError::MalformedNestedMessage(format!("invalid JSON: {e}")))?;

    let (event, data) = into_pair(value).map_err(ProtocolError::MalformedNestedMessage)?;
    let data = match data {
        Value::Null => Value::Object(Map::new()),
        data => data,
    };

    Ok(NestedEvent { event, data })
}

/// Parse the environment ids carried by `set test envs`.
pub fn decode_env_ids(data: &Value) -> Result<Vec<String>, ProtocolError> {
    let items = data.as_array().ok_or_else(|| {
        ProtocolError::MalformedMessage(format!(
            "expected environment list, got {}",
            json_kind(data)
        ))
    })?;

    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                ProtocolError::MalformedMessage(format!(
                    "environment id is not a string: {item}"
                ))
            })
        })
        .collect()
}

/// Prefix a test path with `/` unless it already has one.
pub fn normalize_test_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Build the `run tests` command for the given test paths.
pub fn run_tests_command(tests: &[String]) -> String {
    let params = RunTestsParams {
        tests: tests.iter().map(|t| normalize_test_path(t)).collect(),
    };
    encode(EVENT_RUN_TESTS, params)
}

fn into_pair(value: Value) -> Result<(String, Value), String> {
    let items = match value {
        Value::Array(items) => items,
        other => return Err(format!("expected [event, data], got {}", json_kind(&other))),
    };

    if items.len() != 2 {
        return Err(format!("expected 2 elements, got {}", items.len()));
    }

    let mut items = items.into_iter();
    match (items.next(), items.next()) {
        (Some(Value::String(event)), Some(data)) => Ok((event, data)),
        (Some(other), _) => Err(format!("event name is not a string: {other}")),
        _ => Err("expected [event, data]".to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
