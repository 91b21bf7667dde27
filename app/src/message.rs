//! Controller/worker wire schema.
//!
//! Every frame carries one JSON envelope:
//!
//! ```json
//! {"v": 1, "action": "add", "data": "5f0c..."}
//! ```
//!
//! `v` lets either side detect a peer speaking a newer schema. A newer
//! envelope is still decoded on a best-effort basis; an unknown action or a
//! payload that does not fit its action is rejected with [`ProtocolError`]
//! and the receiver drops the frame.

use fabric_types::{AppState, Qid, Ray};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;

/// `data` of the FETCH sent by a freshly started worker.
pub const FETCH_QUEUE: &str = "queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Check,
    Configure,
    Exit,
    Fetch,
    Log,
    Remove,
    AppState,
    Update,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Check => "check",
            Action::Configure => "configure",
            Action::Exit => "exit",
            Action::Fetch => "fetch",
            Action::Log => "log",
            Action::Remove => "remove",
            Action::AppState => "app_state",
            Action::Update => "update",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let action = match raw.to_ascii_lowercase().as_str() {
            "add" => Action::Add,
            "check" => Action::Check,
            "configure" => Action::Configure,
            "exit" => Action::Exit,
            "fetch" => Action::Fetch,
            "log" => Action::Log,
            "remove" => Action::Remove,
            "app_state" => Action::AppState,
            "update" => Action::Update,
            _ => return None,
        };
        Some(action)
    }
}

/// State pushed from the worker for one execution. Absent fields are left
/// untouched on the receiving side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub qid: Qid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ray: Option<Ray>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub output: Option<Value>,
}

/// Distinguish an explicit `null` (`Some(Null)`) from a missing field (`None`).
fn present<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Update {
    #[must_use]
    pub fn ray(ray: &Ray) -> Self {
        Self {
            qid: ray.qid().clone(),
            ray: Some(ray.clone()),
            input: None,
            output: None,
        }
    }

    #[must_use]
    pub fn output(qid: Qid, output: Option<Value>) -> Self {
        Self {
            qid,
            ray: None,
            input: None,
            output: Some(output.unwrap_or(Value::Null)),
        }
    }
}

/// A worker log line relayed to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum Message {
    /// Queue an execution on the worker.
    Add(Qid),
    /// Liveness probe for a pending execution; handled like `Add`.
    Check(Qid),
    /// Settings in the store changed; payload is informational.
    Configure(String),
    /// Sender is stopping (or asks the peer to); payload is the reason.
    Exit(String),
    /// Ask the controller to resend work; payload names what to fetch.
    Fetch(String),
    Log(LogRecord),
    /// Drop a queued execution.
    Remove(Qid),
    AppState(AppState),
    Update(Update),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope has no action")]
    MissingAction,
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("invalid data for {action}: {source}")]
    InvalidData {
        action: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(default)]
    v: u32,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Message {
    #[must_use]
    pub fn action(&self) -> Action {
        match self {
            Message::Add(_) => Action::Add,
            Message::Check(_) => Action::Check,
            Message::Configure(_) => Action::Configure,
            Message::Exit(_) => Action::Exit,
            Message::Fetch(_) => Action::Fetch,
            Message::Log(_) => Action::Log,
            Message::Remove(_) => Action::Remove,
            Message::AppState(_) => Action::AppState,
            Message::Update(_) => Action::Update,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let data = match self {
            Message::Add(qid) | Message::Check(qid) | Message::Remove(qid) => {
                Value::String(qid.as_str().to_string())
            }
            Message::Configure(text) | Message::Exit(text) | Message::Fetch(text) => {
                Value::String(text.clone())
            }
            Message::Log(record) => serde_json::to_value(record)?,
            Message::AppState(state) => serde_json::to_value(state)?,
            Message::Update(update) => serde_json::to_value(update)?,
        };
        serde_json::to_vec(&Envelope {
            v: PROTOCOL_VERSION,
            action: Some(self.action().as_str().to_string()),
            data,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let raw = envelope.action.ok_or(ProtocolError::MissingAction)?;
        let action = Action::parse(&raw).ok_or(ProtocolError::UnknownAction(raw))?;
        if envelope.v > PROTOCOL_VERSION {
            tracing::debug!(
                version = envelope.v,
                action = action.as_str(),
                "Decoding envelope from a newer protocol version"
            );
        }

        let data = envelope.data;
        let message = match action {
            Action::Add => Message::Add(field(action, data)?),
            Action::Check => Message::Check(field(action, data)?),
            Action::Remove => Message::Remove(field(action, data)?),
            Action::Configure => Message::Configure(text(data)),
            Action::Exit => Message::Exit(text(data)),
            Action::Fetch => Message::Fetch(text(data)),
            Action::Log => Message::Log(field(action, data)?),
            Action::AppState => Message::AppState(field(action, data)?),
            Action::Update => Message::Update(field(action, data)?),
        };
        Ok(message)
    }
}

fn field<T: serde::de::DeserializeOwned>(action: Action, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidData {
        action: action.as_str(),
        source,
    })
}

fn text(data: Value) -> String {
    match data {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
