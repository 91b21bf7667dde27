//! Event frames exchanged with the remote side.
//!
//! Each frame is a length-prefixed JSON object `{"event": <name>, "data": ..}`.
//! Request and configuration bodies travel compressed (see
//! [`fabric_utils::compress_json`]); every other payload is plain JSON.

use fabric_types::Qid;
use fabric_utils::{PayloadError, compress_json};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProxyError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Events the client emits.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Compressed `{header: {uid, rid}, body}`.
    Execute(String),
    /// Compressed `{header: {uid}, body}`.
    Configure(String),
    Resume(String),
    Restore(Qid),
    State(String),
    Delete(Qid),
}

impl Outbound {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Outbound::Execute(_) => "execute",
            Outbound::Configure(_) => "configure",
            Outbound::Resume(_) => "resume",
            Outbound::Restore(_) => "restore",
            Outbound::State(_) => "state",
            Outbound::Delete(_) => "delete",
        }
    }

    #[must_use]
    pub fn into_event(self) -> Event {
        let name = self.name();
        let data = match self {
            Outbound::Execute(text)
            | Outbound::Configure(text)
            | Outbound::Resume(text)
            | Outbound::State(text) => Value::String(text),
            Outbound::Restore(qid) | Outbound::Delete(qid) => Value::String(qid.into_inner()),
        };
        Event::new(name, data)
    }
}

/// Events the remote side sends.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Connect,
    ConnectError(Value),
    /// Final result: `{ray: {rid, ..}, output}`.
    Response(Value),
    /// Execution accepted: a record snapshot carrying `rid`.
    Submitted(Value),
    Settings(Value),
    /// Record snapshot carrying `rid`.
    Progress(Value),
    /// Resync answer: `{ray: {rid, ..}, output?}`.
    Restore(Value),
    State(Value),
    Disconnect,
}

impl Inbound {
    pub fn parse(event: Event) -> Result<Self, ProxyError> {
        let data = event.data;
        let inbound = match event.event.as_str() {
            "connect" => Inbound::Connect,
            "connect_error" => Inbound::ConnectError(data),
            "response" => Inbound::Response(data),
            "submitted" => Inbound::Submitted(data),
            "settings" => Inbound::Settings(data),
            "progress" => Inbound::Progress(data),
            "restore" => Inbound::Restore(data),
            "state" => Inbound::State(data),
            "disconnect" => Inbound::Disconnect,
            _ => return Err(ProxyError::UnknownEvent(event.event)),
        };
        Ok(inbound)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Inbound::Connect => "connect",
            Inbound::ConnectError(_) => "connect_error",
            Inbound::Response(_) => "response",
            Inbound::Submitted(_) => "submitted",
            Inbound::Settings(_) => "settings",
            Inbound::Progress(_) => "progress",
            Inbound::Restore(_) => "restore",
            Inbound::State(_) => "state",
            Inbound::Disconnect => "disconnect",
        }
    }
}

pub fn request_payload<T: Serialize + ?Sized>(
    uid: &str,
    rid: &str,
    body: &T,
) -> Result<String, PayloadError> {
    compress_json(&json!({
        "header": {"uid": uid, "rid": rid},
        "body": body,
    }))
}

pub fn configure_payload<T: Serialize + ?Sized>(uid: &str, body: &T) -> Result<String, PayloadError> {
    compress_json(&json!({
        "header": {"uid": uid},
        "body": body,
    }))
}
