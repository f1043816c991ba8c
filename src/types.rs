//! Core type definitions for switchboard

use crate::error::RemoteError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Stable identifier of one remote participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(String);

impl RecipientId {
    /// Create a recipient ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is blank
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecipientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RecipientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of one logical request, shared by every step it produces
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new random request ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is blank
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a trace step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(Uuid);

impl StepId {
    /// Create a new random step ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a step ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One logical action sent to one or more recipients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedRequest {
    /// Correlation key for replies and trace steps
    pub request_id: RequestId,
    /// Opaque request body
    pub payload: Value,
}

impl CorrelatedRequest {
    /// Create a request with a fresh ID
    pub fn new(payload: Value) -> Self {
        Self {
            request_id: RequestId::new(),
            payload,
        }
    }

    /// Create a request under an existing ID
    pub fn with_id(request_id: RequestId, payload: Value) -> Self {
        Self {
            request_id,
            payload,
        }
    }

    /// Whether the payload is null or blank text
    pub fn has_empty_payload(&self) -> bool {
        payload_is_empty(&self.payload)
    }
}

/// Null and blank strings carry nothing worth sending
pub(crate) fn payload_is_empty(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Raw body of a reply as handed over by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ReplyBody {
    /// Some payload, not yet inspected
    Payload(Value),
    /// The recipient reported a failure
    Rejected(String),
    /// Neither payload nor error
    Empty,
}

impl ReplyBody {
    /// Plain text payload
    pub fn text(text: impl Into<String>) -> Self {
        Self::Payload(Value::String(text.into()))
    }

    /// Remote failure with a reason
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Text carried by this body, if any
    pub fn extract_text(&self) -> Option<String> {
        match self {
            Self::Payload(value) => match extract_text(value) {
                Extracted::Text(text) => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Best-effort rendering used for marker matching when no text is present
    pub fn render(&self) -> String {
        match self {
            Self::Payload(Value::String(s)) => s.clone(),
            Self::Payload(value) => value.to_string(),
            Self::Rejected(reason) => reason.clone(),
            Self::Empty => String::new(),
        }
    }
}

/// One inbound message on a channel, tagged by sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedReply {
    /// Participant that produced the message
    pub sender: RecipientId,
    /// Raw body
    pub body: ReplyBody,
    /// Participants the message was forwarded to (empty: back to the coordinator)
    #[serde(default)]
    pub addressed_to: Vec<RecipientId>,
    /// Arrival timestamp
    pub received_at: DateTime<Utc>,
}

impl CorrelatedReply {
    /// Create a reply received now
    pub fn new(sender: RecipientId, body: ReplyBody) -> Self {
        Self {
            sender,
            body,
            addressed_to: Vec::new(),
            received_at: Utc::now(),
        }
    }

    /// Record onward recipients
    pub fn with_addressed_to(mut self, addressed_to: Vec<RecipientId>) -> Self {
        self.addressed_to = addressed_to;
        self
    }

    /// Classify the body
    pub fn outcome(&self) -> ReplyOutcome {
        ReplyOutcome::classify(&self.body)
    }
}

/// Classified result of waiting for one recipient
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// Usable text payload
    Success(String),
    /// Known failure
    RemoteError(RemoteError),
    /// Nothing arrived in time
    Timeout,
}

impl ReplyOutcome {
    /// Map a raw body to an outcome
    pub fn classify(body: &ReplyBody) -> Self {
        match body {
            ReplyBody::Rejected(reason) => Self::RemoteError(RemoteError::rejected(reason.clone())),
            ReplyBody::Empty => Self::RemoteError(RemoteError::malformed(
                "reply carried neither a payload nor an error",
            )),
            ReplyBody::Payload(value) => match extract_text(value) {
                Extracted::Text(text) => Self::Success(text),
                Extracted::NoText => {
                    Self::RemoteError(RemoteError::empty_reply("reply contained no text content"))
                }
                Extracted::Unrecognized => Self::RemoteError(RemoteError::malformed(format!(
                    "unrecognized reply shape: {}",
                    truncate(&value.to_string(), 120)
                ))),
            },
        }
    }

    /// Convert into a `Result`, mapping `Timeout` through the supplied closure
    pub fn into_result<E>(self, on_timeout: impl FnOnce() -> E) -> std::result::Result<String, E>
    where
        E: From<RemoteError>,
    {
        match self {
            Self::Success(text) => Ok(text),
            Self::RemoteError(err) => Err(err.into()),
            Self::Timeout => Err(on_timeout()),
        }
    }
}

enum Extracted {
    Text(String),
    NoText,
    Unrecognized,
}

/// Pull text out of the payload shapes agents commonly reply with
fn extract_text(value: &Value) -> Extracted {
    match value {
        Value::String(s) => non_blank(s.clone()),
        Value::Array(parts) => collect_parts(parts),
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                return non_blank(text.clone());
            }
            if let Some(Value::String(content)) = map.get("content") {
                return non_blank(content.clone());
            }
            if let Some(Value::Array(parts)) = map.get("parts") {
                return collect_parts(parts);
            }
            if let Some(message) = map.get("message") {
                return extract_text(message);
            }
            Extracted::Unrecognized
        }
        _ => Extracted::Unrecognized,
    }
}

fn collect_parts(parts: &[Value]) -> Extracted {
    let texts: Vec<String> = parts
        .iter()
        .filter_map(|part| match extract_text(part) {
            Extracted::Text(text) => Some(text),
            _ => None,
        })
        .collect();

    if texts.is_empty() {
        Extracted::NoText
    } else {
        Extracted::Text(texts.join("\n"))
    }
}

fn non_blank(text: String) -> Extracted {
    if text.trim().is_empty() {
        Extracted::NoText
    } else {
        Extracted::Text(text)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
