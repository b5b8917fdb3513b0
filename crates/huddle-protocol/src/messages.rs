use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Correlation id pairing a request with its response. Signed so ids
/// chosen by the server round-trip unchanged.
pub type RequestId = i64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Envelope has no request/response/notification flag")]
    UnknownShape,

    #[error("Envelope carries more than one shape flag")]
    AmbiguousShape,

    #[error("Missing or invalid field `{0}`")]
    MissingField(&'static str),
}

/// Request sent by either side, answered by exactly one response
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub data: Value,
}

/// Outcome carried by a response
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok(Value),
    Error { code: i64, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Outcome,
}

/// One-way message, never answered
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub data: Value,
}

/// Every message on the signaling connection is one of these three shapes
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Flat wire form, classified by its boolean discriminator
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "is_false")]
    request: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    response: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    notification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_reason: Option<String>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Absent or null data is sent as an empty object
fn normalize_data(data: Value) -> Value {
    if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    }
}

impl Envelope {
    pub fn request(id: RequestId, method: impl Into<String>, data: Value) -> Self {
        Envelope::Request(Request {
            id,
            method: method.into(),
            data,
        })
    }

    pub fn notification(method: impl Into<String>, data: Value) -> Self {
        Envelope::Notification(Notification {
            method: method.into(),
            data,
        })
    }

    pub fn success(id: RequestId, data: Value) -> Self {
        Envelope::Response(Response {
            id,
            outcome: Outcome::Ok(data),
        })
    }

    pub fn failure(id: RequestId, code: i64, reason: impl Into<String>) -> Self {
        Envelope::Response(Response {
            id,
            outcome: Outcome::Error {
                code,
                reason: reason.into(),
            },
        })
    }

    /// Classify a text frame by its discriminator field
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        match (wire.request, wire.response, wire.notification) {
            (true, false, false) => Ok(Envelope::Request(Request {
                id: wire.id.ok_or(ProtocolError::MissingField("id"))?,
                method: wire.method.ok_or(ProtocolError::MissingField("method"))?,
                data: normalize_data(wire.data),
            })),
            (false, true, false) => {
                let id = wire.id.ok_or(ProtocolError::MissingField("id"))?;
                let ok = wire.ok.ok_or(ProtocolError::MissingField("ok"))?;
                let outcome = if ok {
                    Outcome::Ok(normalize_data(wire.data))
                } else {
                    Outcome::Error {
                        code: wire.error_code.unwrap_or(500),
                        reason: wire.error_reason.unwrap_or_default(),
                    }
                };
                Ok(Envelope::Response(Response { id, outcome }))
            }
            (false, false, true) => Ok(Envelope::Notification(Notification {
                method: wire.method.ok_or(ProtocolError::MissingField("method"))?,
                data: normalize_data(wire.data),
            })),
            (false, false, false) => Err(ProtocolError::UnknownShape),
            _ => Err(ProtocolError::AmbiguousShape),
        }
    }

    pub fn to_json(&self) -> String {
        let wire = match self {
            Envelope::Request(r) => WireEnvelope {
                request: true,
                id: Some(r.id),
                method: Some(r.method.clone()),
                data: normalize_data(r.data.clone()),
                ..Default::default()
            },
            Envelope::Response(r) => match &r.outcome {
                Outcome::Ok(data) => WireEnvelope {
                    response: true,
                    id: Some(r.id),
                    ok: Some(true),
                    data: normalize_data(data.clone()),
                    ..Default::default()
                },
                Outcome::Error { code, reason } => WireEnvelope {
                    response: true,
                    id: Some(r.id),
                    ok: Some(false),
                    error_code: Some(*code),
                    error_reason: Some(reason.clone()),
                    ..Default::default()
                },
            },
            Envelope::Notification(n) => WireEnvelope {
                notification: true,
                method: Some(n.method.clone()),
                data: normalize_data(n.data.clone()),
                ..Default::default()
            },
        };

        // WireEnvelope holds only strings, numbers and JSON values
        serde_json::to_value(&wire)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(&r.method),
            Envelope::Notification(n) => Some(&n.method),
            Envelope::Response(_) => None,
        }
    }
}
