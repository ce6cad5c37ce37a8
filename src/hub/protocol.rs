//! Hub wire envelopes.
//!
//! The hub protocol rides on single-letter JSON envelopes: `H`/`M`/`A`
//! for invocations, plus `I` to correlate requests with results, `S`
//! for round-tripped per-hub state, `R`/`E` for result and error.
//! Unknown fields are ignored so newer servers stay compatible.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A client-to-server method invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HubInvocation {
    #[serde(rename = "H")]
    pub hub: String,
    #[serde(rename = "M")]
    pub method: String,
    #[serde(rename = "A")]
    pub args: Vec<Value>,
    #[serde(rename = "I")]
    pub id: String,
    #[serde(rename = "S", skip_serializing_if = "Option::is_none")]
    pub state: Option<HashMap<String, Value>>,
}

/// A server response correlated to an earlier invocation by `I`.
#[derive(Debug, Clone, Deserialize)]
pub struct HubResult {
    #[serde(rename = "I", deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(rename = "R", default)]
    pub result: Option<Value>,
    #[serde(rename = "E", default)]
    pub error: Option<String>,
    #[serde(rename = "S", default)]
    pub state: Option<HashMap<String, Value>>,
}

/// A server-to-client event broadcast.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInvocation {
    #[serde(rename = "H")]
    pub hub: String,
    #[serde(rename = "M")]
    pub method: String,
    #[serde(rename = "A", default)]
    pub args: Vec<Value>,
    #[serde(rename = "S", default)]
    pub state: Option<HashMap<String, Value>>,
}

/// One inbound hub payload, classified.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Result(HubResult),
    ServerCall(ServerInvocation),
    /// Keep-alive markers, group messages, anything without a hub shape.
    Other(Value),
}

/// Classify a raw inbound payload. Presence of `I` marks a result;
/// `H` plus `M` marks a server call; everything else passes through as
/// [`InboundMessage::Other`].
pub fn parse_inbound(raw: &str) -> Result<InboundMessage, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    if value.get("I").is_some() {
        let result = HubResult::deserialize(&value)?;
        return Ok(InboundMessage::Result(result));
    }
    if value.get("H").is_some() && value.get("M").is_some() {
        let call = ServerInvocation::deserialize(&value)?;
        return Ok(InboundMessage::ServerCall(call));
    }
    Ok(InboundMessage::Other(value))
}

/// Servers echo the invocation id back as either a JSON string or a
/// bare number.
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "invocation id must be a string or number, got {}",
            other
        ))),
    }
}
