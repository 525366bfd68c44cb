//! Control-envelope wire types and inbound line classification.
//!
//! Every line on the agent's stdout is JSON. Three `type` values carry
//! control-protocol metadata; anything else is an application message
//! forwarded verbatim (parsed) to the consumer.
//!
//! | `type`                   | Classified as                              |
//! |--------------------------|--------------------------------------------|
//! | `control_response`       | [`InboundLine::ControlResponse`]           |
//! | `control_request`        | [`InboundLine::ControlRequest`]            |
//! | `control_cancel_request` | [`InboundLine::ControlCancel`]             |
//! | *(any other / absent)*   | [`InboundLine::Application`]               |

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{AppError, Result};

/// Control-request subtype for a permission check (agent → bridge).
pub const SUBTYPE_CAN_USE_TOOL: &str = "can_use_tool";

/// Control-request subtype for interrupting the agent's current turn.
pub const SUBTYPE_INTERRUPT: &str = "interrupt";

// ── Inbound envelope shapes ───────────────────────────────────────────────────

/// Top-level shape probe: only the `type` tag is read at this stage.
#[derive(Debug, Deserialize)]
struct TypeProbe {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Body of an inbound `control_response` line.
#[derive(Debug, Deserialize)]
struct ControlResponseEnvelope {
    response: ControlResponseBody,
}

#[derive(Debug, Deserialize)]
struct ControlResponseBody {
    request_id: String,
    subtype: String,
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Body of an inbound (role-reversed) `control_request` line.
#[derive(Debug, Deserialize)]
struct ControlRequestEnvelope {
    request_id: String,
    request: Value,
}

/// Body of an inbound `control_cancel_request` line.
#[derive(Debug, Deserialize)]
struct ControlCancelEnvelope {
    request_id: String,
}

// ── Classified inbound line ───────────────────────────────────────────────────

/// One classified line read from the agent's stdout.
#[derive(Debug)]
pub enum InboundLine {
    /// Response to an outbound control request issued by the bridge.
    ControlResponse {
        /// Correlation id of the outbound request this answers.
        request_id: String,
        /// `Ok(payload)` for `subtype: "success"`, `Err(AppError::Control)`
        /// carrying the remote message for `subtype: "error"`.
        result: Result<Value>,
    },
    /// Role-reversed control request from the agent (e.g. permission check).
    ControlRequest {
        /// Correlation id the reply envelope must carry.
        request_id: String,
        /// Request subtype (e.g. `can_use_tool`); empty when absent.
        subtype: String,
        /// Full request object, including subtype-specific fields.
        payload: Value,
    },
    /// Cancellation of a previously issued inbound control request.
    ControlCancel {
        /// Id of the inbound request to cancel.
        request_id: String,
    },
    /// Any other JSON line: an application message for the consumer.
    Application(Value),
}

/// Classify a single stdout line.
///
/// Classification order is fixed: control response, then control request,
/// then control cancel, then application message. Empty lines yield
/// `Ok(None)`.
///
/// # Errors
///
/// Returns [`AppError::Parse`] when the line is not valid JSON, or when a
/// recognised control `type` is missing a required field. Callers log and
/// drop such lines; they are never fatal.
pub fn classify_line(line: &str) -> Result<Option<InboundLine>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| AppError::Parse(format!("malformed json: {e}")))?;

    let probe: TypeProbe = serde_json::from_value(value.clone())
        .map_err(|e| AppError::Parse(format!("malformed envelope: {e}")))?;

    match probe.kind.as_deref() {
        Some("control_response") => {
            let env: ControlResponseEnvelope = serde_json::from_value(value)
                .map_err(|e| AppError::Parse(format!("malformed control_response: {e}")))?;
            let body = env.response;
            let result = if body.subtype == "success" {
                Ok(body.response.unwrap_or(Value::Null))
            } else {
                let message = match body.error {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => "unspecified control error".to_owned(),
                };
                Err(AppError::Control(message))
            };
            Ok(Some(InboundLine::ControlResponse {
                request_id: body.request_id,
                result,
            }))
        }
        Some("control_request") => {
            let env: ControlRequestEnvelope = serde_json::from_value(value)
                .map_err(|e| AppError::Parse(format!("malformed control_request: {e}")))?;
            let subtype = env
                .request
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            Ok(Some(InboundLine::ControlRequest {
                request_id: env.request_id,
                subtype,
                payload: env.request,
            }))
        }
        Some("control_cancel_request") => {
            let env: ControlCancelEnvelope = serde_json::from_value(value)
                .map_err(|e| AppError::Parse(format!("malformed control_cancel_request: {e}")))?;
            Ok(Some(InboundLine::ControlCancel {
                request_id: env.request_id,
            }))
        }
        _ => Ok(Some(InboundLine::Application(value))),
    }
}

// ── Outbound envelope builders ────────────────────────────────────────────────

/// Build an outbound control request envelope.
///
/// `request` must already carry its `subtype` field; see
/// [`interrupt_request`] for the canonical constructor.
#[must_use]
pub fn control_request(request_id: &str, request: Value) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": request,
    })
}

/// Build the request body for an `interrupt` control call.
#[must_use]
pub fn interrupt_request() -> Value {
    json!({ "subtype": SUBTYPE_INTERRUPT })
}

/// Build a success reply to an inbound control request.
#[must_use]
pub fn control_response_success(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        }
    })
}

/// Build an error reply to an inbound control request.
#[must_use]
pub fn control_response_error(request_id: &str, message: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": message,
        }
    })
}
