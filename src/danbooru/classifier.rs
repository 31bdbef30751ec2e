//! Maps raw responses onto a fixed outcome taxonomy.
//!
//! Classification never fails: anything that does not match a known shape becomes
//! [`ClassifiedOutcome::Malformed`] with the raw body kept for diagnostics.

use std::time::Duration;

use serde_json::Value;

use crate::danbooru::sender::{RawResponse, TransportError};

/// Why a 403 was returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForbiddenReason {
    /// The key is valid but its account tier cannot see this resource.
    InsufficientPermission(String),
    /// The endpoint rejected the request parameters. Points at a bug in how requests are built.
    InvalidParameters(String),
}

impl ForbiddenReason {
    pub fn detail(&self) -> &str {
        match self {
            ForbiddenReason::InsufficientPermission(detail) => detail,
            ForbiddenReason::InvalidParameters(detail) => detail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorCause {
    /// The server blew up on an integer range, typically an oversized post id pivot.
    PivotOutOfRange,
    Upstream,
    Timeout,
    Connection,
}

/// A transient failure on the upstream side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFault {
    /// `None` when no response arrived at all.
    pub status: Option<u16>,
    pub cause: ServerErrorCause,
}

/// Result of classifying one response.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedOutcome {
    Success(Value),
    NotFound,
    Forbidden(ForbiddenReason),
    AuthenticationFailure,
    RateLimited(Option<Duration>),
    ServerError(ServerFault),
    Malformed(String),
}

impl ClassifiedOutcome {
    /// Outcomes worth retrying after a group-level backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClassifiedOutcome::RateLimited(_) | ClassifiedOutcome::ServerError(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClassifiedOutcome::Success(_) => "success",
            ClassifiedOutcome::NotFound => "not_found",
            ClassifiedOutcome::Forbidden(_) => "forbidden",
            ClassifiedOutcome::AuthenticationFailure => "authentication_failure",
            ClassifiedOutcome::RateLimited(_) => "rate_limited",
            ClassifiedOutcome::ServerError(_) => "server_error",
            ClassifiedOutcome::Malformed(_) => "malformed",
        }
    }
}

/// The `{"success": false, "error": ..., "message": ...}` envelope the API uses for failures.
struct ErrorEnvelope {
    error: Option<String>,
    message: Option<String>,
}

impl ErrorEnvelope {
    fn parse(body: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let object = value.as_object()?;
        Some(Self {
            error: object.get("error").and_then(Value::as_str).map(str::to_string),
            message: object.get("message").and_then(Value::as_str).map(str::to_string),
        })
    }

    fn describe(&self) -> String {
        match (&self.error, &self.message) {
            (Some(error), Some(message)) => format!("{}: {}", error, message),
            (Some(error), None) => error.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) => "no error detail".to_string(),
        }
    }

    fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        [&self.error, &self.message]
            .into_iter()
            .flatten()
            .any(|text| text.to_ascii_lowercase().contains(&needle))
    }
}

fn classify_forbidden(response: &RawResponse) -> ForbiddenReason {
    match ErrorEnvelope::parse(&response.body) {
        Some(envelope) => {
            if envelope.mentions("PrivilegeError") || envelope.mentions("access denied") {
                ForbiddenReason::InsufficientPermission(envelope.describe())
            } else {
                ForbiddenReason::InvalidParameters(envelope.describe())
            }
        }
        // A bare 403 without an envelope comes from the permission layer.
        None => ForbiddenReason::InsufficientPermission(response.body_text()),
    }
}

fn classify_server_error(response: &RawResponse) -> ServerFault {
    let pivot = ErrorEnvelope::parse(&response.body)
        .map(|envelope| envelope.mentions("RangeError") || envelope.mentions("out of range"))
        .unwrap_or(false);

    ServerFault {
        status: Some(response.status),
        cause: if pivot {
            ServerErrorCause::PivotOutOfRange
        } else {
            ServerErrorCause::Upstream
        },
    }
}

fn classify_success(response: &RawResponse) -> ClassifiedOutcome {
    match serde_json::from_slice::<Value>(&response.body) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => ClassifiedOutcome::Success(value),
        Ok(other) => ClassifiedOutcome::Malformed(format!("unexpected JSON payload: {}", other)),
        Err(e) => ClassifiedOutcome::Malformed(format!(
            "unparsable body ({}): {}",
            e,
            response.body_text()
        )),
    }
}

/// Classifies a response from the API.
pub fn classify(response: &RawResponse) -> ClassifiedOutcome {
    match response.status {
        200..=299 => classify_success(response),
        401 => ClassifiedOutcome::AuthenticationFailure,
        403 => ClassifiedOutcome::Forbidden(classify_forbidden(response)),
        404 => ClassifiedOutcome::NotFound,
        429 => ClassifiedOutcome::RateLimited(response.retry_after),
        500..=599 => ClassifiedOutcome::ServerError(classify_server_error(response)),
        status => ClassifiedOutcome::Malformed(format!(
            "unexpected status {}: {}",
            status,
            response.body_text()
        )),
    }
}

/// Classifies a request that never produced a response.
pub fn classify_transport_error(error: &TransportError) -> ClassifiedOutcome {
    match error {
        TransportError::Timeout => ClassifiedOutcome::ServerError(ServerFault {
            status: None,
            cause: ServerErrorCause::Timeout,
        }),
        TransportError::Connection(_) => ClassifiedOutcome::ServerError(ServerFault {
            status: None,
            cause: ServerErrorCause::Connection,
        }),
        TransportError::InvalidRequest(detail) => ClassifiedOutcome::Malformed(detail.clone()),
    }
}
