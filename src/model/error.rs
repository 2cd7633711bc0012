use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// A JSON-RPC error code.
///
/// The protocol-reserved range is defined by the spec (§7): parse error,
/// invalid request, method not found, invalid params, internal error,
/// connection closed, and request timeout all have fixed values here.
/// Application handlers are free to use any other `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: ErrorCode = ErrorCode(-32700);
    pub const INVALID_REQUEST: ErrorCode = ErrorCode(-32600);
    pub const METHOD_NOT_FOUND: ErrorCode = ErrorCode(-32601);
    pub const INVALID_PARAMS: ErrorCode = ErrorCode(-32602);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(-32603);
    pub const CONNECTION_CLOSED: ErrorCode = ErrorCode(-32000);
    pub const REQUEST_TIMEOUT: ErrorCode = ErrorCode(-32001);
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The wire payload of a JSON-RPC error response, and the type every
/// handler result is coerced into on the error path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, data)
    }

    pub fn invalid_request(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, data)
    }

    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {}", method.into()),
            None,
        )
    }

    pub fn invalid_params(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, data)
    }

    pub fn internal_error(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, data)
    }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CONNECTION_CLOSED, message, None)
    }

    pub fn request_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::REQUEST_TIMEOUT, message, None)
    }

    /// Whether this error carries one of the protocol's fixed codes, in
    /// which case an error interceptor may rewrite `message`/`data` but not
    /// `code` (§4.2).
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::PARSE_ERROR
                | ErrorCode::INVALID_REQUEST
                | ErrorCode::METHOD_NOT_FOUND
                | ErrorCode::INVALID_PARAMS
                | ErrorCode::INTERNAL_ERROR
                | ErrorCode::CONNECTION_CLOSED
                | ErrorCode::REQUEST_TIMEOUT
        )
    }
}

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " ({data})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}
