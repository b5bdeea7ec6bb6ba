//! Typed error system for Magic RPC.
//!
//! Every failure carries an [`ErrorCode`], and every code belongs to exactly one
//! [`ErrorKind`]: input errors describe a bad request and are safe to report to
//! the caller, server errors describe a broken contract inside the server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The caller's request or selection was invalid.
    Input,
    /// An internal contract was violated.
    Server,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "InputError"),
            Self::Server => write!(f, "ServerError"),
        }
    }
}

/// Typed error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Request errors
    InvalidPayload,
    InvalidMethod,
    InvalidInput,
    InvalidSelection,
    InvalidField,
    NotFound,

    // Contract errors
    MethodNotImplemented,
    TypeNotFound,
    ResolverNotFound,
    LoaderNotFound,
    InvalidOutput,
    InvalidRegistration,

    // Execution errors
    ResolverError,
    LoaderError,
    HandlerError,

    // Transport errors
    ConnectionFailed,
    Timeout,
    InvalidResponse,

    // Internal errors
    InternalError,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::InvalidMethod => "INVALID_METHOD",
            Self::InvalidInput => "INVALID_INPUT",
            Self::InvalidSelection => "INVALID_SELECTION",
            Self::InvalidField => "INVALID_FIELD",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotImplemented => "METHOD_NOT_IMPLEMENTED",
            Self::TypeNotFound => "TYPE_NOT_FOUND",
            Self::ResolverNotFound => "RESOLVER_NOT_FOUND",
            Self::LoaderNotFound => "LOADER_NOT_FOUND",
            Self::InvalidOutput => "INVALID_OUTPUT",
            Self::InvalidRegistration => "INVALID_REGISTRATION",
            Self::ResolverError => "RESOLVER_ERROR",
            Self::LoaderError => "LOADER_ERROR",
            Self::HandlerError => "HANDLER_ERROR",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns the kind this code belongs to.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPayload
            | Self::InvalidMethod
            | Self::InvalidInput
            | Self::InvalidSelection
            | Self::InvalidField
            | Self::NotFound => ErrorKind::Input,
            _ => ErrorKind::Server,
        }
    }

    /// Returns true if this is a client error.
    pub const fn is_input_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Input)
    }

    /// Returns true if this is a server error.
    pub const fn is_server_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Server)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An RPC error.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct RpcError {
    /// Typed error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Structured details reported to the caller.
    pub data: Option<Map<String, Value>>,
}

impl RpcError {
    /// Creates a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Creates an input error. Codes of the server kind are replaced by
    /// `INVALID_INPUT`.
    pub fn input(code: ErrorCode, message: impl Into<String>) -> Self {
        let code = if code.is_input_error() {
            code
        } else {
            ErrorCode::InvalidInput
        };
        Self::new(code, message)
    }

    /// Creates a server error. Codes of the input kind are replaced by
    /// `INTERNAL_ERROR`.
    pub fn server(code: ErrorCode, message: impl Into<String>) -> Self {
        let code = if code.is_server_error() {
            code
        } else {
            ErrorCode::InternalError
        };
        Self::new(code, message)
    }

    /// Adds a data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let data = self.data.get_or_insert_with(Map::new);
        if let Ok(v) = serde_json::to_value(value) {
            data.insert(key.into(), v);
        }
        self
    }

    // Convenience constructors

    /// The payload has no method name.
    pub fn missing_method() -> Self {
        Self::new(
            ErrorCode::InvalidPayload,
            "Invalid payload: method is required",
        )
    }

    /// The method is not part of the schema.
    pub fn invalid_method(method: &str) -> Self {
        Self::new(ErrorCode::InvalidMethod, format!("Invalid method: {method}"))
            .with_data("method", method)
    }

    /// The method has a contract but no handler.
    pub fn not_implemented(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotImplemented,
            format!("Method not implemented: {method}"),
        )
        .with_data("method", method)
    }

    /// The selection names a field that the type neither declares nor resolves.
    pub fn invalid_field(field: &str, type_name: Option<&str>) -> Self {
        let message = match type_name {
            Some(type_name) => format!("Invalid field '{field}' of type '{type_name}'"),
            None => format!("Invalid field '{field}'"),
        };
        let err = Self::new(ErrorCode::InvalidField, message).with_data("field", field);
        match type_name {
            Some(type_name) => err.with_data("type", type_name),
            None => err,
        }
    }

    /// A named type is referenced but not registered.
    pub fn type_not_found(type_name: &str) -> Self {
        Self::new(
            ErrorCode::TypeNotFound,
            format!("no type schema available for type '{type_name}'"),
        )
        .with_data("type", type_name)
    }

    /// A named type has no entry in the resolver table.
    pub fn resolvers_not_found(type_name: &str) -> Self {
        Self::new(
            ErrorCode::ResolverNotFound,
            format!("no resolver available for type '{type_name}'"),
        )
        .with_data("type", type_name)
    }

    /// A requested entity does not exist.
    pub fn not_found(resource: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("{resource} not found"))
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    /// Returns true if this is a client error.
    pub fn is_input_error(&self) -> bool {
        self.code.is_input_error()
    }

    /// Returns true if this is a server error.
    pub fn is_server_error(&self) -> bool {
        self.code.is_server_error()
    }
}

impl Serialize for RpcError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("RpcError", 3)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("code", &self.code)?;
        if let Some(ref data) = self.data {
            state.serialize_field("data", data)?;
        }
        state.end()
    }
}

/// Type alias for RPC results.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Result extension for mapping foreign errors into [`RpcError`].
pub trait ResultExt<T> {
    /// Maps the error to an RpcError with the given code.
    fn map_rpc_err(self, code: ErrorCode) -> RpcResult<T>;

    /// Maps the error to an RpcError with the given code and message, keeping
    /// the original message under `data.cause`.
    fn map_rpc_err_with(self, code: ErrorCode, message: impl Into<String>) -> RpcResult<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn map_rpc_err(self, code: ErrorCode) -> RpcResult<T> {
        self.map_err(|e| RpcError::new(code, e.to_string()))
    }

    fn map_rpc_err_with(self, code: ErrorCode, message: impl Into<String>) -> RpcResult<T> {
        self.map_err(|e| RpcError::new(code, message).with_data("cause", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_kinds() {
        assert_eq!(ErrorCode::InvalidMethod.kind(), ErrorKind::Input);
        assert_eq!(ErrorCode::InvalidField.kind(), ErrorKind::Input);
        assert_eq!(ErrorCode::MethodNotImplemented.kind(), ErrorKind::Server);
        assert_eq!(ErrorCode::ResolverNotFound.kind(), ErrorKind::Server);
        assert!(ErrorCode::InvalidOutput.is_server_error());
        assert!(!ErrorCode::InvalidInput.is_server_error());
        assert!(ErrorCode::Timeout.is_server_error());
        assert_eq!(ErrorCode::ConnectionFailed.as_str(), "CONNECTION_FAILED");
    }

    #[test]
    fn test_constructors_keep_kind() {
        let err = RpcError::input(ErrorCode::InternalError, "bad");
        assert_eq!(err.code, ErrorCode::InvalidInput);

        let err = RpcError::server(ErrorCode::InvalidField, "bad");
        assert_eq!(err.code, ErrorCode::InternalError);
    }

    #[test]
    fn test_invalid_field_message() {
        let err = RpcError::invalid_field("nope", Some("User"));
        assert!(err.is_input_error());
        assert_eq!(err.message, "Invalid field 'nope' of type 'User'");
        let data = err.data.unwrap();
        assert_eq!(data["field"], "nope");
        assert_eq!(data["type"], "User");
    }

    #[test]
    fn test_error_serialization() {
        let err = RpcError::invalid_method("getNothing");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "INVALID_METHOD");
        assert_eq!(json["message"], "Invalid method: getNothing");
        assert_eq!(json["data"]["method"], "getNothing");
    }

    #[test]
    fn test_result_ext() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));

        let err = result
            .map_rpc_err_with(ErrorCode::HandlerError, "store unavailable")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HandlerError);
        assert_eq!(err.data.unwrap()["cause"], "file not found");
    }
}
