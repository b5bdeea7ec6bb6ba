//! Wire format.
//!
//! A request body is either one payload object or an array of them:
//!
//! ```json
//! { "method": "getUser", "input": { "id": "1" }, "selection": { "team": 1 } }
//! ```
//!
//! Each payload is answered with `{"result": ..}` or `{"error": ..}`; batches
//! are answered with an array in request order.

use magic_rpc_runtime::{ErrorCode, RpcError, RpcResult, Selection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One method call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcPayload {
    /// Method name.
    #[serde(default)]
    pub method: Option<String>,
    /// Method input. A missing input is sent to object-shaped methods as `{}`.
    #[serde(default)]
    pub input: Value,
    /// Raw selection tree. `mappings` is accepted as a legacy alias.
    #[serde(default, alias = "mappings", skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
}

impl RpcPayload {
    /// Creates a payload for `method` with an empty input.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            input: Value::Object(Default::default()),
            selection: None,
        }
    }

    /// Sets the input.
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Sets the selection.
    pub fn selection(mut self, selection: &Selection) -> Self {
        self.selection = Some(selection.to_value());
        self
    }

    /// Sets the selection from its JSON form.
    pub fn selection_value(mut self, selection: Value) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Decodes one payload from JSON. Malformed payloads are `INVALID_PAYLOAD`.
    pub fn from_value(value: Value) -> RpcResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            RpcError::new(ErrorCode::InvalidPayload, format!("Invalid payload: {e}"))
        })
    }

    /// Parses the selection. A `null` selection counts as absent.
    pub fn parse_selection(&self) -> RpcResult<Option<Selection>> {
        match &self.selection {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Selection::parse(value.clone()).map(Some),
        }
    }
}

/// A request body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RpcRequest {
    /// A batch of payloads, decoded one by one with [`RpcPayload::from_value`]
    /// so that a malformed entry fails on its own.
    Batch(Vec<Value>),
    /// A single payload.
    Single(RpcPayload),
}

/// The answer to one payload.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RpcResponse {
    /// The method succeeded.
    Result {
        /// Method output.
        result: Value,
    },
    /// The method failed.
    Error {
        /// The error.
        error: RpcError,
    },
}

impl RpcResponse {
    /// Returns the result, if the call succeeded.
    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Result { result } => Some(result),
            Self::Error { .. } => None,
        }
    }

    /// Returns the error, if the call failed.
    pub fn error(&self) -> Option<&RpcError> {
        match self {
            Self::Result { .. } => None,
            Self::Error { error } => Some(error),
        }
    }
}

impl From<RpcResult<Value>> for RpcResponse {
    fn from(result: RpcResult<Value>) -> Self {
        match result {
            Ok(result) => Self::Result { result },
            Err(error) => Self::Error { error },
        }
    }
}
