//! Shape validation, coercion and masking.
//!
//! The dispatcher only talks to the [`Validator`] trait. [`ShapeValidator`] is
//! the default implementation: it checks values against [`Shape`]s, optionally
//! coerces loosely typed input, and masks output down to declared fields.
//!
//! Relation fields registered in the resolver table are part of a named
//! type's output surface, so the validator accepts and keeps them (as nullable
//! values of the relation's declared shape) even though the raw type does not
//! declare them.

use crate::error::{ErrorCode, RpcError};
use crate::resolver::ResolverTable;
use crate::schema::{Shape, TypeRegistry};
use chrono::{DateTime, SecondsFormat};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::sync::Arc;

/// A validation failure at a specific path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    /// Path of the offending value, e.g. `team.members[1].id`.
    pub path: String,
    /// Human-readable error message.
    pub message: String,
    /// Machine-readable error code.
    pub code: ValidationErrorCode,
}

impl ValidationError {
    /// Creates a new validation error.
    pub fn new(
        path: impl Into<String>,
        code: ValidationErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validation error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorCode {
    /// Value is required but missing.
    Required,
    /// Value has the wrong JSON type.
    InvalidType,
    /// Value has the right type but an invalid format.
    InvalidFormat,
    /// Value is not one of the allowed enum values.
    NotInEnum,
    /// Object has a key its shape does not declare.
    UnknownField,
    /// Shape references a type that is not registered.
    UnknownType,
}

impl fmt::Display for ValidationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => write!(f, "REQUIRED"),
            Self::InvalidType => write!(f, "INVALID_TYPE"),
            Self::InvalidFormat => write!(f, "INVALID_FORMAT"),
            Self::NotInEnum => write!(f, "NOT_IN_ENUM"),
            Self::UnknownField => write!(f, "UNKNOWN_FIELD"),
            Self::UnknownType => write!(f, "UNKNOWN_TYPE"),
        }
    }
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationErrors>;

/// Collection of validation errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationErrors {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
}

impl ValidationErrors {
    /// Creates an empty error collection.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Adds an error.
    pub fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Returns true if there are any errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns errors for a specific path.
    pub fn for_path(&self, path: &str) -> Vec<&ValidationError> {
        self.errors.iter().filter(|e| e.path == path).collect()
    }

    /// Converts into an RPC error with the given code and message prefix.
    pub fn into_rpc_error(self, code: ErrorCode, prefix: &str) -> RpcError {
        RpcError::new(code, format!("{prefix}: {self}")).with_data("errors", &self.errors)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<_> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationError> for ValidationErrors {
    fn from(error: ValidationError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

/// Options for [`Validator::validate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Convert loosely typed values into the declared shape where possible.
    pub coerce: bool,
}

impl ValidateOptions {
    /// Options with coercion enabled.
    pub fn coerce() -> Self {
        Self { coerce: true }
    }

    /// Options with coercion disabled.
    pub fn strict() -> Self {
        Self { coerce: false }
    }
}

/// Validator contract consumed by the dispatcher.
pub trait Validator: Send + Sync {
    /// Validates `value` against `shape`, returning the (possibly coerced) value.
    fn validate(
        &self,
        value: Value,
        shape: &Shape,
        options: ValidateOptions,
    ) -> ValidationResult<Value>;

    /// Strips keys that `shape` does not declare.
    fn mask(&self, value: Value, shape: &Shape) -> Value;
}

/// The default [`Validator`] over registered types and relation fields.
#[derive(Debug, Clone, Default)]
pub struct ShapeValidator {
    types: Arc<TypeRegistry>,
    relations: FxHashMap<String, IndexMap<String, Shape>>,
}

impl ShapeValidator {
    /// Creates a validator over the given types.
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self {
            types,
            relations: FxHashMap::default(),
        }
    }

    /// Accepts the relation fields of `resolvers` on their types.
    pub fn with_relations(mut self, resolvers: &ResolverTable) -> Self {
        for (type_name, field, shape) in resolvers.relations() {
            self.relations
                .entry(type_name.to_string())
                .or_default()
                .insert(field.to_string(), shape.clone());
        }
        self
    }

    fn check(
        &self,
        value: Value,
        shape: &Shape,
        path: &str,
        coerce: bool,
        errors: &mut ValidationErrors,
    ) -> Value {
        match shape {
            Shape::Any => value,
            Shape::String => match value {
                Value::String(_) => value,
                Value::Number(n) if coerce => Value::String(n.to_string()),
                Value::Bool(b) if coerce => Value::String(b.to_string()),
                other => mismatch(other, shape, path, errors),
            },
            Shape::Number => match value {
                Value::Number(_) => value,
                Value::String(ref s) if coerce => match parse_number(s) {
                    Some(n) => Value::Number(n),
                    None => mismatch(value, shape, path, errors),
                },
                other => mismatch(other, shape, path, errors),
            },
            Shape::Integer => match value {
                Value::Number(ref n) if n.is_i64() || n.is_u64() => value,
                Value::Number(ref n) if coerce => match n.as_f64().and_then(integral) {
                    Some(i) => Value::from(i),
                    None => mismatch(value, shape, path, errors),
                },
                Value::String(ref s) if coerce => match s.trim().parse::<i64>() {
                    Ok(i) => Value::from(i),
                    Err(_) => mismatch(value, shape, path, errors),
                },
                other => mismatch(other, shape, path, errors),
            },
            Shape::Boolean => match value {
                Value::Bool(_) => value,
                Value::String(ref s) if coerce && (s == "true" || s == "false") => {
                    Value::Bool(s == "true")
                }
                other => mismatch(other, shape, path, errors),
            },
            Shape::DateTime => match value {
                Value::String(ref s) => {
                    if DateTime::parse_from_rfc3339(s).is_err() {
                        errors.push(ValidationError::new(
                            path,
                            ValidationErrorCode::InvalidFormat,
                            format!("expected an RFC 3339 date-time, got \"{s}\""),
                        ));
                    }
                    value
                }
                Value::Number(ref n) if coerce => {
                    match n.as_i64().and_then(DateTime::from_timestamp_millis) {
                        Some(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                        None => mismatch(value, shape, path, errors),
                    }
                }
                other => mismatch(other, shape, path, errors),
            },
            Shape::Enum(values) => {
                if !value.as_str().is_some_and(|s| values.iter().any(|v| v == s)) {
                    errors.push(ValidationError::new(
                        path,
                        ValidationErrorCode::NotInEnum,
                        format!("expected {}, got {}", shape.describe(), value),
                    ));
                }
                value
            }
            Shape::Optional(inner) => match value {
                Value::Null => Value::Null,
                other => self.check(other, inner, path, coerce, errors),
            },
            Shape::Array(inner) => match value {
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, item)| {
                            self.check(item, inner, &format!("{path}[{i}]"), coerce, errors)
                        })
                        .collect(),
                ),
                other => mismatch(other, shape, path, errors),
            },
            Shape::Object(fields) => self.check_object(value, shape, fields, None, path, coerce, errors),
            Shape::Named(name) => match self.types.get(name) {
                Some(descriptor) => self.check_object(
                    value,
                    shape,
                    &descriptor.fields,
                    self.relations.get(name),
                    path,
                    coerce,
                    errors,
                ),
                None => {
                    errors.push(ValidationError::new(
                        path,
                        ValidationErrorCode::UnknownType,
                        format!("unknown type '{name}'"),
                    ));
                    value
                }
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_object(
        &self,
        value: Value,
        shape: &Shape,
        fields: &IndexMap<String, Shape>,
        relations: Option<&IndexMap<String, Shape>>,
        path: &str,
        coerce: bool,
        errors: &mut ValidationErrors,
    ) -> Value {
        let map = match value {
            Value::Object(map) => map,
            other => return mismatch(other, shape, path, errors),
        };

        let mut result = Map::with_capacity(map.len());
        for (key, item) in map {
            let child = child_path(path, &key);
            if let Some(relation) = relations.and_then(|r| r.get(&key)) {
                let item = match item {
                    Value::Null => Value::Null,
                    other => self.check(other, relation, &child, coerce, errors),
                };
                result.insert(key, item);
            } else if let Some(field_shape) = fields.get(&key) {
                let item = self.check(item, field_shape, &child, coerce, errors);
                result.insert(key, item);
            } else {
                errors.push(ValidationError::new(
                    child,
                    ValidationErrorCode::UnknownField,
                    "unknown field",
                ));
            }
        }

        for (key, field_shape) in fields {
            if !result.contains_key(key) && !matches!(field_shape, Shape::Optional(_) | Shape::Any)
            {
                errors.push(ValidationError::new(
                    child_path(path, key),
                    ValidationErrorCode::Required,
                    format!("expected {}, got nothing", field_shape.describe()),
                ));
            }
        }

        Value::Object(result)
    }

    fn mask_object(
        &self,
        map: Map<String, Value>,
        fields: &IndexMap<String, Shape>,
        relations: Option<&IndexMap<String, Shape>>,
    ) -> Value {
        Value::Object(
            map.into_iter()
                .filter_map(|(key, item)| {
                    let shape = relations
                        .and_then(|r| r.get(&key))
                        .or_else(|| fields.get(&key))?;
                    let item = self.mask(item, shape);
                    Some((key, item))
                })
                .collect(),
        )
    }
}

impl Validator for ShapeValidator {
    fn validate(
        &self,
        value: Value,
        shape: &Shape,
        options: ValidateOptions,
    ) -> ValidationResult<Value> {
        let mut errors = ValidationErrors::new();
        let value = self.check(value, shape, "", options.coerce, &mut errors);
        if errors.has_errors() {
            Err(errors)
        } else {
            Ok(value)
        }
    }

    fn mask(&self, value: Value, shape: &Shape) -> Value {
        match (shape, value) {
            (Shape::Optional(inner), value) => self.mask(value, inner),
            (Shape::Array(inner), Value::Array(items)) => {
                Value::Array(items.into_iter().map(|item| self.mask(item, inner)).collect())
            }
            (Shape::Object(fields), Value::Object(map)) => self.mask_object(map, fields, None),
            (Shape::Named(name), Value::Object(map)) => match self.types.get(name) {
                Some(descriptor) => {
                    self.mask_object(map, &descriptor.fields, self.relations.get(name))
                }
                None => Value::Object(map),
            },
            (_, value) => value,
        }
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(value: Value, shape: &Shape, path: &str, errors: &mut ValidationErrors) -> Value {
    errors.push(ValidationError::new(
        path,
        ValidationErrorCode::InvalidType,
        format!("expected {}, got {}", shape.describe(), kind_of(&value)),
    ));
    value
}

fn parse_number(s: &str) -> Option<Number> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::from(i));
    }
    s.parse::<f64>().ok().and_then(Number::from_f64)
}

fn integral(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}
