//! Shape descriptors and the type registry.
//!
//! A [`Shape`] describes the structure of an input or output value. Named
//! entity types are registered once in a [`TypeRegistry`] and referenced from
//! shapes by name with [`Shape::Named`], which is what makes them resolvable.

use crate::error::{ErrorCode, RpcError, RpcResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Structural description of a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "of", rename_all = "camelCase")]
pub enum Shape {
    /// Any JSON value.
    Any,
    /// A string.
    String,
    /// Any number.
    Number,
    /// An integral number.
    Integer,
    /// A boolean.
    Boolean,
    /// An RFC 3339 date-time string.
    DateTime,
    /// One of a fixed set of strings.
    Enum(Vec<String>),
    /// The inner shape or null.
    Optional(Box<Shape>),
    /// An array whose elements all have the inner shape.
    Array(Box<Shape>),
    /// An anonymous object with declared fields.
    Object(IndexMap<String, Shape>),
    /// A reference to a type registered in the [`TypeRegistry`].
    Named(String),
}

impl Shape {
    /// Creates an anonymous object shape.
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Shape)>,
        K: Into<String>,
    {
        Self::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Creates an object shape without fields.
    pub fn empty_object() -> Self {
        Self::Object(IndexMap::new())
    }

    /// Creates an array shape.
    pub fn array(inner: Shape) -> Self {
        Self::Array(Box::new(inner))
    }

    /// Creates an optional shape.
    pub fn optional(inner: Shape) -> Self {
        Self::Optional(Box::new(inner))
    }

    /// Creates a reference to a registered type.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Creates an enum shape.
    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enum(values.into_iter().map(Into::into).collect())
    }

    /// Returns true for shapes without structure to traverse.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Any
                | Self::String
                | Self::Number
                | Self::Integer
                | Self::Boolean
                | Self::DateTime
                | Self::Enum(_)
        )
    }

    /// Returns the registered type name, if this shape is a reference.
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            _ => None,
        }
    }

    /// Calls `f` with every type name referenced anywhere in this shape.
    pub fn visit_names<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Self::Named(name) => f(name),
            Self::Optional(inner) | Self::Array(inner) => inner.visit_names(f),
            Self::Object(fields) => {
                for shape in fields.values() {
                    shape.visit_names(f);
                }
            }
            _ => {}
        }
    }

    /// Human-readable name used in validation messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Any => "any".to_string(),
            Self::String => "string".to_string(),
            Self::Number => "number".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::DateTime => "date-time".to_string(),
            Self::Enum(values) => format!("one of [{}]", values.join(", ")),
            Self::Optional(inner) => format!("{} or null", inner.describe()),
            Self::Array(inner) => format!("array of {}", inner.describe()),
            Self::Object(_) => "object".to_string(),
            Self::Named(name) => name.clone(),
        }
    }
}

/// A named, resolvable entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Type name.
    pub name: String,
    /// Declared fields.
    pub fields: IndexMap<String, Shape>,
}

impl TypeDescriptor {
    /// Creates a descriptor without fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: IndexMap::new(),
        }
    }

    /// Adds a declared field.
    pub fn field(mut self, name: impl Into<String>, shape: Shape) -> Self {
        self.fields.insert(name.into(), shape);
        self
    }

    /// Returns the shape of a declared field.
    pub fn get_field(&self, name: &str) -> Option<&Shape> {
        self.fields.get(name)
    }

    /// Returns true if the field is declared.
    pub fn declares(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// Registry of named types.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeRegistry {
    types: IndexMap<String, TypeDescriptor>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type, replacing any previous type with the same name.
    pub fn register(&mut self, descriptor: TypeDescriptor) -> Option<TypeDescriptor> {
        self.types.insert(descriptor.name.clone(), descriptor)
    }

    /// Registers a type and returns self.
    pub fn with_type(mut self, descriptor: TypeDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    /// Gets a type by name.
    pub fn get(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    /// Returns true if the type is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Iterates over the registered types in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.values()
    }

    /// Returns the registered type names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if no type is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Checks that every type referenced by `shape` is registered.
    pub fn check_shape(&self, shape: &Shape, location: &str) -> RpcResult<()> {
        let mut missing = None;
        shape.visit_names(&mut |name| {
            if missing.is_none() && !self.contains(name) {
                missing = Some(name.to_string());
            }
        });
        match missing {
            Some(name) => Err(RpcError::new(
                ErrorCode::InvalidRegistration,
                format!("{location} references unregistered type '{name}'"),
            )
            .with_data("type", name)),
            None => Ok(()),
        }
    }

    /// Checks that the field shapes of every registered type only reference
    /// registered types.
    pub fn validate(&self) -> RpcResult<()> {
        for descriptor in self.types.values() {
            for (field, shape) in &descriptor.fields {
                self.check_shape(shape, &format!("field '{}.{}'", descriptor.name, field))?;
            }
        }
        Ok(())
    }
}

impl FromIterator<TypeDescriptor> for TypeRegistry {
    fn from_iter<I: IntoIterator<Item = TypeDescriptor>>(iter: I) -> Self {
        let mut registry = Self::new();
        for descriptor in iter {
            registry.register(descriptor);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> TypeDescriptor {
        TypeDescriptor::new("User")
            .field("id", Shape::String)
            .field("name", Shape::String)
            .field("teamId", Shape::String)
    }

    #[test]
    fn test_registry_lookup() {
        let registry = TypeRegistry::new().with_type(user());

        let user = registry.get("User").unwrap();
        assert!(user.declares("teamId"));
        assert!(!user.declares("team"));
        assert!(registry.get("Team").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["User"]);
    }

    #[test]
    fn test_check_shape_dangling_reference() {
        let registry = TypeRegistry::new().with_type(user());

        assert!(registry
            .check_shape(&Shape::array(Shape::named("User")), "method 'getUsers'")
            .is_ok());

        let err = registry
            .check_shape(&Shape::optional(Shape::named("Team")), "method 'getTeam'")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRegistration);
        assert!(err.message.contains("'Team'"));
    }

    #[test]
    fn test_validate_nested_fields() {
        let registry = TypeRegistry::new().with_type(
            TypeDescriptor::new("Team").field("owner", Shape::named("Person")),
        );
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_shape_serialization() {
        let shape = Shape::array(Shape::named("User"));
        let json = serde_json::to_value(&shape).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "array", "of": {"type": "named", "of": "User"}})
        );

        let back: Shape = serde_json::from_value(json).unwrap();
        assert_eq!(back, shape);
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            Shape::optional(Shape::array(Shape::Integer)).describe(),
            "array of integer or null"
        );
    }
}
