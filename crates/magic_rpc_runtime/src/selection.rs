//! Field selection trees.
//!
//! A selection names the relation fields of a result that should be expanded.
//! On the wire it is a JSON object whose values are either `1`/`true` (select
//! the field) or a nested object (select the field and expand its own fields):
//!
//! ```json
//! { "team": { "leader": 1, "members": { "team": 1 } } }
//! ```

use crate::error::{ErrorCode, RpcError, RpcResult};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::sync::OnceLock;

/// A single entry of a selection tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    /// Select this field without further nesting.
    Leaf,
    /// Select this field and apply the nested selection to its value.
    Nested(Selection),
}

impl FieldSelection {
    /// Returns the nested selection, empty for leaves.
    pub fn children(&self) -> &Selection {
        static EMPTY: OnceLock<Selection> = OnceLock::new();
        match self {
            Self::Leaf => EMPTY.get_or_init(Selection::new),
            Self::Nested(selection) => selection,
        }
    }

    fn from_value(value: Value, path: &str) -> RpcResult<Self> {
        match value {
            Value::Bool(true) | Value::Number(_) => Ok(Self::Leaf),
            Value::Object(_) => Selection::parse_at(value, path).map(Self::Nested),
            other => Err(RpcError::new(
                ErrorCode::InvalidSelection,
                format!("Invalid selection for '{path}': expected 1, true or an object, got {other}"),
            )
            .with_data("path", path)),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Leaf => Value::from(1),
            Self::Nested(selection) => selection.to_value(),
        }
    }
}

/// A mapping from field name to [`FieldSelection`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    fields: IndexMap<String, FieldSelection>,
}

impl Selection {
    /// Creates an empty selection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a selection from its JSON form.
    pub fn parse(value: Value) -> RpcResult<Self> {
        Self::parse_at(value, "")
    }

    fn parse_at(value: Value, prefix: &str) -> RpcResult<Self> {
        let Value::Object(map) = value else {
            return Err(RpcError::new(
                ErrorCode::InvalidSelection,
                "Invalid selection: expected an object",
            ));
        };

        let mut fields = IndexMap::with_capacity(map.len());
        for (key, value) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            let entry = FieldSelection::from_value(value, &path)?;
            fields.insert(key, entry);
        }
        Ok(Self { fields })
    }

    /// Adds a leaf field.
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), FieldSelection::Leaf);
        self
    }

    /// Adds a field with a nested selection.
    pub fn nested(mut self, name: impl Into<String>, selection: Selection) -> Self {
        self.fields
            .insert(name.into(), FieldSelection::Nested(selection));
        self
    }

    /// Gets the entry for a field.
    pub fn get(&self, name: &str) -> Option<&FieldSelection> {
        self.fields.get(name)
    }

    /// Returns true if the field is selected.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Iterates over the selected fields.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSelection)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of selected fields at this level.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if nothing is selected.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the depth of the deepest branch.
    pub fn depth(&self) -> usize {
        self.fields
            .values()
            .map(|entry| 1 + entry.children().depth())
            .max()
            .unwrap_or(0)
    }

    /// Converts back to the JSON form.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }
}

impl Serialize for Selection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Selection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::parse(value).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<Value> for Selection {
    type Error = RpcError;

    fn try_from(value: Value) -> RpcResult<Self> {
        Self::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_nested() {
        let selection =
            Selection::parse(json!({"team": {"leader": 1, "members": {"team": true}}})).unwrap();

        let team = selection.get("team").unwrap().children();
        assert!(team.contains("leader"));
        assert_eq!(team.get("leader"), Some(&FieldSelection::Leaf));
        assert!(team.get("members").unwrap().children().contains("team"));
        assert_eq!(selection.depth(), 3);
    }

    #[test]
    fn test_parse_rejects_invalid_entries() {
        let err = Selection::parse(json!({"team": {"leader": "yes"}})).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSelection);
        assert!(err.message.contains("team.leader"));

        assert!(Selection::parse(json!([1, 2])).is_err());
        assert!(Selection::parse(json!({"team": false})).is_err());
    }

    #[test]
    fn test_builder_matches_parsed() {
        let built = Selection::new().nested("team", Selection::new().field("leader"));
        let parsed = Selection::parse(json!({"team": {"leader": 1}})).unwrap();
        assert_eq!(built, parsed);
        assert_eq!(built.to_value(), json!({"team": {"leader": 1}}));
    }

    #[test]
    fn test_deserialize() {
        let selection: Selection = serde_json::from_str(r#"{"team": 1}"#).unwrap();
        assert_eq!(selection.len(), 1);
        assert!(serde_json::from_str::<Selection>(r#"{"team": null}"#).is_err());
    }

    #[test]
    fn test_leaf_children_is_empty() {
        assert!(FieldSelection::Leaf.children().is_empty());
        assert_eq!(Selection::new().depth(), 0);
    }
}
