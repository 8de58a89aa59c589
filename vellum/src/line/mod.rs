// Line - the schema-shaped, ephemeral document assembled from records,
// links and computed fields. Never stored verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An assembled document: an ordered mapping of field name to tagged value.
/// Reserved keys: `id`, `type`, `_is` (false marks a deletion), `_adopt`
/// and `_disown` (explicit child connect/disconnect requests).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Line(pub Map<String, Value>);

impl Line {
    pub fn new() -> Self {
        Line(Map::new())
    }

    /// Build a line from a JSON value; non-objects are rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Line(map)),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: &str) {
        self.set("id", Value::String(id.to_string()));
    }

    pub fn linetype(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// A line is "alive" unless it carries `_is: false` - the deletion marker.
    pub fn is_alive(&self) -> bool {
        !matches!(self.0.get("_is"), Some(Value::Bool(false)))
    }

    /// Whether the line carries nothing beyond its identity. Payloads that
    /// are identity-only represent no effective change.
    pub fn is_identity_only(&self) -> bool {
        self.0.keys().all(|key| key == "id" || key == "type")
    }

    /// The value of `property` interpreted as an array of child lines,
    /// if it is an array of objects.
    pub fn child_lines(&self, property: &str) -> Option<Vec<Line>> {
        let array = self.0.get(property)?.as_array()?;
        let mut lines = Vec::with_capacity(array.len());
        for value in array {
            lines.push(Line::from_value(value.clone())?);
        }
        Some(lines)
    }
}

/// Scalars are the only values a record field may hold.
pub fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}
