use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::schema::{EntityType, FieldKind};

/// A single field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Json(serde_json::Value),
    Vector(Vec<f32>),
    Keyword(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text content of a text or keyword value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) | Value::Keyword(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bool(_) => "bool",
            Value::Json(_) => "json",
            Value::Vector(_) => "vector",
            Value::Keyword(_) => "keyword",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Vector(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Entity is one row of an entity type. `id` is unset until the row is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Keyword fields take text as well; the kind is checked against the schema on persist
    pub fn with_keyword(mut self, field: impl Into<String>, text: impl Into<String>) -> Self {
        self.fields.insert(field.into(), Value::Keyword(text.into()));
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Identity of a persisted row
    pub fn id(&self) -> Result<i64> {
        self.id.ok_or_else(|| {
            Error::invalid_value(&self.table, "id", "entity has not been persisted")
        })
    }

    fn require(&self, field: &str) -> Result<&Value> {
        self.fields
            .get(field)
            .ok_or_else(|| Error::invalid_value(&self.table, field, "missing"))
    }

    fn mismatch(&self, field: &str, expected: &str, got: &Value) -> Error {
        Error::invalid_value(
            &self.table,
            field,
            format!("expected {}, got {}", expected, got.kind_name()),
        )
    }

    pub fn text(&self, field: &str) -> Result<&str> {
        let value = self.require(field)?;
        value
            .as_str()
            .ok_or_else(|| self.mismatch(field, "text", value))
    }

    pub fn integer(&self, field: &str) -> Result<i64> {
        let value = self.require(field)?;
        value
            .as_i64()
            .ok_or_else(|| self.mismatch(field, "integer", value))
    }

    pub fn float(&self, field: &str) -> Result<f64> {
        let value = self.require(field)?;
        value
            .as_f64()
            .ok_or_else(|| self.mismatch(field, "float", value))
    }

    pub fn vector(&self, field: &str) -> Result<&[f32]> {
        let value = self.require(field)?;
        value
            .as_vector()
            .ok_or_else(|| self.mismatch(field, "vector", value))
    }

    /// Check every field against `ty`. Runs before any write so a bad row never lands.
    pub fn validate(&self, ty: &EntityType) -> Result<()> {
        if self.table != ty.name() {
            return Err(Error::EntityTypeMismatch {
                expected: ty.name().to_string(),
                actual: self.table.clone(),
            });
        }

        for (name, value) in &self.fields {
            let def = ty
                .field(name)
                .ok_or_else(|| Error::invalid_value(ty.name(), name, "unknown field"))?;

            let ok = match (&def.kind, value) {
                (_, Value::Null) => true,
                (FieldKind::PrimaryKey, _) => {
                    return Err(Error::invalid_value(
                        ty.name(),
                        name,
                        "identity is assigned on persistence",
                    ))
                }
                (FieldKind::Vector { dim }, Value::Vector(v)) => {
                    if v.len() != *dim {
                        return Err(Error::DimensionMismatch {
                            table: ty.name().to_string(),
                            field: name.clone(),
                            expected: *dim,
                            actual: v.len(),
                        });
                    }
                    true
                }
                (FieldKind::Integer, Value::Integer(_)) => true,
                (FieldKind::Float, Value::Float(_) | Value::Integer(_)) => true,
                (FieldKind::Text, Value::Text(_)) => true,
                (FieldKind::Keyword, Value::Keyword(_) | Value::Text(_)) => true,
                (FieldKind::Bool, Value::Bool(_)) => true,
                (FieldKind::Json, _) => true,
                _ => false,
            };

            if !ok {
                return Err(Error::invalid_value(
                    ty.name(),
                    name,
                    format!("{} value for a {:?} field", value.kind_name(), def.kind),
                ));
            }
        }

        Ok(())
    }
}
