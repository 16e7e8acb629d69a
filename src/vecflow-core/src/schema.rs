use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// Prefix reserved for the store's bookkeeping tables
pub const RESERVED_PREFIX: &str = "_vecflow";

/// Column kind of a declared field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Auto-increasing identity, assigned on first persistence
    PrimaryKey,
    Integer,
    Float,
    Text,
    Bool,
    Json,
    /// Dense vector of a fixed dimension, used for similarity search
    Vector { dim: usize },
    /// Text backed by a full-text index, used for lexical search
    Keyword,
}

impl FieldKind {
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldKind::PrimaryKey => "INTEGER PRIMARY KEY AUTOINCREMENT",
            FieldKind::Integer | FieldKind::Bool => "INTEGER",
            FieldKind::Float => "REAL",
            FieldKind::Text | FieldKind::Json | FieldKind::Keyword => "TEXT",
            FieldKind::Vector { .. } => "BLOB",
        }
    }
}

/// A named reference from a field to another type's identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKey>,
}

/// EntityType is the declared, immutable schema of one persisted relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    name: String,
    fields: Vec<FieldDef>,
}

impl EntityType {
    pub fn builder(name: impl Into<String>) -> EntityTypeBuilder {
        EntityTypeBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Name of the identity field
    pub fn primary_key(&self) -> &str {
        self.fields
            .iter()
            .find(|f| f.kind == FieldKind::PrimaryKey)
            .map(|f| f.name.as_str())
            .unwrap_or_default()
    }

    /// Fields other than the identity, in declaration order
    pub fn data_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.kind != FieldKind::PrimaryKey)
    }

    pub fn vector_field(&self) -> Option<(&str, usize)> {
        self.fields.iter().find_map(|f| match f.kind {
            FieldKind::Vector { dim } => Some((f.name.as_str(), dim)),
            _ => None,
        })
    }

    pub fn keyword_field(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.kind == FieldKind::Keyword)
            .map(|f| f.name.as_str())
    }

    /// Foreign-key fields whose target is `table`
    pub fn foreign_keys_to<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields.iter().filter_map(move |f| match &f.foreign_key {
            Some(fk) if fk.table == table => Some(f.name.as_str()),
            _ => None,
        })
    }

    /// Name of the FTS5 table backing the keyword field
    pub fn fts_table(&self) -> String {
        format!("{}_fts", self.name)
    }
}

pub struct EntityTypeBuilder {
    name: String,
    fields: Vec<FieldDef>,
}

impl EntityTypeBuilder {
    fn push(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind,
            foreign_key: None,
        });
        self
    }

    pub fn primary_key(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::PrimaryKey)
    }

    pub fn integer(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Integer)
    }

    pub fn float(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Float)
    }

    pub fn text(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Text)
    }

    pub fn boolean(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Bool)
    }

    pub fn json(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Json)
    }

    pub fn vector(self, name: impl Into<String>, dim: usize) -> Self {
        self.push(name, FieldKind::Vector { dim })
    }

    pub fn keyword(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Keyword)
    }

    /// Integer field referencing the identity of `table`
    pub fn foreign_key(mut self, name: impl Into<String>, table: impl Into<String>) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind: FieldKind::Integer,
            foreign_key: Some(ForeignKey {
                table: table.into(),
            }),
        });
        self
    }

    pub fn build(self) -> Result<EntityType> {
        validate_identifier(&self.name)?;

        let mut seen = HashSet::new();
        let mut primary_keys = 0;
        let mut vectors = 0;
        let mut keywords = 0;

        for field in &self.fields {
            validate_identifier(&field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "duplicate field `{}` in `{}`",
                    field.name, self.name
                )));
            }
            match field.kind {
                FieldKind::PrimaryKey => primary_keys += 1,
                FieldKind::Vector { dim: 0 } => {
                    return Err(Error::InvalidSchema(format!(
                        "vector field `{}.{}` must have a positive dimension",
                        self.name, field.name
                    )))
                }
                FieldKind::Vector { .. } => vectors += 1,
                FieldKind::Keyword => keywords += 1,
                _ => {}
            }
            if let Some(fk) = &field.foreign_key {
                validate_identifier(&fk.table)?;
            }
        }

        if primary_keys != 1 {
            return Err(Error::InvalidSchema(format!(
                "`{}` must declare exactly one primary key, found {}",
                self.name, primary_keys
            )));
        }
        if vectors > 1 || keywords > 1 {
            return Err(Error::InvalidSchema(format!(
                "`{}` may declare at most one vector and one keyword field",
                self.name
            )));
        }

        Ok(EntityType {
            name: self.name,
            fields: self.fields,
        })
    }
}

/// Identifiers are interpolated into SQL, so only a safe subset is accepted
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && !name.starts_with(RESERVED_PREFIX)
        && !name.to_ascii_lowercase().starts_with("sqlite_");

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSchema(format!("invalid identifier `{}`", name)))
    }
}
