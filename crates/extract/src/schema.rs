//! Entity and relation type vocabularies.
//!
//! Extraction models do not reliably stay inside a suggested vocabulary, so
//! unknown types are bucketed under [`FALLBACK_TYPE`] instead of being dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Type assigned to anything outside the configured vocabulary.
pub const FALLBACK_TYPE: &str = "Other";

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("schema needs at least one entity type")]
    EmptyEntityTypes,
    #[error("schema needs at least one relation type")]
    EmptyRelationTypes,
    #[error("field `{0}` is declared more than once")]
    DuplicateField(String),
    #[error("enum field `{0}` has no allowed values")]
    EmptyEnum(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "values")]
pub enum FieldKind {
    Text,
    Enum(Vec<String>),
}

/// Extra attribute the extractor may fill in for a document, entity or relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub description: String,
}

impl FieldSpec {
    pub fn text(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Text,
            description: description.to_string(),
        }
    }

    pub fn enumeration(name: &str, values: &[&str], description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Enum(values.iter().map(|v| v.to_string()).collect()),
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldValue {
    Text(String),
    Tag(String),
}

impl FieldValue {
    pub fn as_str(&self) -> &str {
        match self {
            FieldValue::Text(s) | FieldValue::Tag(s) => s,
        }
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    entity_types: Vec<String>,
    relation_types: Vec<String>,
    document_fields: Vec<FieldSpec>,
    entity_fields: Vec<FieldSpec>,
    relation_fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn define<E, R>(entity_types: E, relation_types: R) -> Result<Self, SchemaError>
    where
        E: IntoIterator,
        E::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let entity_types = dedup(entity_types.into_iter().map(Into::into));
        let relation_types = dedup(relation_types.into_iter().map(Into::into));

        if entity_types.is_empty() {
            return Err(SchemaError::EmptyEntityTypes);
        }
        if relation_types.is_empty() {
            return Err(SchemaError::EmptyRelationTypes);
        }

        Ok(Self {
            entity_types,
            relation_types,
            document_fields: Vec::new(),
            entity_fields: Vec::new(),
            relation_fields: Vec::new(),
        })
    }

    pub fn with_document_fields(mut self, fields: Vec<FieldSpec>) -> Result<Self, SchemaError> {
        self.document_fields = validate_fields(fields)?;
        Ok(self)
    }

    pub fn with_entity_fields(mut self, fields: Vec<FieldSpec>) -> Result<Self, SchemaError> {
        self.entity_fields = validate_fields(fields)?;
        Ok(self)
    }

    pub fn with_relation_fields(mut self, fields: Vec<FieldSpec>) -> Result<Self, SchemaError> {
        self.relation_fields = validate_fields(fields)?;
        Ok(self)
    }

    pub fn entity_types(&self) -> &[String] {
        &self.entity_types
    }

    pub fn relation_types(&self) -> &[String] {
        &self.relation_types
    }

    pub fn document_fields(&self) -> &[FieldSpec] {
        &self.document_fields
    }

    pub fn entity_fields(&self) -> &[FieldSpec] {
        &self.entity_fields
    }

    pub fn relation_fields(&self) -> &[FieldSpec] {
        &self.relation_fields
    }

    pub fn is_valid_entity_type(&self, entity_type: &str) -> bool {
        self.entity_types.iter().any(|t| t == entity_type)
    }

    pub fn is_valid_relation_type(&self, relation_type: &str) -> bool {
        self.relation_types.iter().any(|t| t == relation_type)
    }

    pub fn normalize_entity_type(&self, entity_type: &str) -> String {
        if self.is_valid_entity_type(entity_type) {
            entity_type.to_string()
        } else {
            FALLBACK_TYPE.to_string()
        }
    }

    pub fn normalize_relation_type(&self, relation_type: &str) -> String {
        if self.is_valid_relation_type(relation_type) {
            relation_type.to_string()
        } else {
            FALLBACK_TYPE.to_string()
        }
    }

    /// Keep only declared fields with usable values. Enum values match
    /// case-insensitively and are stored with the declared spelling.
    pub fn normalize_fields(specs: &[FieldSpec], raw: &Map<String, Value>) -> Fields {
        let mut fields = Fields::new();

        for spec in specs {
            let Some(value) = raw.get(&spec.name) else {
                continue;
            };
            let text = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            if text.is_empty() {
                continue;
            }

            match &spec.kind {
                FieldKind::Text => {
                    fields.insert(spec.name.clone(), FieldValue::Text(text));
                }
                FieldKind::Enum(allowed) => {
                    if let Some(tag) = allowed.iter().find(|a| a.eq_ignore_ascii_case(&text)) {
                        fields.insert(spec.name.clone(), FieldValue::Tag(tag.clone()));
                    }
                }
            }
        }

        fields
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            entity_types: [
                "Person", "Organization", "Location", "Concept", "Technology", "Event",
                "Service", "Database", "Component",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            relation_types: [
                "USES", "DEPENDS_ON", "CALLS", "CONTAINS", "PART_OF", "CREATES", "READS_FROM",
                "WRITES_TO", "RELATED_TO",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            document_fields: Vec::new(),
            entity_fields: Vec::new(),
            relation_fields: Vec::new(),
        }
    }
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

fn validate_fields(fields: Vec<FieldSpec>) -> Result<Vec<FieldSpec>, SchemaError> {
    let mut seen = HashSet::new();
    for field in &fields {
        if !seen.insert(field.name.as_str()) {
            return Err(SchemaError::DuplicateField(field.name.clone()));
        }
        if let FieldKind::Enum(values) = &field.kind {
            if values.is_empty() {
                return Err(SchemaError::EmptyEnum(field.name.clone()));
            }
        }
    }
    Ok(fields)
}
