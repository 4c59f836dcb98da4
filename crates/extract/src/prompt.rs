use crate::schema::{FieldKind, FieldSpec, Schema};

/// Upper bound on known entity names sent along for coreference.
pub const MAX_KNOWN_ENTITIES: usize = 200;

pub fn build_extraction_prompt(chunk_text: &str, known_entities: &[String], schema: &Schema) -> String {
    let known = if known_entities.is_empty() {
        "(none yet)".to_string()
    } else {
        known_entities
            .iter()
            .take(MAX_KNOWN_ENTITIES)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        r#"Extract entities and relationships from the following text.

INSTRUCTIONS:
1. Identify key entities of the allowed types
2. Extract relationships between entities
3. Output ONLY valid JSON, nothing else
4. Use the exact schema below

SCHEMA:
{{
  "entities": [
    {{"name": "EntityName", "type": "{entity_types}", "description": "brief description"{entity_fields}}}
  ],
  "relations": [
    {{"source": "EntityName", "target": "OtherEntity", "type": "{relation_types}", "description": "how they relate", "keywords": ["short", "topic", "words"]{relation_fields}}}
  ]
}}

RULES:
- Entity types should be one of: {entity_list}
- Relation types should be one of: {relation_list}
- "source" and "target" must be entity names, not ids
- If an entity matches one of the KNOWN ENTITIES, reuse that exact name
- Output ONLY the JSON object, no markdown, no explanations

KNOWN ENTITIES:
{known}

TEXT:
{text}

JSON OUTPUT:"#,
        entity_types = schema.entity_types().join("|"),
        relation_types = schema.relation_types().join("|"),
        entity_fields = describe_fields(schema.entity_fields()),
        relation_fields = describe_fields(schema.relation_fields()),
        entity_list = schema.entity_types().join(", "),
        relation_list = schema.relation_types().join(", "),
        known = known,
        text = chunk_text,
    )
}

fn describe_fields(fields: &[FieldSpec]) -> String {
    if fields.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = fields
        .iter()
        .map(|field| {
            let hint = match &field.kind {
                FieldKind::Text => field.description.clone(),
                FieldKind::Enum(values) => values.join("|"),
            };
            format!("\"{}\": \"{}\"", field.name, hint)
        })
        .collect();

    format!(", \"fields\": {{{}}}", parts.join(", "))
}
