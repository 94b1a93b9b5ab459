//! Versioned record-schema documents.
//!
//! Schemas use the Avro JSON schema vocabulary (`record`, `array`, `map`,
//! unions, primitive names, `logicalType`) and are loaded from a path at
//! startup. Payloads are checked structurally against the schema before any
//! typed decoding; unknown fields, missing required fields and type
//! mismatches all fail.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;

/// The brokerClassification schema the pipeline ships with.
pub const BUNDLED_CLASSIFICATION_SCHEMA: &str =
    include_str!("../../schema/elasticc.v0_9_1.brokerClassification.avsc");

/// A field type.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SchemaType {
    Named(String),
    Union(Vec<SchemaType>),
    Complex(Box<ComplexType>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexType {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub logical_type: Option<String>,
    #[serde(default)]
    pub items: Option<SchemaType>,
    #[serde(default)]
    pub values: Option<SchemaType>,
    #[serde(default)]
    pub fields: Vec<SchemaField>,
    #[serde(default)]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: SchemaType,
    #[serde(default)]
    pub default: Option<Value>,
}

/// Top-level schema document: a named, versioned record.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDocument {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub fields: Vec<SchemaField>,
}

impl fmt::Display for SchemaDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{ns}.")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(v) = &self.version {
            write!(f, " v{v}")?;
        }
        Ok(())
    }
}

/// Why a schema document could not be used.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("cannot read schema {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("schema document is not valid: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("top-level schema must be a record, found '{0}'")]
    NotARecord(String),
}

impl SchemaDocument {
    pub fn from_json(raw: &str) -> Result<Self, SchemaError> {
        let doc: Self = serde_json::from_str(raw)?;
        if doc.kind != "record" {
            return Err(SchemaError::NotARecord(doc.kind));
        }
        Ok(doc)
    }

    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn bundled() -> Self {
        // The bundled document is a compile-time constant covered by tests.
        #[allow(clippy::expect_used)]
        Self::from_json(BUNDLED_CLASSIFICATION_SCHEMA).expect("bundled schema parses")
    }

    /// Check `value` against this schema. The error names the first
    /// offending path.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        check_record(value, &self.fields, "$")
    }
}

fn check_record(value: &Value, fields: &[SchemaField], path: &str) -> Result<(), String> {
    let Value::Object(map) = value else {
        return Err(format!("{path}: expected record, found {}", kind_of(value)));
    };

    for field in fields {
        let field_path = format!("{path}.{}", field.name);
        match map.get(&field.name) {
            Some(v) => check(v, &field.ty, &field_path)?,
            None if field.default.is_some() || admits_null(&field.ty) => {}
            None => return Err(format!("{field_path}: required field missing")),
        }
    }

    if let Some(extra) = map.keys().find(|k| !fields.iter().any(|f| &f.name == *k)) {
        return Err(format!("{path}.{extra}: field not in schema"));
    }

    Ok(())
}

fn check(value: &Value, ty: &SchemaType, path: &str) -> Result<(), String> {
    match ty {
        SchemaType::Named(name) => check_primitive(value, name, path),
        SchemaType::Union(variants) => {
            if variants.iter().any(|v| check(value, v, path).is_ok()) {
                Ok(())
            } else {
                Err(format!("{path}: {} matches no union branch", kind_of(value)))
            }
        }
        SchemaType::Complex(complex) => match complex.kind.as_str() {
            "record" => check_record(value, &complex.fields, path),
            "array" => {
                let Value::Array(items) = value else {
                    return Err(format!("{path}: expected array, found {}", kind_of(value)));
                };
                let Some(item_ty) = &complex.items else {
                    return Err(format!("{path}: array schema has no items"));
                };
                items
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, item)| check(item, item_ty, &format!("{path}[{i}]")))
            }
            "map" => {
                let Value::Object(entries) = value else {
                    return Err(format!("{path}: expected map, found {}", kind_of(value)));
                };
                let Some(value_ty) = &complex.values else {
                    return Err(format!("{path}: map schema has no values"));
                };
                entries
                    .iter()
                    .try_for_each(|(k, v)| check(v, value_ty, &format!("{path}.{k}")))
            }
            "enum" => match value.as_str() {
                Some(s) if complex.symbols.iter().any(|sym| sym == s) => Ok(()),
                _ => Err(format!("{path}: not a symbol of the enum")),
            },
            // Primitive with a logical type annotation.
            other => check_primitive(value, other, path),
        },
    }
}

fn check_primitive(value: &Value, name: &str, path: &str) -> Result<(), String> {
    let ok = match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "int" => value
            .as_i64()
            .is_some_and(|v| i32::try_from(v).is_ok()),
        "long" => value.as_i64().is_some(),
        "float" | "double" => value.is_number(),
        "string" | "bytes" => value.is_string(),
        other => return Err(format!("{path}: unsupported schema type '{other}'")),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("{path}: expected {name}, found {}", kind_of(value)))
    }
}

fn admits_null(ty: &SchemaType) -> bool {
    match ty {
        SchemaType::Named(name) => name == "null",
        SchemaType::Union(variants) => variants.iter().any(admits_null),
        SchemaType::Complex(_) => false,
    }
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
