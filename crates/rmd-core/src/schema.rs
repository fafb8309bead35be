//! Avro-style schema model.
//!
//! Value schemas and replication metadata schemas are both expressed with
//! this model. Schemas are parsed from (and rendered to) the usual JSON
//! notation; named records may be referenced by name after their first
//! definition.

use crate::value::{Record, Value};
use serde_json::{json, Map as JsonMap, Value as Json};
use std::collections::HashMap;
use std::sync::Arc;

/// A schema node.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// `null`
    Null,
    /// `boolean`
    Boolean,
    /// `int`
    Int,
    /// `long`
    Long,
    /// `float`
    Float,
    /// `double`
    Double,
    /// `string`
    String,
    /// `bytes`
    Bytes,
    /// Array of items
    Array(Box<Schema>),
    /// String-keyed map of values
    Map(Box<Schema>),
    /// Union of branches, default belongs to the first branch
    Union(Vec<Schema>),
    /// Named record
    Record(Arc<RecordSchema>),
}

/// A record schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    /// Simple name
    pub name: String,
    /// Optional namespace
    pub namespace: Option<String>,
    /// Fields in declaration order
    pub fields: Vec<Field>,
}

/// A record field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Field name
    pub name: String,
    /// Field schema
    pub schema: Schema,
    /// Default value, already converted to the field schema
    pub default: Option<Value>,
}

impl Field {
    /// Create a field.
    #[must_use]
    pub fn new(name: impl Into<String>, schema: Schema, default: Option<Value>) -> Self {
        Self {
            name: name.into(),
            schema,
            default,
        }
    }
}

impl RecordSchema {
    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fully qualified name.
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => format!("{ns}.{}", self.name),
            _ => self.name.clone(),
        }
    }

    /// Build a record holding every field's default.
    ///
    /// # Errors
    ///
    /// Returns error if a field has no default.
    pub fn default_record(&self) -> Result<Record, SchemaError> {
        self.fields
            .iter()
            .map(|f| {
                f.default
                    .clone()
                    .map(|v| (f.name.clone(), v))
                    .ok_or_else(|| SchemaError::MissingDefault(f.name.clone()))
            })
            .collect()
    }
}

impl Schema {
    /// Parse a schema from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns error if the text is not JSON or not a supported schema.
    pub fn parse_str(text: &str) -> Result<Self, SchemaError> {
        let json: Json =
            serde_json::from_str(text).map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
        Self::parse(&json)
    }

    /// Parse a schema from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns error if the document is not a supported schema.
    pub fn parse(json: &Json) -> Result<Self, SchemaError> {
        let mut names = HashMap::new();
        parse_node(json, None, &mut names)
    }

    /// The record schema, if this is a record.
    #[must_use]
    pub fn as_record(&self) -> Option<&Arc<RecordSchema>> {
        match self {
            Schema::Record(r) => Some(r),
            _ => None,
        }
    }

    /// The collection schema behind this node, looking through a nullable union.
    ///
    /// Returns the array or map schema for `array`, `map`, and
    /// `["null", array|map]` shaped fields.
    #[must_use]
    pub fn collection(&self) -> Option<&Schema> {
        match self {
            Schema::Array(_) | Schema::Map(_) => Some(self),
            Schema::Union(branches) => {
                let mut non_null = branches.iter().filter(|b| **b != Schema::Null);
                match (non_null.next(), non_null.next()) {
                    (Some(only), None) if matches!(only, Schema::Array(_) | Schema::Map(_)) => {
                        Some(only)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Render back to JSON.
    #[must_use]
    pub fn to_json(&self) -> Json {
        let mut seen = Vec::new();
        render(self, &mut seen)
    }

    /// Type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Schema::Null => "null",
            Schema::Boolean => "boolean",
            Schema::Int => "int",
            Schema::Long => "long",
            Schema::Float => "float",
            Schema::Double => "double",
            Schema::String => "string",
            Schema::Bytes => "bytes",
            Schema::Array(_) => "array",
            Schema::Map(_) => "map",
            Schema::Union(_) => "union",
            Schema::Record(_) => "record",
        }
    }
}

fn primitive(name: &str) -> Option<Schema> {
    Some(match name {
        "null" => Schema::Null,
        "boolean" => Schema::Boolean,
        "int" => Schema::Int,
        "long" => Schema::Long,
        "float" => Schema::Float,
        "double" => Schema::Double,
        "string" => Schema::String,
        "bytes" => Schema::Bytes,
        _ => return None,
    })
}

fn parse_node(
    json: &Json,
    namespace: Option<&str>,
    names: &mut HashMap<String, Arc<RecordSchema>>,
) -> Result<Schema, SchemaError> {
    match json {
        Json::String(name) => {
            if let Some(schema) = primitive(name) {
                return Ok(schema);
            }
            lookup_named(name, namespace, names)
        }
        Json::Array(branches) => branches
            .iter()
            .map(|b| parse_node(b, namespace, names))
            .collect::<Result<Vec<_>, _>>()
            .map(Schema::Union),
        Json::Object(obj) => {
            let ty = obj
                .get("type")
                .ok_or_else(|| SchemaError::Invalid("missing \"type\"".to_string()))?;
            match ty.as_str() {
                Some("array") => {
                    let items = obj
                        .get("items")
                        .ok_or_else(|| SchemaError::Invalid("array without items".to_string()))?;
                    Ok(Schema::Array(Box::new(parse_node(items, namespace, names)?)))
                }
                Some("map") => {
                    let values = obj
                        .get("values")
                        .ok_or_else(|| SchemaError::Invalid("map without values".to_string()))?;
                    Ok(Schema::Map(Box::new(parse_node(values, namespace, names)?)))
                }
                Some("record") => parse_record(obj, namespace, names),
                Some(other) if primitive(other).is_some() => {
                    primitive(other).ok_or_else(|| SchemaError::Unsupported(other.to_string()))
                }
                Some(other) => Err(SchemaError::Unsupported(other.to_string())),
                // `{"type": {...}}` wraps another schema
                None => parse_node(ty, namespace, names),
            }
        }
        other => Err(SchemaError::Invalid(format!("unexpected schema node {other}"))),
    }
}

fn lookup_named(
    name: &str,
    namespace: Option<&str>,
    names: &HashMap<String, Arc<RecordSchema>>,
) -> Result<Schema, SchemaError> {
    let qualified = match namespace {
        Some(ns) if !name.contains('.') && !ns.is_empty() => format!("{ns}.{name}"),
        _ => name.to_string(),
    };
    names
        .get(&qualified)
        .or_else(|| names.get(name))
        .map(|r| Schema::Record(Arc::clone(r)))
        .ok_or_else(|| SchemaError::UnknownType(name.to_string()))
}

fn parse_record(
    obj: &JsonMap<String, Json>,
    namespace: Option<&str>,
    names: &mut HashMap<String, Arc<RecordSchema>>,
) -> Result<Schema, SchemaError> {
    let raw_name = obj
        .get("name")
        .and_then(Json::as_str)
        .ok_or_else(|| SchemaError::Invalid("record without name".to_string()))?;
    let (name, namespace) = match raw_name.rsplit_once('.') {
        Some((ns, simple)) => (simple.to_string(), Some(ns.to_string())),
        None => (
            raw_name.to_string(),
            obj.get("namespace")
                .and_then(Json::as_str)
                .map(str::to_string)
                .or_else(|| namespace.map(str::to_string)),
        ),
    };

    let raw_fields = obj
        .get("fields")
        .and_then(Json::as_array)
        .ok_or_else(|| SchemaError::Invalid(format!("record {name} without fields")))?;

    let mut fields = Vec::with_capacity(raw_fields.len());
    for raw in raw_fields {
        let field_name = raw
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| SchemaError::Invalid(format!("field without name in {name}")))?;
        let field_type = raw
            .get("type")
            .ok_or_else(|| SchemaError::Invalid(format!("field {field_name} without type")))?;
        let schema = parse_node(field_type, namespace.as_deref(), names)?;
        let default = match raw.get("default") {
            Some(json) => Some(json_to_value(json, &schema).ok_or_else(|| {
                SchemaError::InvalidDefault {
                    field: field_name.to_string(),
                    expected: schema.type_name(),
                }
            })?),
            None => None,
        };
        fields.push(Field::new(field_name, schema, default));
    }

    let record = Arc::new(RecordSchema {
        name,
        namespace,
        fields,
    });
    names.insert(record.full_name(), Arc::clone(&record));
    Ok(Schema::Record(record))
}

/// Convert a JSON default to a value under `schema`.
///
/// Union defaults belong to the first branch.
#[must_use]
pub fn json_to_value(json: &Json, schema: &Schema) -> Option<Value> {
    match (schema, json) {
        (Schema::Null, Json::Null) => Some(Value::Null),
        (Schema::Boolean, Json::Bool(b)) => Some(Value::Boolean(*b)),
        (Schema::Int, Json::Number(n)) => n.as_i64().and_then(|v| i32::try_from(v).ok()).map(Value::Int),
        (Schema::Long, Json::Number(n)) => n.as_i64().map(Value::Long),
        #[allow(clippy::cast_possible_truncation)]
        (Schema::Float, Json::Number(n)) => n.as_f64().map(|v| Value::Float(v as f32)),
        (Schema::Double, Json::Number(n)) => n.as_f64().map(Value::Double),
        (Schema::String, Json::String(s)) => Some(Value::String(s.clone())),
        (Schema::Bytes, Json::String(s)) => Some(Value::Bytes(s.chars().map(|c| c as u8).collect())),
        (Schema::Array(items), Json::Array(values)) => values
            .iter()
            .map(|v| json_to_value(v, items))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        (Schema::Map(values), Json::Object(entries)) => entries
            .iter()
            .map(|(k, v)| json_to_value(v, values).map(|v| (k.clone(), v)))
            .collect::<Option<Vec<_>>>()
            .map(Value::Map),
        (Schema::Union(branches), json) => branches.first().and_then(|b| json_to_value(json, b)),
        (Schema::Record(record), Json::Object(entries)) => record
            .fields
            .iter()
            .map(|f| {
                let value = match entries.get(&f.name) {
                    Some(v) => json_to_value(v, &f.schema),
                    None => f.default.clone(),
                };
                value.map(|v| (f.name.clone(), v))
            })
            .collect::<Option<Record>>()
            .map(Value::Record),
        _ => None,
    }
}

/// Render a value as JSON, for defaults and diagnostics.
#[must_use]
pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => json!(b),
        Value::Int(v) => json!(v),
        Value::Long(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::String(s) => json!(s),
        Value::Bytes(b) => Json::String(b.iter().map(|&c| char::from(c)).collect()),
        Value::Array(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
        Value::Record(record) => Json::Object(
            record
                .iter()
                .map(|(k, v)| (k.to_string(), value_to_json(v)))
                .collect(),
        ),
    }
}

fn render(schema: &Schema, seen: &mut Vec<String>) -> Json {
    match schema {
        Schema::Array(items) => json!({"type": "array", "items": render(items, seen)}),
        Schema::Map(values) => json!({"type": "map", "values": render(values, seen)}),
        Schema::Union(branches) => Json::Array(branches.iter().map(|b| render(b, seen)).collect()),
        Schema::Record(record) => {
            let full_name = record.full_name();
            if seen.contains(&full_name) {
                return Json::String(full_name);
            }
            seen.push(full_name);
            let fields: Vec<Json> = record
                .fields
                .iter()
                .map(|f| {
                    let mut field = JsonMap::new();
                    field.insert("name".to_string(), json!(f.name));
                    field.insert("type".to_string(), render(&f.schema, seen));
                    if let Some(default) = &f.default {
                        field.insert("default".to_string(), value_to_json(default));
                    }
                    Json::Object(field)
                })
                .collect();
            let mut obj = JsonMap::new();
            obj.insert("type".to_string(), json!("record"));
            obj.insert("name".to_string(), json!(record.name));
            if let Some(ns) = &record.namespace {
                obj.insert("namespace".to_string(), json!(ns));
            }
            obj.insert("fields".to_string(), Json::Array(fields));
            Json::Object(obj)
        }
        primitive => Json::String(primitive.type_name().to_string()),
    }
}

/// Errors raised while parsing or interpreting schemas.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    /// Schema text is not JSON
    #[error("invalid schema JSON: {0}")]
    InvalidJson(String),
    /// Structurally invalid schema
    #[error("invalid schema: {0}")]
    Invalid(String),
    /// Type not supported by this model
    #[error("unsupported schema type: {0}")]
    Unsupported(String),
    /// Reference to an undefined named type
    #[error("unknown named type: {0}")]
    UnknownType(String),
    /// Default does not match the field schema
    #[error("default for field {field} is not a valid {expected}")]
    InvalidDefault {
        /// Field name
        field: String,
        /// Expected schema type
        expected: &'static str,
    },
    /// Field needed a default but has none
    #[error("field {0} has no default")]
    MissingDefault(String),
}
