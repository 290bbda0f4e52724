use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::schema::resolver::{BootstrapResolver, SchemaResolver};
use crate::schema::{Field, FieldType, SchemaCache, SchemaDescriptor};

/// One input line before it is checked against its schema.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub schema: String,
    pub body: Map<String, Value>,
}

impl RawEvent {
    /// Parses one line of input. Top-level properties other than `schema` and `body`
    /// are ignored.
    pub fn from_slice(line: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(line).map_err(|e| DecodeError::LineParse(e.to_string()))
    }
}

/// A field value, already checked against its declared primitive type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    fn from_json(field: &Field, value: &Value) -> Result<Self, DecodeError> {
        let mismatch = || DecodeError::TypeMismatch {
            field: field.name.clone(),
            expected: field.field_type,
            found: json_type_name(value),
        };

        let typed = match (field.field_type, value) {
            (FieldType::Int32, Value::Number(n)) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(FieldValue::Int32),
            (FieldType::Int64, Value::Number(n)) => n.as_i64().map(FieldValue::Int64),
            (FieldType::Float32, Value::Number(n)) => n
                .as_f64()
                .filter(|v| v.is_finite() && v.abs() <= f64::from(f32::MAX))
                .map(|v| FieldValue::Float32(v as f32)),
            (FieldType::Float64, Value::Number(n)) => n.as_f64().map(FieldValue::Float64),
            (FieldType::String, Value::String(s)) => Some(FieldValue::String(s.clone())),
            (FieldType::Boolean, Value::Bool(b)) => Some(FieldValue::Boolean(*b)),
            _ => None,
        };

        typed.ok_or_else(mismatch)
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Int32(_) => FieldType::Int32,
            FieldValue::Int64(_) => FieldType::Int64,
            FieldValue::Float32(_) => FieldType::Float32,
            FieldValue::Float64(_) => FieldType::Float64,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Boolean(_) => FieldType::Boolean,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "floating point number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A decoded record: its schema, plus one value per schema field in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRecord {
    schema: Arc<SchemaDescriptor>,
    values: Vec<FieldValue>,
}

impl TypedRecord {
    pub fn schema(&self) -> &Arc<SchemaDescriptor> {
        &self.schema
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.schema
            .fields()
            .iter()
            .position(|f| f.name == name)
            .map(|index| &self.values[index])
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FieldValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int32(&self, name: &str) -> Option<i32> {
        match self.get(name) {
            Some(FieldValue::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(FieldValue::Int64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_boolean(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(FieldValue::Boolean(v)) => Some(*v),
            _ => None,
        }
    }
}

/// Serializes as a JSON object with the fields in schema order.
impl Serialize for TypedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (field, value) in self.schema.fields().iter().zip(&self.values) {
            map.serialize_entry(&field.name, value)?;
        }
        map.end()
    }
}

/// Decodes raw events into typed records, resolving schemas through a shared cache.
pub struct EventDecoder<R: SchemaResolver = BootstrapResolver> {
    schemas: Arc<SchemaCache<R>>,
}

impl<R: SchemaResolver> Clone for EventDecoder<R> {
    fn clone(&self) -> Self {
        Self {
            schemas: self.schemas.clone(),
        }
    }
}

impl<R: SchemaResolver> EventDecoder<R> {
    pub fn new(schemas: Arc<SchemaCache<R>>) -> Self {
        Self { schemas }
    }

    /// Parses and decodes one input line.
    pub async fn decode_line(&self, line: &[u8]) -> Result<TypedRecord, DecodeError> {
        let event = RawEvent::from_slice(line)?;
        self.decode(event).await
    }

    /// Checks the body of an event against its schema. Body properties the schema does not
    /// declare are dropped; no coercion is done between types.
    pub async fn decode(&self, event: RawEvent) -> Result<TypedRecord, DecodeError> {
        let schema = self.schemas.resolve(&event.schema).await?;

        let mut values = Vec::with_capacity(schema.fields().len());
        for field in schema.fields() {
            let value = event
                .body
                .get(&field.name)
                .ok_or_else(|| DecodeError::MissingField {
                    schema: event.schema.clone(),
                    field: field.name.clone(),
                })?;
            values.push(FieldValue::from_json(field, value)?);
        }

        Ok(TypedRecord { schema, values })
    }
}
