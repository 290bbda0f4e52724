use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{ResolutionError, SchemaError};

pub mod cache;
pub mod resolver;

pub use cache::SchemaCache;
pub use resolver::{BootstrapResolver, SchemaResolver};

/// A `name:version` reference identifying one published schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaReference {
    name: String,
    version: i32,
}

impl SchemaReference {
    pub fn new(name: impl Into<String>, version: i32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i32 {
        self.version
    }
}

impl FromStr for SchemaReference {
    type Err = ResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Names may not contain ':', so the version is everything after the last one
        let invalid = || ResolutionError::InvalidReference(s.to_owned());
        let (name, version) = s.rsplit_once(':').ok_or_else(invalid)?;
        if name.is_empty() || name.contains(':') {
            return Err(invalid());
        }
        let parsed = version.parse::<i32>().map_err(|_| invalid())?;
        // Only the canonical spelling names a version: no sign, no leading zeros
        if parsed.to_string() != version {
            return Err(invalid());
        }

        Ok(SchemaReference::new(name, parsed))
    }
}

impl fmt::Display for SchemaReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// The fixed set of primitive types a schema field can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Boolean,
}

impl FieldType {
    /// Maps a declared type name to a primitive type. The short names are the ones
    /// used by Confluent-style registries.
    pub fn from_type_name(type_name: &str) -> Option<Self> {
        match type_name {
            "int32" | "int" => Some(FieldType::Int32),
            "int64" | "long" => Some(FieldType::Int64),
            "float32" | "float" => Some(FieldType::Float32),
            "float64" | "double" => Some(FieldType::Float64),
            "string" => Some(FieldType::String),
            "boolean" => Some(FieldType::Boolean),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

/// An immutable, ordered description of a record shape.
///
/// Descriptors are only built by [`SchemaDescriptor::parse`], which guarantees at least
/// one field and unique field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    name: String,
    version: i32,
    fields: Vec<Field>,
}

#[derive(Deserialize)]
struct SchemaDefinition {
    name: Option<String>,
    version: Option<serde_json::Value>,
    fields: Option<Vec<FieldDefinition>>,
}

#[derive(Deserialize)]
struct FieldDefinition {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
}

impl SchemaDescriptor {
    /// Parses a JSON schema definition document of the form
    /// `{"name": .., "version": .., "fields": [{"name": .., "type": ..}]}`.
    /// Unknown properties are ignored.
    pub fn parse(definition: &str) -> Result<Self, SchemaError> {
        let definition: SchemaDefinition = serde_json::from_str(definition)
            .map_err(|e| SchemaError::Malformed(e.to_string()))?;

        let name = definition.name.ok_or(SchemaError::MissingHeader("name"))?;
        if name.is_empty() || name.contains(':') {
            return Err(SchemaError::InvalidName(name));
        }
        let version = parse_version(
            definition
                .version
                .ok_or(SchemaError::MissingHeader("version"))?,
        )?;

        let declared = definition.fields.unwrap_or_default();
        if declared.is_empty() {
            return Err(SchemaError::NoFields(name));
        }

        let mut seen = HashSet::with_capacity(declared.len());
        let mut fields = Vec::with_capacity(declared.len());
        for field in declared {
            if field.name.is_empty() {
                return Err(SchemaError::EmptyFieldName(name));
            }
            let field_type = FieldType::from_type_name(&field.type_name).ok_or_else(|| {
                SchemaError::UnknownFieldType {
                    field: field.name.clone(),
                    type_name: field.type_name.clone(),
                }
            })?;
            if !seen.insert(field.name.clone()) {
                return Err(SchemaError::DuplicateField(field.name));
            }
            fields.push(Field {
                name: field.name,
                field_type,
            });
        }

        Ok(SchemaDescriptor {
            name,
            version,
            fields,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn reference(&self) -> SchemaReference {
        SchemaReference::new(self.name.clone(), self.version)
    }
}

// Registries publish the version either as a number or as a numeric string.
fn parse_version(value: serde_json::Value) -> Result<i32, SchemaError> {
    let parsed = match &value {
        serde_json::Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        serde_json::Value::String(s) => s.trim().parse::<i32>().ok(),
        serde_json::Value::Null => return Err(SchemaError::MissingHeader("version")),
        _ => None,
    };

    parsed.ok_or_else(|| SchemaError::InvalidVersion(value.to_string()))
}
