use thiserror::Error;

use crate::schema::FieldType;

/// Enumeration of errors raised while parsing a schema definition document.
///
/// Every variant is terminal: no partial descriptor is ever built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("failed to deserialize schema definition: {0}")]
    Malformed(String),
    #[error("schema definition is missing the {0} header")]
    MissingHeader(&'static str),
    #[error("schema version {0} is not a valid integer")]
    InvalidVersion(String),
    #[error("schema name {0:?} is empty or contains ':'")]
    InvalidName(String),
    #[error("schema {0} declares a field without a name")]
    EmptyFieldName(String),
    #[error("schema {0} declares no fields")]
    NoFields(String),
    #[error("field {field} declares unsupported type {type_name}")]
    UnknownFieldType { field: String, type_name: String },
    #[error("field {0} is declared more than once")]
    DuplicateField(String),
}

/// Errors returned by a `SchemaResolver` when fetching a definition document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("schema {0} not found")]
    SchemaNotFound(String),
    #[error("schema registry unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised when a schema reference cannot be turned into a descriptor.
///
/// This needs to be `Clone`, as concurrent lookups of the same reference share one failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("{0} is not a valid name:version schema reference")]
    InvalidReference(String),
    #[error("schema {0} could not be found")]
    NotFound(String),
    #[error("schema {reference} could not be fetched: {reason}")]
    Unavailable { reference: String, reason: String },
    #[error("schema {reference} is malformed: {source}")]
    Parse {
        reference: String,
        source: SchemaError,
    },
    #[error("fetching schema {requested} returned a definition for {found}")]
    ReferenceMismatch { requested: String, found: String },
}

impl ResolutionError {
    pub(crate) fn from_resolve(reference: &str, error: ResolveError) -> Self {
        match error {
            ResolveError::SchemaNotFound(_) => ResolutionError::NotFound(reference.to_owned()),
            ResolveError::Unavailable(reason) => ResolutionError::Unavailable {
                reference: reference.to_owned(),
                reason,
            },
        }
    }
}

/// Enumeration of errors raised while turning one input line into a typed record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("line is not a valid JSON event: {0}")]
    LineParse(String),
    #[error("unknown schema: {0}")]
    UnknownSchema(#[from] ResolutionError),
    #[error("event for schema {schema} is missing field {field}")]
    MissingField { schema: String, field: String },
    #[error("field {field} should be {expected} but found {found}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: &'static str,
    },
}

/// Errors raised by the tailer when an existing source cannot be read.
#[derive(Error, Debug)]
pub enum TailError {
    #[error("failed to read source {path}: {error}")]
    Io {
        path: String,
        error: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum OffsetStoreError {
    #[error("failed to access offset store: {0}")]
    Io(#[from] std::io::Error),
    #[error("offset store holds invalid data: {0}")]
    Corrupted(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("transient error, please retry")]
    RetryableSinkError,
    #[error("maximum record size exceeded")]
    EventTooBig,
    #[error("record could not be processed")]
    NonRetryableSinkError,
}

/// Why a poll cycle was aborted. A cycle error never stops the ingestion loop.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("failed to tail source: {0}")]
    Tail(#[from] TailError),
    #[error("failed to decode line ending at offset {offset}: {error}")]
    Decode { offset: u64, error: DecodeError },
    #[error("sink rejected batch: {0}")]
    Sink(#[from] SinkError),
}
