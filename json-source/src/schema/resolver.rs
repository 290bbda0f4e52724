use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::ResolveError;
use crate::schema::SchemaReference;

/// The `UserEvent:1` schema every resolver is bootstrapped with, until
/// schemas are fetched from a registry.
pub const USER_EVENT_SCHEMA: &str = r#"
{
    "name":"UserEvent",
    "version":"1",
    "fields":[
    {
        "name":"event",
        "type":"string"
    },
    {
        "name":"userId",
        "type":"string"
    },
    {
        "name":"secId",
        "type":"int"
    },
    {
        "name":"timestamp",
        "type":"string"
    }]
}
"#;

/// Trait for fetching schema definition documents from a registry.
/// This abstraction allows swapping a remote registry in without touching the cache or decoder.
#[async_trait]
pub trait SchemaResolver: Send + Sync + 'static {
    async fn fetch(&self, reference: &SchemaReference) -> Result<String, ResolveError>;
}

/// A resolver answering from a fixed map of definition documents.
#[derive(Debug, Clone)]
pub struct BootstrapResolver {
    documents: HashMap<String, String>,
}

impl BootstrapResolver {
    /// Creates a resolver knowing no schemas at all.
    pub fn empty() -> Self {
        Self {
            documents: HashMap::new(),
        }
    }

    pub fn with_document(mut self, reference: &str, document: impl Into<String>) -> Self {
        self.documents.insert(reference.to_owned(), document.into());
        self
    }
}

impl Default for BootstrapResolver {
    fn default() -> Self {
        Self::empty().with_document("UserEvent:1", USER_EVENT_SCHEMA)
    }
}

#[async_trait]
impl SchemaResolver for BootstrapResolver {
    async fn fetch(&self, reference: &SchemaReference) -> Result<String, ResolveError> {
        let key = reference.to_string();
        self.documents
            .get(&key)
            .cloned()
            .ok_or(ResolveError::SchemaNotFound(key))
    }
}
