use std::sync::Arc;

use moka::future::Cache;
use tracing::debug;

use crate::error::{ResolutionError, SchemaError};
use crate::schema::resolver::{BootstrapResolver, SchemaResolver};
use crate::schema::{SchemaDescriptor, SchemaReference};

/// SchemaCache resolves `name:version` references to shared schema descriptors.
///
/// - **No expiry**: published schemas are immutable, so an entry is never replaced once cached.
/// - **Per-key coalescing**: uses moka's `try_get_with`, so concurrent lookups of the same
///   reference run a single fetch and all receive the same `Arc<SchemaDescriptor>`, while
///   lookups of different references proceed in parallel.
///
/// The cache is generic over the resolver to allow dependency injection in tests.
pub struct SchemaCache<R: SchemaResolver = BootstrapResolver> {
    resolver: Arc<R>,
    cache: Cache<SchemaReference, Arc<SchemaDescriptor>>,
}

impl SchemaCache<BootstrapResolver> {
    /// Creates a cache backed by the bootstrap resolver, which only knows `UserEvent:1`.
    pub fn bootstrap() -> Self {
        Self::new(BootstrapResolver::default())
    }
}

impl<R: SchemaResolver> SchemaCache<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver: Arc::new(resolver),
            cache: Cache::builder().build(),
        }
    }

    /// Resolves a `name:version` reference string.
    pub async fn resolve(&self, reference: &str) -> Result<Arc<SchemaDescriptor>, ResolutionError> {
        let reference: SchemaReference = reference.parse()?;
        self.resolve_reference(reference).await
    }

    pub async fn resolve_reference(
        &self,
        reference: SchemaReference,
    ) -> Result<Arc<SchemaDescriptor>, ResolutionError> {
        if let Some(cached) = self.cache.get(&reference).await {
            return Ok(cached);
        }

        metrics::counter!("json_source_schema_cache_misses_total").increment(1);

        let resolver = self.resolver.clone();
        let requested = reference.clone();
        self.cache
            .try_get_with(reference, async move {
                let key = requested.to_string();
                debug!(schema = %key, "fetching schema definition");

                let document = resolver
                    .fetch(&requested)
                    .await
                    .map_err(|e| ResolutionError::from_resolve(&key, e))?;
                let descriptor =
                    SchemaDescriptor::parse(&document).map_err(|source| ResolutionError::Parse {
                        reference: key.clone(),
                        source,
                    })?;

                if descriptor.reference() != requested {
                    return Err(ResolutionError::ReferenceMismatch {
                        requested: key,
                        found: descriptor.reference().to_string(),
                    });
                }

                Ok(Arc::new(descriptor))
            })
            .await
            .map_err(|arc_err| (*arc_err).clone())
    }

    /// Parses a definition document and caches it under its own `name:version` reference.
    ///
    /// The first registration for a reference wins; registering it again returns the
    /// descriptor that is already cached.
    pub async fn register(&self, definition: &str) -> Result<Arc<SchemaDescriptor>, SchemaError> {
        let descriptor = SchemaDescriptor::parse(definition)?;
        let reference = descriptor.reference();

        Ok(self
            .cache
            .get_with(reference, async move { Arc::new(descriptor) })
            .await)
    }

    /// Returns the number of cached descriptors.
    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}
