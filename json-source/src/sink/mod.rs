use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::SinkError;
use crate::event::TypedRecord;
use crate::schema::SchemaDescriptor;
use crate::tailer::{Offset, SourceIdentity};

pub mod kafka;

/// One decoded line, ready to be emitted downstream.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// The source partition the record was read from.
    pub partition: SourceIdentity,
    /// Offset just past this record's own line, not the final offset of its cycle, so
    /// resuming from it never replays the record.
    pub offset: Offset,
    pub topic: String,
    pub record: TypedRecord,
}

impl SourceRecord {
    pub fn schema(&self) -> &Arc<SchemaDescriptor> {
        self.record.schema()
    }
}

/// Downstream destination for records. Records of one batch are emitted in order, and a
/// batch is only acknowledged once every record in it is.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn send(&self, record: SourceRecord) -> Result<(), SinkError>;
    async fn send_batch(&self, records: Vec<SourceRecord>) -> Result<(), SinkError>;

    /// Waits for buffered records to be delivered, called on shutdown.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

pub struct PrintSink {}

#[async_trait]
impl RecordSink for PrintSink {
    async fn send(&self, record: SourceRecord) -> Result<(), SinkError> {
        info!("single record: {:?}", record);
        counter!("json_source_records_emitted_total").increment(1);

        Ok(())
    }

    async fn send_batch(&self, records: Vec<SourceRecord>) -> Result<(), SinkError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of records");
        let _enter = span.enter();

        counter!("json_source_records_emitted_total").increment(records.len() as u64);
        for record in records {
            info!("record: {:?}", record);
        }

        Ok(())
    }
}

/// Keeps every accepted record in memory. Clones share the same storage, so a test can keep
/// a handle while the ingestion loop owns the sink.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<SourceRecord>>>,
    failing: Arc<Mutex<Option<SinkError>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<SourceRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Makes every following send fail with `error`, or succeed again with `None`.
    pub async fn fail_with(&self, error: Option<SinkError>) {
        *self.failing.lock().await = error;
    }

    async fn check_failing(&self) -> Result<(), SinkError> {
        match self.failing.lock().await.as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn send(&self, record: SourceRecord) -> Result<(), SinkError> {
        self.check_failing().await?;
        self.records.lock().await.push(record);
        counter!("json_source_records_emitted_total").increment(1);
        Ok(())
    }

    async fn send_batch(&self, records: Vec<SourceRecord>) -> Result<(), SinkError> {
        self.check_failing().await?;
        counter!("json_source_records_emitted_total").increment(records.len() as u64);
        self.records.lock().await.extend(records);
        Ok(())
    }
}
