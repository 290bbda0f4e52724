use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use json_source::error::{CycleError, DecodeError, SinkError};
use json_source::event::EventDecoder;
use json_source::ingest::{CycleOutcome, FailurePolicy, IngestionLoop};
use json_source::offsets::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
use json_source::schema::SchemaCache;
use json_source::sink::MemorySink;
use json_source::tailer::{FileTailer, SourceIdentity};

fn user_event(user_id: &str, sec_id: i64) -> String {
    serde_json::json!({
        "schema": "UserEvent:1",
        "body": {
            "event": "login",
            "userId": user_id,
            "secId": sec_id,
            "timestamp": "2024-03-01T10:00:00Z",
            "userAgent": "ignored"
        }
    })
    .to_string()
        + "\n"
}

struct Harness {
    _temp_dir: TempDir,
    path: PathBuf,
    identity: SourceIdentity,
    sink: MemorySink,
    offsets: MemoryOffsetStore,
}

impl Harness {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events.log");
        let identity = SourceIdentity::new("node-1", &path).unwrap();
        Self {
            _temp_dir: temp_dir,
            path,
            identity,
            sink: MemorySink::new(),
            offsets: MemoryOffsetStore::new(),
        }
    }

    fn write(&self, content: &str) {
        std::fs::write(&self.path, content).unwrap();
    }

    fn append(&self, content: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    fn file_len(&self) -> u64 {
        std::fs::metadata(&self.path).unwrap().len()
    }

    async fn ingestion(&self) -> IngestionLoop {
        let tailer = FileTailer::new(self.identity.clone(), &self.path, 0);
        IngestionLoop::start(
            tailer,
            EventDecoder::new(Arc::new(SchemaCache::bootstrap())),
            Box::new(self.sink.clone()),
            Box::new(self.offsets.clone()),
            "user_events",
        )
        .await
        .unwrap()
    }

    async fn committed(&self) -> Option<u64> {
        self.offsets.read_last_offset(&self.identity).await.unwrap()
    }

    async fn user_ids(&self) -> Vec<String> {
        self.sink
            .records()
            .await
            .iter()
            .map(|r| r.record.get_string("userId").unwrap().to_owned())
            .collect()
    }
}

#[tokio::test]
async fn test_three_good_lines_are_emitted_in_order() {
    let harness = Harness::new();
    harness.write(&(user_event("a", 1) + &user_event("b", 2) + &user_event("c", 3)));
    let mut ingestion = harness.ingestion().await;

    let outcome = ingestion.run_cycle().await;

    let length = harness.file_len();
    assert!(matches!(
        outcome,
        CycleOutcome::Emitted { records: 3, offset } if offset == length
    ));
    assert_eq!(harness.user_ids().await, vec!["a", "b", "c"]);
    assert_eq!(harness.committed().await, Some(length));
    assert_eq!(ingestion.offset(), length);

    let records = harness.sink.records().await;
    assert_eq!(records[0].partition, harness.identity);
    assert_eq!(records[0].topic, "user_events");
    assert_eq!(records[0].record.get_int32("secId"), Some(1));
    assert_eq!(records[0].offset, user_event("a", 1).len() as u64);
    assert_eq!(records[2].offset, length);
    for record in &records {
        assert_eq!(record.schema().name(), "UserEvent");
        assert_eq!(record.schema().version(), 1);
        assert!(record.record.get("userAgent").is_none());
    }
}

#[tokio::test]
async fn test_malformed_line_aborts_the_cycle() {
    let harness = Harness::new();
    harness.write(&(user_event("a", 1) + &user_event("b", 2) + "{\"schema\": \n"));
    let mut ingestion = harness.ingestion().await;

    let outcome = ingestion.run_cycle().await;

    assert!(matches!(
        outcome,
        CycleOutcome::Aborted(CycleError::Decode {
            error: DecodeError::LineParse(_),
            ..
        })
    ));
    assert!(harness.sink.is_empty().await);
    assert_eq!(harness.committed().await, None);
    assert_eq!(ingestion.offset(), 0);

    // The same bytes are read again on the next cycle
    let outcome = ingestion.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Aborted(_)));
    assert!(harness.sink.is_empty().await);
}

#[tokio::test]
async fn test_skip_policy_moves_past_bad_lines() {
    let harness = Harness::new();
    let bad_type = user_event("b", 2).replace("\"secId\":2", "\"secId\":\"two\"");
    harness.write(&(user_event("a", 1) + &bad_type + "not json\n" + &user_event("c", 3)));
    let mut ingestion = harness
        .ingestion()
        .await
        .with_failure_policy(FailurePolicy::SkipLine);

    let outcome = ingestion.run_cycle().await;

    assert!(matches!(outcome, CycleOutcome::Emitted { records: 2, .. }));
    assert_eq!(harness.user_ids().await, vec!["a", "c"]);
    assert_eq!(harness.committed().await, Some(harness.file_len()));
}

#[tokio::test]
async fn test_missing_source_then_created() {
    let harness = Harness::new();
    let mut ingestion = harness.ingestion().await;

    let outcome = ingestion.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::SourceUnavailable));
    assert_eq!(harness.committed().await, None);

    harness.write(&user_event("a", 1));
    let outcome = ingestion.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Emitted { records: 1, .. }));
}

#[tokio::test]
async fn test_partial_line_waits_for_terminator() {
    let harness = Harness::new();
    let second = user_event("b", 2);
    let (head, tail) = second.split_at(20);
    harness.write(&(user_event("a", 1) + head));
    let mut ingestion = harness.ingestion().await;

    ingestion.run_cycle().await;
    assert_eq!(harness.user_ids().await, vec!["a"]);
    let after_first = harness.committed().await.unwrap();
    assert_eq!(after_first, user_event("a", 1).len() as u64);

    harness.append(tail);
    ingestion.run_cycle().await;
    assert_eq!(harness.user_ids().await, vec!["a", "b"]);
    assert_eq!(harness.committed().await, Some(harness.file_len()));
}

#[tokio::test]
async fn test_restart_resumes_from_committed_offset() {
    let harness = Harness::new();
    harness.write(&(user_event("a", 1) + &user_event("b", 2)));

    let mut ingestion = harness.ingestion().await;
    ingestion.run_cycle().await;
    drop(ingestion);

    harness.append(&user_event("c", 3));
    let mut restarted = harness.ingestion().await;
    assert_eq!(restarted.committed_offset(), harness.committed().await);

    restarted.run_cycle().await;
    assert_eq!(harness.user_ids().await, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_sink_failure_leaves_offset_unchanged() {
    let harness = Harness::new();
    harness.write(&user_event("a", 1));
    let mut ingestion = harness.ingestion().await;
    harness
        .sink
        .fail_with(Some(SinkError::RetryableSinkError))
        .await;

    let outcome = ingestion.run_cycle().await;
    assert!(matches!(
        outcome,
        CycleOutcome::Aborted(CycleError::Sink(SinkError::RetryableSinkError))
    ));
    assert_eq!(ingestion.offset(), 0);
    assert_eq!(harness.committed().await, None);

    // Once the sink recovers the same line is delivered
    harness.sink.fail_with(None).await;
    ingestion.run_cycle().await;
    assert_eq!(harness.user_ids().await, vec!["a"]);
}

#[tokio::test]
async fn test_rotation_restarts_from_beginning() {
    let harness = Harness::new();
    harness.write(&(user_event("a", 1) + &user_event("b", 2)));
    let mut ingestion = harness.ingestion().await;
    ingestion.run_cycle().await;

    // The new file is shorter than the committed offset
    harness.write(&user_event("c", 3));
    let outcome = ingestion.run_cycle().await;

    assert!(matches!(outcome, CycleOutcome::Emitted { records: 1, .. }));
    assert_eq!(harness.user_ids().await, vec!["a", "b", "c"]);
    assert_eq!(harness.committed().await, Some(harness.file_len()));
}

#[tokio::test]
async fn test_blank_lines_are_consumed() {
    let harness = Harness::new();
    harness.write(&(String::from("\n\r\n") + &user_event("a", 1) + "   \n"));
    let mut ingestion = harness.ingestion().await;

    let outcome = ingestion.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Emitted { records: 1, .. }));
    assert_eq!(harness.committed().await, Some(harness.file_len()));
}

#[tokio::test]
async fn test_run_until_cancelled() {
    let harness = Harness::new();
    harness.write(&user_event("a", 1));
    let mut ingestion = harness
        .ingestion()
        .await
        .with_poll_interval(Duration::from_millis(10));

    let token = CancellationToken::new();
    let handle = {
        let token = token.clone();
        tokio::spawn(async move {
            ingestion.run(token).await;
            ingestion
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.append(&user_event("b", 2));
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    let ingestion = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop did not stop after cancellation")
        .unwrap();
    assert_eq!(harness.user_ids().await, vec!["a", "b"]);
    assert_eq!(ingestion.committed_offset(), Some(harness.file_len()));
    ingestion.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_file_offset_store_round_trip_through_loop() {
    let harness = Harness::new();
    harness.write(&user_event("a", 1));
    let store_path = harness.path.with_file_name("offsets.json");

    let start = |path: &Path| {
        let tailer = FileTailer::new(harness.identity.clone(), &harness.path, 0);
        IngestionLoop::start(
            tailer,
            EventDecoder::new(Arc::new(SchemaCache::bootstrap())),
            Box::new(harness.sink.clone()),
            Box::new(FileOffsetStore::new(path)),
            "user_events",
        )
    };

    let mut ingestion = start(&store_path).await.unwrap();
    ingestion.run_cycle().await;
    drop(ingestion);

    let restarted = start(&store_path).await.unwrap();
    assert_eq!(restarted.offset(), harness.file_len());
}

#[tokio::test]
async fn test_sources_sharing_a_schema_cache_stay_independent() {
    // Both loops share the schema cache and one offset store, keyed by source identity
    let schemas = Arc::new(SchemaCache::bootstrap());
    let offsets = MemoryOffsetStore::new();
    let first = Harness::new();
    let second = Harness::new();
    first.write(&(user_event("a", 1) + &user_event("b", 2)));
    second.write(&user_event("z", 26));

    let start = |harness: &Harness| {
        let tailer = FileTailer::new(harness.identity.clone(), &harness.path, 0);
        IngestionLoop::start(
            tailer,
            EventDecoder::new(schemas.clone()),
            Box::new(harness.sink.clone()),
            Box::new(offsets.clone()),
            "user_events",
        )
    };
    let mut first_loop = start(&first).await.unwrap();
    let mut second_loop = start(&second).await.unwrap();

    let (first_outcome, second_outcome) =
        tokio::join!(first_loop.run_cycle(), second_loop.run_cycle());
    assert!(matches!(first_outcome, CycleOutcome::Emitted { records: 2, .. }));
    assert!(matches!(second_outcome, CycleOutcome::Emitted { records: 1, .. }));

    assert_eq!(first.user_ids().await, vec!["a", "b"]);
    assert_eq!(second.user_ids().await, vec!["z"]);
    assert_ne!(first.identity, second.identity);
    assert_ne!(first.file_len(), second.file_len());
    assert_eq!(offsets.get(&first.identity).await, Some(first.file_len()));
    assert_eq!(offsets.get(&second.identity).await, Some(second.file_len()));
    assert_eq!(first_loop.offset(), first.file_len());
    assert_eq!(second_loop.offset(), second.file_len());

    // Both loops decoded against the one cached descriptor
    let first_records = first.sink.records().await;
    let second_records = second.sink.records().await;
    assert!(Arc::ptr_eq(
        first_records[0].schema(),
        second_records[0].schema()
    ));
    assert_eq!(schemas.entry_count().await, 1);
}
