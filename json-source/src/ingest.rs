//! The poll loop driving one source: tail, decode, emit, checkpoint.
//!
//! Delivery is at-least-once. The offset only moves past a batch once the sink accepted it,
//! and it is committed to the offset store after that, so a crash in between replays the
//! batch on restart instead of losing it.

use std::str::FromStr;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CycleError, OffsetStoreError, SinkError};
use crate::event::EventDecoder;
use crate::offsets::OffsetStore;
use crate::schema::{BootstrapResolver, SchemaResolver};
use crate::sink::{RecordSink, SourceRecord};
use crate::tailer::{FileTailer, Offset, SourceIdentity, TailPoll};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
}

/// What a cycle does with a line that can't be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Discard the whole cycle, the line is retried on the next one.
    #[default]
    AbortCycle,
    /// Log the line and move past it.
    SkipLine,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "abort" => Ok(FailurePolicy::AbortCycle),
            "skip" => Ok(FailurePolicy::SkipLine),
            _ => Err(format!("Unknown decode failure policy: {s}")),
        }
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// The source file does not exist yet, nothing was read.
    SourceUnavailable,
    /// All lines read in the cycle were handed to the sink, and the offset moved past them.
    Emitted { records: usize, offset: Offset },
    /// Nothing was emitted and the offset was left where it was.
    Aborted(CycleError),
}

impl CycleOutcome {
    fn label(&self) -> &'static str {
        match self {
            CycleOutcome::SourceUnavailable => "unavailable",
            CycleOutcome::Emitted { .. } => "emitted",
            CycleOutcome::Aborted(_) => "aborted",
        }
    }
}

pub struct IngestionLoop<R: SchemaResolver = BootstrapResolver> {
    tailer: FileTailer,
    decoder: EventDecoder<R>,
    sink: Box<dyn RecordSink>,
    offsets: Box<dyn OffsetStore>,
    topic: String,
    poll_interval: Duration,
    policy: FailurePolicy,
    state: LoopState,
    /// Last offset known to be durably committed.
    committed: Option<Offset>,
}

impl<R: SchemaResolver> IngestionLoop<R> {
    /// Builds the loop, resuming the tailer from the last offset committed for its source.
    pub async fn start(
        mut tailer: FileTailer,
        decoder: EventDecoder<R>,
        sink: Box<dyn RecordSink>,
        offsets: Box<dyn OffsetStore>,
        topic: impl Into<String>,
    ) -> Result<Self, OffsetStoreError> {
        let committed = offsets.read_last_offset(tailer.identity()).await?;
        if let Some(offset) = committed {
            tailer.advance(offset);
        }

        info!(
            source = %tailer.identity(),
            offset = tailer.offset(),
            resumed = committed.is_some(),
            "starting ingestion"
        );

        Ok(Self {
            tailer,
            decoder,
            sink,
            offsets,
            topic: topic.into(),
            poll_interval: Duration::from_secs(2),
            policy: FailurePolicy::default(),
            state: LoopState::Idle,
            committed,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn identity(&self) -> &SourceIdentity {
        self.tailer.identity()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The offset the next cycle reads from.
    pub fn offset(&self) -> Offset {
        self.tailer.offset()
    }

    pub fn committed_offset(&self) -> Option<Offset> {
        self.committed
    }

    /// Runs cycles on every poll interval until `cancel` fires. A cycle in progress is always
    /// completed before returning.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.run_cycle().await;
        }

        info!(source = %self.identity(), offset = self.offset(), "ingestion stopped");
    }

    /// Flushes the sink, consuming the loop.
    pub async fn shutdown(self) -> Result<(), SinkError> {
        self.sink.flush().await
    }

    /// Runs one poll cycle. Errors are contained in the returned outcome, the loop is back
    /// to `Idle` afterwards whatever happened.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.state = LoopState::Polling;
        let outcome = self.poll_and_emit().await;
        self.state = LoopState::Idle;

        counter!("json_source_cycles_total", "outcome" => outcome.label()).increment(1);
        match &outcome {
            CycleOutcome::SourceUnavailable => warn!(
                source = %self.identity(),
                path = %self.tailer.path().display(),
                "source does not exist yet"
            ),
            CycleOutcome::Emitted { records, offset } => {
                debug!(source = %self.identity(), records, offset, "cycle completed")
            }
            CycleOutcome::Aborted(e) => error!(
                source = %self.identity(),
                offset = self.offset(),
                error = %e,
                "cycle aborted"
            ),
        }

        outcome
    }

    async fn poll_and_emit(&mut self) -> CycleOutcome {
        let lines = match self.tailer.poll_lines().await {
            Ok(TailPoll::Unavailable) => return CycleOutcome::SourceUnavailable,
            Ok(TailPoll::Lines { lines, .. }) => lines,
            Err(e) => return CycleOutcome::Aborted(e.into()),
        };

        let mut offset = self.tailer.offset();
        let mut records = Vec::with_capacity(lines.len());
        for line in lines {
            if !line.is_blank() {
                match self.decoder.decode_line(&line.bytes).await {
                    Ok(record) => records.push(SourceRecord {
                        partition: self.tailer.identity().clone(),
                        offset: line.end_offset,
                        topic: self.topic.clone(),
                        record,
                    }),
                    Err(error) => match self.policy {
                        FailurePolicy::AbortCycle => {
                            return CycleOutcome::Aborted(CycleError::Decode {
                                offset: line.end_offset,
                                error,
                            })
                        }
                        FailurePolicy::SkipLine => {
                            warn!(
                                source = %self.identity(),
                                offset = line.end_offset,
                                error = %error,
                                "skipping line that failed to decode"
                            );
                            counter!("json_source_lines_skipped_total").increment(1);
                        }
                    },
                }
            }
            offset = line.end_offset;
        }

        let emitted = records.len();
        if !records.is_empty() {
            if let Err(e) = self.sink.send_batch(records).await {
                return CycleOutcome::Aborted(e.into());
            }
        }

        self.tailer.advance(offset);
        self.commit(offset).await;

        CycleOutcome::Emitted {
            records: emitted,
            offset,
        }
    }

    async fn commit(&mut self, offset: Offset) {
        if self.committed == Some(offset) {
            return;
        }

        match self.offsets.commit(self.tailer.identity(), offset).await {
            Ok(()) => {
                self.committed = Some(offset);
                gauge!("json_source_committed_offset").set(offset as f64);
            }
            // The offset already moved in memory, the next successful cycle commits past it
            Err(e) => error!(
                source = %self.identity(),
                offset,
                error = %e,
                "failed to commit offset"
            ),
        }
    }
}
