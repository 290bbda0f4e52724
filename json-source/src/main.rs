//! Tail a newline-delimited JSON event log and ship typed records to Kafka.
use std::sync::Arc;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use json_source::config::Config;
use json_source::event::EventDecoder;
use json_source::ingest::IngestionLoop;
use json_source::offsets::FileOffsetStore;
use json_source::schema::SchemaCache;
use json_source::sink::kafka::KafkaSink;
use json_source::sink::{PrintSink, RecordSink};
use json_source::tailer::{FileTailer, SourceIdentity};

fn setup_tracing() {
    let log_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();

    tracing_subscriber::registry().with(log_layer).init();
}

/// Cancels `token` on the first SIGTERM or SIGINT.
fn cancel_on_shutdown_signal(token: CancellationToken) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {},
            _ = interrupt.recv() => {},
        };

        info!("Shutting down gracefully...");
        token.cancel();
    });

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().context("Invalid configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        source = %config.source_filename.display(),
        topic = config.topic.as_str(),
        schema_registry_url = %config.schema_registry_url,
        "starting json-source"
    );

    let identity = SourceIdentity::new(
        config.json_source_connector_nodename.as_str(),
        &config.source_filename,
    )
    .context("failed to resolve source path")?;
    let tailer = FileTailer::new(identity, &config.source_filename, 0)
        .with_max_lines(config.max_lines_per_cycle);
    let decoder = EventDecoder::new(Arc::new(SchemaCache::bootstrap()));

    let sink: Box<dyn RecordSink> = if config.print_sink {
        Box::new(PrintSink {})
    } else {
        Box::new(KafkaSink::new(config.kafka.clone())?)
    };
    let offsets = Box::new(FileOffsetStore::new(&config.offset_store_path));

    let mut ingestion = IngestionLoop::start(tailer, decoder, sink, offsets, config.topic.as_str())
        .await
        .context("failed to read the last committed offset")?
        .with_poll_interval(config.poll_interval_ms.0)
        .with_failure_policy(config.decode_failure_policy);

    let shutdown = CancellationToken::new();
    cancel_on_shutdown_signal(shutdown.clone())?;

    ingestion.run(shutdown).await;
    ingestion
        .shutdown()
        .await
        .context("failed to flush sink on shutdown")?;

    info!("json-source stopped");
    Ok(())
}
