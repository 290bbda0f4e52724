use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use crate::error::SinkError;
use crate::sink::{RecordSink, SourceRecord};

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("json_source_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("json_source_kafka_producer_queue_bytes").set(stats.msg_size as f64);

        for (_, stats) in stats.brokers {
            counter!(
                "json_source_kafka_broker_tx_errors_total",
                "broker" => stats.nodeid.to_string()
            )
            .absolute(stats.txerrs);
        }
    }
}

/// Produces records to Kafka, keyed by their source identity so that records of one source
/// keep their order within a partition.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaSink {
    pub fn new(config: KafkaConfig) -> anyhow::Result<KafkaSink> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext)?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        match producer
            .client()
            .fetch_metadata(None, Timeout::After(Duration::new(10, 0)))
        {
            Ok(metadata) => {
                info!(
                    "connected to Kafka brokers, found {} topics",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error.into());
            }
        }

        Ok(KafkaSink { producer })
    }

    fn kafka_send(&self, record: SourceRecord) -> Result<DeliveryFuture, SinkError> {
        let payload = serde_json::to_string(&record.record).map_err(|e| {
            error!("failed to serialize record: {}", e);
            SinkError::NonRetryableSinkError
        })?;

        let schema = record.schema().reference().to_string();
        let offset = record.offset.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "schema",
                value: Some(schema.as_str()),
            })
            .insert(Header {
                key: "source.offset",
                value: Some(offset.as_str()),
            });

        match self.producer.send_result(
            FutureRecord::to(&record.topic)
                .payload(&payload)
                .key(record.partition.as_str())
                .headers(headers),
        ) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    counter!("json_source_kafka_produce_errors_total", "cause" => "message_size")
                        .increment(1);
                    Err(SinkError::EventTooBig)
                }
                _ => {
                    counter!("json_source_kafka_produce_errors_total", "cause" => "write_error")
                        .increment(1);
                    error!("failed to produce record: {}", e);
                    Err(SinkError::RetryableSinkError)
                }
            },
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), SinkError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!("json_source_kafka_produce_errors_total", "cause" => "timeout")
                    .increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(SinkError::RetryableSinkError)
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                // Rejected by broker due to message size
                counter!("json_source_kafka_produce_errors_total", "cause" => "message_size")
                    .increment(1);
                Err(SinkError::EventTooBig)
            }
            Ok(Err((err, _))) => {
                counter!("json_source_kafka_produce_errors_total", "cause" => "broker_error")
                    .increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(SinkError::RetryableSinkError)
            }
            Ok(Ok(_)) => {
                counter!("json_source_records_emitted_total").increment(1);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RecordSink for KafkaSink {
    #[instrument(skip_all)]
    async fn send(&self, record: SourceRecord) -> Result<(), SinkError> {
        let ack = self.kafka_send(record)?;
        Self::process_ack(ack)
            .instrument(info_span!("ack_wait_one"))
            .await
    }

    #[instrument(skip_all)]
    async fn send_batch(&self, records: Vec<SourceRecord>) -> Result<(), SinkError> {
        let mut set = JoinSet::new();
        for record in records {
            // Enqueue sequentially to keep the records of a source in order
            let ack = self.kafka_send(record)?;
            set.spawn(Self::process_ack(ack));
        }

        // Wait on all the write ACKs concurrently, fail the batch on the first failure
        async move {
            while let Some(res) = set.join_next().await {
                match res {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        set.abort_all();
                        return Err(err);
                    }
                    Err(err) => {
                        set.abort_all();
                        error!("join error while waiting on Kafka ACK: {:?}", err);
                        return Err(SinkError::RetryableSinkError);
                    }
                }
            }
            Ok(())
        }
        .instrument(info_span!("ack_wait_many"))
        .await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Duration::new(30, 0)))
            .await
            .map_err(|e| {
                error!("flush task failed: {:?}", e);
                SinkError::RetryableSinkError
            })?
            .map_err(|e| {
                error!("failed to flush Kafka producer: {}", e);
                SinkError::RetryableSinkError
            })
    }
}
