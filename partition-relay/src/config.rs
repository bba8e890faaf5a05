use std::time::Duration;

use common_kafka::config::{
    CompressionCodec, ConsumerConfig, KafkaConfig, ProducerConfig, SaslCredentials,
};
use envconfig::Envconfig;

use crate::error::RoutingError;
use crate::router::RoutingPolicy;
use crate::session::handler::RoutingFailureMode;

// No Debug: holds SASL passwords. Log `RelaySettings` instead.
#[derive(Envconfig, Clone)]
pub struct Config {
    // Source cluster
    #[envconfig(default = "localhost:9092")]
    pub source_kafka_hosts: String,

    #[envconfig(default = "false")]
    pub source_kafka_tls: bool,

    #[envconfig(default = "")]
    pub source_kafka_username: String,

    #[envconfig(default = "")]
    pub source_kafka_password: String,

    #[envconfig(default = "mirrormaker")]
    pub kafka_consumer_group: String,

    // Comma separated
    #[envconfig(default = "")]
    pub kafka_source_topics: String,

    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "10000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    #[envconfig(default = "256")]
    pub claim_buffer_size: usize,

    // Destination cluster
    #[envconfig(default = "localhost:9092")]
    pub destination_kafka_hosts: String,

    #[envconfig(default = "false")]
    pub destination_kafka_tls: bool,

    #[envconfig(default = "")]
    pub destination_kafka_username: String,

    #[envconfig(default = "")]
    pub destination_kafka_password: String,

    #[envconfig(default = "")]
    pub kafka_destination_topic: String,

    // Read from the destination topic metadata when unset
    pub destination_partitions: Option<i32>,

    // Routing
    #[envconfig(default = "")]
    pub relay_partitioner: String,

    #[envconfig(default = "halt")]
    pub relay_on_routing_error: String,

    // Producer
    #[envconfig(default = "1000")]
    pub kafka_producer_flush_frequency_ms: u32,

    #[envconfig(default = "5388608")]
    pub kafka_producer_flush_bytes: u32,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String,

    #[envconfig(default = "10")]
    pub kafka_producer_max_retries: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "mirrormaker")]
    pub kafka_client_id: String,

    #[envconfig(default = "256")]
    pub production_queue_capacity: usize,

    #[envconfig(default = "300")]
    pub shutdown_timeout_secs: u64,

    // HTTP server configuration
    #[envconfig(default = "0.0.0.0:8080")]
    pub bind_address: String,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    // "json" or "text"
    #[envconfig(default = "text")]
    pub log_format: String,
}

impl Config {
    /// Initialize from environment variables (for production and tests)
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn log_json(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    /// Check the whole configuration once, before anything connects.
    pub fn validate(&self) -> Result<RelaySettings, RoutingError> {
        let policy: RoutingPolicy = self.relay_partitioner.parse()?;
        let on_routing_error: RoutingFailureMode = self.relay_on_routing_error.parse()?;

        let target_topic = self.kafka_destination_topic.trim().to_string();
        if target_topic.is_empty() {
            return Err(RoutingError::Configuration(
                "KAFKA_DESTINATION_TOPIC is not set".to_string(),
            ));
        }

        let source_topics: Vec<String> = self
            .kafka_source_topics
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if source_topics.is_empty() {
            return Err(RoutingError::Configuration(
                "KAFKA_SOURCE_TOPICS is not set".to_string(),
            ));
        }

        if let Some(partitions) = self.destination_partitions {
            if partitions <= 0 {
                return Err(RoutingError::Configuration(format!(
                    "DESTINATION_PARTITIONS must be positive, got {partitions}"
                )));
            }
        }
        if self.claim_buffer_size == 0 || self.production_queue_capacity == 0 {
            return Err(RoutingError::Configuration(
                "CLAIM_BUFFER_SIZE and PRODUCTION_QUEUE_CAPACITY must be positive".to_string(),
            ));
        }

        let mut source = KafkaConfig::new(&self.source_kafka_hosts);
        source.kafka_tls = self.source_kafka_tls;
        source.kafka_sasl =
            SaslCredentials::from_parts(&self.source_kafka_username, &self.source_kafka_password);
        source.kafka_client_id = self.kafka_client_id.clone();

        let mut destination = KafkaConfig::new(&self.destination_kafka_hosts);
        destination.kafka_tls = self.destination_kafka_tls;
        destination.kafka_sasl = SaslCredentials::from_parts(
            &self.destination_kafka_username,
            &self.destination_kafka_password,
        );
        destination.kafka_client_id = self.kafka_client_id.clone();

        Ok(RelaySettings {
            source,
            consumer: ConsumerConfig {
                kafka_consumer_group: self.kafka_consumer_group.clone(),
                kafka_consumer_topics: source_topics,
                kafka_consumer_offset_reset: self.kafka_consumer_offset_reset.clone(),
                kafka_consumer_auto_commit_interval_ms: self
                    .kafka_consumer_auto_commit_interval_ms,
            },
            destination,
            producer: ProducerConfig {
                kafka_producer_linger_ms: self.kafka_producer_flush_frequency_ms,
                kafka_producer_batch_bytes: self.kafka_producer_flush_bytes,
                kafka_compression_codec: CompressionCodec::from_name_or_none(
                    &self.kafka_compression_codec,
                ),
                kafka_producer_max_retries: self.kafka_producer_max_retries,
                kafka_message_timeout_ms: self.kafka_message_timeout_ms,
            },
            policy,
            target_topic,
            destination_partitions: self.destination_partitions,
            on_routing_error,
            claim_buffer_size: self.claim_buffer_size,
            production_queue_capacity: self.production_queue_capacity,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        })
    }
}

/// Validated settings the relay runs with.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub source: KafkaConfig,
    pub consumer: ConsumerConfig,
    pub destination: KafkaConfig,
    pub producer: ProducerConfig,
    pub policy: RoutingPolicy,
    pub target_topic: String,
    pub destination_partitions: Option<i32>,
    pub on_routing_error: RoutingFailureMode,
    pub claim_buffer_size: usize,
    pub production_queue_capacity: usize,
    pub shutdown_timeout: Duration,
}
