use std::fmt;
use std::str::FromStr;

use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::warn;

/// Connection settings for one Kafka cluster. The relay talks to two of
/// them (source and destination), each with its own TLS and SASL settings.
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    pub kafka_hosts: String,
    pub kafka_tls: bool,
    pub kafka_sasl: Option<SaslCredentials>,
    pub kafka_client_id: String,
}

/// SASL PLAIN credentials.
#[derive(Clone)]
pub struct SaslCredentials {
    pub username: String,
    pub password: String,
}

impl SaslCredentials {
    /// Credentials are only enabled when both parts are set.
    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl KafkaConfig {
    pub fn new(kafka_hosts: impl Into<String>) -> Self {
        Self {
            kafka_hosts: kafka_hosts.into(),
            kafka_tls: false,
            kafka_sasl: None,
            kafka_client_id: String::new(),
        }
    }

    /// librdkafka `security.protocol` for this cluster
    pub fn security_protocol(&self) -> &'static str {
        match (self.kafka_tls, self.kafka_sasl.is_some()) {
            (false, false) => "plaintext",
            (true, false) => "ssl",
            (false, true) => "sasl_plaintext",
            (true, true) => "sasl_ssl",
        }
    }

    /// Apply the connection settings shared by producers and consumers.
    pub fn apply(&self, client_config: &mut ClientConfig) {
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("security.protocol", self.security_protocol());

        if !self.kafka_client_id.is_empty() {
            client_config.set("client.id", &self.kafka_client_id);
        }

        if let Some(sasl) = &self.kafka_sasl {
            client_config
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", &sasl.username)
                .set("sasl.password", &sasl.password);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown compression codec: {0}")]
pub struct UnknownCodec(pub String);

impl FromStr for CompressionCodec {
    type Err = UnknownCodec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(CompressionCodec::None),
            "gzip" => Ok(CompressionCodec::Gzip),
            "snappy" => Ok(CompressionCodec::Snappy),
            "lz4" => Ok(CompressionCodec::Lz4),
            "zstd" => Ok(CompressionCodec::Zstd),
            _ => Err(UnknownCodec(s.to_string())),
        }
    }
}

impl CompressionCodec {
    /// Parse a codec name, falling back to no compression for unknown names.
    pub fn from_name_or_none(name: &str) -> Self {
        name.parse().unwrap_or_else(|e: UnknownCodec| {
            warn!("{e}, producing without compression");
            CompressionCodec::None
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionCodec::None => "none",
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Snappy => "snappy",
            CompressionCodec::Lz4 => "lz4",
            CompressionCodec::Zstd => "zstd",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProducerConfig {
    pub kafka_producer_linger_ms: u32, // Flush frequency: maximum time between producer batches
    pub kafka_producer_batch_bytes: u32, // Flush threshold: batch size in bytes
    pub kafka_compression_codec: CompressionCodec,
    pub kafka_producer_max_retries: u32,
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            kafka_producer_linger_ms: 1000,
            kafka_producer_batch_bytes: 5_388_608,
            kafka_compression_codec: CompressionCodec::None,
            kafka_producer_max_retries: 10,
            kafka_message_timeout_ms: 20_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topics: Vec<String>,

    // "latest" unless a group already committed offsets
    pub kafka_consumer_offset_reset: String,

    // Offsets are stored explicitly by the service and committed by the
    // client on this interval, and on partition revocation.
    pub kafka_consumer_auto_commit_interval_ms: u32,
}
