use std::time::Duration;

use rdkafka::client::Client;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::{ClientConfig, ClientContext};
use tracing::{debug, error, info};

use crate::config::{KafkaConfig, ProducerConfig};

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

pub fn producer_client_config(cluster: &KafkaConfig, config: &ProducerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    cluster.apply(&mut client_config);
    client_config
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set("batch.size", config.kafka_producer_batch_bytes.to_string())
        .set(
            "message.send.max.retries",
            config.kafka_producer_max_retries.to_string(),
        )
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("compression.codec", config.kafka_compression_codec.as_str());
    client_config
}

pub async fn create_kafka_producer<C>(
    cluster: &KafkaConfig,
    config: &ProducerConfig,
    context: C,
) -> Result<FutureProducer<C>, KafkaError>
where
    C: ClientContext + 'static,
{
    let client_config = producer_client_config(cluster, config);

    debug!("rdkafka producer configuration: {:?}", client_config);
    let api: FutureProducer<C> = client_config.create_with_context(context)?;

    // "Ping" the Kafka brokers by requesting metadata
    match api.client().fetch_metadata(None, METADATA_TIMEOUT) {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers at {}. Found {} topics.",
                cluster.kafka_hosts,
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

/// Number of partitions of `topic` according to the cluster metadata.
/// Returns `None` when the topic does not exist or reports an error.
pub fn topic_partition_count<C: ClientContext>(
    client: &Client<C>,
    topic: &str,
) -> Result<Option<usize>, KafkaError> {
    let metadata = client.fetch_metadata(Some(topic), METADATA_TIMEOUT)?;
    let count = metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .filter(|t| t.error().is_none())
        .map(|t| t.partitions().len());
    Ok(count)
}
