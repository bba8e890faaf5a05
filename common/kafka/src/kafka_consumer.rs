use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

pub fn consumer_client_config(cluster: &KafkaConfig, config: &ConsumerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    cluster.apply(&mut client_config);
    client_config
        .set("statistics.interval.ms", "10000")
        .set("group.id", &config.kafka_consumer_group)
        .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
        // Eager protocol: every revocation ends the whole claim generation
        .set("partition.assignment.strategy", "range")
        // The service controls when offsets advance, the client commits them
        .set("enable.auto.offset.store", "false")
        .set("enable.auto.commit", "true")
        .set(
            "auto.commit.interval.ms",
            config.kafka_consumer_auto_commit_interval_ms.to_string(),
        );
    client_config
}

/// Create a group consumer subscribed to all configured topics.
pub fn create_kafka_consumer<C>(
    cluster: &KafkaConfig,
    config: &ConsumerConfig,
    context: C,
) -> Result<StreamConsumer<C>, KafkaError>
where
    C: ConsumerContext + 'static,
{
    let client_config = consumer_client_config(cluster, config);
    debug!("rdkafka consumer configuration: {:?}", client_config);

    let consumer: StreamConsumer<C> = client_config.create_with_context(context)?;
    let topics: Vec<&str> = config
        .kafka_consumer_topics
        .iter()
        .map(String::as_str)
        .collect();
    consumer.subscribe(&topics)?;

    info!(
        "Subscribed consumer group '{}' to topics {:?}",
        config.kafka_consumer_group, topics
    );
    Ok(consumer)
}
