//! Partition routing: maps a consumed message onto the destination topic.
//!
//! Routing is a pure function of the message and the active policy. Key and
//! value bytes are never rewritten, only forwarded (or, for `Random`, the key
//! is dropped).

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::RoutingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingPolicy {
    /// Keep the key, let the destination hash it to a partition
    Hash,
    /// Destination partition = source partition
    KeepPartition,
    /// Destination partition = source partition mod destination partition count
    Modulo,
    /// Drop the key, let the destination spread messages
    Random,
}

impl FromStr for RoutingPolicy {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hash" => Ok(RoutingPolicy::Hash),
            "keeppartition" => Ok(RoutingPolicy::KeepPartition),
            "modulo" => Ok(RoutingPolicy::Modulo),
            "random" => Ok(RoutingPolicy::Random),
            "" => Err(RoutingError::Configuration(
                "routing policy is not set".to_string(),
            )),
            other => Err(RoutingError::Configuration(format!(
                "unknown routing policy '{other}', must be one of hash, keeppartition, modulo, random"
            ))),
        }
    }
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutingPolicy::Hash => "hash",
            RoutingPolicy::KeepPartition => "keeppartition",
            RoutingPolicy::Modulo => "modulo",
            RoutingPolicy::Random => "random",
        };
        f.write_str(name)
    }
}

/// A message as delivered by the source cluster for one claimed partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub topic: String,
    pub partition: i32,
    pub key: Bytes,
    pub value: Bytes,
    pub offset: i64,
}

/// Where and what to produce for one source message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub topic: String,
    /// `None` lets the destination pick the partition (key hash or round robin)
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// Route a single message.
///
/// Checks run in a fixed order before the policy is applied: policy and
/// topic must be set and the partition count positive, then the value must
/// be non-empty, then the source partition must be non-negative.
pub fn map_message(
    message: &SourceMessage,
    policy: Option<RoutingPolicy>,
    target_topic: &str,
    num_target_partitions: i32,
) -> Result<RouteDecision, RoutingError> {
    let Some(policy) = policy else {
        return Err(RoutingError::Configuration(
            "routing policy is not set".to_string(),
        ));
    };
    if target_topic.is_empty() {
        return Err(RoutingError::Configuration(
            "target topic is not set".to_string(),
        ));
    }
    if num_target_partitions <= 0 {
        return Err(RoutingError::Configuration(format!(
            "destination partition count must be positive, got {num_target_partitions}"
        )));
    }
    if message.value.is_empty() {
        return Err(RoutingError::Validation("value is not set".to_string()));
    }
    if message.partition < 0 {
        return Err(RoutingError::Validation(format!(
            "source message has a negative partition: {}",
            message.partition
        )));
    }

    let topic = target_topic.to_string();
    match policy {
        RoutingPolicy::Hash => {
            if message.key.is_empty() {
                return Err(RoutingError::Validation(
                    "key is not set, cannot hash-route this message".to_string(),
                ));
            }
            Ok(RouteDecision {
                topic,
                partition: None,
                key: Some(message.key.clone()),
                value: message.value.clone(),
            })
        }
        RoutingPolicy::KeepPartition => {
            if message.partition >= num_target_partitions {
                return Err(RoutingError::Capacity {
                    partition: message.partition,
                    num_partitions: num_target_partitions,
                });
            }
            Ok(RouteDecision {
                topic,
                partition: Some(message.partition),
                key: Some(message.key.clone()),
                value: message.value.clone(),
            })
        }
        RoutingPolicy::Modulo => Ok(RouteDecision {
            topic,
            partition: Some(message.partition % num_target_partitions),
            key: Some(message.key.clone()),
            value: message.value.clone(),
        }),
        RoutingPolicy::Random => Ok(RouteDecision {
            topic,
            partition: None,
            key: None,
            value: message.value.clone(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub policy: RoutingPolicy,
    pub target_topic: String,
    pub num_target_partitions: i32,
}

/// Routing settings fixed for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    config: RouteConfig,
}

impl PartitionRouter {
    pub fn new(config: RouteConfig) -> Result<Self, RoutingError> {
        if config.target_topic.is_empty() {
            return Err(RoutingError::Configuration(
                "target topic is not set".to_string(),
            ));
        }
        if config.num_target_partitions <= 0 {
            return Err(RoutingError::Configuration(format!(
                "destination partition count must be positive, got {}",
                config.num_target_partitions
            )));
        }
        Ok(Self { config })
    }

    pub fn route(&self, message: &SourceMessage) -> Result<RouteDecision, RoutingError> {
        map_message(
            message,
            Some(self.config.policy),
            &self.config.target_topic,
            self.config.num_target_partitions,
        )
    }
}
