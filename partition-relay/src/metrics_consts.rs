// ==== Pipeline throughput ====
/// Counter for messages received from a claimed source partition
pub const RELAY_MESSAGES_CONSUMED: &str = "relay_messages_consumed";

/// Counter for messages routed, handed to the production queue and marked
pub const RELAY_MESSAGES_PROCESSED: &str = "relay_messages_processed";

/// Counter for messages acknowledged by the destination cluster
pub const RELAY_MESSAGES_PRODUCED: &str = "relay_messages_produced";

// ==== Errors ====
/// Counter for routing failures, labelled by error class
pub const RELAY_ROUTING_ERRORS: &str = "relay_routing_errors";

/// Counter for errors on the consuming side's error stream
pub const RELAY_CONSUMER_ERRORS: &str = "relay_consumer_errors";

/// Counter for errors on the producing side's error stream
pub const RELAY_PRODUCER_ERRORS: &str = "relay_producer_errors";

/// Counter for events dropped because the event queue was full
pub const RELAY_DROPPED_EVENTS: &str = "relay_dropped_events";

// ==== Lifecycle ====
/// Counter for rebalance callbacks, labelled by event_type (assign/revoke)
pub const RELAY_REBALANCES: &str = "relay_rebalances";

/// Counter for finished shutdowns, labelled by whether both sides closed in time
pub const RELAY_SHUTDOWN_COMPLETED: &str = "relay_shutdown_completed";
