//! rdkafka adapters: the source cluster as a [`ClaimSource`] and the
//! destination cluster as a production worker.
//!
//! [`ClaimSource`]: crate::session::claim::ClaimSource

pub mod producer;
pub mod source;
