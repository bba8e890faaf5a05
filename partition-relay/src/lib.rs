pub mod config;
pub mod error;
pub mod events;
pub mod kafka;
pub mod metrics_consts;
pub mod ready;
pub mod router;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod signals;
