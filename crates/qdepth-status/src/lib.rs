//! qdepth-status — where scale events are announced.
//!
//! [`RedisPublisher`] publishes each event as JSON on a Redis pub/sub
//! channel. [`LogSink`] writes them to the log when no Redis is configured.

pub mod log;
pub mod redis;

pub use log::LogSink;
pub use redis::{RedisPublisher, Reply, encode_command};
