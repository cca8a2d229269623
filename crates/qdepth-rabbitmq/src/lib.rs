//! qdepth-rabbitmq — queue depth from the RabbitMQ management API.
//!
//! A job type names an exchange. Its depth is the sum of the ready and
//! unacknowledged message counts of every queue bound to that exchange.

pub mod client;

pub use client::{Binding, QueueInfo, RabbitBroker, aggregate_depth};
