//! Redis adapter for notify-fanout
//!
//! This crate provides:
//! - `RedisBroker`: publish and subscribe through Redis Pub/Sub

mod broker;

pub use broker::{RedisBroker, RedisSubscriptionSink};
