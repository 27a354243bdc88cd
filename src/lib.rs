// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod dsn;
pub mod errors;
pub mod exchange;
pub mod queue;
pub mod retry;
pub mod topology;

pub use broker::{Broker, PublishAttributes, QueueHealth, SharedBroker};
pub use channel::LapinClient;
pub use client::{AmqpClient, Envelope};
pub use config::Configuration;
pub use errors::AmqpError;
