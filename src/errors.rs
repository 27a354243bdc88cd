// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Broker
//!
//! This module provides the error taxonomy shared by the broker facade and the
//! transport client. Configuration problems are reported as soon as the
//! configuration is built, retry failures carry enough context for the caller
//! to route the message somewhere final, and transport failures name the
//! operation that failed.

use crate::{client::Envelope, retry::RetryStrategy};
use thiserror::Error;

/// Represents errors that can occur while provisioning, publishing or consuming.
#[derive(Error, Debug)]
pub enum AmqpError {
    /// Bad static configuration: missing or duplicated names, wrong option types
    #[error("{0}")]
    InvalidArgument(String),

    /// The caller asked for something the broker was not set up to do
    #[error("{0}")]
    Logic(String),

    /// The retry strategy of the queue refused another attempt.
    ///
    /// Both the strategy and the envelope are returned so the caller can move
    /// the message to a final destination.
    #[error("message has been retried too many times ({})", .envelope.retries())]
    NonRetryable {
        strategy: RetryStrategy,
        envelope: Box<Envelope>,
    },

    /// Lookup of a queue that is neither registered nor configured
    #[error("queue `{0}` does not exist")]
    UndefinedQueue(String),

    /// Lookup of an exchange that is neither registered nor configured
    #[error("exchange `{0}` does not exist")]
    UndefinedExchange(String),

    /// An operation needed a live channel but the client is disconnected
    #[error("client is not connected")]
    NotConnected,

    /// Error establishing a connection to the AMQP server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error creating a consumer or receiving from it
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error fetching a single message
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}
