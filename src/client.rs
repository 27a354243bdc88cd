// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Client Abstraction
//!
//! The broker never talks to the wire directly. Everything it needs from an
//! AMQP client is captured by the [`AmqpClient`] trait: declaring exchanges and
//! queues, binding them, publishing, consuming and acknowledging. The
//! production implementation lives in [`crate::channel`]; tests substitute
//! their own.
//!
//! Messages handed back by a client are [`Envelope`]s, which own their body and
//! properties so they can outlive the delivery they came from.

use crate::{errors::AmqpError, exchange::ExchangeKind, otel::AmqpHeaderPropagator};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
#[cfg(test)]
use mockall::automock;
use opentelemetry::{global, Context};
use std::collections::BTreeMap;

/// Header maintained by the AMQP server each time a message is dead-lettered
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Header carrying the number of seconds a retried message waits
pub const AMQP_HEADERS_QUEUE_TIME: &str = "queue-time";
/// Header carrying the exchange a delayed message must return to
pub const AMQP_HEADERS_EXCHANGE: &str = "exchange";
/// Header counting how many times a message went through `retry`
pub const AMQP_HEADERS_RETRIES: &str = "retries";
/// Optional human readable reason attached to a retry
pub const AMQP_HEADERS_RETRY_MESSAGE: &str = "retry-message";

/// `delivery_mode` value asking the server to persist the message
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Stream of envelopes produced by a consumer.
pub type EnvelopeStream = BoxStream<'static, Result<Envelope, AmqpError>>;

/// Counters returned by the server when a queue is declared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// The narrow set of AMQP operations the broker relies on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpClient: Send + Sync {
    /// Opens the connection and the channel used by every other call.
    async fn connect(&mut self) -> Result<(), AmqpError>;

    /// Closes the channel and the connection.
    async fn disconnect(&mut self) -> Result<(), AmqpError>;

    fn is_connected(&self) -> bool;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueState, AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer on `queue` and returns the stream of its deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<EnvelopeStream, AmqpError>;

    /// Fetches a single message, if any is ready.
    async fn get(&self, queue: &str, options: BasicGetOptions)
        -> Result<Option<Envelope>, AmqpError>;

    async fn ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, options: BasicNackOptions) -> Result<(), AmqpError>;
}

/// A message received from a queue.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

impl Envelope {
    /// Creates an envelope for the given routing key and body.
    ///
    /// Mostly useful to build messages by hand; deliveries coming from a
    /// server are converted with `From<Delivery>`.
    pub fn new(routing_key: &str, body: &[u8]) -> Envelope {
        Envelope {
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            ..Envelope::default()
        }
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_delivery_tag(mut self, delivery_tag: u64) -> Self {
        self.delivery_tag = delivery_tag;
        self
    }

    /// Returns a copy of the message headers, ordered by name.
    pub fn headers(&self) -> BTreeMap<ShortString, AMQPValue> {
        match self.properties.headers() {
            Some(table) => table.inner().clone(),
            None => BTreeMap::default(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&AMQPValue> {
        self.properties
            .headers()
            .as_ref()
            .and_then(|table| table.inner().get(&ShortString::from(name)))
    }

    /// Number of times this message went through the retry workflow.
    ///
    /// The `retries` header written by the broker is the only counter read;
    /// a missing or non numeric header counts as zero.
    pub fn retries(&self) -> u32 {
        self.header(AMQP_HEADERS_RETRIES)
            .and_then(header_as_i64)
            .map(|count| count.clamp(0, i64::from(u32::MAX)) as u32)
            .unwrap_or_default()
    }

    /// Extracts the OpenTelemetry context propagated in the message headers.
    pub fn trace_context(&self) -> Context {
        let mut headers = self.headers();
        global::get_text_map_propagator(|propagator| {
            propagator.extract(&AmqpHeaderPropagator::new(&mut headers))
        })
    }
}

impl From<Delivery> for Envelope {
    fn from(delivery: Delivery) -> Self {
        Envelope {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            body: delivery.data,
            properties: delivery.properties,
        }
    }
}

/// Reads an integer out of a header value, whatever width the publisher used.
pub fn header_as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::ShortString(v) => v.as_str().trim().parse().ok(),
        AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    fn with_header(key: &str, value: AMQPValue) -> Envelope {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from(key), value);
        Envelope::new("orders", b"{}")
            .with_properties(BasicProperties::default().with_headers(FieldTable::from(headers)))
    }

    #[test]
    fn retries_defaults_to_zero_without_headers() {
        assert_eq!(Envelope::new("orders", b"").retries(), 0);
    }

    #[test]
    fn retries_accepts_any_integer_width() {
        assert_eq!(with_header("retries", AMQPValue::ShortShortUInt(3)).retries(), 3);
        assert_eq!(with_header("retries", AMQPValue::LongInt(4)).retries(), 4);
        assert_eq!(with_header("retries", AMQPValue::LongLongInt(5)).retries(), 5);
        assert_eq!(
            with_header("retries", AMQPValue::LongString(LongString::from("6"))).retries(),
            6
        );
    }

    #[test]
    fn retries_ignores_negative_and_garbage_values() {
        assert_eq!(with_header("retries", AMQPValue::LongInt(-2)).retries(), 0);
        assert_eq!(with_header("retries", AMQPValue::Boolean(true)).retries(), 0);
    }

    #[test]
    fn header_lookup_reads_strings() {
        let envelope = with_header("queue-time", AMQPValue::LongString(LongString::from("30")));

        assert_eq!(
            envelope.header("queue-time"),
            Some(&AMQPValue::LongString(LongString::from("30")))
        );
        assert!(envelope.header("missing").is_none());
    }
}
