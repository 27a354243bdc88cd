// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! This module provides the exchange declaration used by the broker. An
//! [`ExchangeSpec`] is a plain value describing one exchange (name, kind, flags
//! and arguments); declaring it and publishing through it are separate calls
//! against an [`AmqpClient`]. Three names are reserved by the broker and always
//! receive a fixed kind, see [`DEFAULT_EXCHANGE`], [`DEAD_LETTER_EXCHANGE`] and
//! [`RETRY_EXCHANGE`].

use crate::{
    client::{AmqpClient, DELIVERY_MODE_PERSISTENT},
    errors::AmqpError,
};
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use tracing::debug;

/// Exchange used when the caller does not name one
pub const DEFAULT_EXCHANGE: &str = "symfony.default";
/// Headers exchange routing retried and delayed messages into delay queues
pub const DEAD_LETTER_EXCHANGE: &str = "symfony.dead_letter";
/// Exchange every queue is bound to, under its own name, to receive retries
pub const RETRY_EXCHANGE: &str = "symfony.retry";

/// Represents the types of exchanges available in AMQP 0-9-1.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::InvalidArgument(format!(
                "unknown exchange type \"{}\"",
                other
            ))),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(name)
    }
}

/// Declaration flags of an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeFlags {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub passive: bool,
}

impl ExchangeFlags {
    pub fn durable() -> ExchangeFlags {
        ExchangeFlags {
            durable: true,
            ..ExchangeFlags::default()
        }
    }
}

impl From<ExchangeFlags> for ExchangeDeclareOptions {
    fn from(flags: ExchangeFlags) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: flags.passive,
            durable: flags.durable,
            auto_delete: flags.auto_delete,
            internal: flags.internal,
            nowait: false,
        }
    }
}

/// Options accepted when creating an exchange.
///
/// Missing flags mean a durable exchange, a missing kind means direct. The
/// kind is ignored for the reserved exchanges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeArguments {
    pub kind: Option<ExchangeKind>,
    pub flags: Option<ExchangeFlags>,
    pub arguments: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeArguments {
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn flags(mut self, flags: ExchangeFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }
}

/// Definition of one exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSpec {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) flags: ExchangeFlags,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeSpec {
    /// Creates a durable direct exchange definition.
    pub fn new(name: &str) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            flags: ExchangeFlags::durable(),
            arguments: BTreeMap::default(),
        }
    }

    /// Creates a definition from creation options, enforcing the kind of the
    /// reserved exchanges.
    pub fn from_arguments(name: &str, args: ExchangeArguments) -> ExchangeSpec {
        let kind = match name {
            DEAD_LETTER_EXCHANGE => ExchangeKind::Headers,
            RETRY_EXCHANGE => ExchangeKind::Direct,
            _ => args.kind.unwrap_or_default(),
        };

        ExchangeSpec {
            name: name.to_owned(),
            kind,
            flags: args.flags.unwrap_or_else(ExchangeFlags::durable),
            arguments: args.arguments,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn flags(&self) -> ExchangeFlags {
        self.flags
    }

    pub fn arguments(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.arguments
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ExchangeKind::Direct
    }

    /// Whether the broker reserves this exchange for the retry workflow.
    pub fn is_system(&self) -> bool {
        self.name == DEAD_LETTER_EXCHANGE || self.name == RETRY_EXCHANGE
    }

    /// Declares the exchange on the server.
    pub async fn declare<C>(&self, client: &C) -> Result<(), AmqpError>
    where
        C: AmqpClient + ?Sized,
    {
        debug!("creating exchange: {}", self.name);

        client
            .declare_exchange(
                &self.name,
                self.kind,
                self.flags.into(),
                FieldTable::from(self.arguments.clone()),
            )
            .await?;

        debug!("exchange: {} was created", self.name);
        Ok(())
    }

    /// Publishes a message through this exchange.
    ///
    /// Messages are persistent unless the caller set a `delivery_mode`.
    pub async fn publish<C>(
        &self,
        client: &C,
        routing_key: Option<&str>,
        body: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<(), AmqpError>
    where
        C: AmqpClient + ?Sized,
    {
        let properties = match properties.delivery_mode() {
            Some(_) => properties,
            None => properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT),
        };

        client
            .publish(
                &self.name,
                routing_key.unwrap_or_default(),
                body,
                options,
                properties,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAmqpClient;

    #[test]
    fn reserved_exchanges_have_fixed_kinds() {
        let dead_letter = ExchangeSpec::from_arguments(
            DEAD_LETTER_EXCHANGE,
            ExchangeArguments::default().kind(ExchangeKind::Fanout),
        );
        let retry = ExchangeSpec::from_arguments(
            RETRY_EXCHANGE,
            ExchangeArguments::default().kind(ExchangeKind::Topic),
        );

        assert_eq!(dead_letter.kind(), ExchangeKind::Headers);
        assert_eq!(retry.kind(), ExchangeKind::Direct);
        assert!(dead_letter.is_system());
        assert!(retry.is_system());
        assert!(!ExchangeSpec::new(DEFAULT_EXCHANGE).is_system());
    }

    #[test]
    fn defaults_to_durable_direct() {
        let spec = ExchangeSpec::from_arguments("orders", ExchangeArguments::default());

        assert_eq!(spec.kind(), ExchangeKind::Direct);
        assert_eq!(spec.flags(), ExchangeFlags::durable());
    }

    #[test]
    fn parses_kind_names() {
        assert_eq!("fanout".parse::<ExchangeKind>().unwrap(), ExchangeKind::Fanout);
        assert_eq!(ExchangeKind::Headers.to_string(), "headers");
        assert!("x-delayed-message".parse::<ExchangeKind>().is_err());
    }

    #[tokio::test]
    async fn declare_forwards_kind_and_flags() {
        let mut client = MockAmqpClient::new();
        client
            .expect_declare_exchange()
            .withf(|name, kind, options, _| {
                name == "events" && *kind == ExchangeKind::Fanout && options.durable
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let spec = ExchangeSpec::from_arguments(
            "events",
            ExchangeArguments::default().kind(ExchangeKind::Fanout),
        );

        spec.declare(&client).await.unwrap();
    }

    #[tokio::test]
    async fn publish_is_persistent_by_default() {
        let mut client = MockAmqpClient::new();
        client
            .expect_publish()
            .withf(|exchange, key, body, options, props| {
                exchange == "events"
                    && key == "order.created"
                    && body == b"payload"
                    && options.mandatory
                    && *props.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT)
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        ExchangeSpec::new("events")
            .publish(
                &client,
                Some("order.created"),
                b"payload",
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                BasicProperties::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_keeps_caller_delivery_mode() {
        let mut client = MockAmqpClient::new();
        client
            .expect_publish()
            .withf(|_, key, _, _, props| {
                key.is_empty()
                    && *props.delivery_mode() == Some(1)
                    && *props.message_id() == Some(ShortString::from("1234"))
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        ExchangeSpec::new("events")
            .publish(
                &client,
                None,
                b"payload",
                BasicPublishOptions::default(),
                BasicProperties::default()
                    .with_delivery_mode(1)
                    .with_message_id(ShortString::from("1234")),
            )
            .await
            .unwrap();
    }
}
