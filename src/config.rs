// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Static Broker Configuration
//!
//! The broker knows queues and exchanges by name before they exist on the
//! server. Their configuration is given once, as JSON values, and validated
//! entirely when the [`Configuration`] is built: a missing or duplicated name,
//! a value of the wrong type or an unknown retry strategy is reported right
//! away rather than on first use.
//!
//! Example of a configuration document:
//!
//! ```json
//! {
//!   "queues": [
//!     {
//!       "name": "project.created",
//!       "arguments": { "routing_keys": ["project.created"], "x-max-length": 1000 },
//!       "retry_strategy": "exponential",
//!       "retry_strategy_options": { "max": 5, "offset": 2 },
//!       "thresholds": { "warning": 100, "critical": 1000 }
//!     }
//!   ],
//!   "exchanges": [
//!     { "name": "broadcast", "arguments": { "type": "fanout" } }
//!   ]
//! }
//! ```

use crate::{
    errors::AmqpError,
    exchange::{ExchangeArguments, ExchangeFlags, ExchangeKind},
    queue::{QueueArguments, QueueFlags, RoutingKeys},
    retry::{RetryStrategy, RetryStrategyKind, RetryStrategyOptions},
};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Queue sizes at which a queue is considered unhealthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: Option<u32>,
    pub critical: Option<u32>,
}

/// Validated configuration of one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfiguration {
    pub name: String,
    pub arguments: QueueArguments,
    pub thresholds: Thresholds,
}

impl QueueConfiguration {
    pub fn retry_strategy(&self) -> Option<&RetryStrategy> {
        self.arguments.retry_strategy.as_ref()
    }
}

/// Validated configuration of one exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeConfiguration {
    pub name: String,
    pub arguments: ExchangeArguments,
}

/// Immutable registry of the configured queues and exchanges.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    queues: Vec<QueueConfiguration>,
    queues_index: HashMap<String, usize>,
    exchanges: Vec<ExchangeConfiguration>,
    exchanges_index: HashMap<String, usize>,
}

#[derive(Deserialize)]
struct ConfigurationDocument {
    #[serde(default)]
    queues: Vec<Value>,
    #[serde(default)]
    exchanges: Vec<Value>,
}

#[derive(Deserialize)]
struct RawQueueConfiguration {
    name: String,
    arguments: RawQueueArguments,
    retry_strategy: Option<RetryStrategyKind>,
    retry_strategy_options: RetryStrategyOptions,
    thresholds: Thresholds,
}

#[derive(Deserialize)]
struct RawQueueArguments {
    exchange: Option<String>,
    #[serde(default, deserialize_with = "deserialize_routing_keys")]
    routing_keys: RoutingKeys,
    flags: Option<QueueFlags>,
    retry_strategy_queue_pattern: Option<String>,
    #[serde(default)]
    bind_arguments: Map<String, Value>,
    #[serde(flatten)]
    arguments: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawExchangeConfiguration {
    name: String,
    arguments: RawExchangeArguments,
}

#[derive(Deserialize)]
struct RawExchangeArguments {
    #[serde(rename = "type")]
    kind: Option<ExchangeKind>,
    flags: Option<ExchangeFlags>,
    #[serde(flatten)]
    arguments: Map<String, Value>,
}

impl Configuration {
    /// Builds the registry from a list of queue and a list of exchange
    /// configurations.
    pub fn new(queues: Vec<Value>, exchanges: Vec<Value>) -> Result<Configuration, AmqpError> {
        let mut configuration = Configuration::default();

        let queue_defaults = json!({
            "arguments": {},
            "retry_strategy": null,
            "retry_strategy_options": {},
            "thresholds": { "warning": null, "critical": null },
        });
        for raw in queues {
            let name = required_name(&raw, "a queue")?;
            if configuration.queues_index.contains_key(&name) {
                return Err(AmqpError::InvalidArgument(format!(
                    "a queue named \"{}\" already exists",
                    name
                )));
            }

            let queue = parse_queue(&name, merge_defaults(&queue_defaults, raw))?;
            configuration
                .queues_index
                .insert(name, configuration.queues.len());
            configuration.queues.push(queue);
        }

        let exchange_defaults = json!({ "arguments": {} });
        for raw in exchanges {
            let name = required_name(&raw, "an exchange")?;
            if configuration.exchanges_index.contains_key(&name) {
                return Err(AmqpError::InvalidArgument(format!(
                    "an exchange named \"{}\" already exists",
                    name
                )));
            }

            let exchange = parse_exchange(&name, merge_defaults(&exchange_defaults, raw))?;
            configuration
                .exchanges_index
                .insert(name, configuration.exchanges.len());
            configuration.exchanges.push(exchange);
        }

        Ok(configuration)
    }

    /// Builds the registry from a `{"queues": [...], "exchanges": [...]}` document.
    pub fn from_json(document: &str) -> Result<Configuration, AmqpError> {
        let document: ConfigurationDocument = serde_json::from_str(document).map_err(|err| {
            AmqpError::InvalidArgument(format!("invalid broker configuration: {}", err))
        })?;

        Configuration::new(document.queues, document.exchanges)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfiguration> {
        self.queues_index.get(name).map(|index| &self.queues[*index])
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeConfiguration> {
        self.exchanges_index
            .get(name)
            .map(|index| &self.exchanges[*index])
    }

    /// Configured queues, in configuration order.
    pub fn queues(&self) -> &[QueueConfiguration] {
        &self.queues
    }

    pub fn exchanges(&self) -> &[ExchangeConfiguration] {
        &self.exchanges
    }
}

fn required_name(raw: &Value, what: &str) -> Result<String, AmqpError> {
    match raw.get("name") {
        Some(Value::String(name)) => Ok(name.clone()),
        _ => Err(AmqpError::InvalidArgument(format!(
            "the key \"name\" is required to configure {}",
            what
        ))),
    }
}

fn merge_defaults(defaults: &Value, raw: Value) -> Value {
    let mut merged = defaults.clone();
    merge(&mut merged, raw);
    merged
}

/// Recursively merges `overrides` into `base`: nested objects are merged key by
/// key, any other value replaces the base one.
pub(crate) fn merge(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                merge(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, overrides) => *base = overrides,
    }
}

fn parse_queue(name: &str, merged: Value) -> Result<QueueConfiguration, AmqpError> {
    let raw: RawQueueConfiguration = serde_json::from_value(merged).map_err(|err| {
        AmqpError::InvalidArgument(format!("invalid configuration for queue \"{}\": {}", name, err))
    })?;

    let retry_strategy = raw
        .retry_strategy
        .map(|kind| RetryStrategy::from_options(kind, &raw.retry_strategy_options))
        .transpose()?;

    Ok(QueueConfiguration {
        name: raw.name,
        arguments: QueueArguments {
            exchange: raw.arguments.exchange,
            routing_keys: raw.arguments.routing_keys,
            flags: raw.arguments.flags,
            retry_strategy,
            retry_queue_pattern: raw.arguments.retry_strategy_queue_pattern,
            bind_arguments: amqp_table(raw.arguments.bind_arguments),
            arguments: amqp_table(raw.arguments.arguments),
        },
        thresholds: raw.thresholds,
    })
}

fn parse_exchange(name: &str, merged: Value) -> Result<ExchangeConfiguration, AmqpError> {
    let raw: RawExchangeConfiguration = serde_json::from_value(merged).map_err(|err| {
        AmqpError::InvalidArgument(format!(
            "invalid configuration for exchange \"{}\": {}",
            name, err
        ))
    })?;

    Ok(ExchangeConfiguration {
        name: raw.name,
        arguments: ExchangeArguments {
            kind: raw.arguments.kind,
            flags: raw.arguments.flags,
            arguments: amqp_table(raw.arguments.arguments),
        },
    })
}

fn deserialize_routing_keys<'de, D>(deserializer: D) -> Result<RoutingKeys, D::Error>
where
    D: Deserializer<'de>,
{
    let invalid = |given: &str| -> D::Error {
        serde::de::Error::custom(format!(
            "\"routing_keys\" option should be a string, false, null or an array of string, \"{}\" given",
            given
        ))
    };

    match Value::deserialize(deserializer)? {
        Value::Null => Ok(RoutingKeys::Any),
        Value::Bool(false) => Ok(RoutingKeys::Unbound),
        Value::String(key) => Ok(RoutingKeys::Keys(vec![key])),
        Value::Array(keys) => keys
            .into_iter()
            .map(|key| match key {
                Value::String(key) => Ok(key),
                _ => Err(invalid("array")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(RoutingKeys::Keys),
        Value::Bool(true) => Err(invalid("boolean")),
        Value::Number(_) => Err(invalid("number")),
        Value::Object(_) => Err(invalid("object")),
    }
}

/// Converts a JSON value to the closest AMQP field value.
pub(crate) fn amqp_value(value: Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(v),
        Value::Number(v) => match v.as_i64() {
            Some(int) => AMQPValue::LongLongInt(int),
            None => AMQPValue::Double(v.as_f64().unwrap_or_default()),
        },
        Value::String(v) => AMQPValue::LongString(LongString::from(v)),
        Value::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.into_iter().map(amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => AMQPValue::FieldTable(FieldTable::from(amqp_table(map))),
    }
}

pub(crate) fn amqp_table(map: Map<String, Value>) -> BTreeMap<ShortString, AMQPValue> {
    map.into_iter()
        .map(|(key, value)| (ShortString::from(key), amqp_value(value)))
        .collect()
}
