// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! This module provides the queue declaration used by the broker. A
//! [`QueueSpec`] carries everything the broker knows about a queue: its
//! declaration flags and arguments, the ordered list of its bindings, an
//! optional retry strategy and the pattern naming its delay queues.
//!
//! Every queue is bound to the retry exchange under its own name. That binding
//! is what brings a retried message back to the queue it failed in once its
//! delay expired.

use crate::{
    client::{AmqpClient, QueueState},
    errors::AmqpError,
    exchange::{DEFAULT_EXCHANGE, RETRY_EXCHANGE},
    retry::RetryStrategy,
};
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, ShortString},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Default name pattern of the delay queues created for a retried queue
pub const DEFAULT_RETRY_QUEUE_PATTERN: &str = "%exchange%.%time%.wait";

/// Expands a delay queue pattern. `%time%` is zero padded to six digits.
pub fn delay_queue_name(pattern: &str, exchange: &str, seconds: u64) -> String {
    pattern
        .replace("%exchange%", exchange)
        .replace("%time%", &format!("{:06}", seconds))
}

/// One subscription of a queue to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub exchange: String,
    /// `None` binds without a routing key, as headers and fanout exchanges do
    pub routing_key: Option<String>,
    pub arguments: BTreeMap<ShortString, AMQPValue>,
}

impl Binding {
    pub fn new(exchange: &str, routing_key: Option<&str>) -> Binding {
        Binding {
            exchange: exchange.to_owned(),
            routing_key: routing_key.map(str::to_owned),
            arguments: BTreeMap::default(),
        }
    }

    pub fn arguments(mut self, arguments: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Routing keys a queue is bound with on its exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RoutingKeys {
    /// One binding using the queue name as routing key
    #[default]
    QueueName,
    /// One binding without routing key
    Any,
    /// No binding at all, besides the retry one
    Unbound,
    /// One binding per key
    Keys(Vec<String>),
}

/// Declaration flags of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueFlags {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub passive: bool,
}

impl QueueFlags {
    pub fn durable() -> QueueFlags {
        QueueFlags {
            durable: true,
            ..QueueFlags::default()
        }
    }
}

impl From<QueueFlags> for QueueDeclareOptions {
    fn from(flags: QueueFlags) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: flags.passive,
            durable: flags.durable,
            exclusive: flags.exclusive,
            auto_delete: flags.auto_delete,
            nowait: false,
        }
    }
}

/// Options accepted when creating a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueArguments {
    /// Exchange the routing key bindings point to, the default exchange if unset
    pub exchange: Option<String>,
    pub routing_keys: RoutingKeys,
    /// Declaration flags, a durable queue if unset
    pub flags: Option<QueueFlags>,
    pub retry_strategy: Option<RetryStrategy>,
    pub retry_queue_pattern: Option<String>,
    /// Arguments of every binding, e.g. `x-match` for headers exchanges
    pub bind_arguments: BTreeMap<ShortString, AMQPValue>,
    /// Queue arguments such as `x-message-ttl`
    pub arguments: BTreeMap<ShortString, AMQPValue>,
}

impl QueueArguments {
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    pub fn routing_keys(mut self, keys: RoutingKeys) -> Self {
        self.routing_keys = keys;
        self
    }

    pub fn routing_key(self, key: &str) -> Self {
        self.routing_keys(RoutingKeys::Keys(vec![key.to_owned()]))
    }

    pub fn flags(mut self, flags: QueueFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn retry_queue_pattern(mut self, pattern: &str) -> Self {
        self.retry_queue_pattern = Some(pattern.to_owned());
        self
    }

    pub fn bind_argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.bind_arguments.insert(ShortString::from(key), value);
        self
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }
}

/// Definition of one queue and its bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub(crate) name: String,
    pub(crate) flags: QueueFlags,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) retry_strategy: Option<RetryStrategy>,
    pub(crate) retry_queue_pattern: String,
}

impl QueueSpec {
    /// Creates a queue definition. Nothing is sent to the server yet.
    ///
    /// One binding is built per routing key on the queue's exchange, then the
    /// binding to the retry exchange under the queue name is appended.
    ///
    /// # Parameters
    /// * `name` - Name of the queue
    /// * `args` - Creation options, see [`QueueArguments`]
    ///
    /// # Returns
    /// A definition, durable unless `args` sets flags
    pub fn new(name: &str, args: QueueArguments) -> QueueSpec {
        let exchange = args
            .exchange
            .unwrap_or_else(|| DEFAULT_EXCHANGE.to_owned());

        let keys: Vec<Option<String>> = match args.routing_keys {
            RoutingKeys::QueueName => vec![Some(name.to_owned())],
            RoutingKeys::Any => vec![None],
            RoutingKeys::Unbound => vec![],
            RoutingKeys::Keys(keys) => keys.into_iter().map(Some).collect(),
        };

        let mut bindings: Vec<Binding> = keys
            .into_iter()
            .map(|routing_key| Binding {
                exchange: exchange.clone(),
                routing_key,
                arguments: args.bind_arguments.clone(),
            })
            .collect();

        bindings.push(Binding {
            exchange: RETRY_EXCHANGE.to_owned(),
            routing_key: Some(name.to_owned()),
            arguments: args.bind_arguments,
        });

        QueueSpec {
            name: name.to_owned(),
            flags: args.flags.unwrap_or_else(QueueFlags::durable),
            arguments: args.arguments,
            bindings,
            retry_strategy: args.retry_strategy,
            retry_queue_pattern: args
                .retry_queue_pattern
                .unwrap_or_else(|| DEFAULT_RETRY_QUEUE_PATTERN.to_owned()),
        }
    }

    /// Adds a binding unless the queue already has the same one.
    ///
    /// # Parameters
    /// * `binding` - Exchange, routing key and arguments of the subscription
    ///
    /// # Returns
    /// * `QueueSpec` - The definition, bound once to that exchange and key
    pub fn with_binding(mut self, binding: Binding) -> Self {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    pub fn arguments(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.arguments
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Bindings of this queue on the given exchange.
    pub fn bindings_to<'a>(&'a self, exchange: &'a str) -> impl Iterator<Item = &'a Binding> {
        self.bindings
            .iter()
            .filter(move |binding| binding.exchange == exchange)
    }

    pub fn retry_strategy(&self) -> Option<&RetryStrategy> {
        self.retry_strategy.as_ref()
    }

    pub fn retry_queue_pattern(&self) -> &str {
        &self.retry_queue_pattern
    }

    /// Name of the delay queue holding this queue's retries for `seconds`.
    pub fn retry_queue_name(&self, seconds: u64) -> String {
        delay_queue_name(&self.retry_queue_pattern, RETRY_EXCHANGE, seconds)
    }

    /// Declares the queue on the server.
    pub async fn declare<C>(&self, client: &C) -> Result<QueueState, AmqpError>
    where
        C: AmqpClient + ?Sized,
    {
        debug!("creating queue: {}", self.name);

        let state = client
            .declare_queue(
                &self.name,
                self.flags.into(),
                FieldTable::from(self.arguments.clone()),
            )
            .await?;

        debug!("queue: {} was created", self.name);
        Ok(state)
    }

    /// Binds the queue to the exchanges of all its bindings, in order.
    pub async fn bind<C>(&self, client: &C) -> Result<(), AmqpError>
    where
        C: AmqpClient + ?Sized,
    {
        for binding in &self.bindings {
            let routing_key = binding.routing_key.as_deref().unwrap_or_default();
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                self.name, binding.exchange, routing_key
            );

            if let Err(err) = client
                .bind_queue(
                    &self.name,
                    &binding.exchange,
                    routing_key,
                    FieldTable::from(binding.arguments.clone()),
                )
                .await
            {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        Ok(())
    }

    pub async fn declare_and_bind<C>(&self, client: &C) -> Result<QueueState, AmqpError>
    where
        C: AmqpClient + ?Sized,
    {
        let state = self.declare(client).await?;
        self.bind(client).await?;
        Ok(state)
    }
}
