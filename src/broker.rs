// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker
//!
//! The broker turns a thin [`AmqpClient`] into named, declaratively configured
//! exchanges and queues:
//!
//! - exchanges and queues are declared lazily, the first time they are used,
//!   from the static [`Configuration`] or with sane defaults;
//! - publishing a message provisions whatever queue is needed for it to be
//!   routed somewhere, falling back to a queue named after the routing key;
//! - a failed message can be retried later: it is parked in a delay queue bound
//!   to the dead letter exchange, whose TTL sends it back to its original queue
//!   through the retry exchange.
//!
//! A broker owns its registries. Operations mutating them take `&mut self`;
//! wrap the broker in a [`SharedBroker`] to use it from several tasks.

use crate::{
    client::{
        AmqpClient, Envelope, AMQP_HEADERS_EXCHANGE, AMQP_HEADERS_QUEUE_TIME,
        AMQP_HEADERS_RETRIES, AMQP_HEADERS_RETRY_MESSAGE, AMQP_HEADERS_X_DEATH,
    },
    config::{Configuration, QueueConfiguration, Thresholds},
    errors::AmqpError,
    exchange::{
        ExchangeArguments, ExchangeSpec, DEAD_LETTER_EXCHANGE, DEFAULT_EXCHANGE, RETRY_EXCHANGE,
    },
    otel,
    queue::{
        delay_queue_name, Binding, QueueArguments, QueueSpec, DEFAULT_RETRY_QUEUE_PATTERN,
    },
    retry::RetryStrategy,
    topology::{
        plan_lazy_queues, should_create_queue, BindingIndex, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_MESSAGE_TTL, AMQP_HEADERS_X_MATCH,
    },
};
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::{global, trace::Span};
use std::{
    collections::{BTreeMap, HashMap},
    ops::ControlFlow,
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A broker shared between tasks.
pub type SharedBroker<C> = Arc<Mutex<Broker<C>>>;

/// Options of a publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishAttributes {
    /// Exchange to publish on, the default exchange if unset
    pub exchange: Option<String>,
    /// Publish flags, `mandatory` if unset
    pub options: Option<BasicPublishOptions>,
    pub properties: BasicProperties,
}

impl PublishAttributes {
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    pub fn options(mut self, options: BasicPublishOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn headers(mut self, headers: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.properties = self.properties.with_headers(FieldTable::from(headers));
        self
    }
}

/// Size of a queue compared to its configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueHealth {
    Healthy { messages: u32 },
    Warning { messages: u32 },
    Critical { messages: u32 },
}

impl QueueHealth {
    pub fn classify(messages: u32, thresholds: &Thresholds) -> QueueHealth {
        let reached = |threshold: Option<u32>| threshold.is_some_and(|limit| messages >= limit);

        if reached(thresholds.critical) {
            QueueHealth::Critical { messages }
        } else if reached(thresholds.warning) {
            QueueHealth::Warning { messages }
        } else {
            QueueHealth::Healthy { messages }
        }
    }
}

/// Named exchanges and queues on top of an [`AmqpClient`].
pub struct Broker<C: AmqpClient> {
    client: C,
    configuration: Configuration,
    connected: bool,
    exchanges: HashMap<String, Arc<ExchangeSpec>>,
    queues: HashMap<String, Arc<QueueSpec>>,
    bindings: BindingIndex,
}

impl<C: AmqpClient> Broker<C> {
    /// Creates a disconnected broker. The connection is opened by
    /// [`Broker::connect`] or by the first operation needing it.
    pub fn new(client: C, configuration: Configuration) -> Broker<C> {
        Broker {
            client,
            configuration,
            connected: false,
            exchanges: HashMap::default(),
            queues: HashMap::default(),
            bindings: BindingIndex::default(),
        }
    }

    pub fn into_shared(self) -> SharedBroker<C> {
        Arc::new(Mutex::new(self))
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Configured queues, in configuration order.
    pub fn queues_configuration(&self) -> &[QueueConfiguration] {
        self.configuration.queues()
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.client.is_connected()
    }

    /// Connects and declares the retry exchange every queue is bound to.
    pub async fn connect(&mut self) -> Result<(), AmqpError> {
        self.clear_registries();

        if !self.client.is_connected() {
            self.client.connect().await?;
        }

        let retry = ExchangeSpec::from_arguments(RETRY_EXCHANGE, self.exchange_arguments(RETRY_EXCHANGE));
        retry.declare(&self.client).await?;
        self.exchanges
            .insert(RETRY_EXCHANGE.to_owned(), Arc::new(retry));

        self.connected = true;
        debug!("broker connected");
        Ok(())
    }

    /// Disconnects and forgets every declared exchange and queue. The
    /// configuration is kept.
    pub async fn disconnect(&mut self) -> Result<(), AmqpError> {
        self.clear_registries();
        self.connected = false;

        if self.client.is_connected() {
            self.client.disconnect().await?;
        }

        debug!("broker disconnected");
        Ok(())
    }

    /// Declares a new exchange and registers it, replacing any exchange with
    /// the same name.
    ///
    /// The reserved exchanges keep their fixed kind whatever `args` says.
    ///
    /// # Parameters
    /// * `name` - Name of the exchange
    /// * `args` - Kind, flags and `x-` arguments
    ///
    /// # Returns
    /// * `Result<Arc<ExchangeSpec>, AmqpError>` - The registered definition
    pub async fn create_exchange(
        &mut self,
        name: &str,
        args: ExchangeArguments,
    ) -> Result<Arc<ExchangeSpec>, AmqpError> {
        self.ensure_connected().await?;
        self.declare_exchange(ExchangeSpec::from_arguments(name, args))
            .await
    }

    /// Returns a registered exchange, declaring it from the configuration if
    /// needed.
    ///
    /// # Parameters
    /// * `name` - Name of the exchange
    ///
    /// # Returns
    /// * `Result<Arc<ExchangeSpec>, AmqpError>` - The registered definition, or
    ///   `UndefinedExchange` when the name is neither registered nor configured
    pub async fn get_exchange(&mut self, name: &str) -> Result<Arc<ExchangeSpec>, AmqpError> {
        self.ensure_connected().await?;

        if let Some(exchange) = self.exchanges.get(name) {
            return Ok(exchange.clone());
        }

        match self.configuration.exchange(name) {
            Some(config) => {
                let spec = ExchangeSpec::from_arguments(name, config.arguments.clone());
                self.declare_exchange(spec).await
            }
            None => Err(AmqpError::UndefinedExchange(name.to_owned())),
        }
    }

    /// Registers an exchange declared elsewhere, replacing any exchange with
    /// the same name.
    pub fn add_exchange(&mut self, exchange: ExchangeSpec) -> Arc<ExchangeSpec> {
        let exchange = Arc::new(exchange);
        self.exchanges
            .insert(exchange.name().to_owned(), exchange.clone());
        exchange
    }

    /// Declares a new queue, binds it and registers it.
    ///
    /// Every exchange the queue is bound to is declared first, from the
    /// configuration or as a durable direct exchange.
    ///
    /// # Parameters
    /// * `name` - Name of the queue
    /// * `args` - Exchange, routing keys, flags, retry strategy and arguments
    ///
    /// # Returns
    /// * `Result<Arc<QueueSpec>, AmqpError>` - The registered definition
    pub async fn create_queue(
        &mut self,
        name: &str,
        args: QueueArguments,
    ) -> Result<Arc<QueueSpec>, AmqpError> {
        self.ensure_connected().await?;
        self.declare_queue(QueueSpec::new(name, args)).await
    }

    /// Returns a registered queue, declaring it from the configuration if
    /// needed.
    ///
    /// Calling it twice returns the same `Arc`.
    ///
    /// # Parameters
    /// * `name` - Name of the queue
    ///
    /// # Returns
    /// * `Result<Arc<QueueSpec>, AmqpError>` - The registered definition, or
    ///   `UndefinedQueue` when the name is neither registered nor configured
    pub async fn get_queue(&mut self, name: &str) -> Result<Arc<QueueSpec>, AmqpError> {
        self.ensure_connected().await?;

        if let Some(queue) = self.queues.get(name) {
            return Ok(queue.clone());
        }

        match self.configuration.queue(name) {
            Some(config) => {
                let spec = QueueSpec::new(name, config.arguments.clone());
                self.declare_queue(spec).await
            }
            None => Err(AmqpError::UndefinedQueue(name.to_owned())),
        }
    }

    /// Registers a queue declared elsewhere, replacing any queue with the same
    /// name.
    pub fn add_queue(&mut self, queue: QueueSpec) -> Arc<QueueSpec> {
        for binding in queue.bindings() {
            self.bindings
                .record(&binding.exchange, binding.routing_key.as_deref());
        }

        let queue = Arc::new(queue);
        self.queues.insert(queue.name().to_owned(), queue.clone());
        queue
    }

    pub fn has_retry_strategy(&self, queue: &str) -> bool {
        self.retry_strategy(queue).is_some()
    }

    /// Publishes a message, provisioning the exchange and the queues needed
    /// to route it.
    ///
    /// Configured queues bound to the exchange for this routing key are
    /// declared first. When none matches, a queue named after the routing key
    /// is created so the message is not dropped.
    ///
    /// # Parameters
    /// * `routing_key` - Routing key, sent as `""` when `None`
    /// * `body` - Message payload
    /// * `attributes` - Exchange, publish flags and properties
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - Ok once the client accepted the message
    pub async fn publish(
        &mut self,
        routing_key: Option<&str>,
        body: &[u8],
        attributes: PublishAttributes,
    ) -> Result<(), AmqpError> {
        self.ensure_connected().await?;

        let exchange_name = attributes
            .exchange
            .unwrap_or_else(|| DEFAULT_EXCHANGE.to_owned());
        let exchange = self.get_or_create_exchange(&exchange_name).await?;

        if should_create_queue(&exchange, routing_key) {
            self.setup_queues(&exchange, routing_key).await?;
        }

        let options = attributes.options.unwrap_or(BasicPublishOptions {
            mandatory: true,
            immediate: false,
        });

        debug!(
            exchange = exchange.name(),
            routing_key = routing_key.unwrap_or_default(),
            "publishing message"
        );

        exchange
            .publish(&self.client, routing_key, body, options, attributes.properties)
            .await
    }

    /// Publishes a message that reaches its queues only after `seconds`.
    ///
    /// The message waits in a delay queue bound to the dead letter exchange,
    /// then expires back to its original exchange.
    ///
    /// # Parameters
    /// * `routing_key` - Routing key of the message on its original exchange
    /// * `body` - Message payload
    /// * `seconds` - Delay before delivery
    /// * `attributes` - Original exchange, publish flags and properties
    pub async fn delay(
        &mut self,
        routing_key: &str,
        body: &[u8],
        seconds: u64,
        attributes: PublishAttributes,
    ) -> Result<(), AmqpError> {
        self.ensure_connected().await?;

        let exchange_name = attributes
            .exchange
            .clone()
            .unwrap_or_else(|| DEFAULT_EXCHANGE.to_owned());
        let exchange = self.get_or_create_exchange(&exchange_name).await?;

        if should_create_queue(&exchange, Some(routing_key)) {
            self.setup_queues(&exchange, Some(routing_key)).await?;
        }

        self.create_delayed_queue(routing_key, seconds, Some(&exchange_name))
            .await?;

        let mut headers = headers_of(&attributes.properties);
        headers.insert(
            ShortString::from(AMQP_HEADERS_QUEUE_TIME),
            AMQPValue::LongString(LongString::from(seconds.to_string())),
        );
        headers.insert(
            ShortString::from(AMQP_HEADERS_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange_name)),
        );

        self.publish(
            Some(routing_key),
            body,
            attributes.exchange(DEAD_LETTER_EXCHANGE).headers(headers),
        )
        .await
    }

    /// Consumes `queue`, calling `callback` for every message until it returns
    /// [`ControlFlow::Break`] or the consumer ends.
    ///
    /// A consumer span is opened around each callback, parented on the trace
    /// context the message carries.
    ///
    /// # Parameters
    /// * `queue` - Registered or configured queue, otherwise `UndefinedQueue`
    /// * `callback` - Called once per envelope
    /// * `options` - Consume flags
    /// * `consumer_tag` - Tag of the consumer, `<queue>-<uuid>` when `None`
    pub async fn consume<F>(
        &mut self,
        queue: &str,
        mut callback: F,
        options: BasicConsumeOptions,
        consumer_tag: Option<&str>,
    ) -> Result<(), AmqpError>
    where
        F: FnMut(&Envelope) -> ControlFlow<()>,
    {
        self.ensure_connected().await?;

        let queue = self.get_queue(queue).await?;
        let tag = match consumer_tag {
            Some(tag) => tag.to_owned(),
            None => format!("{}-{}", queue.name(), Uuid::new_v4()),
        };

        let mut consumer = self.client.consume(queue.name(), &tag, options).await?;
        let tracer = global::tracer("amqp consumer");

        while let Some(result) = consumer.next().await {
            match result {
                Ok(envelope) => {
                    let mut span = otel::new_span(&envelope, &tracer, queue.name());
                    let flow = callback(&envelope);
                    span.end();

                    if flow.is_break() {
                        debug!(queue = queue.name(), "consumer stopped");
                        return Ok(());
                    }
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        Ok(())
    }

    /// Fetches one message from `queue`, if any is ready.
    ///
    /// # Parameters
    /// * `queue` - Registered or configured queue, otherwise `UndefinedQueue`
    /// * `options` - Get flags
    ///
    /// # Returns
    /// * `Result<Option<Envelope>, AmqpError>` - The message, or `None` when the
    ///   queue is empty
    pub async fn get(
        &mut self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<Envelope>, AmqpError> {
        self.ensure_connected().await?;

        let queue = self.get_queue(queue).await?;

        self.client.get(queue.name(), options).await
    }

    /// Acknowledges a message.
    ///
    /// Without `queue`, the routing key of the message is taken as the queue
    /// name, which only holds when queues are named after their routing key.
    pub async fn ack(&mut self, envelope: &Envelope, queue: Option<&str>) -> Result<(), AmqpError> {
        self.get_queue(queue.unwrap_or(&envelope.routing_key))
            .await?;

        self.client
            .ack(envelope.delivery_tag, BasicAckOptions { multiple: false })
            .await
    }

    /// Rejects a message, optionally putting it back in its queue.
    ///
    /// The queue defaults to the routing key, as for [`Broker::ack`].
    pub async fn nack(
        &mut self,
        envelope: &Envelope,
        queue: Option<&str>,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.get_queue(queue.unwrap_or(&envelope.routing_key))
            .await?;

        self.client
            .nack(
                envelope.delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
    }

    /// Sends a failed message back to its queue after the delay given by the
    /// queue's retry strategy.
    ///
    /// The queue defaults to the routing key, as for [`Broker::ack`]. The
    /// message must still be acked or nacked by the caller.
    ///
    /// # Parameters
    /// * `envelope` - The failed message
    /// * `queue` - Queue the message came from
    /// * `retry_message` - Reason stored in the `retry-message` header
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `Logic` when the queue has no retry strategy,
    ///   `NonRetryable` when the strategy refuses another attempt
    pub async fn retry(
        &mut self,
        envelope: &Envelope,
        queue: Option<&str>,
        retry_message: Option<&str>,
    ) -> Result<(), AmqpError> {
        let queue = queue.unwrap_or(&envelope.routing_key).to_owned();

        let Some(strategy) = self.retry_strategy(&queue) else {
            return Err(AmqpError::Logic(format!(
                "the queue \"{}\" has no retry strategy",
                queue
            )));
        };

        if !strategy.is_retryable(envelope) {
            return Err(AmqpError::NonRetryable {
                strategy,
                envelope: Box::new(envelope.clone()),
            });
        }

        let seconds = strategy.waiting_time(envelope);
        self.create_delayed_queue(&queue, seconds, None).await?;

        let mut headers = envelope.headers();
        headers.remove(&ShortString::from(AMQP_HEADERS_X_DEATH));
        headers.insert(
            ShortString::from(AMQP_HEADERS_QUEUE_TIME),
            AMQPValue::LongString(LongString::from(seconds.to_string())),
        );
        headers.insert(
            ShortString::from(AMQP_HEADERS_EXCHANGE),
            AMQPValue::LongString(LongString::from(RETRY_EXCHANGE)),
        );
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRIES),
            AMQPValue::LongLongInt(i64::from(envelope.retries()) + 1),
        );
        // null header values are rejected by some servers; a previous
        // message is kept when none is given
        if let Some(message) = retry_message {
            headers.insert(
                ShortString::from(AMQP_HEADERS_RETRY_MESSAGE),
                AMQPValue::LongString(LongString::from(message)),
            );
        }

        debug!(queue = queue.as_str(), seconds, "retrying message");

        self.publish(
            Some(&queue),
            &envelope.body,
            PublishAttributes::default()
                .exchange(DEAD_LETTER_EXCHANGE)
                .properties(envelope.properties.clone())
                .headers(headers),
        )
        .await
    }

    /// Ensures the delay queue holding messages of `queue` for `seconds`
    /// exists.
    ///
    /// With `original_exchange`, the delay queue expires messages to that
    /// exchange and is named after it. Otherwise it expires to the retry
    /// exchange and is named with the queue's retry queue pattern. Several
    /// messages waiting the same time share one delay queue.
    pub async fn create_delayed_queue(
        &mut self,
        queue: &str,
        seconds: u64,
        original_exchange: Option<&str>,
    ) -> Result<Arc<QueueSpec>, AmqpError> {
        self.ensure_connected().await?;

        let (target_exchange, name) = match original_exchange {
            Some(exchange) => (
                exchange.to_owned(),
                delay_queue_name(DEFAULT_RETRY_QUEUE_PATTERN, exchange, seconds),
            ),
            None => (
                RETRY_EXCHANGE.to_owned(),
                self.retry_queue_name(queue, seconds),
            ),
        };

        if let Some(existing) = self.queues.get(&name) {
            return Ok(existing.clone());
        }

        self.get_or_create_exchange(DEAD_LETTER_EXCHANGE).await?;

        let ttl = i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        let args = QueueArguments::default()
            .exchange(DEAD_LETTER_EXCHANGE)
            .argument(AMQP_HEADERS_MESSAGE_TTL, AMQPValue::LongLongInt(ttl))
            .argument(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
                AMQPValue::LongString(LongString::from(target_exchange.clone())),
            )
            .bind_argument(
                AMQP_HEADERS_QUEUE_TIME,
                AMQPValue::LongString(LongString::from(seconds.to_string())),
            )
            .bind_argument(
                AMQP_HEADERS_EXCHANGE,
                AMQPValue::LongString(LongString::from(target_exchange)),
            )
            .bind_argument(
                AMQP_HEADERS_X_MATCH,
                AMQPValue::LongString(LongString::from("all")),
            );

        self.get_or_create_queue(&name, args).await
    }

    /// Republishes a message under another routing key.
    ///
    /// Standard properties and headers of the message are carried over, the
    /// ones given in `overrides` win.
    pub async fn move_message(
        &mut self,
        envelope: &Envelope,
        routing_key: &str,
        overrides: PublishAttributes,
    ) -> Result<(), AmqpError> {
        let properties = carry_properties(&envelope.properties, &overrides.properties);

        self.publish(
            Some(routing_key),
            &envelope.body,
            PublishAttributes {
                properties,
                ..overrides
            },
        )
        .await
    }

    /// Moves a message to `<routing key>.dead`.
    pub async fn move_to_dead_letter(
        &mut self,
        envelope: &Envelope,
        overrides: PublishAttributes,
    ) -> Result<(), AmqpError> {
        let routing_key = format!("{}.dead", envelope.routing_key);
        self.move_message(envelope, &routing_key, overrides).await
    }

    /// Compares the number of messages in `queue` to its configured
    /// thresholds.
    ///
    /// # Parameters
    /// * `queue` - Registered or configured queue
    ///
    /// # Returns
    /// * `Result<QueueHealth, AmqpError>` - The classification with the current
    ///   message count
    pub async fn queue_health(&mut self, queue: &str) -> Result<QueueHealth, AmqpError> {
        let queue = self.get_queue(queue).await?;

        let state = self
            .client
            .declare_queue(
                queue.name(),
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let thresholds = self
            .configuration
            .queue(queue.name())
            .map(|config| config.thresholds)
            .unwrap_or_default();

        let health = QueueHealth::classify(state.message_count, &thresholds);
        if !matches!(health, QueueHealth::Healthy { .. }) {
            warn!(queue = queue.name(), messages = state.message_count, "queue above threshold");
        }

        Ok(health)
    }
}

impl<C: AmqpClient> Broker<C> {
    async fn ensure_connected(&mut self) -> Result<(), AmqpError> {
        if self.is_connected() {
            return Ok(());
        }

        self.connect().await
    }

    fn clear_registries(&mut self) {
        self.exchanges.clear();
        self.queues.clear();
        self.bindings.clear();
    }

    fn exchange_arguments(&self, name: &str) -> ExchangeArguments {
        self.configuration
            .exchange(name)
            .map(|config| config.arguments.clone())
            .unwrap_or_default()
    }

    fn retry_strategy(&self, queue: &str) -> Option<RetryStrategy> {
        match self.queues.get(queue) {
            Some(spec) => spec.retry_strategy().copied(),
            None => self
                .configuration
                .queue(queue)
                .and_then(|config| config.retry_strategy().copied()),
        }
    }

    fn retry_queue_name(&self, queue: &str, seconds: u64) -> String {
        if let Some(spec) = self.queues.get(queue) {
            return spec.retry_queue_name(seconds);
        }

        let pattern = self
            .configuration
            .queue(queue)
            .and_then(|config| config.arguments.retry_queue_pattern.as_deref())
            .unwrap_or(DEFAULT_RETRY_QUEUE_PATTERN);

        delay_queue_name(pattern, RETRY_EXCHANGE, seconds)
    }

    async fn declare_exchange(&mut self, spec: ExchangeSpec) -> Result<Arc<ExchangeSpec>, AmqpError> {
        spec.declare(&self.client).await?;
        Ok(self.add_exchange(spec))
    }

    async fn get_or_create_exchange(&mut self, name: &str) -> Result<Arc<ExchangeSpec>, AmqpError> {
        if let Some(exchange) = self.exchanges.get(name) {
            return Ok(exchange.clone());
        }

        let spec = ExchangeSpec::from_arguments(name, self.exchange_arguments(name));
        self.declare_exchange(spec).await
    }

    /// Declares the exchanges a queue is bound to, then the queue and its
    /// bindings.
    async fn declare_queue(&mut self, spec: QueueSpec) -> Result<Arc<QueueSpec>, AmqpError> {
        let mut exchanges: Vec<String> = vec![];
        for binding in spec.bindings() {
            if !exchanges.contains(&binding.exchange) {
                exchanges.push(binding.exchange.clone());
            }
        }

        for exchange in &exchanges {
            self.get_or_create_exchange(exchange).await?;
        }

        spec.declare_and_bind(&self.client).await?;
        Ok(self.add_queue(spec))
    }

    async fn get_or_create_queue(
        &mut self,
        name: &str,
        args: QueueArguments,
    ) -> Result<Arc<QueueSpec>, AmqpError> {
        if let Some(queue) = self.queues.get(name) {
            return Ok(queue.clone());
        }

        let args = match self.configuration.queue(name) {
            Some(config) => config.arguments.clone(),
            None => args,
        };

        self.declare_queue(QueueSpec::new(name, args)).await
    }

    /// Queue named after a routing key nothing else receives, bound to
    /// `exchange` under that key. A registered or configured queue with the
    /// same name keeps its own bindings, arguments and retry strategy.
    fn fallback_queue(&self, name: &str, exchange: &ExchangeSpec) -> QueueSpec {
        let spec = match (self.queues.get(name), self.configuration.queue(name)) {
            (Some(registered), _) => registered.as_ref().clone(),
            (None, Some(config)) => QueueSpec::new(name, config.arguments.clone()),
            (None, None) => {
                QueueSpec::new(name, QueueArguments::default().exchange(exchange.name()))
            }
        };

        spec.with_binding(Binding::new(exchange.name(), Some(name)))
    }

    /// Declares the queues a message published on `exchange` needs.
    async fn setup_queues(
        &mut self,
        exchange: &ExchangeSpec,
        routing_key: Option<&str>,
    ) -> Result<(), AmqpError> {
        let plan = plan_lazy_queues(
            exchange,
            routing_key,
            &self.bindings,
            self.configuration.queues(),
            |name| self.queues.contains_key(name),
        );

        for spec in plan.declare {
            debug!(queue = spec.name(), exchange = exchange.name(), "lazy loading queue");
            self.declare_queue(spec).await?;
        }

        if plan.matched {
            return Ok(());
        }

        match plan.fallback {
            Some(name) => {
                debug!(queue = name.as_str(), exchange = exchange.name(), "creating fallback queue");
                let spec = self.fallback_queue(&name, exchange);
                self.declare_queue(spec).await?;
            }
            None => warn!(
                exchange = exchange.name(),
                "no queue is bound to receive messages without routing key"
            ),
        }

        Ok(())
    }
}

fn headers_of(properties: &BasicProperties) -> BTreeMap<ShortString, AMQPValue> {
    properties
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default()
}

macro_rules! carry {
    ($target:ident, $overrides:ident, $original:ident, $($getter:ident => $setter:ident),+ $(,)?) => {
        $(
            if let Some(value) = $overrides.$getter().clone().or_else(|| $original.$getter().clone()) {
                $target = $target.$setter(value);
            }
        )+
    };
}

/// Copies the standard properties a moved message keeps, letting `overrides`
/// win over `original`.
fn carry_properties(original: &BasicProperties, overrides: &BasicProperties) -> BasicProperties {
    let mut properties = BasicProperties::default();

    carry!(
        properties, overrides, original,
        app_id => with_app_id,
        content_encoding => with_content_encoding,
        content_type => with_content_type,
        delivery_mode => with_delivery_mode,
        expiration => with_expiration,
        headers => with_headers,
        message_id => with_message_id,
        priority => with_priority,
        reply_to => with_reply_to,
        timestamp => with_timestamp,
        kind => with_kind,
        user_id => with_user_id,
    );

    properties
}
