// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use amqp_broker::{
    client::{AmqpClient, Envelope, EnvelopeStream, QueueState},
    errors::AmqpError,
    exchange::ExchangeKind,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
};

#[derive(Debug, Clone)]
pub struct DeclaredQueue {
    pub name: String,
    pub options: QueueDeclareOptions,
    pub arguments: BTreeMap<ShortString, AMQPValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: BTreeMap<ShortString, AMQPValue>,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub options: BasicPublishOptions,
    pub properties: BasicProperties,
}

impl Published {
    pub fn header(&self, name: &str) -> Option<AMQPValue> {
        self.properties
            .headers()
            .as_ref()
            .and_then(|table| table.inner().get(&ShortString::from(name)).cloned())
    }
}

/// Everything the broker asked the server to do.
#[derive(Debug, Default)]
pub struct Recorded {
    pub connects: usize,
    pub disconnects: usize,
    pub exchanges: Vec<(String, ExchangeKind)>,
    pub queues: Vec<DeclaredQueue>,
    pub bindings: Vec<QueueBinding>,
    pub published: Vec<Published>,
    pub acks: Vec<u64>,
    pub nacks: Vec<(u64, bool)>,
    pub ready: HashMap<String, VecDeque<Envelope>>,
}

impl Recorded {
    pub fn declared_queues(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|queue| !queue.options.passive)
            .map(|queue| queue.name.clone())
            .collect()
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.exchanges.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn queue(&self, name: &str) -> Option<&DeclaredQueue> {
        self.queues.iter().find(|queue| queue.name == name)
    }

    pub fn bindings_of(&self, queue: &str) -> Vec<&QueueBinding> {
        self.bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .collect()
    }
}

/// In memory client recording every call.
#[derive(Clone, Default)]
pub struct RecordingClient {
    connected: Arc<Mutex<bool>>,
    pub recorded: Arc<Mutex<Recorded>>,
}

impl RecordingClient {
    pub fn new() -> RecordingClient {
        RecordingClient::default()
    }

    /// Makes `envelope` available to `get` and `consume` on `queue`.
    pub fn enqueue(&self, queue: &str, envelope: Envelope) {
        self.recorded
            .lock()
            .unwrap()
            .ready
            .entry(queue.to_owned())
            .or_default()
            .push_back(envelope);
    }

    pub fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap()
    }
}

#[async_trait]
impl AmqpClient for RecordingClient {
    async fn connect(&mut self) -> Result<(), AmqpError> {
        *self.connected.lock().unwrap() = true;
        self.recorded.lock().unwrap().connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AmqpError> {
        *self.connected.lock().unwrap() = false;
        self.recorded.lock().unwrap().disconnects += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.recorded
            .lock()
            .unwrap()
            .exchanges
            .push((name.to_owned(), kind));
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueState, AmqpError> {
        let mut recorded = self.recorded.lock().unwrap();
        let message_count = recorded
            .ready
            .get(name)
            .map(|messages| messages.len() as u32)
            .unwrap_or_default();
        recorded.queues.push(DeclaredQueue {
            name: name.to_owned(),
            options,
            arguments: arguments.inner().clone(),
        });

        Ok(QueueState {
            message_count,
            consumer_count: 0,
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.recorded.lock().unwrap().bindings.push(QueueBinding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            arguments: arguments.inner().clone(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.recorded.lock().unwrap().published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            options,
            properties,
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _options: BasicConsumeOptions,
    ) -> Result<EnvelopeStream, AmqpError> {
        let messages: Vec<Envelope> = self
            .recorded
            .lock()
            .unwrap()
            .ready
            .remove(queue)
            .unwrap_or_default()
            .into();

        Ok(stream::iter(messages.into_iter().map(Ok)).boxed())
    }

    async fn get(
        &self,
        queue: &str,
        _options: BasicGetOptions,
    ) -> Result<Option<Envelope>, AmqpError> {
        Ok(self
            .recorded
            .lock()
            .unwrap()
            .ready
            .get_mut(queue)
            .and_then(|messages| messages.pop_front()))
    }

    async fn ack(&self, delivery_tag: u64, _options: BasicAckOptions) -> Result<(), AmqpError> {
        self.recorded.lock().unwrap().acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, options: BasicNackOptions) -> Result<(), AmqpError> {
        self.recorded
            .lock()
            .unwrap()
            .nacks
            .push((delivery_tag, options.requeue));
        Ok(())
    }
}
