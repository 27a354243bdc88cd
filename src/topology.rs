// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lazy Topology Provisioning
//!
//! Queues are declared on first use. When a message is published, the broker
//! asks [`plan_lazy_queues`] which configured queues must exist for the message
//! to be routed, and whether a fallback queue named after the routing key is
//! needed so the message is not dropped by the server.
//!
//! The planner is a pure function over the current state of the broker: it
//! never talks to the server, which keeps the routing rules testable on their
//! own.
//!
//! The main components are:
//! - `BindingIndex`: bindings already installed, per exchange
//! - `plan_lazy_queues`: the provisioning decision for one publish
//! - Argument constants: names of the AMQP arguments used by delay queues

use crate::{
    config::QueueConfiguration,
    exchange::{ExchangeKind, ExchangeSpec},
    queue::QueueSpec,
};
use std::collections::{HashMap, HashSet};

/// Queue argument naming the exchange expired messages are sent to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument giving the message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Binding argument of headers exchanges (`all` or `any`)
pub const AMQP_HEADERS_X_MATCH: &str = "x-match";

/// Routing keys already bound, per exchange name.
///
/// Only used to avoid provisioning a queue for a route that some declared
/// queue already serves.
#[derive(Debug, Clone, Default)]
pub struct BindingIndex {
    bindings: HashMap<String, HashSet<Option<String>>>,
}

impl BindingIndex {
    pub fn record(&mut self, exchange: &str, routing_key: Option<&str>) {
        self.bindings
            .entry(exchange.to_owned())
            .or_default()
            .insert(routing_key.map(str::to_owned));
    }

    /// Whether some installed binding already routes `routing_key` through
    /// `exchange`.
    pub fn routes(&self, exchange: &ExchangeSpec, routing_key: Option<&str>) -> bool {
        let Some(keys) = self.bindings.get(exchange.name()) else {
            return false;
        };

        match exchange.kind() {
            ExchangeKind::Direct => keys.contains(&routing_key.map(str::to_owned)),
            ExchangeKind::Topic => keys.iter().any(|pattern| {
                topic_matches(
                    pattern.as_deref().unwrap_or_default(),
                    routing_key.unwrap_or_default(),
                )
            }),
            ExchangeKind::Fanout | ExchangeKind::Headers => !keys.is_empty(),
        }
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

/// Whether publishing on `exchange` may need a queue to be provisioned.
///
/// A direct exchange cannot route a message without routing key, and the two
/// exchanges of the retry workflow are only consumed by queues the broker
/// declares itself.
pub fn should_create_queue(exchange: &ExchangeSpec, routing_key: Option<&str>) -> bool {
    if exchange.is_direct() && routing_key.is_none() {
        return false;
    }

    !exchange.is_system()
}

/// Queues to declare before publishing a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LazyQueues {
    /// Configured queues bound to the exchange for this message
    pub declare: Vec<QueueSpec>,
    /// Whether any queue, declared before or in `declare`, receives the message
    pub matched: bool,
    /// Name of the queue to create when nothing matched
    pub fallback: Option<String>,
}

/// Decides which queues must be declared so a message published on `exchange`
/// with `routing_key` reaches at least one queue.
///
/// Queues that `is_declared` reports as existing are skipped. A configured
/// queue is selected when one of its bindings points to `exchange` and, for a
/// direct exchange, uses exactly `routing_key`. Any other exchange kind
/// delivers to all its queues, so any binding to it selects the queue.
pub fn plan_lazy_queues<'a, I, F>(
    exchange: &ExchangeSpec,
    routing_key: Option<&str>,
    index: &BindingIndex,
    configured: I,
    is_declared: F,
) -> LazyQueues
where
    I: IntoIterator<Item = &'a QueueConfiguration>,
    F: Fn(&str) -> bool,
{
    let mut matched = index.routes(exchange, routing_key);
    let mut declare = vec![];

    for config in configured {
        if is_declared(&config.name) {
            continue;
        }

        let spec = QueueSpec::new(&config.name, config.arguments.clone());
        let selected = spec.bindings_to(exchange.name()).any(|binding| {
            !exchange.is_direct() || binding.routing_key.as_deref() == routing_key
        });

        if selected {
            matched = true;
            declare.push(spec);
        }
    }

    let fallback = if matched {
        None
    } else {
        routing_key.map(str::to_owned)
    };

    LazyQueues {
        declare,
        matched,
        fallback,
    }
}

/// Matches a routing key against a topic binding pattern, where `*` stands for
/// exactly one word and `#` for zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = if routing_key.is_empty() {
        vec![]
    } else {
        routing_key.split('.').collect()
    };

    matches_words(&pattern, &words)
}

fn matches_words(pattern: &[&str], words: &[&str]) -> bool {
    // matched[j]: the pattern segments seen so far match exactly words[..j]
    let mut matched = vec![false; words.len() + 1];
    matched[0] = true;

    for segment in pattern {
        let mut next = vec![false; words.len() + 1];

        if *segment == "#" {
            if let Some(first) = matched.iter().position(|reached| *reached) {
                next[first..].iter_mut().for_each(|reached| *reached = true);
            }
        } else {
            for (j, word) in words.iter().enumerate() {
                if matched[j] && (*segment == "*" || segment == word) {
                    next[j + 1] = true;
                }
            }
        }

        matched = next;
    }

    matched[words.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Configuration,
        exchange::{
            ExchangeArguments, DEAD_LETTER_EXCHANGE, DEFAULT_EXCHANGE, RETRY_EXCHANGE,
        },
    };
    use serde_json::json;

    fn exchange(name: &str, kind: ExchangeKind) -> ExchangeSpec {
        ExchangeSpec::from_arguments(name, ExchangeArguments::default().kind(kind))
    }

    fn configuration() -> Configuration {
        Configuration::new(
            vec![
                json!({"name": "billing", "arguments": {"routing_keys": "order.created"}}),
                json!({"name": "shipping", "arguments": {"routing_keys": ["order.created", "order.paid"]}}),
                json!({"name": "audit", "arguments": {"exchange": "broadcast", "routing_keys": null}}),
            ],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn skips_unroutable_and_system_exchanges() {
        let direct = exchange(DEFAULT_EXCHANGE, ExchangeKind::Direct);
        let fanout = exchange("broadcast", ExchangeKind::Fanout);

        assert!(!should_create_queue(&direct, None));
        assert!(should_create_queue(&direct, Some("order.created")));
        assert!(should_create_queue(&fanout, None));
        assert!(!should_create_queue(
            &exchange(DEAD_LETTER_EXCHANGE, ExchangeKind::Headers),
            Some("order.created")
        ));
        assert!(!should_create_queue(
            &exchange(RETRY_EXCHANGE, ExchangeKind::Direct),
            Some("order.created")
        ));
    }

    #[test]
    fn direct_exchange_selects_queues_by_routing_key() {
        let config = configuration();

        let plan = plan_lazy_queues(
            &exchange(DEFAULT_EXCHANGE, ExchangeKind::Direct),
            Some("order.paid"),
            &BindingIndex::default(),
            config.queues(),
            |_| false,
        );

        let names: Vec<_> = plan.declare.iter().map(|q| q.name()).collect();
        assert_eq!(names, vec!["shipping"]);
        assert!(plan.matched);
        assert_eq!(plan.fallback, None);
    }

    #[test]
    fn shared_routing_key_selects_every_bound_queue() {
        let config = configuration();

        let plan = plan_lazy_queues(
            &exchange(DEFAULT_EXCHANGE, ExchangeKind::Direct),
            Some("order.created"),
            &BindingIndex::default(),
            config.queues(),
            |_| false,
        );

        let names: Vec<_> = plan.declare.iter().map(|q| q.name()).collect();
        assert_eq!(names, vec!["billing", "shipping"]);
    }

    #[test]
    fn non_direct_exchange_selects_all_its_queues() {
        let config = configuration();

        let plan = plan_lazy_queues(
            &exchange("broadcast", ExchangeKind::Fanout),
            Some("whatever"),
            &BindingIndex::default(),
            config.queues(),
            |_| false,
        );

        let names: Vec<_> = plan.declare.iter().map(|q| q.name()).collect();
        assert_eq!(names, vec!["audit"]);
        assert!(plan.matched);
    }

    #[test]
    fn unknown_route_falls_back_to_a_queue_named_after_the_key() {
        let config = configuration();

        let plan = plan_lazy_queues(
            &exchange(DEFAULT_EXCHANGE, ExchangeKind::Direct),
            Some("order.cancelled"),
            &BindingIndex::default(),
            config.queues(),
            |_| false,
        );

        assert!(plan.declare.is_empty());
        assert!(!plan.matched);
        assert_eq!(plan.fallback.as_deref(), Some("order.cancelled"));
    }

    #[test]
    fn declared_queues_are_not_planned_again() {
        let config = configuration();
        let mut index = BindingIndex::default();
        index.record(DEFAULT_EXCHANGE, Some("order.created"));

        let plan = plan_lazy_queues(
            &exchange(DEFAULT_EXCHANGE, ExchangeKind::Direct),
            Some("order.created"),
            &index,
            config.queues(),
            |name| name == "billing" || name == "shipping",
        );

        assert!(plan.declare.is_empty());
        assert!(plan.matched);
        assert_eq!(plan.fallback, None);
    }

    #[test]
    fn index_routes_by_exchange_kind() {
        let mut index = BindingIndex::default();
        index.record("direct", Some("a"));
        index.record("fanout", None);
        index.record("topic", Some("order.*"));

        assert!(index.routes(&exchange("direct", ExchangeKind::Direct), Some("a")));
        assert!(!index.routes(&exchange("direct", ExchangeKind::Direct), Some("b")));
        assert!(index.routes(&exchange("fanout", ExchangeKind::Fanout), Some("b")));
        assert!(index.routes(&exchange("topic", ExchangeKind::Topic), Some("order.paid")));
        assert!(!index.routes(&exchange("topic", ExchangeKind::Topic), Some("user.created")));
        assert!(!index.routes(&exchange("other", ExchangeKind::Fanout), None));
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("*.created", "user.created"));
        assert!(!topic_matches("*.created", "created"));
        assert!(topic_matches("#.created.#", "created"));
        assert!(!topic_matches("order.#.paid", "order.created"));
    }

    #[test]
    fn many_hash_segments_match_long_keys_quickly() {
        let pattern = vec!["#"; 40].join(".") + ".missing";
        let key = vec!["word"; 200].join(".");

        assert!(!topic_matches(&pattern, &key));
        assert!(topic_matches(&(vec!["#"; 40].join(".") + ".word"), &key));
    }
}
