// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Strategies
//!
//! A retry strategy decides, from the `retries` header of a message, whether the
//! message may go through the delayed retry workflow once more and how many
//! seconds it has to wait in a delay queue before coming back.

use crate::{client::Envelope, errors::AmqpError};
use serde::{Deserialize, Serialize};

/// Retry strategy names accepted by the static configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategyKind {
    Constant,
    Exponential,
}

/// Options of a configured retry strategy. Which ones are required depends on
/// the strategy kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStrategyOptions {
    pub time: Option<u64>,
    pub max: Option<u32>,
    pub offset: Option<u64>,
}

/// How a failed message is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Waits `time` seconds between attempts, at most `max` attempts.
    Constant { time: u64, max: u32 },
    /// Waits `offset * 2^attempt` seconds, at most `max` attempts.
    Exponential { max: u32, offset: u64 },
}

impl RetryStrategy {
    pub fn constant(time: u64, max: u32) -> RetryStrategy {
        RetryStrategy::Constant { time, max }
    }

    pub fn exponential(max: u32, offset: u64) -> RetryStrategy {
        RetryStrategy::Exponential { max, offset }
    }

    /// Builds a strategy from its configured name and options.
    pub fn from_options(
        kind: RetryStrategyKind,
        options: &RetryStrategyOptions,
    ) -> Result<RetryStrategy, AmqpError> {
        let required = |value: Option<u64>, option: &str| {
            value.ok_or_else(|| {
                AmqpError::InvalidArgument(format!(
                    "the option \"{}\" is required by the {:?} retry strategy",
                    option, kind
                ))
            })
        };
        let max = required(options.max.map(u64::from), "max")? as u32;

        match kind {
            RetryStrategyKind::Constant => Ok(RetryStrategy::constant(
                required(options.time, "time")?,
                max,
            )),
            RetryStrategyKind::Exponential => Ok(RetryStrategy::exponential(
                max,
                required(options.offset, "offset")?,
            )),
        }
    }

    pub fn max(&self) -> u32 {
        match self {
            RetryStrategy::Constant { max, .. } | RetryStrategy::Exponential { max, .. } => *max,
        }
    }

    pub fn is_retryable(&self, envelope: &Envelope) -> bool {
        self.is_retryable_after(envelope.retries())
    }

    /// Seconds the message has to wait before its next attempt.
    pub fn waiting_time(&self, envelope: &Envelope) -> u64 {
        self.waiting_time_after(envelope.retries())
    }

    pub fn is_retryable_after(&self, attempts: u32) -> bool {
        attempts < self.max()
    }

    pub fn waiting_time_after(&self, attempts: u32) -> u64 {
        match self {
            RetryStrategy::Constant { time, .. } => *time,
            RetryStrategy::Exponential { offset, .. } => {
                offset.saturating_mul(1u64.checked_shl(attempts).unwrap_or(u64::MAX))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_from_the_offset() {
        let strategy = RetryStrategy::exponential(5, 2);

        let waits: Vec<u64> = (0..4).map(|n| strategy.waiting_time_after(n)).collect();

        assert_eq!(waits, vec![2, 4, 8, 16]);
        assert!(strategy.is_retryable_after(4));
        assert!(!strategy.is_retryable_after(5));
        assert!(!strategy.is_retryable_after(6));
    }

    #[test]
    fn exponential_saturates_instead_of_overflowing() {
        let strategy = RetryStrategy::exponential(100, 3);

        assert_eq!(strategy.waiting_time_after(64), u64::MAX);
        assert!(strategy.waiting_time_after(62) <= strategy.waiting_time_after(63));
    }

    #[test]
    fn constant_always_waits_the_same() {
        let strategy = RetryStrategy::constant(30, 3);

        for attempts in 0..10 {
            assert_eq!(strategy.waiting_time_after(attempts), 30);
        }
        assert!(strategy.is_retryable_after(2));
        assert!(!strategy.is_retryable_after(3));
    }

    #[test]
    fn reads_attempts_from_the_envelope() {
        let strategy = RetryStrategy::exponential(5, 2);

        let envelope = Envelope::new("orders", b"");

        assert!(strategy.is_retryable(&envelope));
        assert_eq!(strategy.waiting_time(&envelope), 2);
    }

    #[test]
    fn builds_from_configured_options() {
        let constant = RetryStrategy::from_options(
            RetryStrategyKind::Constant,
            &RetryStrategyOptions {
                time: Some(1),
                max: Some(2),
                offset: None,
            },
        )
        .unwrap();
        let exponential = RetryStrategy::from_options(
            RetryStrategyKind::Exponential,
            &RetryStrategyOptions {
                time: None,
                max: Some(1),
                offset: Some(2),
            },
        )
        .unwrap();

        assert_eq!(constant, RetryStrategy::constant(1, 2));
        assert_eq!(exponential, RetryStrategy::exponential(1, 2));
    }

    #[test]
    fn missing_options_are_invalid() {
        let err = RetryStrategy::from_options(
            RetryStrategyKind::Exponential,
            &RetryStrategyOptions {
                time: None,
                max: Some(1),
                offset: None,
            },
        )
        .unwrap_err();

        assert!(matches!(err, AmqpError::InvalidArgument(msg) if msg.contains("offset")));
    }
}
