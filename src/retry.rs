// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Each consumer owns an isolated retry path: rejected messages leave the main
//! queue through a fanout exchange into a wait queue, sit there for a fixed TTL and
//! are dead-lettered back to the main exchange. Once a message has died in the main
//! queue `max_retries` times it is forwarded to a final dead-letter exchange shared
//! by many consumers.
//!
//! The wait is the same on every hop. There is no backoff growth, and a message
//! whose escalation keeps failing goes around the retry loop until escalation
//! succeeds.

use crate::errors::AmqpError;
use serde::Deserialize;

/// Terminal dead-letter location shared by consumers of one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FinalDeadLetter {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl FinalDeadLetter {
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> FinalDeadLetter {
        FinalDeadLetter {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

/// Retry block of a consumer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub retry_exchange: String,
    pub retry_queue: String,
    pub retry_ttl_ms: u32,
    pub final_dead_letter: FinalDeadLetter,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Builds an enabled policy for `queue` following the naming convention
    /// `<queue>_retry_ex` for the fanout exchange and `<queue>_retry_wait_<ttl>`
    /// for the wait queue.
    pub fn for_queue(
        queue: &str,
        retry_ttl_ms: u32,
        max_retries: u32,
        final_dead_letter: FinalDeadLetter,
    ) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            retry_exchange: retry_exchange_name(queue),
            retry_queue: retry_wait_queue_name(queue, retry_ttl_ms),
            retry_ttl_ms,
            final_dead_letter,
            max_retries,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if !self.enabled {
            return Ok(());
        }

        let required = [
            ("retry exchange", self.retry_exchange.as_str()),
            ("retry queue", self.retry_queue.as_str()),
            ("final dead-letter exchange", self.final_dead_letter.exchange.as_str()),
            ("final dead-letter queue", self.final_dead_letter.queue.as_str()),
        ];

        for (field, value) in required {
            if value.is_empty() {
                return Err(AmqpError::InvalidConfig(format!(
                    "{field} is required when the retry mechanism is enabled"
                )));
            }
        }

        if self.retry_ttl_ms == 0 {
            return Err(AmqpError::InvalidConfig(
                "retry ttl must be positive when the retry mechanism is enabled".to_owned(),
            ));
        }

        Ok(())
    }

    /// Decides what happens to a delivery whose handler failed.
    pub fn decide(&self, redelivery_count: i64) -> FailureAction {
        if !self.enabled {
            return FailureAction::Drop;
        }

        if redelivery_count < i64::from(self.max_retries) {
            FailureAction::Retry
        } else {
            FailureAction::Escalate
        }
    }
}

/// Outcome of the failure branch of the settlement state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Retry is disabled: reject without requeue and let it go.
    Drop,
    /// Reject without requeue so the retry topology redelivers it after the TTL.
    Retry,
    /// Retries exhausted: forward to the final dead-letter exchange.
    Escalate,
}

pub fn retry_exchange_name(queue: &str) -> String {
    format!("{queue}_retry_ex")
}

/// Wait queue name for the given TTL. Whole seconds render as `<n>s`, anything
/// else falls back to milliseconds.
pub fn retry_wait_queue_name(queue: &str, retry_ttl_ms: u32) -> String {
    if retry_ttl_ms % 1000 == 0 {
        format!("{queue}_retry_wait_{}s", retry_ttl_ms / 1000)
    } else {
        format!("{queue}_retry_wait_{retry_ttl_ms}ms")
    }
}
