// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides the declaration policy of a consumer's main queue. The
//! retry wait queue and the final dead-letter queue are derived from the consumer's
//! retry policy instead, see [`crate::topology`].

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, LongInt, ShortString};
use serde::Deserialize;

/// Constant for the argument used to specify message TTL
pub const AMQP_ARGS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_ARGS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_ARGS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of the queue a consumer reads from.
///
/// An empty name together with `declare` lets the broker generate one; the
/// consumer then works with the name the broker returned.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub name: String,
    pub declare: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    #[serde(skip)]
    pub args: FieldTable,
}

impl QueueDefinition {
    /// Creates a queue definition that will be declared with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            declare: true,
            ..Default::default()
        }
    }

    /// Refers to a queue that already exists and must not be declared.
    pub fn existing(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            declare: false,
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(self, ttl: i32) -> Self {
        self.arg(AMQP_ARGS_MESSAGE_TTL, AMQPValue::LongInt(LongInt::from(ttl)))
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i32) -> Self {
        self.arg(AMQP_ARGS_MAX_LENGTH, AMQPValue::LongInt(LongInt::from(max)))
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.arg(
            AMQP_ARGS_MAX_LENGTH_BYTES,
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        )
    }

    /// Adds a single declaration argument.
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if !self.declare && self.name.is_empty() {
            return Err(AmqpError::InvalidConfig(
                "queue name is required if the queue is not declared".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_queue_requires_a_name() {
        assert!(QueueDefinition::existing("").validate().is_err());
        assert!(QueueDefinition::existing("links").validate().is_ok());
        // the broker generates a name for declared anonymous queues
        assert!(QueueDefinition::new("").validate().is_ok());
    }

    #[test]
    fn builder_collects_arguments() {
        let def = QueueDefinition::new("links")
            .durable()
            .ttl(60_000)
            .max_length(100);

        assert!(def.durable);
        assert_eq!(
            def.args.inner().get(AMQP_ARGS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(60_000))
        );
        assert_eq!(
            def.args.inner().get(AMQP_ARGS_MAX_LENGTH),
            Some(&AMQPValue::LongInt(100))
        );
    }
}
