// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module defines the exchange types a consumer may declare and the binding
//! that attaches a consumer's main queue to an exchange. The binding exchange is
//! also where the retry wait queue sends expired messages back to.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use serde::Deserialize;

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Binding of a consumer's main queue to an exchange.
///
/// When `declare` is set the exchange is declared before binding and `kind` is
/// required. The routing key is also the key the retry wait queue dead-letters
/// expired messages with, so retried messages come back through the same binding.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExchangeBinding {
    pub exchange: String,
    pub declare: bool,
    pub kind: Option<ExchangeKind>,
    pub durable: bool,
    pub routing_key: String,
    #[serde(skip)]
    pub exchange_args: FieldTable,
    #[serde(skip)]
    pub binding_args: FieldTable,
}

impl ExchangeBinding {
    /// Creates a binding to an existing exchange with the given routing key.
    pub fn new(exchange: &str, routing_key: &str) -> ExchangeBinding {
        ExchangeBinding {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            ..Default::default()
        }
    }

    /// Declares the exchange with the given type before binding.
    pub fn declare(mut self, kind: ExchangeKind) -> Self {
        self.declare = true;
        self.kind = Some(kind);
        self
    }

    /// Makes the declared exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Adds a single argument to the exchange declaration.
    pub fn exchange_arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.exchange_args.insert(ShortString::from(key), value);
        self
    }

    /// Adds a single argument to the queue binding.
    pub fn binding_arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.binding_args.insert(ShortString::from(key), value);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if self.exchange.is_empty() {
            return Err(AmqpError::InvalidConfig(
                "binding exchange name must not be empty".to_owned(),
            ));
        }

        if self.declare && self.kind.is_none() {
            return Err(AmqpError::InvalidConfig(
                "exchange type is required if declaring an exchange for binding".to_owned(),
            ));
        }

        Ok(())
    }
}
