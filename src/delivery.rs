// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! A [`Delivery`] is one message received from the broker together with the handle
//! used to settle it. Settlement goes through the [`Acknowledger`] trait so the
//! consumers' state machine does not depend on a live channel.
//!
//! This module also reads the broker-maintained `x-death` header into
//! [`RedeliveryRecord`]s. Malformed entries are skipped rather than reported.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the queue field in the x-death header
pub const AMQP_HEADERS_QUEUE: &str = "queue";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Settles deliveries on the channel they arrived on.
///
/// Implementations must tolerate concurrent calls for distinct delivery tags.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError>;
    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        Acker::nack(self, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

/// One unit of work received from the broker.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties,
            data,
            acker,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type().as_ref().map(|ct| ct.as_str())
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    /// Returns a string header such as `x-trace-id`.
    pub fn header_str(&self, key: &str) -> Option<String> {
        match self.headers()?.inner().get(key)? {
            AMQPValue::LongString(value) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(value) => Some(value.to_string()),
            _ => None,
        }
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// The dead-letter history recorded by the broker.
    pub fn deaths(&self) -> Vec<RedeliveryRecord> {
        RedeliveryRecord::parse(self.headers())
    }

    /// Number of times this message was dead-lettered from `queue`.
    pub fn redelivery_count(&self, queue: &str) -> i64 {
        redelivery_count(self.headers(), queue)
    }

    pub async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        self.acker.ack(multiple).await
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(multiple, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
            acker: Arc::new(delivery.acker),
        }
    }
}

/// One entry of the `x-death` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryRecord {
    pub queue: String,
    pub count: i64,
}

impl RedeliveryRecord {
    /// Reads the `x-death` array. Entries without a string `queue` or an integer
    /// `count` are dropped.
    pub fn parse(headers: Option<&FieldTable>) -> Vec<RedeliveryRecord> {
        let Some(deaths) = headers
            .and_then(|h| h.inner().get(AMQP_HEADERS_X_DEATH))
            .and_then(|value| value.as_array())
        else {
            return vec![];
        };

        deaths
            .as_slice()
            .iter()
            .filter_map(|death| {
                let table = death.as_field_table()?.inner();
                let queue = match table.get(AMQP_HEADERS_QUEUE)? {
                    AMQPValue::LongString(queue) => {
                        String::from_utf8_lossy(queue.as_bytes()).into_owned()
                    }
                    AMQPValue::ShortString(queue) => queue.to_string(),
                    _ => return None,
                };
                let count = as_integer(table.get(AMQP_HEADERS_COUNT)?)?;

                Some(RedeliveryRecord { queue, count })
            })
            .collect()
    }
}

/// Death count recorded for `queue`, or 0 when the message never died there.
pub fn redelivery_count(headers: Option<&FieldTable>, queue: &str) -> i64 {
    RedeliveryRecord::parse(headers)
        .into_iter()
        .find(|record| record.queue == queue)
        .map(|record| record.count)
        .unwrap_or_default()
}

fn as_integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        _ => None,
    }
}
