// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides the publisher used by services to emit messages and by the
//! consumers to forward exhausted messages to the final dead-letter exchange. A
//! publisher owns one channel obtained from the [`ConnectionManager`] and only
//! declares its exchange when told to; the escalation publisher never does, since
//! the consumer setup already declared the final dead-letter exchange.

use crate::{
    connection::ConnectionManager, delivery::Delivery, errors::AmqpError, exchange::ExchangeKind,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{
    global,
    trace::{Span, SpanKind, Status, Tracer},
    Context,
};
use serde::Deserialize;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes messages to one exchange.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `message` under `routing_key`. `ctx` parents the publish span.
    async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError>;

    /// Releases the publisher's channel. Calling it twice is a no-op.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Publisher settings.
///
/// With `declare_exchange` unset the exchange is assumed to exist; an empty
/// exchange name publishes through the default exchange.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub exchange: String,
    pub kind: Option<ExchangeKind>,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub declare_exchange: bool,
    pub confirm: bool,
    #[serde(skip)]
    pub args: FieldTable,
}

impl PublisherConfig {
    /// Publishes to an exchange declared elsewhere.
    pub fn existing(exchange: &str) -> PublisherConfig {
        PublisherConfig {
            exchange: exchange.to_owned(),
            ..Default::default()
        }
    }

    /// Declares the exchange with the given type when the publisher is created.
    pub fn declared(exchange: &str, kind: ExchangeKind) -> PublisherConfig {
        PublisherConfig {
            exchange: exchange.to_owned(),
            kind: Some(kind),
            durable: true,
            declare_exchange: true,
            ..Default::default()
        }
    }

    /// Waits for broker confirms on every publish.
    pub fn with_confirms(mut self) -> Self {
        self.confirm = true;
        self
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.declare_exchange && self.exchange.is_empty() && self.kind.is_some() {
            return Err(AmqpError::InvalidConfig(
                "exchange name is required if the exchange type is set and the exchange is declared"
                    .to_owned(),
            ));
        }

        if self.declare_exchange && self.kind.is_none() && !self.exchange.is_empty() {
            return Err(AmqpError::InvalidConfig(
                "exchange type is required if the exchange name is set and the exchange is declared"
                    .to_owned(),
            ));
        }

        Ok(())
    }
}

/// A message ready to be published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub headers: Option<FieldTable>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub persistent: bool,
}

impl OutboundMessage {
    pub fn json(body: Vec<u8>) -> OutboundMessage {
        OutboundMessage {
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            body,
            persistent: true,
            ..Default::default()
        }
    }

    /// Copy of `delivery` for the final dead-letter exchange: same content type,
    /// body and headers, persistent, stamped with the current time.
    pub fn forward_of(delivery: &Delivery) -> OutboundMessage {
        OutboundMessage {
            content_type: delivery.content_type().map(str::to_owned),
            body: delivery.data.clone(),
            headers: delivery.headers().cloned(),
            message_id: delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.to_string()),
            timestamp: Some(now_secs()),
            persistent: true,
        }
    }

    pub(crate) fn properties(&self) -> BasicProperties {
        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut props = BasicProperties::default().with_message_id(ShortString::from(message_id));

        if let Some(content_type) = &self.content_type {
            props = props.with_content_type(ShortString::from(content_type.as_str()));
        }
        if let Some(headers) = &self.headers {
            props = props.with_headers(headers.clone());
        }
        if let Some(timestamp) = self.timestamp {
            props = props.with_timestamp(timestamp);
        }
        if self.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        props
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// RabbitMQ implementation of the Publisher trait.
pub struct RabbitMQPublisher {
    config: PublisherConfig,
    channel: Channel,
    closed: AtomicBool,
}

impl RabbitMQPublisher {
    /// Opens a channel on the shared connection and declares the exchange if the
    /// configuration asks for it.
    pub async fn new(
        config: PublisherConfig,
        manager: &ConnectionManager,
    ) -> Result<Arc<RabbitMQPublisher>, AmqpError> {
        config.validate()?;

        let (_, channel) = manager.acquire_channel().await?;
        debug!("channel obtained from connection manager");

        if config.confirm {
            if let Err(err) = channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
            {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                if let Err(close_err) = channel.close(200, "publisher setup failed").await {
                    error!(error = close_err.to_string(), "error closing publisher channel");
                }
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        }

        if config.declare_exchange {
            let kind = config.kind.clone().unwrap_or_default();
            debug!(name = config.exchange, kind = ?kind, "declaring exchange");

            if let Err(err) = channel
                .exchange_declare(
                    &config.exchange,
                    lapin::ExchangeKind::from(&kind),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: config.durable,
                        auto_delete: config.auto_delete,
                        internal: config.internal,
                        nowait: false,
                    },
                    config.args.clone(),
                )
                .await
            {
                error!(
                    error = err.to_string(),
                    name = config.exchange,
                    "error to declare the exchange"
                );
                if let Err(close_err) = channel.close(200, "publisher setup failed").await {
                    error!(error = close_err.to_string(), "error closing publisher channel");
                }
                return Err(AmqpError::DeclareExchangeError(config.exchange.clone()));
            }
        } else if !config.exchange.is_empty() {
            debug!(name = config.exchange, "assuming exchange already exists");
        }

        Ok(Arc::new(RabbitMQPublisher {
            config,
            channel,
            closed: AtomicBool::new(false),
        }))
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.channel.status().connected()
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::PublishingError(
                "not connected or channel is closed".to_owned(),
            ));
        }

        let tracer = global::tracer("amqp publisher");
        let mut span = tracer
            .span_builder(format!("{} publish", self.config.exchange))
            .with_kind(SpanKind::Producer)
            .start_with_context(&tracer, ctx);

        let result = self.publish_with_confirm(routing_key, message).await;
        match &result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = self.config.exchange,
                    routing_key,
                    "error publishing message"
                );
                span.record_error(err);
                span.set_status(Status::error(err.to_string()));
            }
        }
        span.end();

        result
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!(exchange = self.config.exchange, "closing publisher");
        if !self.channel.status().connected() {
            return Ok(());
        }

        match self.channel.close(200, "publisher closed").await {
            Err(err) => {
                error!(error = err.to_string(), "error closing publisher channel");
                Err(AmqpError::CloseError(err.to_string()))
            }
            _ => {
                info!(exchange = self.config.exchange, "publisher closed");
                Ok(())
            }
        }
    }
}

impl RabbitMQPublisher {
    async fn publish_with_confirm(
        &self,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.body,
                message.properties(),
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        if !self.config.confirm {
            return Ok(());
        }

        let confirmation = confirm
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        if confirmation.is_nack() {
            return Err(AmqpError::PublishingError(
                "publisher confirm NACK".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::{x_death, Ledger};

    #[test]
    fn declaring_requires_name_and_type_together() {
        let mut no_type = PublisherConfig::existing("events");
        no_type.declare_exchange = true;
        assert!(no_type.validate().is_err());

        let mut no_name = PublisherConfig::declared("", ExchangeKind::Topic);
        no_name.exchange.clear();
        assert!(no_name.validate().is_err());

        assert!(PublisherConfig::declared("events", ExchangeKind::Topic)
            .validate()
            .is_ok());
        assert!(PublisherConfig::existing("final_dlx").validate().is_ok());
        // default exchange
        assert!(PublisherConfig::default().validate().is_ok());
    }

    #[test]
    fn forwarded_message_copies_the_original_verbatim() {
        let headers = x_death(&[("links", 3)]);
        let delivery = Ledger::default().delivery(4, headers.clone());

        let forwarded = OutboundMessage::forward_of(&delivery);

        assert_eq!(forwarded.body, delivery.data);
        assert_eq!(forwarded.content_type.as_deref(), Some("application/json"));
        assert_eq!(forwarded.headers, Some(headers.clone()));
        assert!(forwarded.persistent);
        assert!(forwarded.timestamp.is_some());

        let props = forwarded.properties();
        assert_eq!(props.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(props.headers(), &Some(headers));
        assert!(props.message_id().is_some());
    }

    #[test]
    fn transient_message_has_no_delivery_mode() {
        let message = OutboundMessage {
            body: b"ping".to_vec(),
            ..Default::default()
        };

        let props = message.properties();
        assert_eq!(props.delivery_mode(), &None);
        assert_eq!(props.content_type(), &None);
    }
}
