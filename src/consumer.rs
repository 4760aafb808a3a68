// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module holds what both consumption strategies share: the [`Consumer`]
//! trait, the channel and topology setup done at construction, and the
//! settlement state machine that decides how a delivery leaves the main queue.
//!
//! ```text
//! handler ok                        -> ack
//! handler err, retry disabled       -> nack(requeue=false)
//! handler err, retry enabled:
//!   redelivery count <  max_retries -> nack(requeue=false), back after the retry ttl
//!   redelivery count >= max_retries -> publish to the final dead-letter exchange,
//!                                      ack when published, nack(requeue=false) if not
//! ```
//!
//! A message whose escalation keeps failing loops through the wait queue until a
//! publish succeeds.

use crate::{
    config::ConsumerConfig,
    connection::ConnectionManager,
    delivery::Delivery,
    errors::{AmqpError, HandlerError},
    publisher::{OutboundMessage, Publisher, PublisherConfig, RabbitMQPublisher},
    retry::{FailureAction, RetryPolicy},
    topology,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::Context;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

/// A running subscription to one queue.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Consumes until `cancel` fires, which returns `Ok(())`, or until the delivery
    /// stream fails or ends, which returns an error.
    async fn start_consuming(&self, cancel: CancellationToken) -> Result<(), AmqpError>;

    /// Stops consumption, waits for in-flight work including the final batch
    /// flush, then releases the escalation publisher and the channel. Calling it
    /// twice is a no-op.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Acked,
    Dropped,
    Retried,
    Escalated,
    EscalationFailed,
}

/// Applies the settlement state machine to deliveries of one queue.
pub(crate) struct Settler {
    queue: String,
    consumer_tag: String,
    retry: RetryPolicy,
    escalation: Option<Arc<dyn Publisher>>,
}

impl Settler {
    pub(crate) fn new(
        queue: &str,
        consumer_tag: &str,
        retry: RetryPolicy,
        escalation: Option<Arc<dyn Publisher>>,
    ) -> Settler {
        Settler {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            retry,
            escalation,
        }
    }

    pub(crate) fn retry_enabled(&self) -> bool {
        self.retry.enabled
    }

    /// Settles a delivery according to its handler result.
    pub(crate) async fn settle(
        &self,
        ctx: &Context,
        delivery: &Delivery,
        result: Result<(), HandlerError>,
    ) -> Result<Disposition, AmqpError> {
        match result {
            Ok(()) => {
                debug!(
                    consumer_tag = self.consumer_tag,
                    delivery_tag = delivery.delivery_tag,
                    "message successfully processed"
                );
                delivery.ack(false).await?;
                Ok(Disposition::Acked)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    consumer_tag = self.consumer_tag,
                    delivery_tag = delivery.delivery_tag,
                    "error whiling handling msg"
                );
                self.settle_failure(ctx, delivery).await
            }
        }
    }

    /// The failure branch of the state machine for a single delivery.
    pub(crate) async fn settle_failure(
        &self,
        ctx: &Context,
        delivery: &Delivery,
    ) -> Result<Disposition, AmqpError> {
        let count = delivery.redelivery_count(&self.queue);

        match self.retry.decide(count) {
            FailureAction::Drop => {
                debug!(
                    consumer_tag = self.consumer_tag,
                    delivery_tag = delivery.delivery_tag,
                    "retry disabled, removing message from queue"
                );
                delivery.nack(false, false).await?;
                Ok(Disposition::Dropped)
            }
            FailureAction::Retry => {
                warn!(
                    consumer_tag = self.consumer_tag,
                    delivery_tag = delivery.delivery_tag,
                    count,
                    max_retries = self.retry.max_retries,
                    "sending message to the retry queue"
                );
                delivery.nack(false, false).await?;
                Ok(Disposition::Retried)
            }
            FailureAction::Escalate => self.escalate(ctx, delivery, count).await,
        }
    }

    async fn escalate(
        &self,
        ctx: &Context,
        delivery: &Delivery,
        count: i64,
    ) -> Result<Disposition, AmqpError> {
        error!(
            consumer_tag = self.consumer_tag,
            delivery_tag = delivery.delivery_tag,
            count,
            "too many attempts, sending to the final dead-letter exchange"
        );

        let published = self.forward(ctx, delivery).await;

        match published {
            Ok(()) => {
                delivery.ack(false).await?;
                Ok(Disposition::Escalated)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    consumer_tag = self.consumer_tag,
                    delivery_tag = delivery.delivery_tag,
                    "error whiling sending to the final dead-letter exchange, retrying later"
                );
                delivery.nack(false, false).await?;
                Ok(Disposition::EscalationFailed)
            }
        }
    }

    /// Publishes a copy of `delivery` to the final dead-letter exchange.
    async fn forward(&self, ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
        let publisher = self.escalation.as_ref().ok_or_else(|| {
            AmqpError::PublishingToDLXError("no escalation publisher configured".to_owned())
        })?;

        publisher
            .publish(
                ctx,
                &self.retry.final_dead_letter.routing_key,
                &OutboundMessage::forward_of(delivery),
            )
            .await
            .map_err(|err| AmqpError::PublishingToDLXError(err.to_string()))
    }
}

/// Channel, topology and bookkeeping shared by both consumer strategies.
pub(crate) struct BaseConsumer {
    pub(crate) channel: Channel,
    pub(crate) config: ConsumerConfig,
    pub(crate) queue: String,
    pub(crate) settler: Arc<Settler>,
    pub(crate) tracker: TaskTracker,
    stop: CancellationToken,
    escalation: Option<Arc<dyn Publisher>>,
    closed: AtomicBool,
}

impl BaseConsumer {
    /// Opens a channel and installs the consumer's topology. Any failure closes
    /// the channel before it is returned; the shared connection stays open.
    pub(crate) async fn new(
        config: ConsumerConfig,
        manager: &ConnectionManager,
    ) -> Result<BaseConsumer, AmqpError> {
        config.validate()?;

        let (_, channel) = manager.acquire_channel().await?;

        let (queue, escalation) = match Self::setup(&channel, &config, manager).await {
            Ok(ready) => ready,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = config.queue.name,
                    "consumer setup failed, closing channel"
                );
                if let Err(close_err) = channel.close(200, "consumer setup failed").await {
                    error!(error = close_err.to_string(), "error closing consumer channel");
                }
                return Err(err);
            }
        };

        info!(
            queue,
            consumer_tag = config.consumer_tag,
            retry = config.retry.enabled,
            "consumer ready"
        );

        let settler = Arc::new(Settler::new(
            &queue,
            &config.consumer_tag,
            config.retry.clone(),
            escalation.clone(),
        ));

        Ok(BaseConsumer {
            channel,
            config,
            queue,
            settler,
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
            escalation,
            closed: AtomicBool::new(false),
        })
    }

    async fn setup(
        channel: &Channel,
        config: &ConsumerConfig,
        manager: &ConnectionManager,
    ) -> Result<(String, Option<Arc<dyn Publisher>>), AmqpError> {
        let qos = &config.qos;
        if qos.prefetch_size > 0 {
            warn!(
                prefetch_size = qos.prefetch_size,
                "prefetch size is not supported by the client and will be ignored"
            );
        }

        if qos.prefetch_count > 0 || qos.prefetch_size > 0 {
            debug!(prefetch_count = qos.prefetch_count, global = qos.global, "configuring qos");
            if let Err(err) = channel
                .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
                .await
            {
                error!(error = err.to_string(), "failure to configure qos");
                return Err(AmqpError::QoSDeclarationError(err.to_string()));
            }
        }

        let queue = topology::install(channel, config).await?;

        if !config.retry.enabled {
            return Ok((queue, None));
        }

        let publisher = RabbitMQPublisher::new(
            PublisherConfig::existing(&config.retry.final_dead_letter.exchange).with_confirms(),
            manager,
        )
        .await?;

        Ok((queue, Some(publisher as Arc<dyn Publisher>)))
    }

    /// Registers a manual-ack broker consumer on the main queue.
    pub(crate) async fn consume(&self) -> Result<lapin::Consumer, AmqpError> {
        match self
            .channel
            .basic_consume(
                &self.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: self.config.exclusive_consumer,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(self.queue.clone()))
            }
            Ok(consumer) => {
                info!(
                    queue = self.queue,
                    consumer_tag = consumer.tag().as_str(),
                    "consuming"
                );
                Ok(consumer)
            }
        }
    }

    /// Token that fires when either the caller cancels or the consumer is closed.
    pub(crate) fn consumption_token(&self, cancel: CancellationToken) -> CancellationToken {
        link(&self.stop, cancel)
    }

    pub(crate) async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.stop.cancel();
        self.tracker.close();
        debug!(in_flight = self.tracker.len(), "waiting for in-flight messages");
        self.tracker.wait().await;

        let mut first_err = None;

        if let Some(publisher) = &self.escalation {
            if let Err(err) = publisher.close().await {
                error!(error = err.to_string(), "error closing escalation publisher");
                first_err.get_or_insert(err);
            }
        }

        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(200, "consumer closed").await {
                error!(error = err.to_string(), "error closing consumer channel");
                first_err.get_or_insert(AmqpError::CloseError(err.to_string()));
            }
        }

        info!(queue = self.queue, "consumer closed");
        first_err.map_or(Ok(()), Err)
    }
}

fn link(stop: &CancellationToken, cancel: CancellationToken) -> CancellationToken {
    let token = stop.child_token();
    let linked = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => linked.cancel(),
            _ = linked.cancelled() => {}
        }
    });

    token
}
