// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Distributing Consumer
//!
//! Hands every delivery to the handler on its own task, so up to `prefetch_count`
//! messages are processed concurrently. Each task settles its own delivery. The
//! dispatch loop and the tasks are tracked so [`Consumer::close`] can wait for
//! them before the channel goes away.

use crate::{
    config::ConsumerConfig,
    connection::ConnectionManager,
    consumer::{BaseConsumer, Consumer, Settler},
    delivery::Delivery,
    errors::AmqpError,
    handler::MessageHandler,
    otel,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{error::Error, sync::Arc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

/// Consumer that processes deliveries concurrently, one task per message.
pub struct DistributingConsumer {
    base: BaseConsumer,
    handler: Arc<dyn MessageHandler>,
}

impl DistributingConsumer {
    /// Sets up the channel and topology described by `config`.
    pub async fn new(
        config: ConsumerConfig,
        manager: &ConnectionManager,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<DistributingConsumer, AmqpError> {
        let base = BaseConsumer::new(config, manager).await?;
        Ok(DistributingConsumer { base, handler })
    }

    /// Name of the queue being consumed, as returned by the broker.
    pub fn queue(&self) -> &str {
        &self.base.queue
    }
}

#[async_trait]
impl Consumer for DistributingConsumer {
    async fn start_consuming(&self, cancel: CancellationToken) -> Result<(), AmqpError> {
        let cancel = self.base.consumption_token(cancel);
        let deliveries = self.base.consume().await?.map(|r| r.map(Delivery::from));

        let tracker = &self.base.tracker;
        tracker
            .track_future(dispatch(
                deliveries,
                cancel,
                tracker,
                self.base.settler.clone(),
                self.handler.clone(),
                &self.base.queue,
            ))
            .await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.base.close().await
    }
}

pub(crate) async fn dispatch<S, E>(
    deliveries: S,
    cancel: CancellationToken,
    tracker: &TaskTracker,
    settler: Arc<Settler>,
    handler: Arc<dyn MessageHandler>,
    queue: &str,
) -> Result<(), AmqpError>
where
    S: Stream<Item = Result<Delivery, E>>,
    E: Error,
{
    tokio::pin!(deliveries);

    loop {
        if cancel.is_cancelled() {
            info!(queue, "consumption cancelled");
            return Ok(());
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(queue, "consumption cancelled");
                return Ok(());
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                debug!(
                    queue,
                    delivery_tag = delivery.delivery_tag,
                    exchange = delivery.exchange,
                    "received"
                );
                tracker.spawn(handle(
                    settler.clone(),
                    handler.clone(),
                    delivery,
                    queue.to_owned(),
                ));
            }
            Some(Err(err)) => {
                error!(error = err.to_string(), queue, "errors consume msg");
                return Err(AmqpError::ConsumerStreamClosed(err.to_string()));
            }
            None => {
                error!(queue, "delivery stream ended");
                return Err(AmqpError::ConsumerStreamClosed(
                    "delivery stream ended".to_owned(),
                ));
            }
        }
    }
}

async fn handle(
    settler: Arc<Settler>,
    handler: Arc<dyn MessageHandler>,
    delivery: Delivery,
    queue: String,
) {
    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &queue);

    let result = handler.exec(&ctx, &delivery).await;
    match &result {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            span.record_error(err.as_ref());
            span.set_status(Status::error(err.to_string()));
        }
    }

    match settler.settle(&ctx, &delivery, result).await {
        Ok(disposition) => debug!(
            queue,
            delivery_tag = delivery.delivery_tag,
            disposition = ?disposition,
            "message settled"
        ),
        Err(err) => {
            error!(
                error = err.to_string(),
                queue,
                delivery_tag = delivery.delivery_tag,
                "error settling msg"
            );
            span.record_error(&err);
        }
    }

    span.end();
}
