// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module turns a [`ConsumerConfig`] into the broker objects a consumer needs
//! and installs them on a channel. The layout for a main queue `Q` with retry
//! enabled is:
//!
//! ```text
//! binding exchange --(routing key)--> Q
//! Q --(dead-lettered)--> Q_retry_ex (fanout) --> Q_retry_wait_<ttl>s
//! Q_retry_wait_<ttl>s --(ttl expired, routing key)--> binding exchange
//! final dead-letter exchange (direct) --(final routing key)--> final dead-letter queue
//! ```
//!
//! Everything after the main queue is described by a [`RetryTopology`], a plain list
//! of declarations computed from the configuration, so the layout can be checked
//! without a broker.

use crate::{config::ConsumerConfig, errors::AmqpError, exchange::ExchangeKind};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use tracing::{debug, error};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_ARGS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_ARGS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// One broker operation of a consumer's topology.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Exchange {
        name: String,
        kind: ExchangeKind,
        durable: bool,
        args: FieldTable,
    },
    Queue {
        name: String,
        durable: bool,
        args: FieldTable,
    },
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
        args: FieldTable,
    },
}

/// The declarations that follow the main queue, in installation order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetryTopology {
    pub declarations: Vec<Declaration>,
}

impl RetryTopology {
    /// Computes the binding and retry declarations for the queue the broker
    /// returned as `actual_queue`.
    pub fn plan(cfg: &ConsumerConfig, actual_queue: &str) -> RetryTopology {
        let mut declarations = vec![];

        if let Some(binding) = &cfg.binding {
            if binding.declare {
                declarations.push(Declaration::Exchange {
                    name: binding.exchange.clone(),
                    kind: binding.kind.clone().unwrap_or_default(),
                    durable: binding.durable,
                    args: binding.exchange_args.clone(),
                });
            }

            declarations.push(Declaration::Binding {
                queue: actual_queue.to_owned(),
                exchange: binding.exchange.clone(),
                routing_key: binding.routing_key.clone(),
                args: binding.binding_args.clone(),
            });
        }

        let retry = &cfg.retry;
        if !retry.enabled {
            return RetryTopology { declarations };
        }

        let fdl = &retry.final_dead_letter;
        declarations.push(Declaration::Exchange {
            name: fdl.exchange.clone(),
            kind: ExchangeKind::Direct,
            durable: true,
            args: FieldTable::default(),
        });
        declarations.push(Declaration::Queue {
            name: fdl.queue.clone(),
            durable: true,
            args: FieldTable::default(),
        });
        declarations.push(Declaration::Binding {
            queue: fdl.queue.clone(),
            exchange: fdl.exchange.clone(),
            routing_key: fdl.routing_key.clone(),
            args: FieldTable::default(),
        });

        declarations.push(Declaration::Exchange {
            name: retry.retry_exchange.clone(),
            kind: ExchangeKind::Fanout,
            durable: true,
            args: FieldTable::default(),
        });

        // expired messages go back through the default exchange when there is no binding
        let (return_exchange, return_key) = match &cfg.binding {
            Some(binding) => (binding.exchange.as_str(), binding.routing_key.as_str()),
            None => ("", actual_queue),
        };

        let mut wait_args = FieldTable::default();
        wait_args.insert(
            ShortString::from(crate::queue::AMQP_ARGS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(clamp_ttl(retry.retry_ttl_ms))),
        );
        wait_args.insert(
            ShortString::from(AMQP_ARGS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(return_exchange)),
        );
        wait_args.insert(
            ShortString::from(AMQP_ARGS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(return_key)),
        );

        declarations.push(Declaration::Queue {
            name: retry.retry_queue.clone(),
            durable: true,
            args: wait_args,
        });
        declarations.push(Declaration::Binding {
            queue: retry.retry_queue.clone(),
            exchange: retry.retry_exchange.clone(),
            routing_key: String::new(),
            args: FieldTable::default(),
        });

        RetryTopology { declarations }
    }

    /// Runs every declaration on `channel`, stopping at the first failure.
    pub async fn install(&self, channel: &Channel) -> Result<(), AmqpError> {
        for declaration in &self.declarations {
            declare(channel, declaration).await?;
        }

        Ok(())
    }
}

/// Arguments of the main queue: the configured ones plus the retry exchange as
/// dead-letter target when retry is enabled.
pub fn main_queue_args(cfg: &ConsumerConfig) -> FieldTable {
    let mut args = cfg.queue.args.clone();

    if cfg.retry.enabled {
        args.insert(
            ShortString::from(AMQP_ARGS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(cfg.retry.retry_exchange.as_str())),
        );
    }

    args
}

/// Declares the main queue if requested, then the rest of the topology.
///
/// Returns the name of the main queue, which is the broker-generated one when the
/// configured name is empty.
pub(crate) async fn install(channel: &Channel, cfg: &ConsumerConfig) -> Result<String, AmqpError> {
    let actual_queue = if cfg.queue.declare {
        debug!("creating queue: {}", cfg.queue.name);

        match channel
            .queue_declare(
                &cfg.queue.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: cfg.queue.durable,
                    exclusive: cfg.queue.exclusive,
                    auto_delete: cfg.queue.auto_delete,
                    nowait: false,
                },
                main_queue_args(cfg),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = cfg.queue.name,
                    "error to declare the queue"
                );
                return Err(AmqpError::DeclareQueueError(cfg.queue.name.clone()));
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                queue.name().as_str().to_owned()
            }
        }
    } else {
        cfg.queue.name.clone()
    };

    RetryTopology::plan(cfg, &actual_queue)
        .install(channel)
        .await?;

    Ok(actual_queue)
}

async fn declare(channel: &Channel, declaration: &Declaration) -> Result<(), AmqpError> {
    match declaration {
        Declaration::Exchange {
            name,
            kind,
            durable,
            args,
        } => {
            debug!("creating exchange: {}", name);

            match channel
                .exchange_declare(
                    name,
                    lapin::ExchangeKind::from(kind),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: *durable,
                        auto_delete: false,
                        internal: false,
                        nowait: false,
                    },
                    args.clone(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = name,
                        "error to declare the exchange"
                    );
                    Err(AmqpError::DeclareExchangeError(name.clone()))
                }
                _ => Ok(()),
            }
        }

        Declaration::Queue {
            name,
            durable,
            args,
        } => {
            debug!("creating queue: {}", name);

            match channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        passive: false,
                        durable: *durable,
                        exclusive: false,
                        auto_delete: false,
                        nowait: false,
                    },
                    args.clone(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), name = name, "error to declare the queue");
                    Err(AmqpError::DeclareQueueError(name.clone()))
                }
                _ => Ok(()),
            }
        }

        Declaration::Binding {
            queue,
            exchange,
            routing_key,
            args,
        } => {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                queue, exchange, routing_key
            );

            match channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions { nowait: false },
                    args.clone(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    Err(AmqpError::BindingExchangeToQueueError(
                        exchange.clone(),
                        queue.clone(),
                    ))
                }
                _ => Ok(()),
            }
        }
    }
}

fn clamp_ttl(ttl_ms: u32) -> i32 {
    i32::try_from(ttl_ms).unwrap_or(i32::MAX)
}
