// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Delivery Layer
//!
//! This module provides the error type shared by the connection manager, the
//! consumers and the publisher. The `AmqpError` enum carries the broker's error
//! text as a string so that it stays comparable in tests.

use thiserror::Error;

/// Error returned by message handlers. Any failure counts as a processing failure
/// and is routed through the retry state machine.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Configuration and topology errors are fatal at construction time. Errors raised
/// while settling a delivery are logged by the consumers and never stop the
/// consumption loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Invalid consumer, publisher or broker configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The connection manager was closed and no longer hands out channels
    #[error("connection manager closed")]
    ManagerClosed,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error forwarding an exhausted message to the final dead-letter exchange
    #[error("failure to publish to the final dead-letter exchange: {0}")]
    PublishingToDLXError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// The broker closed the delivery stream, usually because the connection dropped
    #[error("delivery stream closed: {0}")]
    ConsumerStreamClosed(String),

    /// Error releasing a channel or connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),
}
