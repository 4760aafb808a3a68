// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Application callbacks invoked by the consumers.

use crate::{delivery::Delivery, errors::HandlerError};
use async_trait::async_trait;
use opentelemetry::Context;

/// Processes one delivery. An `Err` sends the delivery down the retry path.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Processes a batch of deliveries as a unit. An `Err` fails the whole batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, deliveries: &[Delivery]) -> Result<(), HandlerError>;
}
