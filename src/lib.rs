// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable message consumption on top of RabbitMQ: a shared connection manager,
//! per-consumer retry topologies with a final dead-letter escalation, and two
//! consumption strategies (one task per message, or batches).

mod otel;

pub mod batch;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod distributing;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
