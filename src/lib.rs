// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

#[cfg(test)]
mod testing;

pub mod acknowledger;
pub mod amqp;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod errors;
pub mod handler;
pub mod pending;
pub mod publisher;
pub mod queue;
pub mod requester;
pub mod responder;
pub mod strategy;
pub mod subscriber;
pub mod transport;
