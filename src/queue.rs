// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Declaration parameters for the queues the bus consumes from. Subscriptions
//! declare their queue before registering a consumer, so a consumer can come back
//! on its own after a connection recovery. Exchanges, bindings and dead lettering
//! are left to the application's topology tooling.

/// Definition of a RabbitMQ queue with its declaration parameters.
///
/// An empty name asks the broker to generate one; the generated name is reported
/// back by the declaring channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// A broker-named, exclusive, auto-delete queue. Used for reply queues.
    pub fn server_named() -> QueueDefinition {
        QueueDefinition::new("").exclusive().delete()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// Exclusive queues are deleted when the connection closes, so they are
    /// re-declared after every connection recovery.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists instead of creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }
}
