// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Strategies
//!
//! Decides what happens to a delivery whose handler failed, and what a requester is
//! told when the responder's handler failed.

use crate::{errors::AmqpError, handler::ConsumerMessage};

/// What to answer the broker for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack { requeue: bool },
}

#[cfg_attr(test, mockall::automock)]
pub trait ErrorStrategy: Send + Sync {
    fn on_handler_failure(&self, msg: &ConsumerMessage, err: &AmqpError) -> Disposition;

    /// Text sent back to the requester instead of a result.
    fn on_responder_failure(&self, msg: &ConsumerMessage, err: &AmqpError) -> String;
}

/// Nacks failed deliveries, requeueing them when configured to.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStrategy {
    requeue: bool,
}

impl DefaultStrategy {
    pub fn new(requeue: bool) -> Self {
        DefaultStrategy { requeue }
    }
}

impl ErrorStrategy for DefaultStrategy {
    fn on_handler_failure(&self, _msg: &ConsumerMessage, _err: &AmqpError) -> Disposition {
        Disposition::Nack {
            requeue: self.requeue,
        }
    }

    fn on_responder_failure(&self, msg: &ConsumerMessage, err: &AmqpError) -> String {
        format!("{} failed handling request on `{}`", err, msg.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_follows_the_requeue_flag() {
        let msg = ConsumerMessage::default();
        let err = AmqpError::HandlerFailure("boom".to_owned());

        assert_eq!(
            DefaultStrategy::new(true).on_handler_failure(&msg, &err),
            Disposition::Nack { requeue: true }
        );
        assert_eq!(
            DefaultStrategy::default().on_handler_failure(&msg, &err),
            Disposition::Nack { requeue: false }
        );
    }
}
