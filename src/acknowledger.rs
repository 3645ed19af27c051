// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Acknowledger
//!
//! Tracks publishes waiting for a broker confirm. An entry is keyed by the channel
//! identity and the confirm sequence number and must be tracked *before* the frame
//! is sent, so an ack that races the send still finds it. Each entry completes
//! exactly once: with the broker's ack, with its nack, or with a timeout.

use crate::{
    errors::{AmqpError, ConfirmFailure},
    pending::{Completion, PendingTable},
    transport::{ConfirmListener, Confirmation},
};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::debug;

/// `(channel id, sequence number)`
pub type ConfirmKey = (u64, u64);

/// Resolves to `Ok(())` on ack, `PublishNotConfirmed` on nack or timeout.
pub type ConfirmHandle = Completion<ConfirmKey, ()>;

#[derive(Clone)]
pub struct PublishAcknowledger {
    timeout: Duration,
    pending: PendingTable<ConfirmKey, ()>,
}

impl PublishAcknowledger {
    /// # Parameters
    /// * `timeout` - How long a publish may wait for its confirm
    pub fn new(timeout: Duration) -> Self {
        PublishAcknowledger {
            timeout,
            pending: PendingTable::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts tracking `sequence` on `channel_id` until `deadline`.
    pub fn track(
        &self,
        channel_id: u64,
        sequence: u64,
        deadline: Instant,
    ) -> Result<ConfirmHandle, AmqpError> {
        self.pending
            .register(
                (channel_id, sequence),
                deadline,
                AmqpError::PublishNotConfirmed(ConfirmFailure::Timeout),
            )
            .ok_or(AmqpError::DuplicateSequence(sequence))
    }

    /// Tracks with the configured timeout.
    pub fn track_default(&self, channel_id: u64, sequence: u64) -> Result<ConfirmHandle, AmqpError> {
        self.track(channel_id, sequence, Instant::now() + self.timeout)
    }

    /// Applies the broker verdict. Returns `false` for unknown or already settled
    /// entries, e.g. an ack arriving after the local timeout.
    pub fn resolve(&self, channel_id: u64, sequence: u64, confirmation: Confirmation) -> bool {
        let outcome = match confirmation {
            Confirmation::Ack => Ok(()),
            Confirmation::Nack => Err(AmqpError::PublishNotConfirmed(ConfirmFailure::Nack)),
        };

        let resolved = self.pending.resolve(&(channel_id, sequence), outcome);
        if !resolved {
            debug!(channel_id, sequence, "ignoring confirm for settled publish");
        }
        resolved
    }

    /// Fails a tracked publish with the error that prevented it from being sent.
    pub fn fail(&self, channel_id: u64, sequence: u64, err: AmqpError) -> bool {
        self.pending.resolve(&(channel_id, sequence), Err(err))
    }

    /// Transport callback that feeds a channel's confirms back into this tracker.
    pub fn listener(&self, channel_id: u64) -> ConfirmListener {
        let acknowledger = self.clone();
        Arc::new(move |sequence, confirmation| {
            acknowledger.resolve(channel_id, sequence, confirmation);
        })
    }

    /// Number of publishes still waiting for a verdict.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
