// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resolve-Once Completion Table
//!
//! Publish confirms and request replies both arrive asynchronously and race a
//! local deadline. This module models each outstanding operation as an entry in a
//! table keyed by its identity (sequence number or correlation id) together with a
//! [`Completion`] future held by the waiting caller.
//!
//! ```text
//! register(key, deadline) ──► entry + timer ──► Completion (caller awaits)
//!          resolve(key, outcome) ──┐
//!          timer fires ────────────┼──► remove entry ──► complete once
//!          Completion dropped ─────┘
//! ```
//!
//! Whichever of broker verdict, deadline or caller cancellation removes the entry
//! first decides the outcome; every later attempt finds nothing and is a no-op.

use crate::errors::AmqpError;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt::Debug,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};
use tokio::{sync::oneshot, task::AbortHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Outcome<V> = Result<V, AmqpError>;
type Entries<K, V> = Mutex<HashMap<K, Entry<V>>>;

struct Entry<V> {
    sender: oneshot::Sender<Outcome<V>>,
    timer: AbortHandle,
}

/// Table of operations awaiting an asynchronous outcome.
pub struct PendingTable<K, V> {
    entries: Arc<Entries<K, V>>,
}

impl<K, V> Clone for PendingTable<K, V> {
    fn clone(&self) -> Self {
        PendingTable {
            entries: self.entries.clone(),
        }
    }
}

impl<K, V> Default for PendingTable<K, V> {
    fn default() -> Self {
        PendingTable {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> PendingTable<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Unpin + 'static,
    V: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` until `deadline`.
    ///
    /// # Parameters
    /// * `key` - Identity of the operation
    /// * `deadline` - When the entry completes with `on_timeout` if still pending
    /// * `on_timeout` - Outcome delivered at the deadline
    ///
    /// # Returns
    /// The completion to await, or `None` when `key` is already outstanding. The
    /// existing entry is left untouched.
    pub fn register(
        &self,
        key: K,
        deadline: Instant,
        on_timeout: AmqpError,
    ) -> Option<Completion<K, V>> {
        let (sender, receiver) = oneshot::channel();

        // The timer resolves through the same lock, so it cannot run before the
        // entry is in place.
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return None;
        }

        let weak = Arc::downgrade(&self.entries);
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(entries) = weak.upgrade() {
                if resolve_in(&entries, &timer_key, Err(on_timeout)) {
                    debug!(key = ?timer_key, "pending operation timed out");
                }
            }
        })
        .abort_handle();

        entries.insert(key.clone(), Entry { sender, timer });

        Some(Completion {
            key,
            receiver,
            table: Arc::downgrade(&self.entries),
            done: false,
        })
    }

    /// Completes the entry registered under `key` with `outcome`.
    ///
    /// # Returns
    /// `false` when nothing is registered, i.e. the entry was already resolved,
    /// timed out or cancelled.
    pub fn resolve(&self, key: &K, outcome: Outcome<V>) -> bool {
        resolve_in(&self.entries, key, outcome)
    }

    /// Whether `key` is still outstanding.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn resolve_in<K: Eq + Hash, V>(entries: &Entries<K, V>, key: &K, outcome: Outcome<V>) -> bool {
    let Some(entry) = entries.lock().remove(key) else {
        return false;
    };
    entry.timer.abort();
    // The receiver may be gone already if the caller stopped waiting.
    let _ = entry.sender.send(outcome);
    true
}

/// Future completing with the outcome of one registered operation.
///
/// Dropping it before completion removes the entry from its table.
pub struct Completion<K: Eq + Hash, V> {
    key: K,
    receiver: oneshot::Receiver<Outcome<V>>,
    table: Weak<Entries<K, V>>,
    done: bool,
}

impl<K: Eq + Hash, V> Completion<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Unpin, V> Future for Completion<K, V> {
    type Output = Outcome<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.receiver).poll(cx);
        match polled {
            Poll::Ready(outcome) => {
                self.done = true;
                // A dropped sender means the whole table went away.
                Poll::Ready(outcome.unwrap_or(Err(AmqpError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<K: Eq + Hash, V> Drop for Completion<K, V> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(entries) = self.table.upgrade() {
            if let Some(entry) = entries.lock().remove(&self.key) {
                entry.timer.abort();
            }
        }
    }
}

/// Runs `fut` until it completes or `token` is cancelled.
pub async fn with_cancellation<F, T>(token: &CancellationToken, fut: F) -> Result<T, AmqpError>
where
    F: Future<Output = Result<T, AmqpError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AmqpError::Cancelled),
        result = fut => result,
    }
}
