// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Broker
//!
//! This module owns the single live connection of the bus. The broker walks the
//! configured endpoints in order until one accepts a connection, hands the cached
//! connection to every caller and, when the transport reports a failure, moves to
//! `Recovering` and reconnects in the background at a fixed interval. Callers never
//! see a connection error: they wait until the broker is `Connected` again.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──(transport failure)──► Recovering
//!                                     ▲                                  │
//!                                     └───────────(reconnected)──────────┘
//! ```

use crate::{
    config::BrokerEndpoint,
    transport::{Connector, TransportConnection},
};
use parking_lot::RwLock;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the broker's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Recovering,
}

/// A live transport session to one endpoint.
///
/// Connections are replaced, never repaired: after a failure the broker installs a
/// new connection with a new id.
#[derive(Clone)]
pub struct Connection {
    id: u64,
    endpoint: BrokerEndpoint,
    transport: Arc<dyn TransportConnection>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub(crate) fn transport(&self) -> &Arc<dyn TransportConnection> {
        &self.transport
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.endpoint.host)
            .finish()
    }
}

/// Shared handle to the connection broker.
#[derive(Clone)]
pub struct ConnectionBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    name: String,
    endpoints: Vec<BrokerEndpoint>,
    reconnect_interval: Duration,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    active: RwLock<Option<Connection>>,
    next_id: AtomicU64,
    /// Bumped by `close`; a connect loop from an older epoch must not install.
    epoch: AtomicU64,
}

impl ConnectionBroker {
    /// Creates a broker over `endpoints`.
    ///
    /// No connection is attempted until the first call to
    /// [`get_connection`](Self::get_connection). An empty endpoint list falls back
    /// to the local broker.
    ///
    /// # Parameters
    /// * `name` - Connection name reported to the broker
    /// * `endpoints` - Endpoints in preference order
    /// * `reconnect_interval` - Pause between two rounds over all endpoints
    /// * `connector` - Transport used to open connections
    pub fn new(
        name: &str,
        endpoints: Vec<BrokerEndpoint>,
        reconnect_interval: Duration,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let endpoints = if endpoints.is_empty() {
            vec![BrokerEndpoint::local()]
        } else {
            endpoints
        };

        let (state, _) = watch::channel(ConnectionState::Disconnected);

        ConnectionBroker {
            inner: Arc::new(BrokerInner {
                name: name.to_owned(),
                endpoints,
                reconnect_interval,
                connector,
                state,
                active: RwLock::new(None),
                next_id: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn endpoints(&self) -> &[BrokerEndpoint] {
        &self.inner.endpoints
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.inner.reconnect_interval
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Returns the live connection, waiting for one to be established.
    ///
    /// Any number of callers may wait concurrently; a single background task does
    /// the connecting and all of them are woken when it succeeds. This never fails:
    /// unreachable endpoints are retried until the caller gives up by dropping the
    /// future.
    pub async fn get_connection(&self) -> Connection {
        let mut state = self.inner.state.subscribe();

        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => {
                    if let Some(conn) = self.current() {
                        return conn;
                    }
                }
                ConnectionState::Disconnected => BrokerInner::start_connecting(&self.inner),
                ConnectionState::Connecting | ConnectionState::Recovering => {}
            }

            if state.changed().await.is_err() {
                // The sender lives as long as `self`.
                warn!("connection state channel closed");
            }
        }
    }

    /// The active connection, if the broker is connected right now.
    pub fn current(&self) -> Option<Connection> {
        self.inner.active.read().clone()
    }

    /// Whether `connection_id` is the live connection.
    pub fn is_current(&self, connection_id: u64) -> bool {
        self.inner
            .active
            .read()
            .as_ref()
            .is_some_and(|c| c.id == connection_id)
    }

    /// Reports that `connection` is broken.
    ///
    /// Reports about a connection that was already replaced are ignored.
    pub fn report_failure(&self, connection: &Connection) {
        BrokerInner::connection_failed(&self.inner, connection.id);
    }

    /// Closes the live connection and returns to `Disconnected`.
    ///
    /// A reconnect in progress is abandoned. A later
    /// [`get_connection`](Self::get_connection) connects again.
    pub async fn close(&self) {
        let active = {
            let mut active = self.inner.active.write();
            self.inner.epoch.fetch_add(1, Ordering::AcqRel);
            self.inner.state.send_replace(ConnectionState::Disconnected);
            active.take()
        };

        if let Some(conn) = active {
            debug!(id = conn.id, "closing amqp connection");
            if let Err(err) = conn.transport.close().await {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }
    }
}

impl BrokerInner {
    fn start_connecting(inner: &Arc<BrokerInner>) {
        let _active = inner.active.read();
        let started = inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                return true;
            }
            false
        });

        if started {
            let epoch = inner.epoch.load(Ordering::Acquire);
            tokio::spawn(BrokerInner::connect_loop(Arc::downgrade(inner), epoch));
        }
    }

    fn connection_failed(inner: &Arc<BrokerInner>, connection_id: u64) {
        let epoch = {
            let mut active = inner.active.write();
            match active.as_ref() {
                Some(conn) if conn.id == connection_id => {
                    active.take();
                }
                _ => return,
            }
            inner.state.send_replace(ConnectionState::Recovering);
            inner.epoch.load(Ordering::Acquire)
        };

        warn!(id = connection_id, "amqp connection lost, recovering");
        tokio::spawn(BrokerInner::connect_loop(Arc::downgrade(inner), epoch));
    }

    fn is_superseded(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) != epoch
    }

    /// Tries every endpoint in order, sleeping `reconnect_interval` between rounds,
    /// until one connects, the broker is closed or the broker is dropped.
    async fn connect_loop(weak: Weak<BrokerInner>, epoch: u64) {
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };

            for endpoint in &inner.endpoints {
                if inner.is_superseded(epoch) {
                    debug!(epoch, "broker closed, reconnect abandoned");
                    return;
                }

                match inner.connector.connect(endpoint, &inner.name).await {
                    Ok(transport) => {
                        if let Err(transport) =
                            BrokerInner::install(&inner, epoch, endpoint.clone(), transport)
                        {
                            debug!(host = endpoint.host, "broker closed, dropping new connection");
                            if let Err(err) = transport.close().await {
                                warn!(error = err.to_string(), "failure to close connection");
                            }
                        }
                        return;
                    }
                    Err(err) => warn!(
                        error = err.to_string(),
                        host = endpoint.host,
                        "endpoint unreachable"
                    ),
                }
            }

            let interval = inner.reconnect_interval;
            drop(inner);

            error!(retry_in = ?interval, "no broker endpoint reachable");
            tokio::time::sleep(interval).await;
        }
    }

    /// Makes `transport` the live connection, handing it back when the broker was
    /// closed after this loop started.
    fn install(
        inner: &Arc<BrokerInner>,
        epoch: u64,
        endpoint: BrokerEndpoint,
        transport: Arc<dyn TransportConnection>,
    ) -> Result<(), Arc<dyn TransportConnection>> {
        if inner.is_superseded(epoch) {
            return Err(transport);
        }
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);

        let weak = Arc::downgrade(inner);
        transport.on_error(Box::new(move |err| {
            warn!(error = err.to_string(), id, "amqp connection failure reported");
            if let Some(inner) = weak.upgrade() {
                BrokerInner::connection_failed(&inner, id);
            }
        }));

        let mut active = inner.active.write();
        if inner.is_superseded(epoch) {
            return Err(transport);
        }
        info!(id, host = endpoint.host, "amqp connection established");
        *active = Some(Connection {
            id,
            endpoint,
            transport,
        });
        inner.state.send_replace(ConnectionState::Connected);
        Ok(())
    }
}
