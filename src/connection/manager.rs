// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

use crate::cluster::{ChannelType, ConnectionProfile, Node};
use crate::connection::{
    Connection, ConnectionListener, ConnectionListeners, RoundRobinStrategy, SelectStrategy,
};
use crate::exchange::OutboundHandler;
use crate::network::Channel;
use crate::{AppError, AppResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens one physical channel towards a node.
pub trait Connector: Send + Sync + 'static {
    fn connect_channel(
        self: Arc<Self>,
        node: Node,
        channel_type: ChannelType,
        timeout: Duration,
    ) -> BoxFuture<'static, AppResult<Arc<Channel>>>;
}

/// Runs against a freshly opened connection before it is registered, an error
/// closes the connection and fails the open.
pub trait ConnectionValidator: Send + Sync + 'static {
    fn validate(
        &self,
        connection: Arc<Connection>,
        profile: ConnectionProfile,
    ) -> BoxFuture<'static, AppResult<()>>;
}

type StrategyFactory = Box<dyn Fn() -> Box<dyn SelectStrategy> + Send + Sync>;
type PendingConnect = Vec<oneshot::Sender<AppResult<Arc<Connection>>>>;

/// Registry of the connections this process holds, one per node.
///
/// Opening is coalesced per node: the first caller starts the attempt, concurrent
/// callers wait for its outcome. The attempt holds the pending slot of the node
/// until it either registers a connection or fails, so a node has a single writer
/// at a time. Removal happens only from the connection's own close listener and
/// only if the registered entry is still that connection.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    outbound: Arc<OutboundHandler>,
    default_profile: ConnectionProfile,
    connections: DashMap<Node, Arc<Connection>>,
    pending: DashMap<Node, PendingConnect>,
    listeners: ConnectionListeners,
    validator: Option<Arc<dyn ConnectionValidator>>,
    strategy_factory: StrategyFactory,
    next_connection_id: AtomicU64,
    closing: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        outbound: Arc<OutboundHandler>,
        default_profile: ConnectionProfile,
    ) -> Self {
        ConnectionManager {
            connector,
            outbound,
            default_profile,
            connections: DashMap::new(),
            pending: DashMap::new(),
            listeners: ConnectionListeners::default(),
            validator: None,
            strategy_factory: Box::new(|| -> Box<dyn SelectStrategy> {
                Box::<RoundRobinStrategy>::default()
            }),
            next_connection_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ConnectionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_select_strategy<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn SelectStrategy> + Send + Sync + 'static,
    {
        self.strategy_factory = Box::new(factory);
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.remove(listener);
    }

    pub fn default_profile(&self) -> &ConnectionProfile {
        &self.default_profile
    }

    /// Connects to `node` unless already connected.
    ///
    /// All-or-nothing: every channel of the profile must connect within the connect
    /// timeout, otherwise the channels opened so far are closed and the first
    /// observed error is returned.
    pub async fn open_connection(
        self: &Arc<Self>,
        node: &Node,
        profile: Option<ConnectionProfile>,
    ) -> AppResult<Arc<Connection>> {
        if let Some(connection) = self.live_connection(node) {
            return Ok(connection);
        }

        let (tx, rx) = oneshot::channel();
        let start_attempt = match self.pending.entry(node.clone()) {
            Entry::Occupied(mut waiters) => {
                waiters.get_mut().push(tx);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![tx]);
                true
            }
        };

        if start_attempt {
            // the attempt runs detached so a dropped caller can not strand other waiters
            let manager = self.clone();
            let node = node.clone();
            tokio::spawn(async move {
                let result = manager.connect_and_register(&node, profile).await;
                let waiters = manager
                    .pending
                    .remove(&node)
                    .map(|(_, waiters)| waiters)
                    .unwrap_or_default();
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }

        rx.await.map_err(|_| {
            AppError::IllegalStateError(format!("connect attempt to {} was dropped", node))
        })?
    }

    pub fn connected(&self, node: &Node) -> bool {
        self.live_connection(node).is_some()
    }

    pub fn get_connection(&self, node: &Node) -> AppResult<Arc<Connection>> {
        self.live_connection(node)
            .ok_or_else(|| AppError::NodeNotConnected(node.to_string()))
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connected_nodes(&self) -> Vec<Node> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// Closes and removes the connection to `node`, no-op when not connected.
    pub fn disconnect(&self, node: &Node) {
        // clone out first, the close listener removes the entry
        let connection = self.connections.get(node).map(|entry| entry.value().clone());
        if let Some(connection) = connection {
            connection.close();
        }
    }

    /// Closes every connection, later opens fail.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        for connection in self.connections() {
            connection.close();
        }
        info!("connection manager closed");
    }

    fn live_connection(&self, node: &Node) -> Option<Arc<Connection>> {
        self.connections
            .get(node)
            .map(|entry| entry.value().clone())
            .filter(|connection| !connection.is_closed())
    }

    #[tracing::instrument(skip_all, fields(node = %node))]
    async fn connect_and_register(
        self: &Arc<Self>,
        node: &Node,
        profile: Option<ConnectionProfile>,
    ) -> AppResult<Arc<Connection>> {
        if self.closing.load(Ordering::Acquire) {
            return Err(AppError::IllegalStateError(
                "connection manager is closed".to_string(),
            ));
        }
        if let Some(connection) = self.live_connection(node) {
            return Ok(connection);
        }

        let profile = profile.unwrap_or_else(|| self.default_profile.clone());
        let channels = self.open_channels(node, &profile).await?;

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(
            id,
            node.clone(),
            channels,
            (self.strategy_factory)(),
            self.outbound.clone(),
        )?;

        if let Some(validator) = &self.validator {
            if let Err(e) = validator.validate(connection.clone(), profile).await {
                warn!(%node, error = %e, "connection validation failed");
                connection.close();
                return Err(e);
            }
        }
        if self.closing.load(Ordering::Acquire) {
            connection.close();
            return Err(AppError::IllegalStateError(
                "connection manager is closed".to_string(),
            ));
        }

        // a closed predecessor whose eviction has not run yet is replaced here, its
        // own close listener then no longer matches and stays silent
        let stale = match self.connections.entry(node.clone()) {
            Entry::Occupied(mut registered) => {
                let previous = registered.insert(connection.clone());
                (previous.id() != connection.id()).then_some(previous)
            }
            Entry::Vacant(slot) => {
                slot.insert(connection.clone());
                None
            }
        };
        if let Some(stale) = stale {
            debug!(%node, connection = stale.id(), "replaced closed connection");
            stale.close();
            self.listeners.on_node_disconnected(node, &stale);
        }
        self.listeners.on_connection_opened(&connection);
        self.listeners.on_node_connected(node, &connection);
        info!(%node, connection = id, channels = connection.channels().len(), "connected to node");

        let manager: Weak<ConnectionManager> = Arc::downgrade(self);
        let closed: Weak<Connection> = Arc::downgrade(&connection);
        let node = node.clone();
        // fires immediately if the connection already died
        connection.add_close_listener(move || {
            let (Some(manager), Some(connection)) = (manager.upgrade(), closed.upgrade()) else {
                return;
            };
            manager.on_connection_closed(&node, &connection);
        });

        // close() may have swept the map between the check above and the insert
        if self.closing.load(Ordering::Acquire) {
            connection.close();
            return Err(AppError::IllegalStateError(
                "connection manager is closed".to_string(),
            ));
        }

        Ok(connection)
    }

    fn on_connection_closed(&self, node: &Node, connection: &Arc<Connection>) {
        let removed = self
            .connections
            .remove_if(node, |_, registered| registered.id() == connection.id());
        self.listeners.on_connection_closed(connection);
        if removed.is_some() {
            debug!(%node, connection = connection.id(), "evicted closed connection");
            self.listeners.on_node_disconnected(node, connection);
        }
    }

    async fn open_channels(
        &self,
        node: &Node,
        profile: &ConnectionProfile,
    ) -> AppResult<Vec<(ChannelType, Arc<Channel>)>> {
        let connect_timeout = profile.connect_timeout();
        let mut attempts = JoinSet::new();
        for (index, channel_type) in profile.channel_types().into_iter().enumerate() {
            let connector = self.connector.clone();
            let node = node.clone();
            attempts.spawn(async move {
                let result = match time::timeout(
                    connect_timeout,
                    connector.connect_channel(node.clone(), channel_type, connect_timeout),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(AppError::ConnectTimeout(format!(
                        "{} channel to {} not connected within {:?}",
                        channel_type, node, connect_timeout
                    ))),
                };
                (index, channel_type, result)
            });
        }

        // wait for every attempt, a late success still has to be closed
        let mut opened = Vec::with_capacity(attempts.len());
        let mut first_error = None;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((index, channel_type, Ok(channel))) => opened.push((index, channel_type, channel)),
                Ok((_, _, Err(e))) => {
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    first_error.get_or_insert(AppError::IllegalStateError(format!(
                        "connect task failed: {}",
                        join_error
                    )));
                }
            }
        }

        if let Some(error) = first_error {
            warn!(%node, error = %error, closing = opened.len(), "failed to open connection");
            for (_, _, channel) in opened {
                channel.close();
            }
            return Err(error);
        }

        opened.sort_by_key(|(index, _, _)| *index);
        Ok(opened
            .into_iter()
            .map(|(_, channel_type, channel)| (channel_type, channel))
            .collect())
    }
}
