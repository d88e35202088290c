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

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::cluster::{ChannelType, Node};
use crate::exchange::{OutboundHandler, TransportMessage, TransportRequestOptions};
use crate::network::{Channel, CloseListener};
use crate::{AppError, AppResult};

/// Picks one channel index out of a connection's pool for each send.
pub trait SelectStrategy: Send + Sync + fmt::Debug {
    fn select_index(&self, len: usize) -> AppResult<usize>;
}

fn empty_pool() -> AppError {
    AppError::IllegalStateError("no channel available to select from".to_string())
}

/// `counter mod len`, shared by every caller of the connection.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl SelectStrategy for RoundRobinStrategy {
    fn select_index(&self, len: usize) -> AppResult<usize> {
        if len == 0 {
            return Err(empty_pool());
        }
        Ok(self.counter.fetch_add(1, Ordering::Relaxed) % len)
    }
}

#[derive(Debug, Default)]
pub struct RandomStrategy;

impl SelectStrategy for RandomStrategy {
    fn select_index(&self, len: usize) -> AppResult<usize> {
        if len == 0 {
            return Err(empty_pool());
        }
        Ok(rand::thread_rng().gen_range(0..len))
    }
}

#[derive(Debug)]
struct TypedChannels {
    indices: Vec<usize>,
    strategy: RoundRobinStrategy,
}

/// A logical connection to one node, backed by a pool of physical channels.
///
/// The connection owns its channels: closing it closes every one of them, and any
/// member channel closing on its own closes the whole connection.
pub struct Connection {
    id: u64,
    node: Node,
    channels: Vec<Arc<Channel>>,
    typed: HashMap<ChannelType, TypedChannels>,
    strategy: Box<dyn SelectStrategy>,
    outbound: Arc<OutboundHandler>,
    closed: AtomicBool,
    close_listeners: Mutex<Option<Vec<CloseListener>>>,
    created_at: Instant,
}

impl Connection {
    pub fn new(
        id: u64,
        node: Node,
        channels: Vec<(ChannelType, Arc<Channel>)>,
        strategy: Box<dyn SelectStrategy>,
        outbound: Arc<OutboundHandler>,
    ) -> AppResult<Arc<Connection>> {
        if channels.is_empty() {
            return Err(AppError::IllegalStateError(format!(
                "connection to {} needs at least one channel",
                node
            )));
        }
        let mut typed: HashMap<ChannelType, TypedChannels> = HashMap::new();
        for (index, (channel_type, _)) in channels.iter().enumerate() {
            typed
                .entry(*channel_type)
                .or_insert_with(|| TypedChannels {
                    indices: Vec::new(),
                    strategy: RoundRobinStrategy::default(),
                })
                .indices
                .push(index);
        }

        let connection = Arc::new(Connection {
            id,
            node,
            channels: channels.into_iter().map(|(_, channel)| channel).collect(),
            typed,
            strategy,
            outbound,
            closed: AtomicBool::new(false),
            close_listeners: Mutex::new(Some(Vec::new())),
            created_at: Instant::now(),
        });

        for channel in &connection.channels {
            let weak: Weak<Connection> = Arc::downgrade(&connection);
            channel.add_close_listener(move || {
                if let Some(connection) = weak.upgrade() {
                    connection.close();
                }
            });
        }
        Ok(connection)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Selects a channel with the connection's strategy.
    pub fn channel(&self) -> AppResult<Arc<Channel>> {
        self.ensure_open()?;
        let index = self.strategy.select_index(self.channels.len())?;
        Ok(self.channels[index].clone())
    }

    /// Round-robins over the channels opened for `channel_type`.
    pub fn channel_for(&self, channel_type: ChannelType) -> AppResult<Arc<Channel>> {
        self.ensure_open()?;
        let typed = self.typed.get(&channel_type).ok_or_else(|| {
            AppError::IllegalStateError(format!(
                "no {} channel in connection to {}",
                channel_type, self.node
            ))
        })?;
        let index = typed.strategy.select_index(typed.indices.len())?;
        Ok(self.channels[typed.indices[index]].clone())
    }

    pub fn has_channel_type(&self, channel_type: ChannelType) -> bool {
        self.typed.contains_key(&channel_type)
    }

    /// Frames `request` and queues it on a selected channel.
    ///
    /// Fails immediately when the connection is closed; write failures later on are
    /// delivered to the response handler registered under `request_id`.
    pub fn send_request<R: TransportMessage>(
        &self,
        request_id: u64,
        action: &str,
        request: &R,
        options: &TransportRequestOptions,
    ) -> AppResult<()> {
        let channel = match options.channel_type() {
            Some(channel_type) => self.channel_for(channel_type)?,
            None => self.channel()?,
        };
        self.outbound.send_request(
            &self.node,
            &channel,
            request_id,
            action,
            request,
            options.headers(),
        )
    }

    /// Closes every member channel once, later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(connection = self.id, node = %self.node, "closing connection");
        for channel in &self.channels {
            channel.close();
        }
        let listeners = self.close_listeners.lock().take();
        for listener in listeners.into_iter().flatten() {
            listener();
        }
    }

    /// Fires exactly once when the connection closes, right away if already closed.
    pub fn add_close_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.close_listeners.lock();
        match guard.as_mut() {
            Some(listeners) => listeners.push(Box::new(listener)),
            None => {
                drop(guard);
                listener();
            }
        }
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed(format!(
                "connection {} to {}",
                self.id, self.node
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("channels", &self.channels.len())
            .field("strategy", &self.strategy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{duplex_channel, test_node, test_outbound};
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::io::DuplexStream;

    fn connection_with(types: &[ChannelType]) -> (Arc<Connection>, Vec<DuplexStream>) {
        let mut channels = Vec::new();
        let mut peers = Vec::new();
        for (i, channel_type) in types.iter().enumerate() {
            let (channel, peer) = duplex_channel(i as u64);
            channels.push((*channel_type, channel));
            peers.push(peer);
        }
        let connection = Connection::new(
            1,
            test_node(),
            channels,
            Box::<RoundRobinStrategy>::default(),
            test_outbound(),
        )
        .unwrap();
        (connection, peers)
    }

    #[rstest]
    #[case(3, 9)]
    #[case(3, 10)]
    #[case(4, 7)]
    #[case(1, 5)]
    #[tokio::test]
    async fn test_round_robin_is_even(#[case] channels: usize, #[case] requests: usize) {
        let (connection, _peers) = connection_with(&vec![ChannelType::Light; channels]);
        let mut visits: HashMap<u64, usize> = HashMap::new();
        for _ in 0..requests {
            *visits.entry(connection.channel().unwrap().id()).or_default() += 1;
        }
        let floor = requests / channels;
        let ceil = requests.div_ceil(channels);
        assert_eq!(visits.len(), channels.min(requests));
        assert!(visits.values().all(|v| *v == floor || *v == ceil));
    }

    #[test]
    fn test_strategies_fail_on_empty_pool() {
        assert!(RoundRobinStrategy::default().select_index(0).is_err());
        assert!(RandomStrategy.select_index(0).is_err());
        assert!(RandomStrategy.select_index(3).unwrap() < 3);
    }

    #[tokio::test]
    async fn test_empty_connection_is_rejected() {
        let result = Connection::new(
            1,
            test_node(),
            Vec::new(),
            Box::<RoundRobinStrategy>::default(),
            test_outbound(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_typed_selection() {
        let (connection, _peers) = connection_with(&[
            ChannelType::Light,
            ChannelType::Bulk,
            ChannelType::Light,
            ChannelType::Ping,
        ]);
        let light: Vec<u64> = (0..4)
            .map(|_| connection.channel_for(ChannelType::Light).unwrap().id())
            .collect();
        assert_eq!(light, vec![0, 2, 0, 2]);
        assert_eq!(connection.channel_for(ChannelType::Ping).unwrap().id(), 3);
        assert!(connection.channel_for(ChannelType::State).is_err());
        assert!(connection.has_channel_type(ChannelType::Bulk));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_closes_channels() {
        let (connection, _peers) = connection_with(&[ChannelType::Light, ChannelType::Light]);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        connection.add_close_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let connection = connection.clone();
                tokio::spawn(async move { connection.close() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(connection.channels().iter().all(|c| !c.is_open()));
        assert!(matches!(
            connection.channel(),
            Err(AppError::ConnectionClosed(_))
        ));
        let sent = connection.send_request(
            1,
            "ping",
            &Bytes::new(),
            &TransportRequestOptions::default(),
        );
        assert!(matches!(sent, Err(AppError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_member_channel_close_closes_connection() {
        let (connection, _peers) = connection_with(&[ChannelType::Light, ChannelType::Bulk]);
        connection.channels()[1].close();
        assert!(connection.is_closed());
        assert!(!connection.channels()[0].is_open());
    }
}
