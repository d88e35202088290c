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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::cluster::{ChannelType, Node};
use crate::connection::{BoxFuture, Connector};
use crate::network::channel::{Channel, ChannelOptions, FrameHandler};
use crate::service::{NetworkConfig, Shutdown};
use crate::{AppError, AppResult};

/// Tcp runtime glue: listens for inbound channels and dials outbound ones.
///
/// Accepted channels are owned here until they close; outbound channels are handed
/// to whoever asked for them.
pub struct TcpTransport {
    config: NetworkConfig,
    options: ChannelOptions,
    handler: Arc<dyn FrameHandler>,
    next_channel_id: AtomicU64,
    accepted: DashMap<u64, Arc<Channel>>,
    notify_shutdown: broadcast::Sender<()>,
    bound_address: Mutex<Option<SocketAddr>>,
}

impl TcpTransport {
    pub fn new(config: &NetworkConfig, handler: Arc<dyn FrameHandler>) -> Arc<TcpTransport> {
        let (notify_shutdown, _) = broadcast::channel(1);
        Arc::new(TcpTransport {
            config: config.clone(),
            options: ChannelOptions::from(config),
            handler,
            next_channel_id: AtomicU64::new(1),
            accepted: DashMap::new(),
            notify_shutdown,
            bound_address: Mutex::new(None),
        })
    }

    /// Binds the configured address and starts accepting in the background.
    pub async fn bind(self: &Arc<Self>) -> AppResult<SocketAddr> {
        let listen_address = format!("{}:{}", self.config.ip, self.config.port);
        let listener = TcpListener::bind(&listen_address).await.map_err(|e| {
            let error_msg = format!(
                "Failed to bind transport to address: {} - Error: {}",
                listen_address, e
            );
            error!(error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        let local_address = listener.local_addr()?;
        *self.bound_address.lock() = Some(local_address);
        info!("transport binding to {} for listening", local_address);

        let limit_connections = Arc::new(Semaphore::new(self.config.max_connection));
        let shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let transport = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Err(err) = accept_loop(transport, listener, limit_connections, shutdown).await {
                error!(cause = %err, "failed to accept");
            }
        });
        Ok(local_address)
    }

    pub fn bound_address(&self) -> Option<SocketAddr> {
        *self.bound_address.lock()
    }

    /// Dials `node` and wraps the stream in an outbound channel.
    pub async fn connect(&self, node: &Node, timeout: Duration) -> AppResult<Arc<Channel>> {
        let address = node.socket_addr();
        let stream = time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                AppError::ConnectTimeout(format!("connect to {} timed out after {:?}", node, timeout))
            })?
            .map_err(|e| AppError::ConnectTransport(format!("connect to {} failed: {}", node, e)))?;
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        Channel::from_tcp(id, stream, false, &self.options, self.handler.clone())
    }

    pub fn accepted_channels(&self) -> Vec<Arc<Channel>> {
        self.accepted.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Stops accepting and closes every accepted channel.
    pub fn stop(&self) {
        let _ = self.notify_shutdown.send(());
        let channels = self.accepted_channels();
        for channel in channels {
            channel.close();
        }
        debug!("transport stopped");
    }

    fn register_accepted(self: &Arc<Self>, stream: TcpStream, permit: tokio::sync::OwnedSemaphorePermit) {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let channel = match Channel::from_tcp(id, stream, true, &self.options, self.handler.clone()) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "failed to set up accepted channel");
                return;
            }
        };
        self.accepted.insert(id, channel.clone());

        let transport: Weak<TcpTransport> = Arc::downgrade(self);
        channel.add_close_listener(move || {
            if let Some(transport) = transport.upgrade() {
                transport.accepted.remove(&id);
            }
            // whether gracefully or unexpectedly closed, release the connection slot
            drop(permit);
        });
    }
}

impl Connector for TcpTransport {
    fn connect_channel(
        self: Arc<Self>,
        node: Node,
        channel_type: ChannelType,
        timeout: Duration,
    ) -> BoxFuture<'static, AppResult<Arc<Channel>>> {
        Box::pin(async move {
            let channel = self.connect(&node, timeout).await?;
            debug!(%node, %channel_type, channel = channel.id(), "outbound channel connected");
            Ok(channel)
        })
    }
}

#[tracing::instrument(skip_all)]
async fn accept_loop(
    transport: Weak<TcpTransport>,
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    mut shutdown: Shutdown,
) -> AppResult<()> {
    loop {
        let permit = tokio::select! {
            permit = limit_connections.clone().acquire_owned() => permit
                .map_err(|e| AppError::IllegalStateError(format!("connection limiter closed: {}", e)))?,
            _ = shutdown.recv() => {
                debug!("accept loop received shutdown signal");
                return Ok(());
            }
        };

        let stream = tokio::select! {
            stream = accept(&listener) => stream?,
            _ = shutdown.recv() => {
                debug!("accept loop received shutdown signal");
                return Ok(());
            }
        };

        let Some(transport) = transport.upgrade() else {
            return Ok(());
        };
        transport.register_accepted(stream, permit);
    }
}

async fn accept(listener: &TcpListener) -> AppResult<TcpStream> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok((socket, remote)) => {
                debug!(%remote, "accept new connection");
                return Ok(socket);
            }
            Err(err) => {
                if backoff > 64 {
                    return Err(AppError::DetailedIoError(format!(
                        "accept tcp server error: {}",
                        err
                    )));
                }
                warn!(error = %err, backoff, "accept failed, retrying");
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::tests::CollectingHandler;
    use crate::network::frame::NetworkMessage;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    fn loopback_config() -> NetworkConfig {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 0,
            ..NetworkConfig::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let server_handler = Arc::new(CollectingHandler::default());
        let server = TcpTransport::new(&loopback_config(), server_handler.clone());
        let address = server.bind().await.unwrap();
        assert_eq!(server.bound_address(), Some(address));

        let client = TcpTransport::new(&loopback_config(), Arc::new(CollectingHandler::default()));
        let node = Node::from_socket_addr(address);
        let channel = client.connect(&node, Duration::from_secs(1)).await.unwrap();
        assert!(!channel.is_server());
        assert_eq!(channel.remote_address(), address);

        let frame = NetworkMessage::request(1, "ping", BTreeMap::new(), Bytes::new())
            .encode()
            .unwrap();
        channel.write(frame).await.unwrap();
        wait_until(|| server_handler.bodies.lock().len() == 1).await;
        assert_eq!(server.accepted_channels().len(), 1);
        assert!(server.accepted_channels()[0].is_server());

        // closing the client side evicts the accepted channel
        channel.close();
        wait_until(|| server.accepted_channels().is_empty()).await;
        server.stop();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind and drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let client = TcpTransport::new(&loopback_config(), Arc::new(CollectingHandler::default()));
        let result = client
            .connect(&Node::from_socket_addr(address), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(AppError::ConnectTransport(_))));
    }

    #[tokio::test]
    async fn test_stop_closes_accepted_channels() {
        let server = TcpTransport::new(&loopback_config(), Arc::new(CollectingHandler::default()));
        let address = server.bind().await.unwrap();
        let client = TcpTransport::new(&loopback_config(), Arc::new(CollectingHandler::default()));
        let channel = client
            .connect(&Node::from_socket_addr(address), Duration::from_secs(1))
            .await
            .unwrap();
        wait_until(|| server.accepted_channels().len() == 1).await;

        server.stop();
        assert!(server.accepted_channels().is_empty());
        tokio::time::timeout(Duration::from_secs(1), channel.closed())
            .await
            .unwrap();
    }
}
