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

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, trace};

use crate::cluster::{ChannelType, ConnectionProfile, Node};
use crate::connection::{Connection, ConnectionListener, ConnectionManager};
use crate::exchange::handshake::{HandshakeHandler, HandshakeRequest, Handshaker, HANDSHAKE_ACTION};
use crate::exchange::{
    ExecutorService, FutureResponseHandler, InboundHandler, MessageListener, MessageListeners,
    OutboundHandler, RequestHandlerRegistry, ResponseContext, ResponseHandlerRegistry,
    TransportMessage, TransportRequestHandler, TransportResponseHandler, GENERIC,
};
use crate::network::TcpTransport;
use crate::service::{Shutdown, TransportConfig};
use crate::{AppError, AppResult};

/// Per-request knobs.
#[derive(Clone, Debug, Default)]
pub struct TransportRequestOptions {
    channel_type: Option<ChannelType>,
    timeout: Option<Duration>,
    headers: BTreeMap<String, String>,
}

impl TransportRequestOptions {
    /// Sends on a channel of this type instead of the connection's default pick.
    pub fn with_channel_type(mut self, channel_type: ChannelType) -> Self {
        self.channel_type = Some(channel_type);
        self
    }

    /// Fails the request with `ResponseTimeout` when no answer arrives in time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn channel_type(&self) -> Option<ChannelType> {
        self.channel_type
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}

/// Registers the response context, arms the timeout and queues the request.
///
/// Every failure, immediate or later, reaches `handler.handle_exception`.
pub(crate) fn send_request<R, H>(
    responses: &Arc<ResponseHandlerRegistry>,
    connection: &Connection,
    action: &str,
    request: &R,
    options: &TransportRequestOptions,
    handler: H,
) where
    R: TransportMessage,
    H: TransportResponseHandler,
{
    let context = ResponseContext::new(connection.id(), connection.node().clone(), action, handler);
    let request_id = responses.add(context);

    if let Some(timeout) = options.timeout() {
        let registry = responses.clone();
        let node = connection.node().clone();
        let timed_action = action.to_string();
        let timer = tokio::spawn(async move {
            time::sleep(timeout).await;
            if let Some(context) = registry.remove(request_id) {
                debug!(request_id, action = %timed_action, %node, "request timed out");
                context.handle_exception(AppError::ResponseTimeout(format!(
                    "[{}] request {} to {} got no response within {:?}",
                    timed_action, request_id, node, timeout
                )));
            }
        });
        responses.attach_timeout(request_id, timer.abort_handle());
    }

    if let Err(e) = connection.send_request(request_id, action, request, options) {
        if let Some(context) = responses.remove(request_id) {
            context.handle_exception(e);
        }
    }
}

/// Future flavour of [`send_request`].
pub(crate) async fn submit_request<R, Resp>(
    responses: &Arc<ResponseHandlerRegistry>,
    connection: &Connection,
    action: &str,
    request: &R,
    options: &TransportRequestOptions,
) -> AppResult<Resp>
where
    R: TransportMessage,
    Resp: TransportMessage,
{
    let (handler, rx) = FutureResponseHandler::<Resp>::new();
    send_request(responses, connection, action, request, options, handler);
    rx.await.map_err(|_| {
        AppError::IllegalStateError(format!("response handler of [{}] was dropped", action))
    })?
}

/// Fails the requests still waiting on a connection that went away.
pub(crate) fn fail_pending_requests(
    responses: &ResponseHandlerRegistry,
    connection_id: u64,
    node: &Node,
) {
    let pending = responses.remove_for_connection(connection_id);
    if !pending.is_empty() {
        debug!(
            connection = connection_id,
            %node,
            pending = pending.len(),
            "failing requests of closed connection"
        );
    }
    for context in pending {
        context.handle_exception(AppError::ConnectionClosed(format!(
            "connection {} to {}",
            connection_id, node
        )));
    }
}

struct PendingRequestReaper {
    responses: Arc<ResponseHandlerRegistry>,
}

impl ConnectionListener for PendingRequestReaper {
    fn on_connection_closed(&self, connection: &Arc<Connection>) {
        fail_pending_requests(&self.responses, connection.id(), connection.node());
    }
}

/// Entry point of the transport: owns the listener, the connections, both handler
/// registries and the executors, and wires them together.
pub struct Exchanger {
    config: TransportConfig,
    requests: Arc<RequestHandlerRegistry>,
    responses: Arc<ResponseHandlerRegistry>,
    message_listeners: Arc<MessageListeners>,
    outbound: Arc<OutboundHandler>,
    inbound: Arc<InboundHandler>,
    executors: Arc<ExecutorService>,
    transport: Arc<TcpTransport>,
    connections: Arc<ConnectionManager>,
    notify_shutdown: broadcast::Sender<()>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Exchanger {
    /// Builds every component from `config`. Must run inside a tokio runtime, the
    /// executors spawn their workers right away.
    pub fn new(config: TransportConfig) -> AppResult<Arc<Exchanger>> {
        config.validate()?;
        let default_profile = config.connection.default_profile()?;

        let requests = Arc::new(RequestHandlerRegistry::new());
        let responses = Arc::new(ResponseHandlerRegistry::new());
        let message_listeners = Arc::new(MessageListeners::default());
        let outbound = Arc::new(OutboundHandler::new(
            message_listeners.clone(),
            responses.clone(),
        ));
        let executors = Arc::new(ExecutorService::new(&config.request_handler_pool));
        let inbound = Arc::new(InboundHandler::new(
            requests.clone(),
            responses.clone(),
            outbound.clone(),
            message_listeners.clone(),
            executors.clone(),
            config.slow_log.threshold(),
        ));
        let transport = TcpTransport::new(&config.network, inbound.clone());
        let connections = Arc::new(
            ConnectionManager::new(transport.clone(), outbound.clone(), default_profile)
                .with_validator(Arc::new(Handshaker::new(responses.clone()))),
        );
        connections.add_listener(Arc::new(PendingRequestReaper {
            responses: responses.clone(),
        }));
        requests.register::<HandshakeRequest, _>(
            HANDSHAKE_ACTION,
            GENERIC,
            HandshakeHandler::new(&config.general.node_name),
        )?;

        let (notify_shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(Exchanger {
            config,
            requests,
            responses,
            message_listeners,
            outbound,
            inbound,
            executors,
            transport,
            connections,
            notify_shutdown,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Binds the listener and starts keep-alive pings when configured.
    pub async fn start(&self) -> AppResult<SocketAddr> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AppError::IllegalStateError(
                "exchanger already started".to_string(),
            ));
        }
        let address = self.transport.bind().await?;
        if let Some(interval) = self.config.network.ping_interval() {
            self.spawn_keep_alive(interval);
        }
        info!(
            node_name = %self.config.general.node_name,
            %address,
            actions = self.requests.actions().len(),
            "exchanger started"
        );
        Ok(address)
    }

    /// Stops accepting, closes every connection and stops the executors. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.notify_shutdown.send(());
        self.transport.stop();
        self.connections.close();
        self.executors.shutdown();
        info!(node_name = %self.config.general.node_name, "exchanger stopped");
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn bound_address(&self) -> Option<SocketAddr> {
        self.transport.bound_address()
    }

    pub fn register_request_handler<Req, H>(
        &self,
        action: &str,
        executor: &str,
        handler: H,
    ) -> AppResult<()>
    where
        Req: TransportMessage,
        H: TransportRequestHandler<Req>,
    {
        if !self.executors.has_executor(executor) {
            return Err(AppError::InvalidValue(format!(
                "unknown executor [{}] for action [{}]",
                executor, action
            )));
        }
        self.requests.register(action, executor, handler)
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.message_listeners.add(listener);
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.connections.add_listener(listener);
    }

    /// Opens (or returns the existing) connection to `node`, handshake included.
    pub async fn connect_to_node(
        &self,
        node: &Node,
        profile: Option<ConnectionProfile>,
    ) -> AppResult<Arc<Connection>> {
        self.connections.open_connection(node, profile).await
    }

    pub fn node_connected(&self, node: &Node) -> bool {
        self.connections.connected(node)
    }

    pub fn get_connection(&self, node: &Node) -> AppResult<Arc<Connection>> {
        self.connections.get_connection(node)
    }

    pub fn disconnect_from_node(&self, node: &Node) {
        self.connections.disconnect(node);
    }

    pub fn connected_nodes(&self) -> Vec<Node> {
        self.connections.connected_nodes()
    }

    /// Sends `request` to a connected node, the outcome reaches `handler`.
    pub fn send_request<R, H>(
        &self,
        node: &Node,
        action: &str,
        request: &R,
        options: &TransportRequestOptions,
        handler: H,
    ) where
        R: TransportMessage,
        H: TransportResponseHandler,
    {
        match self.connections.get_connection(node) {
            Ok(connection) => {
                send_request(&self.responses, &connection, action, request, options, handler)
            }
            Err(e) => handler.handle_exception(e),
        }
    }

    /// Sends `request` and waits for the decoded response.
    pub async fn submit_request<R, Resp>(
        &self,
        node: &Node,
        action: &str,
        request: &R,
        options: &TransportRequestOptions,
    ) -> AppResult<Resp>
    where
        R: TransportMessage,
        Resp: TransportMessage,
    {
        let connection = self.connections.get_connection(node)?;
        submit_request(&self.responses, &connection, action, request, options).await
    }

    pub fn pending_requests(&self) -> usize {
        self.responses.len()
    }

    pub fn pings_received(&self) -> u64 {
        self.inbound.pings_received()
    }

    fn spawn_keep_alive(&self, interval: Duration) {
        let connections = self.connections.clone();
        let outbound = self.outbound.clone();
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => {
                        debug!("keep-alive received shutdown signal");
                        return;
                    }
                }
                for connection in connections.connections() {
                    let channel = if connection.has_channel_type(ChannelType::Ping) {
                        connection.channel_for(ChannelType::Ping)
                    } else {
                        connection.channel()
                    };
                    match channel.and_then(|channel| outbound.send_ping(&channel)) {
                        Ok(()) => trace!(node = %connection.node(), "ping sent"),
                        Err(e) => debug!(node = %connection.node(), error = %e, "ping skipped"),
                    }
                }
            }
        });
    }
}

impl Drop for Exchanger {
    fn drop(&mut self) {
        self.stop();
    }
}
