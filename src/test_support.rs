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

//! Helpers shared by unit tests across modules.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::DuplexStream;

use crate::cluster::Node;
use crate::exchange::{MessageListeners, OutboundHandler, ResponseHandlerRegistry};
use crate::network::{Channel, ChannelOptions, FrameHandler};

pub(crate) struct NoopFrameHandler;

impl FrameHandler for NoopFrameHandler {
    fn on_frame(&self, _channel: &Arc<Channel>, _body: Bytes) {}
}

pub(crate) fn test_node() -> Node {
    Node::from_socket_addr(SocketAddr::from(([127, 0, 0, 1], 9300)))
}

pub(crate) fn test_outbound() -> Arc<OutboundHandler> {
    Arc::new(OutboundHandler::new(
        Arc::new(MessageListeners::default()),
        Arc::new(ResponseHandlerRegistry::new()),
    ))
}

/// A channel over an in-memory pipe, the peer end is returned to keep it open.
pub(crate) fn duplex_channel(id: u64) -> (Arc<Channel>, DuplexStream) {
    duplex_channel_with(id, Arc::new(NoopFrameHandler))
}

pub(crate) fn duplex_channel_with(
    id: u64,
    handler: Arc<dyn FrameHandler>,
) -> (Arc<Channel>, DuplexStream) {
    let (local, peer) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(local);
    let channel = Channel::spawn(
        id,
        SocketAddr::from(([127, 0, 0, 1], 10_000 + id as u16)),
        SocketAddr::from(([127, 0, 0, 1], 9300)),
        false,
        reader,
        writer,
        &ChannelOptions::default(),
        handler,
    );
    (channel, peer)
}
