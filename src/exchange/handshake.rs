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

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::cluster::{ChannelType, ConnectionProfile};
use crate::connection::{BoxFuture, Connection, ConnectionValidator};
use crate::exchange::exchanger::{fail_pending_requests, submit_request};
use crate::exchange::{
    ResponseChannel, ResponseHandlerRegistry, TransportMessage, TransportRequestHandler,
    TransportRequestOptions,
};
use crate::network::{get_short_string, put_short_string, PROTOCOL_VERSION};
use crate::{AppError, AppResult};

pub const HANDSHAKE_ACTION: &str = "internal:transport/handshake";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub version: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub version: u8,
    pub node_name: String,
}

fn get_version(buffer: &mut Bytes) -> AppResult<u8> {
    if !buffer.has_remaining() {
        return Err(AppError::MalformedProtocol(
            "missing handshake version".to_string(),
        ));
    }
    Ok(buffer.get_u8())
}

impl TransportMessage for HandshakeRequest {
    fn write_to(&self, buffer: &mut BytesMut) -> AppResult<()> {
        buffer.put_u8(self.version);
        Ok(())
    }

    fn read_from(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(HandshakeRequest {
            version: get_version(buffer)?,
        })
    }
}

impl TransportMessage for HandshakeResponse {
    fn write_to(&self, buffer: &mut BytesMut) -> AppResult<()> {
        buffer.put_u8(self.version);
        put_short_string(buffer, &self.node_name)
    }

    fn read_from(buffer: &mut Bytes) -> AppResult<Self> {
        let version = get_version(buffer)?;
        let node_name = get_short_string(buffer)?;
        Ok(HandshakeResponse { version, node_name })
    }
}

/// Answers handshakes with the local protocol version and node name.
pub(crate) struct HandshakeHandler {
    node_name: String,
}

impl HandshakeHandler {
    pub(crate) fn new(node_name: &str) -> Self {
        HandshakeHandler {
            node_name: node_name.to_string(),
        }
    }
}

impl TransportRequestHandler<HandshakeRequest> for HandshakeHandler {
    async fn message_received(
        &self,
        request: HandshakeRequest,
        channel: ResponseChannel,
    ) -> AppResult<()> {
        if request.version != PROTOCOL_VERSION {
            return Err(AppError::Handshake(format!(
                "peer protocol version {} is not compatible with {}",
                request.version, PROTOCOL_VERSION
            )));
        }
        channel.send_response(&HandshakeResponse {
            version: PROTOCOL_VERSION,
            node_name: self.node_name.clone(),
        })
    }
}

/// Exchanges versions over a fresh connection before it is registered.
pub(crate) struct Handshaker {
    responses: Arc<ResponseHandlerRegistry>,
}

impl Handshaker {
    pub(crate) fn new(responses: Arc<ResponseHandlerRegistry>) -> Self {
        Handshaker { responses }
    }
}

impl ConnectionValidator for Handshaker {
    fn validate(
        &self,
        connection: Arc<Connection>,
        profile: ConnectionProfile,
    ) -> BoxFuture<'static, AppResult<()>> {
        let responses = self.responses.clone();
        Box::pin(async move {
            // not registered yet, so nothing else fails the handshake if a channel drops
            let reaped = Arc::downgrade(&responses);
            let (connection_id, node) = (connection.id(), connection.node().clone());
            connection.add_close_listener(move || {
                if let Some(responses) = reaped.upgrade() {
                    fail_pending_requests(&responses, connection_id, &node);
                }
            });

            let mut options =
                TransportRequestOptions::default().with_timeout(profile.handshake_timeout());
            if connection.has_channel_type(ChannelType::Ping) {
                options = options.with_channel_type(ChannelType::Ping);
            }
            let request = HandshakeRequest {
                version: PROTOCOL_VERSION,
            };
            let response: HandshakeResponse =
                submit_request(&responses, &connection, HANDSHAKE_ACTION, &request, &options)
                    .await
                    .map_err(|e| {
                        AppError::Handshake(format!("with {}: {}", connection.node(), e))
                    })?;
            if response.version != PROTOCOL_VERSION {
                return Err(AppError::Handshake(format!(
                    "{} answered with protocol version {}",
                    connection.node(),
                    response.version
                )));
            }
            debug!(
                node = %connection.node(),
                peer_name = %response.node_name,
                "handshake completed"
            );
            Ok(())
        })
    }
}
