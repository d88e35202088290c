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
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cluster::Node;
use crate::exchange::{
    ErrorPayload, MessageListener, MessageListeners, ResponseHandlerRegistry, TransportMessage,
};
use crate::network::{Channel, NetworkMessage};
use crate::{AppError, AppResult};

/// Frames outgoing messages and queues them on a channel.
///
/// Completion is reported through the message listeners once the write finished.
/// A request whose write fails is resolved right here: its context is removed and
/// the response handler gets the write error.
pub struct OutboundHandler {
    listeners: Arc<MessageListeners>,
    responses: Arc<ResponseHandlerRegistry>,
}

impl OutboundHandler {
    pub fn new(listeners: Arc<MessageListeners>, responses: Arc<ResponseHandlerRegistry>) -> Self {
        OutboundHandler {
            listeners,
            responses,
        }
    }

    pub fn send_request<R: TransportMessage>(
        &self,
        node: &Node,
        channel: &Arc<Channel>,
        request_id: u64,
        action: &str,
        request: &R,
        headers: &BTreeMap<String, String>,
    ) -> AppResult<()> {
        let payload = request.encode()?;
        let frame = NetworkMessage::request(request_id, action, headers.clone(), payload).encode()?;

        let listeners = self.listeners.clone();
        let responses = self.responses.clone();
        let node = node.clone();
        let action = action.to_string();
        channel.send(
            frame,
            Box::new(move |result| match result {
                Ok(()) => listeners.on_request_sent(&node, request_id, &action),
                Err(e) => {
                    debug!(%node, request_id, %action, error = %e, "request write failed");
                    if let Some(context) = responses.remove(request_id) {
                        context.handle_exception(e);
                    }
                }
            }),
        );
        Ok(())
    }

    pub fn send_response<R: TransportMessage>(
        &self,
        channel: &Arc<Channel>,
        request_id: u64,
        action: &str,
        response: &R,
    ) -> AppResult<()> {
        let payload = response.encode()?;
        let frame = NetworkMessage::response(request_id, BTreeMap::new(), payload).encode()?;

        let listeners = self.listeners.clone();
        let action = action.to_string();
        channel.send(
            frame,
            Box::new(move |result| match result {
                Ok(()) => listeners.on_response_sent(request_id, &action),
                Err(e) => debug!(request_id, %action, error = %e, "response write failed"),
            }),
        );
        Ok(())
    }

    pub fn send_error_response(
        &self,
        channel: &Arc<Channel>,
        request_id: u64,
        action: &str,
        error: AppError,
    ) -> AppResult<()> {
        let payload = ErrorPayload::from(&error).encode()?;
        let frame = NetworkMessage::error(request_id, BTreeMap::new(), payload).encode()?;

        let listeners = self.listeners.clone();
        let action = action.to_string();
        channel.send(
            frame,
            Box::new(move |result| match result {
                Ok(()) => listeners.on_response_sent_error(request_id, &action, &error),
                Err(e) => debug!(request_id, %action, error = %e, "error response write failed"),
            }),
        );
        Ok(())
    }

    pub fn send_ping(&self, channel: &Arc<Channel>) -> AppResult<()> {
        let frame = NetworkMessage::ping().encode()?;
        let channel_id = channel.id();
        channel.send(
            frame,
            Box::new(move |result| {
                if let Err(e) = result {
                    trace!(channel = channel_id, error = %e, "ping write failed");
                }
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{duplex_channel, test_node};
    use crate::exchange::{FutureResponseHandler, ResponseContext};
    use crate::network::MessageKind;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct SentCounter {
        requests: AtomicUsize,
        responses: AtomicUsize,
        errors: AtomicUsize,
    }

    impl MessageListener for SentCounter {
        fn on_request_sent(&self, _node: &Node, _request_id: u64, _action: &str) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn on_response_sent(&self, _request_id: u64, _action: &str) {
            self.responses.fetch_add(1, Ordering::SeqCst);
        }

        fn on_response_sent_error(&self, _request_id: u64, _action: &str, _error: &AppError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn outbound_with(counter: Arc<SentCounter>) -> (OutboundHandler, Arc<ResponseHandlerRegistry>) {
        let listeners = Arc::new(MessageListeners::default());
        listeners.add(counter);
        let responses = Arc::new(ResponseHandlerRegistry::new());
        (OutboundHandler::new(listeners, responses.clone()), responses)
    }

    async fn read_frames(peer: &mut tokio::io::DuplexStream, count: usize) -> Vec<NetworkMessage> {
        let mut buffer = BytesMut::new();
        let mut frames = Vec::new();
        while frames.len() < count {
            if let Some(body) = NetworkMessage::split_frame(&mut buffer, 1 << 20).unwrap() {
                frames.push(NetworkMessage::decode(body).unwrap());
                continue;
            }
            let read = peer.read_buf(&mut buffer).await.unwrap();
            assert!(read > 0, "peer closed early");
        }
        frames
    }

    #[tokio::test]
    async fn test_frames_reach_the_wire_and_notify() {
        let counter = Arc::new(SentCounter::default());
        let (outbound, _) = outbound_with(counter.clone());
        let (channel, mut peer) = duplex_channel(1);

        let mut headers = BTreeMap::new();
        headers.insert("trace".to_string(), "abc".to_string());
        outbound
            .send_request(&test_node(), &channel, 7, "echo", &"hi".to_string(), &headers)
            .unwrap();
        outbound
            .send_response(&channel, 8, "echo", &"there".to_string())
            .unwrap();
        outbound
            .send_error_response(&channel, 9, "missing", AppError::ActionNotFound("missing".into()))
            .unwrap();

        let frames = read_frames(&mut peer, 3).await;
        assert_eq!(frames[0].action(), Some("echo"));
        assert_eq!(frames[0].request_id, 7);
        assert_eq!(frames[0].headers.get("trace").map(String::as_str), Some("abc"));
        assert_eq!(frames[1].kind, MessageKind::Response);
        assert_eq!(&frames[1].payload[..], b"there");
        assert_eq!(frames[2].kind, MessageKind::Error);
        let error = ErrorPayload::decode(frames[2].payload.clone()).unwrap();
        assert_eq!(error.kind, "action_not_found");

        tokio::time::timeout(Duration::from_secs(1), async {
            while counter.errors.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(counter.requests.load(Ordering::SeqCst), 1);
        assert_eq!(counter.responses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_request_write_resolves_handler() {
        let counter = Arc::new(SentCounter::default());
        let (outbound, responses) = outbound_with(counter.clone());
        let (channel, _peer) = duplex_channel(1);
        channel.close();

        let (handler, rx) = FutureResponseHandler::<String>::new();
        let request_id = responses
            .add(ResponseContext::new(1, test_node(), "echo", handler));
        outbound
            .send_request(
                &test_node(),
                &channel,
                request_id,
                "echo",
                &"hi".to_string(),
                &BTreeMap::new(),
            )
            .unwrap();

        assert!(matches!(rx.await.unwrap(), Err(AppError::ChannelClosed(_))));
        assert!(!responses.contains(request_id));
        assert_eq!(counter.requests.load(Ordering::SeqCst), 0);
    }
}
