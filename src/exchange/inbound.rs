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

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::exchange::{
    ErrorPayload, ExecutorService, MessageListener, MessageListeners, OutboundHandler,
    RequestHandlerRegistry, ResponseChannel, ResponseHandlerRegistry, TransportMessage,
};
use crate::network::{Channel, FrameHandler, MessageKind, NetworkMessage};
use crate::AppError;

/// Routes decoded frames: requests to their action handler, responses to the
/// pending context they answer.
///
/// Runs on each channel's reader task. Request handlers are moved to their executor,
/// response handlers run inline and must not block.
pub struct InboundHandler {
    requests: Arc<RequestHandlerRegistry>,
    responses: Arc<ResponseHandlerRegistry>,
    outbound: Arc<OutboundHandler>,
    listeners: Arc<MessageListeners>,
    executors: Arc<ExecutorService>,
    slow_log_threshold: Option<Duration>,
    pings_received: AtomicU64,
}

impl InboundHandler {
    pub fn new(
        requests: Arc<RequestHandlerRegistry>,
        responses: Arc<ResponseHandlerRegistry>,
        outbound: Arc<OutboundHandler>,
        listeners: Arc<MessageListeners>,
        executors: Arc<ExecutorService>,
        slow_log_threshold: Option<Duration>,
    ) -> Self {
        InboundHandler {
            requests,
            responses,
            outbound,
            listeners,
            executors,
            slow_log_threshold,
            pings_received: AtomicU64::new(0),
        }
    }

    pub fn pings_received(&self) -> u64 {
        self.pings_received.load(Ordering::Relaxed)
    }

    fn handle_request(&self, channel: &Arc<Channel>, request_id: u64, action: String, payload: Bytes) {
        self.listeners.on_request_received(request_id, &action);
        let responder = ResponseChannel::new(channel.clone(), self.outbound.clone(), request_id, &action);

        let Some(context) = self.requests.get(&action) else {
            debug!(request_id, %action, remote = %channel.remote_address(), "no handler for action");
            if let Err(e) = responder.send_error(AppError::ActionNotFound(action)) {
                debug!(request_id, error = %e, "failed to answer unknown action");
            }
            return;
        };

        let executor = context.executor().to_string();
        let slow_log_threshold = self.slow_log_threshold;
        let rejected = responder.clone();
        let task = async move {
            let started = Instant::now();
            // a panicking handler only fails its own request
            let outcome = match tokio::spawn(context.handle(payload, responder.clone())).await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(AppError::IllegalStateError(format!(
                    "handler for [{}] failed: {}",
                    context.action(),
                    join_error
                ))),
            };
            if let Err(e) = outcome {
                if responder.is_responded() {
                    debug!(request_id, action = context.action(), error = %e, "handler failed after responding");
                } else if let Err(send_error) = responder.send_error(e) {
                    debug!(request_id, error = %send_error, "failed to send error response");
                }
            }
            let elapsed = started.elapsed();
            if let Some(threshold) = slow_log_threshold.filter(|t| elapsed > *t) {
                warn!(
                    action = context.action(),
                    request_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "slow request handling"
                );
            }
        };

        if let Err(e) = self.executors.execute(&executor, Box::pin(task)) {
            warn!(request_id, action = rejected.action(), %executor, error = %e, "failed to dispatch request");
            if let Err(send_error) = rejected.send_error(e) {
                debug!(request_id, error = %send_error, "failed to send rejection");
            }
        }
    }

    fn handle_response(&self, request_id: u64, body: Result<Bytes, Bytes>) {
        let context = self.responses.remove(request_id);
        self.listeners.on_response_received(request_id, context.as_ref());
        let Some(context) = context else {
            debug!(request_id, "dropping response to unknown or expired request");
            return;
        };

        let elapsed = context.elapsed();
        if let Some(threshold) = self.slow_log_threshold.filter(|t| elapsed > *t) {
            warn!(
                action = context.action(),
                request_id,
                node = %context.node(),
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "slow round trip"
            );
        }

        let action = context.action().to_string();
        let completed = panic::catch_unwind(AssertUnwindSafe(move || match body {
            Ok(payload) => context.handle_response(payload),
            Err(payload) => {
                let error = match ErrorPayload::decode(payload) {
                    Ok(payload) => payload.into_error(&action),
                    Err(e) => e,
                };
                context.handle_exception(error)
            }
        }));
        if completed.is_err() {
            error!(request_id, "response handler panicked");
        }
    }

    fn handle_malformed(&self, channel: &Arc<Channel>, body: &[u8], error: AppError) {
        match NetworkMessage::peek_header(body) {
            Some((true, request_id)) => {
                warn!(request_id, remote = %channel.remote_address(), error = %error, "malformed request");
                if let Err(e) = self.outbound.send_error_response(channel, request_id, "", error) {
                    debug!(request_id, error = %e, "failed to answer malformed request");
                }
            }
            Some((false, request_id)) => {
                warn!(request_id, remote = %channel.remote_address(), error = %error, "malformed response");
                if let Some(context) = self.responses.remove(request_id) {
                    context.handle_exception(error);
                }
            }
            None => warn!(remote = %channel.remote_address(), error = %error, "dropping malformed frame"),
        }
    }
}

impl FrameHandler for InboundHandler {
    fn on_frame(&self, channel: &Arc<Channel>, body: Bytes) {
        let message = match NetworkMessage::decode(body.clone()) {
            Ok(message) => message,
            Err(e) => return self.handle_malformed(channel, &body, e),
        };
        match message.kind {
            MessageKind::Ping => {
                self.pings_received.fetch_add(1, Ordering::Relaxed);
                trace!(channel = channel.id(), "ping received");
            }
            MessageKind::Request { action } => {
                self.handle_request(channel, message.request_id, action, message.payload)
            }
            MessageKind::Response => self.handle_response(message.request_id, Ok(message.payload)),
            MessageKind::Error => self.handle_response(message.request_id, Err(message.payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FutureResponseHandler, ResponseContext, TransportResponseHandler, GENERIC};
    use crate::service::RequestHandlerPool;
    use crate::test_support::{duplex_channel_with, test_node};
    use bytes::BytesMut;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct Fixture {
        inbound: Arc<InboundHandler>,
        responses: Arc<ResponseHandlerRegistry>,
        unmatched: Arc<AtomicUsize>,
        channel: Arc<Channel>,
        peer: DuplexStream,
        buffer: BytesMut,
    }

    struct SharedCounter(Arc<AtomicUsize>);

    impl MessageListener for SharedCounter {
        fn on_response_received(&self, _request_id: u64, context: Option<&ResponseContext>) {
            if context.is_none() {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn fixture() -> Fixture {
        let requests = Arc::new(RequestHandlerRegistry::new());
        requests
            .register::<String, _>("echo", GENERIC, |request: String, channel: ResponseChannel| async move {
                channel.send_response(&request)
            })
            .unwrap();
        requests
            .register::<(), _>("fail", GENERIC, |_: (), _channel: ResponseChannel| async move {
                Err::<(), _>(AppError::InvalidValue("bad input".to_string()))
            })
            .unwrap();
        requests
            .register::<(), _>("panic", GENERIC, |_: (), _channel: ResponseChannel| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), AppError>(())
            })
            .unwrap();

        let responses = Arc::new(ResponseHandlerRegistry::new());
        let listeners = Arc::new(MessageListeners::default());
        let unmatched = Arc::new(AtomicUsize::new(0));
        listeners.add(Arc::new(SharedCounter(unmatched.clone())));
        let outbound = Arc::new(OutboundHandler::new(listeners.clone(), responses.clone()));
        let executors = Arc::new(ExecutorService::new(&RequestHandlerPool {
            num_workers: 2,
            ..RequestHandlerPool::default()
        }));
        let inbound = Arc::new(InboundHandler::new(
            requests,
            responses.clone(),
            outbound,
            listeners,
            executors,
            Some(Duration::from_secs(5)),
        ));
        let (channel, peer) = duplex_channel_with(1, inbound.clone());
        Fixture {
            inbound,
            responses,
            unmatched,
            channel,
            peer,
            buffer: BytesMut::new(),
        }
    }

    impl Fixture {
        async fn send(&mut self, message: NetworkMessage) {
            let frame = message.encode().unwrap();
            self.peer.write_all(&frame).await.unwrap();
        }

        async fn receive(&mut self) -> NetworkMessage {
            loop {
                if let Some(body) = NetworkMessage::split_frame(&mut self.buffer, 1 << 20).unwrap() {
                    return NetworkMessage::decode(body).unwrap();
                }
                let read = self.peer.read_buf(&mut self.buffer).await.unwrap();
                assert!(read > 0, "channel closed");
            }
        }

        async fn expect_error(&mut self, request_id: u64) -> ErrorPayload {
            let reply = self.receive().await;
            assert_eq!(reply.kind, MessageKind::Error);
            assert_eq!(reply.request_id, request_id);
            ErrorPayload::decode(reply.payload).unwrap()
        }
    }

    fn request(request_id: u64, action: &str, payload: &'static [u8]) -> NetworkMessage {
        NetworkMessage::request(request_id, action, BTreeMap::new(), Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_request_is_dispatched_and_answered() {
        let mut fixture = fixture();
        fixture.send(request(11, "echo", b"hello")).await;
        let reply = fixture.receive().await;
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.request_id, 11);
        assert_eq!(&reply.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_unknown_action_keeps_channel_open() {
        let mut fixture = fixture();
        fixture.send(request(12, "missing", b"")).await;
        let error = fixture.expect_error(12).await;
        assert_eq!(error.kind, "action_not_found");
        assert_eq!(error.message, "no handler for action [missing]");

        assert!(fixture.channel.is_open());
        fixture.send(request(13, "echo", b"still here")).await;
        assert_eq!(&fixture.receive().await.payload[..], b"still here");
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_error_responses() {
        let mut fixture = fixture();
        fixture.send(request(14, "fail", b"")).await;
        let error = fixture.expect_error(14).await;
        assert_eq!(error.kind, "invalid_value");

        fixture.send(request(15, "panic", b"")).await;
        let error = fixture.expect_error(15).await;
        assert_eq!(error.kind, "illegal_state");
        assert!(fixture.channel.is_open());
    }

    #[tokio::test]
    async fn test_undecodable_request_payload_is_answered() {
        let mut fixture = fixture();
        fixture.send(request(16, "echo", &[0xff, 0xfe])).await;
        let error = fixture.expect_error(16).await;
        assert_eq!(error.kind, "malformed_protocol");
    }

    #[tokio::test]
    async fn test_malformed_request_frame_is_answered() {
        let mut fixture = fixture();
        let frame = request(17, "echo", b"x").encode().unwrap();
        let mut raw = frame.to_vec();
        // unsupported version in the flags byte
        raw[4] = 0x01 | (7 << 3);
        fixture.peer.write_all(&raw).await.unwrap();
        let error = fixture.expect_error(17).await;
        assert_eq!(error.kind, "malformed_protocol");
        assert!(fixture.channel.is_open());
    }

    #[tokio::test]
    async fn test_pings_are_counted() {
        let mut fixture = fixture();
        fixture.send(NetworkMessage::ping()).await;
        fixture.send(NetworkMessage::ping()).await;
        fixture.send(request(18, "echo", b"after")).await;
        assert_eq!(&fixture.receive().await.payload[..], b"after");
        assert_eq!(fixture.inbound.pings_received(), 2);
    }

    #[tokio::test]
    async fn test_response_resolves_pending_context_once() {
        let mut fixture = fixture();
        let (handler, rx) = FutureResponseHandler::<String>::new();
        let request_id = fixture
            .responses
            .add(ResponseContext::new(1, test_node(), "echo", handler));

        let response = NetworkMessage::response(request_id, BTreeMap::new(), Bytes::from_static(b"pong"));
        fixture.send(response.clone()).await;
        assert_eq!(rx.await.unwrap().unwrap(), "pong");

        // duplicate frame is dropped and reported without context
        fixture.send(response).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while fixture.unmatched.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(fixture.responses.is_empty());
    }

    struct ErrorCapture(tokio::sync::oneshot::Sender<AppError>);

    impl TransportResponseHandler for ErrorCapture {
        type Response = ();

        fn handle_response(self, _response: ()) {}

        fn handle_exception(self, error: AppError) {
            let _ = self.0.send(error);
        }
    }

    #[tokio::test]
    async fn test_error_frame_becomes_remote_error() {
        let mut fixture = fixture();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let request_id = fixture
            .responses
            .add(ResponseContext::new(1, test_node(), "indices:write", ErrorCapture(tx)));

        let payload = ErrorPayload {
            kind: "rejected_execution".to_string(),
            message: "queue full".to_string(),
        }
        .encode()
        .unwrap();
        fixture
            .send(NetworkMessage::error(request_id, BTreeMap::new(), payload))
            .await;

        match rx.await.unwrap() {
            AppError::RemoteTransport { action, kind, message } => {
                assert_eq!(action, "indices:write");
                assert_eq!(kind, "rejected_execution");
                assert_eq!(message, "queue full");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
