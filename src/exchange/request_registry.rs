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
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::BoxFuture;
use crate::exchange::{OutboundHandler, TransportMessage};
use crate::network::Channel;
use crate::{AppError, AppResult};

/// Server side handler of one action.
///
/// The handler answers through the [`ResponseChannel`]. Returning `Err` without
/// having answered makes the transport send the error back to the caller.
pub trait TransportRequestHandler<Req: TransportMessage>: Send + Sync + 'static {
    fn message_received(
        &self,
        request: Req,
        channel: ResponseChannel,
    ) -> impl Future<Output = AppResult<()>> + Send;
}

impl<Req, F, Fut> TransportRequestHandler<Req> for F
where
    Req: TransportMessage,
    F: Fn(Req, ResponseChannel) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<()>> + Send,
{
    fn message_received(
        &self,
        request: Req,
        channel: ResponseChannel,
    ) -> impl Future<Output = AppResult<()>> + Send {
        self(request, channel)
    }
}

pub(crate) trait ErasedRequestHandler: Send + Sync {
    fn handle(&self, payload: Bytes, channel: ResponseChannel) -> BoxFuture<'static, AppResult<()>>;
}

struct TypedRequestHandler<Req, H> {
    handler: Arc<H>,
    _request: PhantomData<fn(Req)>,
}

impl<Req, H> ErasedRequestHandler for TypedRequestHandler<Req, H>
where
    Req: TransportMessage,
    H: TransportRequestHandler<Req>,
{
    fn handle(&self, payload: Bytes, channel: ResponseChannel) -> BoxFuture<'static, AppResult<()>> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let request = Req::decode(payload)?;
            handler.message_received(request, channel).await
        })
    }
}

/// A registered action: its handler and the executor it runs on.
pub struct RequestContext {
    action: String,
    executor: String,
    handler: Box<dyn ErasedRequestHandler>,
}

impl RequestContext {
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn executor(&self) -> &str {
        &self.executor
    }

    /// Decodes `payload` and runs the handler.
    pub(crate) fn handle(
        &self,
        payload: Bytes,
        channel: ResponseChannel,
    ) -> BoxFuture<'static, AppResult<()>> {
        self.handler.handle(payload, channel)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("action", &self.action)
            .field("executor", &self.executor)
            .finish()
    }
}

/// Action name to handler map.
///
/// Lookups read an immutable snapshot without locking; registration copies the map
/// and swaps the snapshot, serialized by a write lock.
#[derive(Default)]
pub struct RequestHandlerRegistry {
    handlers: ArcSwap<HashMap<String, Arc<RequestContext>>>,
    write_lock: Mutex<()>,
}

impl RequestHandlerRegistry {
    pub fn new() -> Self {
        RequestHandlerRegistry::default()
    }

    /// Registers `handler` for `action`, an action can be registered once.
    pub fn register<Req, H>(&self, action: &str, executor: &str, handler: H) -> AppResult<()>
    where
        Req: TransportMessage,
        H: TransportRequestHandler<Req>,
    {
        let context = Arc::new(RequestContext {
            action: action.to_string(),
            executor: executor.to_string(),
            handler: Box::new(TypedRequestHandler {
                handler: Arc::new(handler),
                _request: PhantomData,
            }),
        });

        let _guard = self.write_lock.lock();
        let current = self.handlers.load();
        if current.contains_key(action) {
            return Err(AppError::DuplicateAction(action.to_string()));
        }
        let mut next = HashMap::clone(&current);
        next.insert(action.to_string(), context);
        self.handlers.store(Arc::new(next));
        info!(action, executor, "registered request handler");
        Ok(())
    }

    pub fn get(&self, action: &str) -> Option<Arc<RequestContext>> {
        self.handlers.load().get(action).cloned()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.load().contains_key(action)
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.load().keys().cloned().collect();
        actions.sort();
        actions
    }
}

/// Lets a request handler answer its caller, at most once.
///
/// Clones share the answered flag, so the dispatch boundary can tell whether the
/// handler already replied.
#[derive(Clone)]
pub struct ResponseChannel {
    channel: Arc<Channel>,
    outbound: Arc<OutboundHandler>,
    request_id: u64,
    action: Arc<str>,
    received_at: Instant,
    responded: Arc<AtomicBool>,
}

impl ResponseChannel {
    pub(crate) fn new(
        channel: Arc<Channel>,
        outbound: Arc<OutboundHandler>,
        request_id: u64,
        action: &str,
    ) -> Self {
        ResponseChannel {
            channel,
            outbound,
            request_id,
            action: Arc::from(action),
            received_at: Instant::now(),
            responded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn is_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    pub fn send_response<R: TransportMessage>(&self, response: &R) -> AppResult<()> {
        self.mark_responded()?;
        if let Err(e) = self
            .outbound
            .send_response(&self.channel, self.request_id, &self.action, response)
        {
            // the caller still gets an answer when the response can not be encoded
            debug!(request_id = self.request_id, action = %self.action, error = %e, "response encoding failed");
            self.outbound
                .send_error_response(&self.channel, self.request_id, &self.action, e.clone())?;
            return Err(e);
        }
        Ok(())
    }

    pub fn send_error(&self, error: AppError) -> AppResult<()> {
        self.mark_responded()?;
        self.outbound
            .send_error_response(&self.channel, self.request_id, &self.action, error)
    }

    fn mark_responded(&self) -> AppResult<()> {
        if self.responded.swap(true, Ordering::AcqRel) {
            return Err(AppError::IllegalStateError(format!(
                "request {} [{}] already answered",
                self.request_id, self.action
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ResponseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseChannel")
            .field("channel", &self.channel.id())
            .field("request_id", &self.request_id)
            .field("action", &self.action)
            .field("responded", &self.is_responded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{duplex_channel, test_outbound};

    struct Greeter;

    impl TransportRequestHandler<String> for Greeter {
        async fn message_received(&self, request: String, channel: ResponseChannel) -> AppResult<()> {
            channel.send_response(&format!("hello {}", request))
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = RequestHandlerRegistry::new();
        registry.register::<String, _>("greet", "generic", Greeter).unwrap();
        let again = registry.register::<String, _>("greet", "generic", Greeter);
        assert!(matches!(again, Err(AppError::DuplicateAction(a)) if a == "greet"));

        registry
            .register::<(), _>("noop", "state", |_: (), channel: ResponseChannel| async move {
                channel.send_response(&())
            })
            .unwrap();
        assert_eq!(registry.actions(), vec!["greet", "noop"]);
        assert_eq!(registry.get("noop").unwrap().executor(), "state");
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_response_channel_answers_once() {
        let (channel, _peer) = duplex_channel(1);
        let responder = ResponseChannel::new(channel, test_outbound(), 3, "greet");
        let shared = responder.clone();

        assert!(!shared.is_responded());
        responder.send_response(&"hi".to_string()).unwrap();
        assert!(shared.is_responded());
        assert!(matches!(
            shared.send_error(AppError::InvalidValue("late".into())),
            Err(AppError::IllegalStateError(_))
        ));
    }

    #[tokio::test]
    async fn test_undecodable_request_fails_handler() {
        let registry = RequestHandlerRegistry::new();
        registry.register::<String, _>("greet", "generic", Greeter).unwrap();
        let (channel, _peer) = duplex_channel(1);
        let responder = ResponseChannel::new(channel, test_outbound(), 1, "greet");

        let context = registry.get("greet").unwrap();
        let result = context
            .handle(Bytes::from_static(&[0xff, 0xfe]), responder.clone())
            .await;
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
        assert!(!responder.is_responded());
    }
}
