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

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::cluster::Node;
use crate::exchange::TransportMessage;
use crate::{AppError, AppResult};

/// Client side callback for one outstanding request.
///
/// Exactly one of the two methods is called, once.
pub trait TransportResponseHandler: Send + 'static {
    type Response: TransportMessage;

    fn handle_response(self, response: Self::Response);

    fn handle_exception(self, error: AppError);
}

pub(crate) trait ErasedResponseHandler: Send {
    fn handle_response(self: Box<Self>, payload: Bytes);

    fn handle_exception(self: Box<Self>, error: AppError);
}

struct TypedResponseHandler<H> {
    handler: H,
}

impl<H: TransportResponseHandler> ErasedResponseHandler for TypedResponseHandler<H> {
    fn handle_response(self: Box<Self>, payload: Bytes) {
        match H::Response::decode(payload) {
            Ok(response) => self.handler.handle_response(response),
            Err(e) => self.handler.handle_exception(e),
        }
    }

    fn handle_exception(self: Box<Self>, error: AppError) {
        self.handler.handle_exception(error)
    }
}

/// Completes a oneshot with the decoded response or the error.
pub struct FutureResponseHandler<Resp> {
    tx: oneshot::Sender<AppResult<Resp>>,
}

impl<Resp: TransportMessage> FutureResponseHandler<Resp> {
    pub fn new() -> (Self, oneshot::Receiver<AppResult<Resp>>) {
        let (tx, rx) = oneshot::channel();
        (FutureResponseHandler { tx }, rx)
    }
}

impl<Resp: TransportMessage> TransportResponseHandler for FutureResponseHandler<Resp> {
    type Response = Resp;

    fn handle_response(self, response: Resp) {
        let _ = self.tx.send(Ok(response));
    }

    fn handle_exception(self, error: AppError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Bookkeeping for one in-flight request, owned by the registry until removed.
pub struct ResponseContext {
    request_id: u64,
    connection_id: u64,
    node: Node,
    action: String,
    // only taken out by value, the lock just makes the context shareable
    handler: Mutex<Box<dyn ErasedResponseHandler>>,
    sent_at: Instant,
    timeout: Mutex<Option<AbortHandle>>,
}

impl ResponseContext {
    pub fn new<H: TransportResponseHandler>(
        connection_id: u64,
        node: Node,
        action: &str,
        handler: H,
    ) -> Self {
        ResponseContext {
            request_id: 0,
            connection_id,
            node,
            action: action.to_string(),
            handler: Mutex::new(Box::new(TypedResponseHandler { handler })),
            sent_at: Instant::now(),
            timeout: Mutex::new(None),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    pub(crate) fn set_timeout_handle(&self, handle: AbortHandle) {
        *self.timeout.lock() = Some(handle);
    }

    /// Decodes `payload` and completes the handler, a decode failure goes to
    /// `handle_exception` instead.
    pub fn handle_response(self, payload: Bytes) {
        self.cancel_timeout();
        self.handler.into_inner().handle_response(payload)
    }

    pub fn handle_exception(self, error: AppError) {
        self.cancel_timeout();
        self.handler.into_inner().handle_exception(error)
    }

    fn cancel_timeout(&self) {
        if let Some(handle) = self.timeout.lock().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseContext")
            .field("request_id", &self.request_id)
            .field("connection_id", &self.connection_id)
            .field("node", &self.node)
            .field("action", &self.action)
            .finish()
    }
}

/// In-flight requests keyed by request id.
///
/// `remove` is the single point of ownership transfer: of any number of racing
/// removers (response delivery, timeout, connection close) exactly one gets the
/// context.
pub struct ResponseHandlerRegistry {
    next_request_id: AtomicU64,
    handlers: DashMap<u64, ResponseContext>,
}

impl Default for ResponseHandlerRegistry {
    fn default() -> Self {
        ResponseHandlerRegistry::new()
    }
}

impl ResponseHandlerRegistry {
    pub fn new() -> Self {
        ResponseHandlerRegistry::starting_at(1)
    }

    pub(crate) fn starting_at(first_request_id: u64) -> Self {
        ResponseHandlerRegistry {
            next_request_id: AtomicU64::new(first_request_id),
            handlers: DashMap::new(),
        }
    }

    /// Stores `context` under a fresh request id.
    ///
    /// Ids never wrap: a wrapped id could collide with a pending one, so running out
    /// of ids panics.
    pub fn add(&self, mut context: ResponseContext) -> u64 {
        let request_id = match self.next_request_id.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |id| id.checked_add(1),
        ) {
            Ok(request_id) => request_id,
            Err(_) => panic!("request id space exhausted"),
        };
        context.request_id = request_id;
        self.handlers.insert(request_id, context);
        request_id
    }

    /// Ties a timeout task to its request, aborting it right away when the request
    /// is already gone.
    pub(crate) fn attach_timeout(&self, request_id: u64, handle: AbortHandle) {
        match self.handlers.get(&request_id) {
            Some(context) => context.set_timeout_handle(handle),
            None => handle.abort(),
        }
    }

    pub fn remove(&self, request_id: u64) -> Option<ResponseContext> {
        self.handlers.remove(&request_id).map(|(_, context)| context)
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.handlers.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Removes every context sent over the given connection.
    pub fn remove_for_connection(&self, connection_id: u64) -> Vec<ResponseContext> {
        let request_ids: Vec<u64> = self
            .handlers
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();
        request_ids
            .into_iter()
            .filter_map(|request_id| self.remove(request_id))
            .collect()
    }
}
