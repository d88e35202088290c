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

use arc_swap::ArcSwap;

use crate::cluster::Node;
use crate::exchange::ResponseContext;
use crate::AppError;

/// Observability hooks on the request/response lifecycle.
///
/// "Sent" callbacks fire once the frame was handed to the socket, not when the
/// peer processed it. Callbacks run on transport tasks and must not block.
pub trait MessageListener: Send + Sync {
    fn on_request_sent(&self, _node: &Node, _request_id: u64, _action: &str) {}

    fn on_request_received(&self, _request_id: u64, _action: &str) {}

    fn on_response_sent(&self, _request_id: u64, _action: &str) {}

    fn on_response_sent_error(&self, _request_id: u64, _action: &str, _error: &AppError) {}

    /// `context` is `None` when the request already timed out or the frame is a
    /// duplicate.
    fn on_response_received(&self, _request_id: u64, _context: Option<&ResponseContext>) {}
}

#[derive(Default)]
pub struct MessageListeners {
    listeners: ArcSwap<Vec<Arc<dyn MessageListener>>>,
}

impl MessageListeners {
    pub fn add(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(listener.clone());
            next
        });
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageListener for MessageListeners {
    fn on_request_sent(&self, node: &Node, request_id: u64, action: &str) {
        for listener in self.listeners.load().iter() {
            listener.on_request_sent(node, request_id, action);
        }
    }

    fn on_request_received(&self, request_id: u64, action: &str) {
        for listener in self.listeners.load().iter() {
            listener.on_request_received(request_id, action);
        }
    }

    fn on_response_sent(&self, request_id: u64, action: &str) {
        for listener in self.listeners.load().iter() {
            listener.on_response_sent(request_id, action);
        }
    }

    fn on_response_sent_error(&self, request_id: u64, action: &str, error: &AppError) {
        for listener in self.listeners.load().iter() {
            listener.on_response_sent_error(request_id, action, error);
        }
    }

    fn on_response_received(&self, request_id: u64, context: Option<&ResponseContext>) {
        for listener in self.listeners.load().iter() {
            listener.on_response_received(request_id, context);
        }
    }
}
