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
use crate::connection::Connection;

/// Hooks fired on connection lifecycle transitions, each exactly once per transition.
pub trait ConnectionListener: Send + Sync {
    fn on_connection_opened(&self, _connection: &Arc<Connection>) {}

    fn on_connection_closed(&self, _connection: &Arc<Connection>) {}

    fn on_node_connected(&self, _node: &Node, _connection: &Arc<Connection>) {}

    fn on_node_disconnected(&self, _node: &Node, _connection: &Arc<Connection>) {}
}

/// Copy-on-write list of listeners, reads never lock.
#[derive(Default)]
pub struct ConnectionListeners {
    listeners: ArcSwap<Vec<Arc<dyn ConnectionListener>>>,
}

impl ConnectionListeners {
    pub fn add(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(listener.clone());
            next
        });
    }

    pub fn remove(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.rcu(|current| {
            current
                .iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectionListener for ConnectionListeners {
    fn on_connection_opened(&self, connection: &Arc<Connection>) {
        for listener in self.listeners.load().iter() {
            listener.on_connection_opened(connection);
        }
    }

    fn on_connection_closed(&self, connection: &Arc<Connection>) {
        for listener in self.listeners.load().iter() {
            listener.on_connection_closed(connection);
        }
    }

    fn on_node_connected(&self, node: &Node, connection: &Arc<Connection>) {
        for listener in self.listeners.load().iter() {
            listener.on_node_connected(node, connection);
        }
    }

    fn on_node_disconnected(&self, node: &Node, connection: &Arc<Connection>) {
        for listener in self.listeners.load().iter() {
            listener.on_node_disconnected(node, connection);
        }
    }
}
