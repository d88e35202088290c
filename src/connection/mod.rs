//! Logical connections to peers and the registry that owns them.

pub use listener::{ConnectionListener, ConnectionListeners};
pub use manager::{BoxFuture, ConnectionManager, ConnectionValidator, Connector};
pub use node_channels::{Connection, RandomStrategy, RoundRobinStrategy, SelectStrategy};

mod listener;
mod manager;
mod node_channels;
