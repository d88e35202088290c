pub mod cluster;
pub mod connection;
pub mod exchange;
pub mod network;
pub mod service;

#[cfg(test)]
mod test_support;

pub use cluster::{ChannelType, ConnectionProfile, Node, TransportAddress};
pub use connection::{Connection, ConnectionListener, ConnectionManager};
pub use exchange::{
    Exchanger, MessageListener, ResponseChannel, TransportMessage, TransportRequestHandler,
    TransportRequestOptions, TransportResponseHandler,
};
pub use network::{Channel, NetworkMessage, TcpTransport};
pub use service::{
    setup_local_tracing, setup_tracing, verbosity_level, AppError, AppResult, Shutdown,
    TransportConfig,
};
