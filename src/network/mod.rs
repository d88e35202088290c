//! Network Module Implementation
//!
//! Physical channels and the tcp runtime glue underneath connections.
//!
//! # Components
//!
//! - `NetworkMessage`: the length-prefixed wire frame
//! - `WriteQueue`: per-channel FIFO of pending writes, sliced by chunk size
//! - `Channel`: one duplex socket driven by its own reader and writer tasks
//! - `TcpTransport`: binds, accepts inbound channels and dials outbound ones

pub use channel::{
    Channel, ChannelOptions, ChannelState, ChannelStats, CloseListener, FrameHandler,
};
pub use frame::{MessageKind, NetworkMessage, PROTOCOL_VERSION};
pub use transport::TcpTransport;
pub use write_queue::{WriteListener, WriteOperation, WriteQueue};

pub(crate) use frame::{get_short_string, put_short_string};

mod channel;
mod frame;
mod transport;
mod write_queue;
