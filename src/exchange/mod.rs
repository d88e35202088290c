//! Request/response exchange over connections: payload codec, handler registries,
//! inbound and outbound message paths and the [`Exchanger`] facade.

pub use codec::{ErrorPayload, TransportMessage};
pub use exchanger::{Exchanger, TransportRequestOptions};
pub use executor::{ExecutorService, Task, WorkerPoolConfig, GENERIC};
pub use handshake::{HandshakeRequest, HandshakeResponse, HANDSHAKE_ACTION};
pub use inbound::InboundHandler;
pub use message_listener::{MessageListener, MessageListeners};
pub use outbound::OutboundHandler;
pub use request_registry::{
    RequestContext, RequestHandlerRegistry, ResponseChannel, TransportRequestHandler,
};
pub use response_registry::{
    FutureResponseHandler, ResponseContext, ResponseHandlerRegistry, TransportResponseHandler,
};

mod codec;
mod exchanger;
mod executor;
mod handshake;
mod inbound;
mod message_listener;
mod outbound;
mod request_registry;
mod response_registry;
