//! Identity of remote peers and the shape of the connections opened towards them.

pub use node::{Node, TransportAddress};
pub use profile::{ChannelType, ConnectionProfile, ConnectionProfileBuilder};

mod node;
mod profile;
