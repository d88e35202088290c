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

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::{AppError, AppResult};

/// A resolved socket address of a peer, keeping the host name it was resolved from.
#[derive(Clone, Debug)]
pub struct TransportAddress {
    host: String,
    address: SocketAddr,
}

impl TransportAddress {
    pub fn new(address: SocketAddr) -> Self {
        TransportAddress {
            host: address.ip().to_string(),
            address,
        }
    }

    /// Resolves `host:port`, the first resolved address wins.
    pub fn resolve(host: &str, port: u16) -> AppResult<Self> {
        let address = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| AppError::InvalidValue(format!("can not resolve {}:{}", host, port)))?;
        Ok(TransportAddress {
            host: host.to_string(),
            address,
        })
    }

    /// Same as [`TransportAddress::resolve`] without blocking the runtime on DNS.
    pub async fn lookup(host: &str, port: u16) -> AppResult<Self> {
        let address = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| AppError::InvalidValue(format!("can not resolve {}:{}", host, port)))?;
        Ok(TransportAddress {
            host: host.to_string(),
            address,
        })
    }

    /// Parses and resolves `host:port` on the runtime.
    pub async fn lookup_str(s: &str) -> AppResult<Self> {
        let (host, port) = split_host_port(s)?;
        TransportAddress::lookup(host, port).await
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl PartialEq for TransportAddress {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for TransportAddress {}

impl Hash for TransportAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

fn split_host_port(s: &str) -> AppResult<(&str, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| AppError::InvalidValue(format!("address without port: {}", s)))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| AppError::InvalidValue(format!("bad port in {}: {}", s, e)))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

/// Resolves with blocking std DNS, use [`TransportAddress::lookup_str`] from async code.
impl FromStr for TransportAddress {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(s)?;
        TransportAddress::resolve(host, port)
    }
}

/// Identity of a remote peer. Two nodes are the same node when their addresses match,
/// attributes are informational only.
#[derive(Clone, Debug)]
pub struct Node {
    address: TransportAddress,
    attributes: BTreeMap<String, String>,
}

impl Node {
    pub fn new(address: TransportAddress) -> Self {
        Node {
            address,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attributes(address: TransportAddress, attributes: BTreeMap<String, String>) -> Self {
        Node {
            address,
            attributes,
        }
    }

    pub fn from_socket_addr(address: SocketAddr) -> Self {
        Node::new(TransportAddress::new(address))
    }

    pub fn address(&self) -> &TransportAddress {
        &self.address
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.address.address()
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_node_identity_is_address() {
        let addr: SocketAddr = "127.0.0.1:9300".parse().unwrap();
        let mut attrs = BTreeMap::new();
        attrs.insert("zone".to_string(), "a".to_string());
        let plain = Node::from_socket_addr(addr);
        let decorated = Node::with_attributes(TransportAddress::new(addr), attrs);

        assert_eq!(plain, decorated);
        let set: HashSet<Node> = [plain, decorated.clone()].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_eq!(decorated.attribute("zone"), Some("a"));
    }

    #[test]
    fn test_parse_transport_address() {
        let address: TransportAddress = "127.0.0.1:9301".parse().unwrap();
        assert_eq!(address.port(), 9301);
        assert_eq!(address.host(), "127.0.0.1");
        assert!("127.0.0.1".parse::<TransportAddress>().is_err());
        assert!("127.0.0.1:notaport".parse::<TransportAddress>().is_err());
    }

    #[tokio::test]
    async fn test_lookup_transport_address() {
        let address = TransportAddress::lookup_str("127.0.0.1:9302").await.unwrap();
        assert_eq!(address.port(), 9302);
        assert_eq!(address, "127.0.0.1:9302".parse::<TransportAddress>().unwrap());
        assert!(TransportAddress::lookup_str("127.0.0.1").await.is_err());
        assert!(TransportAddress::lookup_str("[::1]:x").await.is_err());
    }
}
