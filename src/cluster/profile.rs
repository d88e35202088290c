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
use std::time::Duration;

use crate::{AppError, AppResult};

/// Class of a physical channel inside a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelType {
    /// small, latency sensitive requests
    Light,
    /// large transfers that should not block light traffic
    Bulk,
    /// cluster state publication
    State,
    /// keep-alive pings
    Ping,
}

impl ChannelType {
    pub const ALL: [ChannelType; 4] = [
        ChannelType::Light,
        ChannelType::Bulk,
        ChannelType::State,
        ChannelType::Ping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Light => "light",
            ChannelType::Bulk => "bulk",
            ChannelType::State => "state",
            ChannelType::Ping => "ping",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many channels of which type to open towards a node, and how long to wait.
///
/// Immutable once built, use [`ConnectionProfile::builder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionProfile {
    channels_per_type: BTreeMap<ChannelType, usize>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl ConnectionProfile {
    pub fn builder() -> ConnectionProfileBuilder {
        ConnectionProfileBuilder::default()
    }

    /// A profile with `count` light channels and default timeouts.
    pub fn light(count: usize) -> AppResult<ConnectionProfile> {
        ConnectionProfile::builder()
            .add_connections(count, ChannelType::Light)
            .build()
    }

    pub fn num_connections(&self) -> usize {
        self.channels_per_type.values().sum()
    }

    pub fn connections_for(&self, channel_type: ChannelType) -> usize {
        self.channels_per_type
            .get(&channel_type)
            .copied()
            .unwrap_or(0)
    }

    /// One entry per physical channel, grouped by type.
    pub fn channel_types(&self) -> Vec<ChannelType> {
        self.channels_per_type
            .iter()
            .flat_map(|(channel_type, count)| std::iter::repeat(*channel_type).take(*count))
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

#[derive(Debug)]
pub struct ConnectionProfileBuilder {
    channels_per_type: BTreeMap<ChannelType, usize>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Default for ConnectionProfileBuilder {
    fn default() -> Self {
        ConnectionProfileBuilder {
            channels_per_type: BTreeMap::new(),
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionProfileBuilder {
    /// Adds `count` channels of `channel_type`, adding the same type twice accumulates.
    pub fn add_connections(mut self, count: usize, channel_type: ChannelType) -> Self {
        *self.channels_per_type.entry(channel_type).or_insert(0) += count;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn build(mut self) -> AppResult<ConnectionProfile> {
        self.channels_per_type.retain(|_, count| *count > 0);
        if self.channels_per_type.is_empty() {
            return Err(AppError::InvalidValue(
                "connection profile must open at least one channel".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(AppError::InvalidValue(
                "connect timeout must be positive".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(AppError::InvalidValue(
                "handshake timeout must be positive".to_string(),
            ));
        }
        Ok(ConnectionProfile {
            channels_per_type: self.channels_per_type,
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
        })
    }
}
