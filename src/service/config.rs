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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{ChannelType, ConnectionProfile};

use super::{AppError, AppResult};

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub node_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            node_name: "stonelink-node".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub max_package_size: usize,
    /// upper bound of a single socket write, oversized messages are sliced
    pub chunk_size: usize,
    pub conn_read_buffer_size: usize,
    pub tcp_nodelay: bool,
    /// 0 disables keep-alive pings
    pub ping_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 0,
            max_connection: 1024,
            max_package_size: 100 * 1024 * 1024,
            chunk_size: DEFAULT_CHUNK_SIZE,
            conn_read_buffer_size: 4 * 1024,
            tcp_nodelay: true,
            ping_interval_ms: 0,
        }
    }
}

impl NetworkConfig {
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }
}

/// Default connection profile used when callers do not supply their own.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    pub light: usize,
    pub bulk: usize,
    pub state: usize,
    pub ping: usize,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            light: 2,
            bulk: 1,
            state: 1,
            ping: 1,
            connect_timeout_ms: 30_000,
            handshake_timeout_ms: 30_000,
        }
    }
}

impl ConnectionConfig {
    pub fn default_profile(&self) -> AppResult<ConnectionProfile> {
        let mut builder = ConnectionProfile::builder()
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .handshake_timeout(Duration::from_millis(self.handshake_timeout_ms));
        for (count, channel_type) in [
            (self.light, ChannelType::Light),
            (self.bulk, ChannelType::Bulk),
            (self.state, ChannelType::State),
            (self.ping, ChannelType::Ping),
        ] {
            if count > 0 {
                builder = builder.add_connections(count, channel_type);
            }
        }
        builder.build()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RequestHandlerPool {
    pub channel_capacity: usize,
    /// 0 means one worker per cpu
    pub num_workers: usize,
    pub monitor_interval_ms: u64,
    pub worker_check_timeout_ms: u64,
    /// executors created besides the generic one
    pub names: Vec<String>,
}

impl Default for RequestHandlerPool {
    fn default() -> Self {
        RequestHandlerPool {
            channel_capacity: 1024,
            num_workers: 0,
            monitor_interval_ms: 5_000,
            worker_check_timeout_ms: 200,
            names: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SlowLogConfig {
    /// 0 disables slow-call warnings
    pub threshold_ms: u64,
}

impl SlowLogConfig {
    pub fn threshold(&self) -> Option<Duration> {
        (self.threshold_ms > 0).then(|| Duration::from_millis(self.threshold_ms))
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub connection: ConnectionConfig,
    pub request_handler_pool: RequestHandlerPool,
    pub slow_log: SlowLogConfig,
}

impl TransportConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<TransportConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let transport_config: TransportConfig = config.try_deserialize()?;
        transport_config.validate()?;
        Ok(transport_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.chunk_size == 0 {
            return Err(AppError::InvalidValue(
                "network.chunk_size must be positive".to_string(),
            ));
        }
        if self.network.max_package_size < 64 {
            return Err(AppError::InvalidValue(format!(
                "network.max_package_size {} is too small",
                self.network.max_package_size
            )));
        }
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be positive".to_string(),
            ));
        }
        if self.request_handler_pool.channel_capacity == 0 {
            return Err(AppError::InvalidValue(
                "request_handler_pool.channel_capacity must be positive".to_string(),
            ));
        }
        // a zero period panics tokio's interval inside the pool monitor
        if self.request_handler_pool.monitor_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "request_handler_pool.monitor_interval_ms must be positive".to_string(),
            ));
        }
        if self.request_handler_pool.worker_check_timeout_ms == 0 {
            return Err(AppError::InvalidValue(
                "request_handler_pool.worker_check_timeout_ms must be positive".to_string(),
            ));
        }
        self.connection.default_profile()?;
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }
}
