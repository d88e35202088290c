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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error, the buffer does not hold a complete frame yet
    #[error("incomplete frame")]
    Incomplete,

    /// connection errors
    #[error("node not connected: {0}")]
    NodeNotConnected(String),

    #[error("connect transport error: {0}")]
    ConnectTransport(String),

    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// request dispatch errors
    #[error("no handler for action [{0}]")]
    ActionNotFound(String),

    #[error("transport handler for action [{0}] is already registered")]
    DuplicateAction(String),

    #[error("rejected execution on executor [{0}]")]
    RejectedExecution(String),

    #[error("response timeout: {0}")]
    ResponseTimeout(String),

    /// an error response delivered by the remote peer
    #[error("[{action}] remote error ({kind}): {message}")]
    RemoteTransport {
        action: String,
        kind: String,
        message: String,
    },
}

impl AppError {
    /// Stable name carried in error response frames.
    pub fn kind(&self) -> &str {
        match self {
            AppError::IllegalStateError(_) => "illegal_state",
            AppError::MalformedProtocol(_) => "malformed_protocol",
            AppError::InvalidValue(_) => "invalid_value",
            AppError::DetailedIoError(_) | AppError::IoError(_) => "io",
            AppError::ConfigFileError(_) => "config",
            AppError::Incomplete => "incomplete",
            AppError::NodeNotConnected(_) => "node_not_connected",
            AppError::ConnectTransport(_) => "connect_transport",
            AppError::ConnectTimeout(_) => "connect_timeout",
            AppError::Handshake(_) => "handshake",
            AppError::ChannelClosed(_) => "channel_closed",
            AppError::ConnectionClosed(_) => "connection_closed",
            AppError::ActionNotFound(_) => "action_not_found",
            AppError::DuplicateAction(_) => "duplicate_action",
            AppError::RejectedExecution(_) => "rejected_execution",
            AppError::ResponseTimeout(_) => "response_timeout",
            AppError::RemoteTransport { kind, .. } => kind,
        }
    }

    /// Message part of the error, without the kind prefix.
    pub fn detail(&self) -> String {
        match self {
            AppError::RemoteTransport { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            AppError::ChannelClosed(_) | AppError::ConnectionClosed(_)
        )
    }
}

impl Clone for AppError {
    fn clone(&self) -> Self {
        match self {
            AppError::IllegalStateError(s) => AppError::IllegalStateError(s.clone()),
            AppError::MalformedProtocol(s) => AppError::MalformedProtocol(s.clone()),
            AppError::InvalidValue(s) => AppError::InvalidValue(s.clone()),
            AppError::DetailedIoError(s) => AppError::DetailedIoError(s.clone()),
            // neither source error is Clone, keep kind and text
            AppError::IoError(e) => AppError::IoError(std::io::Error::new(e.kind(), e.to_string())),
            AppError::ConfigFileError(e) => {
                AppError::ConfigFileError(config::ConfigError::Message(e.to_string()))
            }
            AppError::Incomplete => AppError::Incomplete,
            AppError::NodeNotConnected(s) => AppError::NodeNotConnected(s.clone()),
            AppError::ConnectTransport(s) => AppError::ConnectTransport(s.clone()),
            AppError::ConnectTimeout(s) => AppError::ConnectTimeout(s.clone()),
            AppError::Handshake(s) => AppError::Handshake(s.clone()),
            AppError::ChannelClosed(s) => AppError::ChannelClosed(s.clone()),
            AppError::ConnectionClosed(s) => AppError::ConnectionClosed(s.clone()),
            AppError::ActionNotFound(s) => AppError::ActionNotFound(s.clone()),
            AppError::DuplicateAction(s) => AppError::DuplicateAction(s.clone()),
            AppError::RejectedExecution(s) => AppError::RejectedExecution(s.clone()),
            AppError::ResponseTimeout(s) => AppError::ResponseTimeout(s.clone()),
            AppError::RemoteTransport {
                action,
                kind,
                message,
            } => AppError::RemoteTransport {
                action: action.clone(),
                kind: kind.clone(),
                message: message.clone(),
            },
        }
    }
}
