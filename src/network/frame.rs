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

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

pub const PROTOCOL_VERSION: u8 = 1;

const FLAG_REQUEST: u8 = 0b0000_0001;
const FLAG_ERROR: u8 = 0b0000_0010;
const FLAG_PING: u8 = 0b0000_0100;
const VERSION_SHIFT: u8 = 3;

/// size of the u32 length prefix
pub const LENGTH_FIELD_SIZE: usize = 4;
/// flags + request id
const FIXED_HEADER_SIZE: usize = 1 + 8;

/// What a frame carries, decoded from the status flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Request { action: String },
    Response,
    Error,
    Ping,
}

impl MessageKind {
    fn flags(&self) -> u8 {
        let kind = match self {
            MessageKind::Request { .. } => FLAG_REQUEST,
            MessageKind::Response => 0,
            MessageKind::Error => FLAG_ERROR,
            MessageKind::Ping => FLAG_PING,
        };
        kind | (PROTOCOL_VERSION << VERSION_SHIFT)
    }
}

/// One wire-level message.
///
/// ```text
/// u32  total length (excludes itself)
/// u8   status flags  bit0 request, bit1 error, bit2 ping, bits3-7 version
/// u64  request id
/// [request only] u16 action length, utf8 action
/// u16  header count, then repeated u16 key length, key, u16 value length, value
/// ..   payload, the remaining bytes
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkMessage {
    pub kind: MessageKind,
    pub request_id: u64,
    pub headers: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl NetworkMessage {
    pub fn request(
        request_id: u64,
        action: impl Into<String>,
        headers: BTreeMap<String, String>,
        payload: Bytes,
    ) -> Self {
        NetworkMessage {
            kind: MessageKind::Request {
                action: action.into(),
            },
            request_id,
            headers,
            payload,
        }
    }

    pub fn response(request_id: u64, headers: BTreeMap<String, String>, payload: Bytes) -> Self {
        NetworkMessage {
            kind: MessageKind::Response,
            request_id,
            headers,
            payload,
        }
    }

    pub fn error(request_id: u64, headers: BTreeMap<String, String>, payload: Bytes) -> Self {
        NetworkMessage {
            kind: MessageKind::Error,
            request_id,
            headers,
            payload,
        }
    }

    pub fn ping() -> Self {
        NetworkMessage {
            kind: MessageKind::Ping,
            request_id: 0,
            headers: BTreeMap::new(),
            payload: Bytes::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request { .. })
    }

    pub fn action(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Request { action } => Some(action),
            _ => None,
        }
    }

    fn body_size(&self) -> usize {
        let action = match &self.kind {
            MessageKind::Request { action } => 2 + action.len(),
            _ => 0,
        };
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| 2 + k.len() + 2 + v.len())
            .sum();
        FIXED_HEADER_SIZE + action + 2 + headers + self.payload.len()
    }

    /// Serializes the message including its length prefix.
    pub fn encode(&self) -> AppResult<Bytes> {
        let body_size = self.body_size();
        let total_length = u32::try_from(body_size).map_err(|_| {
            AppError::InvalidValue(format!("frame of {} bytes exceeds u32 length", body_size))
        })?;
        if self.headers.len() > u16::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "too many headers: {}",
                self.headers.len()
            )));
        }

        let mut buffer = BytesMut::with_capacity(LENGTH_FIELD_SIZE + body_size);
        buffer.put_u32(total_length);
        buffer.put_u8(self.kind.flags());
        buffer.put_u64(self.request_id);
        if let MessageKind::Request { action } = &self.kind {
            put_short_string(&mut buffer, action)?;
        }
        buffer.put_u16(self.headers.len() as u16);
        for (key, value) in &self.headers {
            put_short_string(&mut buffer, key)?;
            put_short_string(&mut buffer, value)?;
        }
        buffer.put_slice(&self.payload);
        Ok(buffer.freeze())
    }

    /// Checks whether `buffer` starts with a complete frame.
    ///
    /// Returns `Incomplete` when more bytes are needed, a size error when the
    /// announced length is out of bounds. A size error leaves the stream unusable.
    pub fn check(buffer: &mut BytesMut, max_package_size: usize) -> AppResult<usize> {
        if buffer.remaining() < LENGTH_FIELD_SIZE {
            return Err(Incomplete);
        }
        let body_size = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if body_size < FIXED_HEADER_SIZE + 2 {
            return Err(AppError::MalformedProtocol(format!(
                "frame size {} is less than the fixed header",
                body_size
            )));
        }
        if body_size > max_package_size {
            return Err(AppError::MalformedProtocol(format!(
                "Frame of length {} is too large.",
                body_size
            )));
        }
        if buffer.remaining() < body_size + LENGTH_FIELD_SIZE {
            buffer.reserve(body_size + LENGTH_FIELD_SIZE - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(body_size)
    }

    /// Splits one complete frame body off the front of `buffer`.
    pub fn split_frame(buffer: &mut BytesMut, max_package_size: usize) -> AppResult<Option<Bytes>> {
        match NetworkMessage::check(buffer, max_package_size) {
            Ok(body_size) => {
                buffer.advance(LENGTH_FIELD_SIZE);
                Ok(Some(buffer.split_to(body_size).freeze()))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Decodes a frame body, the length prefix already stripped.
    pub fn decode(mut body: Bytes) -> AppResult<NetworkMessage> {
        if body.remaining() < FIXED_HEADER_SIZE {
            return Err(AppError::MalformedProtocol(
                "frame body shorter than the fixed header".to_string(),
            ));
        }
        let flags = body.get_u8();
        let request_id = body.get_u64();
        let version = flags >> VERSION_SHIFT;
        if version != PROTOCOL_VERSION {
            return Err(AppError::MalformedProtocol(format!(
                "unsupported protocol version {}",
                version
            )));
        }

        let is_request = flags & FLAG_REQUEST != 0;
        let action = if is_request {
            Some(get_short_string(&mut body)?)
        } else {
            None
        };

        let kind = match (action, flags & FLAG_ERROR != 0, flags & FLAG_PING != 0) {
            (_, true, true) => {
                return Err(AppError::MalformedProtocol(
                    "error and ping flags are exclusive".to_string(),
                ))
            }
            (Some(_), true, false) => {
                return Err(AppError::MalformedProtocol(
                    "a request can not carry the error flag".to_string(),
                ))
            }
            (_, false, true) => MessageKind::Ping,
            (Some(action), false, false) => MessageKind::Request { action },
            (None, true, false) => MessageKind::Error,
            (None, false, false) => MessageKind::Response,
        };

        if body.remaining() < 2 {
            return Err(AppError::MalformedProtocol(
                "missing header count".to_string(),
            ));
        }
        let header_count = body.get_u16();
        let mut headers = BTreeMap::new();
        for _ in 0..header_count {
            let key = get_short_string(&mut body)?;
            let value = get_short_string(&mut body)?;
            headers.insert(key, value);
        }

        Ok(NetworkMessage {
            kind,
            request_id,
            headers,
            payload: body,
        })
    }

    /// Reads the request flag and request id of a body that failed to decode, so a
    /// malformed frame can still be answered or correlated.
    pub fn peek_header(body: &[u8]) -> Option<(bool, u64)> {
        if body.len() < FIXED_HEADER_SIZE {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&body[1..FIXED_HEADER_SIZE]);
        Some((body[0] & FLAG_REQUEST != 0, u64::from_be_bytes(id)))
    }
}

pub(crate) fn put_short_string(buffer: &mut BytesMut, value: &str) -> AppResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        AppError::InvalidValue(format!("string of {} bytes exceeds u16 length", value.len()))
    })?;
    buffer.put_u16(len);
    buffer.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn get_short_string(buffer: &mut Bytes) -> AppResult<String> {
    if buffer.remaining() < 2 {
        return Err(AppError::MalformedProtocol(
            "missing string length".to_string(),
        ));
    }
    let len = buffer.get_u16() as usize;
    if buffer.remaining() < len {
        return Err(AppError::MalformedProtocol(format!(
            "string length {} exceeds remaining {} bytes",
            len,
            buffer.remaining()
        )));
    }
    let raw = buffer.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| AppError::MalformedProtocol(format!("invalid utf8 string: {}", e)))
}
