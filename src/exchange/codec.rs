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

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::{get_short_string, put_short_string};
use crate::{AppError, AppResult};

/// Payload codec for request and response bodies.
///
/// `read_from` consumes from the front of the buffer; `decode` additionally
/// rejects trailing bytes.
pub trait TransportMessage: Sized + Send + Sync + 'static {
    fn write_to(&self, buffer: &mut BytesMut) -> AppResult<()>;

    fn read_from(buffer: &mut Bytes) -> AppResult<Self>;

    fn encode(&self) -> AppResult<Bytes> {
        let mut buffer = BytesMut::new();
        self.write_to(&mut buffer)?;
        Ok(buffer.freeze())
    }

    fn decode(mut payload: Bytes) -> AppResult<Self> {
        let message = Self::read_from(&mut payload)?;
        if payload.has_remaining() {
            return Err(AppError::MalformedProtocol(format!(
                "{} trailing bytes after {}",
                payload.remaining(),
                std::any::type_name::<Self>()
            )));
        }
        Ok(message)
    }
}

/// Raw payload, takes every remaining byte.
impl TransportMessage for Bytes {
    fn write_to(&self, buffer: &mut BytesMut) -> AppResult<()> {
        buffer.put_slice(self);
        Ok(())
    }

    fn read_from(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(buffer.split_to(buffer.len()))
    }
}

/// Utf8 text, takes every remaining byte.
impl TransportMessage for String {
    fn write_to(&self, buffer: &mut BytesMut) -> AppResult<()> {
        buffer.put_slice(self.as_bytes());
        Ok(())
    }

    fn read_from(buffer: &mut Bytes) -> AppResult<Self> {
        let raw = buffer.split_to(buffer.len());
        String::from_utf8(raw.to_vec())
            .map_err(|e| AppError::MalformedProtocol(format!("invalid utf8 payload: {}", e)))
    }
}

/// Empty payload.
impl TransportMessage for () {
    fn write_to(&self, _buffer: &mut BytesMut) -> AppResult<()> {
        Ok(())
    }

    fn read_from(_buffer: &mut Bytes) -> AppResult<Self> {
        Ok(())
    }
}

/// Body of an error frame.
///
/// ```text
/// u16 kind length, kind
/// u32 message length, message
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl ErrorPayload {
    /// Rebuilds the error on the requesting side.
    pub fn into_error(self, action: &str) -> AppError {
        AppError::RemoteTransport {
            action: action.to_string(),
            kind: self.kind,
            message: self.message,
        }
    }
}

impl From<&AppError> for ErrorPayload {
    fn from(error: &AppError) -> Self {
        ErrorPayload {
            kind: error.kind().to_string(),
            message: error.detail(),
        }
    }
}

impl TransportMessage for ErrorPayload {
    fn write_to(&self, buffer: &mut BytesMut) -> AppResult<()> {
        put_short_string(buffer, &self.kind)?;
        let len = u32::try_from(self.message.len()).map_err(|_| {
            AppError::InvalidValue(format!("error message of {} bytes", self.message.len()))
        })?;
        buffer.put_u32(len);
        buffer.put_slice(self.message.as_bytes());
        Ok(())
    }

    fn read_from(buffer: &mut Bytes) -> AppResult<Self> {
        let kind = get_short_string(buffer)?;
        if buffer.remaining() < 4 {
            return Err(AppError::MalformedProtocol(
                "missing error message length".to_string(),
            ));
        }
        let len = buffer.get_u32() as usize;
        if buffer.remaining() < len {
            return Err(AppError::MalformedProtocol(format!(
                "error message length {} exceeds remaining {} bytes",
                len,
                buffer.remaining()
            )));
        }
        let raw = buffer.split_to(len);
        let message = String::from_utf8(raw.to_vec())
            .map_err(|e| AppError::MalformedProtocol(format!("invalid utf8 message: {}", e)))?;
        Ok(ErrorPayload { kind, message })
    }
}
