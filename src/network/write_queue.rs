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

use std::collections::VecDeque;
use std::fmt;

use bytes::{Buf, Bytes};

use crate::{AppError, AppResult};

/// Completion callback of a single write, called exactly once.
pub type WriteListener = Box<dyn FnOnce(AppResult<()>) + Send + 'static>;

pub struct WriteOperation {
    buffer: Bytes,
    listener: WriteListener,
}

impl WriteOperation {
    pub fn new(buffer: Bytes, listener: WriteListener) -> Self {
        WriteOperation { buffer, listener }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    pub fn complete(self) {
        (self.listener)(Ok(()))
    }

    pub fn fail(self, error: AppError) {
        (self.listener)(Err(error))
    }
}

impl fmt::Debug for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOperation")
            .field("remaining", &self.buffer.len())
            .finish()
    }
}

/// FIFO of pending writes owned by one channel's writer task.
///
/// The head may be partially written, it then stays in `in_flight` until its last
/// byte is accepted. A buffer is never handed out in pieces larger than `chunk_size`
/// so one big message can not monopolise the socket for long.
#[derive(Debug)]
pub struct WriteQueue {
    queue: VecDeque<WriteOperation>,
    in_flight: Option<WriteOperation>,
    chunk_size: usize,
}

impl WriteQueue {
    pub fn new(chunk_size: usize) -> Self {
        WriteQueue {
            queue: VecDeque::new(),
            in_flight: None,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn push(&mut self, operation: WriteOperation) {
        self.queue.push_back(operation);
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    /// Number of operations not yet completed, the in-flight one included.
    pub fn len(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    /// Returns the next slice to hand to the socket.
    ///
    /// Empty buffers met on the way are completed immediately. `None` means
    /// nothing is left to write.
    pub fn next_slice(&mut self) -> Option<Bytes> {
        loop {
            if self.in_flight.is_none() {
                self.in_flight = Some(self.queue.pop_front()?);
            }
            let head = self.in_flight.as_ref()?;
            if head.remaining() == 0 {
                if let Some(done) = self.in_flight.take() {
                    done.complete();
                }
                continue;
            }
            let len = head.remaining().min(self.chunk_size);
            return Some(head.buffer.slice(..len));
        }
    }

    /// Records that the socket accepted `written` bytes of the last slice.
    ///
    /// Returns true when the head operation finished and its listener fired.
    pub fn advance(&mut self, written: usize) -> bool {
        let Some(head) = self.in_flight.as_mut() else {
            return false;
        };
        let written = written.min(head.buffer.len());
        head.buffer.advance(written);
        if head.buffer.is_empty() {
            if let Some(done) = self.in_flight.take() {
                done.complete();
            }
            return true;
        }
        false
    }

    /// Fails the in-flight remainder and every queued operation, in queue order.
    pub fn fail_all<F>(&mut self, make_error: F) -> usize
    where
        F: Fn() -> AppError,
    {
        let mut failed = 0;
        if let Some(head) = self.in_flight.take() {
            head.fail(make_error());
            failed += 1;
        }
        while let Some(operation) = self.queue.pop_front() {
            operation.fail(make_error());
            failed += 1;
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Events = Arc<Mutex<Vec<(usize, bool)>>>;

    fn operation(events: &Events, index: usize, data: &'static [u8]) -> WriteOperation {
        let events = events.clone();
        WriteOperation::new(
            Bytes::from_static(data),
            Box::new(move |result| events.lock().push((index, result.is_ok()))),
        )
    }

    #[test]
    fn test_oversized_buffer_is_sliced() {
        let events = Events::default();
        let mut queue = WriteQueue::new(4);
        queue.push(operation(&events, 0, b"0123456789"));

        let mut delivered = Vec::new();
        while let Some(slice) = queue.next_slice() {
            assert!(slice.len() <= 4);
            delivered.push(slice.clone());
            let finished = queue.advance(slice.len());
            // the listener only fires with the last slice
            assert_eq!(finished, delivered.concat().len() == 10);
        }

        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered.concat(), b"0123456789");
        assert_eq!(*events.lock(), vec![(0, true)]);
    }

    #[test]
    fn test_partial_socket_write_keeps_remainder() {
        let events = Events::default();
        let mut queue = WriteQueue::new(8);
        queue.push(operation(&events, 0, b"abcdef"));
        queue.push(operation(&events, 1, b"gh"));

        let slice = queue.next_slice().unwrap();
        assert_eq!(&slice[..], b"abcdef");
        // the socket took only two bytes
        assert!(!queue.advance(2));
        assert_eq!(&queue.next_slice().unwrap()[..], b"cdef");
        assert!(queue.advance(4));
        assert_eq!(&queue.next_slice().unwrap()[..], b"gh");
        assert!(queue.advance(2));
        assert!(queue.next_slice().is_none());
        assert_eq!(*events.lock(), vec![(0, true), (1, true)]);
    }

    #[test]
    fn test_empty_buffer_completes_without_write() {
        let events = Events::default();
        let mut queue = WriteQueue::new(8);
        queue.push(operation(&events, 0, b""));
        queue.push(operation(&events, 1, b"x"));

        assert_eq!(&queue.next_slice().unwrap()[..], b"x");
        assert_eq!(*events.lock(), vec![(0, true)]);
    }

    #[test]
    fn test_fail_all_fails_in_flight_and_queued() {
        let events = Events::default();
        let mut queue = WriteQueue::new(2);
        queue.push(operation(&events, 0, b"abcd"));
        queue.push(operation(&events, 1, b"ef"));
        queue.push(operation(&events, 2, b"gh"));

        queue.next_slice();
        queue.advance(2);
        assert_eq!(queue.len(), 3);

        let failed = queue.fail_all(|| AppError::ChannelClosed("test".to_string()));
        assert_eq!(failed, 3);
        assert!(queue.is_empty());
        assert_eq!(*events.lock(), vec![(0, false), (1, false), (2, false)]);
    }
}
