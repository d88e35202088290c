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

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::network::frame::NetworkMessage;
use crate::network::write_queue::{WriteListener, WriteOperation, WriteQueue};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

/// Receives every complete frame body read from a channel.
///
/// Called on the channel's reader task, implementations must not block.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, channel: &Arc<Channel>, body: Bytes);
}

pub type CloseListener = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Active = 1,
    Inactive = 2,
}

impl ChannelState {
    fn from_u8(value: u8) -> ChannelState {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Active,
            _ => ChannelState::Inactive,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChannelOptions {
    pub chunk_size: usize,
    pub max_package_size: usize,
    pub read_buffer_size: usize,
    pub tcp_nodelay: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for ChannelOptions {
    fn from(config: &NetworkConfig) -> Self {
        ChannelOptions {
            chunk_size: config.chunk_size,
            max_package_size: config.max_package_size,
            read_buffer_size: config.conn_read_buffer_size,
            tcp_nodelay: config.tcp_nodelay,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelStats {
    frames_read: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    writes_completed: AtomicU64,
}

impl ChannelStats {
    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn writes_completed(&self) -> u64 {
        self.writes_completed.load(Ordering::Relaxed)
    }
}

/// One physical duplex byte stream.
///
/// Socket state is owned by two tasks spawned at construction: the reader task
/// reassembles frames and hands them to the [`FrameHandler`], the writer task owns
/// the [`WriteQueue`] and is the only place bytes are written. Everything else talks
/// to them through the command queue and the close token, so the write path needs
/// no lock.
pub struct Channel {
    id: u64,
    local_address: SocketAddr,
    remote_address: SocketAddr,
    is_server: bool,
    state: AtomicU8,
    write_tx: mpsc::UnboundedSender<WriteOperation>,
    closed: CancellationToken,
    close_listeners: Mutex<Option<Vec<CloseListener>>>,
    stats: ChannelStats,
}

impl Channel {
    /// Wraps a connected tcp stream.
    pub fn from_tcp(
        id: u64,
        stream: TcpStream,
        is_server: bool,
        options: &ChannelOptions,
        handler: Arc<dyn FrameHandler>,
    ) -> AppResult<Arc<Channel>> {
        stream.set_nodelay(options.tcp_nodelay)?;
        let local_address = stream.local_addr()?;
        let remote_address = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Channel::spawn(
            id,
            local_address,
            remote_address,
            is_server,
            reader,
            writer,
            options,
            handler,
        ))
    }

    /// Starts the reader and writer tasks over any byte stream halves.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<R, W>(
        id: u64,
        local_address: SocketAddr,
        remote_address: SocketAddr,
        is_server: bool,
        reader: R,
        writer: W,
        options: &ChannelOptions,
        handler: Arc<dyn FrameHandler>,
    ) -> Arc<Channel>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Channel {
            id,
            local_address,
            remote_address,
            is_server,
            state: AtomicU8::new(ChannelState::Connecting as u8),
            write_tx,
            closed: CancellationToken::new(),
            close_listeners: Mutex::new(Some(Vec::new())),
            stats: ChannelStats::default(),
        });

        tokio::spawn(write_loop(
            channel.clone(),
            writer,
            write_rx,
            options.chunk_size,
        ));
        tokio::spawn(read_loop(
            channel.clone(),
            reader,
            handler,
            options.max_package_size,
            options.read_buffer_size,
        ));

        // a close racing with startup must win
        let _ = channel.state.compare_exchange(
            ChannelState::Connecting as u8,
            ChannelState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug!(
            channel = id,
            local = %local_address,
            remote = %remote_address,
            is_server,
            "channel active"
        );
        channel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() != ChannelState::Inactive
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Queues `buffer` for writing. The listener fires once the last byte was handed
    /// to the socket, or with `ChannelClosed` if the channel closes first.
    pub fn send(&self, buffer: Bytes, listener: WriteListener) {
        let operation = WriteOperation::new(buffer, listener);
        if !self.is_open() {
            operation.fail(self.closed_error());
            return;
        }
        if let Err(mpsc::error::SendError(operation)) = self.write_tx.send(operation) {
            operation.fail(self.closed_error());
        }
    }

    /// Future flavour of [`Channel::send`].
    pub async fn write(&self, buffer: Bytes) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(
            buffer,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await
            .map_err(|_| AppError::ChannelClosed(format!("write listener of {} dropped", self)))?
    }

    /// Closes the channel, idempotent. Pending writes fail, close listeners fire.
    pub fn close(&self) {
        let previous = self
            .state
            .swap(ChannelState::Inactive as u8, Ordering::AcqRel);
        if previous == ChannelState::Inactive as u8 {
            return;
        }
        debug!(channel = self.id, remote = %self.remote_address, "closing channel");
        self.closed.cancel();
        let listeners = self.close_listeners.lock().take();
        for listener in listeners.into_iter().flatten() {
            listener();
        }
    }

    /// Registers a listener fired exactly once when the channel closes, right away
    /// if it is already closed.
    pub fn add_close_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.close_listeners.lock();
        match guard.as_mut() {
            Some(listeners) => listeners.push(Box::new(listener)),
            None => {
                drop(guard);
                listener();
            }
        }
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn closed_error(&self) -> AppError {
        AppError::ChannelClosed(self.to_string())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel[{}] {} -> {}",
            self.id, self.local_address, self.remote_address
        )
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("local_address", &self.local_address)
            .field("remote_address", &self.remote_address)
            .field("is_server", &self.is_server)
            .field("state", &self.state())
            .finish()
    }
}

/// Drains the write queue while the socket accepts bytes.
///
/// Waiting on `writer.write` is the writability signal: while the socket is full the
/// future stays pending and new operations keep queueing behind it.
async fn write_loop<W>(
    channel: Arc<Channel>,
    mut writer: W,
    mut write_rx: mpsc::UnboundedReceiver<WriteOperation>,
    chunk_size: usize,
) where
    W: AsyncWrite + Unpin,
{
    let mut queue = WriteQueue::new(chunk_size);
    let mut unflushed = false;

    let failure = loop {
        let Some(slice) = queue.next_slice() else {
            if unflushed {
                if let Err(e) = writer.flush().await {
                    break Some(e);
                }
                unflushed = false;
            }
            tokio::select! {
                _ = channel.closed.cancelled() => break None,
                operation = write_rx.recv() => match operation {
                    Some(operation) => queue.push(operation),
                    None => break None,
                },
            }
            continue;
        };

        tokio::select! {
            biased;
            _ = channel.closed.cancelled() => break None,
            result = writer.write(&slice) => match result {
                Ok(0) => break Some(std::io::ErrorKind::WriteZero.into()),
                Ok(written) => {
                    channel.stats.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
                    unflushed = true;
                    if queue.advance(written) {
                        channel.stats.writes_completed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => break Some(e),
            },
            operation = write_rx.recv() => {
                if let Some(operation) = operation {
                    queue.push(operation);
                }
            }
        }
    };

    if let Some(e) = &failure {
        warn!(channel = channel.id, error = %e, "write failed, closing channel");
    }
    channel.close();

    let failed = queue.fail_all(|| channel.closed_error());
    write_rx.close();
    let mut late = 0;
    while let Ok(operation) = write_rx.try_recv() {
        operation.fail(channel.closed_error());
        late += 1;
    }
    if failed + late > 0 {
        debug!(
            channel = channel.id,
            failed = failed + late,
            "failed pending writes on closed channel"
        );
    }
    let _ = writer.shutdown().await;
}

/// Reassembles frames until the peer goes away or the channel is closed.
async fn read_loop<R>(
    channel: Arc<Channel>,
    mut reader: R,
    handler: Arc<dyn FrameHandler>,
    max_package_size: usize,
    read_buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(read_buffer_size);
    loop {
        loop {
            match NetworkMessage::split_frame(&mut buffer, max_package_size) {
                Ok(Some(body)) => {
                    channel.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                    handler.on_frame(&channel, body);
                }
                Ok(None) => break,
                Err(e) => {
                    // the stream is out of sync, nothing after this can be trusted
                    warn!(channel = channel.id, error = %e, "bad frame boundary, closing channel");
                    channel.close();
                    return;
                }
            }
        }

        tokio::select! {
            _ = channel.closed.cancelled() => return,
            result = reader.read_buf(&mut buffer) => match result {
                Ok(0) => {
                    if buffer.is_empty() {
                        trace!(channel = channel.id, "peer closed the connection");
                    } else {
                        debug!(
                            channel = channel.id,
                            pending = buffer.len(),
                            "connection reset by peer in the middle of a frame"
                        );
                    }
                    channel.close();
                    return;
                }
                Ok(read) => {
                    channel.stats.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    debug!(channel = channel.id, error = %e, "read failed, closing channel");
                    channel.close();
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Records every slice written, accepting at most `max_accept` bytes per call.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingWriter {
        pub slices: Arc<Mutex<Vec<Vec<u8>>>>,
        pub blocked: Arc<std::sync::atomic::AtomicBool>,
        pub max_accept: usize,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.blocked.load(Ordering::SeqCst) {
                return Poll::Pending;
            }
            let accepted = if self.max_accept == 0 {
                buf.len()
            } else {
                buf.len().min(self.max_accept)
            };
            self.slices.lock().push(buf[..accepted].to_vec());
            Poll::Ready(Ok(accepted))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Default)]
    pub(crate) struct CollectingHandler {
        pub bodies: Mutex<Vec<Bytes>>,
    }

    impl FrameHandler for CollectingHandler {
        fn on_frame(&self, _channel: &Arc<Channel>, body: Bytes) {
            self.bodies.lock().push(body);
        }
    }

    pub(crate) fn test_address(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// A channel whose reads come from the returned duplex end and whose writes
    /// land in `writer`.
    pub(crate) fn recording_channel(
        writer: RecordingWriter,
        chunk_size: usize,
        handler: Arc<dyn FrameHandler>,
    ) -> (Arc<Channel>, DuplexStream) {
        let (peer, reader) = tokio::io::duplex(64 * 1024);
        let options = ChannelOptions {
            chunk_size,
            ..ChannelOptions::default()
        };
        let channel = Channel::spawn(
            1,
            test_address(1000),
            test_address(2000),
            false,
            reader,
            writer,
            &options,
            handler,
        );
        (channel, peer)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_completions_follow_queue_order() {
        let writer = RecordingWriter {
            max_accept: 3,
            ..Default::default()
        };
        let (channel, _peer) =
            recording_channel(writer.clone(), 4, Arc::new(CollectingHandler::default()));

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20usize {
            let order = order.clone();
            let payload = Bytes::from(vec![i as u8; i % 7]);
            channel.send(
                payload,
                Box::new(move |result| {
                    assert!(result.is_ok());
                    order.lock().push(i);
                }),
            );
        }

        wait_until(|| order.lock().len() == 20).await;
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
        let written: usize = writer.slices.lock().iter().map(Vec::len).sum();
        assert_eq!(written, (0..20).map(|i| i % 7).sum::<usize>());
        // zero length buffers complete without touching the socket
        wait_until(|| channel.stats().writes_completed() == 20 - 3).await;
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let writer = RecordingWriter::default();
        let (channel, _peer) =
            recording_channel(writer.clone(), 1024, Arc::new(CollectingHandler::default()));

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        channel.write(Bytes::from(payload.clone())).await.unwrap();

        let slices = writer.slices.lock().clone();
        assert_eq!(slices.len(), 5);
        assert!(slices.iter().all(|s| s.len() <= 1024));
        assert_eq!(slices.concat(), payload);
    }

    #[tokio::test]
    async fn test_close_fails_queued_writes() {
        let writer = RecordingWriter::default();
        writer.blocked.store(true, Ordering::SeqCst);
        let (channel, _peer) =
            recording_channel(writer.clone(), 1024, Arc::new(CollectingHandler::default()));

        let results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..5 {
            let results = results.clone();
            channel.send(
                Bytes::from_static(b"queued"),
                Box::new(move |result| results.lock().push(result)),
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(results.lock().is_empty());

        channel.close();
        wait_until(|| results.lock().len() == 5).await;
        assert!(results
            .lock()
            .iter()
            .all(|r| matches!(r, Err(AppError::ChannelClosed(_)))));
        assert!(writer.slices.lock().is_empty());

        // writes after close fail right away
        let result = channel.write(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(AppError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_close_listener_fires_once_even_when_added_late() {
        let (channel, _peer) = recording_channel(
            RecordingWriter::default(),
            1024,
            Arc::new(CollectingHandler::default()),
        );
        let fired = Arc::new(AtomicU64::new(0));

        let counter = fired.clone();
        channel.add_close_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.close();
        channel.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let counter = fired.clone();
        channel.add_close_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(!channel.is_open());
        assert_eq!(channel.state(), ChannelState::Inactive);
    }

    #[tokio::test]
    async fn test_reader_delivers_frames_and_closes_on_eof() {
        let handler = Arc::new(CollectingHandler::default());
        let (channel, mut peer) =
            recording_channel(RecordingWriter::default(), 1024, handler.clone());

        let frame = NetworkMessage::request(9, "ping", BTreeMap::new(), Bytes::from_static(b"x"))
            .encode()
            .unwrap();
        // deliver the frame in two pieces
        peer.write_all(&frame[..5]).await.unwrap();
        peer.write_all(&frame[5..]).await.unwrap();
        wait_until(|| handler.bodies.lock().len() == 1).await;

        let body = handler.bodies.lock()[0].clone();
        let decoded = NetworkMessage::decode(body).unwrap();
        assert_eq!(decoded.request_id, 9);
        assert_eq!(channel.stats().frames_read(), 1);

        drop(peer);
        tokio::time::timeout(Duration::from_secs(1), channel.closed())
            .await
            .unwrap();
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_channel() {
        let handler = Arc::new(CollectingHandler::default());
        let (peer, reader) = tokio::io::duplex(1024);
        let options = ChannelOptions {
            max_package_size: 64,
            ..ChannelOptions::default()
        };
        let channel = Channel::spawn(
            2,
            test_address(1),
            test_address(2),
            true,
            reader,
            RecordingWriter::default(),
            &options,
            handler.clone(),
        );

        let mut peer = peer;
        peer.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), channel.closed())
            .await
            .unwrap();
        assert!(handler.bodies.lock().is_empty());
        assert!(channel.is_server());
    }
}
