use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use crate::torrent::Torrent;

/// How long the outbound queue may sit idle before a KEEP_ALIVE goes out.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
/// A peer silent for longer than this is considered dead.
pub const READ_TIMEOUT: Duration = Duration::from_secs(130);
/// Deadline for either half of the handshake exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames claiming more than this are rejected before allocation (16MB).
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Lifecycle of a peer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Constructed but tasks not yet running.
    New,
    /// Reader and writer are live.
    Connected,
    /// `close()` was called; the writer is draining the outbound queue.
    Closing,
    /// Torn down, either gracefully or by `terminate()`.
    Closed,
    /// The reader hit an I/O or decoding error.
    Errored,
}

/// Receives the exchange's inbound traffic.
///
/// Implemented by the sharing peer; messages are delivered synchronously
/// from the reader task, so the per-connection stream is ordered.
pub(crate) trait MessageSink: Send + Sync {
    fn on_message(&self, msg: Message);
    fn on_error(&self, err: PeerError);
}

/// One connected socket and the pair of tasks exchanging messages on it.
///
/// The exchange owns the socket exclusively. Callers interact with it only
/// through the owning [`SharingPeer`](super::SharingPeer): `send` enqueues
/// onto the writer's FIFO queue and returns immediately, and incoming
/// messages are decoded, validated against the torrent, and handed to the
/// sharing peer one at a time.
pub struct PeerExchange {
    state: Arc<Mutex<ExchangeState>>,
    outbound: Mutex<Option<UnboundedSender<Message>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerExchange {
    /// Takes ownership of a connected, post-handshake socket and starts the
    /// reader and writer tasks.
    pub(crate) fn spawn(
        socket: TcpStream,
        torrent: Arc<dyn Torrent>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let state = Arc::new(Mutex::new(ExchangeState::New));
        let (read_half, write_half) = socket.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        // the tasks must observe Connected from their first poll
        *state.lock() = ExchangeState::Connected;
        let writer = tokio::spawn(write_loop(
            write_half,
            rx,
            Arc::clone(&sink),
            Arc::clone(&state),
        ));
        let reader = tokio::spawn(read_loop(read_half, torrent, sink, Arc::clone(&state)));

        Self {
            state,
            outbound: Mutex::new(Some(tx)),
            reader,
            writer,
        }
    }

    pub fn state(&self) -> ExchangeState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ExchangeState::Connected)
    }

    /// Enqueues a message for the writer. Dropped silently unless the
    /// exchange is connected.
    pub(crate) fn send(&self, msg: Message) {
        if !self.is_connected() {
            return;
        }
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(msg);
        }
    }

    /// Gracefully shuts the exchange down.
    ///
    /// Everything already enqueued is still written before the socket is
    /// shut down; nothing further is read.
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, ExchangeState::New | ExchangeState::Connected) {
                return;
            }
            *state = ExchangeState::Closing;
        }
        debug!("closing peer exchange");
        self.reader.abort();
        // dropping the sender ends the writer loop once the queue is drained
        self.outbound.lock().take();
    }

    /// Abortive teardown. Pending writes are dropped.
    pub(crate) fn terminate(&self) {
        debug!("terminating peer exchange");
        *self.state.lock() = ExchangeState::Closed;
        self.outbound.lock().take();
        self.reader.abort();
        self.writer.abort();
    }
}

async fn write_loop(
    mut socket: OwnedWriteHalf,
    mut queue: UnboundedReceiver<Message>,
    sink: Arc<dyn MessageSink>,
    state: Arc<Mutex<ExchangeState>>,
) {
    loop {
        match timeout(KEEPALIVE_INTERVAL, queue.recv()).await {
            Ok(Some(msg)) => {
                if let Err(err) = socket.write_all(&msg.encode()).await {
                    fail(&state, sink.as_ref(), err.into());
                    break;
                }
            }
            // sender gone and queue drained: graceful close is complete
            Ok(None) => break,
            Err(_) => {
                trace!("outbound queue idle, sending keep-alive");
                if let Err(err) = socket.write_all(&Message::KeepAlive.encode()).await {
                    fail(&state, sink.as_ref(), err.into());
                    break;
                }
            }
        }
    }
    let _ = socket.shutdown().await;

    let mut state = state.lock();
    if matches!(*state, ExchangeState::Closing) {
        *state = ExchangeState::Closed;
    }
}

async fn read_loop(
    mut socket: OwnedReadHalf,
    torrent: Arc<dyn Torrent>,
    sink: Arc<dyn MessageSink>,
    state: Arc<Mutex<ExchangeState>>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        let parsed = match read_frame(&mut socket, &mut buf).await {
            Ok(frame) => Message::decode(frame).and_then(|msg| {
                msg.validate(torrent.as_ref())?;
                Ok(msg)
            }),
            Err(err) => Err(err),
        };

        match parsed {
            Ok(msg) => sink.on_message(msg),
            Err(err) => {
                fail(&state, sink.as_ref(), err);
                return;
            }
        }
    }
}

// Flips the exchange to Errored and surfaces the error, unless we are the
// ones tearing the connection down or the other task already reported one.
fn fail(state: &Mutex<ExchangeState>, sink: &dyn MessageSink, err: PeerError) {
    {
        let mut state = state.lock();
        match *state {
            ExchangeState::Closing | ExchangeState::Closed | ExchangeState::Errored => return,
            _ => *state = ExchangeState::Errored,
        }
    }
    debug!("peer exchange errored: {}", err);
    sink.on_error(err);
}

// Reads one length-prefixed frame, prefix included.
async fn read_frame(socket: &mut OwnedReadHalf, buf: &mut BytesMut) -> Result<Bytes, PeerError> {
    while buf.len() < 4 {
        fill(socket, buf).await?;
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(PeerError::MalformedFrame(format!(
            "message too large: {}",
            length
        )));
    }

    let total = 4 + length;
    while buf.len() < total {
        fill(socket, buf).await?;
    }

    Ok(buf.split_to(total).freeze())
}

async fn fill(socket: &mut OwnedReadHalf, buf: &mut BytesMut) -> Result<(), PeerError> {
    let n = timeout(READ_TIMEOUT, socket.read_buf(buf))
        .await
        .map_err(|_| PeerError::Timeout)??;
    if n == 0 {
        return Err(PeerError::ConnectionClosed);
    }
    Ok(())
}

/// Performs the outgoing half of a connection setup: sends our handshake,
/// reads the peer's, and checks that it is for the same torrent.
///
/// The stream is ready to [`bind`](super::SharingPeer::bind) on success.
pub async fn initiate_handshake(
    socket: &mut TcpStream,
    ours: &Handshake,
) -> Result<Handshake, PeerError> {
    timeout(HANDSHAKE_TIMEOUT, socket.write_all(&ours.encode()))
        .await
        .map_err(|_| PeerError::Timeout)??;
    let theirs = read_handshake(socket).await?;
    if theirs.info_hash != ours.info_hash {
        return Err(PeerError::InfoHashMismatch);
    }
    Ok(theirs)
}

/// The accepting half of a connection setup: reads the peer's handshake
/// first, verifies the info hash, then replies with ours.
pub async fn respond_handshake(
    socket: &mut TcpStream,
    ours: &Handshake,
) -> Result<Handshake, PeerError> {
    let theirs = read_handshake(socket).await?;
    if theirs.info_hash != ours.info_hash {
        return Err(PeerError::InfoHashMismatch);
    }
    timeout(HANDSHAKE_TIMEOUT, socket.write_all(&ours.encode()))
        .await
        .map_err(|_| PeerError::Timeout)??;
    Ok(theirs)
}

async fn read_handshake(socket: &mut TcpStream) -> Result<Handshake, PeerError> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    timeout(HANDSHAKE_TIMEOUT, socket.read_exact(&mut buf))
        .await
        .map_err(|_| PeerError::Timeout)??;
    Handshake::decode(&buf)
}
