use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::exchange::{ExchangeState, MessageSink, PeerExchange};
use super::message::{BlockRequest, Message, DEFAULT_REQUEST_SIZE, MAX_REQUEST_SIZE};
use super::peer_id::PeerInfo;
use super::rate::Rate;
use crate::torrent::{PieceHandle, Torrent};

/// Maximum number of block requests kept in flight per peer.
pub const MAX_PIPELINED_REQUESTS: usize = 5;

/// Observes the activity of a [`SharingPeer`].
///
/// All methods default to no-ops so implementors only override what they
/// need. Callbacks are dispatched on whichever task drove the state change
/// (usually the connection's reader task), after the peer's internal lock
/// has been released, so a listener may call back into the peer, e.g.
/// calling [`SharingPeer::download_piece`] from [`peer_ready`]. Callbacks
/// must not block; heavy work belongs on another task.
///
/// [`peer_ready`]: PeerActivityListener::peer_ready
pub trait PeerActivityListener: Send + Sync {
    /// The peer choked us; our outstanding requests are void.
    fn peer_choked(&self, _peer: &SharingPeer) {}

    /// The peer unchoked us, or finished a piece: it is ready to be
    /// assigned a piece to download.
    fn peer_ready(&self, _peer: &SharingPeer) {}

    /// The peer announced one newly available piece.
    fn piece_availability(&self, _peer: &SharingPeer, _piece: u32) {}

    /// The peer announced its full bitfield.
    fn bitfield_availability(&self, _peer: &SharingPeer, _bitfield: &Bitfield) {}

    /// We finished uploading a piece's final block to the peer.
    fn piece_sent(&self, _peer: &SharingPeer, _piece: u32) {}

    /// A piece we were downloading from the peer is complete.
    fn piece_completed(&self, _peer: &SharingPeer, _piece: u32) {}

    /// The connection to the peer was torn down.
    fn peer_disconnected(&self, _peer: &SharingPeer) {}

    /// An I/O or protocol error surfaced on the connection or the upload
    /// path.
    fn io_error(&self, _peer: &SharingPeer, _err: &PeerError) {}
}

// Events accumulated under the state lock, dispatched in order after it is
// released.
enum PeerEvent {
    Choked,
    Ready,
    PieceAvailable(u32),
    BitfieldAvailable(Bitfield),
    PieceSent(u32),
    PieceCompleted(u32),
    Disconnected,
    IoError(PeerError),
}

// Everything guarded by the per-peer mutex.
struct PeerCore {
    choking: bool,
    interesting: bool,
    choked: bool,
    interested: bool,
    requested_piece: Option<Arc<dyn PieceHandle>>,
    last_requested_offset: u32,
    requests: VecDeque<BlockRequest>,
    exchange: Option<PeerExchange>,
    // a BITFIELD is only legal before any other message on a connection
    saw_message: bool,
}

/// A peer exchanging on a torrent with us.
///
/// Tracks the four crucial attributes of the relationship:
///
/// - `choking`: we refuse to upload to this peer right now;
/// - `interesting`: we want a piece this peer has;
/// - `choked`: this peer refuses to serve us right now;
/// - `interested`: this peer wants a piece we have.
///
/// Peers start choked, choking, and neither interested nor interesting.
///
/// A peer also carries the bitfield of pieces the remote claims to have,
/// the piece currently assigned for download with its pipeline of
/// outstanding block requests, and throughput meters for both directions.
/// All operations are atomic with respect to each other and to
/// [`handle_message`](Self::handle_message).
pub struct SharingPeer {
    info: PeerInfo,
    torrent: Arc<dyn Torrent>,
    core: Mutex<PeerCore>,
    // read by the piece picker on other tasks, so it gets its own lock
    available: Mutex<Bitfield>,
    download: Rate,
    upload: Rate,
    listeners: RwLock<Vec<Arc<dyn PeerActivityListener>>>,
}

impl SharingPeer {
    /// Creates a new sharing peer on the given torrent.
    pub fn new(info: PeerInfo, torrent: Arc<dyn Torrent>) -> Arc<Self> {
        let piece_count = torrent.piece_count() as usize;
        Arc::new(Self {
            info,
            torrent,
            core: Mutex::new(PeerCore {
                choking: true,
                interesting: false,
                choked: true,
                interested: false,
                requested_piece: None,
                last_requested_offset: 0,
                requests: VecDeque::with_capacity(MAX_PIPELINED_REQUESTS),
                exchange: None,
                saw_message: false,
            }),
            available: Mutex::new(Bitfield::new(piece_count)),
            download: Rate::new(),
            upload: Rate::new(),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Registers a listener for this peer's activity events.
    pub fn register(&self, listener: Arc<dyn PeerActivityListener>) {
        self.listeners.write().push(listener);
    }

    /// The peer's identity.
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Binds a connected, post-handshake socket to this peer.
    ///
    /// Starts a new peer exchange on the socket and resets the rate meters.
    /// The availability bitfield is intentionally kept across reconnects.
    pub fn bind(self: &Arc<Self>, socket: TcpStream) -> Result<(), PeerError> {
        let mut core = self.core.lock();
        if core.exchange.as_ref().is_some_and(|x| x.is_connected()) {
            return Err(PeerError::AlreadyBound);
        }

        let sink = Arc::clone(self) as Arc<dyn MessageSink>;
        core.exchange = Some(PeerExchange::spawn(socket, Arc::clone(&self.torrent), sink));
        core.saw_message = false;

        self.download.reset();
        self.upload.reset();

        debug!("bound connection to peer {}", self.info);
        Ok(())
    }

    /// Tells whether this peer has an active, connected exchange.
    pub fn is_bound(&self) -> bool {
        self.core
            .lock()
            .exchange
            .as_ref()
            .is_some_and(|x| x.is_connected())
    }

    /// Lifecycle state of the current exchange, if one is installed.
    pub fn exchange_state(&self) -> Option<ExchangeState> {
        self.core.lock().exchange.as_ref().map(|x| x.state())
    }

    /// Unbinds and disconnects this peer.
    ///
    /// Unless `force` is set, outstanding requests are cancelled and a
    /// NOT_INTERESTED is queued before the exchange drains and closes; with
    /// `force` the exchange is torn down on the spot and pending writes are
    /// dropped. Fires the disconnect event either way.
    pub fn unbind(&self, force: bool) {
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            self.unbind_locked(&mut core, force, &mut events);
        }
        self.dispatch(events);
    }

    fn unbind_locked(&self, core: &mut PeerCore, force: bool, events: &mut Vec<PeerEvent>) {
        if !force {
            self.cancel_pending_locked(core);
            self.send_locked(core, Message::NotInterested);
        }

        if let Some(exchange) = core.exchange.take() {
            if force {
                exchange.terminate();
            } else {
                exchange.close();
            }
        }

        core.requested_piece = None;
        core.requests.clear();
        core.last_requested_offset = 0;

        events.push(PeerEvent::Disconnected);
    }

    /// Sends a message to the peer. Silent no-op while unbound.
    pub fn send(&self, message: Message) {
        let core = self.core.lock();
        self.send_locked(&core, message);
    }

    fn send_locked(&self, core: &PeerCore, message: Message) {
        if let Some(exchange) = &core.exchange {
            exchange.send(message);
        }
    }

    /// Chokes this peer: we stop uploading to it. Idempotent on the wire.
    pub fn choke(&self) {
        let mut core = self.core.lock();
        if !core.choking {
            trace!("choking {}", self.info);
            self.send_locked(&core, Message::Choke);
            core.choking = true;
        }
    }

    /// Unchokes this peer: we are willing to upload to it again.
    pub fn unchoke(&self) {
        let mut core = self.core.lock();
        if core.choking {
            trace!("unchoking {}", self.info);
            self.send_locked(&core, Message::Unchoke);
            core.choking = false;
        }
    }

    /// Tells the peer we want a piece it has. Idempotent on the wire.
    pub fn interesting(&self) {
        let mut core = self.core.lock();
        if !core.interesting {
            trace!("telling {} we're interested", self.info);
            self.send_locked(&core, Message::Interested);
            core.interesting = true;
        }
    }

    /// Tells the peer we no longer want anything it has.
    pub fn not_interesting(&self) {
        let mut core = self.core.lock();
        if core.interesting {
            trace!("telling {} we're no longer interested", self.info);
            self.send_locked(&core, Message::NotInterested);
            core.interesting = false;
        }
    }

    pub fn is_choking(&self) -> bool {
        self.core.lock().choking
    }

    pub fn is_interesting(&self) -> bool {
        self.core.lock().interesting
    }

    pub fn is_choked(&self) -> bool {
        self.core.lock().choked
    }

    pub fn is_interested(&self) -> bool {
        self.core.lock().interested
    }

    /// A snapshot of the pieces this peer claims to have.
    pub fn available_pieces(&self) -> Bitfield {
        self.available.lock().clone()
    }

    /// Tells whether this peer has every piece of the torrent.
    pub fn is_seed(&self) -> bool {
        let piece_count = self.torrent.piece_count() as usize;
        piece_count > 0 && self.available.lock().count() == piece_count
    }

    /// The piece currently assigned for download from this peer, if any.
    pub fn requested_piece(&self) -> Option<Arc<dyn PieceHandle>> {
        self.core.lock().requested_piece.clone()
    }

    /// Tells whether block requests are outstanding on this peer.
    pub fn is_downloading(&self) -> bool {
        !self.core.lock().requests.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn outstanding_requests(&self) -> Vec<BlockRequest> {
        self.core.lock().requests.iter().copied().collect()
    }

    /// Download throughput from this peer.
    pub fn download_rate(&self) -> &Rate {
        &self.download
    }

    /// Upload throughput to this peer.
    pub fn upload_rate(&self) -> &Rate {
        &self.upload
    }

    /// Orders peers by download rate, ascending. Ties break by meter
    /// identity so sorting sees a strict weak order.
    pub fn cmp_download_rate(a: &Self, b: &Self) -> Ordering {
        Rate::compare(&a.download, &b.download)
    }

    /// Orders peers by upload rate, ascending.
    pub fn cmp_upload_rate(a: &Self, b: &Self) -> Ordering {
        Rate::compare(&a.upload, &b.upload)
    }

    /// Starts downloading the given piece from this peer.
    ///
    /// Fills the request pipeline up to [`MAX_PIPELINED_REQUESTS`] block
    /// requests; the pipeline refills as blocks come back. Fails with
    /// [`PeerError::AlreadyDownloading`] while a piece is still assigned.
    pub fn download_piece(&self, piece: Arc<dyn PieceHandle>) -> Result<(), PeerError> {
        let mut core = self.core.lock();
        if core.requested_piece.is_some() {
            warn!("{} already has a piece assigned", self.info);
            return Err(PeerError::AlreadyDownloading);
        }

        core.requests.clear();
        core.requested_piece = Some(piece);
        core.last_requested_offset = 0;
        self.request_next_blocks(&mut core);
        Ok(())
    }

    // Refills the pipeline with block requests for the assigned piece.
    fn request_next_blocks(&self, core: &mut PeerCore) {
        let Some(piece) = core.requested_piece.clone() else {
            return;
        };

        while core.requests.len() < MAX_PIPELINED_REQUESTS
            && core.last_requested_offset < piece.size()
        {
            let length = DEFAULT_REQUEST_SIZE.min(piece.size() - core.last_requested_offset);
            let request = BlockRequest::new(piece.index(), core.last_requested_offset, length);
            core.requests.push_back(request);
            self.send_locked(core, request.to_request());
            core.last_requested_offset += length;
        }
    }

    /// Cancels every outstanding block request.
    ///
    /// Queues a CANCEL mirroring each request, in request order, and
    /// returns the cancelled set so the caller can reassign the blocks.
    /// The assigned piece itself stays in place.
    pub fn cancel_pending_requests(&self) -> Vec<BlockRequest> {
        let mut core = self.core.lock();
        self.cancel_pending_locked(&mut core)
    }

    fn cancel_pending_locked(&self, core: &mut PeerCore) -> Vec<BlockRequest> {
        let cancelled: Vec<BlockRequest> = core.requests.drain(..).collect();
        for request in &cancelled {
            self.send_locked(core, request.to_cancel());
        }
        cancelled
    }

    // A protocol violation costs the peer its connection.
    fn protocol_violation(
        &self,
        core: &mut PeerCore,
        rule: &'static str,
        events: &mut Vec<PeerEvent>,
    ) {
        let violation = PeerError::ProtocolViolation(rule);
        warn!("peer {}: {}, terminating exchange", self.info, violation);
        self.unbind_locked(core, true, events);
    }

    /// Handles one incoming, already validated message from this peer.
    ///
    /// Normally invoked by the exchange's reader task; exposed so the state
    /// machine can be driven directly.
    pub fn handle_message(&self, message: Message) {
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            self.handle_message_locked(&mut core, message, &mut events);
        }
        self.dispatch(events);
    }

    fn handle_message_locked(
        &self,
        core: &mut PeerCore,
        message: Message,
        events: &mut Vec<PeerEvent>,
    ) {
        let first_message = !core.saw_message;
        if !matches!(message, Message::KeepAlive) {
            core.saw_message = true;
        }

        match message {
            Message::KeepAlive => {
                // nothing to do, we're keeping the connection open anyways
            }
            Message::Choke => {
                core.choked = true;
                events.push(PeerEvent::Choked);
                // the remote drops what we had in flight; mirror explicit
                // cancels so both ends agree on the pipeline
                self.cancel_pending_locked(core);
            }
            Message::Unchoke => {
                core.choked = false;
                trace!("peer {} is now accepting requests", self.info);
                events.push(PeerEvent::Ready);
            }
            Message::Interested => core.interested = true,
            Message::NotInterested => core.interested = false,
            Message::Have { piece } => {
                let mut available = self.available.lock();
                if (piece as usize) < available.len() && !available.has(piece as usize) {
                    available.set(piece as usize);
                    trace!(
                        "peer {} now has piece {} [{}/{}]",
                        self.info,
                        piece,
                        available.count(),
                        self.torrent.piece_count()
                    );
                    drop(available);
                    events.push(PeerEvent::PieceAvailable(piece));
                }
            }
            Message::Bitfield(mut bitfield) => {
                if !first_message {
                    self.protocol_violation(
                        core,
                        "sent a bitfield after the availability exchange",
                        events,
                    );
                    return;
                }

                bitfield.resize(self.torrent.piece_count() as usize);
                {
                    let mut available = self.available.lock();
                    *available = bitfield.clone();
                    trace!(
                        "recorded bitfield from {} with {}/{} piece(s)",
                        self.info,
                        available.count(),
                        self.torrent.piece_count()
                    );
                }
                events.push(PeerEvent::BitfieldAvailable(bitfield));
            }
            Message::Request {
                piece,
                offset,
                length,
            } => self.handle_request(core, piece, offset, length, events),
            Message::Piece {
                piece,
                offset,
                data,
            } => self.handle_piece(core, piece, offset, data, events),
            Message::Cancel { .. } => {
                // blocks are flushed as soon as the writer dequeues them,
                // so there is nothing left to rescind
            }
        }
    }

    fn handle_request(
        &self,
        core: &mut PeerCore,
        piece: u32,
        offset: u32,
        length: u32,
        events: &mut Vec<PeerEvent>,
    ) {
        if core.choking {
            self.protocol_violation(core, "requested a block while choked", events);
            return;
        }
        if piece >= self.torrent.piece_count() || !self.torrent.piece(piece).is_valid() {
            self.protocol_violation(core, "requested a piece we cannot serve", events);
            return;
        }
        if length > MAX_REQUEST_SIZE {
            self.protocol_violation(core, "requested an oversized block", events);
            return;
        }

        let handle = self.torrent.piece(piece);
        match handle.read(offset, length) {
            Ok(block) => {
                let uploaded = block.len() as u64;
                self.send_locked(
                    core,
                    Message::Piece {
                        piece,
                        offset,
                        data: block,
                    },
                );
                self.upload.add(uploaded);

                if offset as u64 + length as u64 == handle.size() as u64 {
                    events.push(PeerEvent::PieceSent(piece));
                }
            }
            Err(err) => events.push(PeerEvent::IoError(err.into())),
        }
    }

    fn handle_piece(
        &self,
        core: &mut PeerCore,
        piece: u32,
        offset: u32,
        data: Bytes,
        events: &mut Vec<PeerEvent>,
    ) {
        if piece >= self.torrent.piece_count() {
            debug!("ignoring block for nonexistent piece {}", piece);
            return;
        }

        // remove the matching request to make room for the next block;
        // unsolicited blocks are tolerated and simply match nothing
        if let Some(position) = core
            .requests
            .iter()
            .position(|r| r.piece == piece && r.offset == offset)
        {
            core.requests.remove(position);
        }
        self.download.add(data.len() as u64);

        let handle = self.torrent.piece(piece);
        if let Err(err) = handle.record(&data, offset) {
            events.push(PeerEvent::IoError(err.into()));
            return;
        }

        if offset as u64 + data.len() as u64 == handle.size() as u64 {
            // final block: validation happens now, and the peer is free for
            // its next assignment
            handle.validate();
            core.requested_piece = None;
            core.requests.clear();
            core.last_requested_offset = 0;
            events.push(PeerEvent::PieceCompleted(piece));
            events.push(PeerEvent::Ready);
        } else if core.requested_piece.is_some() {
            self.request_next_blocks(core);
        }
    }

    fn dispatch(&self, events: Vec<PeerEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn PeerActivityListener>> = self.listeners.read().clone();
        for event in &events {
            for listener in &listeners {
                match event {
                    PeerEvent::Choked => listener.peer_choked(self),
                    PeerEvent::Ready => listener.peer_ready(self),
                    PeerEvent::PieceAvailable(piece) => listener.piece_availability(self, *piece),
                    PeerEvent::BitfieldAvailable(bitfield) => {
                        listener.bitfield_availability(self, bitfield)
                    }
                    PeerEvent::PieceSent(piece) => listener.piece_sent(self, *piece),
                    PeerEvent::PieceCompleted(piece) => listener.piece_completed(self, *piece),
                    PeerEvent::Disconnected => listener.peer_disconnected(self),
                    PeerEvent::IoError(err) => listener.io_error(self, err),
                }
            }
        }
    }
}

impl MessageSink for SharingPeer {
    fn on_message(&self, msg: Message) {
        self.handle_message(msg);
    }

    fn on_error(&self, err: PeerError) {
        debug!("peer {} connection error: {}", self.info, err);
        self.unbind(true);
        self.dispatch(vec![PeerEvent::IoError(err)]);
    }
}

impl PartialEq for SharingPeer {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info
    }
}

impl Eq for SharingPeer {}

impl fmt::Display for SharingPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_lock keeps Display safe to call from anywhere, at the cost of
        // occasionally omitting the flag summary
        match self.core.try_lock() {
            Some(core) => write!(
                f,
                "{} [{}{}|{}{}]",
                self.info,
                if core.choked { 'C' } else { 'c' },
                if core.interested { 'I' } else { 'i' },
                if core.choking { 'C' } else { 'c' },
                if core.interesting { 'I' } else { 'i' },
            ),
            None => write!(f, "{}", self.info),
        }
    }
}
