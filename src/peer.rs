//! Peer wire protocol (BEP-3)
//!
//! This module implements the BitTorrent peer wire protocol for a single
//! connection: message framing and parsing, the peer exchange that owns the
//! socket, and the sharing-peer state machine that tracks the four
//! choke/interest flags, the remote availability bitfield, and the block
//! request pipeline.

mod bitfield;
mod error;
mod exchange;
mod message;
mod peer_id;
mod rate;
mod sharing;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use exchange::{
    initiate_handshake, respond_handshake, ExchangeState, PeerExchange, HANDSHAKE_TIMEOUT,
    KEEPALIVE_INTERVAL, READ_TIMEOUT,
};
pub use message::{
    BlockRequest, Handshake, Message, MessageId, DEFAULT_REQUEST_SIZE, MAX_REQUEST_SIZE,
};
pub use peer_id::{PeerId, PeerInfo};
pub use rate::{Rate, RATE_WINDOW};
pub use sharing::{PeerActivityListener, SharingPeer, MAX_PIPELINED_REQUESTS};
