//! wirebit - BitTorrent peer wire protocol core
//!
//! This library implements the per-connection half of a BitTorrent client:
//! the framed peer wire protocol (BEP-3 base message set), the per-peer
//! choke/interest state machine, block request pipelining, and availability
//! bookkeeping.
//!
//! # Modules
//!
//! - [`peer`] - Peer wire codec, peer exchange, and the sharing-peer state
//!   machine
//! - [`torrent`] - Collaborator traits through which the enclosing client
//!   provides piece data and validation
//!
//! Everything above the single connection (trackers, metainfo, piece
//! selection, hashing, disk storage, and the swarm-level choking algorithm)
//! is the enclosing client's concern. It consumes this crate through
//! [`peer::SharingPeer`] and observes it through
//! [`peer::PeerActivityListener`].

pub mod peer;
pub mod torrent;

pub use peer::{
    Bitfield, BlockRequest, ExchangeState, Handshake, Message, MessageId, PeerActivityListener,
    PeerError, PeerExchange, PeerId, PeerInfo, Rate, SharingPeer,
};
pub use torrent::{PieceHandle, Torrent};
