//! Collaborator traits for the torrent being shared.
//!
//! The peer wire core never touches the tracker, the metainfo, or the disk.
//! It only needs to know how many pieces the torrent has and, per piece, how
//! to read a block for upload, record a downloaded block, and trigger
//! validation once a piece is complete. The enclosing client implements
//! these traits on top of its storage layer.

use std::io;
use std::sync::Arc;

use bytes::Bytes;

/// The torrent a peer connection exchanges data on.
pub trait Torrent: Send + Sync {
    /// Total number of pieces in the torrent.
    fn piece_count(&self) -> u32;

    /// Returns a handle for the piece at `index`.
    ///
    /// Callers must pass an index below [`piece_count`](Self::piece_count);
    /// the wire codec validates incoming indices before they reach here.
    fn piece(&self, index: u32) -> Arc<dyn PieceHandle>;
}

/// A single piece of the torrent, treated as opaque storage by the core.
pub trait PieceHandle: Send + Sync {
    /// The piece index within the torrent.
    fn index(&self) -> u32;

    /// Size of this piece in bytes. The last piece of a torrent is usually
    /// shorter than the others.
    fn size(&self) -> u32;

    /// Reads `length` bytes starting at `offset` for upload to a peer.
    fn read(&self, offset: u32, length: u32) -> io::Result<Bytes>;

    /// Records a downloaded block at `offset`.
    fn record(&self, block: &[u8], offset: u32) -> io::Result<()>;

    /// Checks the piece data against its expected hash once all blocks have
    /// been recorded. Returns `true` if the piece is intact.
    fn validate(&self) -> bool;

    /// Returns `true` if the piece has previously been validated and can be
    /// served to peers.
    fn is_valid(&self) -> bool;
}
