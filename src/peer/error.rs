use thiserror::Error;

/// Errors that can occur during peer communication.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// A frame whose contents don't match its declared length, or a payload
    /// too short for its message type.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Received a message with an unknown type byte.
    #[error("unknown message type: {0}")]
    UnknownType(u8),

    /// A structurally valid message that doesn't make sense for this
    /// torrent, such as a piece index past the end.
    #[error("{0} message failed torrent validation")]
    SemanticInvalid(&'static str),

    /// The peer broke a protocol rule, e.g. requested a block while choked.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer went silent past the read deadline.
    #[error("timeout")]
    Timeout,

    /// `bind` was called on a peer that already has a live exchange.
    #[error("peer is already bound")]
    AlreadyBound,

    /// `download_piece` was called while a piece is still assigned.
    #[error("piece download already in progress")]
    AlreadyDownloading,
}
