use super::bitfield::Bitfield;
use super::error::PeerError;
use crate::torrent::Torrent;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Default block request size (16KB).
pub const DEFAULT_REQUEST_SIZE: u32 = 16384;
/// Max block request size (128KB). Peers asking for more are cut off.
pub const MAX_REQUEST_SIZE: u32 = 131072;

/// Message type identifiers in the peer wire protocol.
///
/// Each message (except KeepAlive) has a one-byte ID following the length
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    /// Stop sending data to the peer.
    Choke = 0,
    /// Ready to send data to the peer.
    Unchoke = 1,
    /// Want data from the peer.
    Interested = 2,
    /// Don't want data from the peer.
    NotInterested = 3,
    /// Announce a newly-acquired piece.
    Have = 4,
    /// Announce all available pieces.
    Bitfield = 5,
    /// Request a data block.
    Request = 6,
    /// Send piece data.
    Piece = 7,
    /// Cancel a pending request.
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(PeerError::UnknownType(value)),
        }
    }
}

/// The BitTorrent handshake message.
///
/// The handshake is the first message exchanged between peers and includes:
/// - Protocol identifier ("BitTorrent protocol")
/// - Reserved bytes (8 bytes, all zero; no extensions are announced)
/// - Info hash (20 bytes, identifies the torrent)
/// - Peer ID (20 bytes, identifies the client)
///
/// The peer wire core is bound to a socket only after the handshake has
/// been exchanged; see [`initiate_handshake`](super::initiate_handshake)
/// and [`respond_handshake`](super::respond_handshake).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// The torrent's info hash.
    pub info_hash: [u8; 20],
    /// The sender's peer ID.
    pub peer_id: [u8; 20],
    /// Reserved bytes for protocol extensions.
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Creates a new handshake with no extensions announced.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: [0u8; 8],
        }
    }

    /// Encodes the handshake to bytes for transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }

        if data[0] != 19 || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// An outstanding block request, as kept in the download pipeline.
///
/// Mirrors the payload of a REQUEST message and converts back into one, or
/// into the CANCEL that rescinds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    /// The piece index.
    pub piece: u32,
    /// Byte offset within the piece.
    pub offset: u32,
    /// Length of the block in bytes.
    pub length: u32,
}

impl BlockRequest {
    /// Creates a new block request.
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    /// The REQUEST message for this block.
    pub fn to_request(self) -> Message {
        Message::Request {
            piece: self.piece,
            offset: self.offset,
            length: self.length,
        }
    }

    /// The CANCEL message rescinding this block.
    pub fn to_cancel(self) -> Message {
        Message::Cancel {
            piece: self.piece,
            offset: self.offset,
            length: self.length,
        }
    }
}

/// A peer wire protocol message.
///
/// Messages are length-prefixed: a 4-byte big-endian length followed by
/// a 1-byte message ID (except KeepAlive which has length 0) and payload.
///
/// # Examples
///
/// ```
/// use wirebit::peer::Message;
///
/// // Create a request for piece 0, offset 0, 16KB
/// let request = Message::Request {
///     piece: 0,
///     offset: 0,
///     length: 16384,
/// };
///
/// // Encode to bytes
/// let bytes = request.encode();
/// assert_eq!(bytes.len(), 17); // 4-byte length + 1-byte ID + 12-byte payload
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Empty message to keep the connection alive.
    KeepAlive,
    /// We are choking the peer (not sending data).
    Choke,
    /// We are unchoking the peer (ready to send data).
    Unchoke,
    /// We are interested in the peer's data.
    Interested,
    /// We are not interested in the peer's data.
    NotInterested,
    /// Announce that we have a piece.
    Have { piece: u32 },
    /// Bitfield of all pieces we have.
    Bitfield(Bitfield),
    /// Request a block of data.
    Request { piece: u32, offset: u32, length: u32 },
    /// Send piece data.
    Piece { piece: u32, offset: u32, data: Bytes },
    /// Cancel a pending request.
    Cancel { piece: u32, offset: u32, length: u32 },
}

impl Message {
    /// Encodes the message to bytes for transmission.
    ///
    /// The output includes the 4-byte length prefix. All integer fields are
    /// big-endian.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.as_bytes().len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits.as_bytes());
            }
            Message::Request {
                piece,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            Message::Piece {
                piece,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            Message::Cancel {
                piece,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
        }

        buf.freeze()
    }

    /// Decodes a framed message, length prefix included.
    ///
    /// This is the structural half of parsing: the frame's declared length
    /// must match its contents exactly and the payload must be long enough
    /// for its message type. Torrent-relative checks live in
    /// [`validate`](Self::validate).
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::MalformedFrame("truncated length prefix".into()));
        }

        let length = data.get_u32() as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        if data.remaining() != length {
            return Err(PeerError::MalformedFrame(format!(
                "declared {} bytes, got {}",
                length,
                data.remaining()
            )));
        }

        let id = MessageId::try_from(data.get_u8())?;

        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                if data.remaining() < 4 {
                    return Err(PeerError::MalformedFrame("have too short".into()));
                }
                Ok(Message::Have {
                    piece: data.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(Bitfield::from_bytes(
                &data.copy_to_bytes(length - 1),
            ))),
            MessageId::Request => {
                if data.remaining() < 12 {
                    return Err(PeerError::MalformedFrame("request too short".into()));
                }
                Ok(Message::Request {
                    piece: data.get_u32(),
                    offset: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Piece => {
                if data.remaining() < 8 {
                    return Err(PeerError::MalformedFrame("piece too short".into()));
                }
                let piece = data.get_u32();
                let offset = data.get_u32();
                let block = data.copy_to_bytes(length - 9);
                Ok(Message::Piece {
                    piece,
                    offset,
                    data: block,
                })
            }
            MessageId::Cancel => {
                if data.remaining() < 12 {
                    return Err(PeerError::MalformedFrame("cancel too short".into()));
                }
                Ok(Message::Cancel {
                    piece: data.get_u32(),
                    offset: data.get_u32(),
                    length: data.get_u32(),
                })
            }
        }
    }

    /// Validates the message against the torrent it arrived on.
    ///
    /// Piece indices must exist, block ranges must fall inside their piece,
    /// and a bitfield must not claim pieces past the end of the torrent.
    pub fn validate(&self, torrent: &dyn Torrent) -> Result<(), PeerError> {
        let piece_count = torrent.piece_count();

        match self {
            Message::Have { piece } => {
                if *piece >= piece_count {
                    return Err(PeerError::SemanticInvalid("have"));
                }
            }
            Message::Bitfield(bits) => {
                if let Some(highest) = bits.highest_set_bit() {
                    if highest >= piece_count as usize {
                        return Err(PeerError::SemanticInvalid("bitfield"));
                    }
                }
            }
            Message::Request {
                piece,
                offset,
                length,
            } => {
                if !block_in_piece(torrent, *piece, *offset, *length) {
                    return Err(PeerError::SemanticInvalid("request"));
                }
            }
            Message::Piece {
                piece,
                offset,
                data,
            } => {
                if !block_in_piece(torrent, *piece, *offset, data.len() as u32) {
                    return Err(PeerError::SemanticInvalid("piece"));
                }
            }
            Message::Cancel {
                piece,
                offset,
                length,
            } => {
                if !block_in_piece(torrent, *piece, *offset, *length) {
                    return Err(PeerError::SemanticInvalid("cancel"));
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// The wire identifier for this message, if it has one.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
        }
    }
}

// True if the block range lies inside an existing piece. Widened to u64 so
// offset + length cannot wrap.
fn block_in_piece(torrent: &dyn Torrent, piece: u32, offset: u32, length: u32) -> bool {
    piece < torrent.piece_count()
        && offset as u64 + length as u64 <= torrent.piece(piece).size() as u64
}
