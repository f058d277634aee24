use bytes::Bytes;

/// A bitfield representing which pieces a peer has.
///
/// Each bit represents whether a piece is available (1) or not (0).
/// Bits are numbered from the high bit of the first byte, matching the
/// BITFIELD wire encoding.
///
/// Equality compares the set of set bits: two bitfields that differ only in
/// trailing padding are equal, so a field survives a trip over the wire
/// unchanged even though the wire rounds its width up to whole bytes.
#[derive(Debug, Clone)]
pub struct Bitfield {
    bits: Vec<u8>,
    bit_len: usize,
}

impl PartialEq for Bitfield {
    fn eq(&self, other: &Self) -> bool {
        let longest = self.bits.len().max(other.bits.len());
        (0..longest).all(|i| {
            self.bits.get(i).copied().unwrap_or(0) == other.bits.get(i).copied().unwrap_or(0)
        })
    }
}

impl Eq for Bitfield {}

impl Bitfield {
    /// Creates a new empty bitfield addressing `bit_len` bits.
    pub fn new(bit_len: usize) -> Self {
        Self {
            bits: vec![0; bit_len.div_ceil(8)],
            bit_len,
        }
    }

    /// Creates a bitfield from raw wire bytes.
    ///
    /// The result addresses every bit of the payload, including any padding
    /// bits in the final byte; validation against the torrent's piece count
    /// happens at the codec layer, and [`resize`](Self::resize) conforms the
    /// field afterwards.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bits: bytes.to_vec(),
            bit_len: bytes.len() * 8,
        }
    }

    /// Returns true if the bit at `index` is set.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.bit_len {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Sets the bit at `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index >= self.bit_len {
            return;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
    }

    /// Clears the bit at `index`. Out-of-range indices are ignored.
    pub fn clear(&mut self, index: usize) {
        if index >= self.bit_len {
            return;
        }
        self.bits[index / 8] &= !(1 << (7 - index % 8));
    }

    /// Returns the number of set bits.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns the number of addressable bits.
    pub fn len(&self) -> usize {
        self.bit_len
    }

    /// Returns true if no bits are set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Returns the index of the first set bit at or after `from`.
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        (from..self.bit_len).find(|&i| self.has(i))
    }

    /// Returns the index of the highest set bit.
    pub fn highest_set_bit(&self) -> Option<usize> {
        for (byte_index, &byte) in self.bits.iter().enumerate().rev() {
            if byte != 0 {
                // under MSB-first numbering the highest index within a byte
                // is its lowest set physical bit
                return Some(byte_index * 8 + (7 - byte.trailing_zeros() as usize));
            }
        }
        None
    }

    /// Shrinks or grows the addressable range to `bit_len` bits.
    ///
    /// Shrinking masks off any set bits past the new end.
    pub fn resize(&mut self, bit_len: usize) {
        self.bit_len = bit_len;
        self.bits.resize(bit_len.div_ceil(8), 0);
        self.mask_spare_bits();
    }

    /// Returns the raw bytes of the bitfield.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Converts the bitfield to owned bytes for the wire.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    // Clears bits in the last byte past bit_len.
    fn mask_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.bit_len;
        if spare > 0 && !self.bits.is_empty() {
            let mask = 0xFFu8 << spare;
            let last = self.bits.len() - 1;
            self.bits[last] &= mask;
        }
    }
}
