// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

//! Incremental packet framing on top of an arbitrary chunked byte stream.

use std::convert::TryFrom;

use crate::header::PacketType;
use crate::{DecodeError, MAX_VAR_INT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Waiting for the first byte, packet type and flags.
    FixedHeader,

    /// Collecting the remaining length variable byte integer.
    RemainingLength,

    /// Collecting the rest of the packet.
    Payload,
}

/// Splits a byte stream into complete control packets.
///
/// Bytes arrive in chunks of any size via [`Self::feed`]; each call to
/// [`Self::next_packet`] hands out the next complete packet, fixed header
/// included, or `None` if more bytes are needed. Decoding of the packet
/// body is left to [`crate::Packet::decode`].
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct PacketReader {
    state: ReadState,
    data: Vec<u8>,

    /// Offset of the first byte of the packet currently being collected.
    start: usize,

    /// Offset of the next byte to examine.
    scan: usize,

    remaining_length: usize,
    shift: usize,

    max_packet_size: usize,
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketReader {
    /// Create a new reader without a packet size cap beyond the variable
    /// byte integer range.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ReadState::FixedHeader,
            data: Vec::new(),
            start: 0,
            scan: 0,
            remaining_length: 0,
            shift: 0,
            max_packet_size: MAX_VAR_INT,
        }
    }

    /// Lower the acceptable packet size, e.g. from a maximum packet size
    /// property announced to the peer.
    pub fn set_max_packet_size(&mut self, max_packet_size: usize) {
        self.max_packet_size = max_packet_size.min(MAX_VAR_INT);
    }

    /// Append a chunk of bytes from the stream.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet handed out as packets.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.data.len() - self.start
    }

    /// Try to extract the next complete packet.
    ///
    /// # Errors
    ///
    /// Returns error if the fixed header is malformed or the packet is
    /// larger than allowed. The reader is unusable afterwards; the caller
    /// is expected to drop the connection.
    pub fn next_packet(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        loop {
            match self.state {
                ReadState::FixedHeader => {
                    let Some(&byte) = self.data.get(self.scan) else {
                        return Ok(None);
                    };
                    // Reject invalid type/flag bytes before buffering the
                    // rest of a broken packet.
                    PacketType::try_from(byte)?;
                    self.scan += 1;
                    self.remaining_length = 0;
                    self.shift = 0;
                    self.state = ReadState::RemainingLength;
                }
                ReadState::RemainingLength => {
                    let Some(&byte) = self.data.get(self.scan) else {
                        return Ok(None);
                    };
                    self.scan += 1;
                    self.remaining_length |= ((byte & 0x7f) as usize) << self.shift;
                    if byte & 0x80 == 0 {
                        let header_bytes = self.scan - self.start;
                        if header_bytes + self.remaining_length > self.max_packet_size {
                            return Err(DecodeError::PacketTooLarge);
                        }
                        self.state = ReadState::Payload;
                    } else {
                        self.shift += 7;
                        // A fifth length byte with the continuation bit set.
                        if self.shift > 21 {
                            return Err(DecodeError::PacketTooLarge);
                        }
                    }
                }
                ReadState::Payload => {
                    if self.data.len() - self.scan < self.remaining_length {
                        return Ok(None);
                    }
                    let end = self.scan + self.remaining_length;
                    let packet = self.data[self.start..end].to_vec();
                    self.start = end;
                    self.scan = end;
                    self.state = ReadState::FixedHeader;
                    self.compact();
                    return Ok(Some(packet));
                }
            }
        }
    }

    /// Drop handed-out bytes once they dominate the buffer.
    fn compact(&mut self) {
        if self.start > 4096 && self.start * 2 > self.data.len() {
            self.data.drain(..self.start);
            self.scan -= self.start;
            self.start = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_packet() {
        let mut reader = PacketReader::new();
        reader.feed(&[0xc0, 0x00]);
        let packet = reader.next_packet().unwrap().unwrap();
        assert_eq!(&packet, &[0xc0, 0x00]);
        assert_eq!(reader.next_packet().unwrap(), None);
    }

    #[test]
    fn test_byte_by_byte() {
        let bytes = [
            0x30, 0x0a, 0x00, 0x03, b'a', b'/', b'b', b'h', b'e', b'l', b'l', b'o',
        ];
        let mut reader = PacketReader::new();
        for (i, byte) in bytes.iter().enumerate() {
            reader.feed(&[*byte]);
            let ret = reader.next_packet().unwrap();
            if i < bytes.len() - 1 {
                assert!(ret.is_none());
            } else {
                assert_eq!(ret.unwrap(), bytes.to_vec());
            }
        }
    }

    #[test]
    fn test_multiple_packets_in_one_chunk() {
        let mut reader = PacketReader::new();
        reader.feed(&[0xc0, 0x00, 0xd0, 0x00, 0xe0, 0x00]);
        assert_eq!(reader.next_packet().unwrap().unwrap(), vec![0xc0, 0x00]);
        assert_eq!(reader.next_packet().unwrap().unwrap(), vec![0xd0, 0x00]);
        assert_eq!(reader.next_packet().unwrap().unwrap(), vec![0xe0, 0x00]);
        assert_eq!(reader.next_packet().unwrap(), None);
    }

    #[test]
    fn test_oversized_length_field() {
        let mut reader = PacketReader::new();
        reader.feed(&[0x30, 0xff, 0xff, 0xff, 0xff, 0x7f]);
        assert_eq!(reader.next_packet(), Err(DecodeError::PacketTooLarge));
    }

    #[test]
    fn test_max_packet_size() {
        let mut reader = PacketReader::new();
        reader.set_max_packet_size(16);
        reader.feed(&[0x30, 0x7f]);
        assert_eq!(reader.next_packet(), Err(DecodeError::PacketTooLarge));
    }

    #[test]
    fn test_invalid_first_byte() {
        let mut reader = PacketReader::new();
        reader.feed(&[0x00, 0x00]);
        assert!(reader.next_packet().is_err());
    }
}
