// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::header::{FixedHeader, Packet, PacketType};
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, VarIntError};

/// Return code in a connect acknowledgement packet.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    #[default]
    Accepted = 0,

    /// The server does not support the level of the MQTT protocol requested
    /// by the client.
    UnacceptedProtocol = 1,

    /// The client identifier is correct UTF-8 but not allowed by the server.
    IdentifierRejected = 2,

    /// The network connection has been made but the MQTT service is unavailable.
    ServerUnavailable = 3,

    /// The data in the user name or password is malformed.
    MalformedUsernamePassword = 4,

    /// The client is not authorized to connect.
    Unauthorized = 5,
}

impl ConnectReturnCode {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptedProtocol),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::MalformedUsernamePassword),
            5 => Ok(Self::Unauthorized),
            _ => Err(DecodeError::InvalidReasonCode),
        }
    }
}

/// `ConnectAckPacket` is sent by the server in response to a connect packet.
///
/// The first packet sent from the server to a client MUST be a connect
/// acknowledgement [MQTT-3.2.0-1].
///
/// ```txt
///  7                  0
/// +--------------------+
/// | Fixed header       |
/// |                    |
/// +--------------------+
/// | Ack flags          |
/// +--------------------+
/// | Return code        |
/// +--------------------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectAckPacket {
    /// Set to true if the server keeps a session state from a previous
    /// connection of this client. Must be false when the return code is
    /// not `Accepted` [MQTT-3.2.2-4].
    session_present: bool,

    return_code: ConnectReturnCode,
}

impl ConnectAckPacket {
    /// Create a new connect ack packet.
    #[must_use]
    pub const fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    /// Update session-present flag.
    pub fn set_session_present(&mut self, present: bool) -> &mut Self {
        self.session_present = present;
        self
    }

    #[must_use]
    pub const fn session_present(&self) -> bool {
        self.session_present
    }

    /// Update return code.
    pub fn set_return_code(&mut self, code: ConnectReturnCode) -> &mut Self {
        self.return_code = code;
        self
    }

    #[must_use]
    pub const fn return_code(&self) -> ConnectReturnCode {
        self.return_code
    }
}

impl DecodePacket for ConnectAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::ConnectAck {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() != 2 {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let ack_flags = ba.read_byte()?;
        // Bits 7-1 are reserved and MUST be set to 0 [MQTT-3.2.2-1].
        if ack_flags & 0b1111_1110 != 0 {
            return Err(DecodeError::InvalidPacketFlags);
        }
        let session_present = ack_flags & 0b0000_0001 == 0b0000_0001;
        let return_code = ConnectReturnCode::try_from(ba.read_byte()?)?;

        Ok(Self {
            session_present,
            return_code,
        })
    }
}

impl EncodePacket for ConnectAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = FixedHeader::new(PacketType::ConnectAck, 2)?;
        fixed_header.encode(buf)?;

        let ack_flags = u8::from(self.session_present);
        buf.push(ack_flags);
        buf.push(self.return_code as u8);

        Ok(buf.len() - old_len)
    }
}

impl Packet for ConnectAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnectAck
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        Ok(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = ConnectAckPacket::new(true, ConnectReturnCode::Accepted);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x20, 0x02, 0x01, 0x00]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(ConnectAckPacket::decode(&mut ba).unwrap(), packet);
    }

    #[test]
    fn test_invalid_return_code() {
        let buf = [0x20, 0x02, 0x00, 0x09];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectAckPacket::decode(&mut ba),
            Err(DecodeError::InvalidReasonCode)
        );
    }
}
