// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;
use std::fmt;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, ProtocolLevel, QoS, VarInt,
    VarIntError,
};

/// Common interface of all control packet structs.
pub trait Packet: Send + fmt::Debug {
    fn packet_type(&self) -> PacketType;

    /// Get byte length in packet.
    ///
    /// # Errors
    ///
    /// Returns error if packet size exceeds the variable byte integer range.
    fn bytes(&self) -> Result<usize, VarIntError>;
}

/// Control packet type, with publish flags folded into the `Publish` variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PacketType {
    /// Request to connect to broker
    #[default]
    Connect,

    /// Broker reply to connect request
    ConnectAck,

    /// Publish message
    Publish { dup: bool, qos: QoS, retain: bool },

    /// Publish acknowledgement
    PublishAck,

    /// Publish received
    PublishReceived,

    /// Publish release
    PublishRelease,

    /// Publish complete
    PublishComplete,

    /// Client subscribe request
    Subscribe,

    /// Subscribe acknowledgement
    SubscribeAck,

    /// Unsubscribe request
    Unsubscribe,

    /// Unsubscribe acknowledgement
    UnsubscribeAck,

    /// Client ping request
    PingRequest,

    /// Server ping response
    PingResponse,

    /// Connection is being closed
    Disconnect,

    /// Authentication exchange
    Auth,
}

impl PacketType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        let type_bits = match packet_type {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::PublishReceived => 5,
            PacketType::PublishRelease => 6,
            PacketType::PublishComplete => 7,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Unsubscribe => 10,
            PacketType::UnsubscribeAck => 11,
            PacketType::PingRequest => 12,
            PacketType::PingResponse => 13,
            PacketType::Disconnect => 14,
            PacketType::Auth => 15,
        };

        let flags_bits = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0b0000_0000 };
                let qos = match qos {
                    QoS::AtMostOnce => 0b0000_0000,
                    QoS::AtLeastOnce => 0b0000_0010,
                    QoS::ExactOnce => 0b0000_0100,
                };

                let retain = if retain { 0b0000_0001 } else { 0b0000_0000 };
                dup | qos | retain
            }
            // Bits 3,2,1 and 0 of the fixed header in the PUBREL, SUBSCRIBE
            // and UNSUBSCRIBE packets are reserved and MUST be set to
            // 0,0,1,0 [MQTT-3.6.1-1].
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                0b0000_0010
            }
            _ => 0b0000_0000,
        };
        (type_bits << 4) | flags_bits
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    /// Parse packet type from the first byte of the fixed header.
    ///
    /// Where a flag bit is marked as "Reserved", it MUST be set to the
    /// value listed for that packet type [MQTT-2.2.2-1]. If invalid flags
    /// are received, the receiver MUST close the network connection
    /// [MQTT-2.2.2-2].
    ///
    /// # Errors
    ///
    /// Returns `InvalidPacketFlags` if flag bits are unexpected.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;

        if type_bits == 3 {
            let dup = (flag & 0b0000_1000) == 0b0000_1000;
            let retain = (flag & 0b0000_0001) == 0b0000_0001;
            let qos = match flag & 0b0000_0110 {
                0b0000_0000 => QoS::AtMostOnce,
                0b0000_0010 => QoS::AtLeastOnce,
                0b0000_0100 => QoS::ExactOnce,
                _ => return Err(DecodeError::InvalidQoS),
            };
            return Ok(Self::Publish { dup, retain, qos });
        }

        let (packet_type, expected_flag) = match type_bits {
            1 => (Self::Connect, 0b0000_0000),
            2 => (Self::ConnectAck, 0b0000_0000),
            4 => (Self::PublishAck, 0b0000_0000),
            5 => (Self::PublishReceived, 0b0000_0000),
            6 => (Self::PublishRelease, 0b0000_0010),
            7 => (Self::PublishComplete, 0b0000_0000),
            8 => (Self::Subscribe, 0b0000_0010),
            9 => (Self::SubscribeAck, 0b0000_0000),
            10 => (Self::Unsubscribe, 0b0000_0010),
            11 => (Self::UnsubscribeAck, 0b0000_0000),
            12 => (Self::PingRequest, 0b0000_0000),
            13 => (Self::PingResponse, 0b0000_0000),
            14 => (Self::Disconnect, 0b0000_0000),
            15 => (Self::Auth, 0b0000_0000),
            t => {
                log::error!("header: Invalid type bits: {t:#b}");
                return Err(DecodeError::InvalidPacketType);
            }
        };

        if flag == expected_flag {
            Ok(packet_type)
        } else {
            log::error!("header: Got packet flag {flag:#b} in {packet_type:?}");
            Err(DecodeError::InvalidPacketFlags)
        }
    }
}

/// Fixed header part of a mqtt control packet. It consists of at least two bytes.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-------+-------+
/// | Type  | Flags |
/// +-------+-------+
/// | Remaining Len |
/// +-------+-------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: PacketType,

    /// `Remaining Length` uses variable length encoding method. The 7th bit
    /// in a byte is used to indicate more bytes are following. The maximum
    /// number of bytes in the `Remaining Length` field is 4.
    remaining_length: VarInt,
}

impl FixedHeader {
    /// Create a new fixed header with `packet_type` and `remaining_length`.
    ///
    /// # Errors
    ///
    /// Returns error if `remaining_length` is invalid.
    pub fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, VarIntError> {
        let remaining_length = VarInt::from(remaining_length)?;
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    /// Get byte length in packet.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        PacketType::bytes() + self.remaining_length.bytes()
    }

    /// Check whether this fixed header is valid within specific `protocol_level`.
    ///
    /// Note that `Auth` packet is only available in MQTT 5.0.
    #[must_use]
    pub fn is_valid_header(&self, protocol_level: ProtocolLevel) -> bool {
        !(self.packet_type == PacketType::Auth && protocol_level != ProtocolLevel::V5)
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;

        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;

        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let packet_type: u8 = self.packet_type.into();
        v.push(packet_type);

        self.remaining_length.encode(v)?;

        Ok(PacketType::bytes() + self.remaining_length.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let mut buf = Vec::new();
        let fixed_header = FixedHeader::new(PacketType::PingResponse, 0).unwrap();
        let ret = fixed_header.encode(&mut buf);
        assert_eq!(ret.unwrap(), 2);
        assert_eq!(&buf, &[0xd0, 0x00]);
    }

    #[test]
    fn test_decode() {
        let buf = [0x30, 0x13, 0x00, 0x05, 0x68];
        let mut ba = ByteArray::new(&buf);
        let fixed_header = FixedHeader::decode(&mut ba).unwrap();
        assert_eq!(
            fixed_header.packet_type(),
            PacketType::Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false
            }
        );
        assert_eq!(fixed_header.remaining_length(), 19);
    }

    #[test]
    fn test_decode_rejects_bad_flags() {
        // Subscribe with flags 0b0000 instead of 0b0010.
        let buf = [0x80, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            FixedHeader::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }
}
