// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

use crate::{ByteArray, DecodeError, EncodeError};

/// Parse object from byte stream.
pub trait DecodePacket: Sized {
    /// # Errors
    ///
    /// Returns error if byte stream does not contain a valid object.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Serialize object into byte stream.
pub trait EncodePacket {
    /// Returns number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if object contains fields not representable on the wire.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Packet identifier, a non-zero two byte integer in `QoS` 1/2 publish,
/// subscribe and unsubscribe packets and their acknowledgements.
///
/// Value 0 stands for "no packet id"; packets which carry one on the wire
/// never encode 0.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PacketId(u16);

impl PacketId {
    /// Wrap a raw id value.
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get inner id value.
    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}

/// Level of assurance for delivery of an application message.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl QoS {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

impl DecodePacket for QoS {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let byte = ba.read_byte()?;
        Self::try_from(byte)
    }
}

impl EncodePacket for QoS {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(*self as u8);
        Ok(Self::bytes())
    }
}

/// Version of the protocol used by a connection.
///
/// Carried in the variable header of the connect packet, right after
/// the protocol name.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolLevel {
    /// MQTT 3.1, protocol name is `MQIsdp`.
    V31 = 3,

    /// MQTT 3.1.1, protocol name is `MQTT`.
    #[default]
    V311 = 4,

    /// MQTT 5.0, protocol name is `MQTT`.
    V5 = 5,
}

impl ProtocolLevel {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }

    /// Protocol name string expected for this level.
    #[must_use]
    pub const fn protocol_name(&self) -> &'static str {
        match self {
            Self::V31 => "MQIsdp",
            Self::V311 | Self::V5 => "MQTT",
        }
    }
}

impl fmt::Display for ProtocolLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::V31 => write!(f, "3.1"),
            Self::V311 => write!(f, "3.1.1"),
            Self::V5 => write!(f, "5.0"),
        }
    }
}

impl TryFrom<u8> for ProtocolLevel {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            3 => Ok(Self::V31),
            4 => Ok(Self::V311),
            5 => Ok(Self::V5),
            _ => Err(DecodeError::InvalidProtocolLevel),
        }
    }
}

impl DecodePacket for ProtocolLevel {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let byte = ba.read_byte()?;
        Self::try_from(byte)
    }
}

impl EncodePacket for ProtocolLevel {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(*self as u8);
        Ok(Self::bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_id_round_trip() {
        let pid = PacketId::new(0x1234);
        let mut buf = Vec::new();
        assert_eq!(pid.encode(&mut buf).unwrap(), 2);
        assert_eq!(&buf, &[0x12, 0x34]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PacketId::decode(&mut ba).unwrap(), pid);
    }

    #[test]
    fn test_qos_try_from() {
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(QoS::try_from(3), Err(DecodeError::InvalidQoS));
    }

    #[test]
    fn test_protocol_level() {
        assert_eq!(ProtocolLevel::try_from(5).unwrap(), ProtocolLevel::V5);
        assert_eq!(
            ProtocolLevel::try_from(6),
            Err(DecodeError::InvalidProtocolLevel)
        );
        assert_eq!(ProtocolLevel::V311.protocol_name(), "MQTT");
        assert_eq!(ProtocolLevel::V31.protocol_name(), "MQIsdp");
    }
}
