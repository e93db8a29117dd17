// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

//! One tagged union over the control packets of both protocol versions,
//! so connection state machines can be written against a single type.

use crate::header::PacketType;
use crate::{v3, v5, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};
use crate::{PacketId, ProtocolLevel, QoS};

/// Any control packet of either protocol version.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    ConnectV3(v3::ConnectPacket),
    ConnectAckV3(v3::ConnectAckPacket),
    PublishV3(v3::PublishPacket),
    PublishAckV3(v3::PublishAckPacket),
    PublishReceivedV3(v3::PublishReceivedPacket),
    PublishReleaseV3(v3::PublishReleasePacket),
    PublishCompleteV3(v3::PublishCompletePacket),
    SubscribeV3(v3::SubscribePacket),
    SubscribeAckV3(v3::SubscribeAckPacket),
    UnsubscribeV3(v3::UnsubscribePacket),
    UnsubscribeAckV3(v3::UnsubscribeAckPacket),
    PingRequestV3(v3::PingRequestPacket),
    PingResponseV3(v3::PingResponsePacket),
    DisconnectV3(v3::DisconnectPacket),

    ConnectV5(v5::ConnectPacket),
    ConnectAckV5(v5::ConnectAckPacket),
    PublishV5(v5::PublishPacket),
    PublishAckV5(v5::PublishAckPacket),
    PublishReceivedV5(v5::PublishReceivedPacket),
    PublishReleaseV5(v5::PublishReleasePacket),
    PublishCompleteV5(v5::PublishCompletePacket),
    SubscribeV5(v5::SubscribePacket),
    SubscribeAckV5(v5::SubscribeAckPacket),
    UnsubscribeV5(v5::UnsubscribePacket),
    UnsubscribeAckV5(v5::UnsubscribeAckPacket),
    PingRequestV5(v5::PingRequestPacket),
    PingResponseV5(v5::PingResponsePacket),
    DisconnectV5(v5::DisconnectPacket),
    AuthV5(v5::AuthPacket),
}

macro_rules! impl_from_packet {
    ($variant: ident, $packet_type: ty) => {
        impl From<$packet_type> for Packet {
            fn from(packet: $packet_type) -> Self {
                Self::$variant(packet)
            }
        }
    };
}

impl_from_packet!(ConnectV3, v3::ConnectPacket);
impl_from_packet!(ConnectAckV3, v3::ConnectAckPacket);
impl_from_packet!(PublishV3, v3::PublishPacket);
impl_from_packet!(PublishAckV3, v3::PublishAckPacket);
impl_from_packet!(PublishReceivedV3, v3::PublishReceivedPacket);
impl_from_packet!(PublishReleaseV3, v3::PublishReleasePacket);
impl_from_packet!(PublishCompleteV3, v3::PublishCompletePacket);
impl_from_packet!(SubscribeV3, v3::SubscribePacket);
impl_from_packet!(SubscribeAckV3, v3::SubscribeAckPacket);
impl_from_packet!(UnsubscribeV3, v3::UnsubscribePacket);
impl_from_packet!(UnsubscribeAckV3, v3::UnsubscribeAckPacket);
impl_from_packet!(PingRequestV3, v3::PingRequestPacket);
impl_from_packet!(PingResponseV3, v3::PingResponsePacket);
impl_from_packet!(DisconnectV3, v3::DisconnectPacket);

impl_from_packet!(ConnectV5, v5::ConnectPacket);
impl_from_packet!(ConnectAckV5, v5::ConnectAckPacket);
impl_from_packet!(PublishV5, v5::PublishPacket);
impl_from_packet!(PublishAckV5, v5::PublishAckPacket);
impl_from_packet!(PublishReceivedV5, v5::PublishReceivedPacket);
impl_from_packet!(PublishReleaseV5, v5::PublishReleasePacket);
impl_from_packet!(PublishCompleteV5, v5::PublishCompletePacket);
impl_from_packet!(SubscribeV5, v5::SubscribePacket);
impl_from_packet!(SubscribeAckV5, v5::SubscribeAckPacket);
impl_from_packet!(UnsubscribeV5, v5::UnsubscribePacket);
impl_from_packet!(UnsubscribeAckV5, v5::UnsubscribeAckPacket);
impl_from_packet!(PingRequestV5, v5::PingRequestPacket);
impl_from_packet!(PingResponseV5, v5::PingResponsePacket);
impl_from_packet!(DisconnectV5, v5::DisconnectPacket);
impl_from_packet!(AuthV5, v5::AuthPacket);

impl Packet {
    /// Protocol version this packet belongs to.
    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        match self {
            Self::ConnectV3(..)
            | Self::ConnectAckV3(..)
            | Self::PublishV3(..)
            | Self::PublishAckV3(..)
            | Self::PublishReceivedV3(..)
            | Self::PublishReleaseV3(..)
            | Self::PublishCompleteV3(..)
            | Self::SubscribeV3(..)
            | Self::SubscribeAckV3(..)
            | Self::UnsubscribeV3(..)
            | Self::UnsubscribeAckV3(..)
            | Self::PingRequestV3(..)
            | Self::PingResponseV3(..)
            | Self::DisconnectV3(..) => ProtocolLevel::V311,
            _ => ProtocolLevel::V5,
        }
    }

    /// Control packet type on the wire.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        use crate::header::Packet as _;
        match self {
            Self::ConnectV3(p) => p.packet_type(),
            Self::ConnectAckV3(p) => p.packet_type(),
            Self::PublishV3(p) => p.packet_type(),
            Self::PublishAckV3(p) => p.packet_type(),
            Self::PublishReceivedV3(p) => p.packet_type(),
            Self::PublishReleaseV3(p) => p.packet_type(),
            Self::PublishCompleteV3(p) => p.packet_type(),
            Self::SubscribeV3(p) => p.packet_type(),
            Self::SubscribeAckV3(p) => p.packet_type(),
            Self::UnsubscribeV3(p) => p.packet_type(),
            Self::UnsubscribeAckV3(p) => p.packet_type(),
            Self::PingRequestV3(p) => p.packet_type(),
            Self::PingResponseV3(p) => p.packet_type(),
            Self::DisconnectV3(p) => p.packet_type(),
            Self::ConnectV5(p) => p.packet_type(),
            Self::ConnectAckV5(p) => p.packet_type(),
            Self::PublishV5(p) => p.packet_type(),
            Self::PublishAckV5(p) => p.packet_type(),
            Self::PublishReceivedV5(p) => p.packet_type(),
            Self::PublishReleaseV5(p) => p.packet_type(),
            Self::PublishCompleteV5(p) => p.packet_type(),
            Self::SubscribeV5(p) => p.packet_type(),
            Self::SubscribeAckV5(p) => p.packet_type(),
            Self::UnsubscribeV5(p) => p.packet_type(),
            Self::UnsubscribeAckV5(p) => p.packet_type(),
            Self::PingRequestV5(p) => p.packet_type(),
            Self::PingResponseV5(p) => p.packet_type(),
            Self::DisconnectV5(p) => p.packet_type(),
            Self::AuthV5(p) => p.packet_type(),
        }
    }

    /// Packet id carried by this packet, if its type has one.
    #[must_use]
    pub fn packet_id(&self) -> Option<PacketId> {
        match self {
            Self::PublishV3(p) => {
                (p.qos() != QoS::AtMostOnce).then(|| p.packet_id())
            }
            Self::PublishV5(p) => {
                (p.qos() != QoS::AtMostOnce).then(|| p.packet_id())
            }
            Self::PublishAckV3(p) => Some(p.packet_id()),
            Self::PublishAckV5(p) => Some(p.packet_id()),
            Self::PublishReceivedV3(p) => Some(p.packet_id()),
            Self::PublishReceivedV5(p) => Some(p.packet_id()),
            Self::PublishReleaseV3(p) => Some(p.packet_id()),
            Self::PublishReleaseV5(p) => Some(p.packet_id()),
            Self::PublishCompleteV3(p) => Some(p.packet_id()),
            Self::PublishCompleteV5(p) => Some(p.packet_id()),
            Self::SubscribeV3(p) => Some(p.packet_id()),
            Self::SubscribeV5(p) => Some(p.packet_id()),
            Self::SubscribeAckV3(p) => Some(p.packet_id()),
            Self::SubscribeAckV5(p) => Some(p.packet_id()),
            Self::UnsubscribeV3(p) => Some(p.packet_id()),
            Self::UnsubscribeV5(p) => Some(p.packet_id()),
            Self::UnsubscribeAckV3(p) => Some(p.packet_id()),
            Self::UnsubscribeAckV5(p) => Some(p.packet_id()),
            _ => None,
        }
    }

    /// Decode one complete packet from `buf`.
    ///
    /// A connect packet carries its own protocol level and is decoded by it;
    /// every other packet type is decoded according to `level`, the version
    /// negotiated for the connection.
    ///
    /// # Errors
    ///
    /// Returns error if `buf` does not contain a valid packet of `level`.
    pub fn decode(buf: &[u8], level: ProtocolLevel) -> Result<Self, DecodeError> {
        let mut ba = ByteArray::new(buf);
        let header = crate::FixedHeader::decode(&mut ba)?;
        if !header.is_valid_header(level) {
            return Err(DecodeError::InvalidPacketType);
        }
        ba.reset_offset();

        let packet_type = header.packet_type();
        if packet_type == PacketType::Connect {
            return match sniff_connect_level(buf)? {
                ProtocolLevel::V5 => Ok(v5::ConnectPacket::decode(&mut ba)?.into()),
                _ => Ok(v3::ConnectPacket::decode(&mut ba)?.into()),
            };
        }

        let v5_packet = level == ProtocolLevel::V5;
        let packet = match packet_type {
            PacketType::ConnectAck if v5_packet => v5::ConnectAckPacket::decode(&mut ba)?.into(),
            PacketType::ConnectAck => v3::ConnectAckPacket::decode(&mut ba)?.into(),
            PacketType::Publish { .. } if v5_packet => v5::PublishPacket::decode(&mut ba)?.into(),
            PacketType::Publish { .. } => v3::PublishPacket::decode(&mut ba)?.into(),
            PacketType::PublishAck if v5_packet => v5::PublishAckPacket::decode(&mut ba)?.into(),
            PacketType::PublishAck => v3::PublishAckPacket::decode(&mut ba)?.into(),
            PacketType::PublishReceived if v5_packet => {
                v5::PublishReceivedPacket::decode(&mut ba)?.into()
            }
            PacketType::PublishReceived => v3::PublishReceivedPacket::decode(&mut ba)?.into(),
            PacketType::PublishRelease if v5_packet => {
                v5::PublishReleasePacket::decode(&mut ba)?.into()
            }
            PacketType::PublishRelease => v3::PublishReleasePacket::decode(&mut ba)?.into(),
            PacketType::PublishComplete if v5_packet => {
                v5::PublishCompletePacket::decode(&mut ba)?.into()
            }
            PacketType::PublishComplete => v3::PublishCompletePacket::decode(&mut ba)?.into(),
            PacketType::Subscribe if v5_packet => v5::SubscribePacket::decode(&mut ba)?.into(),
            PacketType::Subscribe => v3::SubscribePacket::decode(&mut ba)?.into(),
            PacketType::SubscribeAck if v5_packet => {
                v5::SubscribeAckPacket::decode(&mut ba)?.into()
            }
            PacketType::SubscribeAck => v3::SubscribeAckPacket::decode(&mut ba)?.into(),
            PacketType::Unsubscribe if v5_packet => v5::UnsubscribePacket::decode(&mut ba)?.into(),
            PacketType::Unsubscribe => v3::UnsubscribePacket::decode(&mut ba)?.into(),
            PacketType::UnsubscribeAck if v5_packet => {
                v5::UnsubscribeAckPacket::decode(&mut ba)?.into()
            }
            PacketType::UnsubscribeAck => v3::UnsubscribeAckPacket::decode(&mut ba)?.into(),
            PacketType::PingRequest if v5_packet => v5::PingRequestPacket::decode(&mut ba)?.into(),
            PacketType::PingRequest => v3::PingRequestPacket::decode(&mut ba)?.into(),
            PacketType::PingResponse if v5_packet => {
                v5::PingResponsePacket::decode(&mut ba)?.into()
            }
            PacketType::PingResponse => v3::PingResponsePacket::decode(&mut ba)?.into(),
            PacketType::Disconnect if v5_packet => v5::DisconnectPacket::decode(&mut ba)?.into(),
            PacketType::Disconnect => v3::DisconnectPacket::decode(&mut ba)?.into(),
            PacketType::Auth => v5::AuthPacket::decode(&mut ba)?.into(),
            PacketType::Connect => unreachable!("handled above"),
        };
        Ok(packet)
    }
}

impl EncodePacket for Packet {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::ConnectV3(p) => p.encode(buf),
            Self::ConnectAckV3(p) => p.encode(buf),
            Self::PublishV3(p) => p.encode(buf),
            Self::PublishAckV3(p) => p.encode(buf),
            Self::PublishReceivedV3(p) => p.encode(buf),
            Self::PublishReleaseV3(p) => p.encode(buf),
            Self::PublishCompleteV3(p) => p.encode(buf),
            Self::SubscribeV3(p) => p.encode(buf),
            Self::SubscribeAckV3(p) => p.encode(buf),
            Self::UnsubscribeV3(p) => p.encode(buf),
            Self::UnsubscribeAckV3(p) => p.encode(buf),
            Self::PingRequestV3(p) => p.encode(buf),
            Self::PingResponseV3(p) => p.encode(buf),
            Self::DisconnectV3(p) => p.encode(buf),
            Self::ConnectV5(p) => p.encode(buf),
            Self::ConnectAckV5(p) => p.encode(buf),
            Self::PublishV5(p) => p.encode(buf),
            Self::PublishAckV5(p) => p.encode(buf),
            Self::PublishReceivedV5(p) => p.encode(buf),
            Self::PublishReleaseV5(p) => p.encode(buf),
            Self::PublishCompleteV5(p) => p.encode(buf),
            Self::SubscribeV5(p) => p.encode(buf),
            Self::SubscribeAckV5(p) => p.encode(buf),
            Self::UnsubscribeV5(p) => p.encode(buf),
            Self::UnsubscribeAckV5(p) => p.encode(buf),
            Self::PingRequestV5(p) => p.encode(buf),
            Self::PingResponseV5(p) => p.encode(buf),
            Self::DisconnectV5(p) => p.encode(buf),
            Self::AuthV5(p) => p.encode(buf),
        }
    }
}

/// Read the protocol level byte out of a complete connect packet without
/// decoding the whole packet.
///
/// # Errors
///
/// Returns error if `buf` is not a connect packet.
fn sniff_connect_level(buf: &[u8]) -> Result<ProtocolLevel, DecodeError> {
    let mut ba = ByteArray::new(buf);
    let header = crate::FixedHeader::decode(&mut ba)?;
    if header.packet_type() != PacketType::Connect {
        return Err(DecodeError::InvalidPacketType);
    }
    let name_len = ba.read_u16()? as usize;
    let _name = ba.read_bytes(name_len)?;
    let level = ba.read_byte()?;
    ProtocolLevel::try_from(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_connect_sniffs_version() {
        let packet = v5::ConnectPacket::new("c5").unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        // The reader has not negotiated 5.0 yet, but the connect packet
        // carries its own level.
        let decoded = Packet::decode(&buf, ProtocolLevel::V311).unwrap();
        assert!(matches!(decoded, Packet::ConnectV5(_)));
    }

    #[test]
    fn test_decode_by_level() {
        let packet = v3::PublishAckPacket::new(PacketId::new(2));
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let decoded = Packet::decode(&buf, ProtocolLevel::V311).unwrap();
        assert!(matches!(decoded, Packet::PublishAckV3(_)));

        let decoded = Packet::decode(&buf, ProtocolLevel::V5).unwrap();
        assert!(matches!(decoded, Packet::PublishAckV5(_)));
    }

    #[test]
    fn test_auth_rejected_below_v5() {
        let packet = v5::AuthPacket::new();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(
            Packet::decode(&buf, ProtocolLevel::V311),
            Err(DecodeError::InvalidPacketType)
        );
    }

    #[test]
    fn test_packet_id() {
        let mut publish = v3::PublishPacket::new("t", QoS::AtLeastOnce, b"m").unwrap();
        publish.set_packet_id(PacketId::new(4));
        let packet: Packet = publish.into();
        assert_eq!(packet.packet_id(), Some(PacketId::new(4)));

        let packet: Packet = v3::PingRequestPacket::new().into();
        assert_eq!(packet.packet_id(), None);
    }
}
