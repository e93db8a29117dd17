// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use super::property::check_property_type_list;
use super::{Properties, PropertyType, ReasonCode};
use crate::header::{FixedHeader, Packet, PacketType};
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, PacketId, VarIntError,
};

/// Properties allowed in a 5.0 publish received packet.
pub const PUBLISH_RECEIVED_PROPERTIES: &[PropertyType] =
    &[PropertyType::ReasonString, PropertyType::UserProperty];

/// Reason codes allowed in a 5.0 publish received packet.
pub const PUBLISH_RECEIVED_REASONS: &[ReasonCode] = &[
    ReasonCode::Success,
    ReasonCode::NoMatchingSubscribers,
    ReasonCode::UnspecifiedError,
    ReasonCode::ImplementationSpecificError,
    ReasonCode::NotAuthorized,
    ReasonCode::TopicNameInvalid,
    ReasonCode::PacketIdentifierInUse,
    ReasonCode::QuotaExceeded,
    ReasonCode::PayloadFormatInvalid,
];

/// First response to a `QoS` 2 publish packet.
///
/// An error reason code retires the packet id on the sender side; the
/// handshake does not continue with a release packet in that case.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishReceivedPacket {
    packet_id: PacketId,
    reason_code: ReasonCode,
    properties: Properties,
}

impl PublishReceivedPacket {
    /// Create a success packet.
    #[must_use]
    pub fn new(packet_id: PacketId) -> Self {
        Self {
            packet_id,
            reason_code: ReasonCode::Success,
            properties: Properties::new(),
        }
    }

    /// Create a packet with a specific reason code.
    #[must_use]
    pub fn with_reason(packet_id: PacketId, reason_code: ReasonCode) -> Self {
        Self {
            packet_id,
            reason_code,
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub const fn reason_code(&self) -> ReasonCode {
        self.reason_code
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }
}

impl DecodePacket for PublishReceivedPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::PublishReceived {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() < PacketId::bytes() {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let packet_id = PacketId::decode(ba)?;

        let reason_code = if fixed_header.remaining_length() > PacketId::bytes() {
            let reason_code = ReasonCode::decode(ba)?;
            if !PUBLISH_RECEIVED_REASONS.contains(&reason_code) {
                return Err(DecodeError::InvalidReasonCode);
            }
            reason_code
        } else {
            ReasonCode::Success
        };

        let properties = if fixed_header.remaining_length() > PacketId::bytes() + ReasonCode::bytes()
        {
            let properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(properties.props(), PUBLISH_RECEIVED_PROPERTIES)
            {
                log::error!("v5/PublishReceivedPacket: property {property_type:?} is not allowed");
                return Err(DecodeError::PropertyNotAllowed);
            }
            properties
        } else {
            Properties::new()
        };

        Ok(Self {
            packet_id,
            reason_code,
            properties,
        })
    }
}

impl EncodePacket for PublishReceivedPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let remaining_length =
            if self.reason_code == ReasonCode::Success && self.properties.is_empty() {
                PacketId::bytes()
            } else {
                PacketId::bytes() + ReasonCode::bytes() + self.properties.bytes()
            };
        let fixed_header = FixedHeader::new(PacketType::PublishReceived, remaining_length)?;
        fixed_header.encode(buf)?;

        self.packet_id.encode(buf)?;
        if remaining_length > PacketId::bytes() {
            self.reason_code.encode(buf)?;
            self.properties.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for PublishReceivedPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::PublishReceived
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let remaining_length =
            if self.reason_code == ReasonCode::Success && self.properties.is_empty() {
                PacketId::bytes()
            } else {
                PacketId::bytes() + ReasonCode::bytes() + self.properties.bytes()
            };
        let fixed_header = FixedHeader::new(PacketType::PublishReceived, remaining_length)?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = PublishReceivedPacket::new(PacketId::new(7));
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x50, 0x02, 0x00, 0x07]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PublishReceivedPacket::decode(&mut ba).unwrap(), packet);
    }
}
