// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use super::property::check_property_type_list;
use super::{Properties, PropertyType, ReasonCode};
use crate::header::{FixedHeader, Packet, PacketType};
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, VarIntError};

/// Properties allowed in a 5.0 disconnect packet.
pub const DISCONNECT_PROPERTIES: &[PropertyType] = &[
    PropertyType::SessionExpiryInterval,
    PropertyType::ReasonString,
    PropertyType::UserProperty,
    PropertyType::ServerReference,
];

/// Reason codes allowed in a 5.0 disconnect packet.
pub const DISCONNECT_REASONS: &[ReasonCode] = &[
    ReasonCode::Success,
    ReasonCode::DisconnectWithWillMessage,
    ReasonCode::UnspecifiedError,
    ReasonCode::MalformedPacket,
    ReasonCode::ProtocolError,
    ReasonCode::ImplementationSpecificError,
    ReasonCode::NotAuthorized,
    ReasonCode::ServerBusy,
    ReasonCode::ServerShuttingDown,
    ReasonCode::KeepAliveTimeout,
    ReasonCode::SessionTakenOver,
    ReasonCode::TopicFilterInvalid,
    ReasonCode::TopicNameInvalid,
    ReasonCode::ReceiveMaximumExceeded,
    ReasonCode::TopicAliasInvalid,
    ReasonCode::PacketTooLarge,
    ReasonCode::MessageRateTooHigh,
    ReasonCode::QuotaExceeded,
    ReasonCode::AdministrativeAction,
    ReasonCode::PayloadFormatInvalid,
    ReasonCode::RetainNotSupported,
    ReasonCode::QoSNotSupported,
    ReasonCode::UseAnotherServer,
    ReasonCode::ServerMoved,
    ReasonCode::SharedSubscriptionsNotSupported,
    ReasonCode::ConnectionRateExceeded,
    ReasonCode::MaximumConnectTime,
    ReasonCode::SubscriptionIdentifiersNotSupported,
    ReasonCode::WildcardSubscriptionsNotSupported,
];

/// 5.0 disconnect packet, sent by either peer before closing the network
/// connection.
///
/// The reason code and properties may be omitted on the wire when the
/// reason is normal disconnection and there are no properties.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DisconnectPacket {
    reason_code: ReasonCode,
    properties: Properties,
}

impl DisconnectPacket {
    /// Create a normal disconnection packet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reason_code: ReasonCode::Success,
            properties: Properties::new(),
        }
    }

    /// Create a packet with a specific reason code.
    #[must_use]
    pub fn with_reason(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::new(),
        }
    }

    pub fn set_reason_code(&mut self, reason_code: ReasonCode) -> &mut Self {
        self.reason_code = reason_code;
        self
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

impl DecodePacket for DisconnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Disconnect {
            return Err(DecodeError::InvalidPacketType);
        }

        // The reason code and properties may be omitted; 0x00 (Normal
        // disconnection) is used in that case.
        let reason_code = if fixed_header.remaining_length() > 0 {
            let reason_code = ReasonCode::decode(ba)?;
            if !DISCONNECT_REASONS.contains(&reason_code) {
                return Err(DecodeError::InvalidReasonCode);
            }
            reason_code
        } else {
            ReasonCode::Success
        };

        let properties = if fixed_header.remaining_length() > ReasonCode::bytes() {
            let properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(properties.props(), DISCONNECT_PROPERTIES)
            {
                log::error!("v5/DisconnectPacket: property {property_type:?} is not allowed");
                return Err(DecodeError::PropertyNotAllowed);
            }
            properties
        } else {
            Properties::new()
        };

        Ok(Self {
            reason_code,
            properties,
        })
    }
}

impl EncodePacket for DisconnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let remaining_length =
            if self.reason_code == ReasonCode::Success && self.properties.is_empty() {
                0
            } else {
                ReasonCode::bytes() + self.properties.bytes()
            };
        let fixed_header = FixedHeader::new(PacketType::Disconnect, remaining_length)?;
        fixed_header.encode(buf)?;

        if remaining_length > 0 {
            self.reason_code.encode(buf)?;
            self.properties.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for DisconnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Disconnect
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let remaining_length =
            if self.reason_code == ReasonCode::Success && self.properties.is_empty() {
                0
            } else {
                ReasonCode::bytes() + self.properties.bytes()
            };
        let fixed_header = FixedHeader::new(PacketType::Disconnect, remaining_length)?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_form() {
        let packet = DisconnectPacket::new();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0xe0, 0x00]);

        let mut ba = ByteArray::new(&buf);
        let decoded = DisconnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.reason_code(), ReasonCode::Success);
    }

    #[test]
    fn test_with_reason() {
        let packet = DisconnectPacket::with_reason(ReasonCode::SessionTakenOver);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        assert_eq!(DisconnectPacket::decode(&mut ba).unwrap(), packet);
    }
}
