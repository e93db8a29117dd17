// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use super::property::check_property_type_list;
use super::{Properties, PropertyType};
use crate::connect_flags::ConnectFlags;
use crate::header::{FixedHeader, Packet, PacketType};
use crate::utils::validate_client_id;
use crate::{
    BinaryData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, ProtocolLevel,
    PubTopic, QoS, StringData, U16Data, VarIntError,
};

/// Properties allowed in the variable header of a 5.0 connect packet.
pub const CONNECT_PROPERTIES: &[PropertyType] = &[
    PropertyType::SessionExpiryInterval,
    PropertyType::ReceiveMaximum,
    PropertyType::MaximumPacketSize,
    PropertyType::TopicAliasMaximum,
    PropertyType::RequestResponseInformation,
    PropertyType::RequestProblemInformation,
    PropertyType::UserProperty,
    PropertyType::AuthenticationMethod,
    PropertyType::AuthenticationData,
];

/// Properties allowed in the will property list of the payload.
pub const WILL_PROPERTIES: &[PropertyType] = &[
    PropertyType::WillDelayInterval,
    PropertyType::PayloadFormatIndicator,
    PropertyType::MessageExpiryInterval,
    PropertyType::ContentType,
    PropertyType::ResponseTopic,
    PropertyType::CorrelationData,
    PropertyType::UserProperty,
];

/// 5.0 connect packet, the 3.1.1 shape plus two property lists: one for the
/// session, one for the will message.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectPacket {
    connect_flags: ConnectFlags,

    /// A value of zero turns the keep alive mechanism off.
    keep_alive: U16Data,

    properties: Properties,

    client_id: StringData,

    /// Present iff the `will` flag is set.
    will_properties: Properties,

    /// Present iff the `will` flag is set.
    will_topic: Option<PubTopic>,

    /// Present iff the `will` flag is set.
    will_message: BinaryData,

    username: StringData,

    password: BinaryData,
}

impl ConnectPacket {
    /// Create a new 5.0 connect packet with `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        validate_client_id(client_id).map_err(|_err| EncodeError::InvalidClientId)?;
        let client_id = StringData::from(client_id)?;
        Ok(Self {
            keep_alive: U16Data::new(60),
            client_id,
            ..Self::default()
        })
    }

    /// Update connect flags. The clean-session bit is called clean-start
    /// in 5.0; the wire layout is the same.
    pub fn set_connect_flags(&mut self, flags: ConnectFlags) -> &mut Self {
        self.connect_flags = flags;
        self
    }

    #[must_use]
    #[inline]
    pub const fn connect_flags(&self) -> &ConnectFlags {
        &self.connect_flags
    }

    /// Update keep alive value in seconds.
    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = U16Data::new(keep_alive);
        self
    }

    #[must_use]
    #[inline]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive.value()
    }

    /// Get a mutable reference to connect property list.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Update client id.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn set_client_id(&mut self, client_id: &str) -> Result<&mut Self, EncodeError> {
        validate_client_id(client_id).map_err(|_err| EncodeError::InvalidClientId)?;
        self.client_id = StringData::from(client_id)?;
        Ok(self)
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    /// Update username value.
    ///
    /// # Errors
    ///
    /// Returns error if `username` contains invalid chars or is too long.
    pub fn set_username(&mut self, username: &str) -> Result<&mut Self, EncodeError> {
        self.username = StringData::from(username)?;
        self.connect_flags.set_has_username(!username.is_empty());
        Ok(self)
    }

    #[must_use]
    pub fn username(&self) -> &str {
        self.username.as_ref()
    }

    /// Update password value.
    ///
    /// # Errors
    ///
    /// Returns error if `password` is too long.
    pub fn set_password(&mut self, password: &[u8]) -> Result<&mut Self, EncodeError> {
        self.password = BinaryData::from_slice(password)?;
        self.connect_flags.set_has_password(!password.is_empty());
        Ok(self)
    }

    #[must_use]
    pub fn password(&self) -> &[u8] {
        self.password.as_ref()
    }

    /// Update will-topic. An empty `topic` clears the will.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn set_will_topic(&mut self, topic: &str) -> Result<&mut Self, EncodeError> {
        if topic.is_empty() {
            self.will_topic = None;
            self.connect_flags.set_will(false);
        } else {
            self.will_topic = Some(PubTopic::new(topic)?);
            self.connect_flags.set_will(true);
        }
        Ok(self)
    }

    #[must_use]
    pub fn will_topic(&self) -> Option<&str> {
        self.will_topic.as_ref().map(AsRef::as_ref)
    }

    /// Update will-message.
    ///
    /// # Errors
    ///
    /// Returns error if `message` is too long.
    pub fn set_will_message(&mut self, message: &[u8]) -> Result<&mut Self, EncodeError> {
        self.will_message = BinaryData::from_slice(message)?;
        Ok(self)
    }

    #[must_use]
    pub fn will_message(&self) -> &[u8] {
        self.will_message.as_ref()
    }

    /// Get a mutable reference to will property list.
    pub fn will_properties_mut(&mut self) -> &mut Properties {
        &mut self.will_properties
    }

    #[must_use]
    pub const fn will_properties(&self) -> &Properties {
        &self.will_properties
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let protocol_name_len = 2 + ProtocolLevel::V5.protocol_name().len();
        let mut remaining_length = protocol_name_len
            + ProtocolLevel::bytes()
            + ConnectFlags::bytes()
            + U16Data::bytes()
            + self.properties.bytes()
            + self.client_id.bytes();

        if self.connect_flags.will() {
            remaining_length += self.will_properties.bytes();
            if let Some(will_topic) = &self.will_topic {
                remaining_length += will_topic.bytes();
            }
            remaining_length += self.will_message.bytes();
        }
        if self.connect_flags.has_username() {
            remaining_length += self.username.bytes();
        }
        if self.connect_flags.has_password() {
            remaining_length += self.password.bytes();
        }
        FixedHeader::new(PacketType::Connect, remaining_length)
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        // Write variable header
        let protocol_name = StringData::from(ProtocolLevel::V5.protocol_name())?;
        protocol_name.encode(v)?;
        ProtocolLevel::V5.encode(v)?;
        self.connect_flags.encode(v)?;
        self.keep_alive.encode(v)?;
        self.properties.encode(v)?;

        // Write payload
        self.client_id.encode(v)?;
        if self.connect_flags.will() {
            self.will_properties.encode(v)?;
            if let Some(will_topic) = &self.will_topic {
                will_topic.encode(v)?;
            }
            self.will_message.encode(v)?;
        }
        if self.connect_flags.has_username() {
            self.username.encode(v)?;
        }
        if self.connect_flags.has_password() {
            self.password.encode(v)?;
        }

        Ok(v.len() - old_len)
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = StringData::decode(ba)?;
        let protocol_level = ProtocolLevel::try_from(ba.read_byte()?)?;
        if protocol_level != ProtocolLevel::V5
            || protocol_name.as_ref() != protocol_level.protocol_name()
        {
            return Err(DecodeError::InvalidProtocolName);
        }

        let connect_flags = ConnectFlags::decode(ba)?;
        if !connect_flags.will()
            && (connect_flags.will_qos() != QoS::AtMostOnce || connect_flags.will_retain())
        {
            return Err(DecodeError::InvalidConnectFlags);
        }

        let keep_alive = U16Data::decode(ba)?;

        let properties = Properties::decode(ba)?;
        if let Err(property_type) = check_property_type_list(properties.props(), CONNECT_PROPERTIES)
        {
            log::error!("v5/ConnectPacket: property {property_type:?} is not allowed");
            return Err(DecodeError::PropertyNotAllowed);
        }

        let client_id = StringData::decode(ba).map_err(|_err| DecodeError::InvalidClientId)?;
        validate_client_id(client_id.as_ref())?;

        let (will_properties, will_topic, will_message) = if connect_flags.will() {
            let will_properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(will_properties.props(), WILL_PROPERTIES)
            {
                log::error!("v5/ConnectPacket: will property {property_type:?} is not allowed");
                return Err(DecodeError::PropertyNotAllowed);
            }
            let will_topic = PubTopic::decode(ba)?;
            if will_topic.is_empty() {
                return Err(DecodeError::InvalidTopic);
            }
            let will_message = BinaryData::decode(ba)?;
            (will_properties, Some(will_topic), will_message)
        } else {
            (Properties::new(), None, BinaryData::new())
        };

        let username = if connect_flags.has_username() {
            StringData::decode(ba)?
        } else {
            StringData::new()
        };

        let password = if connect_flags.has_password() {
            BinaryData::decode(ba)?
        } else {
            BinaryData::new()
        };

        Ok(Self {
            connect_flags,
            keep_alive,
            properties,
            client_id,
            will_properties,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl Packet for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v5::Property;
    use crate::U32Data;

    #[test]
    fn test_round_trip() {
        let mut packet = ConnectPacket::new("device-7").unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(true);
        packet.set_connect_flags(flags);
        packet
            .properties_mut()
            .push(Property::SessionExpiryInterval(U32Data::new(300)));
        packet.set_will_topic("dead/device-7").unwrap();
        packet.set_will_message(b"gone").unwrap();
        packet
            .will_properties_mut()
            .push(Property::WillDelayInterval(U32Data::new(5)));

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.properties().session_expiry_interval(), Some(300));
        assert_eq!(decoded.will_properties().will_delay_interval(), Some(5));
    }

    #[test]
    fn test_will_property_in_connect_rejected() {
        let mut packet = ConnectPacket::new("c").unwrap();
        packet
            .properties_mut()
            .push(Property::WillDelayInterval(U32Data::new(5)));
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::PropertyNotAllowed)
        );
    }
}
