// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::utils::validate_client_id;
use crate::{
    BinaryData, BoolData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket,
    PubTopic, QoS, StringData, StringPairData, U16Data, U32Data, VarInt,
};

/// Properties which may legally appear more than once in one property list.
pub const MULTIPLE_PROPERTIES: &[PropertyType] = &[
    PropertyType::UserProperty,
    PropertyType::SubscriptionIdentifier,
];

/// Check that every property in `properties` is allowed at this packet
/// location and appears at most once, except those in
/// [`MULTIPLE_PROPERTIES`].
///
/// # Errors
///
/// Returns the offending property type.
pub fn check_property_type_list(
    properties: &[Property],
    types: &[PropertyType],
) -> Result<(), PropertyType> {
    if properties.is_empty() {
        return Ok(());
    }

    for property in properties {
        if !types.contains(&property.property_type()) {
            return Err(property.property_type());
        }
    }

    for property_type in types {
        let count = properties
            .iter()
            .filter(|p| p.property_type() == *property_type)
            .count();
        if count > 1 && !MULTIPLE_PROPERTIES.contains(property_type) {
            return Err(*property_type);
        }
    }

    Ok(())
}

/// A publish packet may carry at most one subscription identifier per
/// overlapping subscription; from a client, none at all.
///
/// # Errors
///
/// Returns the offending property type.
pub fn check_multiple_subscription_identifiers(
    properties: &[Property],
) -> Result<(), PropertyType> {
    let count = properties
        .iter()
        .filter(|p| p.property_type() == PropertyType::SubscriptionIdentifier)
        .count();
    if count > 1 {
        return Err(PropertyType::SubscriptionIdentifier);
    }
    Ok(())
}

/// Identifier byte of a property.
#[allow(clippy::module_name_repetitions)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0b,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1a,
    ServerReference = 0x1c,
    ReasonString = 0x1f,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2a,
}

impl PropertyType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for PropertyType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Self::PayloadFormatIndicator),
            0x02 => Ok(Self::MessageExpiryInterval),
            0x03 => Ok(Self::ContentType),
            0x08 => Ok(Self::ResponseTopic),
            0x09 => Ok(Self::CorrelationData),
            0x0b => Ok(Self::SubscriptionIdentifier),
            0x11 => Ok(Self::SessionExpiryInterval),
            0x12 => Ok(Self::AssignedClientIdentifier),
            0x13 => Ok(Self::ServerKeepAlive),
            0x15 => Ok(Self::AuthenticationMethod),
            0x16 => Ok(Self::AuthenticationData),
            0x17 => Ok(Self::RequestProblemInformation),
            0x18 => Ok(Self::WillDelayInterval),
            0x19 => Ok(Self::RequestResponseInformation),
            0x1a => Ok(Self::ResponseInformation),
            0x1c => Ok(Self::ServerReference),
            0x1f => Ok(Self::ReasonString),
            0x21 => Ok(Self::ReceiveMaximum),
            0x22 => Ok(Self::TopicAliasMaximum),
            0x23 => Ok(Self::TopicAlias),
            0x24 => Ok(Self::MaximumQoS),
            0x25 => Ok(Self::RetainAvailable),
            0x26 => Ok(Self::UserProperty),
            0x27 => Ok(Self::MaximumPacketSize),
            0x28 => Ok(Self::WildcardSubscriptionAvailable),
            0x29 => Ok(Self::SubscriptionIdentifierAvailable),
            0x2a => Ok(Self::SharedSubscriptionAvailable),
            _ => Err(DecodeError::InvalidPropertyType),
        }
    }
}

/// One property in the variable header of a 5.0 packet.
///
/// The packet modules each export the list of property types allowed at
/// their location; decoding rejects everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    /// Byte. Used in PUBLISH, Will Properties.
    ///
    /// 0 means the payload is unspecified bytes, 1 means utf-8 encoded
    /// character data.
    PayloadFormatIndicator(BoolData),

    /// Four Byte Integer. Used in PUBLISH, Will Properties.
    ///
    /// Lifetime of the message in seconds. If absent, the message does
    /// not expire.
    MessageExpiryInterval(U32Data),

    /// UTF-8 Encoded String. Used in PUBLISH, Will Properties.
    ContentType(StringData),

    /// UTF-8 Encoded String. Used in PUBLISH, Will Properties.
    ///
    /// Topic name for a response message.
    ResponseTopic(PubTopic),

    /// Binary Data. Used in PUBLISH, Will Properties.
    CorrelationData(BinaryData),

    /// Variable Byte Integer. Used in PUBLISH, SUBSCRIBE.
    ///
    /// The value can be 1 to 268,435,455; 0 is a protocol error. A publish
    /// packet sent from a client to a server MUST NOT contain one
    /// [MQTT-3.3.4-6].
    SubscriptionIdentifier(VarInt),

    /// Four Byte Integer. Used in CONNECT, CONNACK, DISCONNECT.
    ///
    /// Session Expiry Interval in seconds. 0 (or absent) means the session
    /// ends when the network connection is closed; 0xFFFFFFFF means the
    /// session does not expire.
    SessionExpiryInterval(U32Data),

    /// UTF-8 Encoded String. Used in CONNACK.
    ///
    /// The client identifier assigned by the server because a zero length
    /// client identifier was found in the connect packet [MQTT-3.2.2-16].
    AssignedClientIdentifier(StringData),

    /// Two Byte Integer. Used in CONNACK.
    ///
    /// If present, the client MUST use this value instead of the keep
    /// alive sent on connect [MQTT-3.2.2-21].
    ServerKeepAlive(U16Data),

    /// UTF-8 Encoded String. Used in CONNECT, CONNACK, AUTH.
    AuthenticationMethod(StringData),

    /// Binary Data. Used in CONNECT, CONNACK, AUTH.
    AuthenticationData(BinaryData),

    /// Byte. Used in CONNECT.
    ///
    /// Whether reason strings / user properties may be sent on packets
    /// other than PUBLISH, CONNACK or DISCONNECT.
    RequestProblemInformation(BoolData),

    /// Four Byte Integer. Will Properties only.
    ///
    /// The server delays publishing the will message until the interval
    /// has passed or the session ends, whichever happens first. A new
    /// connection to the session before the interval has passed suppresses
    /// the will [MQTT-3.1.3-9].
    WillDelayInterval(U32Data),

    /// Byte. Used in CONNECT.
    ///
    /// A value of 1 requests the server to return response information in
    /// the connack packet.
    RequestResponseInformation(BoolData),

    /// UTF-8 Encoded String. Used in CONNACK.
    ///
    /// Used as the basis for creating a response topic.
    ResponseInformation(StringData),

    /// UTF-8 Encoded String. Used in CONNACK, DISCONNECT.
    ServerReference(StringData),

    /// UTF-8 Encoded String. Used in all packets carrying a reason code.
    ///
    /// Human readable diagnostics, not parsed by the receiver.
    ReasonString(StringData),

    /// Two Byte Integer. Used in CONNECT, CONNACK.
    ///
    /// Limits the number of `QoS` 1/2 publications the sender is willing
    /// to process concurrently. 0 is a protocol error; absent means 65535.
    ReceiveMaximum(U16Data),

    /// Two Byte Integer. Used in CONNECT, CONNACK.
    ///
    /// Highest topic alias value the sender accepts from its peer; absent
    /// means 0, i.e. no aliases at all.
    TopicAliasMaximum(U16Data),

    /// Two Byte Integer. Used in PUBLISH.
    ///
    /// An integer value standing in for the topic name. 0 is a protocol
    /// error, as is any value above the peer's topic alias maximum.
    TopicAlias(U16Data),

    /// Byte. Used in CONNACK.
    ///
    /// Only 0 or 1 are valid; absent means `QoS` 2 is supported.
    MaximumQoS(QoS),

    /// Byte. Used in CONNACK.
    RetainAvailable(BoolData),

    /// UTF-8 String Pair. Used everywhere, may appear multiple times;
    /// order is preserved when forwarding [MQTT-3.3.2-18].
    UserProperty(StringPairData),

    /// Four Byte Integer. Used in CONNECT, CONNACK.
    ///
    /// Maximum packet size the sender is willing to accept; 0 is a
    /// protocol error. Packets too large to send MUST be discarded
    /// without sending them [MQTT-3.1.2-25].
    MaximumPacketSize(U32Data),

    /// Byte. Used in CONNACK.
    WildcardSubscriptionAvailable(BoolData),

    /// Byte. Used in CONNACK.
    SubscriptionIdentifierAvailable(BoolData),

    /// Byte. Used in CONNACK.
    SharedSubscriptionAvailable(BoolData),
}

impl Property {
    /// Get type of the property.
    #[must_use]
    pub const fn property_type(&self) -> PropertyType {
        match self {
            Self::PayloadFormatIndicator(_) => PropertyType::PayloadFormatIndicator,
            Self::MessageExpiryInterval(_) => PropertyType::MessageExpiryInterval,
            Self::ContentType(_) => PropertyType::ContentType,
            Self::ResponseTopic(_) => PropertyType::ResponseTopic,
            Self::CorrelationData(_) => PropertyType::CorrelationData,
            Self::SubscriptionIdentifier(_) => PropertyType::SubscriptionIdentifier,
            Self::SessionExpiryInterval(_) => PropertyType::SessionExpiryInterval,
            Self::AssignedClientIdentifier(_) => PropertyType::AssignedClientIdentifier,
            Self::ServerKeepAlive(_) => PropertyType::ServerKeepAlive,
            Self::AuthenticationMethod(_) => PropertyType::AuthenticationMethod,
            Self::AuthenticationData(_) => PropertyType::AuthenticationData,
            Self::RequestProblemInformation(_) => PropertyType::RequestProblemInformation,
            Self::WillDelayInterval(_) => PropertyType::WillDelayInterval,
            Self::RequestResponseInformation(_) => PropertyType::RequestResponseInformation,
            Self::ResponseInformation(_) => PropertyType::ResponseInformation,
            Self::ServerReference(_) => PropertyType::ServerReference,
            Self::ReasonString(_) => PropertyType::ReasonString,
            Self::ReceiveMaximum(_) => PropertyType::ReceiveMaximum,
            Self::TopicAliasMaximum(_) => PropertyType::TopicAliasMaximum,
            Self::TopicAlias(_) => PropertyType::TopicAlias,
            Self::MaximumQoS(_) => PropertyType::MaximumQoS,
            Self::RetainAvailable(_) => PropertyType::RetainAvailable,
            Self::UserProperty(_) => PropertyType::UserProperty,
            Self::MaximumPacketSize(_) => PropertyType::MaximumPacketSize,
            Self::WildcardSubscriptionAvailable(_) => PropertyType::WildcardSubscriptionAvailable,
            Self::SubscriptionIdentifierAvailable(_) => {
                PropertyType::SubscriptionIdentifierAvailable
            }
            Self::SharedSubscriptionAvailable(_) => PropertyType::SharedSubscriptionAvailable,
        }
    }

    /// Get byte length used in packets.
    #[allow(clippy::match_same_arms)]
    #[must_use]
    pub fn bytes(&self) -> usize {
        let value_bytes = match self {
            Self::AssignedClientIdentifier(value) => value.bytes(),
            Self::AuthenticationData(value) => value.bytes(),
            Self::AuthenticationMethod(value) => value.bytes(),
            Self::ContentType(value) => value.bytes(),
            Self::CorrelationData(value) => value.bytes(),
            Self::MaximumPacketSize(..) => U32Data::bytes(),
            Self::MaximumQoS(..) => QoS::bytes(),
            Self::MessageExpiryInterval(..) => U32Data::bytes(),
            Self::PayloadFormatIndicator(..) => BoolData::bytes(),
            Self::ReasonString(value) => value.bytes(),
            Self::ReceiveMaximum(..) => U16Data::bytes(),
            Self::RequestProblemInformation(..) => BoolData::bytes(),
            Self::RequestResponseInformation(..) => BoolData::bytes(),
            Self::ResponseInformation(value) => value.bytes(),
            Self::ResponseTopic(value) => value.bytes(),
            Self::RetainAvailable(..) => BoolData::bytes(),
            Self::ServerKeepAlive(..) => U16Data::bytes(),
            Self::ServerReference(value) => value.bytes(),
            Self::SessionExpiryInterval(..) => U32Data::bytes(),
            Self::SharedSubscriptionAvailable(..) => BoolData::bytes(),
            Self::SubscriptionIdentifier(value) => value.bytes(),
            Self::SubscriptionIdentifierAvailable(..) => BoolData::bytes(),
            Self::TopicAlias(..) => U16Data::bytes(),
            Self::TopicAliasMaximum(..) => U16Data::bytes(),
            Self::UserProperty(value) => value.bytes(),
            Self::WildcardSubscriptionAvailable(..) => BoolData::bytes(),
            Self::WillDelayInterval(..) => U32Data::bytes(),
        };

        PropertyType::bytes() + value_bytes
    }
}

impl Property {
    /// The peer is willing to process 65535 concurrent `QoS` 1/2
    /// publications when the property is absent.
    #[must_use]
    pub const fn default_receive_maximum() -> u16 {
        u16::MAX
    }

    #[must_use]
    pub const fn default_topic_alias_maximum() -> u16 {
        0
    }

    #[must_use]
    pub const fn default_request_response_information() -> bool {
        false
    }

    #[must_use]
    pub const fn default_request_problem_information() -> bool {
        true
    }

    #[must_use]
    pub const fn default_will_delay_interval() -> u32 {
        0
    }

    #[must_use]
    pub const fn default_session_expiry_interval() -> u32 {
        0
    }
}

impl DecodePacket for Property {
    #[allow(clippy::too_many_lines)]
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let property_type = PropertyType::try_from(ba.read_byte()?)?;
        match property_type {
            PropertyType::PayloadFormatIndicator => {
                let on = BoolData::decode(ba)?;
                Ok(Self::PayloadFormatIndicator(on))
            }
            PropertyType::MessageExpiryInterval => {
                let interval = U32Data::decode(ba)?;
                Ok(Self::MessageExpiryInterval(interval))
            }
            PropertyType::ContentType => {
                let content_type = StringData::decode(ba)?;
                Ok(Self::ContentType(content_type))
            }
            PropertyType::ResponseTopic => {
                let topic = PubTopic::decode(ba)?;
                Ok(Self::ResponseTopic(topic))
            }
            PropertyType::CorrelationData => {
                let data = BinaryData::decode(ba)?;
                Ok(Self::CorrelationData(data))
            }
            PropertyType::SubscriptionIdentifier => {
                let id = VarInt::decode(ba)?;
                if id.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::SubscriptionIdentifier(id))
            }
            PropertyType::SessionExpiryInterval => {
                let interval = U32Data::decode(ba)?;
                Ok(Self::SessionExpiryInterval(interval))
            }
            PropertyType::AssignedClientIdentifier => {
                let client_id = StringData::decode(ba)?;
                validate_client_id(client_id.as_ref())?;
                Ok(Self::AssignedClientIdentifier(client_id))
            }
            PropertyType::ServerKeepAlive => {
                let keep_alive = U16Data::decode(ba)?;
                Ok(Self::ServerKeepAlive(keep_alive))
            }
            PropertyType::AuthenticationMethod => {
                let method = StringData::decode(ba)?;
                Ok(Self::AuthenticationMethod(method))
            }
            PropertyType::AuthenticationData => {
                let data = BinaryData::decode(ba)?;
                Ok(Self::AuthenticationData(data))
            }
            PropertyType::RequestProblemInformation => {
                let on = BoolData::decode(ba)?;
                Ok(Self::RequestProblemInformation(on))
            }
            PropertyType::WillDelayInterval => {
                let interval = U32Data::decode(ba)?;
                Ok(Self::WillDelayInterval(interval))
            }
            PropertyType::RequestResponseInformation => {
                let on = BoolData::decode(ba)?;
                Ok(Self::RequestResponseInformation(on))
            }
            PropertyType::ResponseInformation => {
                let info = StringData::decode(ba)?;
                Ok(Self::ResponseInformation(info))
            }
            PropertyType::ServerReference => {
                let reference = StringData::decode(ba)?;
                Ok(Self::ServerReference(reference))
            }
            PropertyType::ReasonString => {
                let reason = StringData::decode(ba)?;
                Ok(Self::ReasonString(reason))
            }
            PropertyType::ReceiveMaximum => {
                let max = U16Data::decode(ba)?;
                if max.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::ReceiveMaximum(max))
            }
            PropertyType::TopicAliasMaximum => {
                let max = U16Data::decode(ba)?;
                Ok(Self::TopicAliasMaximum(max))
            }
            PropertyType::TopicAlias => {
                let alias = U16Data::decode(ba)?;
                Ok(Self::TopicAlias(alias))
            }
            PropertyType::MaximumQoS => {
                let qos = QoS::decode(ba)?;
                if qos == QoS::ExactOnce {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumQoS(qos))
            }
            PropertyType::RetainAvailable => {
                let available = BoolData::decode(ba)?;
                Ok(Self::RetainAvailable(available))
            }
            PropertyType::UserProperty => {
                let pair = StringPairData::decode(ba)?;
                Ok(Self::UserProperty(pair))
            }
            PropertyType::MaximumPacketSize => {
                let max = U32Data::decode(ba)?;
                if max.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumPacketSize(max))
            }
            PropertyType::WildcardSubscriptionAvailable => {
                let available = BoolData::decode(ba)?;
                Ok(Self::WildcardSubscriptionAvailable(available))
            }
            PropertyType::SubscriptionIdentifierAvailable => {
                let available = BoolData::decode(ba)?;
                Ok(Self::SubscriptionIdentifierAvailable(available))
            }
            PropertyType::SharedSubscriptionAvailable => {
                let available = BoolData::decode(ba)?;
                Ok(Self::SharedSubscriptionAvailable(available))
            }
        }
    }
}

impl EncodePacket for Property {
    #[allow(clippy::match_same_arms)]
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(self.property_type() as u8);
        let value_bytes = match self {
            Self::AssignedClientIdentifier(client_id) => client_id.encode(buf)?,
            Self::AuthenticationData(data) => data.encode(buf)?,
            Self::AuthenticationMethod(method) => method.encode(buf)?,
            Self::ContentType(content_type) => content_type.encode(buf)?,
            Self::CorrelationData(data) => data.encode(buf)?,
            Self::MaximumPacketSize(max) => max.encode(buf)?,
            Self::MaximumQoS(qos) => qos.encode(buf)?,
            Self::MessageExpiryInterval(interval) => interval.encode(buf)?,
            Self::PayloadFormatIndicator(on) => on.encode(buf)?,
            Self::ReasonString(reason) => reason.encode(buf)?,
            Self::ReceiveMaximum(max) => max.encode(buf)?,
            Self::RequestProblemInformation(on) => on.encode(buf)?,
            Self::RequestResponseInformation(on) => on.encode(buf)?,
            Self::ResponseInformation(info) => info.encode(buf)?,
            Self::ResponseTopic(topic) => topic.encode(buf)?,
            Self::RetainAvailable(available) => available.encode(buf)?,
            Self::ServerKeepAlive(keep_alive) => keep_alive.encode(buf)?,
            Self::ServerReference(reference) => reference.encode(buf)?,
            Self::SessionExpiryInterval(interval) => interval.encode(buf)?,
            Self::SharedSubscriptionAvailable(available) => available.encode(buf)?,
            Self::SubscriptionIdentifier(id) => id.encode(buf)?,
            Self::SubscriptionIdentifierAvailable(available) => available.encode(buf)?,
            Self::TopicAlias(alias) => alias.encode(buf)?,
            Self::TopicAliasMaximum(value) => value.encode(buf)?,
            Self::UserProperty(pair) => pair.encode(buf)?,
            Self::WildcardSubscriptionAvailable(available) => available.encode(buf)?,
            Self::WillDelayInterval(interval) => interval.encode(buf)?,
        };
        Ok(PropertyType::bytes() + value_bytes)
    }
}

/// Ordered list of properties, preceded on the wire by its byte length
/// as a variable byte integer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Properties(Vec<Property>);

impl AsRef<[Property]> for Properties {
    fn as_ref(&self) -> &[Property] {
        self.0.as_ref()
    }
}

impl Properties {
    /// Create an empty property list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Get byte length of the whole list in packet, length prefix included.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let payload_bytes = self.payload_bytes();
        // Property list byte length is always within var int range because
        // every member already fits into one packet.
        let len = VarInt::from(payload_bytes).unwrap_or_default();
        len.bytes() + payload_bytes
    }

    fn payload_bytes(&self) -> usize {
        self.0.iter().map(Property::bytes).sum()
    }

    /// Get number of properties in list.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether property list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get a reference to property list.
    #[must_use]
    pub fn props(&self) -> &[Property] {
        &self.0
    }

    /// Clear property list.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Append a property.
    pub fn push(&mut self, property: Property) {
        self.0.push(property);
    }

    /// Remove every property of `property_type` from the list, keeping
    /// the order of the others.
    pub fn remove(&mut self, property_type: PropertyType) {
        self.0.retain(|p| p.property_type() != property_type);
    }

    /// Find the first property of `property_type`.
    #[must_use]
    pub fn find(&self, property_type: PropertyType) -> Option<&Property> {
        self.0.iter().find(|p| p.property_type() == property_type)
    }

    /// Get session expiry interval value if present.
    #[must_use]
    pub fn session_expiry_interval(&self) -> Option<u32> {
        if let Some(Property::SessionExpiryInterval(v)) =
            self.find(PropertyType::SessionExpiryInterval)
        {
            Some(v.value())
        } else {
            None
        }
    }

    /// Get receive maximum value if present.
    #[must_use]
    pub fn receive_maximum(&self) -> Option<u16> {
        if let Some(Property::ReceiveMaximum(v)) = self.find(PropertyType::ReceiveMaximum) {
            Some(v.value())
        } else {
            None
        }
    }

    /// Get topic alias maximum value if present.
    #[must_use]
    pub fn topic_alias_maximum(&self) -> Option<u16> {
        if let Some(Property::TopicAliasMaximum(v)) = self.find(PropertyType::TopicAliasMaximum) {
            Some(v.value())
        } else {
            None
        }
    }

    /// Get topic alias value if present.
    #[must_use]
    pub fn topic_alias(&self) -> Option<u16> {
        if let Some(Property::TopicAlias(v)) = self.find(PropertyType::TopicAlias) {
            Some(v.value())
        } else {
            None
        }
    }

    /// Get maximum packet size value if present.
    #[must_use]
    pub fn maximum_packet_size(&self) -> Option<u32> {
        if let Some(Property::MaximumPacketSize(v)) = self.find(PropertyType::MaximumPacketSize) {
            Some(v.value())
        } else {
            None
        }
    }

    /// Get server keep alive value if present.
    #[must_use]
    pub fn server_keep_alive(&self) -> Option<u16> {
        if let Some(Property::ServerKeepAlive(v)) = self.find(PropertyType::ServerKeepAlive) {
            Some(v.value())
        } else {
            None
        }
    }

    /// Get will delay interval value if present.
    #[must_use]
    pub fn will_delay_interval(&self) -> Option<u32> {
        if let Some(Property::WillDelayInterval(v)) = self.find(PropertyType::WillDelayInterval) {
            Some(v.value())
        } else {
            None
        }
    }

    /// Get message expiry interval value if present.
    #[must_use]
    pub fn message_expiry_interval(&self) -> Option<u32> {
        if let Some(Property::MessageExpiryInterval(v)) =
            self.find(PropertyType::MessageExpiryInterval)
        {
            Some(v.value())
        } else {
            None
        }
    }

    /// Get request response information flag if present.
    #[must_use]
    pub fn request_response_information(&self) -> Option<bool> {
        if let Some(Property::RequestResponseInformation(v)) =
            self.find(PropertyType::RequestResponseInformation)
        {
            Some(v.value())
        } else {
            None
        }
    }
}

impl DecodePacket for Properties {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let remaining_length = VarInt::decode(ba)?;
        let mut remaining_length = remaining_length.value();
        let mut properties = Vec::new();
        while remaining_length > 0 {
            let property = Property::decode(ba)?;
            remaining_length = remaining_length
                .checked_sub(property.bytes())
                .ok_or(DecodeError::InvalidRemainingLength)?;
            properties.push(property);
        }

        Ok(Self(properties))
    }
}

impl EncodePacket for Properties {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let len = VarInt::from(self.payload_bytes())?;
        let mut bytes_written = len.bytes();
        len.encode(buf)?;
        for property in &self.0 {
            bytes_written += property.encode(buf)?;
        }

        Ok(bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_round_trip() {
        let mut properties = Properties::new();
        properties.push(Property::SessionExpiryInterval(U32Data::new(120)));
        properties.push(Property::ReceiveMaximum(U16Data::new(24)));
        properties.push(Property::UserProperty(
            StringPairData::from("key", "value").unwrap(),
        ));

        let mut buf = Vec::new();
        let written = properties.encode(&mut buf).unwrap();
        assert_eq!(written, properties.bytes());

        let mut ba = ByteArray::new(&buf);
        let decoded = Properties::decode(&mut ba).unwrap();
        assert_eq!(decoded, properties);
        assert_eq!(decoded.session_expiry_interval(), Some(120));
        assert_eq!(decoded.receive_maximum(), Some(24));
    }

    #[test]
    fn test_zero_receive_maximum_rejected() {
        let buf = [0x03, 0x21, 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            Properties::decode(&mut ba),
            Err(DecodeError::InvalidPropertyValue)
        );
    }

    #[test]
    fn test_check_property_type_list() {
        let mut properties = Properties::new();
        properties.push(Property::TopicAlias(U16Data::new(4)));
        assert!(check_property_type_list(
            properties.props(),
            &[PropertyType::TopicAlias, PropertyType::UserProperty]
        )
        .is_ok());
        assert_eq!(
            check_property_type_list(properties.props(), &[PropertyType::UserProperty]),
            Err(PropertyType::TopicAlias)
        );

        properties.push(Property::TopicAlias(U16Data::new(5)));
        assert_eq!(
            check_property_type_list(properties.props(), &[PropertyType::TopicAlias]),
            Err(PropertyType::TopicAlias)
        );
    }
}
