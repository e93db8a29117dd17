// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::io::Write;

use super::property::check_property_type_list;
use super::{Properties, PropertyType};
use crate::header::{FixedHeader, Packet, PacketType};
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, PacketId, PubTopic, QoS,
    VarIntError,
};

/// Properties allowed in a 5.0 publish packet.
pub const PUBLISH_PROPERTIES: &[PropertyType] = &[
    PropertyType::PayloadFormatIndicator,
    PropertyType::MessageExpiryInterval,
    PropertyType::TopicAlias,
    PropertyType::ResponseTopic,
    PropertyType::CorrelationData,
    PropertyType::UserProperty,
    PropertyType::SubscriptionIdentifier,
    PropertyType::ContentType,
];

/// 5.0 publish packet.
///
/// Unlike in 3.1.1 the topic name may be empty, in which case the packet
/// MUST carry a topic alias property referring to an alias the receiver
/// already knows.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishPacket {
    /// Might be a re-delivery of an earlier attempt. MUST be false for
    /// `QoS` 0 messages [MQTT-3.3.1-2].
    dup: bool,

    qos: QoS,

    /// A retained message with a zero byte payload clears the retained
    /// entry for the topic instead of storing one [MQTT-3.3.1-6].
    retain: bool,

    topic: PubTopic,

    /// Only present where the `QoS` level is 1 or 2.
    packet_id: PacketId,

    properties: Properties,

    msg: Vec<u8>,
}

impl PublishPacket {
    /// Create a new publish packet.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS, msg: &[u8]) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic)?;
        Ok(Self {
            qos,
            dup: false,
            retain: false,
            topic,
            packet_id: PacketId::new(0),
            properties: Properties::new(),
            msg: msg.to_vec(),
        })
    }

    /// Update `retain` flag.
    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// Update `dup` flag.
    ///
    /// # Errors
    ///
    /// Returns error if `dup` flag is set in a `QoS` 0 packet.
    pub fn set_dup(&mut self, dup: bool) -> Result<&mut Self, EncodeError> {
        if dup && self.qos == QoS::AtMostOnce {
            return Err(EncodeError::InvalidPacketType);
        }
        self.dup = dup;
        Ok(self)
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    /// Update `qos` value.
    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        if qos == QoS::AtMostOnce {
            self.packet_id = PacketId::new(0);
        }
        self.qos = qos;
        self
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// Update packet id.
    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Update topic value. An empty topic is allowed when a topic alias
    /// property is attached.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn set_topic(&mut self, topic: &str) -> Result<&mut Self, EncodeError> {
        self.topic = PubTopic::new(topic)?;
        Ok(self)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    /// Get a mutable reference to property list.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Get a reference to message payload.
    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.msg
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = self.topic.bytes() + self.properties.bytes() + self.msg.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += PacketId::bytes();
        }

        let packet_type = PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        };
        FixedHeader::new(packet_type, remaining_length)
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let start_offset = ba.offset();
        let fixed_header = FixedHeader::decode(ba)?;

        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidPacketFlags);
        }

        let header_bytes = ba.offset() - start_offset;
        let topic = PubTopic::decode(ba)?;

        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            let packet_id = PacketId::decode(ba)?;
            if packet_id.value() == 0 {
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };

        let properties = Properties::decode(ba)?;
        if let Err(property_type) = check_property_type_list(properties.props(), PUBLISH_PROPERTIES)
        {
            log::error!("v5/PublishPacket: property {property_type:?} is not allowed");
            return Err(DecodeError::PropertyNotAllowed);
        }

        // It is a protocol error if the topic name is zero length and there
        // is no topic alias.
        if topic.is_empty() && properties.topic_alias().is_none() {
            return Err(DecodeError::InvalidTopic);
        }

        // Whatever is left of the remaining length is the payload.
        let consumed = ba.offset() - start_offset - header_bytes;
        let msg_len = fixed_header
            .remaining_length()
            .checked_sub(consumed)
            .ok_or(DecodeError::InvalidRemainingLength)?;

        let msg = ba.read_bytes(msg_len)?.to_vec();
        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            properties,
            msg,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        self.topic.encode(v)?;

        if self.qos() != QoS::AtMostOnce {
            self.packet_id.encode(v)?;
        }

        self.properties.encode(v)?;

        v.write_all(&self.msg)?;

        Ok(v.len() - old_len)
    }
}

impl Packet for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        }
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
    use crate::U16Data;

    #[test]
    fn test_round_trip() {
        let mut packet = PublishPacket::new("sensor/temp", QoS::AtLeastOnce, b"21.5").unwrap();
        packet.set_packet_id(PacketId::new(11));
        packet
            .properties_mut()
            .push(Property::TopicAlias(U16Data::new(3)));

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.properties().topic_alias(), Some(3));
    }

    #[test]
    fn test_empty_topic_needs_alias() {
        let packet = PublishPacket::new("", QoS::AtMostOnce, b"x").unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidTopic)
        );

        let mut packet = PublishPacket::new("", QoS::AtMostOnce, b"x").unwrap();
        packet
            .properties_mut()
            .push(Property::TopicAlias(U16Data::new(3)));
        buf.clear();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert!(PublishPacket::decode(&mut ba).is_ok());
    }
}
