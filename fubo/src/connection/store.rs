// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{Packet, PacketId, QoS};

/// Which inbound packet retires a stored packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseTag {
    V3PublishAck,
    V5PublishAck,
    V3PublishReceived,
    V5PublishReceived,
    V3PublishComplete,
    V5PublishComplete,
}

/// An in-flight publish or publish-release, kept until the matching
/// acknowledgement returns or the session dies.
#[derive(Clone, Debug)]
pub struct StoredPacket {
    packet: Packet,
    response: ResponseTag,
    packet_id: PacketId,
}

impl StoredPacket {
    /// Wrap a packet eligible for storage.
    ///
    /// Only `QoS` 1/2 publishes and publish-release packets are stored;
    /// anything else returns `None`.
    #[must_use]
    pub fn new(packet: Packet) -> Option<Self> {
        let (response, packet_id) = match &packet {
            Packet::PublishV3(p) => match p.qos() {
                QoS::AtLeastOnce => (ResponseTag::V3PublishAck, p.packet_id()),
                QoS::ExactOnce => (ResponseTag::V3PublishReceived, p.packet_id()),
                QoS::AtMostOnce => return None,
            },
            Packet::PublishV5(p) => match p.qos() {
                QoS::AtLeastOnce => (ResponseTag::V5PublishAck, p.packet_id()),
                QoS::ExactOnce => (ResponseTag::V5PublishReceived, p.packet_id()),
                QoS::AtMostOnce => return None,
            },
            Packet::PublishReleaseV3(p) => (ResponseTag::V3PublishComplete, p.packet_id()),
            Packet::PublishReleaseV5(p) => (ResponseTag::V5PublishComplete, p.packet_id()),
            _ => return None,
        };
        Some(Self {
            packet,
            response,
            packet_id,
        })
    }

    #[must_use]
    pub const fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Consume and return the inner packet.
    #[must_use]
    pub fn into_packet(self) -> Packet {
        self.packet
    }

    #[must_use]
    pub const fn response(&self) -> ResponseTag {
        self.response
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }
}

/// Insertion-ordered store of in-flight packets, indexed by the response
/// which retires each entry.
///
/// Replay on session resumption walks the store in insertion order, so
/// re-sent publishes keep their original relative order.
#[derive(Debug, Default)]
pub struct OutboundStore {
    packets: Vec<StoredPacket>,
}

impl OutboundStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Append a packet. Returns false if an entry with the same id and
    /// response tag is already present.
    pub fn add(&mut self, stored: StoredPacket) -> bool {
        let duplicate = self.packets.iter().any(|p| {
            p.response == stored.response && p.packet_id == stored.packet_id
        });
        if duplicate {
            return false;
        }
        self.packets.push(stored);
        true
    }

    /// Remove the entry retired by `(response, packet_id)`.
    ///
    /// Returns the removed packet, or `None` when no such entry exists.
    pub fn erase(&mut self, response: ResponseTag, packet_id: PacketId) -> Option<StoredPacket> {
        let pos = self
            .packets
            .iter()
            .position(|p| p.response == response && p.packet_id == packet_id)?;
        Some(self.packets.remove(pos))
    }

    /// Visit every stored packet in insertion order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&StoredPacket),
    {
        for packet in &self.packets {
            f(packet);
        }
    }

    /// Copy out every stored packet in insertion order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<StoredPacket> {
        self.packets.clone()
    }

    /// Take every stored packet out, leaving the store empty.
    pub fn drain(&mut self) -> Vec<StoredPacket> {
        std::mem::take(&mut self.packets)
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::v3;

    fn publish(pid: u16, qos: QoS) -> Packet {
        let mut p = v3::PublishPacket::new("t", qos, b"m").unwrap();
        p.set_packet_id(PacketId::new(pid));
        p.into()
    }

    #[test]
    fn test_qos0_not_stored() {
        assert!(StoredPacket::new(publish(0, QoS::AtMostOnce)).is_none());
    }

    #[test]
    fn test_insertion_order_kept() {
        let mut store = OutboundStore::new();
        assert!(store.add(StoredPacket::new(publish(3, QoS::AtLeastOnce)).unwrap()));
        assert!(store.add(StoredPacket::new(publish(1, QoS::ExactOnce)).unwrap()));
        assert!(store.add(
            StoredPacket::new(v3::PublishReleasePacket::new(PacketId::new(2)).into()).unwrap()
        ));

        let mut ids = Vec::new();
        store.for_each(|p| ids.push(p.packet_id().value()));
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_erase_by_response() {
        let mut store = OutboundStore::new();
        store.add(StoredPacket::new(publish(1, QoS::AtLeastOnce)).unwrap());
        store.add(StoredPacket::new(publish(2, QoS::ExactOnce)).unwrap());

        // Wrong tag does not erase.
        assert!(store
            .erase(ResponseTag::V3PublishAck, PacketId::new(2))
            .is_none());
        assert!(store
            .erase(ResponseTag::V3PublishReceived, PacketId::new(2))
            .is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut store = OutboundStore::new();
        assert!(store.add(StoredPacket::new(publish(1, QoS::AtLeastOnce)).unwrap()));
        assert!(!store.add(StoredPacket::new(publish(1, QoS::AtLeastOnce)).unwrap()));
    }
}
