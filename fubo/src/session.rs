// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Broker-side session state, indexed by `(username, client_id)`.

use codec::v5::SubscribeOptions;
use codec::{v3, v5, PacketId, ProtocolLevel, QoS};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::connection::StoredPacket;
use crate::endpoint::EndpointSender;
use crate::trie::SubHandle;
use crate::types::{EndpointId, SessionGid};

/// When server-side session state is discarded after the network
/// connection goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExpiry {
    /// 3.1.1 clean session, or 5.0 with a zero session expiry interval.
    AtClose,

    /// 5.0 session expiry interval.
    After(Duration),

    /// 3.1.1 with clean session off, kept until broker shutdown.
    Never,
}

/// A will message parked until its owner disconnects uncleanly.
#[derive(Debug, Clone)]
pub struct Will {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
    properties: v5::Properties,
    delay: Option<Duration>,
}

impl Will {
    /// Extract the will from a 3.1.1 connect packet.
    #[must_use]
    pub fn from_v3(packet: &v3::ConnectPacket) -> Option<Self> {
        let topic = packet.will_topic()?;
        Some(Self {
            topic: topic.to_string(),
            payload: packet.will_message().to_vec(),
            qos: packet.connect_flags().will_qos(),
            retain: packet.connect_flags().will_retain(),
            properties: v5::Properties::new(),
            delay: None,
        })
    }

    /// Extract the will from a 5.0 connect packet.
    #[must_use]
    pub fn from_v5(packet: &v5::ConnectPacket) -> Option<Self> {
        let topic = packet.will_topic()?;
        let delay = packet
            .will_properties()
            .will_delay_interval()
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(u64::from(secs)));
        let mut properties = packet.will_properties().clone();
        properties.remove(v5::PropertyType::WillDelayInterval);
        Some(Self {
            topic: topic.to_string(),
            payload: packet.will_message().to_vec(),
            qos: packet.connect_flags().will_qos(),
            retain: packet.connect_flags().will_retain(),
            properties,
            delay,
        })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    #[must_use]
    pub const fn properties(&self) -> &v5::Properties {
        &self.properties
    }

    #[must_use]
    pub const fn delay(&self) -> Option<Duration> {
        self.delay
    }
}

/// An application message in flight between sessions.
///
/// Version-neutral: the per-subscriber publish packet is built at
/// delivery time, in the subscriber's protocol version.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub properties: v5::Properties,
}

/// One subscription held by a session, with its back reference into the
/// global trie.
#[derive(Debug, Clone)]
pub struct SubEntry {
    pub handle: SubHandle,
    pub options: SubscribeOptions,
    pub sub_id: Option<usize>,
}

/// Per-client persisted state.
#[derive(Debug)]
pub struct Session {
    gid: SessionGid,
    protocol_level: ProtocolLevel,

    /// Bound endpoint; `None` marks an offline session.
    endpoint: Option<EndpointSender>,
    endpoint_id: EndpointId,

    /// `(share_name, topic_filter)` to trie back reference.
    pub subscriptions: HashMap<(String, String), SubEntry>,

    /// In-flight packets copied out of the endpoint when the connection
    /// dropped, replayed on resumption.
    pub inflight: Vec<StoredPacket>,

    /// Receiver-side `QoS` 2 ids carried across reconnects.
    pub qos2_received: Vec<PacketId>,

    /// Messages routed here while no endpoint was bound.
    pub offline_queue: VecDeque<Message>,

    pub will: Option<Will>,
    pub expiry: SessionExpiry,
    pub response_topic: Option<String>,

    /// Bumped on every bind/unbind; session-expiry and will-delay timers
    /// carry the epoch they were armed in and give up on mismatch.
    epoch: u64,
}

impl Session {
    #[must_use]
    pub fn new(
        gid: SessionGid,
        protocol_level: ProtocolLevel,
        endpoint: EndpointSender,
        endpoint_id: EndpointId,
        expiry: SessionExpiry,
    ) -> Self {
        Self {
            gid,
            protocol_level,
            endpoint: Some(endpoint),
            endpoint_id,
            subscriptions: HashMap::new(),
            inflight: Vec::new(),
            qos2_received: Vec::new(),
            offline_queue: VecDeque::new(),
            will: None,
            expiry,
            response_topic: None,
            epoch: 0,
        }
    }

    #[must_use]
    pub const fn gid(&self) -> &SessionGid {
        &self.gid
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.endpoint.is_some()
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<EndpointSender> {
        self.endpoint.clone()
    }

    #[must_use]
    pub const fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Bind a new endpoint after reconnect or takeover, invalidating any
    /// pending timers.
    pub fn bind_endpoint(
        &mut self,
        protocol_level: ProtocolLevel,
        endpoint: EndpointSender,
        endpoint_id: EndpointId,
        expiry: SessionExpiry,
    ) {
        self.protocol_level = protocol_level;
        self.endpoint = Some(endpoint);
        self.endpoint_id = endpoint_id;
        self.expiry = expiry;
        self.epoch += 1;
    }

    /// Detach from the endpoint, transitioning to offline.
    pub fn become_offline(&mut self, inflight: Vec<StoredPacket>, qos2_received: Vec<PacketId>) {
        self.endpoint = None;
        self.inflight = inflight;
        self.qos2_received = qos2_received;
        self.epoch += 1;
    }
}

/// The broker's session table with its side index.
///
/// Every structural change updates the owning map and the endpoint index
/// together; a session is either reachable through both or through
/// neither.
#[derive(Debug, Default)]
pub struct SessionStore {
    by_gid: HashMap<SessionGid, Session>,
    by_endpoint: HashMap<EndpointId, SessionGid>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_gid.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_gid.is_empty()
    }

    #[must_use]
    pub fn get(&self, gid: &SessionGid) -> Option<&Session> {
        self.by_gid.get(gid)
    }

    pub fn get_mut(&mut self, gid: &SessionGid) -> Option<&mut Session> {
        self.by_gid.get_mut(gid)
    }

    #[must_use]
    pub fn gid_of_endpoint(&self, endpoint_id: EndpointId) -> Option<&SessionGid> {
        self.by_endpoint.get(&endpoint_id)
    }

    /// Insert a fresh session, replacing any previous record of the gid.
    pub fn insert(&mut self, session: Session) {
        if let Some(old) = self.by_gid.remove(&session.gid) {
            self.by_endpoint.remove(&old.endpoint_id);
        }
        self.by_endpoint
            .insert(session.endpoint_id, session.gid.clone());
        self.by_gid.insert(session.gid.clone(), session);
    }

    /// Rebind an existing session to a new endpoint.
    pub fn rebind(
        &mut self,
        gid: &SessionGid,
        protocol_level: ProtocolLevel,
        endpoint: EndpointSender,
        endpoint_id: EndpointId,
        expiry: SessionExpiry,
    ) -> bool {
        let Some(session) = self.by_gid.get_mut(gid) else {
            return false;
        };
        self.by_endpoint.remove(&session.endpoint_id);
        session.bind_endpoint(protocol_level, endpoint, endpoint_id, expiry);
        self.by_endpoint.insert(endpoint_id, gid.clone());
        true
    }

    /// Move the session of `endpoint_id` offline; the endpoint index
    /// entry is dropped.
    pub fn detach_endpoint(
        &mut self,
        endpoint_id: EndpointId,
        inflight: Vec<StoredPacket>,
        qos2_received: Vec<PacketId>,
    ) -> Option<&mut Session> {
        let gid = self.by_endpoint.remove(&endpoint_id)?;
        let session = self.by_gid.get_mut(&gid)?;
        session.become_offline(inflight, qos2_received);
        Some(session)
    }

    /// Remove the session record entirely.
    pub fn remove(&mut self, gid: &SessionGid) -> Option<Session> {
        let session = self.by_gid.remove(gid)?;
        self.by_endpoint.remove(&session.endpoint_id);
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A sender whose endpoint never existed; good enough for table
    // bookkeeping tests.
    fn dummy_sender() -> EndpointSender {
        crate::endpoint::detached_sender()
    }

    #[test]
    fn test_store_indices_stay_in_sync() {
        let mut store = SessionStore::new();
        let gid = SessionGid::new("u", "c");
        let session = Session::new(
            gid.clone(),
            ProtocolLevel::V311,
            dummy_sender(),
            7,
            SessionExpiry::Never,
        );
        store.insert(session);
        assert_eq!(store.gid_of_endpoint(7), Some(&gid));

        store.detach_endpoint(7, Vec::new(), Vec::new());
        assert!(store.gid_of_endpoint(7).is_none());
        assert!(store.get(&gid).is_some());
        assert!(!store.get(&gid).unwrap().is_online());

        store.rebind(
            &gid,
            ProtocolLevel::V311,
            dummy_sender(),
            9,
            SessionExpiry::Never,
        );
        assert_eq!(store.gid_of_endpoint(9), Some(&gid));
        assert!(store.get(&gid).unwrap().is_online());

        store.remove(&gid);
        assert!(store.is_empty());
        assert!(store.gid_of_endpoint(9).is_none());
    }

    #[test]
    fn test_epoch_bumps_on_rebind() {
        let mut store = SessionStore::new();
        let gid = SessionGid::new("u", "c");
        store.insert(Session::new(
            gid.clone(),
            ProtocolLevel::V311,
            dummy_sender(),
            1,
            SessionExpiry::Never,
        ));
        let epoch = store.get(&gid).unwrap().epoch();
        store.detach_endpoint(1, Vec::new(), Vec::new());
        assert!(store.get(&gid).unwrap().epoch() > epoch);
    }
}
