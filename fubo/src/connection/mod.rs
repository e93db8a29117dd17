// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Transport-agnostic mqtt connection state machine.
//!
//! The connection consumes byte chunks and host notifications, and emits
//! packets plus side-effect [`Event`]s. It never performs I/O and never
//! waits; timers and streams are owned by the host, normally an
//! [`crate::endpoint::Endpoint`].

use codec::v5::ReasonCode;
use codec::{v3, v5, Packet, PacketId, PacketReader, ProtocolLevel, QoS};
use codec::{DecodeError, EncodePacket};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

mod alias;
mod event;
mod packet_id;
mod store;

pub use alias::{TopicAliasRecv, TopicAliasSend};
pub use event::{Event, TimerKind, TimerOp};
pub use packet_id::PacketIdPool;
pub use store::{OutboundStore, ResponseTag, StoredPacket};

use crate::error::{Error, ErrorKind};

/// Which end of the connection this state machine plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sends connect, runs the ping request timer.
    Client,

    /// Receives connect, enforces the keep alive read timeout.
    Server,

    /// Both sets of duties, e.g. a broker-to-broker link.
    Any,
}

impl Role {
    const fn is_client(self) -> bool {
        matches!(self, Self::Client | Self::Any)
    }

    const fn is_server(self) -> bool {
        matches!(self, Self::Server | Self::Any)
    }
}

/// Connection lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// The mqtt protocol state machine, shared by client and broker sides.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    status: Status,
    protocol_level: ProtocolLevel,
    reader: PacketReader,

    pool: PacketIdPool,
    store: OutboundStore,
    alias_send: TopicAliasSend,
    alias_recv: TopicAliasRecv,

    auto_pub_response: bool,
    auto_ping_response: bool,
    auto_map_topic_alias_send: bool,
    auto_replace_topic_alias_send: bool,
    offline_publish: bool,
    pingresp_recv_timeout: Option<Duration>,
    pingreq_send_interval: Option<Duration>,
    pingreq_interval_overridden: bool,

    /// Keep alive seconds negotiated on connect.
    keep_alive: u16,

    /// Whether session state survives a disconnect: 3.1.1 clean-session
    /// false, or a 5.0 session expiry interval above zero.
    persistent_session: bool,

    /// Peer's maximum packet size; larger outgoing packets are dropped.
    maximum_packet_size_send: usize,

    /// Peer's receive maximum; `None` means unlimited (3.1.1).
    publish_send_max: Option<u16>,
    publish_send_count: u16,

    /// `QoS` 1/2 publishes waiting for the send window to open,
    /// in arrival order.
    publish_queue: VecDeque<Packet>,

    /// `QoS` 1/2 publishes accepted while not connected.
    offline_queue: VecDeque<Packet>,

    /// `QoS` 2 publishes surfaced to the host but not released yet.
    qos2_publish_handled: HashSet<u16>,

    pid_puback: HashSet<u16>,
    pid_pubrec: HashSet<u16>,
    pid_pubcomp: HashSet<u16>,
    pid_suback: HashSet<u16>,
    pid_unsuback: HashSet<u16>,
}

impl Connection {
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            status: Status::Disconnected,
            protocol_level: ProtocolLevel::V311,
            reader: PacketReader::new(),
            pool: PacketIdPool::new(),
            store: OutboundStore::new(),
            alias_send: TopicAliasSend::new(0),
            alias_recv: TopicAliasRecv::new(0),
            auto_pub_response: false,
            auto_ping_response: false,
            auto_map_topic_alias_send: false,
            auto_replace_topic_alias_send: false,
            offline_publish: false,
            pingresp_recv_timeout: None,
            pingreq_send_interval: None,
            pingreq_interval_overridden: false,
            keep_alive: 0,
            persistent_session: false,
            maximum_packet_size_send: codec::MAX_VAR_INT,
            publish_send_max: None,
            publish_send_count: 0,
            publish_queue: VecDeque::new(),
            offline_queue: VecDeque::new(),
            qos2_publish_handled: HashSet::new(),
            pid_puback: HashSet::new(),
            pid_pubrec: HashSet::new(),
            pid_pubcomp: HashSet::new(),
            pid_suback: HashSet::new(),
            pid_unsuback: HashSet::new(),
        }
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.status, Status::Connected)
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_auto_pub_response(&mut self, on: bool) {
        self.auto_pub_response = on;
    }

    pub fn set_auto_ping_response(&mut self, on: bool) {
        self.auto_ping_response = on;
    }

    pub fn set_auto_map_topic_alias_send(&mut self, on: bool) {
        self.auto_map_topic_alias_send = on;
    }

    pub fn set_auto_replace_topic_alias_send(&mut self, on: bool) {
        self.auto_replace_topic_alias_send = on;
    }

    pub fn set_offline_publish(&mut self, on: bool) {
        self.offline_publish = on;
    }

    pub fn set_pingresp_recv_timeout(&mut self, timeout: Option<Duration>) {
        self.pingresp_recv_timeout = timeout;
    }

    /// Override the ping request cadence derived from the connect
    /// keep alive value.
    pub fn set_pingreq_send_interval(&mut self, interval: Option<Duration>) {
        self.pingreq_send_interval = interval;
        self.pingreq_interval_overridden = true;
    }

    // ----- packet id surface, delegated from the endpoint -----

    pub fn acquire_packet_id(&mut self) -> Option<PacketId> {
        self.pool.acquire()
    }

    pub fn register_packet_id(&mut self, packet_id: PacketId) -> bool {
        self.pool.register(packet_id)
    }

    pub fn release_packet_id(&mut self, packet_id: PacketId) -> bool {
        self.pool.release(packet_id)
    }

    // ----- session snapshot / restore -----

    /// Copy of all in-flight packets in insertion order.
    #[must_use]
    pub fn get_stored_packets(&self) -> Vec<StoredPacket> {
        self.store.to_vec()
    }

    /// `QoS` 2 publish ids received but not released yet.
    #[must_use]
    pub fn get_qos2_handled(&self) -> Vec<PacketId> {
        let mut ids: Vec<PacketId> = self
            .qos2_publish_handled
            .iter()
            .map(|id| PacketId::new(*id))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Inject persisted in-flight packets before the first connect.
    ///
    /// Ids conflicting with already-acquired ones are skipped with a log;
    /// expected-response bookkeeping is rebuilt from the packet types.
    pub fn restore_packets(&mut self, packets: Vec<StoredPacket>) {
        for stored in packets {
            let packet_id = stored.packet_id();
            if !self.pool.register(packet_id) {
                log::warn!("connection: Skip restoring conflicting packet id {packet_id}");
                continue;
            }
            match stored.response() {
                ResponseTag::V3PublishAck | ResponseTag::V5PublishAck => {
                    self.pid_puback.insert(packet_id.value());
                }
                ResponseTag::V3PublishReceived | ResponseTag::V5PublishReceived => {
                    self.pid_pubrec.insert(packet_id.value());
                }
                ResponseTag::V3PublishComplete | ResponseTag::V5PublishComplete => {
                    self.pid_pubcomp.insert(packet_id.value());
                }
            }
            self.store.add(stored);
        }
    }

    /// Inject persisted receiver-side `QoS` 2 state before the first
    /// connect.
    pub fn restore_qos2_handled(&mut self, ids: Vec<PacketId>) {
        for id in ids {
            self.qos2_publish_handled.insert(id.value());
        }
    }

    /// Resolve a topic alias so the packet is self-contained for
    /// persistence outside this connection.
    ///
    /// # Errors
    ///
    /// Returns error if the packet is alias-only and the alias is unknown.
    pub fn regulate_publish_for_store(
        &self,
        mut publish: v5::PublishPacket,
    ) -> Result<v5::PublishPacket, Error> {
        if publish.topic().is_empty() {
            let Some(alias) = publish.properties().topic_alias() else {
                return Err(Error::new(
                    ErrorKind::ProtocolError,
                    "publish without topic or alias",
                ));
            };
            let Some(topic) = self.alias_send.topic_of(alias) else {
                return Err(Error::from_string(
                    ErrorKind::ProtocolError,
                    format!("topic alias {alias} is not mapped"),
                ));
            };
            let topic = topic.to_string();
            publish.set_topic(&topic)?;
        }
        publish
            .properties_mut()
            .remove(v5::PropertyType::TopicAlias);
        Ok(publish)
    }

    // ----- inputs -----

    /// Feed a chunk of bytes read from the stream.
    pub fn recv_bytes(&mut self, chunk: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        self.reader.feed(chunk);
        loop {
            match self.reader.next_packet() {
                Ok(Some(buf)) => {
                    match Packet::decode(&buf, self.protocol_level) {
                        Ok(packet) => self.process_recv_packet(packet, &mut events),
                        Err(err) => {
                            self.on_decode_error(err, &mut events);
                            return events;
                        }
                    }
                    if self.status == Status::Disconnected {
                        return events;
                    }
                }
                Ok(None) => return events,
                Err(err) => {
                    self.on_decode_error(err, &mut events);
                    return events;
                }
            }
        }
    }

    /// A timer programmed through [`Event::Timer`] has fired.
    pub fn notify_timer_fired(&mut self, kind: TimerKind) -> Vec<Event> {
        let mut events = Vec::new();
        match kind {
            TimerKind::PingreqSend => {
                if self.status != Status::Connected {
                    return events;
                }
                let pingreq: Packet = if self.protocol_level == ProtocolLevel::V5 {
                    v5::PingRequestPacket::new().into()
                } else {
                    v3::PingRequestPacket::new().into()
                };
                events.push(Event::SendPacket(pingreq));
                if let Some(timeout) = self.pingresp_recv_timeout {
                    events.push(Event::Timer(TimerOp::Reset(
                        TimerKind::PingrespRecv,
                        timeout,
                    )));
                }
                if let Some(interval) = self.pingreq_send_interval {
                    events.push(Event::Timer(TimerOp::Reset(TimerKind::PingreqSend, interval)));
                }
            }
            TimerKind::PingreqRecv | TimerKind::PingrespRecv => {
                self.close_for_keep_alive(&mut events);
            }
        }
        events
    }

    /// The stream is gone; drop per-connection transient state.
    pub fn notify_closed(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        self.status = Status::Disconnected;
        events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqSend)));
        events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqRecv)));
        events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingrespRecv)));

        // Aliases and the flow control window never outlive the network
        // connection; the store does when the session is persistent.
        self.alias_send.clear();
        self.alias_recv.clear();
        self.publish_send_count = 0;
        self.publish_queue.clear();
        self.reader = PacketReader::new();

        if !self.persistent_session {
            for stored in self.store.drain() {
                events.push(Event::ReleasePacketId(stored.packet_id()));
                self.pool.release(stored.packet_id());
            }
            self.pool.clear();
            self.qos2_publish_handled.clear();
            self.pid_puback.clear();
            self.pid_pubrec.clear();
            self.pid_pubcomp.clear();
            self.pid_suback.clear();
            self.pid_unsuback.clear();
        }
        events
    }

    /// Send one packet through the connection.
    ///
    /// # Errors
    ///
    /// Returns error if the packet cannot be sent in the current status,
    /// its packet id was not acquired, or a field cannot be encoded.
    /// Wire emission and follow-up effects come back as events.
    pub fn send(&mut self, packet: Packet) -> Result<Vec<Event>, Error> {
        let mut events = Vec::new();
        match packet {
            Packet::ConnectV3(ref p) => {
                self.check_status(Status::Disconnected)?;
                self.protocol_level = ProtocolLevel::V311;
                self.status = Status::Connecting;
                self.reader = PacketReader::new();
                self.keep_alive = p.keep_alive();
                self.persistent_session = !p.connect_flags().clean_session();
                self.setup_pingreq_interval();
                events.push(Event::SendPacket(packet));
            }
            Packet::ConnectV5(ref p) => {
                self.check_status(Status::Disconnected)?;
                self.protocol_level = ProtocolLevel::V5;
                self.status = Status::Connecting;
                self.reader = PacketReader::new();
                self.keep_alive = p.keep_alive();
                let props = p.properties();
                self.persistent_session = props
                    .session_expiry_interval()
                    .unwrap_or_else(v5::Property::default_session_expiry_interval)
                    > 0;
                self.alias_recv = TopicAliasRecv::new(
                    props
                        .topic_alias_maximum()
                        .unwrap_or_else(v5::Property::default_topic_alias_maximum),
                );
                self.setup_pingreq_interval();
                events.push(Event::SendPacket(packet));
            }
            Packet::ConnectAckV3(ref p) => {
                self.check_status(Status::Connecting)?;
                let session_present = p.session_present();
                let accepted = p.return_code() == v3::ConnectReturnCode::Accepted;
                events.push(Event::SendPacket(packet));
                if accepted {
                    self.status = Status::Connected;
                    self.entered_connected(session_present, &mut events);
                } else {
                    self.status = Status::Disconnected;
                    events.push(Event::Close);
                }
            }
            Packet::ConnectAckV5(ref p) => {
                self.check_status(Status::Connecting)?;
                let session_present = p.session_present();
                let accepted = !p.reason_code().is_error();
                let props = p.properties();
                self.alias_recv = TopicAliasRecv::new(
                    props
                        .topic_alias_maximum()
                        .unwrap_or_else(v5::Property::default_topic_alias_maximum),
                );
                if let Some(server_keep_alive) = props.server_keep_alive() {
                    self.keep_alive = server_keep_alive;
                    if self.role.is_server() && self.keep_alive > 0 {
                        events.push(Event::Timer(TimerOp::Reset(
                            TimerKind::PingreqRecv,
                            keep_alive_recv_timeout(self.keep_alive),
                        )));
                    }
                }
                events.push(Event::SendPacket(packet));
                if accepted {
                    self.status = Status::Connected;
                    self.entered_connected(session_present, &mut events);
                } else {
                    self.status = Status::Disconnected;
                    events.push(Event::Close);
                }
            }
            Packet::PublishV3(_) | Packet::PublishV5(_) => {
                self.send_publish(packet, &mut events)?;
            }
            Packet::PublishReleaseV3(ref p) => {
                self.check_connected()?;
                let pid = p.packet_id();
                self.pid_pubcomp.insert(pid.value());
                if let Some(stored) = StoredPacket::new(packet.clone()) {
                    self.store.add(stored);
                }
                events.push(Event::SendPacket(packet));
            }
            Packet::PublishReleaseV5(ref p) => {
                self.check_connected()?;
                let pid = p.packet_id();
                self.pid_pubcomp.insert(pid.value());
                if let Some(stored) = StoredPacket::new(packet.clone()) {
                    self.store.add(stored);
                }
                events.push(Event::SendPacket(packet));
            }
            Packet::SubscribeV3(ref p) => {
                self.check_connected()?;
                self.check_pid_acquired(p.packet_id())?;
                self.pid_suback.insert(p.packet_id().value());
                events.push(Event::SendPacket(packet));
            }
            Packet::SubscribeV5(ref p) => {
                self.check_connected()?;
                self.check_pid_acquired(p.packet_id())?;
                self.pid_suback.insert(p.packet_id().value());
                events.push(Event::SendPacket(packet));
            }
            Packet::UnsubscribeV3(ref p) => {
                self.check_connected()?;
                self.check_pid_acquired(p.packet_id())?;
                self.pid_unsuback.insert(p.packet_id().value());
                events.push(Event::SendPacket(packet));
            }
            Packet::UnsubscribeV5(ref p) => {
                self.check_connected()?;
                self.check_pid_acquired(p.packet_id())?;
                self.pid_unsuback.insert(p.packet_id().value());
                events.push(Event::SendPacket(packet));
            }
            Packet::PingRequestV3(_) | Packet::PingRequestV5(_) => {
                self.check_connected()?;
                events.push(Event::SendPacket(packet));
                if let Some(timeout) = self.pingresp_recv_timeout {
                    events.push(Event::Timer(TimerOp::Reset(
                        TimerKind::PingrespRecv,
                        timeout,
                    )));
                }
            }
            Packet::DisconnectV3(_) | Packet::DisconnectV5(_) => {
                if self.status == Status::Disconnected {
                    return Err(Error::new(
                        ErrorKind::SendError,
                        "connection is already disconnected",
                    ));
                }
                self.status = Status::Disconnecting;
                events.push(Event::SendPacket(packet));
                events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqSend)));
                events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingrespRecv)));
            }
            _ => {
                // Acks, ping responses and auth packets pass through; the
                // receive side already adjusted its bookkeeping.
                if self.status == Status::Disconnected {
                    return Err(Error::new(
                        ErrorKind::SendError,
                        "cannot send packet when disconnected",
                    ));
                }
                events.push(Event::SendPacket(packet));
            }
        }

        // Every outgoing packet proves liveness; push the ping cadence out.
        if self.role.is_client() && self.status != Status::Disconnected {
            if let Some(interval) = self.pingreq_send_interval {
                events.push(Event::Timer(TimerOp::Reset(TimerKind::PingreqSend, interval)));
            }
        }
        Ok(events)
    }

    // ----- internals, send side -----

    fn check_status(&self, expected: Status) -> Result<(), Error> {
        if self.status == expected {
            Ok(())
        } else {
            Err(Error::from_string(
                ErrorKind::SendError,
                format!("invalid status {:?}, expected {expected:?}", self.status),
            ))
        }
    }

    fn check_connected(&self) -> Result<(), Error> {
        if self.status == Status::Connected {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::NotConnected, "not connected"))
        }
    }

    fn check_pid_acquired(&self, packet_id: PacketId) -> Result<(), Error> {
        if packet_id.value() == 0 || !self.pool.is_used(packet_id) {
            return Err(Error::from_string(
                ErrorKind::SendError,
                format!("packet id {packet_id} was not acquired"),
            ));
        }
        Ok(())
    }

    fn setup_pingreq_interval(&mut self) {
        if !self.pingreq_interval_overridden {
            self.pingreq_send_interval = if self.keep_alive > 0 {
                Some(Duration::from_secs(u64::from(self.keep_alive)))
            } else {
                None
            };
        }
    }

    fn send_publish(&mut self, packet: Packet, events: &mut Vec<Event>) -> Result<(), Error> {
        let qos = match &packet {
            Packet::PublishV3(p) => p.qos(),
            Packet::PublishV5(p) => p.qos(),
            _ => unreachable!("send_publish only accepts publish packets"),
        };

        if self.status != Status::Connected {
            if self.offline_publish && qos != QoS::AtMostOnce {
                self.offline_queue.push_back(packet);
                return Ok(());
            }
            return Err(Error::new(ErrorKind::NotConnected, "not connected"));
        }

        let packet = match packet {
            Packet::PublishV5(publish) => Packet::PublishV5(self.apply_topic_alias(publish)?),
            other => other,
        };

        if qos != QoS::AtMostOnce {
            let pid = match &packet {
                Packet::PublishV3(p) => p.packet_id(),
                Packet::PublishV5(p) => p.packet_id(),
                _ => unreachable!(),
            };
            self.check_pid_acquired(pid)?;

            // Oversized packets are discarded, never sent; the peer
            // behaves as if the message completed [MQTT-3.1.2-25].
            if self.exceeds_packet_size(&packet)? {
                self.pool.release(pid);
                events.push(Event::ReleasePacketId(pid));
                events.push(Event::Error(Error::from_string(
                    ErrorKind::SendError,
                    format!("publish {pid} exceeds peer maximum packet size"),
                )));
                return Ok(());
            }

            // The store keeps a self-contained copy, alias resolved.
            let store_copy = match &packet {
                Packet::PublishV5(p) => {
                    Packet::PublishV5(self.regulate_publish_for_store(p.clone())?)
                }
                other => other.clone(),
            };
            if let Some(stored) = StoredPacket::new(store_copy) {
                self.store.add(stored);
            }
            match qos {
                QoS::AtLeastOnce => self.pid_puback.insert(pid.value()),
                QoS::ExactOnce => self.pid_pubrec.insert(pid.value()),
                QoS::AtMostOnce => unreachable!(),
            };

            if self.send_window_full() {
                self.publish_queue.push_back(packet);
                return Ok(());
            }
            self.publish_send_count += 1;
        } else if self.exceeds_packet_size(&packet)? {
            events.push(Event::Error(Error::new(
                ErrorKind::SendError,
                "publish exceeds peer maximum packet size",
            )));
            return Ok(());
        }

        events.push(Event::SendPacket(packet));
        Ok(())
    }

    fn apply_topic_alias(
        &mut self,
        mut publish: v5::PublishPacket,
    ) -> Result<v5::PublishPacket, Error> {
        let manual_alias = publish.properties().topic_alias();
        if let Some(alias) = manual_alias {
            if alias == 0 || alias > self.alias_send.max() {
                return Err(Error::from_string(
                    ErrorKind::ProtocolError,
                    format!("topic alias {alias} out of range"),
                ));
            }
            if !publish.topic().is_empty() {
                self.alias_send.bind(alias, &publish.topic().to_string());
            }
            return Ok(publish);
        }

        if !self.auto_map_topic_alias_send
            || self.alias_send.max() == 0
            || publish.topic().is_empty()
        {
            return Ok(publish);
        }

        let topic = publish.topic().to_string();
        if let Some(alias) = self.alias_send.find(&topic) {
            publish
                .properties_mut()
                .push(v5::Property::TopicAlias(codec::U16Data::new(alias)));
            if self.auto_replace_topic_alias_send {
                // The peer already holds this mapping; send alias only.
                publish.set_topic("")?;
            }
        } else if let Some(alias) = self.alias_send.assign(&topic) {
            // New or recycled alias number: topic and alias go together
            // so the peer (re)registers the mapping.
            publish
                .properties_mut()
                .push(v5::Property::TopicAlias(codec::U16Data::new(alias)));
        }
        Ok(publish)
    }

    fn exceeds_packet_size(&self, packet: &Packet) -> Result<bool, Error> {
        if self.maximum_packet_size_send >= codec::MAX_VAR_INT {
            return Ok(false);
        }
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        Ok(buf.len() > self.maximum_packet_size_send)
    }

    fn send_window_full(&self) -> bool {
        self.publish_send_max
            .is_some_and(|max| self.publish_send_count >= max)
    }

    fn open_send_window(&mut self, events: &mut Vec<Event>) {
        self.publish_send_count = self.publish_send_count.saturating_sub(1);
        while !self.send_window_full() {
            let Some(packet) = self.publish_queue.pop_front() else {
                break;
            };
            self.publish_send_count += 1;
            events.push(Event::SendPacket(packet));
        }
    }

    fn entered_connected(&mut self, session_present: bool, events: &mut Vec<Event>) {
        if session_present {
            let stored = self.store.to_vec();
            for entry in stored {
                let packet = match entry.into_packet() {
                    Packet::PublishV3(mut p) => {
                        let _ = p.set_dup(true);
                        Packet::PublishV3(p)
                    }
                    Packet::PublishV5(mut p) => {
                        let _ = p.set_dup(true);
                        Packet::PublishV5(p)
                    }
                    other => other,
                };
                let is_publish =
                    matches!(packet, Packet::PublishV3(_) | Packet::PublishV5(_));
                if is_publish && self.send_window_full() {
                    self.publish_queue.push_back(packet);
                    continue;
                }
                if is_publish {
                    self.publish_send_count += 1;
                }
                events.push(Event::SendPacket(packet));
            }
        } else {
            for stored in self.store.drain() {
                events.push(Event::ReleasePacketId(stored.packet_id()));
            }
            self.pool.clear();
            self.qos2_publish_handled.clear();
            self.pid_puback.clear();
            self.pid_pubrec.clear();
            self.pid_pubcomp.clear();
            self.pid_suback.clear();
            self.pid_unsuback.clear();
        }

        // Flush publishes accepted while offline through the normal path.
        let offline: Vec<Packet> = self.offline_queue.drain(..).collect();
        for packet in offline {
            if let Err(err) = self.send_publish(packet, events) {
                events.push(Event::Error(err));
            }
        }
    }

    // ----- internals, receive side -----

    #[allow(clippy::too_many_lines)]
    fn process_recv_packet(&mut self, packet: Packet, events: &mut Vec<Event>) {
        // Any inbound traffic restarts the server-side read timeout.
        if self.role.is_server()
            && self.keep_alive > 0
            && matches!(self.status, Status::Connecting | Status::Connected)
        {
            events.push(Event::Timer(TimerOp::Reset(
                TimerKind::PingreqRecv,
                keep_alive_recv_timeout(self.keep_alive),
            )));
        }

        match packet {
            Packet::ConnectV3(p) => {
                if self.status != Status::Disconnected {
                    // A second connect on one connection is a protocol
                    // violation [MQTT-3.1.0-2].
                    self.fatal_protocol_error(ReasonCode::ProtocolError, events);
                    return;
                }
                self.protocol_level = ProtocolLevel::V311;
                self.status = Status::Connecting;
                self.keep_alive = p.keep_alive();
                self.persistent_session = !p.connect_flags().clean_session();
                if self.role.is_server() && self.keep_alive > 0 {
                    events.push(Event::Timer(TimerOp::Reset(
                        TimerKind::PingreqRecv,
                        keep_alive_recv_timeout(self.keep_alive),
                    )));
                }
                events.push(Event::RecvPacket(Packet::ConnectV3(p)));
            }
            Packet::ConnectV5(p) => {
                if self.status != Status::Disconnected {
                    self.fatal_protocol_error(ReasonCode::ProtocolError, events);
                    return;
                }
                self.protocol_level = ProtocolLevel::V5;
                self.status = Status::Connecting;
                self.keep_alive = p.keep_alive();
                let props = p.properties();
                self.persistent_session = props
                    .session_expiry_interval()
                    .unwrap_or_else(v5::Property::default_session_expiry_interval)
                    > 0;
                self.publish_send_max = Some(
                    props
                        .receive_maximum()
                        .unwrap_or_else(v5::Property::default_receive_maximum),
                );
                self.alias_send = TopicAliasSend::new(
                    props
                        .topic_alias_maximum()
                        .unwrap_or_else(v5::Property::default_topic_alias_maximum),
                );
                if let Some(max) = props.maximum_packet_size() {
                    self.maximum_packet_size_send = max as usize;
                }
                if self.role.is_server() && self.keep_alive > 0 {
                    events.push(Event::Timer(TimerOp::Reset(
                        TimerKind::PingreqRecv,
                        keep_alive_recv_timeout(self.keep_alive),
                    )));
                }
                events.push(Event::RecvPacket(Packet::ConnectV5(p)));
            }
            Packet::ConnectAckV3(p) => {
                if self.status != Status::Connecting {
                    self.fatal_protocol_error(ReasonCode::ProtocolError, events);
                    return;
                }
                if p.return_code() == v3::ConnectReturnCode::Accepted {
                    self.status = Status::Connected;
                    let session_present = p.session_present();
                    events.push(Event::RecvPacket(Packet::ConnectAckV3(p)));
                    self.entered_connected(session_present, events);
                    if let Some(interval) = self.pingreq_send_interval {
                        if self.role.is_client() {
                            events.push(Event::Timer(TimerOp::Reset(
                                TimerKind::PingreqSend,
                                interval,
                            )));
                        }
                    }
                } else {
                    self.status = Status::Disconnected;
                    events.push(Event::RecvPacket(Packet::ConnectAckV3(p)));
                    events.push(Event::Close);
                }
            }
            Packet::ConnectAckV5(p) => {
                if self.status != Status::Connecting {
                    self.fatal_protocol_error(ReasonCode::ProtocolError, events);
                    return;
                }
                let props = p.properties();
                self.publish_send_max = Some(
                    props
                        .receive_maximum()
                        .unwrap_or_else(v5::Property::default_receive_maximum),
                );
                self.alias_send = TopicAliasSend::new(
                    props
                        .topic_alias_maximum()
                        .unwrap_or_else(v5::Property::default_topic_alias_maximum),
                );
                if let Some(max) = props.maximum_packet_size() {
                    self.maximum_packet_size_send = max as usize;
                }
                if let Some(server_keep_alive) = props.server_keep_alive() {
                    self.keep_alive = server_keep_alive;
                    if !self.pingreq_interval_overridden {
                        self.pingreq_send_interval = if self.keep_alive > 0 {
                            Some(Duration::from_secs(u64::from(self.keep_alive)))
                        } else {
                            None
                        };
                    }
                }
                if p.reason_code().is_error() {
                    self.status = Status::Disconnected;
                    events.push(Event::RecvPacket(Packet::ConnectAckV5(p)));
                    events.push(Event::Close);
                } else {
                    self.status = Status::Connected;
                    let session_present = p.session_present();
                    events.push(Event::RecvPacket(Packet::ConnectAckV5(p)));
                    self.entered_connected(session_present, events);
                    if let Some(interval) = self.pingreq_send_interval {
                        if self.role.is_client() {
                            events.push(Event::Timer(TimerOp::Reset(
                                TimerKind::PingreqSend,
                                interval,
                            )));
                        }
                    }
                }
            }
            Packet::PublishV3(p) => self.recv_publish_v3(p, events),
            Packet::PublishV5(p) => self.recv_publish_v5(p, events),
            Packet::PublishAckV3(p) => {
                self.recv_publish_response(
                    ResponseTag::V3PublishAck,
                    p.packet_id(),
                    false,
                    Packet::PublishAckV3(p),
                    events,
                );
            }
            Packet::PublishAckV5(p) => {
                self.recv_publish_response(
                    ResponseTag::V5PublishAck,
                    p.packet_id(),
                    false,
                    Packet::PublishAckV5(p),
                    events,
                );
            }
            Packet::PublishReceivedV3(p) => {
                self.recv_publish_response(
                    ResponseTag::V3PublishReceived,
                    p.packet_id(),
                    false,
                    Packet::PublishReceivedV3(p),
                    events,
                );
            }
            Packet::PublishReceivedV5(p) => {
                let error_response = p.reason_code().is_error();
                self.recv_publish_response(
                    ResponseTag::V5PublishReceived,
                    p.packet_id(),
                    error_response,
                    Packet::PublishReceivedV5(p),
                    events,
                );
            }
            Packet::PublishCompleteV3(p) => {
                self.recv_publish_response(
                    ResponseTag::V3PublishComplete,
                    p.packet_id(),
                    false,
                    Packet::PublishCompleteV3(p),
                    events,
                );
            }
            Packet::PublishCompleteV5(p) => {
                self.recv_publish_response(
                    ResponseTag::V5PublishComplete,
                    p.packet_id(),
                    false,
                    Packet::PublishCompleteV5(p),
                    events,
                );
            }
            Packet::PublishReleaseV3(p) => {
                let pid = p.packet_id();
                self.qos2_publish_handled.remove(&pid.value());
                events.push(Event::RecvPacket(Packet::PublishReleaseV3(p)));
                if self.auto_pub_response && self.status == Status::Connected {
                    self.respond(v3::PublishCompletePacket::new(pid).into(), events);
                }
            }
            Packet::PublishReleaseV5(p) => {
                let pid = p.packet_id();
                self.qos2_publish_handled.remove(&pid.value());
                events.push(Event::RecvPacket(Packet::PublishReleaseV5(p)));
                if self.auto_pub_response && self.status == Status::Connected {
                    self.respond(v5::PublishCompletePacket::new(pid).into(), events);
                }
            }
            Packet::SubscribeV3(p) => events.push(Event::RecvPacket(Packet::SubscribeV3(p))),
            Packet::SubscribeV5(p) => events.push(Event::RecvPacket(Packet::SubscribeV5(p))),
            Packet::SubscribeAckV3(p) => {
                self.recv_operation_ack(SetKind::Suback, p.packet_id(), Packet::SubscribeAckV3(p), events);
            }
            Packet::SubscribeAckV5(p) => {
                self.recv_operation_ack(SetKind::Suback, p.packet_id(), Packet::SubscribeAckV5(p), events);
            }
            Packet::UnsubscribeV3(p) => events.push(Event::RecvPacket(Packet::UnsubscribeV3(p))),
            Packet::UnsubscribeV5(p) => events.push(Event::RecvPacket(Packet::UnsubscribeV5(p))),
            Packet::UnsubscribeAckV3(p) => {
                self.recv_operation_ack(SetKind::Unsuback, p.packet_id(), Packet::UnsubscribeAckV3(p), events);
            }
            Packet::UnsubscribeAckV5(p) => {
                self.recv_operation_ack(SetKind::Unsuback, p.packet_id(), Packet::UnsubscribeAckV5(p), events);
            }
            Packet::PingRequestV3(p) => {
                events.push(Event::RecvPacket(Packet::PingRequestV3(p)));
                if self.auto_ping_response && self.status == Status::Connected {
                    self.respond(v3::PingResponsePacket::new().into(), events);
                }
            }
            Packet::PingRequestV5(p) => {
                events.push(Event::RecvPacket(Packet::PingRequestV5(p)));
                if self.auto_ping_response && self.status == Status::Connected {
                    self.respond(v5::PingResponsePacket::new().into(), events);
                }
            }
            Packet::PingResponseV3(p) => {
                events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingrespRecv)));
                events.push(Event::RecvPacket(Packet::PingResponseV3(p)));
            }
            Packet::PingResponseV5(p) => {
                events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingrespRecv)));
                events.push(Event::RecvPacket(Packet::PingResponseV5(p)));
            }
            Packet::DisconnectV3(p) => {
                self.status = Status::Disconnected;
                events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqSend)));
                events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqRecv)));
                events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingrespRecv)));
                events.push(Event::RecvPacket(Packet::DisconnectV3(p)));
                events.push(Event::Close);
            }
            Packet::DisconnectV5(p) => {
                self.status = Status::Disconnected;
                events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqSend)));
                events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqRecv)));
                events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingrespRecv)));
                events.push(Event::RecvPacket(Packet::DisconnectV5(p)));
                events.push(Event::Close);
            }
            Packet::AuthV5(p) => events.push(Event::RecvPacket(Packet::AuthV5(p))),
        }
    }

    fn recv_publish_v3(&mut self, publish: v3::PublishPacket, events: &mut Vec<Event>) {
        let pid = publish.packet_id();
        match publish.qos() {
            QoS::AtMostOnce => events.push(Event::RecvPacket(Packet::PublishV3(publish))),
            QoS::AtLeastOnce => {
                events.push(Event::RecvPacket(Packet::PublishV3(publish)));
                if self.auto_pub_response && self.status == Status::Connected {
                    self.respond(v3::PublishAckPacket::new(pid).into(), events);
                }
            }
            QoS::ExactOnce => {
                let first_receipt = self.qos2_publish_handled.insert(pid.value());
                if first_receipt {
                    events.push(Event::RecvPacket(Packet::PublishV3(publish)));
                }
                // Duplicates are not resurfaced, so the host cannot answer
                // them; every qos 2 publish still needs its pubrec
                // [MQTT-4.3.3-1].
                if self.status == Status::Connected
                    && (self.auto_pub_response || !first_receipt)
                {
                    self.respond(v3::PublishReceivedPacket::new(pid).into(), events);
                }
            }
        }
    }

    fn recv_publish_v5(&mut self, mut publish: v5::PublishPacket, events: &mut Vec<Event>) {
        // Resolve topic aliases before the packet is surfaced, so hosts
        // only ever see full topic names.
        if let Some(alias) = publish.properties().topic_alias() {
            if publish.topic().is_empty() {
                let Some(topic) = self.alias_recv.resolve(alias).map(ToString::to_string) else {
                    self.fatal_protocol_error(ReasonCode::TopicAliasInvalid, events);
                    return;
                };
                if publish.set_topic(&topic).is_err() {
                    self.fatal_protocol_error(ReasonCode::TopicAliasInvalid, events);
                    return;
                }
            } else if !self
                .alias_recv
                .register(alias, &publish.topic().to_string())
            {
                self.fatal_protocol_error(ReasonCode::TopicAliasInvalid, events);
                return;
            }
        } else if publish.topic().is_empty() {
            self.fatal_protocol_error(ReasonCode::TopicAliasInvalid, events);
            return;
        }

        let pid = publish.packet_id();
        match publish.qos() {
            QoS::AtMostOnce => events.push(Event::RecvPacket(Packet::PublishV5(publish))),
            QoS::AtLeastOnce => {
                events.push(Event::RecvPacket(Packet::PublishV5(publish)));
                if self.auto_pub_response && self.status == Status::Connected {
                    self.respond(v5::PublishAckPacket::new(pid).into(), events);
                }
            }
            QoS::ExactOnce => {
                let first_receipt = self.qos2_publish_handled.insert(pid.value());
                if first_receipt {
                    events.push(Event::RecvPacket(Packet::PublishV5(publish)));
                }
                if self.status == Status::Connected
                    && (self.auto_pub_response || !first_receipt)
                {
                    self.respond(v5::PublishReceivedPacket::new(pid).into(), events);
                }
            }
        }
    }

    /// Handle an inbound puback/pubrec/pubcomp for a publish we sent.
    fn recv_publish_response(
        &mut self,
        tag: ResponseTag,
        pid: PacketId,
        error_response: bool,
        packet: Packet,
        events: &mut Vec<Event>,
    ) {
        let expected = match tag {
            ResponseTag::V3PublishAck | ResponseTag::V5PublishAck => {
                self.pid_puback.remove(&pid.value())
            }
            ResponseTag::V3PublishReceived | ResponseTag::V5PublishReceived => {
                self.pid_pubrec.remove(&pid.value())
            }
            ResponseTag::V3PublishComplete | ResponseTag::V5PublishComplete => {
                self.pid_pubcomp.remove(&pid.value())
            }
        };
        if !expected {
            log::error!("connection: Unexpected ack {tag:?} for packet id {pid}");
            self.fatal_protocol_error(ReasonCode::ProtocolError, events);
            return;
        }

        self.store.erase(tag, pid);
        events.push(Event::RecvPacket(packet));

        match tag {
            ResponseTag::V3PublishAck
            | ResponseTag::V5PublishAck
            | ResponseTag::V3PublishComplete
            | ResponseTag::V5PublishComplete => {
                self.pool.release(pid);
                events.push(Event::ReleasePacketId(pid));
                self.open_send_window(events);
            }
            ResponseTag::V3PublishReceived | ResponseTag::V5PublishReceived => {
                if error_response {
                    // 5.0 error pubrec ends the handshake right here.
                    self.pool.release(pid);
                    events.push(Event::ReleasePacketId(pid));
                    self.open_send_window(events);
                } else if self.auto_pub_response && self.status == Status::Connected {
                    let release: Packet = if self.protocol_level == ProtocolLevel::V5 {
                        v5::PublishReleasePacket::new(pid).into()
                    } else {
                        v3::PublishReleasePacket::new(pid).into()
                    };
                    self.pid_pubcomp.insert(pid.value());
                    if let Some(stored) = StoredPacket::new(release.clone()) {
                        self.store.add(stored);
                    }
                    self.respond(release, events);
                } else {
                    self.pid_pubcomp.insert(pid.value());
                }
            }
        }
    }

    fn recv_operation_ack(
        &mut self,
        kind: SetKind,
        pid: PacketId,
        packet: Packet,
        events: &mut Vec<Event>,
    ) {
        let set = match kind {
            SetKind::Suback => &mut self.pid_suback,
            SetKind::Unsuback => &mut self.pid_unsuback,
        };
        if !set.remove(&pid.value()) {
            log::error!("connection: Unexpected {kind:?} for packet id {pid}");
            self.fatal_protocol_error(ReasonCode::ProtocolError, events);
            return;
        }
        self.pool.release(pid);
        events.push(Event::RecvPacket(packet));
        events.push(Event::ReleasePacketId(pid));
    }

    /// Auto-responses also count as outgoing traffic for the ping cadence.
    fn respond(&mut self, packet: Packet, events: &mut Vec<Event>) {
        events.push(Event::SendPacket(packet));
        if self.role.is_client() {
            if let Some(interval) = self.pingreq_send_interval {
                events.push(Event::Timer(TimerOp::Reset(TimerKind::PingreqSend, interval)));
            }
        }
    }

    fn on_decode_error(&mut self, err: DecodeError, events: &mut Vec<Event>) {
        let reason = match err {
            DecodeError::PacketTooLarge => ReasonCode::PacketTooLarge,
            DecodeError::InvalidClientId => ReasonCode::ClientIdentifierNotValid,
            _ => ReasonCode::MalformedPacket,
        };
        events.push(Event::Error(err.into()));
        self.emit_failure(reason, events);
    }

    fn fatal_protocol_error(&mut self, reason: ReasonCode, events: &mut Vec<Event>) {
        events.push(Event::Error(Error::from_string(
            ErrorKind::ProtocolError,
            format!("{reason:?}"),
        )));
        self.emit_failure(reason, events);
    }

    /// Send the version-appropriate failure reaction and close.
    ///
    /// While still negotiating, a server answers with a failed connack;
    /// afterwards 5.0 sends a disconnect with the reason and 3.1.1 just
    /// drops the stream.
    fn emit_failure(&mut self, reason: ReasonCode, events: &mut Vec<Event>) {
        match self.status {
            Status::Disconnected | Status::Connecting if self.role.is_server() => {
                if self.protocol_level == ProtocolLevel::V5 {
                    events.push(Event::SendPacket(
                        v5::ConnectAckPacket::new(false, connect_failure_reason(reason)).into(),
                    ));
                } else {
                    let return_code = if reason == ReasonCode::ClientIdentifierNotValid {
                        v3::ConnectReturnCode::IdentifierRejected
                    } else {
                        v3::ConnectReturnCode::UnacceptedProtocol
                    };
                    events.push(Event::SendPacket(
                        v3::ConnectAckPacket::new(false, return_code).into(),
                    ));
                }
            }
            _ => {
                if self.protocol_level == ProtocolLevel::V5 && self.status == Status::Connected {
                    events.push(Event::SendPacket(
                        v5::DisconnectPacket::with_reason(reason).into(),
                    ));
                }
            }
        }
        self.status = Status::Disconnected;
        events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqSend)));
        events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqRecv)));
        events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingrespRecv)));
        events.push(Event::Close);
    }

    fn close_for_keep_alive(&mut self, events: &mut Vec<Event>) {
        if self.status == Status::Disconnected {
            return;
        }
        if self.protocol_level == ProtocolLevel::V5 && self.status == Status::Connected {
            events.push(Event::SendPacket(
                v5::DisconnectPacket::with_reason(ReasonCode::KeepAliveTimeout).into(),
            ));
        }
        self.status = Status::Disconnected;
        events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqSend)));
        events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingreqRecv)));
        events.push(Event::Timer(TimerOp::Cancel(TimerKind::PingrespRecv)));
        events.push(Event::Close);
    }
}

#[derive(Clone, Copy, Debug)]
enum SetKind {
    Suback,
    Unsuback,
}

/// Servers wait one and a half keep alive periods before declaring the
/// client dead [MQTT-3.1.2-24].
fn keep_alive_recv_timeout(keep_alive: u16) -> Duration {
    Duration::from_millis(u64::from(keep_alive) * 1500)
}

/// Map a failure reason onto the subset legal in a connack packet.
const fn connect_failure_reason(reason: ReasonCode) -> ReasonCode {
    match reason {
        ReasonCode::PacketTooLarge => ReasonCode::PacketTooLarge,
        ReasonCode::ProtocolError => ReasonCode::ProtocolError,
        ReasonCode::ClientIdentifierNotValid => ReasonCode::ClientIdentifierNotValid,
        _ => ReasonCode::MalformedPacket,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{ConnectFlags, U16Data};

    fn encode(packet: &Packet) -> Vec<u8> {
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        buf
    }

    fn v3_client_connected() -> Connection {
        let mut conn = Connection::new(Role::Client);
        let mut connect = v3::ConnectPacket::new("c1").unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(true);
        connect.set_connect_flags(flags);
        conn.send(connect.into()).unwrap();

        let connack = v3::ConnectAckPacket::new(false, v3::ConnectReturnCode::Accepted);
        conn.recv_bytes(&encode(&connack.into()));
        assert_eq!(conn.status(), Status::Connected);
        conn
    }

    fn v5_client_connected(connack_props: v5::Properties) -> Connection {
        let mut conn = Connection::new(Role::Client);
        let connect = v5::ConnectPacket::new("c5").unwrap();
        conn.send(connect.into()).unwrap();

        let mut connack = v5::ConnectAckPacket::new(false, ReasonCode::Success);
        *connack.properties_mut() = connack_props;
        conn.recv_bytes(&encode(&connack.into()));
        assert_eq!(conn.status(), Status::Connected);
        conn
    }

    fn sent_packets(events: &[Event]) -> Vec<&Packet> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::SendPacket(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn recv_packets(events: &[Event]) -> Vec<&Packet> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::RecvPacket(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_client_handshake() {
        let mut conn = Connection::new(Role::Client);
        let connect = v3::ConnectPacket::new("c1").unwrap();
        let events = conn.send(connect.into()).unwrap();
        assert_eq!(conn.status(), Status::Connecting);
        assert_eq!(sent_packets(&events).len(), 1);
        // Keep alive of 60s arms the ping request timer.
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Timer(TimerOp::Reset(TimerKind::PingreqSend, _))
        )));

        let connack = v3::ConnectAckPacket::new(false, v3::ConnectReturnCode::Accepted);
        conn.recv_bytes(&encode(&connack.into()));
        assert_eq!(conn.status(), Status::Connected);
    }

    #[test]
    fn test_connack_error_disconnects() {
        let mut conn = Connection::new(Role::Client);
        conn.send(v3::ConnectPacket::new("c1").unwrap().into())
            .unwrap();
        let connack = v3::ConnectAckPacket::new(false, v3::ConnectReturnCode::Unauthorized);
        let events = conn.recv_bytes(&encode(&connack.into()));
        assert_eq!(conn.status(), Status::Disconnected);
        assert!(events.iter().any(|e| matches!(e, Event::Close)));
    }

    #[test]
    fn test_qos1_publish_round_trip() {
        let mut conn = v3_client_connected();
        let pid = conn.acquire_packet_id().unwrap();
        let mut publish = v3::PublishPacket::new("a/b", QoS::AtLeastOnce, b"x").unwrap();
        publish.set_packet_id(pid);
        let events = conn.send(publish.into()).unwrap();
        assert_eq!(sent_packets(&events).len(), 1);
        assert_eq!(conn.get_stored_packets().len(), 1);

        let ack = v3::PublishAckPacket::new(pid);
        let events = conn.recv_bytes(&encode(&ack.into()));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ReleasePacketId(p) if *p == pid)));
        assert!(conn.get_stored_packets().is_empty());

        // The id is back in the pool.
        assert_eq!(conn.acquire_packet_id(), Some(pid));
    }

    #[test]
    fn test_unexpected_puback_is_protocol_error() {
        let mut conn = v3_client_connected();
        let ack = v3::PublishAckPacket::new(PacketId::new(9));
        let events = conn.recv_bytes(&encode(&ack.into()));
        assert!(events.iter().any(|e| matches!(e, Event::Error(_))));
        assert!(events.iter().any(|e| matches!(e, Event::Close)));
        assert_eq!(conn.status(), Status::Disconnected);
    }

    #[test]
    fn test_qos2_duplicate_suppressed() {
        let mut conn = Connection::new(Role::Server);
        conn.set_auto_pub_response(true);
        conn.set_auto_ping_response(true);

        let mut connect = v3::ConnectPacket::new("pub").unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(true);
        connect.set_connect_flags(flags);
        conn.recv_bytes(&encode(&connect.into()));
        conn.send(v3::ConnectAckPacket::new(false, v3::ConnectReturnCode::Accepted).into())
            .unwrap();

        let mut publish = v3::PublishPacket::new("t", QoS::ExactOnce, b"p").unwrap();
        publish.set_packet_id(PacketId::new(7));
        let first: Packet = publish.clone().into();
        let events = conn.recv_bytes(&encode(&first));
        assert_eq!(recv_packets(&events).len(), 1);
        assert!(sent_packets(&events)
            .iter()
            .any(|p| matches!(p, Packet::PublishReceivedV3(_))));

        // Duplicate delivery: pubrec is repeated, the message is not.
        publish.set_dup(true).unwrap();
        let dup: Packet = publish.into();
        let events = conn.recv_bytes(&encode(&dup));
        assert_eq!(recv_packets(&events).len(), 0);
        assert!(sent_packets(&events)
            .iter()
            .any(|p| matches!(p, Packet::PublishReceivedV3(_))));

        // Release clears the dedup entry and completes the handshake.
        let release = v3::PublishReleasePacket::new(PacketId::new(7));
        let events = conn.recv_bytes(&encode(&release.into()));
        assert!(sent_packets(&events)
            .iter()
            .any(|p| matches!(p, Packet::PublishCompleteV3(_))));
        assert!(conn.get_qos2_handled().is_empty());
    }

    #[test]
    fn test_receive_maximum_backpressure() {
        let mut props = v5::Properties::new();
        props.push(v5::Property::ReceiveMaximum(U16Data::new(2)));
        let mut conn = v5_client_connected(props);

        let mut on_wire = Vec::new();
        for _ in 0..3 {
            let pid = conn.acquire_packet_id().unwrap();
            let mut publish = v5::PublishPacket::new("t", QoS::AtLeastOnce, b"m").unwrap();
            publish.set_packet_id(pid);
            let events = conn.send(publish.into()).unwrap();
            on_wire.extend(
                sent_packets(&events)
                    .iter()
                    .filter_map(|p| p.packet_id())
                    .collect::<Vec<_>>(),
            );
        }
        assert_eq!(on_wire, vec![PacketId::new(1), PacketId::new(2)]);

        // Acking pid 1 opens the window for pid 3.
        let ack = v5::PublishAckPacket::new(PacketId::new(1));
        let events = conn.recv_bytes(&encode(&ack.into()));
        let released: Vec<PacketId> = sent_packets(&events)
            .iter()
            .filter_map(|p| p.packet_id())
            .collect();
        assert_eq!(released, vec![PacketId::new(3)]);
    }

    #[test]
    fn test_recv_unknown_topic_alias_disconnects() {
        let mut conn = Connection::new(Role::Server);
        let mut connect = v5::ConnectPacket::new("pub").unwrap();
        connect
            .properties_mut()
            .push(v5::Property::TopicAliasMaximum(U16Data::new(10)));
        conn.recv_bytes(&encode(&connect.into()));
        // Our connack announces alias support for the receive side.
        let mut connack = v5::ConnectAckPacket::new(false, ReasonCode::Success);
        connack
            .properties_mut()
            .push(v5::Property::TopicAliasMaximum(U16Data::new(10)));
        conn.send(connack.into()).unwrap();

        let mut publish = v5::PublishPacket::new("", QoS::AtMostOnce, b"m").unwrap();
        publish
            .properties_mut()
            .push(v5::Property::TopicAlias(U16Data::new(4)));
        let events = conn.recv_bytes(&encode(&publish.into()));
        assert!(recv_packets(&events).is_empty());
        let sent = sent_packets(&events);
        assert!(sent.iter().any(|p| matches!(
            p,
            Packet::DisconnectV5(d) if d.reason_code() == ReasonCode::TopicAliasInvalid
        )));
        assert!(events.iter().any(|e| matches!(e, Event::Close)));
    }

    #[test]
    fn test_recv_topic_alias_resolution() {
        let mut conn = Connection::new(Role::Server);
        let connect = v5::ConnectPacket::new("pub").unwrap();
        conn.recv_bytes(&encode(&connect.into()));
        let mut connack = v5::ConnectAckPacket::new(false, ReasonCode::Success);
        connack
            .properties_mut()
            .push(v5::Property::TopicAliasMaximum(U16Data::new(10)));
        conn.send(connack.into()).unwrap();

        // Declare alias 3 with the full topic name.
        let mut publish = v5::PublishPacket::new("long/topic", QoS::AtMostOnce, b"1").unwrap();
        publish
            .properties_mut()
            .push(v5::Property::TopicAlias(U16Data::new(3)));
        let events = conn.recv_bytes(&encode(&publish.into()));
        assert_eq!(recv_packets(&events).len(), 1);

        // Alias only; the surfaced packet carries the resolved topic.
        let mut publish = v5::PublishPacket::new("", QoS::AtMostOnce, b"2").unwrap();
        publish
            .properties_mut()
            .push(v5::Property::TopicAlias(U16Data::new(3)));
        let events = conn.recv_bytes(&encode(&publish.into()));
        let received = recv_packets(&events);
        assert_eq!(received.len(), 1);
        let Packet::PublishV5(p) = received[0] else {
            panic!("expected publish");
        };
        assert_eq!(p.topic(), "long/topic");
    }

    #[test]
    fn test_pingreq_timer_sends_ping() {
        let mut conn = v3_client_connected();
        let events = conn.notify_timer_fired(TimerKind::PingreqSend);
        assert!(sent_packets(&events)
            .iter()
            .any(|p| matches!(p, Packet::PingRequestV3(_))));
    }

    #[test]
    fn test_pingresp_timeout_closes() {
        let mut conn = v3_client_connected();
        conn.set_pingresp_recv_timeout(Some(Duration::from_secs(5)));
        let events = conn.notify_timer_fired(TimerKind::PingrespRecv);
        assert!(events.iter().any(|e| matches!(e, Event::Close)));
        assert_eq!(conn.status(), Status::Disconnected);
    }

    #[test]
    fn test_store_survives_disconnect_with_session() {
        let mut conn = Connection::new(Role::Client);
        let mut connect = v3::ConnectPacket::new("c1").unwrap();
        // clean_session = false keeps the session.
        connect.set_connect_flags(ConnectFlags::default());
        conn.send(connect.into()).unwrap();
        let connack = v3::ConnectAckPacket::new(false, v3::ConnectReturnCode::Accepted);
        conn.recv_bytes(&encode(&connack.into()));

        let pid = conn.acquire_packet_id().unwrap();
        let mut publish = v3::PublishPacket::new("a", QoS::AtLeastOnce, b"x").unwrap();
        publish.set_packet_id(pid);
        conn.send(publish.into()).unwrap();

        conn.notify_closed();
        assert_eq!(conn.get_stored_packets().len(), 1);

        // Reconnect with session present: the stored publish is replayed
        // with the dup flag set.
        conn.send(v3::ConnectPacket::new("c1").unwrap().into())
            .unwrap();
        let connack = v3::ConnectAckPacket::new(true, v3::ConnectReturnCode::Accepted);
        let events = conn.recv_bytes(&encode(&connack.into()));
        let replayed = sent_packets(&events);
        assert_eq!(replayed.len(), 1);
        let Packet::PublishV3(p) = replayed[0] else {
            panic!("expected publish replay");
        };
        assert!(p.dup());
        assert_eq!(p.packet_id(), pid);
    }

    #[test]
    fn test_restore_packets() {
        let mut conn = Connection::new(Role::Client);
        let mut publish = v3::PublishPacket::new("a", QoS::AtLeastOnce, b"x").unwrap();
        publish.set_packet_id(PacketId::new(3));
        let stored = StoredPacket::new(publish.into()).unwrap();
        conn.restore_packets(vec![stored]);

        // The restored id is reserved in the pool.
        assert_eq!(conn.acquire_packet_id(), Some(PacketId::new(1)));
        assert!(!conn.register_packet_id(PacketId::new(3)));
        assert_eq!(conn.get_stored_packets().len(), 1);
    }
}
