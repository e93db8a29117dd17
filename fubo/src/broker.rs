// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Multi-session router on top of many endpoints: authentication,
//! subscription dispatch, retained messages, shared subscriptions,
//! session takeover and will delivery.

use codec::v5::ReasonCode;
use codec::{v3, v5, Packet, PacketId, ProtocolLevel, QoS, SubTopic};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::endpoint::{Endpoint, EndpointSender};
use crate::retain::{self, RetainStore, RetainedMessage};
use crate::security::Security;
use crate::session::{Message, Session, SessionExpiry, SessionStore, SubEntry, Will};
use crate::shared_sub::SharedTargets;
use crate::trie::{SubTrie, Subscription};
use crate::types::{EndpointId, SessionGid};

/// Topic alias window the broker announces to every 5.0 client.
pub const TOPIC_ALIAS_MAXIMUM: u16 = 65535;

/// Prefix of generated client ids.
const AUTO_CLIENT_ID_PREFIX: &str = "auto-";

/// Prefix of per-client response topics.
const RESPONSE_TOPIC_PREFIX: &str = "responses/";

/// The reference broker.
///
/// The five shared tables sit behind reader-writer locks; none of them is
/// ever held across an await point. Per-connection protocol state lives
/// inside each endpoint.
#[derive(Debug)]
pub struct Broker {
    sessions: RwLock<SessionStore>,
    trie: RwLock<SubTrie>,
    retained: Arc<RwLock<RetainStore>>,
    shared: RwLock<SharedTargets>,
    security: RwLock<Security>,
    next_endpoint_id: AtomicU64,
}

/// One delivery planned while the tables were locked, executed after the
/// locks are gone.
struct Delivery {
    sender: EndpointSender,
    protocol_level: ProtocolLevel,
    qos: QoS,
    retain: bool,
    sub_id: Option<usize>,
}

impl Broker {
    #[must_use]
    pub fn new(security: Security) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(SessionStore::new()),
            trie: RwLock::new(SubTrie::new()),
            retained: Arc::new(RwLock::new(RetainStore::new())),
            shared: RwLock::new(SharedTargets::new()),
            security: RwLock::new(security),
            next_endpoint_id: AtomicU64::new(1),
        })
    }

    /// Drive one accepted endpoint until its connection ends.
    ///
    /// `preauth_username` carries a username already authenticated by the
    /// transport, e.g. from a TLS client certificate field.
    pub async fn handle_endpoint(
        self: Arc<Self>,
        mut endpoint: Endpoint,
        preauth_username: Option<String>,
    ) {
        let endpoint_id = self.next_endpoint_id.fetch_add(1, Ordering::Relaxed);

        let connect = match endpoint.recv().await {
            Ok(packet @ (Packet::ConnectV3(_) | Packet::ConnectV5(_))) => packet,
            Ok(other) => {
                log::warn!(
                    "broker: First packet was {:?}, not connect",
                    other.packet_type()
                );
                let _ = endpoint.close().await;
                return;
            }
            Err(err) => {
                log::info!("broker: Connection ended before connect: {err}");
                let _ = endpoint.close().await;
                return;
            }
        };

        let Some(gid) = self
            .accept_connect(&mut endpoint, endpoint_id, &connect, preauth_username)
            .await
        else {
            return;
        };

        let mut clean_close = false;
        let mut will_on_disconnect = false;
        loop {
            match endpoint.recv().await {
                Ok(packet) => match packet {
                    Packet::PublishV3(_) | Packet::PublishV5(_) => {
                        self.handle_publish(&gid, &endpoint, packet).await;
                    }
                    Packet::PublishReleaseV3(p) => {
                        let _ = endpoint
                            .send(v3::PublishCompletePacket::new(p.packet_id()).into())
                            .await;
                    }
                    Packet::PublishReleaseV5(p) => {
                        let _ = endpoint
                            .send(v5::PublishCompletePacket::new(p.packet_id()).into())
                            .await;
                    }
                    // Outgoing qos 2: a pubrec from the subscriber is
                    // answered with the release.
                    Packet::PublishReceivedV3(p) => {
                        let _ = endpoint
                            .send(v3::PublishReleasePacket::new(p.packet_id()).into())
                            .await;
                    }
                    Packet::PublishReceivedV5(p) => {
                        if !p.reason_code().is_error() {
                            let _ = endpoint
                                .send(v5::PublishReleasePacket::new(p.packet_id()).into())
                                .await;
                        }
                    }
                    Packet::SubscribeV3(p) => {
                        self.handle_subscribe_v3(&gid, &endpoint, &p).await;
                    }
                    Packet::SubscribeV5(p) => {
                        self.handle_subscribe_v5(&gid, &endpoint, &p).await;
                    }
                    Packet::UnsubscribeV3(p) => {
                        let _reasons = self.handle_unsubscribe(&gid, p.topics());
                        let _ = endpoint
                            .send(v3::UnsubscribeAckPacket::new(p.packet_id()).into())
                            .await;
                    }
                    Packet::UnsubscribeV5(p) => {
                        let reasons = self.handle_unsubscribe(&gid, p.topics());
                        let _ = endpoint
                            .send(
                                v5::UnsubscribeAckPacket::with_vec(p.packet_id(), reasons).into(),
                            )
                            .await;
                    }
                    Packet::DisconnectV3(_) => {
                        clean_close = true;
                        break;
                    }
                    Packet::DisconnectV5(p) => {
                        clean_close = true;
                        will_on_disconnect =
                            p.reason_code() == ReasonCode::DisconnectWithWillMessage;
                        if let Some(interval) = p.properties().session_expiry_interval() {
                            self.update_session_expiry(&gid, interval);
                        }
                        break;
                    }
                    // Ping requests are answered inside the endpoint;
                    // everything else has no broker-side meaning.
                    _ => {}
                },
                Err(err) => {
                    log::info!("broker: Session {gid} read loop ended: {err}");
                    break;
                }
            }
        }

        let send_will = !clean_close || will_on_disconnect;
        self.close_endpoint(endpoint_id, &endpoint, send_will).await;
        let _ = endpoint.close().await;
    }

    // ----- connect -----

    #[allow(clippy::too_many_lines)]
    async fn accept_connect(
        self: &Arc<Self>,
        endpoint: &mut Endpoint,
        endpoint_id: EndpointId,
        connect: &Packet,
        preauth_username: Option<String>,
    ) -> Option<SessionGid> {
        let (protocol_level, client_id, username, password, clean_start) = match connect {
            Packet::ConnectV3(p) => (
                ProtocolLevel::V311,
                p.client_id().to_string(),
                p.username().to_string(),
                p.password().to_vec(),
                p.connect_flags().clean_session(),
            ),
            Packet::ConnectV5(p) => (
                ProtocolLevel::V5,
                p.client_id().to_string(),
                p.username().to_string(),
                p.password().to_vec(),
                p.connect_flags().clean_session(),
            ),
            _ => unreachable!("checked by the caller"),
        };

        // Authentication order: transport-level identity, anonymous for
        // credential-less clients, then username/password, and finally
        // the unauthenticated fallback user.
        let authenticated = {
            let security = self.read_security();
            let cert_user = preauth_username
                .filter(|name| security.login_cert(name));
            cert_user
                .or_else(|| {
                    if username.is_empty() && password.is_empty() {
                        security.login_anonymous().map(ToString::to_string)
                    } else {
                        security.login(&username, &password)
                    }
                })
                .or_else(|| security.login_unauthenticated().map(ToString::to_string))
        };
        let Some(auth_username) = authenticated else {
            log::info!("broker: Authentication failed for {username:?}");
            let connack: Packet = if protocol_level == ProtocolLevel::V5 {
                v5::ConnectAckPacket::new(false, ReasonCode::NotAuthorized).into()
            } else {
                v3::ConnectAckPacket::new(false, v3::ConnectReturnCode::Unauthorized).into()
            };
            let _ = endpoint.send(connack).await;
            let _ = endpoint.close().await;
            return None;
        };

        // An empty 3.1.1 client id with clean session off was already
        // rejected during decode; assign an id for everyone else.
        let (client_id, assigned_client_id) = if client_id.is_empty() {
            (
                format!("{AUTO_CLIENT_ID_PREFIX}{}", codec::utils::random_string(16)),
                true,
            )
        } else {
            (client_id, false)
        };

        let gid = SessionGid::new(&auth_username, &client_id);
        let expiry = match connect {
            Packet::ConnectV3(_) => {
                if clean_start {
                    SessionExpiry::AtClose
                } else {
                    SessionExpiry::Never
                }
            }
            Packet::ConnectV5(p) => match p.properties().session_expiry_interval() {
                None | Some(0) => SessionExpiry::AtClose,
                Some(secs) => SessionExpiry::After(Duration::from_secs(u64::from(secs))),
            },
            _ => unreachable!(),
        };

        // Take over any endpoint already bound to this session. Detaching
        // drops the endpoint index entry, so the old endpoint's close
        // path finds nothing and leaves the session alone.
        let (old_sender, old_expiry) = {
            let mut sessions = self.write_sessions();
            let old_expiry = sessions.get(&gid).map(|session| session.expiry);
            let old_info = sessions.get(&gid).and_then(|session| {
                session
                    .endpoint()
                    .map(|sender| (sender, session.protocol_level(), session.endpoint_id()))
            });
            if let Some((_, _, old_id)) = &old_info {
                sessions.detach_endpoint(*old_id, Vec::new(), Vec::new());
            }
            (old_info.map(|(sender, level, _id)| (sender, level)), old_expiry)
        };
        let taken_over_state = if let Some((old, old_level)) = old_sender {
            let inflight = old.get_stored_packets().await.unwrap_or_default();
            let qos2 = old.get_qos2_handled().await.unwrap_or_default();
            if old_level == ProtocolLevel::V5 {
                let _ = old
                    .send(v5::DisconnectPacket::with_reason(ReasonCode::SessionTakenOver).into())
                    .await;
            }
            let _ = old.close().await;
            Some((inflight, qos2))
        } else {
            None
        };

        // Decide resumption and rebind the session record. A taken-over
        // session whose state would have expired at close does not resume.
        let session_present = {
            let mut sessions = self.write_sessions();
            let record_exists = sessions.get(&gid).is_some();
            let resumable = record_exists && old_expiry != Some(SessionExpiry::AtClose);
            if resumable && !clean_start {
                if let Some((inflight, qos2)) = taken_over_state {
                    let session = sessions.get_mut(&gid).unwrap();
                    session.inflight = inflight;
                    session.qos2_received = qos2;
                }
                sessions.rebind(&gid, protocol_level, endpoint.sender(), endpoint_id, expiry);
                true
            } else {
                if record_exists {
                    let session = sessions.remove(&gid);
                    drop(sessions);
                    if let Some(session) = session {
                        self.drop_subscriptions(&gid, &session.subscriptions);
                    }
                    sessions = self.write_sessions();
                }
                sessions.insert(Session::new(
                    gid.clone(),
                    protocol_level,
                    endpoint.sender(),
                    endpoint_id,
                    expiry,
                ));
                false
            }
        };

        // The will always comes from the new connect packet.
        let will = match connect {
            Packet::ConnectV3(p) => Will::from_v3(p),
            Packet::ConnectV5(p) => Will::from_v5(p),
            _ => unreachable!(),
        };
        let request_response = match connect {
            Packet::ConnectV5(p) => p
                .properties()
                .request_response_information()
                .unwrap_or_else(v5::Property::default_request_response_information),
            _ => false,
        };
        let response_topic = if request_response {
            let topic = {
                let sessions = self.read_sessions();
                sessions
                    .get(&gid)
                    .and_then(|session| session.response_topic.clone())
            };
            let topic = topic.unwrap_or_else(|| {
                format!("{RESPONSE_TOPIC_PREFIX}{}", codec::utils::random_string(24))
            });
            self.write_security()
                .add_response_topic_rule(&topic, &auth_username);
            Some(topic)
        } else {
            None
        };
        {
            let mut sessions = self.write_sessions();
            if let Some(session) = sessions.get_mut(&gid) {
                session.will = will;
                if response_topic.is_some() {
                    session.response_topic = response_topic.clone();
                }
            }
        }

        // Load persisted in-flight state into the fresh endpoint; the
        // connection replays it once the connack announces resumption.
        if session_present {
            let (inflight, qos2) = {
                let sessions = self.read_sessions();
                let session = sessions.get(&gid).unwrap();
                (session.inflight.clone(), session.qos2_received.clone())
            };
            if !inflight.is_empty() {
                let _ = endpoint.restore_packets(inflight).await;
            }
            if !qos2.is_empty() {
                let _ = endpoint.restore_qos2_handled(qos2).await;
            }
        }

        let connack: Packet = if protocol_level == ProtocolLevel::V5 {
            let mut connack = v5::ConnectAckPacket::new(session_present, ReasonCode::Success);
            let props = connack.properties_mut();
            props.push(v5::Property::TopicAliasMaximum(codec::U16Data::new(
                TOPIC_ALIAS_MAXIMUM,
            )));
            if assigned_client_id {
                if let Ok(id) = codec::StringData::from(&client_id) {
                    props.push(v5::Property::AssignedClientIdentifier(id));
                }
            }
            if let Some(topic) = &response_topic {
                if let Ok(info) = codec::StringData::from(topic) {
                    props.push(v5::Property::ResponseInformation(info));
                }
            }
            connack.into()
        } else {
            v3::ConnectAckPacket::new(session_present, v3::ConnectReturnCode::Accepted).into()
        };
        if let Err(err) = endpoint.send(connack).await {
            log::warn!("broker: Failed to send connack to {gid}: {err}");
            let _ = endpoint.close().await;
            return None;
        }
        log::info!(
            "broker: Session {gid} connected, protocol {protocol_level}, resumed: {session_present}"
        );

        // Messages queued while the session was offline go out first.
        let queued: Vec<Message> = {
            let mut sessions = self.write_sessions();
            sessions
                .get_mut(&gid)
                .map(|session| session.offline_queue.drain(..).collect())
                .unwrap_or_default()
        };
        for message in queued {
            self.send_to_endpoint(
                &endpoint.sender(),
                protocol_level,
                &message,
                message.qos,
                message.retain,
                None,
            )
            .await;
        }

        Some(gid)
    }

    // ----- publish -----

    async fn handle_publish(&self, gid: &SessionGid, endpoint: &Endpoint, packet: Packet) {
        let (topic, payload, qos, retain, pid, properties) = match packet {
            Packet::PublishV3(p) => (
                p.topic().to_string(),
                p.message().to_vec(),
                p.qos(),
                p.retain(),
                p.packet_id(),
                v5::Properties::new(),
            ),
            Packet::PublishV5(p) => (
                p.topic().to_string(),
                p.message().to_vec(),
                p.qos(),
                p.retain(),
                p.packet_id(),
                p.properties().clone(),
            ),
            _ => return,
        };

        let authorized = self.read_security().auth_pub(gid.username(), &topic);
        let mut matched = false;
        if authorized {
            let mut properties = properties;
            // Topic aliases are a per-connection shorthand; subscription
            // identifiers belong to the outgoing, not the incoming side.
            properties.remove(v5::PropertyType::TopicAlias);
            if properties.find(v5::PropertyType::SubscriptionIdentifier).is_some() {
                log::warn!("broker: Dropping subscription identifier sent by {gid}");
                properties.remove(v5::PropertyType::SubscriptionIdentifier);
            }

            if retain {
                self.update_retained(&topic, &payload, qos, &properties);
            }

            let message = Message {
                topic,
                payload,
                qos,
                retain,
                properties,
            };
            matched = self.deliver(Some(gid), &message).await;
        } else {
            log::info!("broker: Denied publish from {gid}");
        }

        // 3.1.1 has no failure reason codes; the flow is acknowledged
        // either way, the message is just not delivered.
        let reason = if authorized {
            if matched {
                ReasonCode::Success
            } else {
                ReasonCode::NoMatchingSubscribers
            }
        } else {
            ReasonCode::NotAuthorized
        };
        let response: Option<Packet> = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => match self.session_level(gid) {
                Some(ProtocolLevel::V5) => {
                    Some(v5::PublishAckPacket::with_reason(pid, reason).into())
                }
                _ => Some(v3::PublishAckPacket::new(pid).into()),
            },
            QoS::ExactOnce => match self.session_level(gid) {
                Some(ProtocolLevel::V5) => {
                    Some(v5::PublishReceivedPacket::with_reason(pid, reason).into())
                }
                _ => Some(v3::PublishReceivedPacket::new(pid).into()),
            },
        };
        if let Some(response) = response {
            if let Err(err) = endpoint.send(response).await {
                log::warn!("broker: Failed to acknowledge publish from {gid}: {err}");
            }
        }
    }

    fn update_retained(&self, topic: &str, payload: &[u8], qos: QoS, properties: &v5::Properties) {
        if payload.is_empty() {
            self.write_retained().erase(topic);
            return;
        }
        let message = RetainedMessage::new(topic, payload, qos, properties.clone());
        let expiry = properties.message_expiry_interval();
        let generation = self.write_retained().insert_or_assign(message);
        if let Some(secs) = expiry {
            retain::spawn_expiry(
                Arc::clone(&self.retained),
                topic.to_string(),
                generation,
                Duration::from_secs(u64::from(secs)),
            );
        }
    }

    /// Route a message to every matching subscription. Returns whether
    /// any subscriber matched.
    async fn deliver(&self, publisher: Option<&SessionGid>, message: &Message) -> bool {
        // Pass 1: collect matching subscriptions from the trie.
        let mut plain: Vec<Subscription> = Vec::new();
        let mut shared_groups: HashSet<(String, String)> = HashSet::new();
        {
            let trie = self.read_trie();
            trie.modify(&message.topic, |sub| {
                if sub.is_shared() {
                    shared_groups
                        .insert((sub.share_name().to_string(), sub.topic_filter().to_string()));
                } else {
                    plain.push(sub.clone());
                }
            });
        }

        // Pass 2: one target per shared group.
        let mut shared_picks: Vec<(SessionGid, String, String)> = Vec::new();
        {
            let mut shared = self.write_shared();
            for (share_name, filter) in shared_groups {
                if let Some(target) = shared.next_target(&share_name, &filter) {
                    shared_picks.push((target, share_name, filter));
                }
            }
        }

        // Pass 3: resolve sessions into deliveries or offline queueing.
        let mut deliveries: Vec<Delivery> = Vec::new();
        let mut any_target = false;
        {
            let mut sessions = self.write_sessions();
            let mut plan = |sessions: &mut SessionStore,
                            gid: &SessionGid,
                            options: &v5::SubscribeOptions,
                            sub_id: Option<usize>| {
                if options.no_local() && publisher == Some(gid) {
                    return false;
                }
                let Some(session) = sessions.get_mut(gid) else {
                    return false;
                };
                let qos = message.qos.min(options.qos());
                let retain = options.retain_as_published() && message.retain;
                if let Some(sender) = session.endpoint() {
                    deliveries.push(Delivery {
                        sender,
                        protocol_level: session.protocol_level(),
                        qos,
                        retain,
                        sub_id,
                    });
                } else {
                    let mut queued = message.clone();
                    queued.qos = qos;
                    queued.retain = retain;
                    session.offline_queue.push_back(queued);
                }
                true
            };

            for sub in &plain {
                any_target |= plan(&mut sessions, sub.gid(), sub.options(), sub.sub_id());
            }
            for (gid, share_name, filter) in &shared_picks {
                let entry = sessions.get(gid).and_then(|session| {
                    session
                        .subscriptions
                        .get(&(share_name.clone(), filter.clone()))
                        .cloned()
                });
                if let Some(entry) = entry {
                    any_target |= plan(&mut sessions, gid, &entry.options, entry.sub_id);
                }
            }
        }

        for delivery in deliveries {
            self.send_to_endpoint(
                &delivery.sender,
                delivery.protocol_level,
                message,
                delivery.qos,
                delivery.retain,
                delivery.sub_id,
            )
            .await;
        }
        any_target
    }

    /// Build the subscriber-version publish packet and hand it to the
    /// target endpoint.
    async fn send_to_endpoint(
        &self,
        sender: &EndpointSender,
        protocol_level: ProtocolLevel,
        message: &Message,
        qos: QoS,
        retain: bool,
        sub_id: Option<usize>,
    ) {
        let pid = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            match sender.acquire_unique_id().await {
                Ok(pid) => pid,
                Err(err) => {
                    log::warn!("broker: Dropping message on {}: {err}", message.topic);
                    return;
                }
            }
        };

        let packet: Result<Packet, codec::EncodeError> = if protocol_level == ProtocolLevel::V5 {
            v5::PublishPacket::new(&message.topic, qos, &message.payload).map(|mut p| {
                p.set_retain(retain);
                p.set_packet_id(pid);
                *p.properties_mut() = message.properties.clone();
                if let Some(sub_id) = sub_id {
                    if let Ok(id) = codec::VarInt::from(sub_id) {
                        p.properties_mut()
                            .push(v5::Property::SubscriptionIdentifier(id));
                    }
                }
                p.into()
            })
        } else {
            v3::PublishPacket::new(&message.topic, qos, &message.payload).map(|mut p| {
                p.set_retain(retain);
                p.set_packet_id(pid);
                p.into()
            })
        };

        match packet {
            Ok(packet) => {
                if let Err(err) = sender.send(packet).await {
                    log::info!("broker: Delivery on {} failed: {err}", message.topic);
                }
            }
            Err(err) => {
                log::error!("broker: Could not build publish packet: {err:?}");
                if pid.value() != 0 {
                    let _ = sender.release_id(pid).await;
                }
            }
        }
    }

    // ----- subscribe / unsubscribe -----

    async fn handle_subscribe_v3(
        &self,
        gid: &SessionGid,
        endpoint: &Endpoint,
        packet: &v3::SubscribePacket,
    ) {
        let mut acks = Vec::with_capacity(packet.topics().len());
        let mut retained_jobs = Vec::new();
        for entry in packet.topics() {
            let mut options = v5::SubscribeOptions::default();
            options.set_qos(entry.qos());
            match self.subscribe_one(gid, entry.topic(), options, None) {
                Some(_newly_inserted) => {
                    acks.push(v3::SubscribeAck::QoS(entry.qos()));
                    // 3.1.1 always resends retained messages on subscribe.
                    if entry.topic().share_name().is_empty() {
                        retained_jobs.push((entry.topic().filter().to_string(), entry.qos()));
                    }
                }
                None => acks.push(v3::SubscribeAck::Failed),
            }
        }
        let _ = endpoint
            .send(v3::SubscribeAckPacket::with_vec(packet.packet_id(), acks).into())
            .await;

        for (filter, granted_qos) in retained_jobs {
            self.send_retained(endpoint, ProtocolLevel::V311, &filter, granted_qos)
                .await;
        }
    }

    async fn handle_subscribe_v5(
        &self,
        gid: &SessionGid,
        endpoint: &Endpoint,
        packet: &v5::SubscribePacket,
    ) {
        let sub_id = packet
            .properties()
            .find(v5::PropertyType::SubscriptionIdentifier)
            .and_then(|property| {
                if let v5::Property::SubscriptionIdentifier(id) = property {
                    Some(id.value())
                } else {
                    None
                }
            });

        let mut reasons = Vec::with_capacity(packet.topics().len());
        let mut retained_jobs = Vec::new();
        for entry in packet.topics() {
            let options = *entry.options();
            match self.subscribe_one(gid, entry.topic(), options, sub_id) {
                Some(newly_inserted) => {
                    reasons.push(match options.qos() {
                        QoS::AtMostOnce => ReasonCode::Success,
                        QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
                        QoS::ExactOnce => ReasonCode::GrantedQoS2,
                    });
                    let send_retained = entry.topic().share_name().is_empty()
                        && match options.retain_handling() {
                            v5::RetainHandling::SendAtSubscribe => true,
                            v5::RetainHandling::SendAtNewSubscribe => newly_inserted,
                            v5::RetainHandling::DoNotSend => false,
                        };
                    if send_retained {
                        retained_jobs.push((entry.topic().filter().to_string(), options.qos()));
                    }
                }
                None => reasons.push(ReasonCode::NotAuthorized),
            }
        }
        let _ = endpoint
            .send(v5::SubscribeAckPacket::with_vec(packet.packet_id(), reasons).into())
            .await;

        for (filter, granted_qos) in retained_jobs {
            self.send_retained(endpoint, ProtocolLevel::V5, &filter, granted_qos)
                .await;
        }
    }

    /// Authorize and record one subscription. Returns whether it is new,
    /// or `None` when denied.
    fn subscribe_one(
        &self,
        gid: &SessionGid,
        filter: &SubTopic,
        options: v5::SubscribeOptions,
        sub_id: Option<usize>,
    ) -> Option<bool> {
        let share_name = filter.share_name().to_string();
        let bare = filter.filter().to_string();

        if !self.read_security().auth_sub(gid.username(), &bare) {
            log::info!("broker: Denied subscription {bare} for {gid}");
            return None;
        }

        let subscription =
            Subscription::new(gid.clone(), &share_name, &bare, options, sub_id);
        let (handle, inserted) = self.write_trie().insert(subscription);
        if !share_name.is_empty() {
            self.write_shared().insert(&share_name, &bare, gid.clone());
        }
        {
            let mut sessions = self.write_sessions();
            if let Some(session) = sessions.get_mut(gid) {
                session.subscriptions.insert(
                    (share_name, bare),
                    SubEntry {
                        handle,
                        options,
                        sub_id,
                    },
                );
            }
        }
        Some(inserted)
    }

    async fn send_retained(
        &self,
        endpoint: &Endpoint,
        protocol_level: ProtocolLevel,
        filter: &str,
        granted_qos: QoS,
    ) {
        let matches = self.read_retained().find_matches(filter);
        for retained in matches {
            let message = Message {
                topic: retained.topic().to_string(),
                payload: retained.payload().to_vec(),
                qos: retained.qos().min(granted_qos),
                retain: true,
                properties: retained.properties().clone(),
            };
            self.send_to_endpoint(
                &endpoint.sender(),
                protocol_level,
                &message,
                message.qos,
                true,
                None,
            )
            .await;
        }
    }

    fn handle_unsubscribe(&self, gid: &SessionGid, topics: &[SubTopic]) -> Vec<ReasonCode> {
        let mut reasons = Vec::with_capacity(topics.len());
        for filter in topics {
            let share_name = filter.share_name().to_string();
            let bare = filter.filter().to_string();
            let entry = {
                let mut sessions = self.write_sessions();
                sessions.get_mut(gid).and_then(|session| {
                    session
                        .subscriptions
                        .remove(&(share_name.clone(), bare.clone()))
                })
            };
            match entry {
                Some(entry) => {
                    self.write_trie().remove(&entry.handle, gid, &share_name);
                    if !share_name.is_empty() {
                        self.write_shared().remove(&share_name, &bare, gid);
                    }
                    reasons.push(ReasonCode::Success);
                }
                None => reasons.push(ReasonCode::NoSubscriptionExisted),
            }
        }
        reasons
    }

    // ----- close path -----

    fn update_session_expiry(&self, gid: &SessionGid, interval_secs: u32) {
        let mut sessions = self.write_sessions();
        if let Some(session) = sessions.get_mut(gid) {
            session.expiry = if interval_secs == 0 {
                SessionExpiry::AtClose
            } else {
                SessionExpiry::After(Duration::from_secs(u64::from(interval_secs)))
            };
        }
    }

    /// Tear down the server side of a finished connection.
    ///
    /// Persists or destroys the session per its expiry, copies inflight
    /// state out of the endpoint, and arranges will delivery.
    async fn close_endpoint(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        endpoint: &Endpoint,
        send_will: bool,
    ) {
        let inflight = endpoint.get_stored_packets().await.unwrap_or_default();
        let qos2 = endpoint.get_qos2_handled().await.unwrap_or_default();

        enum WillPlan {
            Now(Will),
            Delayed(Duration, u64),
            Keep,
        }

        let (gid, keep_session, will_plan, dropped_session) = {
            let mut sessions = self.write_sessions();
            // Taken-over endpoints have already been unlinked; nothing
            // left to do for them.
            let Some(gid) = sessions.gid_of_endpoint(endpoint_id).cloned() else {
                return;
            };
            let Some(session) = sessions.detach_endpoint(endpoint_id, inflight, qos2) else {
                return;
            };
            let keep_session = session.expiry != SessionExpiry::AtClose;
            let epoch = session.epoch();

            let will_plan = if send_will {
                match session.will.as_ref().and_then(|will| will.delay()) {
                    // The will stays parked in the session; the timer
                    // takes it unless a reconnect got there first.
                    Some(delay) if keep_session => WillPlan::Delayed(delay, epoch),
                    _ => session.will.take().map_or(WillPlan::Keep, WillPlan::Now),
                }
            } else {
                session.will = None;
                WillPlan::Keep
            };

            let dropped_session = if keep_session {
                None
            } else {
                sessions.remove(&gid)
            };
            (gid, keep_session, will_plan, dropped_session)
        };

        if let Some(session) = dropped_session {
            self.drop_subscriptions(&gid, &session.subscriptions);
        }

        match will_plan {
            WillPlan::Now(will) => self.publish_will(&gid, will).await,
            WillPlan::Delayed(delay, epoch) => {
                let broker = Arc::clone(self);
                let gid = gid.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    broker.fire_delayed_will(&gid, epoch).await;
                });
            }
            WillPlan::Keep => {}
        }

        if keep_session {
            if let SessionExpiry::After(delay) = self.session_expiry_of(&gid) {
                let broker = Arc::clone(self);
                let epoch = self.session_epoch(&gid);
                let gid = gid.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    broker.expire_session(&gid, epoch).await;
                });
            }
            log::info!("broker: Session {gid} went offline");
        } else {
            log::info!("broker: Session {gid} removed");
        }
    }

    fn session_expiry_of(&self, gid: &SessionGid) -> SessionExpiry {
        self.read_sessions()
            .get(gid)
            .map_or(SessionExpiry::AtClose, |session| session.expiry)
    }

    fn session_epoch(&self, gid: &SessionGid) -> u64 {
        self.read_sessions().get(gid).map_or(0, Session::epoch)
    }

    fn session_level(&self, gid: &SessionGid) -> Option<ProtocolLevel> {
        self.read_sessions()
            .get(gid)
            .map(Session::protocol_level)
    }

    /// The will delay passed without a reconnect; deliver the will.
    async fn fire_delayed_will(self: &Arc<Self>, gid: &SessionGid, epoch: u64) {
        let will = {
            let mut sessions = self.write_sessions();
            let Some(session) = sessions.get_mut(gid) else {
                return;
            };
            // A reconnect before the delay elapsed cancels the will
            // [MQTT-3.1.3-9].
            if session.epoch() != epoch || session.is_online() {
                return;
            }
            session.will.take()
        };
        if let Some(will) = will {
            self.publish_will(gid, will).await;
        }
    }

    /// The session expiry fired; drop the session and everything indexed
    /// under it.
    async fn expire_session(self: &Arc<Self>, gid: &SessionGid, epoch: u64) {
        let removed = {
            let mut sessions = self.write_sessions();
            let Some(session) = sessions.get(gid) else {
                return;
            };
            if session.epoch() != epoch || session.is_online() {
                return;
            }
            sessions.remove(gid)
        };
        let Some(session) = removed else {
            return;
        };
        self.drop_subscriptions(gid, &session.subscriptions);
        log::info!("broker: Session {gid} expired");

        // Session end delivers a still-pending will.
        if let Some(will) = session.will {
            self.publish_will(gid, will).await;
        }
    }

    async fn publish_will(&self, owner: &SessionGid, will: Will) {
        if !self.read_security().auth_pub(owner.username(), will.topic()) {
            log::info!("broker: Will of {owner} on {} denied", will.topic());
            return;
        }
        if will.retain() {
            self.update_retained(will.topic(), will.payload(), will.qos(), will.properties());
        }
        let message = Message {
            topic: will.topic().to_string(),
            payload: will.payload().to_vec(),
            qos: will.qos(),
            retain: will.retain(),
            properties: will.properties().clone(),
        };
        self.deliver(Some(owner), &message).await;
    }

    fn drop_subscriptions(
        &self,
        gid: &SessionGid,
        subscriptions: &std::collections::HashMap<(String, String), SubEntry>,
    ) {
        {
            let mut trie = self.write_trie();
            for ((share_name, _filter), entry) in subscriptions {
                trie.remove(&entry.handle, gid, share_name);
            }
        }
        let mut shared = self.write_shared();
        for (share_name, filter) in subscriptions.keys() {
            if !share_name.is_empty() {
                shared.remove(share_name, filter, gid);
            }
        }
    }

    // ----- lock helpers; poisoning is unrecoverable -----

    fn read_sessions(&self) -> RwLockReadGuard<'_, SessionStore> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, SessionStore> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_trie(&self) -> RwLockReadGuard<'_, SubTrie> {
        self.trie.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_trie(&self) -> RwLockWriteGuard<'_, SubTrie> {
        self.trie.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_retained(&self) -> RwLockReadGuard<'_, RetainStore> {
        self.retained.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_retained(&self) -> RwLockWriteGuard<'_, RetainStore> {
        self.retained.write().unwrap_or_else(|e| e.into_inner())
    }

    fn write_shared(&self) -> RwLockWriteGuard<'_, SharedTargets> {
        self.shared.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_security(&self) -> RwLockReadGuard<'_, Security> {
        self.security.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_security(&self) -> RwLockWriteGuard<'_, Security> {
        self.security.write().unwrap_or_else(|e| e.into_inner())
    }
}
