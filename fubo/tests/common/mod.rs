// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Shared helpers: an in-process broker plus a raw wire-level client
//! speaking through `tokio::io::duplex`, so every byte the broker sees
//! went through the real codec.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use codec::{
    v3, v5, ConnectFlags, EncodePacket, Packet, PacketReader, ProtocolLevel, QoS,
};
use fubo::broker::Broker;
use fubo::connection::Role;
use fubo::endpoint::{Endpoint, EndpointConfig};
use fubo::security::Security;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn new_broker() -> Arc<Broker> {
    Broker::new(Security::default_permissive())
}

pub fn new_broker_with_security(security: Security) -> Arc<Broker> {
    Broker::new(security)
}

/// Wire-level test client attached to an in-process broker.
pub struct RawClient {
    stream: DuplexStream,
    reader: PacketReader,
    level: ProtocolLevel,
}

/// Open a connection against `broker` and return the client half.
pub fn attach(broker: &Arc<Broker>) -> RawClient {
    let (client_stream, server_stream) = tokio::io::duplex(16 * 1024);
    let endpoint = Endpoint::new(server_stream, Role::Server, EndpointConfig::broker());
    tokio::spawn(Arc::clone(broker).handle_endpoint(endpoint, None));
    RawClient {
        stream: client_stream,
        reader: PacketReader::new(),
        level: ProtocolLevel::V311,
    }
}

impl RawClient {
    pub async fn send(&mut self, packet: &Packet) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Receive the next packet, panicking on timeout or stream end.
    pub async fn recv(&mut self) -> Packet {
        self.try_recv()
            .await
            .expect("connection closed while a packet was expected")
    }

    /// Receive the next packet, `None` once the broker closed the stream.
    pub async fn try_recv(&mut self) -> Option<Packet> {
        loop {
            if let Some(buf) = self.reader.next_packet().unwrap() {
                return Some(Packet::decode(&buf, self.level).unwrap());
            }
            let mut chunk = [0_u8; 1024];
            let n = timeout(RECV_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a packet")
                .expect("stream error");
            if n == 0 {
                return None;
            }
            self.reader.feed(&chunk[..n]);
        }
    }

    /// Connect with 3.1.1 and expect an accepted connack.
    pub async fn connect_v3(&mut self, client_id: &str, clean_session: bool) -> v3::ConnectAckPacket {
        self.level = ProtocolLevel::V311;
        let mut connect = v3::ConnectPacket::new(client_id).unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(clean_session);
        connect.set_connect_flags(flags);
        self.send(&connect.into()).await;
        match self.recv().await {
            Packet::ConnectAckV3(ack) => ack,
            other => panic!("expected connack, got {other:?}"),
        }
    }

    /// Connect with 5.0 and expect a connack.
    pub async fn connect_v5(
        &mut self,
        client_id: &str,
        clean_start: bool,
        properties: v5::Properties,
    ) -> v5::ConnectAckPacket {
        self.level = ProtocolLevel::V5;
        let mut connect = v5::ConnectPacket::new(client_id).unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(clean_start);
        connect.set_connect_flags(flags);
        *connect.properties_mut() = properties;
        self.send(&connect.into()).await;
        match self.recv().await {
            Packet::ConnectAckV5(ack) => ack,
            other => panic!("expected connack, got {other:?}"),
        }
    }

    /// Subscribe to one filter and expect the suback.
    pub async fn subscribe(&mut self, filter: &str, qos: QoS, pid: u16) {
        let pid = codec::PacketId::new(pid);
        if self.level == ProtocolLevel::V5 {
            let packet = v5::SubscribePacket::new(filter, qos, pid).unwrap();
            self.send(&packet.into()).await;
            match self.recv().await {
                Packet::SubscribeAckV5(ack) => {
                    assert!(!ack.reasons()[0].is_error(), "subscribe denied");
                }
                other => panic!("expected suback, got {other:?}"),
            }
        } else {
            let packet = v3::SubscribePacket::new(filter, qos, pid).unwrap();
            self.send(&packet.into()).await;
            match self.recv().await {
                Packet::SubscribeAckV3(ack) => {
                    assert!(
                        !matches!(ack.acks()[0], v3::SubscribeAck::Failed),
                        "subscribe denied"
                    );
                }
                other => panic!("expected suback, got {other:?}"),
            }
        }
    }

    /// Receive packets until a publish arrives, answering the `QoS`
    /// choreography along the way.
    pub async fn expect_publish(&mut self) -> (String, Vec<u8>, QoS, bool) {
        loop {
            match self.recv().await {
                Packet::PublishV3(p) => {
                    self.ack_publish_v3(&p).await;
                    return (
                        p.topic().to_string(),
                        p.message().to_vec(),
                        p.qos(),
                        p.retain(),
                    );
                }
                Packet::PublishV5(p) => {
                    self.ack_publish_v5(&p).await;
                    return (
                        p.topic().to_string(),
                        p.message().to_vec(),
                        p.qos(),
                        p.retain(),
                    );
                }
                other => panic!("expected publish, got {other:?}"),
            }
        }
    }

    async fn ack_publish_v3(&mut self, p: &v3::PublishPacket) {
        match p.qos() {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                self.send(&v3::PublishAckPacket::new(p.packet_id()).into())
                    .await;
            }
            QoS::ExactOnce => {
                self.send(&v3::PublishReceivedPacket::new(p.packet_id()).into())
                    .await;
            }
        }
    }

    async fn ack_publish_v5(&mut self, p: &v5::PublishPacket) {
        match p.qos() {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                self.send(&v5::PublishAckPacket::new(p.packet_id()).into())
                    .await;
            }
            QoS::ExactOnce => {
                self.send(&v5::PublishReceivedPacket::new(p.packet_id()).into())
                    .await;
            }
        }
    }
}
