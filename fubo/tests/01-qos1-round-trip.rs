// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{v3, Packet, PacketId, QoS};

mod common;
use common::{attach, new_broker};

#[tokio::test]
async fn test_qos1_publish_round_trip_v3() {
    let broker = new_broker();

    let mut subscriber = attach(&broker);
    let ack = subscriber.connect_v3("sub", true).await;
    assert!(!ack.session_present());
    assert_eq!(ack.return_code(), v3::ConnectReturnCode::Accepted);
    subscriber.subscribe("a/b", QoS::AtLeastOnce, 1).await;

    let mut publisher = attach(&broker);
    publisher.connect_v3("c1", true).await;

    let mut publish = v3::PublishPacket::new("a/b", QoS::AtLeastOnce, b"x").unwrap();
    publish.set_packet_id(PacketId::new(1));
    publisher.send(&publish.into()).await;

    // The broker acknowledges the publisher...
    match publisher.recv().await {
        Packet::PublishAckV3(ack) => assert_eq!(ack.packet_id(), PacketId::new(1)),
        other => panic!("expected puback, got {other:?}"),
    }

    // ...and forwards to the subscriber.
    let (topic, payload, qos, _retain) = subscriber.expect_publish().await;
    assert_eq!(topic, "a/b");
    assert_eq!(payload, b"x");
    assert_eq!(qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_qos_downgraded_to_subscription_maximum() {
    let broker = new_broker();

    let mut subscriber = attach(&broker);
    subscriber.connect_v3("sub", true).await;
    subscriber.subscribe("t", QoS::AtMostOnce, 1).await;

    let mut publisher = attach(&broker);
    publisher.connect_v3("c1", true).await;
    let mut publish = v3::PublishPacket::new("t", QoS::AtLeastOnce, b"m").unwrap();
    publish.set_packet_id(PacketId::new(1));
    publisher.send(&publish.into()).await;

    let (_topic, _payload, qos, _retain) = subscriber.expect_publish().await;
    assert_eq!(qos, QoS::AtMostOnce);
}
