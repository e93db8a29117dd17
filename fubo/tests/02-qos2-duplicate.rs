// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{v3, Packet, PacketId, QoS};

mod common;
use common::{attach, new_broker};

// A qos 2 publish retransmitted before the release must be answered with
// another pubrec but must not reach subscribers a second time.
#[tokio::test]
async fn test_qos2_duplicate_suppressed() {
    let broker = new_broker();

    let mut subscriber = attach(&broker);
    subscriber.connect_v3("sub", true).await;
    subscriber.subscribe("t", QoS::AtMostOnce, 1).await;

    let mut publisher = attach(&broker);
    publisher.connect_v3("pub", true).await;

    let mut publish = v3::PublishPacket::new("t", QoS::ExactOnce, b"p").unwrap();
    publish.set_packet_id(PacketId::new(7));
    publisher.send(&publish.clone().into()).await;

    match publisher.recv().await {
        Packet::PublishReceivedV3(p) => assert_eq!(p.packet_id(), PacketId::new(7)),
        other => panic!("expected pubrec, got {other:?}"),
    }

    // Retransmission with the dup flag, before the release.
    publish.set_dup(true).unwrap();
    publisher.send(&publish.into()).await;
    match publisher.recv().await {
        Packet::PublishReceivedV3(p) => assert_eq!(p.packet_id(), PacketId::new(7)),
        other => panic!("expected second pubrec, got {other:?}"),
    }

    publisher
        .send(&v3::PublishReleasePacket::new(PacketId::new(7)).into())
        .await;
    match publisher.recv().await {
        Packet::PublishCompleteV3(p) => assert_eq!(p.packet_id(), PacketId::new(7)),
        other => panic!("expected pubcomp, got {other:?}"),
    }

    // Exactly one delivery.
    let (topic, payload, _qos, _retain) = subscriber.expect_publish().await;
    assert_eq!(topic, "t");
    assert_eq!(payload, b"p");

    // A second delivery would arrive before this probe round trip does.
    let probe = v3::PublishPacket::new("t", QoS::AtMostOnce, b"probe").unwrap();
    publisher.send(&probe.into()).await;
    let (_topic, payload, _qos, _retain) = subscriber.expect_publish().await;
    assert_eq!(payload, b"probe");
}
