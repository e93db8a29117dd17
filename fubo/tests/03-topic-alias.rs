// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::v5::ReasonCode;
use codec::{v5, Packet, QoS, U16Data};

mod common;
use common::{attach, new_broker};

// Aliased publishes must reach subscribers under the full topic name; an
// alias the broker never learned is a protocol error.
#[tokio::test]
async fn test_topic_alias_resolution_and_error() {
    let broker = new_broker();

    let mut subscriber = attach(&broker);
    subscriber
        .connect_v5("sub", true, v5::Properties::new())
        .await;
    subscriber.subscribe("long/topic", QoS::AtMostOnce, 1).await;

    let mut publisher = attach(&broker);
    let ack = publisher
        .connect_v5("pub", true, v5::Properties::new())
        .await;
    assert!(ack.properties().topic_alias_maximum().unwrap_or(0) >= 3);

    // Declare alias 3 together with the topic name.
    let mut publish = v5::PublishPacket::new("long/topic", QoS::AtMostOnce, b"1").unwrap();
    publish
        .properties_mut()
        .push(v5::Property::TopicAlias(U16Data::new(3)));
    publisher.send(&publish.into()).await;

    // Alias only.
    let mut publish = v5::PublishPacket::new("", QoS::AtMostOnce, b"2").unwrap();
    publish
        .properties_mut()
        .push(v5::Property::TopicAlias(U16Data::new(3)));
    publisher.send(&publish.into()).await;

    let (topic, payload, _qos, _retain) = subscriber.expect_publish().await;
    assert_eq!(topic, "long/topic");
    assert_eq!(payload, b"1");
    let (topic, payload, _qos, _retain) = subscriber.expect_publish().await;
    assert_eq!(topic, "long/topic");
    assert_eq!(payload, b"2");

    // Unknown alias: the broker disconnects with topic_alias_invalid.
    let mut publish = v5::PublishPacket::new("", QoS::AtMostOnce, b"3").unwrap();
    publish
        .properties_mut()
        .push(v5::Property::TopicAlias(U16Data::new(4)));
    publisher.send(&publish.into()).await;

    match publisher.recv().await {
        Packet::DisconnectV5(p) => {
            assert_eq!(p.reason_code(), ReasonCode::TopicAliasInvalid);
        }
        other => panic!("expected disconnect, got {other:?}"),
    }
    assert!(publisher.try_recv().await.is_none());
}
