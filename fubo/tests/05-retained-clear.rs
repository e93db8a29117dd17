// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{v3, QoS};

mod common;
use common::{attach, new_broker};

// A retained publish with an empty payload erases the stored entry, so
// later subscribers receive nothing.
#[tokio::test]
async fn test_retained_store_and_clear() {
    let broker = new_broker();

    let mut subscriber = attach(&broker);
    subscriber.connect_v3("sub", true).await;
    subscriber.subscribe("r/#", QoS::AtMostOnce, 1).await;

    let mut publisher = attach(&broker);
    publisher.connect_v3("pub", true).await;
    let mut publish = v3::PublishPacket::new("r/1", QoS::AtMostOnce, b"v1").unwrap();
    publish.set_retain(true);
    publisher.send(&publish.into()).await;

    let (topic, payload, _qos, _retain) = subscriber.expect_publish().await;
    assert_eq!(topic, "r/1");
    assert_eq!(payload, b"v1");

    // A fresh subscriber gets the retained copy, marked retained.
    let mut late = attach(&broker);
    late.connect_v3("late", true).await;
    late.subscribe("r/#", QoS::AtMostOnce, 1).await;
    let (topic, payload, _qos, retain) = late.expect_publish().await;
    assert_eq!(topic, "r/1");
    assert_eq!(payload, b"v1");
    assert!(retain);

    // Clearing: retained publish with empty payload.
    let mut clear = v3::PublishPacket::new("r/1", QoS::AtMostOnce, b"").unwrap();
    clear.set_retain(true);
    publisher.send(&clear.into()).await;

    let (topic, payload, _qos, _retain) = subscriber.expect_publish().await;
    assert_eq!(topic, "r/1");
    assert!(payload.is_empty());

    // The store entry is gone: a new subscriber sees nothing retained.
    let mut last = attach(&broker);
    last.connect_v3("last", true).await;
    last.subscribe("r/#", QoS::AtMostOnce, 1).await;

    // Probe round trip: the only delivery is the live probe itself.
    let probe = v3::PublishPacket::new("r/probe", QoS::AtMostOnce, b"probe").unwrap();
    publisher.send(&probe.into()).await;
    let (topic, payload, _qos, retain) = last.expect_publish().await;
    assert_eq!(topic, "r/probe");
    assert_eq!(payload, b"probe");
    assert!(!retain);
}
