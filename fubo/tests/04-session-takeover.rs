// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::v5::ReasonCode;
use codec::{v5, Packet, QoS, U32Data};

mod common;
use common::{attach, new_broker};

fn session_props(expiry_secs: u32) -> v5::Properties {
    let mut props = v5::Properties::new();
    props.push(v5::Property::SessionExpiryInterval(U32Data::new(
        expiry_secs,
    )));
    props
}

// A second connect for the same (username, client_id) kicks the first
// connection out with session_taken_over and inherits its session.
#[tokio::test]
async fn test_session_takeover() {
    let broker = new_broker();

    let mut first = attach(&broker);
    let ack = first.connect_v5("c", true, session_props(300)).await;
    assert!(!ack.session_present());
    first.subscribe("t/#", QoS::AtMostOnce, 1).await;

    let mut second = attach(&broker);
    let ack = second.connect_v5("c", false, session_props(300)).await;
    // The old session had a non-zero expiry and the new connect did not
    // ask for a clean start.
    assert!(ack.session_present());

    match first.try_recv().await {
        Some(Packet::DisconnectV5(p)) => {
            assert_eq!(p.reason_code(), ReasonCode::SessionTakenOver);
        }
        Some(other) => panic!("expected disconnect, got {other:?}"),
        None => panic!("expected disconnect before stream close"),
    }
    assert!(first.try_recv().await.is_none());

    // The inherited subscription still works on the new connection.
    let mut publisher = attach(&broker);
    publisher
        .connect_v5("pub", true, v5::Properties::new())
        .await;
    let publish = v5::PublishPacket::new("t/1", QoS::AtMostOnce, b"m").unwrap();
    publisher.send(&publish.into()).await;

    let (topic, payload, _qos, _retain) = second.expect_publish().await;
    assert_eq!(topic, "t/1");
    assert_eq!(payload, b"m");
}

#[tokio::test]
async fn test_takeover_with_clean_start_discards_session() {
    let broker = new_broker();

    let mut first = attach(&broker);
    first.connect_v5("c", true, session_props(300)).await;
    first.subscribe("t/#", QoS::AtMostOnce, 1).await;

    let mut second = attach(&broker);
    let ack = second.connect_v5("c", true, session_props(300)).await;
    assert!(!ack.session_present());
    match first.try_recv().await {
        Some(Packet::DisconnectV5(p)) => {
            assert_eq!(p.reason_code(), ReasonCode::SessionTakenOver);
        }
        Some(other) => panic!("expected disconnect, got {other:?}"),
        None => {}
    }

    // The old subscription is gone.
    let mut publisher = attach(&broker);
    publisher
        .connect_v5("pub", true, v5::Properties::new())
        .await;
    let publish = v5::PublishPacket::new("t/1", QoS::AtMostOnce, b"m").unwrap();
    publisher.send(&publish.into()).await;

    second.subscribe("probe", QoS::AtMostOnce, 9).await;
    let probe = v5::PublishPacket::new("probe", QoS::AtMostOnce, b"p").unwrap();
    publisher.send(&probe.into()).await;
    let (topic, _payload, _qos, _retain) = second.expect_publish().await;
    assert_eq!(topic, "probe");
}
