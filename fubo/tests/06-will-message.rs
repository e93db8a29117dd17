// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{v3, ConnectFlags, Packet, QoS};

mod common;
use common::{attach, new_broker};

// The will goes out when the stream dies without a disconnect packet,
// and stays suppressed after a clean disconnect.
#[tokio::test]
async fn test_will_on_unclean_close() {
    let broker = new_broker();

    let mut watcher = attach(&broker);
    watcher.connect_v3("watcher", true).await;
    watcher.subscribe("dead/#", QoS::AtMostOnce, 1).await;

    let mut doomed = attach(&broker);
    let mut connect = v3::ConnectPacket::new("doomed").unwrap();
    let mut flags = ConnectFlags::default();
    flags.set_clean_session(true);
    connect.set_connect_flags(flags);
    connect.set_will_topic("dead/doomed").unwrap();
    connect.set_will_message(b"gone").unwrap();
    doomed.send(&connect.into()).await;
    match doomed.recv().await {
        Packet::ConnectAckV3(ack) => {
            assert_eq!(ack.return_code(), v3::ConnectReturnCode::Accepted);
        }
        other => panic!("expected connack, got {other:?}"),
    }

    // Drop the stream without a disconnect packet.
    drop(doomed);

    let (topic, payload, _qos, _retain) = watcher.expect_publish().await;
    assert_eq!(topic, "dead/doomed");
    assert_eq!(payload, b"gone");
}

#[tokio::test]
async fn test_will_suppressed_on_clean_disconnect() {
    let broker = new_broker();

    let mut watcher = attach(&broker);
    watcher.connect_v3("watcher", true).await;
    watcher.subscribe("dead/#", QoS::AtMostOnce, 1).await;

    let mut polite = attach(&broker);
    let mut connect = v3::ConnectPacket::new("polite").unwrap();
    let mut flags = ConnectFlags::default();
    flags.set_clean_session(true);
    connect.set_connect_flags(flags);
    connect.set_will_topic("dead/polite").unwrap();
    connect.set_will_message(b"gone").unwrap();
    polite.send(&connect.into()).await;
    polite.recv().await;

    polite.send(&v3::DisconnectPacket::new().into()).await;
    drop(polite);

    // Probe: the only delivery the watcher sees is the live probe.
    let mut publisher = attach(&broker);
    publisher.connect_v3("pub", true).await;
    let probe = v3::PublishPacket::new("dead/probe", QoS::AtMostOnce, b"probe").unwrap();
    publisher.send(&probe.into()).await;

    let (topic, payload, _qos, _retain) = watcher.expect_publish().await;
    assert_eq!(topic, "dead/probe");
    assert_eq!(payload, b"probe");
}
