// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{v5, QoS};

mod common;
use common::{attach, new_broker};

// Each publish matching a share goes to exactly one member of the group.
#[tokio::test]
async fn test_shared_subscription_round_robin() {
    let broker = new_broker();

    let mut worker_a = attach(&broker);
    worker_a
        .connect_v5("worker-a", true, v5::Properties::new())
        .await;
    worker_a
        .subscribe("$share/pool/jobs/#", QoS::AtMostOnce, 1)
        .await;

    let mut worker_b = attach(&broker);
    worker_b
        .connect_v5("worker-b", true, v5::Properties::new())
        .await;
    worker_b
        .subscribe("$share/pool/jobs/#", QoS::AtMostOnce, 1)
        .await;

    let mut publisher = attach(&broker);
    publisher
        .connect_v5("pub", true, v5::Properties::new())
        .await;
    for i in 0..4_u8 {
        let publish =
            v5::PublishPacket::new("jobs/build", QoS::AtMostOnce, &[i]).unwrap();
        publisher.send(&publish.into()).await;
    }

    // Two each, alternating.
    let (_t, first, _q, _r) = worker_a.expect_publish().await;
    let (_t, second, _q, _r) = worker_a.expect_publish().await;
    let (_t, third, _q, _r) = worker_b.expect_publish().await;
    let (_t, fourth, _q, _r) = worker_b.expect_publish().await;

    let mut a: Vec<u8> = first.into_iter().chain(second).collect();
    let mut b: Vec<u8> = third.into_iter().chain(fourth).collect();
    a.sort_unstable();
    b.sort_unstable();
    let mut all: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
    all.sort_unstable();
    assert_eq!(all, vec![0, 1, 2, 3]);
    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 2);
}
