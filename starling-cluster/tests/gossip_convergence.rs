//! Gossip dissemination and consensus scenarios.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestHarness, wait_member_count, wait_until};
use serde_json::json;

#[tokio::test]
async fn state_reaches_every_member() {
    let harness = TestHarness::new();
    let a = harness.start_member(4101).await;
    let b = harness.start_member(4102).await;
    let c = harness.start_member(4103).await;
    let d = harness.start_member(4104).await;
    let nodes = [&a, &b, &c, &d];
    wait_member_count(&nodes, 4, Duration::from_secs(5)).await;

    a.gossiper()
        .set_state("heartbeat", json!({"beat": 1}))
        .expect("set state");
    let origin = a.local_member().id.clone();

    // Probabilistic bound: asserted at well over 10× the gossip interval.
    for node in &nodes[1..] {
        let node = Arc::clone(node);
        let origin = origin.clone();
        wait_until(Duration::from_secs(3), move || {
            node.gossiper()
                .get_state(&origin, "heartbeat")
                .ok()
                .flatten()
                .is_some()
        })
        .await;
    }

    for node in nodes {
        node.shutdown(true, "test done").await.expect("shutdown");
    }
}

#[tokio::test]
async fn overwrites_converge_to_latest_and_never_revert() {
    let harness = TestHarness::new();
    let a = harness.start_member(4111).await;
    let b = harness.start_member(4112).await;
    wait_member_count(&[&a, &b], 2, Duration::from_secs(5)).await;

    a.gossiper().set_state("config", json!("v1")).expect("set");
    a.gossiper().set_state("config", json!("v2")).expect("set");
    let origin = a.local_member().id.clone();

    {
        let b = Arc::clone(&b);
        let origin = origin.clone();
        wait_until(Duration::from_secs(3), move || {
            b.gossiper().get_state(&origin, "config").ok().flatten() == Some(json!("v2"))
        })
        .await;
    }

    // Sample for a while: the settled value must not revert to v1.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(
            b.gossiper().get_state(&origin, "config").expect("get"),
            Some(json!("v2"))
        );
    }

    a.shutdown(true, "test done").await.expect("shutdown a");
    b.shutdown(true, "test done").await.expect("shutdown b");
}

#[tokio::test]
async fn consensus_reached_when_all_members_agree() {
    let harness = TestHarness::new();
    let a = harness.start_member(4121).await;
    let b = harness.start_member(4122).await;
    let c = harness.start_member(4123).await;
    let nodes = [&a, &b, &c];
    wait_member_count(&nodes, 3, Duration::from_secs(5)).await;

    let mut handles = Vec::new();
    for node in &nodes {
        handles.push(node.gossiper().register_consensus_check("ready"));
    }

    for node in &nodes {
        node.gossiper().set_state("ready", json!("ok")).expect("set");
    }

    for mut handle in handles {
        let result = tokio::time::timeout(Duration::from_secs(3), handle.reached())
            .await
            .expect("consensus within deadline")
            .expect("consensus result");
        assert_eq!(result.value, json!("ok"));
    }

    for node in nodes {
        node.shutdown(true, "test done").await.expect("shutdown");
    }
}

#[tokio::test]
async fn consensus_rearms_on_membership_change() {
    let harness = TestHarness::new();
    let a = harness.start_member(4131).await;
    let b = harness.start_member(4132).await;
    wait_member_count(&[&a, &b], 2, Duration::from_secs(5)).await;

    let mut handle = a.gossiper().register_consensus_check("ready");
    a.gossiper().set_state("ready", json!(1)).expect("set");
    b.gossiper().set_state("ready", json!(1)).expect("set");

    let first = tokio::time::timeout(Duration::from_secs(3), handle.reached())
        .await
        .expect("consensus within deadline")
        .expect("consensus result");

    // A third member joins: new generation, agreement must be re-earned.
    let c = harness.start_member(4133).await;
    wait_member_count(&[&a, &b, &c], 3, Duration::from_secs(5)).await;
    assert!(handle.latest().is_none(), "stale consensus survived a join");

    c.gossiper().set_state("ready", json!(1)).expect("set");
    let second = tokio::time::timeout(Duration::from_secs(3), handle.reached())
        .await
        .expect("consensus within deadline")
        .expect("consensus result");
    assert!(second.generation > first.generation);

    for node in [a, b, c] {
        node.shutdown(true, "test done").await.expect("shutdown");
    }
}
