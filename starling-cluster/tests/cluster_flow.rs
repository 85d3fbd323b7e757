//! End-to-end lifecycle scenarios over in-process members.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{TestHarness, wait_member_count, wait_until};
use starling_cluster::{ClusterEvent, ClusterIdentity, MemberId};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn happy_activation_two_members() {
    let harness = TestHarness::new();
    let a = harness.start_member(4001).await;
    let b = harness.start_member(4002).await;
    wait_member_count(&[&a, &b], 2, Duration::from_secs(5)).await;

    let identity = ClusterIdentity::new("counter", "x");
    let cancel = CancellationToken::new();

    let v1: i64 = a
        .context()
        .request(&identity, "increment", &(), &cancel)
        .await
        .expect("request via a");
    let v2: i64 = b
        .context()
        .request(&identity, "increment", &(), &cancel)
        .await
        .expect("request via b");
    // One grain served both calls.
    assert_eq!((v1, v2), (1, 2));

    // Exactly one member hosts it, and the store has exactly one entry.
    let hosts = [&a, &b]
        .iter()
        .filter(|c| c.activations().pid_of(&identity).is_some())
        .count();
    assert_eq!(hosts, 1);
    assert_eq!(harness.store.live_reservations(), 1);

    a.shutdown(true, "test done").await.expect("shutdown a");
    b.shutdown(true, "test done").await.expect("shutdown b");
}

#[tokio::test]
async fn member_departure_evicts_cache_and_replaces() {
    let harness = TestHarness::new();
    let a = harness.start_member(4011).await;
    let b = harness.start_member(4012).await;
    let c = harness.start_member(4013).await;
    wait_member_count(&[&a, &b, &c], 3, Duration::from_secs(5)).await;

    let identity = ClusterIdentity::new("counter", "victim");
    let cancel = CancellationToken::new();
    let _: i64 = a
        .context()
        .request(&identity, "increment", &(), &cancel)
        .await
        .expect("initial request");

    let survivors: Vec<_> = [&a, &b, &c]
        .into_iter()
        .filter(|n| n.activations().pid_of(&identity).is_none())
        .collect();
    let owner = [&a, &b, &c]
        .into_iter()
        .find(|n| n.activations().pid_of(&identity).is_some())
        .expect("someone hosts it");
    let owner_address = owner.local_member().address.clone();

    // Kill the owner abruptly; survivors learn through the provider TTL.
    owner.shutdown(false, "killed").await.expect("kill owner");
    for survivor in &survivors {
        let survivor = Arc::clone(survivor);
        wait_until(Duration::from_secs(5), || {
            survivor.member_list().current().members.len() == 2
        })
        .await;
        // Cache soundness: no cached entry may point at the departed
        // member once the topology event is out.
        assert!(
            survivor.pid_cache().try_get(&identity).is_none(),
            "cache still points at departed member"
        );
    }

    // After the reservation TTL lapses, the identity is re-placed on a
    // survivor and the store again holds exactly one entry for it.
    let requester = survivors[0];
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let value: i64 = loop {
        let result = requester
            .context()
            .request(&identity, "increment", &(), &cancel)
            .await;
        match result {
            Ok(value) => break value,
            Err(_) if std::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(error) => panic!("re-placement never succeeded: {error}"),
        }
    };
    // Fresh activation: state restarted.
    assert_eq!(value, 1);
    let new_owner = survivors
        .iter()
        .find(|n| n.activations().pid_of(&identity).is_some())
        .expect("a survivor hosts it");
    assert_ne!(new_owner.local_member().address, owner_address);

    for survivor in survivors {
        survivor.shutdown(true, "test done").await.expect("shutdown");
    }
}

#[tokio::test]
async fn topology_hashes_never_repeat_back_to_back() {
    let harness = TestHarness::new();
    let a = harness.start_member(4021).await;

    let hashes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&hashes);
    let _sub = a.event_bus().subscribe(move |event| {
        if let ClusterEvent::TopologyChanged(topology) = event {
            sink.lock().expect("sink").push(topology.topology_hash);
        }
    });

    let b = harness.start_member(4022).await;
    wait_member_count(&[&a, &b], 2, Duration::from_secs(5)).await;
    b.shutdown(true, "leaving").await.expect("shutdown b");
    let a2 = Arc::clone(&a);
    wait_until(Duration::from_secs(5), || {
        a2.member_list().current().members.len() == 1
    })
    .await;
    let c = harness.start_member(4023).await;
    wait_member_count(&[&a, &c], 2, Duration::from_secs(5)).await;

    let hashes = hashes.lock().expect("sink");
    assert!(hashes.len() >= 3);
    for pair in hashes.windows(2) {
        assert_ne!(pair[0], pair[1], "duplicate back-to-back topology hash");
    }

    a.shutdown(true, "test done").await.expect("shutdown a");
    c.shutdown(true, "test done").await.expect("shutdown c");
}

#[tokio::test]
async fn graceful_shutdown_announces_and_releases() {
    let harness = TestHarness::new();
    let a = harness.start_member(4031).await;
    let b = harness.start_member(4032).await;
    let c = harness.start_member(4033).await;
    wait_member_count(&[&a, &b, &c], 3, Duration::from_secs(5)).await;

    // Give A some activations (identities that hash to A will land there).
    let cancel = CancellationToken::new();
    for n in 0..12 {
        let identity = ClusterIdentity::new("counter", format!("id-{n}"));
        let _: i64 = a
            .context()
            .request(&identity, "increment", &(), &cancel)
            .await
            .expect("request");
    }
    let a_address = a.local_member().address.clone();
    let a_id = a.local_member().id.clone();

    // Watch for A's graceful departure on B and C.
    let seen = Arc::new(Mutex::new(Vec::<MemberId>::new()));
    let mut subs = Vec::new();
    for node in [&b, &c] {
        let sink = Arc::clone(&seen);
        subs.push(node.event_bus().subscribe(move |event| {
            if let ClusterEvent::MemberLeftGracefully(id) = event {
                sink.lock().expect("sink").push(id.clone());
            }
        }));
    }

    // Metric observers must be gone after shutdown.
    let _observer = a.metrics().register_observer(|_| {});
    assert_eq!(a.metrics().observer_count(), 1);

    a.shutdown(true, "drain").await.expect("shutdown a");

    // S5: reservations released, observers detached, departure observed.
    assert!(harness.store.reservations_of(&a_address).is_empty());
    assert_eq!(a.metrics().observer_count(), 0);
    {
        let seen = Arc::clone(&seen);
        let a_id = a_id.clone();
        wait_until(Duration::from_secs(5), move || {
            seen.lock().expect("sink").iter().filter(|id| **id == a_id).count() >= 2
        })
        .await;
    }

    b.shutdown(true, "test done").await.expect("shutdown b");
    c.shutdown(true, "test done").await.expect("shutdown c");
}

#[tokio::test]
async fn abrupt_shutdown_relies_on_ttls() {
    let harness = TestHarness::new();
    let a = harness.start_member(4041).await;
    let b = harness.start_member(4042).await;
    wait_member_count(&[&a, &b], 2, Duration::from_secs(5)).await;

    // Place an identity on A specifically: find one A owns.
    let cancel = CancellationToken::new();
    let mut a_owned = None;
    for n in 0..32 {
        let identity = ClusterIdentity::new("counter", format!("id-{n}"));
        let _: i64 = a
            .context()
            .request(&identity, "increment", &(), &cancel)
            .await
            .expect("request");
        if a.activations().pid_of(&identity).is_some() {
            a_owned = Some(identity);
            break;
        }
    }
    let a_owned = a_owned.expect("some identity lands on A");
    let a_address = a.local_member().address.clone();

    let left_events = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&left_events);
    let _sub = b.event_bus().subscribe(move |event| {
        if matches!(event, ClusterEvent::MemberLeftGracefully(_)) {
            *sink.lock().expect("sink") += 1;
        }
    });

    a.shutdown(false, "crash").await.expect("abrupt shutdown");

    // No graceful announcement; reservations linger until the TTL reaps.
    assert!(!harness.store.reservations_of(&a_address).is_empty());

    // B observes the removal via provider TTL, not via gossip.
    let b2 = Arc::clone(&b);
    wait_until(Duration::from_secs(5), || {
        b2.member_list().current().members.len() == 1
    })
    .await;
    assert_eq!(*left_events.lock().expect("sink"), 0);

    // Post-TTL the stale reservation is reapable.
    let store = Arc::clone(&harness.store);
    let address = a_address.clone();
    wait_until(Duration::from_secs(5), move || {
        store.reservations_of(&address).is_empty()
    })
    .await;
    let _ = a_owned;

    b.shutdown(true, "test done").await.expect("shutdown b");
}

#[tokio::test]
async fn requests_after_shutdown_fail_fast() {
    let harness = TestHarness::new();
    let a = harness.start_member(4051).await;
    let b = harness.start_member(4052).await;
    wait_member_count(&[&a, &b], 2, Duration::from_secs(5)).await;

    a.shutdown(true, "done").await.expect("shutdown");
    assert!(a.is_shutting_down());

    let cancel = CancellationToken::new();
    let err = a
        .context()
        .request::<(), i64>(
            &ClusterIdentity::new("counter", "x"),
            "increment",
            &(),
            &cancel,
        )
        .await
        .expect_err("unavailable after shutdown");
    assert!(matches!(err, starling_cluster::ClusterError::Unavailable));

    b.shutdown(true, "test done").await.expect("shutdown b");
}
