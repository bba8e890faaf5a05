mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;

use partition_relay::error::SessionError;
use partition_relay::session::handler::RoutingFailureMode;

use common::{harness, message, HarnessOptions, TARGET_TOPIC};

#[tokio::test]
async fn modulo_relays_every_message_to_its_target_partition() {
    let (mut h, session) = harness(HarnessOptions::default());
    let session = tokio::spawn(session.run());

    let feeds = h.assign(&[0, 1, 2]);
    let sources = [0, 0, 1, 1, 2, 2, 0, 1, 2, 0];
    for (offset, partition) in sources.iter().enumerate() {
        let value = format!("m{offset}");
        feeds[*partition as usize]
            .send(message(*partition, offset as i64, &value))
            .await
            .unwrap();
    }

    let mut targets = HashMap::new();
    let mut seen_per_source: HashMap<i32, Vec<String>> = HashMap::new();
    for _ in 0..sources.len() {
        let decision = h.next_decision().await;
        assert_eq!(decision.topic, TARGET_TOPIC);
        let value = String::from_utf8(decision.value.to_vec()).unwrap();
        let offset: usize = value[1..].parse().unwrap();
        assert_eq!(
            decision.key,
            Some(Bytes::from(format!("key-{offset}"))),
            "key forwarded unchanged"
        );
        seen_per_source
            .entry(sources[offset])
            .or_default()
            .push(value.clone());
        targets.insert(offset, decision.partition);
    }

    let expected = [0, 0, 1, 1, 0, 0, 0, 1, 0, 0];
    for (offset, target) in expected.iter().enumerate() {
        assert_eq!(targets[&offset], Some(*target), "message m{offset}");
    }

    // per-partition arrival order survives the handoff
    assert_eq!(seen_per_source[&0], vec!["m0", "m1", "m6", "m9"]);
    assert_eq!(seen_per_source[&1], vec!["m2", "m3", "m7"]);
    assert_eq!(seen_per_source[&2], vec!["m4", "m5", "m8"]);

    h.wait_for_marks(sources.len()).await;
    assert_eq!(h.offsets.marked_for(0), vec![0, 1, 6, 9]);
    assert!(h.ready.is_ready());

    h.shutdown.cancel();
    session.await.unwrap().unwrap();
    assert!(h.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn revocation_never_marks_past_a_message_not_handed_off() {
    let (mut h, session) = harness(HarnessOptions {
        queue_capacity: 1,
        ..HarnessOptions::default()
    });
    let session = tokio::spawn(session.run());

    let feeds = h.assign(&[0]);
    for offset in 1..=3 {
        feeds[0]
            .send(message(0, offset, &format!("m{offset}")))
            .await
            .unwrap();
    }
    // m1 sits in the queue, m2 is blocked handing off, m3 is still buffered
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.offsets.marked(), vec![(0, 1)]);

    drop(feeds);
    h.revoke(&[0]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the in-progress handoff completes, then the claim stops before m3
    assert_eq!(h.next_decision().await.value, Bytes::from("m1"));
    assert_eq!(h.next_decision().await.value, Bytes::from("m2"));
    h.wait_for_marks(2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.offsets.marked(), vec![(0, 1), (0, 2)]);
    assert!(h.decisions.try_recv().is_err());

    // the next generation resumes from the last mark
    let feeds = h.assign(&[0]);
    for offset in 3..=4 {
        feeds[0]
            .send(message(0, offset, &format!("m{offset}")))
            .await
            .unwrap();
    }
    assert_eq!(h.next_decision().await.value, Bytes::from("m3"));
    assert_eq!(h.next_decision().await.value, Bytes::from("m4"));
    h.wait_for_marks(4).await;
    assert_eq!(h.offsets.marked_for(0), vec![1, 2, 3, 4]);

    h.shutdown.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn ready_gate_fires_once_across_generations() {
    let (h, session) = harness(HarnessOptions::default());
    let session = tokio::spawn(session.run());
    assert!(!h.ready.is_ready());

    let feeds = h.assign(&[0]);
    tokio::time::timeout(Duration::from_secs(5), h.ready.wait())
        .await
        .expect("ready gate did not fire");

    drop(feeds);
    h.revoke(&[0]);
    let _feeds = h.assign(&[0, 1]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // a second generation does not reopen the gate
    assert!(h.ready.is_ready());
    assert!(!h.ready.fire());

    h.shutdown.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn reassignment_without_revoke_replaces_the_generation() {
    let (mut h, session) = harness(HarnessOptions::default());
    let session = tokio::spawn(session.run());

    let first = h.assign(&[0]);
    first[0].send(message(0, 1, "old")).await.unwrap();
    assert_eq!(h.next_decision().await.value, Bytes::from("old"));

    let second = h.assign(&[1]);
    second[0].send(message(1, 1, "new")).await.unwrap();
    assert_eq!(h.next_decision().await.value, Bytes::from("new"));

    // the old claim is gone, its feed has no reader anymore
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(first[0].send(message(0, 2, "stale")).await.is_err());

    h.shutdown.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn routing_error_halts_only_the_failing_partition() {
    let (mut h, session) = harness(HarnessOptions::default());
    let session = tokio::spawn(session.run());

    let feeds = h.assign(&[0, 1]);
    feeds[0].send(message(0, 1, "a")).await.unwrap();
    feeds[0].send(message(0, 2, "")).await.unwrap();
    feeds[0].send(message(0, 3, "after-bad")).await.unwrap();

    assert_eq!(h.next_decision().await.value, Bytes::from("a"));
    h.wait_for_marks(1).await;

    feeds[1].send(message(1, 1, "b")).await.unwrap();
    assert_eq!(h.next_decision().await.value, Bytes::from("b"));
    h.wait_for_marks(2).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.decisions.try_recv().is_err());
    assert_eq!(h.offsets.marked_for(0), vec![1]);
    assert_eq!(h.offsets.marked_for(1), vec![1]);

    h.shutdown.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn skip_mode_keeps_the_partition_flowing() {
    let (mut h, session) = harness(HarnessOptions {
        on_routing_error: RoutingFailureMode::Skip,
        ..HarnessOptions::default()
    });
    let session = tokio::spawn(session.run());

    let feeds = h.assign(&[0]);
    feeds[0].send(message(0, 1, "a")).await.unwrap();
    feeds[0].send(message(0, 2, "")).await.unwrap();
    feeds[0].send(message(0, 3, "c")).await.unwrap();

    assert_eq!(h.next_decision().await.value, Bytes::from("a"));
    assert_eq!(h.next_decision().await.value, Bytes::from("c"));
    h.wait_for_marks(2).await;
    assert_eq!(h.offsets.marked_for(0), vec![1, 3]);

    h.shutdown.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn source_failure_ends_the_session_with_an_error() {
    let (h, session) = harness(HarnessOptions::default());
    let session = tokio::spawn(session.run());

    let _feeds = h.assign(&[0]);
    h.source
        .send(Err(SessionError::Source("fatal consumer error".to_string())))
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .expect("session did not stop")
        .unwrap();
    assert!(matches!(result, Err(SessionError::Source(_))));
    assert!(h.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn exhausted_source_closes_the_session() {
    let (h, session) = harness(HarnessOptions::default());
    let session = tokio::spawn(session.run());

    let feeds = h.assign(&[0]);
    drop(feeds);
    let closed = h.closed.clone();
    drop(h);

    tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .expect("session did not stop")
        .unwrap()
        .unwrap();
    assert!(closed.load(Ordering::SeqCst));
}
