//! End-to-end commit protocol tests on an in-process cluster
//!
//! Tests cover:
//! - Commit of a multi-participant transaction
//! - Atomicity when one participant votes ABORT
//! - Lock conflicts between concurrent transactions
//! - Administrative abort and its refusal after COMMIT
//! - Idempotent handling of duplicate decisions

mod common;

use common::{eventually, init_tracing, puts};
use concord_core::participant::LocalState;
use concord_core::transport::{DropRule, Transport};
use concord_core::{Cluster, Error};
use concord_protocol::{
    AbortReason, Envelope, MessageType, NodeId, Operation, Outcome, ProtocolMessage, TxnState,
};
use std::collections::BTreeMap;
use std::time::Duration;

async fn three_participants() -> Cluster {
    Cluster::builder()
        .config(common::fast_config())
        .coordinator("coordinator", "n0", &[])
        .participant("p1", "n1", &[])
        .participant("p2", "n2", &[])
        .participant("p3", "n3", &[])
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_all_commit_votes_commit() {
    init_tracing();
    let cluster = three_participants().await;

    let txn = cluster.begin_transaction(puts(&["p1", "p2", "p3"])).unwrap();
    let outcome = cluster
        .wait_for_outcome(txn, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Committed);

    for role in ["p1", "p2", "p3"] {
        let agent = cluster.participant(&role.into()).unwrap();
        assert_eq!(
            agent.store().get(&format!("{}-key", role)),
            Some(role.as_bytes().to_vec())
        );
        assert_eq!(agent.locks().stats().locked_keys, 0);
    }

    assert!(
        eventually(Duration::from_secs(2), || {
            cluster
                .transaction_status(txn)
                .is_some_and(|s| s.unacknowledged.is_empty())
        })
        .await
    );
}

#[tokio::test]
async fn test_one_abort_vote_aborts_everyone() {
    init_tracing();
    let cluster = three_participants().await;

    let mut payloads = puts(&["p1", "p2", "p3"]);
    // Fails validation at p2: the key has no value
    payloads.insert(
        "p2".into(),
        vec![Operation::assert_eq("missing", Some(b"x".to_vec()))],
    );

    let txn = cluster.begin_transaction(payloads).unwrap();
    let outcome = cluster
        .wait_for_outcome(txn, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Aborted(AbortReason::ParticipantVote));
    assert_eq!(common::state_of(&cluster, txn), Some(TxnState::Aborted));

    assert!(
        eventually(Duration::from_secs(2), || {
            ["p1", "p2", "p3"].iter().all(|role| {
                cluster
                    .participant(&(*role).into())
                    .and_then(|a| a.state_of(txn))
                    .is_some_and(|s| matches!(s, LocalState::Aborted))
            })
        })
        .await
    );
    for role in ["p1", "p2", "p3"] {
        let agent = cluster.participant(&role.into()).unwrap();
        assert_eq!(agent.locks().stats().locked_keys, 0, "{} holds locks", role);
        assert!(agent.store().get(&format!("{}-key", role)).is_none());
    }
    assert_eq!(cluster.metrics().txns_aborted_vote, 1);
}

#[tokio::test]
async fn test_conflicting_prepare_votes_abort() {
    init_tracing();
    let cluster = three_participants().await;
    // Hold the first transaction in phase 1 by losing p2's PREPARE
    cluster
        .network()
        .drop_messages(DropRule::to("p2").of(MessageType::Prepare).times(1));

    let first = cluster
        .begin_transaction(BTreeMap::from([
            (NodeId::from("p1"), vec![Operation::put("shared", "a")]),
            (NodeId::from("p2"), vec![Operation::put("other", "a")]),
        ]))
        .unwrap();
    let p1 = cluster.participant(&"p1".into()).unwrap();
    assert!(eventually(Duration::from_secs(2), || p1.locks().holder("shared") == Some(first)).await);

    let second = cluster
        .begin_transaction(BTreeMap::from([(
            NodeId::from("p1"),
            vec![Operation::put("shared", "b")],
        )]))
        .unwrap();
    let outcome = cluster
        .wait_for_outcome(second, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Aborted(AbortReason::ParticipantVote));

    cluster.abort_transaction(first).unwrap();
    let outcome = cluster
        .wait_for_outcome(first, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Aborted(AbortReason::Administrative));
    assert!(eventually(Duration::from_secs(2), || p1.locks().holder("shared").is_none()).await);
}

#[tokio::test]
async fn test_abort_after_commit_is_refused() {
    init_tracing();
    let cluster = three_participants().await;
    let txn = cluster.begin_transaction(puts(&["p1"])).unwrap();
    cluster
        .wait_for_outcome(txn, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(matches!(
        cluster.abort_transaction(txn),
        Err(Error::AlreadyDecided { .. })
    ));
}

#[tokio::test]
async fn test_duplicate_commit_applies_once() {
    init_tracing();
    let cluster = three_participants().await;
    let txn = cluster.begin_transaction(puts(&["p1", "p2"])).unwrap();
    assert_eq!(
        cluster
            .wait_for_outcome(txn, Duration::from_secs(5))
            .await
            .unwrap(),
        Outcome::Committed
    );

    let agent = cluster.participant(&"p1".into()).unwrap();
    agent.commit(txn).unwrap();

    let duplicate = Envelope::new(
        "coordinator".into(),
        "p1".into(),
        ProtocolMessage::Commit { txn },
    );
    cluster.network().send(duplicate).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(agent.state_of(txn), Some(LocalState::Committed));
    assert_eq!(agent.locks().stats().locked_keys, 0);
    assert_eq!(cluster.metrics().branches_applied, 2);
    assert!(cluster.metrics().duplicate_messages >= 2);
}

#[tokio::test]
async fn test_status_of_unknown_transaction() {
    init_tracing();
    let cluster = three_participants().await;
    let unknown = concord_protocol::TxnId::new(0, 999);
    assert!(cluster.transaction_status(unknown).is_none());
    assert!(matches!(
        cluster
            .wait_for_outcome(unknown, Duration::from_millis(20))
            .await,
        Err(Error::UnknownTransaction(_))
    ));
}
