mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Harness, NodeBehavior, StaticNodeClient, CUSTOMER, SECP_PUBLIC_KEY, WALLET};
use tss_custody::storage::{KeyShareStore, NodeStore, WalletStore};
use tss_custody::{
    Curve, CurveReshare, CustodyCoordinator, Ed25519ShareData, Error, HealthMonitor, MasterKey,
    NodeError, NodeStatus, ReshareRequest, SqliteStore, Wallet,
};

#[tokio::test]
async fn test_custody_confirmed_by_every_node() {
    let h = Harness::new().await;
    h.custody
        .check_key_share_exists(WALLET, SECP_PUBLIC_KEY, &h.node_ids)
        .await
        .unwrap();
    h.custody
        .check_wallet_custody(WALLET, Curve::Ed25519)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_one_missing_node_fails_the_check() {
    let h = Harness::new().await;
    let third = h
        .custody
        .register_node("node-3", "https://node-3.example.com")
        .await
        .unwrap();
    let mut targets = h.node_ids.clone();
    targets.push(third.id);
    h.nodes.set("node-2", NodeBehavior::Missing);

    let err = h
        .custody
        .check_key_share_exists(WALLET, SECP_PUBLIC_KEY, &targets)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "KEYSHARE_NODE_INSUFFICIENT");

    match err {
        Error::KeyshareInsufficient { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].node_name, "node-2");
            assert_eq!(failures[0].node_id, h.node_ids[1]);
        }
        other => panic!("expected custody failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_silent_node_is_bounded_by_timeout() {
    let h = Harness::new().await;
    h.nodes.set("node-1", NodeBehavior::Hangs);
    h.nodes
        .set("node-2", NodeBehavior::Fails(NodeError::Status(500)));

    let started = Instant::now();
    let err = h
        .custody
        .check_key_share_exists(WALLET, SECP_PUBLIC_KEY, &h.node_ids)
        .await
        .unwrap_err();
    // Nodes are queried together: one timeout, not one per node
    assert!(started.elapsed() < Duration::from_secs(2));

    let response = err.to_response();
    assert_eq!(response.code, "KEYSHARE_NODE_INSUFFICIENT");
    let details = response.details.unwrap();
    assert!(details.contains("node-1"));
    assert!(details.contains("node-2"));
    assert!(details.contains("500"));
}

#[tokio::test]
async fn test_reshare_replaces_in_place() {
    let h = Harness::new().await;
    let before = h
        .store
        .get_key_share(WALLET, Curve::Secp256k1)
        .await
        .unwrap()
        .unwrap();

    let report = h
        .custody
        .reshare(
            WALLET,
            ReshareRequest {
                secp256k1: Some(CurveReshare {
                    server_share: vec![9u8; 32],
                    public_key: SECP_PUBLIC_KEY.to_string(),
                    node_ids: vec![h.node_ids[0]],
                }),
                ed25519: None,
            },
        )
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.replaced.len(), 1);

    let after = h
        .store
        .get_key_share(WALLET, Curve::Secp256k1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.id, before.id);
    assert_ne!(after.encrypted_share, before.encrypted_share);
    assert_eq!(
        h.custody.load_share(WALLET, Curve::Secp256k1).await.unwrap(),
        vec![9u8; 32]
    );

    let assignment = h
        .store
        .get_assignment(WALLET, Curve::Secp256k1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assignment.node_ids, vec![h.node_ids[0]]);
}

#[tokio::test]
async fn test_reshare_curves_fail_independently() {
    let h = Harness::new().await;
    let ed25519_before = h.custody.load_share(WALLET, Curve::Ed25519).await.unwrap();

    // The Ed25519 material belongs to a different group key
    let (shares, other_group) = frost_ed25519::keys::generate_with_dealer(
        3,
        2,
        frost_ed25519::keys::IdentifierList::Default,
        &mut rand::rngs::OsRng,
    )
    .unwrap();
    let package =
        frost_ed25519::keys::KeyPackage::try_from(shares.into_values().next().unwrap()).unwrap();
    let foreign = Ed25519ShareData::from_packages(&package, &other_group)
        .unwrap()
        .to_bytes()
        .unwrap();

    let report = h
        .custody
        .reshare(
            WALLET,
            ReshareRequest {
                secp256k1: Some(CurveReshare {
                    server_share: vec![3u8; 32],
                    public_key: SECP_PUBLIC_KEY.to_string(),
                    node_ids: h.node_ids.clone(),
                }),
                ed25519: Some(CurveReshare {
                    server_share: foreign,
                    public_key: h.ed25519_public_key.clone(),
                    node_ids: h.node_ids.clone(),
                }),
            },
        )
        .await
        .unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.replaced.len(), 1);
    assert_eq!(report.replaced[0].curve, Curve::Secp256k1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, Curve::Ed25519);
    assert_eq!(report.failed[0].1.code(), "INVALID_INPUT");

    assert_eq!(
        h.custody.load_share(WALLET, Curve::Secp256k1).await.unwrap(),
        vec![3u8; 32]
    );
    assert_eq!(
        h.custody.load_share(WALLET, Curve::Ed25519).await.unwrap(),
        ed25519_before
    );
}

#[tokio::test]
async fn test_reshare_rejects_changed_key_or_reused_share() {
    let h = Harness::new().await;
    let reshare = |share: Vec<u8>, public_key: &str| ReshareRequest {
        secp256k1: Some(CurveReshare {
            server_share: share,
            public_key: public_key.to_string(),
            node_ids: h.node_ids.clone(),
        }),
        ed25519: None,
    };

    let report = h
        .custody
        .reshare(WALLET, reshare(vec![1u8; 32], "03deadbeef"))
        .await
        .unwrap();
    assert_eq!(report.failed[0].1.code(), "INVALID_INPUT");

    let report = h
        .custody
        .reshare(WALLET, reshare(vec![7u8; 32], SECP_PUBLIC_KEY))
        .await
        .unwrap();
    assert_eq!(report.failed[0].1.code(), "INVALID_INPUT");

    let err = h
        .custody
        .reshare(WALLET, ReshareRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
}

#[tokio::test]
async fn test_store_share_refuses_overwrite() {
    let h = Harness::new().await;
    let err = h
        .custody
        .store_share(WALLET, Curve::Secp256k1, &[8u8; 32], SECP_PUBLIC_KEY, &h.node_ids)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STAGE_CONFLICT");
}

#[tokio::test]
async fn test_concurrent_first_stores_keep_one_share() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new(dir.path().join("custody.db")).unwrap());
    store
        .insert_wallet(&Wallet::new(WALLET, CUSTOMER))
        .await
        .unwrap();
    let custody = Arc::new(CustodyCoordinator::new(
        store.clone(),
        Arc::new(StaticNodeClient::default()),
        MasterKey::generate(),
        Duration::from_millis(200),
    ));
    let node = custody
        .register_node("node-1", "https://node-1.example.com")
        .await
        .unwrap();

    let handles: Vec<_> = (1..=4u8)
        .map(|fill| {
            let custody = custody.clone();
            tokio::spawn(async move {
                custody
                    .store_share(WALLET, Curve::Secp256k1, &[fill; 32], SECP_PUBLIC_KEY, &[node.id])
                    .await
                    .map(|_| fill)
            })
        })
        .collect();

    let mut stored = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(fill) => stored.push(fill),
            Err(e) => assert_eq!(e.code(), "STAGE_CONFLICT"),
        }
    }
    assert_eq!(stored.len(), 1);
    assert_eq!(
        custody.load_share(WALLET, Curve::Secp256k1).await.unwrap(),
        vec![stored[0]; 32]
    );
}

#[tokio::test]
async fn test_health_sweep_records_every_node() {
    let h = Harness::new().await;
    h.nodes.set("node-1", NodeBehavior::Hangs);

    let monitor = HealthMonitor::new(h.store.clone(), h.nodes.clone(), Duration::from_millis(100));
    let started = Instant::now();
    let records = monitor.check_all().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(records.len(), 2);

    for node in h.store.list_nodes().await.unwrap() {
        let history = h.store.health_history(node.id, 5).await.unwrap();
        assert_eq!(history.len(), 1);
        if node.name == "node-1" {
            assert_eq!(node.status, NodeStatus::Unhealthy);
            assert!(history[0].error.as_deref().unwrap().contains("no response"));
        } else {
            assert_eq!(node.status, NodeStatus::Healthy);
        }
    }

    // History is append-only
    monitor.check_all().await.unwrap();
    let node = h.store.get_node(h.node_ids[1]).await.unwrap().unwrap();
    assert_eq!(h.store.health_history(node.id, 5).await.unwrap().len(), 2);
}
