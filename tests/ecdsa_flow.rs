mod common;

use common::{run_protocol, EcdsaClients, Harness, CLIENTS, CUSTOMER, SERVER, WALLET};
use tss_custody::primitives::EcdsaProtocol;
use tss_custody::storage::{SessionStore, StageStore};
use tss_custody::{Error, SessionState, StageStatus, StageType};

fn message_hash() -> String {
    hex::encode([0x42u8; 32])
}

#[tokio::test]
async fn test_triples_all_participants_agree() {
    let h = Harness::new().await;
    let session = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();
    let mut clients = EcdsaClients::new();

    let last = run_protocol(&h, &mut clients, session.id, EcdsaProtocol::Triples, None)
        .await
        .unwrap();
    assert_eq!(last.step, 11);
    assert_eq!(last.status, StageStatus::Completed);

    let server_public = last.output.expect("public triple output");
    for client in CLIENTS {
        let client_public = &clients.public_outputs[&(client, EcdsaProtocol::Triples)];
        assert_eq!(hex::encode(client_public), server_public);
    }

    let stage = h
        .store
        .get_stage(session.id, StageType::Triples)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stage.status, StageStatus::Completed);

    // Triples alone does not finish the session
    let session = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::InProgress);
}

#[tokio::test]
async fn test_full_signing_completes_session() {
    let h = Harness::new().await;
    let session = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();
    let mut clients = EcdsaClients::new();
    let hash = message_hash();

    run_protocol(&h, &mut clients, session.id, EcdsaProtocol::Triples, None)
        .await
        .unwrap();
    let presign = run_protocol(&h, &mut clients, session.id, EcdsaProtocol::Presign, None)
        .await
        .unwrap();
    let big_r = presign.output.unwrap();
    assert_eq!(
        hex::encode(&clients.public_outputs[&(CLIENTS[0], EcdsaProtocol::Presign)]),
        big_r
    );

    let sign = run_protocol(&h, &mut clients, session.id, EcdsaProtocol::Sign, Some(&hash))
        .await
        .unwrap();
    let signature = sign.output.unwrap();
    assert!(signature.starts_with(&big_r));
    assert_eq!(
        hex::encode(&clients.public_outputs[&(CLIENTS[1], EcdsaProtocol::Sign)]),
        signature
    );

    let session = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Completed);
}

#[tokio::test]
async fn test_big_r_tamper_fails_stage_and_session() {
    let h = Harness::new().await;
    let session = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();
    let mut clients = EcdsaClients::new();
    let hash = message_hash();

    run_protocol(&h, &mut clients, session.id, EcdsaProtocol::Triples, None)
        .await
        .unwrap();
    run_protocol(&h, &mut clients, session.id, EcdsaProtocol::Presign, None)
        .await
        .unwrap();

    // P1 signs with a presignature whose big R differs in one byte
    let mut tampered = clients.outputs[&(CLIENTS[1], EcdsaProtocol::Presign)].clone();
    tampered[0] ^= 0xff;
    clients
        .outputs
        .insert((CLIENTS[1], EcdsaProtocol::Presign), tampered);

    clients.step(EcdsaProtocol::Sign, 1, Some(&hash));
    let step1 = h
        .ecdsa
        .sign(h.round_request(
            session.id,
            1,
            clients.inbox_for(EcdsaProtocol::Sign, 1, SERVER),
            Some(hash.clone()),
        ))
        .await
        .unwrap();
    clients.deliver(&step1);

    let err = h
        .ecdsa
        .sign(h.round_request(
            session.id,
            2,
            clients.inbox_for(EcdsaProtocol::Sign, 2, SERVER),
            None,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PRIMITIVE_FAILURE");
    assert!(err.to_string().contains("big_r mismatch with P1"));

    let stage = h
        .store
        .get_stage(session.id, StageType::Sign)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert!(stage.error.unwrap().contains("big_r"));
    // No primitive state survives the failure
    assert!(stage.payload.get("state").is_none());

    let session = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Failed);

    // A failed stage rejects further steps
    let retry = h
        .ecdsa
        .sign(h.round_request(session.id, 2, vec![], None))
        .await
        .unwrap_err();
    assert_eq!(retry.code(), "STAGE_SEQUENCE");
}

#[tokio::test]
async fn test_retried_step_is_idempotent() {
    let h = Harness::new().await;
    let session = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();
    let mut clients = EcdsaClients::new();

    clients.step(EcdsaProtocol::Triples, 1, None);
    let step1 = h
        .ecdsa
        .triples(h.round_request(session.id, 1, vec![], None))
        .await
        .unwrap();
    clients.deliver(&step1);
    clients.step(EcdsaProtocol::Triples, 2, None);

    let inbound = clients.inbox_for(EcdsaProtocol::Triples, 2, SERVER);
    let first = h
        .ecdsa
        .triples(h.round_request(session.id, 2, inbound.clone(), None))
        .await
        .unwrap();
    assert!(!first.replayed);

    // Same messages in a different order replay the stored outcome
    let mut reordered = inbound.clone();
    reordered.reverse();
    let second = h
        .ecdsa
        .triples(h.round_request(session.id, 2, reordered, None))
        .await
        .unwrap();
    assert!(second.replayed);
    assert_eq!(second.messages, first.messages);
    assert_eq!(second.status, StageStatus::StepCompleted(2));

    let stage = h
        .store
        .get_stage(session.id, StageType::Triples)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stage.status, StageStatus::StepCompleted(2));

    // Different messages for a completed step are refused
    let mut altered = inbound;
    altered[0].payload = hex::encode([0u8; 32]);
    let err = h
        .ecdsa
        .triples(h.round_request(session.id, 2, altered, None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STAGE_SEQUENCE");
}

#[tokio::test]
async fn test_out_of_order_steps_are_rejected() {
    let h = Harness::new().await;
    let session = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();

    // Presign needs completed triples
    let err = h
        .ecdsa
        .presign(h.round_request(session.id, 1, vec![], None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STAGE_SEQUENCE");

    // Triples must start at step 1
    let err = h
        .ecdsa
        .triples(h.round_request(session.id, 3, vec![], None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Sequence(_)));

    h.ecdsa
        .triples(h.round_request(session.id, 1, vec![], None))
        .await
        .unwrap();

    // Skipping ahead
    let err = h
        .ecdsa
        .triples(h.round_request(session.id, 3, vec![], None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STAGE_SEQUENCE");

    // Beyond the protocol's last step
    let err = h
        .ecdsa
        .triples(h.round_request(session.id, 12, vec![], None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STAGE_SEQUENCE");
}

#[tokio::test]
async fn test_incomplete_round_leaves_stage_untouched() {
    let h = Harness::new().await;
    let session = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();
    let mut clients = EcdsaClients::new();

    clients.step(EcdsaProtocol::Triples, 1, None);
    h.ecdsa
        .triples(h.round_request(session.id, 1, vec![], None))
        .await
        .unwrap();
    let before = h
        .store
        .get_stage(session.id, StageType::Triples)
        .await
        .unwrap()
        .unwrap();

    // Only P0's round-1 message arrives
    let partial: Vec<_> = clients
        .inbox_for(EcdsaProtocol::Triples, 2, SERVER)
        .into_iter()
        .filter(|m| m.from == CLIENTS[0])
        .collect();
    let err = h
        .ecdsa
        .triples(h.round_request(session.id, 2, partial, None))
        .await
        .unwrap_err();

    match &err {
        Error::IncompleteRound { missing } => {
            assert_eq!(missing, &vec!["r1/P1->P2".to_string()]);
        }
        other => panic!("expected incomplete round, got {:?}", other),
    }
    assert_eq!(err.code(), "INCOMPLETE_ROUND");

    let after = h
        .store
        .get_stage(session.id, StageType::Triples)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, StageStatus::StepCompleted(1));
    assert_eq!(after.payload, before.payload);
}

#[tokio::test]
async fn test_messages_for_future_rounds_are_rejected() {
    let h = Harness::new().await;
    let session = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();
    let mut clients = EcdsaClients::new();

    clients.step(EcdsaProtocol::Triples, 1, None);
    let step1 = h
        .ecdsa
        .triples(h.round_request(session.id, 1, vec![], None))
        .await
        .unwrap();
    clients.deliver(&step1);

    let mut early = clients.inbox_for(EcdsaProtocol::Triples, 2, SERVER);
    early[0].round = 2;
    let err = h
        .ecdsa
        .triples(h.round_request(session.id, 2, early, None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STAGE_SEQUENCE");
}

#[tokio::test]
async fn test_abort_scrubs_and_blocks_session() {
    let h = Harness::new().await;
    let session = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();

    h.ecdsa
        .triples(h.round_request(session.id, 1, vec![], None))
        .await
        .unwrap();

    let aborted = h
        .ecdsa
        .abort(CUSTOMER, session.id, "client went away")
        .await
        .unwrap();
    assert_eq!(aborted.state, SessionState::Aborted);

    let stage = h
        .store
        .get_stage(session.id, StageType::Triples)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.error.as_deref(), Some("aborted: client went away"));
    assert!(stage.payload.get("state").is_none());

    // Nothing runs on an aborted session, and it cannot be aborted twice
    let err = h
        .ecdsa
        .triples(h.round_request(session.id, 2, vec![], None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STAGE_SEQUENCE");
    let err = h.ecdsa.abort(CUSTOMER, session.id, "again").await.unwrap_err();
    assert_eq!(err.code(), "STAGE_SEQUENCE");

    // The wallet is free for a new session
    let next = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();
    assert_ne!(next.id, session.id);
}

#[tokio::test]
async fn test_one_active_session_per_wallet() {
    let h = Harness::new().await;
    h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();
    let err = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap_err();
    assert_eq!(err.code(), "STAGE_CONFLICT");

    // A signing session of the other purpose is independent
    h.eddsa.start_session(CUSTOMER, WALLET).await.unwrap();
}

#[tokio::test]
async fn test_other_customers_are_refused() {
    let h = Harness::new().await;
    let err = h.ecdsa.start_session("intruder", WALLET).await.unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");

    let session = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();
    let mut request = h.round_request(session.id, 1, vec![], None);
    request.customer_id = "intruder".to_string();
    let err = h.ecdsa.triples(request).await.unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");

    let err = h.ecdsa.abort("intruder", session.id, "nope").await.unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");
}

#[tokio::test]
async fn test_concurrent_duplicate_step_runs_once() {
    let h = Harness::new().await;
    let session = h.ecdsa.start_session(CUSTOMER, WALLET).await.unwrap();

    let (a, b) = tokio::join!(
        h.ecdsa.triples(h.round_request(session.id, 1, vec![], None)),
        h.ecdsa.triples(h.round_request(session.id, 1, vec![], None)),
    );

    let results = [a, b];
    let executed = results
        .iter()
        .filter(|r| matches!(r, Ok(resp) if !resp.replayed))
        .count();
    assert_eq!(executed, 1);
    for result in &results {
        match result {
            Ok(_) => {}
            Err(e) => assert_eq!(e.code(), "STAGE_CONFLICT"),
        }
    }
}
