//! End-to-end key flows between devices sharing one in-memory directory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ember_crypto::{
    Account, DeviceIdentity, KeySigner, LocalAccount, OneTimeKeyPool, CURVE25519, SIGNED_CURVE25519,
};
use ember_protocol::wire::{KEYS_QUERY, LOGIN};
use ember_protocol::{
    ClientConfig, Fault, KeyDirectory, KeyFormat, KeysClient, KeysError, LoopbackTransport,
    OneTimeKeyUpload, Request, Transport, TransportFailure,
};
use serde_json::{json, Value};

fn loopback() -> Arc<LoopbackTransport> {
    Arc::new(LoopbackTransport::new(Arc::new(KeyDirectory::new("localhost"))))
}

/// Register `localpart`, log a fresh device in and return it with its account.
async fn device(transport: &Arc<LoopbackTransport>, localpart: &str) -> (KeysClient, Arc<LocalAccount>) {
    transport.directory().register(localpart, "correct horse");
    let account = Arc::new(LocalAccount::generate());
    let client = KeysClient::new(ClientConfig::default(), account.clone(), transport.clone());
    client
        .login(localpart, "correct horse")
        .await
        .expect("login should succeed");
    (client, account)
}

// ── Upload ───────────────────────────────────────────────────────────

#[tokio::test]
async fn unsigned_upload_reports_count() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;

    alice.generate_one_time_keys(5).unwrap();
    let counts = alice.publish_one_time_keys(KeyFormat::Unsigned).await.unwrap();

    assert_eq!(counts[CURVE25519], 5);
    assert_eq!(alice.unpublished_one_time_keys(), 0);
}

#[tokio::test]
async fn signed_upload_reports_single_algorithm() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;

    alice.generate_one_time_keys(5).unwrap();
    let counts = alice.publish_one_time_keys(KeyFormat::Signed).await.unwrap();

    assert_eq!(counts.len(), 1);
    assert_eq!(counts[SIGNED_CURVE25519], 5);
}

#[tokio::test]
async fn identity_only_upload_reports_no_counts() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;

    let counts = alice.upload_identity_keys().await.unwrap();
    assert!(counts.is_empty());
}

#[tokio::test]
async fn failed_publish_leaves_pool_unchanged() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;
    alice.generate_one_time_keys(5).unwrap();

    transport.fail_next(Fault::Reject(TransportFailure::Status {
        status: 500,
        body: None,
    }));
    let err = alice.publish_one_time_keys(KeyFormat::Signed).await.unwrap_err();
    assert!(matches!(err, KeysError::TransportError { status: 500, .. }));
    assert_eq!(alice.unpublished_one_time_keys(), 5);

    let counts = alice.publish_one_time_keys(KeyFormat::Signed).await.unwrap();
    assert_eq!(counts[SIGNED_CURVE25519], 5);
    assert_eq!(alice.unpublished_one_time_keys(), 0);
}

#[tokio::test]
async fn retry_after_lost_response_does_not_double_count() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;
    alice.generate_one_time_keys(5).unwrap();

    transport.fail_next(Fault::LoseResponse);
    let err = alice.publish_one_time_keys(KeyFormat::Signed).await.unwrap_err();
    assert!(matches!(err, KeysError::TransportError { status: 0, .. }));
    assert_eq!(alice.unpublished_one_time_keys(), 5);

    // The server already holds these ids; resending them is a no-op there.
    let counts = alice.publish_one_time_keys(KeyFormat::Signed).await.unwrap();
    assert_eq!(counts[SIGNED_CURVE25519], 5);
}

#[tokio::test]
async fn unknown_algorithm_is_protocol_error() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;
    let token = alice.wait_ready().await.unwrap().access_token;

    let result = transport
        .submit(
            Request::post(
                ember_protocol::wire::KEYS_UPLOAD,
                json!({"one_time_keys": {"rot13:AAAA": "a2V5"}}),
            )
            .with_access_token(&token),
        )
        .await
        .map_err(TransportFailure::classify);

    assert!(matches!(
        result,
        Err(KeysError::ProtocolError { status: 400, ref errcode, .. }) if errcode == "M_UNKNOWN"
    ));
}

// ── Query ────────────────────────────────────────────────────────────

/// Upload the device's identity keys together with one signed one-time key.
async fn upload_identity_with_one_key(client: &KeysClient, account: &Arc<LocalAccount>) -> DeviceIdentity {
    let identity = client.identity().unwrap();
    let pool = OneTimeKeyPool::new(account.clone());
    pool.generate(1).unwrap();
    let upload = OneTimeKeyUpload {
        keys: pool.snapshot(),
        format: KeyFormat::Signed,
    };

    let counts = client.upload(Some(&identity), Some(&upload)).await.unwrap();
    assert_eq!(counts, BTreeMap::from([(SIGNED_CURVE25519.to_owned(), 1)]));
    identity
}

#[tokio::test]
async fn devices_see_each_others_keys_exactly() {
    let transport = loopback();
    let (alice, alice_account) = device(&transport, "alice").await;
    let (bob, bob_account) = device(&transport, "bob").await;
    let alice_identity = upload_identity_with_one_key(&alice, &alice_account).await;
    let bob_identity = upload_identity_with_one_key(&bob, &bob_account).await;
    let alice_uploaded = KeySigner::new(alice_account).sign_identity_keys(&alice_identity).unwrap();
    let bob_uploaded = KeySigner::new(bob_account).sign_identity_keys(&bob_identity).unwrap();

    let seen_by_alice = alice.query_keys([bob_identity.user_id()]).await.unwrap();
    let record = seen_by_alice
        .device(bob_identity.user_id(), bob_identity.device_id())
        .expect("bob's device should be visible");
    assert_eq!(record.user_id, bob_identity.user_id());
    assert_eq!(record.device_id, bob_identity.device_id());
    assert_eq!(record.keys, bob_uploaded.keys);
    assert_eq!(record.signatures, bob_uploaded.signatures);
    assert!(seen_by_alice.failures.is_empty());
    assert!(seen_by_alice.rejected.is_empty());

    let seen_by_bob = bob.query_keys([alice_identity.user_id()]).await.unwrap();
    let record = seen_by_bob
        .device(alice_identity.user_id(), alice_identity.device_id())
        .expect("alice's device should be visible");
    assert_eq!(record, &alice_uploaded);
}

#[tokio::test]
async fn user_without_devices_is_not_a_failure() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;
    let carol = transport.directory().register("carol", "pw");

    let result = alice.query_keys([carol.as_str()]).await.unwrap();
    assert!(result.device_keys[&carol].is_empty());
    assert!(result.failures.is_empty());
}

#[tokio::test]
async fn unreachable_server_is_reported_per_user() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;
    let (bob, _) = device(&transport, "bob").await;
    bob.upload_identity_keys().await.unwrap();
    transport.directory().set_server_unreachable("remote.example", true);

    let result = alice
        .query_keys(["@bob:localhost", "@far:remote.example"])
        .await
        .unwrap();
    assert_eq!(result.device_keys["@bob:localhost"].len(), 1);
    assert!(result.failed_users().contains("@far:remote.example"));
    assert!(!result.failed_users().contains("@bob:localhost"));
}

#[tokio::test]
async fn specific_devices_can_be_queried() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;
    let (bob, _) = device(&transport, "bob").await;
    bob.upload_identity_keys().await.unwrap();
    let bob_device = bob.identity().unwrap().device_id().to_owned();

    let targets = BTreeMap::from([("@bob:localhost".to_owned(), vec!["NOSUCHDEVICE".to_owned()])]);
    let result = alice.query_devices(targets).await.unwrap();
    assert!(result.device_keys["@bob:localhost"].is_empty());

    let targets = BTreeMap::from([("@bob:localhost".to_owned(), vec![bob_device.clone()])]);
    let result = alice.query_devices(targets).await.unwrap();
    assert!(result.device("@bob:localhost", &bob_device).is_some());
}

/// Answers login normally and `/keys/query` with a fixed body.
struct Scripted {
    query_response: Value,
}

#[async_trait]
impl Transport for Scripted {
    async fn submit(&self, request: Request) -> Result<Value, TransportFailure> {
        match request.endpoint.as_str() {
            LOGIN => Ok(json!({
                "user_id": "@alice:localhost",
                "device_id": "ALICEDEV",
                "access_token": "token",
            })),
            KEYS_QUERY => Ok(self.query_response.clone()),
            other => Err(TransportFailure::Network(format!("unscripted endpoint {other}"))),
        }
    }
}

fn signed_record(user_id: &str, device_id: &str) -> Value {
    let account: Arc<dyn Account> = Arc::new(LocalAccount::generate());
    let identity = DeviceIdentity::new(user_id, device_id, account.identity_keys());
    serde_json::to_value(KeySigner::new(account).sign_identity_keys(&identity).unwrap()).unwrap()
}

#[tokio::test]
async fn bad_records_are_rejected_without_hiding_good_ones() {
    let mut forged = signed_record("@mallory:localhost", "MALDEV");
    forged["keys"]["curve25519:MALDEV"] =
        signed_record("@mallory:localhost", "MALDEV")["keys"]["curve25519:MALDEV"].clone();

    let query_response = json!({
        "device_keys": {
            "@bob:localhost": {
                "GOOD": signed_record("@bob:localhost", "GOOD"),
                "MISFILED": signed_record("@bob:localhost", "ELSEWHERE"),
            },
            "@mallory:localhost": { "MALDEV": forged },
        },
        "failures": {},
    });
    let client = KeysClient::new(
        ClientConfig::default(),
        Arc::new(LocalAccount::generate()),
        Arc::new(Scripted { query_response }),
    );
    client.login("alice", "pw").await.unwrap();

    let result = client
        .query_keys(["@bob:localhost", "@mallory:localhost"])
        .await
        .unwrap();

    assert!(result.device("@bob:localhost", "GOOD").is_some());
    assert!(result.device("@bob:localhost", "MISFILED").is_none());
    assert!(result.device_keys["@mallory:localhost"].is_empty());
    assert_eq!(result.rejected.len(), 2);
    for rejected in &result.rejected {
        match rejected.device_id.as_str() {
            "MISFILED" => assert!(matches!(rejected.error, KeysError::IdentityMismatch { .. })),
            "MALDEV" => assert!(matches!(rejected.error, KeysError::SignatureInvalid { .. })),
            other => panic!("unexpected rejection for {other}"),
        }
    }
}

// ── Claim ────────────────────────────────────────────────────────────

#[tokio::test]
async fn claimed_key_is_verified_and_single_use() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;
    let (bob, _) = device(&transport, "bob").await;
    bob.upload_identity_keys().await.unwrap();
    bob.generate_one_time_keys(1).unwrap();
    bob.publish_one_time_keys(KeyFormat::Signed).await.unwrap();

    let bob_identity = bob.identity().unwrap();
    let known = alice.query_keys([bob_identity.user_id()]).await.unwrap();
    let targets = BTreeMap::from([(
        bob_identity.user_id().to_owned(),
        BTreeMap::from([(bob_identity.device_id().to_owned(), SIGNED_CURVE25519.to_owned())]),
    )]);

    let first = alice.claim_keys(targets.clone(), &known).await.unwrap();
    let claimed = first
        .key(bob_identity.user_id(), bob_identity.device_id())
        .expect("one key should be claimed");
    assert!(claimed.verified);
    assert!(claimed.key_id.starts_with("signed_curve25519:"));

    let second = alice.claim_keys(targets, &known).await.unwrap();
    assert!(second.key(bob_identity.user_id(), bob_identity.device_id()).is_none());

    let counts = bob.upload(None, None).await.unwrap();
    assert!(counts.is_empty());
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_cancels_each_in_flight_request_once() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;
    alice.generate_one_time_keys(3).unwrap();
    let alice = Arc::new(alice);
    let before = transport.submitted();
    transport.pause();

    let queries: Vec<_> = (0..4)
        .map(|_| {
            let alice = alice.clone();
            tokio::spawn(async move { alice.query_keys(["@bob:localhost"]).await })
        })
        .collect();
    let publish = tokio::spawn({
        let alice = alice.clone();
        async move { alice.publish_one_time_keys(KeyFormat::Signed).await }
    });
    while transport.submitted() < before + 5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(alice.pending_requests(), 5);

    assert_eq!(alice.shutdown(), 5);
    for task in queries {
        assert_eq!(task.await.unwrap(), Err(KeysError::Cancelled));
    }
    assert_eq!(publish.await.unwrap(), Err(KeysError::Cancelled));
    assert_eq!(alice.unpublished_one_time_keys(), 3);
    assert_eq!(alice.pending_requests(), 0);

    transport.resume();
    assert_eq!(
        alice.query_keys(["@bob:localhost"]).await,
        Err(KeysError::SessionNotReady)
    );
    let user_id = alice.identity().unwrap().user_id().to_owned();
    let device_id = alice.identity().unwrap().device_id().to_owned();
    assert!(transport.directory().one_time_key_counts(&user_id, &device_id).is_empty());
}

#[tokio::test]
async fn concurrent_operations_resolve_independently() {
    let transport = loopback();
    let (alice, _) = device(&transport, "alice").await;
    alice.upload_identity_keys().await.unwrap();
    let alice_id = alice.identity().unwrap().user_id().to_owned();

    let queries = (0..8).map(|_| alice.query_keys([alice_id.as_str()]));
    let results = futures::future::join_all(queries).await;

    for result in results {
        assert_eq!(result.unwrap().device_keys[&alice_id].len(), 1);
    }
    assert_eq!(alice.pending_requests(), 0);
}
