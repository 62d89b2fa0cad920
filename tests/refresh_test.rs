//! Integration tests for the single-flight refresh path.
//!
//! Replays are routed to their own mock by matching on the Authorization
//! header: the first attempts carry the old token, replays must carry the
//! refreshed one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gymtrack_core::{ApiClient, ApiError, Config, Credential, CredentialStore, MemoryStore};
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;

fn client_for(server: &ServerGuard, store: Arc<MemoryStore>) -> ApiClient {
    let config = Config::with_base_url(server.url());
    ApiClient::new(&config, store).expect("failed to build client")
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .save_credential(&Credential {
            token: "T1".to_string(),
            refresh_token: "R1".to_string(),
        })
        .unwrap();
    store
}

fn sign_out_counter(client: &ApiClient) -> (Arc<AtomicUsize>, gymtrack_core::SignOutGuard) {
    let count = Arc::new(AtomicUsize::new(0));
    let guard = {
        let count = count.clone();
        client.on_forced_sign_out(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    (count, guard)
}

#[tokio::test]
async fn three_concurrent_expiries_share_one_refresh() {
    //* Given
    let mut server = Server::new_async().await;

    let expired_mock = server
        .mock("GET", "/workouts")
        .match_header("authorization", "Bearer T1")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"token.expired"}"#)
        .expect(3)
        .create_async()
        .await;

    let refresh_mock = server
        .mock("POST", "/sessions/refresh-token")
        .match_body(Matcher::Json(json!({"refresh_token": "R1"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token":"T2","refresh_token":"R2"}"#)
        .expect(1)
        .create_async()
        .await;

    let replay_mock = server
        .mock("GET", "/workouts")
        .match_header("authorization", "Bearer T2")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"id":"w1"}]"#)
        .expect(3)
        .create_async()
        .await;

    let store = seeded_store();
    let client = client_for(&server, store.clone());
    client.token_holder().set("T1".to_string());

    //* When
    let (a, b, c) = tokio::join!(
        client.get::<serde_json::Value>("/workouts"),
        client.get::<serde_json::Value>("/workouts"),
        client.get::<serde_json::Value>("/workouts"),
    );

    //* Then
    expired_mock.assert_async().await;
    refresh_mock.assert_async().await;
    replay_mock.assert_async().await;

    for outcome in [a, b, c] {
        assert_eq!(outcome.unwrap(), json!([{"id": "w1"}]));
    }

    // The new token is live and the stored pair was rotated.
    assert_eq!(client.token_holder().get().as_deref(), Some("T2"));
    assert_eq!(
        store.credential().unwrap(),
        Some(Credential {
            token: "T2".to_string(),
            refresh_token: "R2".to_string(),
        })
    );
}

#[tokio::test]
async fn failed_refresh_fails_every_waiter_and_signs_out_once() {
    //* Given
    let mut server = Server::new_async().await;

    let expired_mock = server
        .mock("GET", "/history")
        .match_header("authorization", "Bearer T1")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"token.invalid"}"#)
        .expect(3)
        .create_async()
        .await;

    // An expiry-class answer from the refresh endpoint itself is
    // irrecoverable; there must be no second exchange.
    let refresh_mock = server
        .mock("POST", "/sessions/refresh-token")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"token.expired"}"#)
        .expect(1)
        .create_async()
        .await;

    let store = seeded_store();
    let client = client_for(&server, store);
    client.token_holder().set("T1".to_string());
    let (sign_outs, _guard) = sign_out_counter(&client);

    //* When
    let (a, b, c) = tokio::join!(
        client.get::<serde_json::Value>("/history"),
        client.get::<serde_json::Value>("/history"),
        client.get::<serde_json::Value>("/history"),
    );

    //* Then
    expired_mock.assert_async().await;
    refresh_mock.assert_async().await;
    assert_eq!(sign_outs.load(Ordering::SeqCst), 1);

    for outcome in [a, b, c] {
        let err = outcome.unwrap_err();
        assert!(
            matches!(err, ApiError::Application { ref message } if message == "token.expired"),
            "unexpected error: {err:?}"
        );
    }
}

#[tokio::test]
async fn missing_refresh_token_skips_the_exchange() {
    //* Given
    let mut server = Server::new_async().await;

    let expired_mock = server
        .mock("GET", "/workouts")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"token.expired"}"#)
        .expect(1)
        .create_async()
        .await;

    let refresh_mock = server
        .mock("POST", "/sessions/refresh-token")
        .expect(0)
        .create_async()
        .await;

    // Token holder carries a stale token but the store is empty.
    let store = Arc::new(MemoryStore::new());
    let client = client_for(&server, store);
    client.token_holder().set("T1".to_string());
    let (sign_outs, _guard) = sign_out_counter(&client);

    //* When
    let err = client
        .get::<serde_json::Value>("/workouts")
        .await
        .unwrap_err();

    //* Then
    expired_mock.assert_async().await;
    refresh_mock.assert_async().await;
    assert_eq!(sign_outs.load(Ordering::SeqCst), 1);
    // The original expiry error is surfaced unchanged.
    assert!(matches!(err, ApiError::Application { ref message } if message == "token.expired"));
}

#[tokio::test]
async fn ordinary_401_bypasses_the_refresh_path() {
    //* Given
    let mut server = Server::new_async().await;

    let denied_mock = server
        .mock("GET", "/workouts")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"access denied"}"#)
        .expect(1)
        .create_async()
        .await;

    let refresh_mock = server
        .mock("POST", "/sessions/refresh-token")
        .expect(0)
        .create_async()
        .await;

    let store = seeded_store();
    let client = client_for(&server, store);
    client.token_holder().set("T1".to_string());
    let (sign_outs, _guard) = sign_out_counter(&client);

    //* When
    let err = client
        .get::<serde_json::Value>("/workouts")
        .await
        .unwrap_err();

    //* Then
    denied_mock.assert_async().await;
    refresh_mock.assert_async().await;
    assert_eq!(sign_outs.load(Ordering::SeqCst), 0);
    assert!(matches!(err, ApiError::Application { ref message } if message == "access denied"));
}

#[tokio::test]
async fn replay_outcome_is_returned_as_is() {
    //* Given
    let mut server = Server::new_async().await;

    let _expired_mock = server
        .mock("GET", "/workouts")
        .match_header("authorization", "Bearer T1")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"token.expired"}"#)
        .create_async()
        .await;

    let refresh_mock = server
        .mock("POST", "/sessions/refresh-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token":"T2","refresh_token":"R2"}"#)
        .expect(1)
        .create_async()
        .await;

    // The replayed request fails for an unrelated reason; that failure is
    // the caller's outcome and must not trigger another refresh.
    let replay_mock = server
        .mock("GET", "/workouts")
        .match_header("authorization", "Bearer T2")
        .with_status(500)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"internal server error"}"#)
        .expect(1)
        .create_async()
        .await;

    let store = seeded_store();
    let client = client_for(&server, store);
    client.token_holder().set("T1".to_string());

    //* When
    let err = client
        .get::<serde_json::Value>("/workouts")
        .await
        .unwrap_err();

    //* Then
    refresh_mock.assert_async().await;
    replay_mock.assert_async().await;
    assert!(
        matches!(err, ApiError::Application { ref message } if message == "internal server error")
    );
}

#[tokio::test]
async fn error_without_structured_body_surfaces_transport_error() {
    //* Given
    let mut server = Server::new_async().await;

    let _mock = server
        .mock("GET", "/workouts")
        .with_status(500)
        .with_body("")
        .create_async()
        .await;

    let store = seeded_store();
    let client = client_for(&server, store);

    //* When
    let err = client
        .get::<serde_json::Value>("/workouts")
        .await
        .unwrap_err();

    //* Then
    assert!(matches!(err, ApiError::Transport(_)), "unexpected error: {err:?}");
}

#[tokio::test]
async fn fresh_cycle_starts_after_the_previous_one_completed() {
    //* Given
    let mut server = Server::new_async().await;

    let _expired_t1 = server
        .mock("GET", "/workouts")
        .match_header("authorization", "Bearer T1")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"token.expired"}"#)
        .expect(1)
        .create_async()
        .await;

    let _expired_t2 = server
        .mock("GET", "/workouts")
        .match_header("authorization", "Bearer T2")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"token.expired"}"#)
        .expect(2)
        .create_async()
        .await;

    let refresh_r1 = server
        .mock("POST", "/sessions/refresh-token")
        .match_body(Matcher::Json(json!({"refresh_token": "R1"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token":"T2","refresh_token":"R2"}"#)
        .expect(1)
        .create_async()
        .await;

    let refresh_r2 = server
        .mock("POST", "/sessions/refresh-token")
        .match_body(Matcher::Json(json!({"refresh_token": "R2"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token":"T3","refresh_token":"R3"}"#)
        .expect(1)
        .create_async()
        .await;

    let replay_t3 = server
        .mock("GET", "/workouts")
        .match_header("authorization", "Bearer T3")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .expect(1)
        .create_async()
        .await;

    let store = seeded_store();
    let client = client_for(&server, store.clone());
    client.token_holder().set("T1".to_string());

    //* When
    // First request: expires on T1, refreshes to T2, replays, and the
    // replay expires again. The replay does not re-enter the refresh path,
    // so the error is surfaced.
    let err = client
        .get::<serde_json::Value>("/workouts")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Application { ref message } if message == "token.expired"));

    // Second request: the previous cycle fully reset, so this one starts a
    // fresh exchange with the rotated refresh token.
    let body = client
        .get::<serde_json::Value>("/workouts")
        .await
        .unwrap();

    //* Then
    refresh_r1.assert_async().await;
    refresh_r2.assert_async().await;
    replay_t3.assert_async().await;
    assert_eq!(body, json!([]));
    assert_eq!(
        store.credential().unwrap(),
        Some(Credential {
            token: "T3".to_string(),
            refresh_token: "R3".to_string(),
        })
    );
}
