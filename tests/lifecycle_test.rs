// Integration tests for the credential service against a mock token endpoint

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use mockito::{Matcher, Server};
use std::sync::Arc;
use tokenkeeper::config::ProviderConfig;
use tokenkeeper::events::{CredentialEvent, EventSink, MemorySink};
use tokenkeeper::provider::GoogleProvider;
use tokenkeeper::users::SqliteUserDirectory;
use tokenkeeper::{
    CredentialService, CredentialStore, FailureKind, RefreshCoordinator, RetryPolicy, TokenBundle,
    UserDirectory,
};

struct Harness {
    service: CredentialService,
    store: Arc<CredentialStore>,
    users: Arc<SqliteUserDirectory>,
    events: Arc<MemorySink>,
}

fn harness(server: &Server) -> Harness {
    let events = Arc::new(MemorySink::new());
    let sink: Arc<dyn EventSink> = events.clone();
    let store = Arc::new(
        CredentialStore::open(":memory:", &BASE64.encode([0u8; 32]), sink.clone()).unwrap(),
    );
    let provider = GoogleProvider::new(ProviderConfig {
        token_url: format!("{}/token", server.url()),
        revoke_url: format!("{}/revoke", server.url()),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        redirect_uri: "https://app.example.com/callback".to_string(),
        ..ProviderConfig::default()
    })
    .unwrap();
    let coordinator = Arc::new(
        RefreshCoordinator::new(
            store.clone(),
            RetryPolicy::none(),
            std::time::Duration::from_secs(5),
            sink.clone(),
        )
        .with_provider(Arc::new(provider)),
    );
    let users = Arc::new(SqliteUserDirectory::open(":memory:").unwrap());
    users.upsert_user("u1", true).unwrap();

    let service = CredentialService::new(coordinator, users.clone(), sink, Duration::minutes(15));
    Harness {
        service,
        store,
        users,
        events,
    }
}

fn expiring_bundle() -> TokenBundle {
    TokenBundle {
        access_token: "ya29.old".to_string(),
        refresh_token: Some("1//refresh".to_string()),
        scope: "gmail.readonly".to_string(),
        expires_at: Some(Utc::now() + Duration::minutes(5)),
    }
}

#[tokio::test]
async fn test_connect_stores_and_marks_connected() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("code".into(), "auth-code".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"ya29.first","refresh_token":"1//first","expires_in":3599,"scope":"gmail.readonly"}"#)
        .create_async()
        .await;
    let h = harness(&server);

    let credential = h.service.connect("u1", "google", "auth-code").await.unwrap();

    assert_eq!(credential.access_token, "ya29.first");
    assert!(h.users.is_connected("u1").unwrap());
    let stored = h.service.get("u1", "google").unwrap().unwrap();
    assert_eq!(stored.refresh_token.as_deref(), Some("1//first"));
}

#[tokio::test]
async fn test_invalid_grant_disconnects_but_keeps_credential() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#)
        .expect(1)
        .create_async()
        .await;
    let h = harness(&server);
    h.store.store("u1", "google", &expiring_bundle()).unwrap();
    h.users.set_connected("u1", true).await.unwrap();

    let err = h
        .service
        .refresh_if_needed("u1", "google", Duration::minutes(15))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Unrecoverable);
    mock.assert_async().await;
    assert!(!h.users.is_connected("u1").unwrap());

    let kept = h.store.get("u1", "google").unwrap().expect("credential kept");
    assert_eq!(kept.refresh_failure_count, 1);
    assert!(h
        .events
        .events()
        .iter()
        .any(|e| matches!(e, CredentialEvent::Disconnected { .. })));
}

#[tokio::test]
async fn test_revoke_and_delete_is_best_effort() {
    let mut server = Server::new_async().await;
    let revoke = server
        .mock("POST", "/revoke")
        .match_body(Matcher::UrlEncoded("token".into(), "1//refresh".into()))
        .with_status(503)
        .create_async()
        .await;
    let h = harness(&server);
    h.store.store("u1", "google", &expiring_bundle()).unwrap();
    h.users.set_connected("u1", true).await.unwrap();

    assert!(h.service.revoke_and_delete("u1", "google").await.unwrap());

    revoke.assert_async().await;
    assert!(h.service.get("u1", "google").unwrap().is_none());
    assert!(!h.users.is_connected("u1").unwrap());

    // Second call finds nothing and is not an error.
    assert!(!h.service.revoke_and_delete("u1", "google").await.unwrap());
}

#[tokio::test]
async fn test_health_check() {
    let server = Server::new_async().await;
    let h = harness(&server);
    h.store.store("u1", "google", &expiring_bundle()).unwrap();

    let health = h.service.health_check();
    assert!(health.healthy);
    assert!(health.encryption_ok);
    assert_eq!(health.credential_count, Some(1));
}
