use std::time::Duration;

use base64::{Engine as _, engine::general_purpose};
use leger::error::LegerError;
use leger::secrets::DaemonClient;

fn client(url: &str) -> DaemonClient {
    DaemonClient::new(
        url,
        Some("test-token".to_string()),
        Duration::from_secs(30),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn health_round_trip() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/health")
        .match_header("authorization", "Bearer test-token")
        .with_body(r#"{"ok":true}"#)
        .create_async()
        .await;

    client(&server.url()).health().await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn health_failure_is_daemon_unavailable() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/health")
        .with_status(500)
        .create_async()
        .await;

    let err = client(&server.url()).health().await.unwrap_err();
    assert!(matches!(err, LegerError::DaemonUnavailable { .. }));
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn get_decodes_base64_values() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/get")
        .match_query(mockito::Matcher::UrlEncoded(
            "name".into(),
            "leger/u/api_key".into(),
        ))
        .with_body(format!(
            r#"{{"name":"leger/u/api_key","value":"{}","version":3}}"#,
            general_purpose::STANDARD.encode(b"s3cret\x00bytes")
        ))
        .create_async()
        .await;

    let secret = client(&server.url()).get("leger/u/api_key").await.unwrap();
    assert_eq!(secret.value, b"s3cret\x00bytes");
    assert_eq!(secret.version, 3);
}

#[tokio::test]
async fn missing_secret_names_the_reference() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/get")
        .with_status(404)
        .create_async()
        .await;

    let err = client(&server.url())
        .get("leger/u/ghost")
        .await
        .unwrap_err();
    match err {
        LegerError::SecretUnavailable { name, .. } => assert_eq!(name, "leger/u/ghost"),
        other => panic!("expected SecretUnavailable, got {other}"),
    }
}

#[tokio::test]
async fn put_encodes_and_returns_version() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/put")
        .match_body(mockito::Matcher::Json(serde_json::json!({
            "name": "leger/u/api_key",
            "value": general_purpose::STANDARD.encode(b"fresh"),
        })))
        .with_body(r#"{"version":7}"#)
        .create_async()
        .await;

    let version = client(&server.url())
        .put("leger/u/api_key", b"fresh")
        .await
        .unwrap();
    assert_eq!(version, 7);
    mock.assert_async().await;
}

#[tokio::test]
async fn list_and_info_parse_version_sets() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/list")
        .with_body(r#"[{"name":"leger/u/a","active_version":2,"versions":[1,2]}]"#)
        .create_async()
        .await;
    server
        .mock("GET", "/api/info")
        .match_query(mockito::Matcher::UrlEncoded("name".into(), "leger/u/a".into()))
        .with_body(r#"{"name":"leger/u/a","active_version":2,"versions":[1,2]}"#)
        .create_async()
        .await;

    let c = client(&server.url());
    let listed = c.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].active_version, 2);

    let info = c.info("leger/u/a").await.unwrap();
    assert_eq!(info.versions, vec![1, 2]);
}

#[tokio::test]
async fn activate_checks_acknowledgement() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/activate")
        .match_body(mockito::Matcher::Json(serde_json::json!({
            "name": "leger/u/a",
            "version": 1,
        })))
        .with_body(r#"{"ok":true}"#)
        .create_async()
        .await;

    client(&server.url()).activate("leger/u/a", 1).await.unwrap();
}
