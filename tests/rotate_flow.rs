mod common;

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose};
use common::{FakeHost, test_config, write_unit};
use leger::config::Command;
use leger::orchestrator::Orchestrator;

const USER: &str = "9f1c6c42-6f3a-4f8e-9a2e-0d2c8f1b5a77";

async fn daemon_for_install() -> mockito::ServerGuard {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/health")
        .with_body(r#"{"ok":true}"#)
        .create_async()
        .await;
    let qualified = format!("leger/{USER}/api_key");
    server
        .mock("GET", "/api/get")
        .match_query(mockito::Matcher::UrlEncoded("name".into(), qualified.clone()))
        .with_body(format!(
            r#"{{"name":"{qualified}","value":"{}","version":1}}"#,
            general_purpose::STANDARD.encode("old-value")
        ))
        .create_async()
        .await;
    server
}

#[tokio::test]
async fn rotation_restarts_only_env_dependents() {
    let mut server = daemon_for_install().await;

    let state_root = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    write_unit(
        units.path(),
        "web.container",
        "[Container]\nImage=web:1\nSecret=api_key,type=env,target=API_KEY\n",
    );
    write_unit(
        units.path(),
        "worker.container",
        "[Container]\nImage=worker:1\nSecret=api_key,type=mount\n",
    );
    write_unit(units.path(), "cache.container", "[Container]\nImage=redis:7\n");

    let host = Arc::new(FakeHost::new());
    let orchestrator =
        Orchestrator::new(test_config(state_root.path(), &server.url()), host.clone()).unwrap();
    orchestrator
        .run(Command::Install {
            source: units.path().display().to_string(),
            name: Some("demo".to_string()),
            version: None,
            subpath: None,
            force: false,
            no_start: false,
        })
        .await
        .unwrap();

    let put = server
        .mock("POST", "/api/put")
        .match_body(mockito::Matcher::PartialJsonString(format!(
            r#"{{"name":"leger/{USER}/api_key"}}"#
        )))
        .with_body(r#"{"version":2}"#)
        .create_async()
        .await;

    let value_file = state_root.path().join("new-secret");
    std::fs::write(&value_file, b"new-value").unwrap();

    orchestrator
        .run(Command::RotateSecret {
            secret: "api_key".to_string(),
            value_file: Some(value_file),
            no_restart: false,
            restart_mounts: false,
        })
        .await
        .unwrap();

    put.assert_async().await;

    // only the env-consuming service restarts; mount-only and unrelated
    // services are left alone
    assert_eq!(host.restarted_units(), vec!["web.service"]);

    // the engine copy now matches the daemon
    let qualified = format!("leger/{USER}/api_key");
    let state = host.state.lock().unwrap();
    assert_eq!(
        state.secrets.get(&qualified).map(Vec::as_slice),
        Some(&b"new-value"[..])
    );
}

#[tokio::test]
async fn rotation_can_include_mount_dependents() {
    let mut server = daemon_for_install().await;

    let state_root = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    write_unit(
        units.path(),
        "worker.container",
        "[Container]\nImage=worker:1\nSecret=api_key,type=mount\n",
    );

    let host = Arc::new(FakeHost::new());
    let orchestrator =
        Orchestrator::new(test_config(state_root.path(), &server.url()), host.clone()).unwrap();
    orchestrator
        .run(Command::Install {
            source: units.path().display().to_string(),
            name: Some("demo".to_string()),
            version: None,
            subpath: None,
            force: false,
            no_start: false,
        })
        .await
        .unwrap();

    server
        .mock("POST", "/api/put")
        .with_body(r#"{"version":2}"#)
        .create_async()
        .await;

    let value_file = state_root.path().join("new-secret");
    std::fs::write(&value_file, b"new-value").unwrap();

    orchestrator
        .run(Command::RotateSecret {
            secret: "api_key".to_string(),
            value_file: Some(value_file.clone()),
            no_restart: false,
            restart_mounts: true,
        })
        .await
        .unwrap();
    assert_eq!(host.restarted_units(), vec!["worker.service"]);

    // and --no-restart leaves everything alone
    orchestrator
        .run(Command::RotateSecret {
            secret: "api_key".to_string(),
            value_file: Some(value_file),
            no_restart: true,
            restart_mounts: false,
        })
        .await
        .unwrap();
    assert_eq!(host.restarted_units().len(), 1);
}
