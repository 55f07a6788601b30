mod common;

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose};
use common::{FakeHost, test_config, write_unit};
use leger::config::Command;
use leger::error::LegerError;
use leger::orchestrator::Orchestrator;
use leger::state::{StateStore, tree_checksum};

const USER: &str = "9f1c6c42-6f3a-4f8e-9a2e-0d2c8f1b5a77";

async fn daemon() -> mockito::ServerGuard {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/health")
        .with_body(r#"{"ok":true}"#)
        .create_async()
        .await;
    server
}

fn install_command(dir: &std::path::Path, name: &str) -> Command {
    Command::Install {
        source: dir.display().to_string(),
        name: Some(name.to_string()),
        version: None,
        subpath: None,
        force: false,
        no_start: false,
    }
}

#[tokio::test]
async fn port_conflict_blocks_install_entirely() {
    let mut server = daemon().await;
    server
        .mock("GET", "/api/get")
        .with_body("should never be called")
        .expect(0)
        .create_async()
        .await;

    let state_root = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    write_unit(
        units.path(),
        "web.container",
        "[Container]\nImage=web:1\nPublishPort=8080:80\nSecret=api_key,type=env,target=API_KEY\n",
    );
    write_unit(
        units.path(),
        "cache.container",
        "[Container]\nImage=redis:7\nPublishPort=8080:6379\n",
    );

    let host = Arc::new(FakeHost::new());
    let orchestrator =
        Orchestrator::new(test_config(state_root.path(), &server.url()), host.clone()).unwrap();

    let err = orchestrator
        .run(install_command(units.path(), "demo"))
        .await
        .unwrap_err();

    let LegerError::ValidationFailed(report) = &err else {
        panic!("expected validation failure, got {err}");
    };
    assert_eq!(report.port_conflicts.len(), 1);
    let rendered = format!("{report}");
    assert!(rendered.contains("web.container"));
    assert!(rendered.contains("cache.container"));
    assert!(rendered.contains("8080/tcp"));
    assert_eq!(err.exit_code(), 4);

    let store = StateStore::open(state_root.path()).unwrap();
    assert!(!store.active_exists("demo"));
    assert!(host.secret_names().is_empty());
}

#[tokio::test]
async fn install_provisions_secrets_and_starts_in_order() {
    let mut server = daemon().await;
    let qualified = format!("leger/{USER}/api_key");
    server
        .mock("GET", "/api/get")
        .match_query(mockito::Matcher::UrlEncoded("name".into(), qualified.clone()))
        .with_body(format!(
            r#"{{"name":"{qualified}","value":"{}","version":1}}"#,
            general_purpose::STANDARD.encode("hunter2")
        ))
        .create_async()
        .await;

    let state_root = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    write_unit(
        units.path(),
        "web.container",
        "[Unit]\nAfter=cache.service\n\n[Container]\nImage=web:1\nPublishPort=8080:80\nSecret=api_key,type=env,target=API_KEY\n",
    );
    write_unit(units.path(), "cache.container", "[Container]\nImage=redis:7\n");

    let host = Arc::new(FakeHost::new());
    let orchestrator =
        Orchestrator::new(test_config(state_root.path(), &server.url()), host.clone()).unwrap();
    orchestrator
        .run(install_command(units.path(), "demo"))
        .await
        .unwrap();

    let store = StateStore::open(state_root.path()).unwrap();
    let record = store.load("demo").unwrap().expect("record saved");
    assert_eq!(record.services.len(), 2);
    assert_eq!(record.secrets, vec!["api_key"]);
    assert!(store.active_exists("demo"));
    assert!(store.active_dir("demo").join("web.container").is_file());

    // every declared secret is in the engine store, with the daemon's value
    let state = host.state.lock().unwrap();
    assert_eq!(state.secrets.get(&qualified).map(Vec::as_slice), Some(&b"hunter2"[..]));
    assert!(state.running.contains("web.service"));
    assert!(state.running.contains("cache.service"));

    // dependency-first ordering: cache started before web
    let starts: Vec<&Vec<String>> = state
        .calls
        .iter()
        .filter(|argv| argv.contains(&"start".to_string()))
        .collect();
    assert_eq!(starts[0].last().unwrap(), "cache.service");
    assert_eq!(starts[1].last().unwrap(), "web.service");
}

#[tokio::test]
async fn reinstall_with_identical_source_changes_nothing() {
    let server = daemon().await;

    let state_root = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    write_unit(units.path(), "web.container", "[Container]\nImage=web:1\n");

    let host = Arc::new(FakeHost::new());
    let orchestrator =
        Orchestrator::new(test_config(state_root.path(), &server.url()), host).unwrap();

    orchestrator
        .run(install_command(units.path(), "demo"))
        .await
        .unwrap();

    let store = StateStore::open(state_root.path()).unwrap();
    let first = store.load("demo").unwrap().unwrap();
    let checksum = tree_checksum(&store.active_dir("demo")).unwrap();

    orchestrator
        .run(install_command(units.path(), "demo"))
        .await
        .unwrap();

    let second = store.load("demo").unwrap().unwrap();
    assert_eq!(second.updated_at, first.updated_at);
    assert_eq!(tree_checksum(&store.active_dir("demo")).unwrap(), checksum);
}

#[tokio::test]
async fn dependency_cycles_survive_force() {
    let server = daemon().await;

    let state_root = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    write_unit(
        units.path(),
        "alpha.container",
        "[Unit]\nAfter=beta.service\n\n[Container]\nImage=a\n",
    );
    write_unit(
        units.path(),
        "beta.container",
        "[Unit]\nAfter=alpha.service\n\n[Container]\nImage=b\n",
    );

    let host = Arc::new(FakeHost::new());
    let orchestrator =
        Orchestrator::new(test_config(state_root.path(), &server.url()), host).unwrap();

    let err = orchestrator
        .run(Command::Install {
            source: units.path().display().to_string(),
            name: Some("demo".to_string()),
            version: None,
            subpath: None,
            force: true,
            no_start: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LegerError::ValidationFailed(_)));
}

#[tokio::test]
async fn concurrent_mutation_is_refused_while_locked() {
    let server = daemon().await;

    let state_root = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    write_unit(units.path(), "web.container", "[Container]\nImage=web:1\n");

    // another process holds the deployment lock
    let other = StateStore::open(state_root.path()).unwrap();
    let _held = other.lock("demo").unwrap();

    let host = Arc::new(FakeHost::new());
    let orchestrator =
        Orchestrator::new(test_config(state_root.path(), &server.url()), host.clone()).unwrap();
    let err = orchestrator
        .run(install_command(units.path(), "demo"))
        .await
        .unwrap_err();
    assert!(matches!(err, LegerError::Locked(_)));

    let store = StateStore::open(state_root.path()).unwrap();
    assert!(!store.active_exists("demo"));
    assert!(host.secret_names().is_empty());
}

#[tokio::test]
async fn unreachable_daemon_blocks_install() {
    let state_root = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    write_unit(units.path(), "web.container", "[Container]\nImage=web:1\n");

    let host = Arc::new(FakeHost::new());
    // nobody is listening on this port
    let config = test_config(state_root.path(), "http://127.0.0.1:9");
    let orchestrator = Orchestrator::new(config, host).unwrap();
    let err = orchestrator
        .run(install_command(units.path(), "demo"))
        .await
        .unwrap_err();
    assert!(matches!(err, LegerError::DaemonUnavailable { .. }));
}
