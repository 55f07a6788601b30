mod common;

use std::fs;
use std::sync::Arc;

use common::{FakeHost, test_config, write_unit};
use leger::backup::{BackupStore, BackupKind};
use leger::config::Command;
use leger::engine::Engine;
use leger::orchestrator::Orchestrator;
use leger::state::StateStore;

async fn daemon() -> mockito::ServerGuard {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/health")
        .with_body(r#"{"ok":true}"#)
        .create_async()
        .await;
    server
}

struct Fixture {
    _server: mockito::ServerGuard,
    state_root: tempfile::TempDir,
    host: Arc<FakeHost>,
    orchestrator: Orchestrator,
}

async fn installed_web(image: &str) -> Fixture {
    let server = daemon().await;
    let state_root = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    write_unit(
        units.path(),
        "web.container",
        &format!("[Container]\nImage={image}\nPublishPort=8080:80\n"),
    );

    let host = Arc::new(FakeHost::new());
    let orchestrator =
        Orchestrator::new(test_config(state_root.path(), &server.url()), host.clone()).unwrap();
    orchestrator
        .run(Command::Install {
            source: units.path().display().to_string(),
            name: Some("web".to_string()),
            version: None,
            subpath: None,
            force: false,
            no_start: false,
        })
        .await
        .unwrap();

    Fixture {
        _server: server,
        state_root,
        host,
        orchestrator,
    }
}

fn staged_source(image: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_unit(
        dir.path(),
        "web.container",
        &format!("[Container]\nImage={image}\nPublishPort=8080:80\n"),
    );
    dir
}

#[tokio::test]
async fn stage_diff_apply_roundtrip() {
    let fixture = installed_web("web:1.0").await;
    let v2 = staged_source("web:2.0");

    fixture
        .orchestrator
        .run(Command::Stage {
            name: "web".to_string(),
            source: Some(v2.path().display().to_string()),
        })
        .await
        .unwrap();

    let store = StateStore::open(fixture.state_root.path()).unwrap();
    let diff = store.diff("web").unwrap();
    assert_eq!(diff.modified.len(), 1);
    assert_eq!(diff.modified[0].path, "web.container");
    assert!(diff.modified[0].diff.contains("-Image=web:1.0"));
    assert!(diff.modified[0].diff.contains("+Image=web:2.0"));
    assert!(diff.added.is_empty());
    assert!(diff.removed.is_empty());
    assert_eq!(diff.affected_services, vec!["web"]);

    fixture
        .orchestrator
        .run(Command::Apply {
            name: "web".to_string(),
        })
        .await
        .unwrap();

    let active = fs::read_to_string(store.active_dir("web").join("web.container")).unwrap();
    assert!(active.contains("Image=web:2.0"));
    assert!(!store.has_staged("web"));

    // the pre-apply snapshot is there and labelled
    let engine = Engine::new(fixture.host.clone(), "podman", leger::config::Scope::User);
    let backups = BackupStore::new(&store, &engine);
    let list = backups.list(Some("web")).unwrap();
    assert!(list.iter().any(|b| b.reason == "before-apply" && b.kind == BackupKind::Automatic));
}

#[tokio::test]
async fn failed_apply_restores_previous_active_content() {
    let fixture = installed_web("web:1.0").await;
    let v2 = staged_source("web:2.0");

    fixture
        .orchestrator
        .run(Command::Stage {
            name: "web".to_string(),
            source: Some(v2.path().display().to_string()),
        })
        .await
        .unwrap();

    fixture.host.state.lock().unwrap().fail_next_quadlet_install = true;

    let err = fixture
        .orchestrator
        .run(Command::Apply {
            name: "web".to_string(),
        })
        .await
        .unwrap_err();
    let rendered = format!("{err}");
    assert!(rendered.contains("simulated quadlet install failure"));
    assert!(rendered.contains("restored"), "composed error names the rollback: {rendered}");

    let store = StateStore::open(fixture.state_root.path()).unwrap();
    let active = fs::read_to_string(store.active_dir("web").join("web.container")).unwrap();
    assert!(active.contains("Image=web:1.0"), "active was rolled back: {active}");
}

#[tokio::test]
async fn discard_drops_staged_and_preserves_active() {
    let fixture = installed_web("web:1.0").await;
    let v2 = staged_source("web:2.0");

    fixture
        .orchestrator
        .run(Command::Stage {
            name: "web".to_string(),
            source: Some(v2.path().display().to_string()),
        })
        .await
        .unwrap();

    let store = StateStore::open(fixture.state_root.path()).unwrap();
    assert!(store.has_staged("web"));

    fixture
        .orchestrator
        .run(Command::Discard {
            name: "web".to_string(),
        })
        .await
        .unwrap();

    assert!(!store.staged_dir("web").exists());
    let active = fs::read_to_string(store.active_dir("web").join("web.container")).unwrap();
    assert!(active.contains("Image=web:1.0"));
}

#[tokio::test]
async fn update_applies_in_one_flow() {
    let fixture = installed_web("web:1.0").await;
    let v2 = staged_source("web:2.0");

    fixture
        .orchestrator
        .run(Command::Update {
            name: "web".to_string(),
            source: Some(v2.path().display().to_string()),
        })
        .await
        .unwrap();

    let store = StateStore::open(fixture.state_root.path()).unwrap();
    let active = fs::read_to_string(store.active_dir("web").join("web.container")).unwrap();
    assert!(active.contains("Image=web:2.0"));
}
