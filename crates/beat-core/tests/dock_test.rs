// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment discovery against a scripted container runtime.
//!
//! The last test talks to a real docker daemon and only runs when
//! `BEAT_TEST_DOCKER_IMAGE` names an image to run.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use beat_core::dock::mock::ScriptedExecutor;
use beat_core::dock::{DockError, ExecOutput, Host, HostConfig};
use serde_json::{Value, json};

fn config(strict: bool, images_cache: Option<PathBuf>) -> HostConfig {
    HostConfig {
        raise_on_errors: strict,
        discover: true,
        images_cache,
        host_address: Some("10.0.0.1".to_string()),
        ..HostConfig::default()
    }
}

fn labelled(tag: &str, labels: &[(&str, &str)]) -> Value {
    let labels: serde_json::Map<String, Value> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();
    json!({ "RepoTags": [tag], "Config": { "Labels": labels } })
}

fn python(tag: &str, revision: &str) -> Value {
    labelled(
        tag,
        &[
            ("beat.env.type", "execution"),
            ("beat.env.name", "Python"),
            ("beat.env.version", "3.9"),
            ("beat.env.revision", revision),
        ],
    )
}

/// Executor answering the label queries with `databases` and `executions`.
fn with_labels(databases: &[Value], executions: &[Value]) -> Arc<ScriptedExecutor> {
    let executor = Arc::new(ScriptedExecutor::new());
    for (kind, images) in [("database", databases), ("execution", executions)] {
        let ids: Vec<String> = (0..images.len()).map(|i| format!("{kind}{i}")).collect();
        let filter = format!("label=beat.env.type={kind}");
        executor.on(
            &["images", "--filter", filter.as_str()],
            ExecOutput::ok(ids.join("\n")),
        );
        if !ids.is_empty() {
            let mut inspect = vec!["image", "inspect"];
            inspect.extend(ids.iter().map(String::as_str));
            executor.on(
                &inspect,
                ExecOutput::ok(Value::Array(images.to_vec()).to_string()),
            );
        }
    }
    executor
}

/// Executor with no labelled image, listing `images` for `describe`.
fn with_descriptions(images: &[(&str, Option<Value>)]) -> Arc<ScriptedExecutor> {
    let executor = with_labels(&[], &[]);
    let listing: Vec<&str> = images.iter().map(|(image, _)| *image).collect();
    executor.on(
        &["images", "--format", "{{.Repository}}:{{.Tag}}"],
        ExecOutput::ok(listing.join("\n")),
    );
    for (image, description) in images {
        let image: &str = image;
        let output = match description {
            Some(description) => ExecOutput::ok(description.to_string()),
            None => ExecOutput::failed(125, "no describe entry point"),
        };
        executor.on(&["run", "--rm=true", image, "describe"], output);
    }
    executor
}

#[tokio::test]
async fn test_discovery_from_labels() {
    let database = labelled(
        "beat/db-integers:1.0",
        &[
            ("beat.env.type", "database"),
            ("beat.env.name", "Integers"),
            ("beat.env.version", "1.0"),
            ("beat.env.databases", r#"["integers/1"]"#),
        ],
    );
    let executor = with_labels(&[database], &[python("beat/python:3.9", "r1")]);

    let host = Host::with_executor(config(false, None), executor.clone())
        .await
        .unwrap();

    assert_eq!(host.env2docker("Python (3.9)"), Some("beat/python:3.9"));
    assert_eq!(host.dbenv2docker("Integers (1.0)"), Some("beat/db-integers:1.0"));
    assert_eq!(host.db2docker(&["integers/1"]), Some("beat/db-integers:1.0"));
    assert_eq!(host.db2docker(&["mnist/1"]), None);
    assert_eq!(host.full_environment_name("Python").as_deref(), Some("Python (3.9)"));
    assert!(host.contains("Integers (1.0)"));
    assert!(executor.calls_matching(&["run"]).is_empty());
}

#[tokio::test]
async fn test_higher_revision_wins_in_any_order() {
    for images in [
        [python("beat/python:r1", "r1"), python("beat/python:r2", "r2")],
        [python("beat/python:r2", "r2"), python("beat/python:r1", "r1")],
    ] {
        let executor = with_labels(&[], &images);

        let host = Host::with_executor(config(false, None), executor)
            .await
            .unwrap();

        assert_eq!(host.processing_environments().len(), 1);
        assert_eq!(host.env2docker("Python (3.9)"), Some("beat/python:r2"));
    }
}

#[tokio::test]
async fn test_strict_discovery_refuses_duplicate_labels() {
    let executor = with_labels(
        &[],
        &[python("beat/python:r1", "r1"), python("other/python:r2", "r2")],
    );

    let error = Host::with_executor(config(true, None), executor)
        .await
        .unwrap_err();

    match error {
        DockError::Conflict { key, .. } => assert_eq!(key, "Python (3.9)"),
        other => panic!("expected a conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_label_query_is_tolerated_unless_strict() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.on(&["images"], ExecOutput::failed(1, "daemon unreachable"));

    let host = Host::with_executor(config(false, None), executor.clone())
        .await
        .unwrap();
    assert!(host.processing_environments().is_empty());

    let error = Host::with_executor(config(true, None), executor)
        .await
        .unwrap_err();
    assert!(matches!(error, DockError::Discovery(message) if message == "daemon unreachable"));
}

#[tokio::test]
async fn test_discovery_through_describe() {
    let description = json!({ "name": "Python", "version": "3.9", "os": ["debian", "12"] });
    let db_description = json!({ "name": "Integers", "version": "1.0", "databases": ["integers/1"] });
    let executor = with_descriptions(&[
        ("beat.env.python:1.0.0", Some(description)),
        ("beat.env.db:1.0.0", Some(db_description)),
        ("beat.env.broken:1.0.0", None),
    ]);

    let host = Host::with_executor(config(false, None), executor.clone())
        .await
        .unwrap();

    assert_eq!(host.env2docker("Python (3.9)"), Some("beat.env.python:1.0.0"));
    assert_eq!(host.dbenv2docker("Integers (1.0)"), Some("beat.env.db:1.0.0"));
    assert_eq!(host.processing_environments().len(), 1);
    let info = &host.processing_environments()["Python (3.9)"];
    assert_eq!(info.extra["os"], json!(["debian", "12"]));
    assert_eq!(executor.calls_matching(&["run"]).len(), 3);
}

#[tokio::test]
async fn test_describe_prefers_latest_then_greater_tag() {
    let description = json!({ "name": "Python", "version": "3.9" });
    let orders = [
        (["beat.env.python:2.0.0", "beat.env.python:latest"], "beat.env.python:latest"),
        (["beat.env.python:latest", "beat.env.python:2.0.0"], "beat.env.python:latest"),
        (["beat.env.python:1.0.0", "beat.env.python:2.0.0"], "beat.env.python:2.0.0"),
        (["beat.env.python:2.0.0", "beat.env.python:1.0.0"], "beat.env.python:2.0.0"),
    ];
    for (images, expected) in orders {
        let executor = with_descriptions(&[
            (images[0], Some(description.clone())),
            (images[1], Some(description.clone())),
        ]);

        let host = Host::with_executor(config(false, None), executor)
            .await
            .unwrap();

        assert_eq!(host.env2docker("Python (3.9)"), Some(expected), "order {images:?}");
    }
}

#[tokio::test]
async fn test_strict_describe_refuses_duplicates() {
    let description = json!({ "name": "Python", "version": "3.9" });
    let executor = with_descriptions(&[
        ("beat.env.python:1.0.0", Some(description.clone())),
        ("beat.env.python:latest", Some(description)),
    ]);

    let error = Host::with_executor(config(true, None), executor)
        .await
        .unwrap_err();

    assert!(matches!(error, DockError::Conflict { .. }));
}

#[tokio::test]
async fn test_images_cache_skips_describe() {
    let directory = tempfile::tempdir().unwrap();
    let cache = directory.path().join("images.json");
    let description = json!({ "name": "Python", "version": "3.9" });

    let executor = with_descriptions(&[("beat.env.python:1.0.0", Some(description))]);
    let host = Host::with_executor(config(false, Some(cache.clone())), executor)
        .await
        .unwrap();
    drop(host);
    assert!(cache.is_file());

    let executor = with_descriptions(&[("beat.env.python:1.0.0", None)]);
    let host = Host::with_executor(config(false, Some(cache)), executor.clone())
        .await
        .unwrap();

    assert_eq!(host.env2docker("Python (3.9)"), Some("beat.env.python:1.0.0"));
    assert!(executor.calls_matching(&["run"]).is_empty());
}

#[tokio::test]
async fn test_catalog_round_trips_to_another_host() {
    let executor = with_labels(&[], &[python("beat/python:3.9", "r1")]);
    let host = Host::with_executor(config(false, None), executor)
        .await
        .unwrap();

    let catalog: beat_core::dock::HostCatalog =
        serde_json::from_str(&serde_json::to_string(&host.catalog()).unwrap()).unwrap();
    let copy = Host::from_catalog(
        HostConfig {
            discover: false,
            ..config(false, None)
        },
        catalog,
        Arc::new(ScriptedExecutor::new()),
    );

    assert_eq!(copy.env2docker("Python (3.9)"), Some("beat/python:3.9"));
}

#[tokio::test]
async fn test_real_docker_run() {
    let image = skip_unless_env!("BEAT_TEST_DOCKER_IMAGE");
    let host = Host::new(HostConfig {
        discover: false,
        ..HostConfig::default()
    })
    .await
    .unwrap();

    let (status, output) = host
        .run(&image, vec!["echo".to_string(), "hello".to_string()])
        .await;

    assert_eq!(status, 0);
    assert_eq!(output.as_deref().map(str::trim), Some("hello"));
    assert!(host.tracked_containers().is_empty());
}

#[tokio::test]
async fn test_real_docker_wait_timeout_then_kill() {
    let image = skip_unless_env!("BEAT_TEST_DOCKER_IMAGE");
    let host = Host::new(HostConfig {
        discover: false,
        ..HostConfig::default()
    })
    .await
    .unwrap();
    let mut container =
        host.create_container(&image, vec!["sleep".to_string(), "100".to_string()]);
    host.start(&mut container, 0, 0).await.unwrap();

    let early = host
        .wait(&container, Some(std::time::Duration::from_millis(500)))
        .await;
    assert_eq!(early, None);
    assert_eq!(host.status(&container).await.as_deref(), Some("running"));

    host.kill(&container).await.unwrap();
    assert_eq!(host.wait(&container, None).await, Some(137));

    host.rm(&mut container).await.unwrap();
    assert!(container.id.is_none());
    assert!(host.tracked_containers().is_empty());
}
