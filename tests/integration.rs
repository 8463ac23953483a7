//! Integration tests for plugin-host-runtime.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{write_file, Host, TestPlugin};
use plugin_host_runtime::{
    CycleResolution, DependencyResolver, ErrorCode, LoadOptions, ManagerConfig,
    PluginEvent, PluginState, Version, VersionManager,
};
use serde_json::json;

fn v(s: &str) -> Version {
    Version::parse(s).unwrap()
}

#[test]
fn test_linear_dependency_order() {
    let host = Host::new();
    let a = host.plugin("a", || TestPlugin::new("A"));
    let b = host.plugin("b", || TestPlugin::new("B").depends_on("A"));
    let c = host.plugin("c", || TestPlugin::new("C").depends_on("B"));

    for path in [&a, &b, &c] {
        host.manager.load_plugin(path, LoadOptions::new()).unwrap();
    }
    assert_eq!(host.manager.get_load_order(), vec!["A", "B", "C"]);

    host.manager.shutdown();
    assert_eq!(host.manager.plugin_count(), 0);

    let unchecked = LoadOptions::new().with_dependency_check(false);
    for path in [&c, &b, &a] {
        host.manager.load_plugin(path, unchecked.clone()).unwrap();
    }
    assert_eq!(host.manager.get_load_order(), vec!["A", "B", "C"]);
}

#[test]
fn test_cycle_detection_and_resolution() {
    let resolver = DependencyResolver::new();
    resolver.rebuild(vec![
        ("P".to_string(), vec!["Q".to_string()]),
        ("Q".to_string(), vec!["P".to_string()]),
    ]);

    assert!(resolver.has_circular_dependencies());
    assert!(resolver.get_load_order().is_empty());

    let cycles = resolver
        .resolve_circular_dependencies(CycleResolution::RemoveWeakest)
        .unwrap();
    assert_eq!(cycles.len(), 1);
    assert_eq!(resolver.get_load_order().len(), 2);
    assert!(!resolver.has_circular_dependencies());
}

#[test]
fn test_version_install_activate_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let versions = VersionManager::new(dir.path().join("store")).unwrap();

    for ver in ["1.0.0", "1.1.0", "1.2.0"] {
        let source = dir.path().join(format!("src-{}", ver)).join("cal.plug");
        write_file(&source, ver);
        versions.install("cal", v(ver), &source, false).unwrap();
    }

    versions.set_active_version("cal", &v("1.2.0"), false).unwrap();
    assert_eq!(versions.get_active_version("cal"), Some(v("1.2.0")));

    versions.create_backup("cal", &v("1.2.0")).unwrap();
    versions.rollback_to_version("cal", &v("1.1.0"), true).unwrap();

    assert_eq!(versions.get_active_version("cal"), Some(v("1.1.0")));
    assert_eq!(versions.get_installed_versions("cal").len(), 3);
}

#[test]
fn test_migration_callback() {
    use plugin_host_runtime::versioning::MigrationStrategy;

    let dir = tempfile::tempdir().unwrap();
    let versions = VersionManager::new(dir.path()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    versions.register_migration_callback("text", v("1.0.0"), v("2.0.0"), move |ctx| {
        assert_eq!(ctx.plugin_id, "text");
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert!(versions.is_migration_available("text", &v("1.0.0"), &v("2.0.0")));

    let ctx = versions.migration_context("text", v("1.0.0"), v("2.0.0"), MigrationStrategy::Callback);
    versions.migrate_plugin_data(&ctx).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let other = VersionManager::new(dir.path().join("other")).unwrap();
    let ctx = other.migration_context("text", v("1.0.0"), v("2.0.0"), MigrationStrategy::Callback);
    let err = other.migrate_plugin_data(&ctx).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MigrationFailed);
}

#[test]
fn test_batch_load_is_atomic() {
    let host = Host::new();
    let p1 = host.plugin("p1", || TestPlugin::new("p1"));
    let broken = host.plugin("p2_broken", || TestPlugin::new("p2_broken").broken());
    let p3 = host.plugin("p3", || TestPlugin::new("p3"));

    let results = host
        .manager
        .batch_load(&[p1.clone(), broken.clone(), p3.clone()], LoadOptions::new());

    assert_eq!(results.len(), 3);
    for path in [&p1, &broken, &p3] {
        assert!(results[path].is_err(), "{} should report failure", path.display());
    }
    assert_eq!(host.manager.plugin_count(), 0);
    assert!(host.loader.loaded_ids().is_empty());
}

#[test]
fn test_sha256_mismatch_is_rejected() {
    let host = Host::new();
    let keep = host.plugin("keep", || TestPlugin::new("keep"));
    host.manager.load_plugin(&keep, LoadOptions::new()).unwrap();

    let path = host.plugin("signed", || TestPlugin::new("signed"));
    let err = host
        .manager
        .load_plugin(&path, LoadOptions::new().with_sha256("ab".repeat(32)))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SecurityViolation);
    assert_eq!(host.manager.plugin_count(), 1);

    let digest = plugin_host_runtime::sha256_file(&path).unwrap();
    host.manager
        .load_plugin(&path, LoadOptions::new().with_sha256(digest))
        .unwrap();
    assert_eq!(host.manager.plugin_count(), 2);
}

#[test]
fn test_reload_keeps_plugin_state() {
    let host = Host::new();
    let path = host.plugin("counter", || TestPlugin::new("counter"));
    host.manager.load_plugin(&path, LoadOptions::new()).unwrap();

    for _ in 0..3 {
        host.manager.execute_command("counter", "count", &json!(null)).unwrap();
    }
    host.manager.reload_plugin("counter", true).unwrap();

    let next = host.manager.execute_command("counter", "count", &json!(null)).unwrap();
    assert_eq!(next, json!(4));
    assert_eq!(
        host.manager.get_plugin_info("counter").unwrap().state,
        PluginState::Running
    );
}

#[test]
fn test_load_all_from_search_path() {
    let host = Host::new();
    host.plugin("ui", || TestPlugin::new("ui").depends_on("core"));
    host.plugin("core", || TestPlugin::new("core"));
    host.plugin("net", || TestPlugin::new("net").depends_on("core"));
    write_file(&host.path("README.txt"), "not a plugin");

    let results = host.manager.load_all_plugins(LoadOptions::new());
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    let order = host.manager.get_load_order();
    assert_eq!(order.first().map(String::as_str), Some("core"));

    let err = host.manager.unload_plugin("core", false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DependencyMissing);

    let ids: Vec<String> = vec!["core".into(), "ui".into(), "net".into()];
    let results = host.manager.batch_unload(&ids, false);
    assert!(results.values().all(|r| r.is_ok()));
    assert_eq!(host.manager.plugin_count(), 0);
}

#[test]
fn test_events_follow_lifecycle() {
    let host = Host::new();
    let path = host.plugin("ev", || TestPlugin::new("ev"));
    let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = transitions.clone();
    host.manager.subscribe(move |event| {
        if let PluginEvent::StateChanged { new, .. } = event {
            sink.lock().push(*new);
        }
    });

    host.manager.load_plugin(&path, LoadOptions::new()).unwrap();
    host.manager.pause_plugin("ev").unwrap();
    host.manager.resume_plugin("ev").unwrap();
    host.manager.unload_plugin("ev", false).unwrap();

    assert_eq!(
        *transitions.lock(),
        vec![
            PluginState::Initializing,
            PluginState::Running,
            PluginState::Paused,
            PluginState::Running,
            PluginState::Stopping,
            PluginState::Stopped,
            PluginState::Unloaded,
        ]
    );
}

#[test]
fn test_config_from_toml() {
    let config = ManagerConfig::from_toml_str(
        r#"
        max_plugins = 4
        auto_restart = true
        metrics_interval_ms = 250

        [watch]
        debounce_ms = 50
        extensions = ["plug"]
        "#,
    )
    .unwrap();
    assert_eq!(config.registry.max_plugins, 4);
    assert!(config.auto_restart);

    let err = ManagerConfig::from_toml_str("metrics_interval_ms = 0").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
}

#[tokio::test]
async fn test_async_load() {
    let host = Host::new();
    let path = host.plugin("bg", || TestPlugin::new("bg"));

    let id = host
        .manager
        .load_plugin_async(path, LoadOptions::new())
        .await
        .unwrap();
    assert_eq!(id, "bg");
    assert!(host.manager.is_loaded("bg"));
}
