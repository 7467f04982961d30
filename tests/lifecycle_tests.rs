// Activate, uninstall, cleanup, list and smoke tests over installed packages.


use kegger::KegError;
use std::fs;
use std::os::unix::fs as unix_fs;
use std::path::PathBuf;
use test_helpers::{TestEnvironment, read_link_target};

async fn install(env: &TestEnvironment, name: &str, version: &str, output: &str, extra: &str) {
    env.installer()
        .install(
            &env.package(name, version, output, extra),
            &TestEnvironment::platform(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_activate_switches_back_to_older_version() {
    let env = TestEnvironment::new();
    install(&env, "pkg", "1.0", "one", "").await;
    install(&env, "pkg", "2.0", "two", "").await;
    assert_eq!(env.run("pkg"), "two");

    let links = env.installer().activate("pkg", "1.0").await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(env.run("pkg"), "one");
    assert_eq!(
        read_link_target(&env.layout.opt_link("pkg")),
        PathBuf::from("../Cellar/pkg/1.0")
    );
}

#[tokio::test]
async fn test_activate_unknown_version() {
    let env = TestEnvironment::new();
    install(&env, "pkg", "1.0", "one", "").await;

    let err = env.installer().activate("pkg", "9.9").await.unwrap_err();
    assert!(matches!(err, KegError::NotInstalled(_)));
    assert_eq!(err.exit_code(), 9);
}

#[tokio::test]
async fn test_activate_ignores_directory_without_receipt() {
    let env = TestEnvironment::new();
    let half = env.layout.keg_path("pkg", "3.0");
    fs::create_dir_all(&half).unwrap();
    fs::write(half.join("pkg"), "#!/bin/sh\n").unwrap();

    let err = env.installer().activate("pkg", "3.0").await.unwrap_err();
    assert!(matches!(err, KegError::NotInstalled(_)));
    assert!(!env.layout.bin_entry("pkg").exists());
}

#[tokio::test]
async fn test_uninstall_removes_kegs_and_links() {
    let env = TestEnvironment::new();
    install(&env, "pkg", "1.0", "one", "").await;
    install(&env, "pkg", "2.0", "two", "").await;

    let report = env.installer().uninstall("pkg", false).await.unwrap();
    assert_eq!(report.versions, vec!["2.0", "1.0"]);
    assert_eq!(report.unlinked.len(), 2);

    assert!(fs::symlink_metadata(env.layout.bin_entry("pkg")).is_err());
    assert!(fs::symlink_metadata(env.layout.opt_link("pkg")).is_err());
    assert!(!env.layout.package_dir("pkg").exists());
}

#[tokio::test]
async fn test_uninstall_leaves_other_packages_alone() {
    let env = TestEnvironment::new();
    install(&env, "alpha", "1.0", "a", "").await;
    install(&env, "beta", "1.0", "b", "").await;
    unix_fs::symlink("/usr/bin/env", env.layout.bin_entry("env")).unwrap();

    env.installer().uninstall("alpha", false).await.unwrap();

    assert_eq!(env.run("beta"), "b");
    assert!(fs::symlink_metadata(env.layout.bin_entry("env")).is_ok());
}

#[tokio::test]
async fn test_uninstall_unknown_package() {
    let env = TestEnvironment::new();
    let err = env.installer().uninstall("ghost", false).await.unwrap_err();
    assert!(matches!(err, KegError::NotInstalled(ref name) if name == "ghost"));
}

#[tokio::test]
async fn test_uninstall_refuses_shared_runtime_in_use() {
    let env = TestEnvironment::new();
    install(&env, "python", "3.13.1", "py", "").await;
    install(
        &env,
        "tool",
        "1.0",
        "tool",
        r#""dependencies": [ { "name": "python" } ],
  "linkage": { "strategy": "env_injected", "vars": { "PYTHONHOME": "@@DEP:python@@" } },"#,
    )
    .await;

    let err = env.installer().uninstall("python", false).await.unwrap_err();
    match &err {
        KegError::InUse { name, dependents } => {
            assert_eq!(name, "python");
            assert_eq!(dependents, &vec!["tool".to_string()]);
        }
        other => panic!("expected in-use error, got {:?}", other),
    }
    assert_eq!(err.to_string(), "Cannot uninstall python - required by: tool");
    assert!(env.layout.keg_path("python", "3.13.1").exists());

    env.installer().uninstall("python", true).await.unwrap();
    assert!(!env.layout.keg_path("python", "3.13.1").exists());
}

#[tokio::test]
async fn test_uninstall_checks_the_keg_a_hint_resolved_to() {
    let env = TestEnvironment::new();
    install(&env, "python@3.13", "3.13.1", "py313", "").await;
    install(&env, "python", "3.12.0", "py312", "").await;
    install(
        &env,
        "tool",
        "1.0",
        "tool",
        r#""dependencies": [ { "name": "python", "hint": "python@3.13" } ],
  "linkage": { "strategy": "env_injected", "vars": { "PYTHONHOME": "@@DEP:python@@" } },"#,
    )
    .await;

    let err = env.installer().uninstall("python@3.13", false).await.unwrap_err();
    match &err {
        KegError::InUse { name, dependents } => {
            assert_eq!(name, "python@3.13");
            assert_eq!(dependents, &vec!["tool".to_string()]);
        }
        other => panic!("expected in-use error, got {:?}", other),
    }
    assert!(env.layout.keg_path("python@3.13", "3.13.1").exists());

    // Nothing resolved to the unversioned runtime.
    env.installer().uninstall("python", false).await.unwrap();
    assert_eq!(env.run("tool"), "tool");
}

#[tokio::test]
async fn test_cleanup_keeps_runtime_still_in_use() {
    let env = TestEnvironment::new();
    install(&env, "python", "3.13.1", "py1", "").await;
    install(
        &env,
        "tool",
        "1.0",
        "tool",
        r#""dependencies": [ { "name": "python" } ],
  "linkage": { "strategy": "env_injected", "vars": { "PYTHONHOME": "@@DEP:python@@" } },"#,
    )
    .await;
    install(&env, "python", "3.13.2", "py2", "").await;

    let report = env.installer().cleanup(Some("python")).await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.pinned, vec!["python/3.13.1"]);
    assert!(env.layout.keg_path("python", "3.13.1").exists());
}

#[tokio::test]
async fn test_cleanup_keeps_active_version() {
    let env = TestEnvironment::new();
    install(&env, "pkg", "1.0", "one", "").await;
    install(&env, "pkg", "2.0", "two", "").await;
    install(&env, "pkg", "3.0", "three", "").await;
    env.installer().activate("pkg", "2.0").await.unwrap();

    let report = env.installer().cleanup(None).await.unwrap();

    let mut removed = report.removed.clone();
    removed.sort();
    assert_eq!(removed, vec!["pkg/1.0", "pkg/3.0"]);
    assert!(report.bytes_freed > 0);
    assert!(report.errors.is_empty());
    assert!(env.layout.keg_path("pkg", "2.0").exists());
    assert_eq!(env.run("pkg"), "two");
}

#[tokio::test]
async fn test_cleanup_single_package() {
    let env = TestEnvironment::new();
    install(&env, "alpha", "1.0", "a", "").await;
    install(&env, "alpha", "2.0", "a2", "").await;
    install(&env, "beta", "1.0", "b", "").await;
    install(&env, "beta", "2.0", "b2", "").await;

    let report = env.installer().cleanup(Some("alpha")).await.unwrap();
    assert_eq!(report.removed, vec!["alpha/1.0"]);
    assert!(env.layout.keg_path("beta", "1.0").exists());

    let err = env.installer().cleanup(Some("ghost")).await.unwrap_err();
    assert!(matches!(err, KegError::NotInstalled(_)));
}

#[tokio::test]
async fn test_list_reports_active_versions() {
    let env = TestEnvironment::new();
    install(&env, "beta", "1.0", "b", "").await;
    install(&env, "alpha", "1.0", "a", "").await;
    install(&env, "alpha", "1.1", "a", "").await;

    let listed = env.installer().list().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].name, "alpha");
    assert_eq!(listed[0].versions, vec!["1.1", "1.0"]);
    assert_eq!(listed[0].active.as_deref(), Some("1.1"));
    assert_eq!(listed[1].name, "beta");
}

#[tokio::test]
async fn test_smoke_test_runs_active_command() {
    let env = TestEnvironment::new();
    install(&env, "pkg", "1.0", "pkg-ok", "").await;

    let report = env.installer().test("pkg").await.unwrap();
    assert!(report.success);
    assert_eq!(report.command, "pkg --version");
    assert_eq!(report.stdout.trim(), "pkg-ok");
}

#[tokio::test]
async fn test_smoke_test_reports_failure() {
    let env = TestEnvironment::new();
    let tarball = test_helpers::tar_gz(&[("bad-1.0/bad", b"#!/bin/sh\nexit 3\n", 0o755)]);
    let (url, sha) = env.publish("bad-1.0.tar.gz", &tarball);
    env.installer()
        .install(&env.manifest("bad", "1.0", &url, &sha, ""), &TestEnvironment::platform())
        .await
        .unwrap();

    let report = env.installer().test("bad").await.unwrap();
    assert!(!report.success);
    assert_eq!(report.exit_code, Some(3));
}

#[tokio::test]
async fn test_new_version_drops_removed_commands() {
    let env = TestEnvironment::new();
    let tarball = test_helpers::tar_gz(&[
        ("multi-1.0/multi", b"#!/bin/sh\necho m\n", 0o755),
        ("multi-1.0/multi-extra", b"#!/bin/sh\necho x\n", 0o755),
    ]);
    let (url, sha) = env.publish("multi-1.0.tar.gz", &tarball);
    let json = format!(
        r#"{{
  "name": "multi", "version": "1.0",
  "variants": [ {{ "os": "macos", "arch": "arm64", "url": "{url}", "sha256": "{sha}" }} ],
  "install": [
    {{ "op": "extract", "strip_components": 1 }},
    {{ "op": "command", "name": "multi", "target": "multi" }},
    {{ "op": "command", "name": "multi-extra", "target": "multi-extra" }}
  ]
}}"#
    );
    let v1 = kegger::PackageManifest::from_json(&json, "multi.json").unwrap();
    env.installer().install(&v1, &TestEnvironment::platform()).await.unwrap();
    assert_eq!(env.run("multi-extra"), "x");

    install(&env, "multi", "2.0", "m2", "").await;
    assert_eq!(env.run("multi"), "m2");
    assert!(fs::symlink_metadata(env.layout.bin_entry("multi-extra")).is_err());
}
