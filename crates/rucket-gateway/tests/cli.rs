//! End-to-end tests of the `rucket-gateway` binary.

use std::process::{Command, Output};

use rucket_cluster::{FileMetaStore, MetaStoreExt};
use rucket_core::meta::{ClusterMap, RebalanceMetadata};
use rucket_core::NodeDescriptor;
use tempfile::TempDir;

fn gateway(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rucket-gateway"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("RUCKET_PRIMARY_ID")
        .env_remove("RUCKET_IS_PRIMARY")
        .output()
        .expect("failed to run rucket-gateway")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}

#[test]
fn test_version() {
    let output = gateway(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("rucket-gateway "));
}

#[test]
fn test_show_meta_prints_persisted_documents() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileMetaStore::open(temp_dir.path()).unwrap();

    let mut map = ClusterMap::with_primary(NodeDescriptor::proxy(
        "p1",
        "http://p1:9080",
        "http://p1:8080",
    ));
    map.add_node(NodeDescriptor::target("t1", "http://t1:9080", "http://t1:8080"));
    map.version = 3;
    store.save(&map).unwrap();
    store.save(&RebalanceMetadata { version: 12, enabled: true, interrupted: true }).unwrap();

    let docs = stdout_json(&gateway(&["show-meta", "--data-dir", temp_dir.path().to_str().unwrap()]));

    assert_eq!(docs["cluster_map"]["version"], 3);
    assert!(docs["cluster_map"]["targets"]["t1"].is_object());
    assert_eq!(docs["rebalance_md"]["version"], 12);
    assert_eq!(docs["rebalance_md"]["interrupted"], true);
    assert!(docs["bucket_md"].is_null());
    assert!(docs["global_config"].is_null());
}

#[test]
fn test_show_meta_missing_directory_fails() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope");

    let output = gateway(&["show-meta", "--data-dir", missing.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(!missing.exists());
}

#[test]
fn test_simulate_forms_cluster() {
    let map = stdout_json(&gateway(&[
        "simulate",
        "--proxies",
        "2",
        "--targets",
        "3",
        "--startup-ms",
        "1000",
    ]));

    assert!(map["version"].as_i64().unwrap() > 0);
    assert!(map["uuid"].is_string());
    assert_eq!(map["primary"]["id"], "p1");
    assert_eq!(map["proxies"].as_object().unwrap().len(), 2);
    assert_eq!(map["targets"].as_object().unwrap().len(), 3);
}
