//! End-to-end runs of the download and archive stages.
//!
//! Everything except the last test runs against an in-memory registry:
//!
//! ```bash
//! cargo test --test pipeline
//!
//! # Also pull from Docker Hub:
//! cargo test --test pipeline -- --ignored
//! ```

mod common;

use std::collections::HashSet;
use std::path::Path;

use image_creator::acquire::acquire_images;
use image_creator::cache::{slot_tag, CacheStore};
use image_creator::{run, CacheLocation, Error, OutputTarget, RunConfig};
use image_creator_oci::{Policy, PolicyContext};
use tokio_util::sync::CancellationToken;

use common::{layer, layer_files, read_archive, FakeRegistry, Layer};

fn base() -> Layer {
    layer(&[("etc/os-release", "ID=test"), ("bin/sh", "#!")])
}

fn registry() -> FakeRegistry {
    FakeRegistry::new()
        .with_image("alpine:3.19", &[base(), layer(&[("etc/alpine-release", "3.19.0")])])
        .with_image("busybox:latest", &[layer(&[("bin/busybox", "bb")])])
        .with_image("app:v1", &[base(), layer(&[("app/run", "go")])])
}

fn file_config(dir: &Path, images: &[&str]) -> RunConfig {
    RunConfig::new(
        images.iter().map(|s| s.to_string()).collect(),
        OutputTarget::File(dir.join("out.tar")),
    )
    .with_quiet(true)
}

fn manifest_items(archive: &std::collections::HashMap<String, Vec<u8>>) -> Vec<serde_json::Value> {
    let manifest: serde_json::Value = serde_json::from_slice(&archive["manifest.json"]).unwrap();
    manifest.as_array().unwrap().clone()
}

// ──────────────────────────────────────────────────────────────────────────────
// Archive contents
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_entry_per_image_in_request_order() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry();
    let config = file_config(tmp.path(), &["busybox", "docker://alpine:3.19"]);

    let report = run(&config, &registry, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.images, 2);
    assert_eq!(report.stream_warning, None);

    let archive = read_archive(&tmp.path().join("out.tar"));
    let items = manifest_items(&archive);
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["RepoTags"], serde_json::json!(["busybox:latest"]));
    assert_eq!(items[1]["RepoTags"], serde_json::json!(["alpine:3.19"]));

    let alpine_layers = items[1]["Layers"].as_array().unwrap();
    assert_eq!(alpine_layers.len(), 2);
    let top = &archive[alpine_layers[1].as_str().unwrap()];
    assert_eq!(layer_files(top), vec!["etc/alpine-release"]);

    let repositories: serde_json::Value =
        serde_json::from_slice(&archive["repositories"]).unwrap();
    assert!(repositories["busybox"]["latest"].is_string());
    assert!(repositories["alpine"]["3.19"].is_string());
}

#[tokio::test]
async fn layer_entries_are_named_by_diff_id() {
    let tmp = tempfile::tempdir().unwrap();
    let config = file_config(tmp.path(), &["alpine:3.19"]);
    run(&config, &registry(), &CancellationToken::new())
        .await
        .unwrap();

    let archive = read_archive(&tmp.path().join("out.tar"));
    let item = &manifest_items(&archive)[0];
    let base_name = format!("{}.tar", base().diff_id.trim_start_matches("sha256:"));
    assert_eq!(item["Layers"][0], serde_json::json!(base_name));

    let config_blob: serde_json::Value =
        serde_json::from_slice(&archive[item["Config"].as_str().unwrap()]).unwrap();
    assert_eq!(config_blob["rootfs"]["diff_ids"][0], serde_json::json!(base().diff_id));
}

#[tokio::test]
async fn duplicate_references_share_one_blob_set() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry();
    let config = file_config(tmp.path(), &["alpine:3.19", "alpine:3.19"]);

    let report = run(&config, &registry, &CancellationToken::new())
        .await
        .unwrap();
    // config + two layers pulled once, then all three reused.
    assert_eq!(report.cached.blobs_copied, 3);
    assert_eq!(report.cached.blobs_reused, 3);
    assert_eq!(registry.blob_fetches(), 3);

    let archive = read_archive(&tmp.path().join("out.tar"));
    let items = manifest_items(&archive);
    assert_eq!(items.len(), 2);
    assert_eq!(items[0], items[1]);
    assert_eq!(items[0]["RepoTags"], serde_json::json!(["alpine:3.19"]));
    // config, two layers, manifest.json, repositories
    assert_eq!(archive.len(), 5);
}

// ──────────────────────────────────────────────────────────────────────────────
// Cache behaviour
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn shared_blobs_are_cached_once() {
    let registry = registry();
    let cache = CacheStore::create(&CacheLocation::Temporary).await.unwrap();
    let policy = PolicyContext::new(Policy::accept_anything()).unwrap();
    let images = vec!["alpine:3.19".to_string(), "app:v1".to_string()];

    let summary = acquire_images(
        &images,
        &registry,
        &cache,
        &policy,
        true,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(summary.images, 2);
    assert_eq!(summary.blobs_reused, 1);

    // 2 manifests + 2 configs + base + 2 top layers
    let stats = cache.layout().blob_stats().await.unwrap();
    assert_eq!(stats.count, 7);

    let tags: HashSet<String> = cache
        .layout()
        .read_index()
        .await
        .unwrap()
        .manifests
        .iter()
        .filter_map(|d| d.ref_name().map(str::to_string))
        .collect();
    assert_eq!(tags, HashSet::from([slot_tag(0), slot_tag(1)]));
    cache.destroy().await;
}

#[tokio::test]
async fn failures_are_collected_and_the_rest_cached() {
    let registry = registry();
    let cache = CacheStore::create(&CacheLocation::Temporary).await.unwrap();
    let policy = PolicyContext::new(Policy::accept_anything()).unwrap();
    let images: Vec<String> = ["alpine:3.19", "missing:1", "busybox", "oci:/tmp/x:y"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let err = acquire_images(
        &images,
        &registry,
        &cache,
        &policy,
        true,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    let failures = match err {
        Error::Acquisition { failures } => failures,
        other => panic!("expected acquisition error, got {other}"),
    };
    let failed: Vec<(usize, &str)> = failures
        .iter()
        .map(|f| (f.index, f.reference.as_str()))
        .collect();
    assert_eq!(failed, vec![(1, "missing:1"), (3, "oci:/tmp/x:y")]);

    cache.layout().resolve_tag(&slot_tag(0)).await.unwrap();
    cache.layout().resolve_tag(&slot_tag(2)).await.unwrap();
    assert!(cache.layout().resolve_tag(&slot_tag(1)).await.is_err());
    cache.destroy().await;
}

#[tokio::test]
async fn acquisition_failure_skips_archiving() {
    let tmp = tempfile::tempdir().unwrap();
    let config = file_config(tmp.path(), &["alpine:3.19", "missing:1"]);

    let err = run(&config, &registry(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Acquisition { ref failures } if failures.len() == 1));
    assert!(err.to_string().contains("missing:1"));
    assert!(!tmp.path().join("out.tar").exists());
}

#[tokio::test]
async fn explicit_cache_dir_is_removed_after_run() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    std::fs::create_dir(&cache_dir).unwrap();
    std::fs::write(cache_dir.join("leftover"), b"x").unwrap();

    let config = file_config(tmp.path(), &["busybox"])
        .with_cache(CacheLocation::Explicit(cache_dir.clone()));
    run(&config, &registry(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!cache_dir.exists());

    // Also on failure.
    let config = file_config(tmp.path(), &["missing:1"])
        .with_force(true)
        .with_cache(CacheLocation::Explicit(cache_dir.clone()));
    run(&config, &registry(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(!cache_dir.exists());
}

// ──────────────────────────────────────────────────────────────────────────────
// Destination preconditions
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn existing_output_is_refused_before_any_download() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.tar");
    std::fs::write(&out, b"precious").unwrap();
    let registry = registry();

    let err = run(
        &file_config(tmp.path(), &["busybox"]),
        &registry,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(ref p) if *p == out));
    assert_eq!(registry.opens(), 0);
    assert_eq!(std::fs::read(&out).unwrap(), b"precious");
}

#[tokio::test]
async fn force_replaces_existing_output() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.tar");
    std::fs::write(&out, b"old").unwrap();

    let config = file_config(tmp.path(), &["busybox"]).with_force(true);
    run(&config, &registry(), &CancellationToken::new())
        .await
        .unwrap();

    let archive = read_archive(&out);
    assert_eq!(
        manifest_items(&archive)[0]["RepoTags"],
        serde_json::json!(["busybox:latest"])
    );
    // Only the archive is left next to it.
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn terminal_stdout_is_refused_before_any_download() {
    let registry = registry();
    let config = RunConfig::new(vec!["busybox".to_string()], OutputTarget::Stdout)
        .with_quiet(true)
        .with_stdout_is_terminal(true);

    let err = run(&config, &registry, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TerminalOutput));
    assert_eq!(registry.opens(), 0);
}

#[tokio::test]
async fn cancelled_run_stops_before_downloading() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = run(&file_config(tmp.path(), &["busybox", "alpine:3.19"]), &registry, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(registry.opens(), 0);
    assert!(!tmp.path().join("out.tar").exists());
}

// ──────────────────────────────────────────────────────────────────────────────
// Network
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires network access to Docker Hub"]
async fn pulls_busybox_from_docker_hub() {
    use image_creator_oci::{RegistryClient, RegistryTransport};

    let tmp = tempfile::tempdir().unwrap();
    let transport = RegistryTransport::new(RegistryClient::anonymous().unwrap());
    let config = file_config(tmp.path(), &["busybox:latest"]);

    run(&config, &transport, &CancellationToken::new())
        .await
        .unwrap();

    let archive = read_archive(&tmp.path().join("out.tar"));
    let item = &manifest_items(&archive)[0];
    assert_eq!(item["RepoTags"], serde_json::json!(["busybox:latest"]));
    for layer in item["Layers"].as_array().unwrap() {
        assert!(!layer_files(&archive[layer.as_str().unwrap()]).is_empty());
    }
}
