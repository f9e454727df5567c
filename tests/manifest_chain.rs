mod support;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flashhub_lib::events::{CollectingSink, CoreEvent};
use flashhub_lib::manifest::{ManifestResolver, ManifestSource, ManifestSources, RetryPolicy};
use support::{scratch_dir, FakeFetcher};

const PRIMARY: &str = "https://cdn.example.com/firmware_manifest.json";
const MIRROR: &str = "https://mirror.example.com/firmware_manifest.json";

const PRIMARY_DOC: &str = r#"{"product_list":[{"id":"primary"}],"firmware_list":[]}"#;
const MIRROR_DOC: &str = r#"{"product_list":[{"id":"mirror"}],"firmware_list":[{"name":"fw"}]}"#;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        attempt_timeout: Duration::from_millis(200),
        backoff_unit: Duration::from_millis(1),
    }
}

fn build(root: &Path, fetcher: Arc<FakeFetcher>, fallbacks: Vec<PathBuf>) -> (ManifestResolver, Arc<CollectingSink>) {
    build_with(root, fetcher, fallbacks, fast_retry())
}

fn build_with(
    root: &Path,
    fetcher: Arc<FakeFetcher>,
    fallbacks: Vec<PathBuf>,
    retry: RetryPolicy,
) -> (ManifestResolver, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let sources = ManifestSources {
        primary_url: PRIMARY.to_string(),
        mirrors: vec![MIRROR.to_string()],
        bundled: root.join("firmware_manifest.json"),
        fallbacks,
    };
    let resolver = ManifestResolver::new(fetcher, sources, sink.clone(), root.join("user/preferences.json"))
        .with_retry_policy(retry);
    (resolver, sink)
}

fn first_product(doc: &flashhub_lib::manifest::ManifestDocument) -> String {
    doc.product_list[0]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn valid_custom_file_short_circuits_network() {
    let root = scratch_dir("manifest_custom");
    let custom = root.join("custom.json");
    std::fs::write(&custom, r#"{"product_list":[{"id":"custom"}],"firmware_list":[]}"#).unwrap();

    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond(PRIMARY, 200, PRIMARY_DOC);
    let (resolver, sink) = build(&root, fetcher.clone(), vec![]);

    resolver.set_custom_manifest(&custom).await.unwrap();
    let resolved = resolver.get_resolved().await;

    assert_eq!(first_product(&resolved.document), "custom");
    assert_eq!(resolved.source, ManifestSource::Custom { path: custom.clone() });
    assert!(fetcher.calls().is_empty());
    assert!(sink.events().contains(&CoreEvent::ManifestSourceChanged {
        custom_path: Some(custom.to_string_lossy().into_owned())
    }));
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn primary_failing_three_times_falls_over_to_mirror() {
    let root = scratch_dir("manifest_mirror");
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond(PRIMARY, 500, "oops");
    fetcher.respond(MIRROR, 200, MIRROR_DOC);
    let (resolver, _sink) = build(&root, fetcher.clone(), vec![]);

    let resolved = resolver.get_resolved().await;

    assert_eq!(first_product(&resolved.document), "mirror");
    assert_eq!(fetcher.calls_to(PRIMARY), 3);
    assert_eq!(fetcher.calls_to(MIRROR), 1);
    assert_eq!(fetcher.calls(), vec![PRIMARY, PRIMARY, PRIMARY, MIRROR]);
    assert!(matches!(resolved.source, ManifestSource::Network { ref url, .. } if url == MIRROR));
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn invalid_json_counts_as_failed_attempt() {
    let root = scratch_dir("manifest_badjson");
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond(PRIMARY, 200, "<html>maintenance</html>");
    fetcher.respond(PRIMARY, 200, PRIMARY_DOC);
    let (resolver, _sink) = build(&root, fetcher.clone(), vec![]);

    let doc = resolver.get_manifest().await;
    assert_eq!(first_product(&doc), "primary");
    assert_eq!(fetcher.calls_to(PRIMARY), 2);
    assert_eq!(fetcher.calls_to(MIRROR), 0);
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn successful_resolution_is_cached() {
    let root = scratch_dir("manifest_cache");
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond(PRIMARY, 200, PRIMARY_DOC);
    let (resolver, _sink) = build(&root, fetcher.clone(), vec![]);

    resolver.get_manifest().await;
    resolver.get_manifest().await;
    assert_eq!(fetcher.calls_to(PRIMARY), 1);
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn unreadable_custom_file_falls_through_to_bundled() {
    let root = scratch_dir("manifest_bundled");
    let custom = root.join("custom.json");
    std::fs::write(&custom, r#"{"product_list":[],"firmware_list":[]}"#).unwrap();
    std::fs::write(root.join("firmware_manifest.json"), r#"{"product_list":[{"id":"bundled"}]}"#).unwrap();

    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond(PRIMARY, 503, "");
    fetcher.respond(MIRROR, 503, "");
    let (resolver, _sink) = build(&root, fetcher.clone(), vec![]);

    resolver.set_custom_manifest(&custom).await.unwrap();
    std::fs::write(&custom, "{ corrupted").unwrap();

    let resolved = resolver.get_resolved().await;
    assert_eq!(first_product(&resolved.document), "bundled");
    assert!(matches!(resolved.source, ManifestSource::Bundled { .. }));
    assert_eq!(fetcher.calls().len(), 6);
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn fallback_paths_then_empty_catalog() {
    let root = scratch_dir("manifest_fallback");
    let missing = root.join("nowhere.json");
    let fallback = root.join("parent_manifest.json");
    std::fs::write(&fallback, r#"{"product_list":[{"id":"fallback"}],"firmware_list":[]}"#).unwrap();

    let fetcher = Arc::new(FakeFetcher::new());
    let (resolver, _sink) = build(&root, fetcher.clone(), vec![missing.clone(), fallback.clone()]);
    let resolved = resolver.resolve().await;
    assert_eq!(first_product(&resolved.document), "fallback");
    assert_eq!(resolved.source, ManifestSource::Fallback { path: fallback.clone() });

    std::fs::remove_file(&fallback).unwrap();
    let (resolver, _sink) = build(&root, fetcher, vec![root.join("also-missing.json")]);
    let empty = resolver.get_manifest().await;
    assert!(empty.is_empty());
    assert_eq!(
        serde_json::to_value(&empty).unwrap(),
        serde_json::json!({"product_list": [], "firmware_list": []})
    );
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn clearing_custom_manifest_restores_network_tier() {
    let root = scratch_dir("manifest_clear");
    let custom = root.join("custom.json");
    std::fs::write(&custom, r#"{"product_list":[{"id":"custom"}],"firmware_list":[]}"#).unwrap();

    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond(PRIMARY, 200, PRIMARY_DOC);
    let (resolver, sink) = build(&root, fetcher.clone(), vec![]);

    resolver.set_custom_manifest(&custom).await.unwrap();
    assert_eq!(first_product(&resolver.get_manifest().await), "custom");

    resolver.clear_custom_manifest().await.unwrap();
    assert_eq!(resolver.custom_manifest_path().await, None);
    assert_eq!(first_product(&resolver.get_manifest().await), "primary");
    assert!(sink
        .events()
        .contains(&CoreEvent::ManifestSourceChanged { custom_path: None }));

    // The choice survives a restart through the preferences file
    resolver.set_custom_manifest(&custom).await.unwrap();
    let (reloaded, _sink) = build(&root, fetcher, vec![]);
    assert_eq!(reloaded.custom_manifest_path().await, Some(custom));
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn invalid_custom_file_is_rejected_on_selection() {
    let root = scratch_dir("manifest_reject");
    let custom = root.join("broken.json");
    std::fs::write(&custom, "not json").unwrap();

    let (resolver, sink) = build(&root, Arc::new(FakeFetcher::new()), vec![]);
    assert!(resolver.set_custom_manifest(&custom).await.is_err());
    assert_eq!(resolver.custom_manifest_path().await, None);
    assert!(sink.events().is_empty());
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn stalled_attempts_time_out_and_fall_over_to_mirror() {
    let root = scratch_dir("manifest_timeout");
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond(PRIMARY, 200, PRIMARY_DOC);
    fetcher.stall(PRIMARY, Duration::from_secs(5));
    fetcher.respond(MIRROR, 200, MIRROR_DOC);
    let retry = RetryPolicy {
        attempts: 3,
        attempt_timeout: Duration::from_millis(100),
        backoff_unit: Duration::from_millis(1),
    };
    let (resolver, _sink) = build_with(&root, fetcher.clone(), vec![], retry);

    let started = Instant::now();
    let resolved = resolver.get_resolved().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(fetcher.calls_to(PRIMARY), 3);
    assert_eq!(fetcher.calls_to(MIRROR), 1);
    assert_eq!(first_product(&resolved.document), "mirror");
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn backoff_grows_per_attempt_and_ends_at_bundled_file() {
    let root = scratch_dir("manifest_backoff");
    std::fs::write(root.join("firmware_manifest.json"), r#"{"product_list":[{"id":"bundled"}]}"#).unwrap();
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond(PRIMARY, 500, "");
    fetcher.respond(MIRROR, 502, "");
    let retry = RetryPolicy {
        attempts: 3,
        attempt_timeout: Duration::from_secs(1),
        backoff_unit: Duration::from_millis(150),
    };
    let (resolver, _sink) = build_with(&root, fetcher.clone(), vec![], retry);

    let started = Instant::now();
    let resolved = resolver.get_resolved().await;
    let elapsed = started.elapsed();

    // 150 ms + 300 ms between the three attempts of each URL, none after the last
    assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
    assert_eq!(fetcher.calls(), vec![PRIMARY, PRIMARY, PRIMARY, MIRROR, MIRROR, MIRROR]);
    assert!(matches!(resolved.source, ManifestSource::Bundled { .. }));
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn changing_custom_file_does_not_wait_for_network() {
    let root = scratch_dir("manifest_inflight");
    let custom = root.join("custom.json");
    std::fs::write(&custom, r#"{"product_list":[{"id":"custom"}],"firmware_list":[]}"#).unwrap();

    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.respond(PRIMARY, 200, PRIMARY_DOC);
    fetcher.stall(PRIMARY, Duration::from_millis(600));
    let retry = RetryPolicy {
        attempts: 1,
        attempt_timeout: Duration::from_secs(5),
        backoff_unit: Duration::from_millis(1),
    };
    let (resolver, _sink) = build_with(&root, fetcher.clone(), vec![], retry);
    let resolver = Arc::new(resolver);

    let in_flight = tokio::spawn({
        let resolver = resolver.clone();
        async move { resolver.get_manifest().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    resolver.set_custom_manifest(&custom).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));

    // The network result finished after the change and must not be cached
    assert_eq!(first_product(&in_flight.await.unwrap()), "primary");
    assert_eq!(first_product(&resolver.get_manifest().await), "custom");
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn preferences_are_read_on_first_use() {
    let root = scratch_dir("manifest_lazy_prefs");
    let custom = root.join("custom.json");
    std::fs::write(&custom, r#"{"product_list":[{"id":"custom"}],"firmware_list":[]}"#).unwrap();

    let (resolver, _sink) = build(&root, Arc::new(FakeFetcher::new()), vec![]);
    std::fs::create_dir_all(root.join("user")).unwrap();
    std::fs::write(
        root.join("user/preferences.json"),
        serde_json::json!({ "custom_manifest_path": custom }).to_string(),
    )
    .unwrap();

    assert_eq!(resolver.custom_manifest_path().await, Some(custom));
    assert_eq!(first_product(&resolver.get_manifest().await), "custom");
    let _ = std::fs::remove_dir_all(&root);
}
