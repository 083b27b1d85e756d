//! End-to-end cache behavior against a stubbed upstream.

use std::sync::Arc;

use serde_json::json;
use vetrina::cache::{ListingsCache, keys};
use vetrina::config::Settings;
use vetrina::domain::error::GatewayError;
use vetrina::domain::listings::ImageSlot;
use vetrina::infra::kv::{self, KeyValueStore, MemoryStore};
use vetrina::infra::upstream::{ConditionalFetchClient, FetchOutcome};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn listings_body() -> serde_json::Value {
    json!([
        {
            "propref": "P1",
            "displayaddress": "1 Harbour Lane",
            "displayprice": "£1,500 pcm",
            "beds": 2,
            "photo1binary": "bWFpbi1vbmU=",
            "photo2binary": "c2Vjb25kLW9uZQ==",
            "floorplanbinary": "cGxhbi1vbmU="
        },
        {
            "propref": 202,
            "displayaddress": "2 Station Road",
            "displayprice": "£900 pcm",
            "beds": 1,
            "photo1binary": "bWFpbi10d28="
        }
    ])
}

async fn cache_against(server: &MockServer) -> (ListingsCache, Arc<dyn KeyValueStore>) {
    let mut settings = Settings::default();
    settings.upstream.base_url = server.uri();
    settings.upstream.api_token = "test-token".to_string();

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let client = ConditionalFetchClient::new(
        settings.upstream.clone(),
        settings.cache.clone(),
        Arc::clone(&store),
    )
    .expect("client");
    (
        ListingsCache::new(Arc::clone(&store), Arc::new(client), settings.cache),
        store,
    )
}

#[tokio::test]
async fn concurrent_fetch_all_issues_one_upstream_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/propertyadvertising.php"))
        .and(query_param("token", "test-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(std::time::Duration::from_millis(50))
                .set_body_json(listings_body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (cache, _) = cache_against(&server).await;

    let (a, b, c, d, e) = tokio::join!(
        cache.fetch_all(),
        cache.fetch_all(),
        cache.fetch_all(),
        cache.fetch_all(),
        cache.fetch_all(),
    );

    let first = a.expect("shared fetch");
    for other in [b, c, d, e] {
        assert_eq!(first, other.expect("shared fetch"));
    }
    assert_eq!(first.len(), 2);
    assert_eq!(first.records[1].id, "202", "numeric proprefs normalize");
}

#[tokio::test]
async fn concurrent_fetch_all_shares_one_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/propertyadvertising.php"))
        .respond_with(
            ResponseTemplate::new(503).set_delay(std::time::Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (cache, _) = cache_against(&server).await;

    let (a, b, c) = tokio::join!(cache.fetch_all(), cache.fetch_all(), cache.fetch_all());

    let first = a.expect_err("upstream down");
    assert!(matches!(first, GatewayError::UpstreamUnavailable { .. }));
    assert_eq!(first, b.expect_err("same shared failure"));
    assert_eq!(first, c.expect_err("same shared failure"));
}

#[tokio::test]
async fn snapshot_is_split_and_reconstructed_on_the_next_read() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/propertyadvertising.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listings_body()))
        .expect(1)
        .mount(&server)
        .await;

    let (cache, store) = cache_against(&server).await;

    cache.fetch_all().await.expect("cold fetch");

    // The split write stored slots under their own keys.
    let main = store
        .get(&keys::image("P1", ImageSlot::Photo(1)))
        .await
        .expect("store read");
    assert_eq!(main.as_deref(), Some(&b"bWFpbi1vbmU="[..]));

    // Second read: no upstream call (expect(1) above), images recombined.
    let warm = cache.fetch_all().await.expect("warm fetch");
    let record = warm.find("P1").expect("record present");
    assert_eq!(record.images.get(ImageSlot::Photo(1)), Some("bWFpbi1vbmU="));
    assert_eq!(record.images.get(ImageSlot::FloorPlan), Some("cGxhbi1vbmU="));
    let report = record.image_report.expect("report attached");
    assert_eq!(report.loaded, 3);
    assert_eq!(report.missing, 0);
}

#[tokio::test]
async fn fresh_snapshot_carries_persisted_featured_flags() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/propertyadvertising.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listings_body()))
        .mount(&server)
        .await;

    let (cache, store) = cache_against(&server).await;
    kv::put_json(&*store, keys::FEATURED_IDS, &vec!["P1".to_string()], None)
        .await
        .expect("seed featured ids");

    let snapshot = cache.fetch_all().await.expect("fetch");
    assert!(snapshot.find("P1").expect("P1").featured);
    assert!(!snapshot.find("202").expect("202").featured);
}

#[tokio::test]
async fn fetch_one_falls_back_to_upstream_and_reports_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/propertyadvertising.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listings_body()))
        .mount(&server)
        .await;

    let (cache, _) = cache_against(&server).await;

    let record = cache.fetch_one("P1").await.expect("found after fetch");
    assert_eq!(record.id, "P1");

    let missing = cache.fetch_one("NOPE").await.expect_err("absent id");
    assert_eq!(missing, GatewayError::not_found("NOPE"));
}

#[tokio::test]
async fn etag_is_stored_and_replayed_as_if_none_match() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/propertyadvertising.php"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/propertyadvertising.php"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"v1\"")
                .set_body_json(listings_body()),
        )
        .mount(&server)
        .await;

    let mut settings = Settings::default();
    settings.upstream.base_url = server.uri();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let client = ConditionalFetchClient::new(
        settings.upstream.clone(),
        settings.cache.clone(),
        Arc::clone(&store),
    )
    .expect("client");

    // First fetch is unconditional and stores the validator.
    let first = client.fetch_listings().await.expect("first fetch");
    assert!(matches!(first, FetchOutcome::Fresh(_)));
    let stored = store
        .get(&keys::etag("properties"))
        .await
        .expect("etag readable")
        .expect("etag stored");
    assert_eq!(&stored[..], &b"\"v1\""[..]);

    // Second fetch carries If-None-Match and short-circuits on 304; the
    // caller keeps using its own copy, and no new validator is written.
    let second = client.fetch_listings().await.expect("second fetch");
    assert!(matches!(second, FetchOutcome::NotModified));
    let unchanged = store
        .get(&keys::etag("properties"))
        .await
        .expect("etag readable")
        .expect("etag still present");
    assert_eq!(&unchanged[..], &b"\"v1\""[..]);
}

#[tokio::test]
async fn not_modified_without_cached_copy_is_inconsistent_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/propertyadvertising.php"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let (cache, store) = cache_against(&server).await;

    // A validator survives from an earlier fetch whose data TTL expired.
    store
        .put(
            &keys::etag("properties"),
            bytes::Bytes::from_static(b"\"stale\""),
            None,
        )
        .await
        .expect("seed etag");

    let err = cache.fetch_all().await.expect_err("no cached copy to serve");
    assert!(matches!(err, GatewayError::InconsistentState { .. }));
}

#[tokio::test]
async fn media_list_is_cached_after_first_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/propertymedia.php"))
        .and(query_param("propref", "P1"))
        .and(header("token", "test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"filename": "front.jpg", "base64data": "QQ==", "imgorder": "1"},
            {"filename": "plan.png", "base64data": "Qg==", "imgorder": "FP"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let (cache, _) = cache_against(&server).await;

    let first = cache.media_list("P1").await.expect("first fetch");
    assert_eq!(first.len(), 2);
    assert_eq!(first[1].order_hint.as_deref(), Some("FP"));

    let second = cache.media_list("P1").await.expect("cached fetch");
    assert_eq!(first, second);
}
