//! End-to-end tests against a real server bound to an ephemeral port

use elohim_files::framing::decode_frames;
use elohim_files::{
    CachedFileProvider, Catalog, ContentHash, ContentStore, HttpOrigin, HttpServer, MemoryCatalog, Metrics,
    NoOrigin, Origin, QueueConfig, RequestQueue, TouchPropagator,
};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

const TOKEN: &str = "node-secret";

struct TestNode {
    base: String,
    store: ContentStore,
    catalog: Arc<MemoryCatalog>,
    _temp: TempDir,
}

struct NodeOptions {
    max_concurrent: usize,
    token: Option<String>,
    origin: Option<Arc<dyn Origin>>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            token: Some(TOKEN.to_string()),
            origin: None,
        }
    }
}

async fn start_node(options: NodeOptions) -> TestNode {
    let temp = TempDir::new().unwrap();
    let store = ContentStore::new(temp.path().join("hot"), None, 40).await.unwrap();
    let metrics = Arc::new(Metrics::new());
    let catalog = Arc::new(MemoryCatalog::new());
    let touch = Arc::new(TouchPropagator::disabled(metrics.clone()));
    let origin = options.origin.unwrap_or_else(|| Arc::new(NoOrigin) as Arc<dyn Origin>);
    let provider = Arc::new(CachedFileProvider::new(store.clone(), origin, touch.clone(), metrics.clone()));
    let queue = Arc::new(RequestQueue::new(
        QueueConfig {
            max_concurrent: options.max_concurrent,
            ..QueueConfig::default()
        },
        metrics.clone(),
    ));

    let server = Arc::new(
        HttpServer::new(provider, queue, touch, metrics)
            .with_catalog(catalog.clone())
            .with_internal_token(options.token),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(server.serve(listener));

    TestNode {
        base,
        store,
        catalog,
        _temp: temp,
    }
}

fn hash(c: char) -> ContentHash {
    ContentHash::parse(&c.to_string().repeat(40), 40).unwrap()
}

async fn enqueue(client: &reqwest::Client, node: &TestNode, caller: &str, hashes: &[ContentHash]) -> String {
    let response = client
        .post(format!("{}/request/enqueue", node.base))
        .header("x-caller-id", caller)
        .json(hashes)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    body["request_id"].as_str().unwrap().to_string()
}

async fn check(client: &reqwest::Client, node: &TestNode, caller: &str, id: &str) -> StatusCode {
    client
        .get(format!("{}/request/check/{}", node.base, id))
        .header("x-caller-id", caller)
        .send()
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_batch_download_round_trip() {
    let node = start_node(NodeOptions::default()).await;
    node.store.hot().write(&hash('a'), b"AB").await.unwrap();
    node.store.hot().write(&hash('c'), b"CDE").await.unwrap();
    let client = reqwest::Client::new();

    let id = enqueue(&client, &node, "alice", &[hash('a'), hash('b'), hash('c')]).await;
    assert_eq!(check(&client, &node, "alice", &id).await, StatusCode::OK);

    let response = client
        .get(format!("{}/cache/{}", node.base, id))
        .header("x-caller-id", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.bytes().await.unwrap();

    let expected = format!("#{}:2#AB#{}:3#CDE", hash('a'), hash('c'));
    assert_eq!(&body[..], expected.as_bytes());
    let frames = decode_frames(&body).unwrap();
    assert_eq!(frames.len(), 2);

    // The request is spent
    let replay = client
        .get(format!("{}/cache/{}", node.base, id))
        .header("x-caller-id", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    assert!(replay.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_requests_are_scoped_to_their_owner() {
    let node = start_node(NodeOptions::default()).await;
    let client = reqwest::Client::new();
    let id = enqueue(&client, &node, "alice", &[hash('a')]).await;

    assert_eq!(check(&client, &node, "mallory", &id).await, StatusCode::BAD_REQUEST);
    assert_eq!(check(&client, &node, "alice", &id).await, StatusCode::OK);

    let stolen = client
        .get(format!("{}/cache/{}", node.base, id))
        .header("x-caller-id", "mallory")
        .send()
        .await
        .unwrap();
    assert_eq!(stolen.status(), StatusCode::BAD_REQUEST);

    let anonymous = client.get(format!("{}/cache/{}", node.base, id)).send().await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(check(&client, &node, "alice", "not-a-request").await, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_hash_rejected_on_enqueue() {
    let node = start_node(NodeOptions::default()).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/request/enqueue", node.base))
        .header("x-caller-id", "alice")
        .json(&["not-hex"])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_slots_are_released_after_download() {
    let node = start_node(NodeOptions {
        max_concurrent: 1,
        ..NodeOptions::default()
    })
    .await;
    node.store.hot().write(&hash('a'), b"data").await.unwrap();
    let client = reqwest::Client::new();

    let first = enqueue(&client, &node, "alice", &[hash('a')]).await;
    let second = enqueue(&client, &node, "bob", &[hash('a')]).await;
    assert_eq!(check(&client, &node, "alice", &first).await, StatusCode::OK);
    assert_eq!(check(&client, &node, "bob", &second).await, StatusCode::ACCEPTED);

    let body = client
        .get(format!("{}/cache/{}", node.base, first))
        .header("x-caller-id", "alice")
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(decode_frames(&body).unwrap().len(), 1);

    // The slot is returned once the server drops the finished body
    let mut status = StatusCode::ACCEPTED;
    for _ in 0..50 {
        status = check(&client, &node, "bob", &second).await;
        if status == StatusCode::OK {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cancel_frees_slot() {
    let node = start_node(NodeOptions {
        max_concurrent: 1,
        ..NodeOptions::default()
    })
    .await;
    let client = reqwest::Client::new();

    let first = enqueue(&client, &node, "alice", &[hash('a')]).await;
    let second = enqueue(&client, &node, "bob", &[hash('a')]).await;
    assert_eq!(check(&client, &node, "alice", &first).await, StatusCode::OK);

    let cancelled = client
        .post(format!("{}/request/cancel/{}", node.base, first))
        .header("x-caller-id", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(cancelled.status(), StatusCode::OK);
    assert_eq!(check(&client, &node, "bob", &second).await, StatusCode::OK);
    assert_eq!(check(&client, &node, "alice", &first).await, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_internal_api_requires_token() {
    let node = start_node(NodeOptions::default()).await;
    let client = reqwest::Client::new();
    let url = format!("{}/dist/{}", node.base, hash('d'));

    let anonymous = client.put(&url).body("payload").send().await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let stored = client.put(&url).bearer_auth(TOKEN).body("payload").send().await.unwrap();
    assert_eq!(stored.status(), StatusCode::CREATED);
    assert!(node.catalog.contains(&hash('d')).await.unwrap());

    let fetched = client.get(&url).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);
    assert_eq!(&fetched.bytes().await.unwrap()[..], b"payload");

    let missing = client
        .get(format!("{}/dist/{}", node.base, hash('e')))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let touched = client
        .post(format!("{}/dist/touch", node.base))
        .bearer_auth(TOKEN)
        .json(&Vec::<String>::new())
        .send()
        .await
        .unwrap();
    assert_eq!(touched.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_internal_api_disabled_without_token() {
    let node = start_node(NodeOptions {
        token: None,
        ..NodeOptions::default()
    })
    .await;
    let response = reqwest::Client::new()
        .get(format!("{}/dist/{}", node.base, hash('a')))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_shard_pulls_misses_from_main() {
    let main = start_node(NodeOptions::default()).await;
    let client = reqwest::Client::new();
    let uploaded = client
        .put(format!("{}/dist/{}", main.base, hash('f')))
        .bearer_auth(TOKEN)
        .body("from main")
        .send()
        .await
        .unwrap();
    assert_eq!(uploaded.status(), StatusCode::CREATED);

    let origin: Arc<dyn Origin> = Arc::new(HttpOrigin::new(main.base.clone(), Some(TOKEN.to_string())).unwrap());
    let shard = start_node(NodeOptions {
        origin: Some(origin),
        ..NodeOptions::default()
    })
    .await;

    let id = enqueue(&client, &shard, "alice", &[hash('f')]).await;
    assert_eq!(check(&client, &shard, "alice", &id).await, StatusCode::OK);
    let body = client
        .get(format!("{}/cache/{}", shard.base, id))
        .header("x-caller-id", "alice")
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    let frames = decode_frames(&body).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].1[..], b"from main");
    assert!(shard.store.hot().exists(&hash('f')).await);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let node = start_node(NodeOptions::default()).await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", node.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    enqueue(&client, &node, "alice", &[hash('a')]).await;
    let metrics: serde_json::Value = client
        .get(format!("{}/metrics", node.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["gauges"]["queued_requests"], 1);
}
