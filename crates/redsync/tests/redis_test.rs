// Integration tests against live Redis servers
// Run with: REDSYNC_TEST_NODES=redis://a/,redis://b/ cargo test -- --ignored

use std::sync::Arc;
use std::time::Duration;

use redsync::{LockNode, MutexOptions, NodeRef, RedisNode, Redsync};

fn test_urls() -> Vec<String> {
    std::env::var("REDSYNC_TEST_NODES")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

async fn connect_all() -> Vec<Arc<RedisNode>> {
    let mut nodes = Vec::new();
    for url in test_urls() {
        nodes.push(Arc::new(RedisNode::connect(&url).await.unwrap()));
    }
    nodes
}

fn factory(nodes: &[Arc<RedisNode>]) -> Redsync {
    Redsync::new(nodes.iter().map(|n| n.clone() as NodeRef).collect()).unwrap()
}

fn unique_key(prefix: &str) -> String {
    format!("redsync-test-{}-{}", prefix, std::process::id())
}

#[tokio::test]
#[ignore = "requires running redis nodes"]
async fn test_primitives() {
    let node = connect_all().await.remove(0);
    let key = unique_key("primitives");
    let ttl = Duration::from_secs(5);

    assert!(node.try_acquire(&key, "owner", ttl).await.unwrap());
    assert!(!node.try_acquire(&key, "other", ttl).await.unwrap());

    assert!(!node.try_extend(&key, "other", ttl).await.unwrap());
    assert!(node.try_extend(&key, "owner", ttl).await.unwrap());

    assert!(!node.try_release(&key, "other").await.unwrap());
    assert!(node.try_release(&key, "owner").await.unwrap());
    assert!(!node.try_release(&key, "owner").await.unwrap());
}

#[tokio::test]
#[ignore = "requires running redis nodes"]
async fn test_lock_unlock() {
    let nodes = connect_all().await;
    let rs = factory(&nodes);
    let key = unique_key("lock");

    let mut mutex = rs.new_mutex(&key, MutexOptions::non_blocking());
    mutex.lock().await.unwrap();

    let mut rival = rs.new_mutex(&key, MutexOptions::non_blocking());
    assert!(rival.lock().await.unwrap_err().is_contention());

    assert!(mutex.extend().await);
    assert!(mutex.unlock().await);

    rival.lock().await.unwrap();
    assert!(rival.unlock().await);
}

#[tokio::test]
#[ignore = "requires running redis nodes"]
async fn test_lease_expires() {
    let nodes = connect_all().await;
    let rs = factory(&nodes);
    let key = unique_key("expiry");
    let opts = MutexOptions::non_blocking().with_expiry(Duration::from_millis(200));

    let mut first = rs.new_mutex(&key, opts.clone());
    first.lock().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut second = rs.new_mutex(&key, opts);
    second.lock().await.unwrap();
    assert!(!first.unlock().await);
    assert!(second.unlock().await);
}

#[tokio::test]
#[ignore = "requires running redis nodes"]
async fn test_unreachable_node() {
    let err = RedisNode::connect("redis://127.0.0.1:1/").await;
    assert!(err.is_err());
}
