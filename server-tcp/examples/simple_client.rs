use bytes::Bytes;
use hoard::domain::MergeDecision;
use hoard::{CacheOperations, ObjectCache};
use server_tcp::RemoteStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let remote = RemoteStore::connect("127.0.0.1:5500").await?;
    println!("Connected to server at {}", remote.peer_addr());

    println!("\n=== Testing PING ===");
    let cas = remote.ping().await?;
    println!("Response: Pong (server supports CAS: {})", cas);

    let cache = ObjectCache::new(Arc::new(remote));

    println!("\n=== Testing SET / GET ===");
    cache.set("hello", Bytes::from("world"), 300).await?;
    let value = cache.get("hello").await?;
    println!("Value: {:?}", value.map(|v| String::from_utf8_lossy(&v).to_string()));

    println!("\n=== Testing MERGE ===");
    let mut append = |_key: &str, current: Option<&Bytes>| {
        let mut next = current.map(|v| v.to_vec()).unwrap_or_default();
        next.extend_from_slice(b"!");
        MergeDecision::Replace(Bytes::from(next))
    };
    let merged = cache.merge("hello", &mut append, 300, 10).await?;
    println!("Merged: {}, value: {:?}", merged, cache.get("hello").await?);

    println!("\n=== Testing INCR ===");
    cache.set("visits", Bytes::from("0"), 0).await?;
    for _ in 0..3 {
        println!("visits = {:?}", cache.incr("visits", 1).await?);
    }

    println!("\n=== Testing DELETE ===");
    cache.delete("hello").await?;
    println!("After delete: {:?}", cache.get("hello").await?);

    println!("\nAll operations completed");
    Ok(())
}
