//! End-to-end throughput benchmark for the relay.
//!
//! Every client adds public records as fast as it can and removes each of its
//! own records as soon as the relay echoes the ADD back, so the store stays
//! small while every client receives every ADD and REMOVE.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Barrier};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("Relay end-to-end throughput benchmark");
    println!("Make sure the server is running: cargo run --release --bin relay");
    println!();

    run_broadcast_benchmark(num_clients).await;
}

async fn run_broadcast_benchmark(num_clients: usize) {
    println!("Broadcast benchmark: {} clients", num_clients);
    println!("  Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    // Spawn client tasks
    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to connect
    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    // Reset counter and start measurement
    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("Results");
    println!("  Clients:        {:>10}", num_clients);
    println!("  Duration:       {:>10.2}s", elapsed.as_secs_f64());
    println!("  Total records:  {:>10}", total_messages);
    println!("  Throughput:     {:>10.0} records/s", msgs_per_sec);
    println!("  Per-client:     {:>10.0} records/s", msgs_per_sec_per_client);

    // Signal clients to stop
    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    // Wait for all clients to be ready
    barrier.wait().await;

    let add = Message::Text(
        json!({"action": "ADD", "scope": "PUBLIC", "client": client_id, "body": "x".repeat(64)})
            .to_string(),
    );

    // Ids of our own records, fed back to the sender for removal
    let (remove_tx, mut remove_rx) = mpsc::unbounded_channel::<u64>();

    let recv_count = message_count.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            let Ok(Message::Text(text)) = result else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            recv_count.fetch_add(1, Ordering::Relaxed);

            let ours = record["client"].as_u64() == Some(client_id as u64);
            if ours && record["action"] == "ADD" {
                if let Some(id) = record["id"].as_u64() {
                    if remove_tx.send(id).is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        while let Ok(id) = remove_rx.try_recv() {
            let remove = json!({"id": id, "action": "REMOVE"}).to_string();
            sender.send(Message::Text(remove)).await?;
        }
        if sender.send(add.clone()).await.is_err() {
            break;
        }
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
