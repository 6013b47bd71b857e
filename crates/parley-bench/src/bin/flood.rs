//! End-to-end flood driver for the Parley broker.
//!
//! Connects N clients over real WebSocket I/O, has each of them chat
//! continuously for a fixed window, and reports relayed-message throughput.

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{codec, Frame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const BROKER_URL: &str = "ws://127.0.0.1:7400";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8);

    println!("Parley flood: {} clients against {}", num_clients, BROKER_URL);
    println!("Make sure the broker is running: cargo run --release --bin parleyd");
    println!();

    let relayed = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let relayed = Arc::clone(&relayed);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, relayed, barrier).await {
                eprintln!("client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("all {} clients connected", num_clients);

    println!("warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    relayed.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = relayed.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("clients:            {}", num_clients);
    println!("duration:           {:.2}s", elapsed.as_secs_f64());
    println!("relayed messages:   {}", total);
    println!("throughput:         {:.0} msg/s", per_sec);
    println!("per client:         {:.0} msg/s", per_sec / num_clients as f64);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    relayed: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(BROKER_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    // Handshake: Hello, then wait for Welcome.
    let hello = codec::encode(&Frame::hello(Some(format!("flood{client_id}"))))?;
    sender.send(Message::Binary(hello.to_vec())).await?;
    if let Some(Ok(_welcome)) = receiver.next().await {
        // Registered.
    }

    barrier.wait().await;

    // Pre-encode the chat frame; every relayed copy is counted on receive.
    let chat = codec::encode(&Frame::chat(vec![0u8; 64]))?;
    let chat_msg = Message::Binary(chat.to_vec());

    let recv_relayed = Arc::clone(&relayed);
    let recv_task = tokio::spawn(async move {
        let mut recv_buf = BytesMut::with_capacity(65536);

        while let Some(result) = receiver.next().await {
            if let Ok(Message::Binary(data)) = result {
                recv_buf.extend_from_slice(&data);
                while let Ok(Some(frame)) = codec::decode_from(&mut recv_buf) {
                    if matches!(frame, Frame::Relay { .. }) {
                        recv_relayed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    loop {
        if sender.send(chat_msg.clone()).await.is_err() {
            break;
        }
        // Yield so the receive task keeps draining.
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
