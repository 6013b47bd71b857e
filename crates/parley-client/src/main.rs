//! # Parley client
//!
//! Thin terminal client: reads lines from stdin, sends each as one chat
//! message, and prints every relayed message prefixed by its sender.
//!
//! ## Usage
//!
//! ```bash
//! # Connect to a local broker anonymously
//! parley
//!
//! # Connect to a specific broker with a display name
//! parley ws://chat.example.net:7400 alice
//! ```

use anyhow::{bail, Context, Result};
use parley_protocol::{Frame, SystemEvent};
use parley_transport::{ws, Endpoint};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_URL: &str = "ws://127.0.0.1:7400";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let url = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| DEFAULT_URL.to_string());
    let name = args.get(2).cloned();

    tracing::debug!(url = %url, "connecting");
    let mut endpoint = ws::connect(&url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    endpoint
        .send(Frame::hello(name.clone()))
        .await
        .context("handshake send failed")?;

    let heartbeat_ms = match endpoint.recv().await.context("handshake reply failed")? {
        Some(Frame::Welcome {
            connection_id,
            heartbeat_ms,
            ..
        }) => {
            println!("* connected as {}", name.unwrap_or(connection_id));
            heartbeat_ms
        }
        Some(Frame::Error { code, message }) => {
            bail!("broker rejected connection ({code}): {message}")
        }
        _ => bail!("unexpected handshake reply"),
    };

    let (mut source, mut sink) = (Box::new(endpoint) as Box<dyn Endpoint>).split();

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    let mut ping = interval(Duration::from_millis(u64::from(heartbeat_ms.max(1_000))));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // the first tick is immediate

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "/quit" {
                        let _ = sink.send(Frame::Bye).await;
                        break;
                    }
                    sink.send(Frame::chat(line.as_bytes().to_vec()))
                        .await
                        .context("send failed")?;
                }
                // stdin closed
                None => {
                    let _ = sink.send(Frame::Bye).await;
                    break;
                }
            },

            frame = source.recv() => match frame.context("receive failed")? {
                Some(frame) => {
                    if let Some(text) = render_line(&frame) {
                        println!("{text}");
                    }
                    if matches!(frame, Frame::System { event: SystemEvent::Shutdown, .. }) {
                        break;
                    }
                }
                None => {
                    println!("* connection closed by broker");
                    break;
                }
            },

            _ = ping.tick() => {
                let _ = sink.send(Frame::ping(Some(now_millis()))).await;
            }

            _ = &mut ctrl_c => {
                let _ = sink.send(Frame::Bye).await;
                break;
            }
        }
    }

    let _ = sink.close().await;
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Terminal line for an incoming frame, if it should be shown.
fn render_line(frame: &Frame) -> Option<String> {
    match frame {
        Frame::Relay { sender, body, .. } => {
            Some(format!("{}: {}", sender, String::from_utf8_lossy(body)))
        }
        Frame::System { event, peer } => {
            let peer = peer.as_deref();
            match event {
                SystemEvent::Joined => Some(format!("* {} joined", peer.unwrap_or("someone"))),
                SystemEvent::Left => Some(format!("* {} left", peer.unwrap_or("someone"))),
                SystemEvent::Shutdown => Some("* broker shutting down".to_string()),
            }
        }
        Frame::Error { code, message } => Some(format!("! broker error {code}: {message}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_relay() {
        let frame = Frame::relay("alice", b"hello".to_vec(), 0);
        assert_eq!(render_line(&frame).unwrap(), "alice: hello");
    }

    #[test]
    fn test_render_system_events() {
        assert_eq!(
            render_line(&Frame::system(SystemEvent::Joined, "bob")).unwrap(),
            "* bob joined"
        );
        assert_eq!(
            render_line(&Frame::system(SystemEvent::Left, "bob")).unwrap(),
            "* bob left"
        );
    }

    #[test]
    fn test_keepalive_frames_are_silent() {
        assert!(render_line(&Frame::pong(Some(1))).is_none());
    }
}
