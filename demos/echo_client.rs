//! Echo client
//!
//! Connects to a WebSocket echo server, sends a few text messages and prints
//! whatever comes back.
//!
//! Run with: cargo run --example echo_client -- ws://127.0.0.1:9001/
//! Set RUST_LOG=debug to see the engine's state transitions.

use std::time::Duration;

use sockudo_ws_client::{Config, Connection, FragmentMarker};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9001/".to_string());
    println!("Connecting to {}", url);

    let config = Config::builder()
        .ping_interval(Duration::from_secs(5))
        .build();
    let conn = Connection::new(config);
    conn.set_url(&url)?;

    conn.on_connected(|_| println!("Connected"));
    conn.on_disconnected(|conn| match conn.error() {
        Some(err) => println!("Disconnected: {}", err),
        None => println!("Disconnected"),
    });
    conn.on_text(|_, text, len| println!("Received text ({} bytes): {}", len, text));
    conn.on_binary(|_, _data, len, marker| {
        println!("Received binary ({} bytes, {:?})", len, marker)
    });

    conn.connect()?;

    let test_messages = [
        "Hello from echo client",
        "Second message",
        "Message 3",
    ];

    for msg in test_messages {
        // Sends queue until the handshake completes
        conn.send_text(msg)?;
        println!("Sent: {}", msg);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    conn.send_binary(b"chunk-1 ", FragmentMarker::Start)?;
    conn.send_binary(b"chunk-2", FragmentMarker::Continue)?;
    conn.send_binary(b"", FragmentMarker::End)?;

    tokio::time::sleep(Duration::from_secs(1)).await;

    conn.disconnect();
    conn.join().await;
    println!("Done");

    Ok(())
}
