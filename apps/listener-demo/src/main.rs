//! Listener Demo - Entry Point
//!
//! Runs an order listener container on the in-memory broker.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    listener_demo::run().await
}
