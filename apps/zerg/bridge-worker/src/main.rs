//! Bridge Worker - Entry Point
//!
//! Consumes player requests from Redis Streams and publishes correlated results.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    zerg_bridge_worker::run().await
}
