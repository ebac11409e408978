//! Tickets service.
//!
//! ```bash
//! # In-process broker
//! cargo run -p tickets
//!
//! # Redpanda
//! BROKER_BACKEND=redpanda cargo run -p tickets --features redpanda
//! ```

use anyhow::Context;
use tickets::app::shutdown_signal;
use tickets::{App, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("Invalid configuration")?;
    tickets::telemetry::init(&config.log).context("Failed to initialize logging")?;

    tracing::info!(
        address = %config.server_addr(),
        backend = ?config.broker.backend,
        "Starting tickets service"
    );

    let app = App::build(config).context("Failed to build application")?;
    app.run(shutdown_signal()).await?;

    Ok(())
}
