mod auth;
mod bootstrap;
mod health;
mod webhook;

use anyhow::Result;

use clinicsync_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use clinicsync_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let webhook_state = webhook::WebhookState {
        sync_service: app.sync_service.clone(),
        mappings: app.mappings.clone(),
        mapping_repo: app.mapping_repo.clone(),
        secret: app.config.webhook.secret.clone(),
        tolerance_ms: app.config.webhook.tolerance_ms,
    };
    let router = webhook::router(webhook_state).merge(health::router(
        app.db_pool.clone(),
        app.booking_client.clone(),
        app.crm_client.clone(),
    ));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "clinicsync-server started"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "clinicsync-server stopping"
    );

    Ok(())
}

async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
