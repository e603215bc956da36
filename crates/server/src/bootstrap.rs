use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::info;

use clinicsync_core::config::{AppConfig, ConfigError, LoadOptions};
use clinicsync_core::{ExternalService, MappingTable};
use clinicsync_db::repositories::{
    LinkRepository, MappingRepository, RepositoryError, SqlLinkRepository, SqlMappingRepository,
    SqlSyncLogRepository, SyncLogRepository,
};
use clinicsync_db::{connect_with_settings, migrations, DbPool};
use clinicsync_engine::{BookingSystemClient, CircuitBreaker, CrmClient, SyncService};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub sync_service: Arc<SyncService>,
    pub mappings: Arc<RwLock<MappingTable>>,
    pub mapping_repo: Arc<dyn MappingRepository>,
    pub booking_client: BookingSystemClient,
    pub crm_client: CrmClient,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("repository access failed: {0}")]
    Repository(#[source] RepositoryError),
    #[error("http client construction failed: {0}")]
    HttpClient(String),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let mapping_repo: Arc<dyn MappingRepository> =
        Arc::new(SqlMappingRepository::new(db_pool.clone()));
    let mut mapping_rows = mapping_repo.load_all().await.map_err(BootstrapError::Repository)?;

    if mapping_rows.is_empty() && !config.mappings.is_empty() {
        mapping_rows =
            config.mappings.iter().cloned().map(|seed| seed.into_mapping()).collect();
        mapping_repo
            .replace_all(mapping_rows.clone())
            .await
            .map_err(BootstrapError::Repository)?;
        info!(
            event_name = "system.bootstrap.mappings_seeded",
            correlation_id = "bootstrap",
            count = mapping_rows.len(),
            "seeded entity mappings from configuration"
        );
    }

    let mappings = Arc::new(RwLock::new(MappingTable::from_mappings(&mapping_rows)));

    let booking_http = http_client(config.booking.timeout_secs)?;
    let crm_http = http_client(config.crm.timeout_secs)?;

    let breaker_cooldown = Duration::from_secs(config.sync.breaker_cooldown_secs);
    let booking_breaker = Arc::new(CircuitBreaker::new(
        ExternalService::BookingSystem,
        config.sync.breaker_threshold,
        breaker_cooldown,
    ));
    let crm_breaker = Arc::new(CircuitBreaker::new(
        ExternalService::Crm,
        config.sync.breaker_threshold,
        breaker_cooldown,
    ));

    let booking_client =
        BookingSystemClient::new(booking_http, &config.booking, &config.sync, booking_breaker);
    let crm_client = CrmClient::new(crm_http, &config.crm, &config.sync, crm_breaker);

    let links: Arc<dyn LinkRepository> = Arc::new(SqlLinkRepository::new(db_pool.clone()));
    let sync_log: Arc<dyn SyncLogRepository> = Arc::new(SqlSyncLogRepository::new(db_pool.clone()));

    let sync_service =
        Arc::new(SyncService::new(crm_client.clone(), mappings.clone(), links, sync_log));

    Ok(Application {
        config,
        db_pool,
        sync_service,
        mappings,
        mapping_repo,
        booking_client,
        crm_client,
    })
}

fn http_client(timeout_secs: u64) -> Result<Client, BootstrapError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|error| BootstrapError::HttpClient(error.to_string()))
}
