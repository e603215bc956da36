use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{EntityKind, EntityMapping};
use crate::signing::DEFAULT_TOLERANCE_MS;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub booking: BookingApiConfig,
    pub crm: CrmApiConfig,
    pub webhook: WebhookConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
    pub mappings: Vec<MappingSeed>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Credentials and endpoint for the clinic-booking REST API (basic auth).
#[derive(Clone, Debug)]
pub struct BookingApiConfig {
    pub base_url: String,
    pub company_code: String,
    pub api_key: SecretString,
    pub timeout_secs: u64,
}

/// Credentials and endpoint for the CRM REST API (bearer token, versioned).
#[derive(Clone, Debug)]
pub struct CrmApiConfig {
    pub base_url: String,
    pub api_token: SecretString,
    pub location_id: String,
    pub api_version: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub secret: SecretString,
    pub tolerance_ms: i64,
}

/// Retry and circuit-breaker tuning shared by both upstream clients.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_base: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub batch_chunk_size: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

/// Mapping entry seeded from the config file when the store is empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSeed {
    pub kind: EntityKind,
    pub id: String,
    #[serde(default)]
    pub calendar_id: Option<String>,
    #[serde(default)]
    pub assigned_user_id: Option<String>,
}

impl MappingSeed {
    pub fn into_mapping(self) -> EntityMapping {
        let mut mapping = EntityMapping::new(self.kind, self.id);
        mapping.calendar_id = self.calendar_id;
        mapping.assigned_user_id = self.assigned_user_id;
        mapping
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub booking_base_url: Option<String>,
    pub booking_company_code: Option<String>,
    pub booking_api_key: Option<String>,
    pub crm_base_url: Option<String>,
    pub crm_api_token: Option<String>,
    pub crm_location_id: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 3000,
                graceful_shutdown_secs: 15,
            },
            database: DatabaseConfig {
                url: "sqlite://clinicsync.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            booking: BookingApiConfig {
                base_url: "https://sandbox.bookings.example/api/v1".to_string(),
                company_code: String::new(),
                api_key: String::new().into(),
                timeout_secs: 30,
            },
            crm: CrmApiConfig {
                base_url: "https://api.crm.example".to_string(),
                api_token: String::new().into(),
                location_id: String::new(),
                api_version: "2021-07-28".to_string(),
                timeout_secs: 30,
            },
            webhook: WebhookConfig {
                secret: String::new().into(),
                tolerance_ms: DEFAULT_TOLERANCE_MS,
            },
            sync: SyncConfig {
                max_retries: 3,
                base_delay_ms: 1000,
                max_delay_ms: 30_000,
                backoff_base: 2,
                breaker_threshold: 5,
                breaker_cooldown_secs: 60,
                batch_chunk_size: 2000,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            mappings: Vec::new(),
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    database: Option<DatabasePatch>,
    booking: Option<BookingPatch>,
    crm: Option<CrmPatch>,
    webhook: Option<WebhookPatch>,
    sync: Option<SyncPatch>,
    logging: Option<LoggingPatch>,
    #[serde(default)]
    mappings: Vec<MappingSeed>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BookingPatch {
    base_url: Option<String>,
    company_code: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    base_url: Option<String>,
    api_token: Option<String>,
    location_id: Option<String>,
    api_version: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPatch {
    secret: Option<String>,
    tolerance_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncPatch {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_base: Option<u32>,
    breaker_threshold: Option<u32>,
    breaker_cooldown_secs: Option<u64>,
    batch_chunk_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("clinicsync.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(booking) = patch.booking {
            if let Some(base_url) = booking.base_url {
                self.booking.base_url = base_url;
            }
            if let Some(company_code) = booking.company_code {
                self.booking.company_code = company_code;
            }
            if let Some(api_key_value) = booking.api_key {
                self.booking.api_key = secret_value(api_key_value);
            }
            if let Some(timeout_secs) = booking.timeout_secs {
                self.booking.timeout_secs = timeout_secs;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(base_url) = crm.base_url {
                self.crm.base_url = base_url;
            }
            if let Some(api_token_value) = crm.api_token {
                self.crm.api_token = secret_value(api_token_value);
            }
            if let Some(location_id) = crm.location_id {
                self.crm.location_id = location_id;
            }
            if let Some(api_version) = crm.api_version {
                self.crm.api_version = api_version;
            }
            if let Some(timeout_secs) = crm.timeout_secs {
                self.crm.timeout_secs = timeout_secs;
            }
        }

        if let Some(webhook) = patch.webhook {
            if let Some(secret) = webhook.secret {
                self.webhook.secret = secret_value(secret);
            }
            if let Some(tolerance_ms) = webhook.tolerance_ms {
                self.webhook.tolerance_ms = tolerance_ms;
            }
        }

        if let Some(sync) = patch.sync {
            if let Some(max_retries) = sync.max_retries {
                self.sync.max_retries = max_retries;
            }
            if let Some(base_delay_ms) = sync.base_delay_ms {
                self.sync.base_delay_ms = base_delay_ms;
            }
            if let Some(max_delay_ms) = sync.max_delay_ms {
                self.sync.max_delay_ms = max_delay_ms;
            }
            if let Some(backoff_base) = sync.backoff_base {
                self.sync.backoff_base = backoff_base;
            }
            if let Some(breaker_threshold) = sync.breaker_threshold {
                self.sync.breaker_threshold = breaker_threshold;
            }
            if let Some(breaker_cooldown_secs) = sync.breaker_cooldown_secs {
                self.sync.breaker_cooldown_secs = breaker_cooldown_secs;
            }
            if let Some(batch_chunk_size) = sync.batch_chunk_size {
                self.sync.batch_chunk_size = batch_chunk_size;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if !patch.mappings.is_empty() {
            self.mappings = patch.mappings;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CLINICSYNC_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CLINICSYNC_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("CLINICSYNC_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CLINICSYNC_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CLINICSYNC_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CLINICSYNC_BOOKING_BASE_URL") {
            self.booking.base_url = value;
        }
        if let Some(value) = read_env("CLINICSYNC_BOOKING_COMPANY_CODE") {
            self.booking.company_code = value;
        }
        if let Some(value) = read_env("CLINICSYNC_BOOKING_API_KEY") {
            self.booking.api_key = secret_value(value);
        }

        if let Some(value) = read_env("CLINICSYNC_CRM_BASE_URL") {
            self.crm.base_url = value;
        }
        if let Some(value) = read_env("CLINICSYNC_CRM_API_TOKEN") {
            self.crm.api_token = secret_value(value);
        }
        if let Some(value) = read_env("CLINICSYNC_CRM_LOCATION_ID") {
            self.crm.location_id = value;
        }
        if let Some(value) = read_env("CLINICSYNC_CRM_API_VERSION") {
            self.crm.api_version = value;
        }

        if let Some(value) = read_env("CLINICSYNC_WEBHOOK_SECRET") {
            self.webhook.secret = secret_value(value);
        }

        if let Some(value) = read_env("CLINICSYNC_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CLINICSYNC_SERVER_PORT") {
            self.server.port = parse_u16("CLINICSYNC_SERVER_PORT", &value)?;
        }

        if let Some(value) = read_env("CLINICSYNC_SYNC_MAX_RETRIES") {
            self.sync.max_retries = parse_u32("CLINICSYNC_SYNC_MAX_RETRIES", &value)?;
        }

        let log_level =
            read_env("CLINICSYNC_LOGGING_LEVEL").or_else(|| read_env("CLINICSYNC_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CLINICSYNC_LOGGING_FORMAT").or_else(|| read_env("CLINICSYNC_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(base_url) = overrides.booking_base_url {
            self.booking.base_url = base_url;
        }
        if let Some(company_code) = overrides.booking_company_code {
            self.booking.company_code = company_code;
        }
        if let Some(api_key) = overrides.booking_api_key {
            self.booking.api_key = secret_value(api_key);
        }
        if let Some(base_url) = overrides.crm_base_url {
            self.crm.base_url = base_url;
        }
        if let Some(api_token) = overrides.crm_api_token {
            self.crm.api_token = secret_value(api_token);
        }
        if let Some(location_id) = overrides.crm_location_id {
            self.crm.location_id = location_id;
        }
        if let Some(secret) = overrides.webhook_secret {
            self.webhook.secret = secret_value(secret);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.database.url.trim();
        if !url.starts_with("sqlite:") && url != ":memory:" {
            return Err(ConfigError::Validation(
                "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                    .to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be at least 1".to_string(),
            ));
        }

        if self.booking.company_code.trim().is_empty() {
            return Err(ConfigError::Validation("booking.company_code is required".to_string()));
        }
        if self.booking.api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation("booking.api_key is required".to_string()));
        }

        if self.crm.api_token.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation("crm.api_token is required".to_string()));
        }
        if self.crm.location_id.trim().is_empty() {
            return Err(ConfigError::Validation("crm.location_id is required".to_string()));
        }

        if self.webhook.secret.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation("webhook.secret is required".to_string()));
        }
        if self.webhook.tolerance_ms <= 0 {
            return Err(ConfigError::Validation("webhook.tolerance_ms must be positive".to_string()));
        }

        if self.sync.base_delay_ms == 0 || self.sync.max_delay_ms < self.sync.base_delay_ms {
            return Err(ConfigError::Validation(
                "sync delays must satisfy 0 < base_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        if self.sync.backoff_base < 2 {
            return Err(ConfigError::Validation("sync.backoff_base must be at least 2".to_string()));
        }
        if self.sync.breaker_threshold == 0 {
            return Err(ConfigError::Validation(
                "sync.breaker_threshold must be at least 1".to_string(),
            ));
        }
        if self.sync.batch_chunk_size == 0 {
            return Err(ConfigError::Validation(
                "sync.batch_chunk_size must be at least 1".to_string(),
            ));
        }

        let level = self.logging.level.trim().to_ascii_lowercase();
        if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::Validation(format!(
                "unsupported log level `{}` (expected trace|debug|info|warn|error)",
                self.logging.level
            )));
        }

        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("clinicsync.toml"), PathBuf::from("config/clinicsync.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.into() })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.into() })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.into() })
}
