//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::auth::UserConfig;
use crate::broker::{BrokerConfig, BrokerKind};
use crate::cache::{CacheBackendKind, CacheConfig, DEFAULT_DELIMITER, PreheatRecord};
use crate::domain::{BrokerBinding, MappingBlock, QueueDefinition};
use crate::handlers::HandlerKind;
use crate::ingest::{IngestOptions, ReconnectPolicy};

pub use cli::{CheckArgs, CliArgs, Command, Overrides, ServeArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "mqbridge";
const ENV_PREFIX: &str = "MQBRIDGE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub broker: BrokerConfig,
    pub cache: CacheConfig,
    pub auth: AuthSettings,
    pub ingest: IngestSettings,
    /// Queue definitions ordered by id.
    pub queues: Vec<QueueDefinition>,
}

impl Settings {
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            strict_handlers: self.ingest.strict_handlers,
            reconnect: ReconnectPolicy::from(&self.broker),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    pub master_token: Option<String>,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestSettings {
    pub strict_handlers: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(cli.command_or_default().overrides());

    Settings::from_raw(raw)
}

/// Parse process arguments and resolve configuration, returning both.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    broker: RawBrokerSettings,
    cache: RawCacheSettings,
    auth: RawAuthSettings,
    ingest: RawIngestSettings,
    queues: BTreeMap<String, RawQueueSettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBrokerSettings {
    kind: Option<String>,
    url: Option<String>,
    max_reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    redis_url: Option<String>,
    prefix: Option<String>,
    delimiter: Option<String>,
    pool_size: Option<usize>,
    timeout_ms: Option<u64>,
    preheat: Vec<PreheatRecord>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    master_token: Option<String>,
    users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIngestSettings {
    strict_handlers: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    handler: Option<String>,
    exchange: Option<String>,
    routing_key: Option<String>,
    broker_url: Option<String>,
    mapping: Option<MappingBlock>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(kind) = overrides.broker_kind.as_ref() {
            self.broker.kind = Some(kind.clone());
        }
        if let Some(url) = overrides.broker_url.as_ref() {
            self.broker.url = Some(url.clone());
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.cache_redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
        if let Some(strict) = overrides.strict_handlers {
            self.ingest.strict_handlers = Some(strict);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            broker,
            cache,
            auth,
            ingest,
            queues,
        } = raw;

        let cache = build_cache_settings(cache)?;
        let queues = build_queues(queues, &cache)?;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            broker: build_broker_settings(broker)?,
            cache,
            auth: build_auth_settings(auth)?,
            ingest: IngestSettings {
                strict_handlers: ingest.strict_handlers.unwrap_or(false),
            },
            queues,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.host", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_broker_settings(broker: RawBrokerSettings) -> Result<BrokerConfig, LoadError> {
    let defaults = BrokerConfig::default();

    let kind = match non_empty(broker.kind).as_deref().map(str::to_ascii_lowercase) {
        None => defaults.kind,
        Some(kind) => match kind.as_str() {
            "amqp" | "rabbitmq" => BrokerKind::Amqp,
            "memory" => BrokerKind::Memory,
            other => {
                return Err(LoadError::invalid(
                    "broker.kind",
                    format!("unknown broker kind `{other}` (expected amqp or memory)"),
                ));
            }
        },
    };

    let reconnect_delay_ms = broker
        .reconnect_delay_ms
        .unwrap_or(defaults.reconnect_delay.as_millis() as u64);
    if reconnect_delay_ms == 0 {
        return Err(LoadError::invalid(
            "broker.reconnect_delay_ms",
            "must be greater than zero",
        ));
    }

    Ok(BrokerConfig {
        kind,
        url: non_empty(broker.url).unwrap_or(defaults.url),
        max_reconnect_attempts: broker
            .max_reconnect_attempts
            .unwrap_or(defaults.max_reconnect_attempts),
        reconnect_delay: Duration::from_millis(reconnect_delay_ms),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let backend = match non_empty(cache.backend).as_deref().map(str::to_ascii_lowercase) {
        None => defaults.backend,
        Some(backend) => match backend.as_str() {
            "memory" => CacheBackendKind::Memory,
            "redis" | "valkey" => CacheBackendKind::Redis,
            other => {
                return Err(LoadError::invalid(
                    "cache.backend",
                    format!("unknown cache backend `{other}` (expected memory or redis)"),
                ));
            }
        },
    };

    let redis_url = non_empty(cache.redis_url);
    if backend == CacheBackendKind::Redis && redis_url.is_none() {
        return Err(LoadError::invalid(
            "cache.redis_url",
            "required when cache.backend is redis",
        ));
    }

    let pool_size = cache.pool_size.unwrap_or(defaults.pool_size);
    if pool_size == 0 {
        return Err(LoadError::invalid(
            "cache.pool_size",
            "must be greater than zero",
        ));
    }
    let timeout_ms = cache
        .timeout_ms
        .unwrap_or(defaults.timeout.as_millis() as u64);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(CacheConfig {
        backend,
        redis_url,
        prefix: non_empty(cache.prefix).unwrap_or(defaults.prefix),
        delimiter: non_empty(cache.delimiter).unwrap_or_else(|| DEFAULT_DELIMITER.to_string()),
        pool_size,
        timeout: Duration::from_millis(timeout_ms),
        preheat: cache.preheat,
    })
}

fn build_auth_settings(auth: RawAuthSettings) -> Result<AuthSettings, LoadError> {
    for (index, user) in auth.users.iter().enumerate() {
        if user.name.trim().is_empty() {
            return Err(LoadError::invalid(
                format!("auth.users[{index}].name"),
                "must not be empty",
            ));
        }
    }
    Ok(AuthSettings {
        master_token: non_empty(auth.master_token),
        users: auth.users,
    })
}

fn build_queues(
    queues: BTreeMap<String, RawQueueSettings>,
    cache: &CacheConfig,
) -> Result<Vec<QueueDefinition>, LoadError> {
    queues
        .into_iter()
        .map(|(id, raw)| {
            if id.trim().is_empty() {
                return Err(LoadError::invalid("queues", "queue id must not be empty"));
            }
            if cache.backend == CacheBackendKind::Redis && id.contains(cache.delimiter.as_str()) {
                return Err(LoadError::invalid(
                    format!("queues.{id}"),
                    format!("queue id must not contain the cache delimiter `{}`", cache.delimiter),
                ));
            }

            Ok(QueueDefinition {
                handler: non_empty(raw.handler)
                    .unwrap_or_else(|| HandlerKind::Drop.name().to_string()),
                binding: BrokerBinding {
                    exchange: raw.exchange.unwrap_or_default(),
                    routing_key: raw.routing_key.unwrap_or_default(),
                },
                broker_url: non_empty(raw.broker_url),
                mapping: raw.mapping,
                id,
            })
        })
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}
