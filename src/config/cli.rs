use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the mqbridge binary.
#[derive(Debug, Parser)]
#[command(
    name = "mqbridge",
    version,
    about = "Message queue to key-value cache bridge with a generated HTTP API"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MQBRIDGE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl CliArgs {
    /// The requested command, `serve` when none was given.
    pub fn command_or_default(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Serve(ServeArgs::default()))
    }
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Consume the configured queues and serve the HTTP API.
    Serve(ServeArgs),
    /// Validate configuration and print the generated routes.
    Check(CheckArgs),
}

impl Command {
    pub fn overrides(&self) -> &Overrides {
        match self {
            Self::Serve(args) => &args.overrides,
            Self::Check(args) => &args.overrides,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the HTTP listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the HTTP listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the broker kind (amqp|memory).
    #[arg(long = "broker-kind", value_name = "KIND")]
    pub broker_kind: Option<String>,

    /// Override the broker URL.
    #[arg(long = "broker-url", value_name = "URL")]
    pub broker_url: Option<String>,

    /// Override the cache backend (memory|redis).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Override the Redis URL used by the redis cache backend.
    #[arg(long = "cache-redis-url", value_name = "URL")]
    pub cache_redis_url: Option<String>,

    /// Treat unknown handler names as fatal.
    #[arg(
        long = "strict-handlers",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub strict_handlers: Option<bool>,
}
