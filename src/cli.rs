use std::path::PathBuf;

use clap::Parser;

/// Command-line entry point for the standalone gateway binary. Most knobs
/// live in the TOML file pointed to by `--config`; the flags here exist for
/// overriding it without editing the file.
#[derive(Parser)]
#[command(name = "ratelimitd")]
#[command(
    about = "Token-aware rate-limiting gateway filter.",
    long_about = "Standalone demo harness for the token-aware rate-limiting filter: tokenizes \
chat-completion requests, predicts completion cost, and enforces a Redis-backed \
distributed token budget in front of an LLM upstream."
)]
pub struct CliArgs {
    /// Path to the plugin's TOML configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Overrides `server.host` from the config file.
    #[arg(long)]
    pub host: Option<String>,

    /// Overrides `server.port` from the config file.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Overrides `server.upstream` from the config file (the base URL of the
    /// LLM backend this gateway proxies to).
    #[arg(long)]
    pub upstream: Option<String>,

    /// Overrides `redis.service_addr` from the config file.
    #[arg(long)]
    pub redis_addr: Option<String>,

    /// Overrides `log.level` from the config file (`trace`, `debug`, `info`,
    /// `warn`, `error`, or an `EnvFilter` directive string).
    #[arg(long)]
    pub log_level: Option<String>,
}
