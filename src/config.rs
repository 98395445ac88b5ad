//! Command line and environment configuration.
//!
//! Every knob can come from the environment (the deployment path) or a CLI
//! flag (handy for tests, which spawn the binary directly). Configuration
//! errors are fatal: `main` prints them and exits with code 1.

use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

#[derive(Parser, Debug, Clone)]
#[command(name = "webgames", about = "Matchmaking and live-messaging server for multiplayer web games")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = 8000)]
    pub port: u16,

    /// Address to bind.
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    pub address: String,

    /// Run with the in-memory identity store (no durability; used by tests).
    #[arg(short = 't', long)]
    pub in_memory: bool,

    /// SQLite URL for the durable identity store.
    #[arg(long, env = "RDB_URL", default_value = "sqlite://webgames.db")]
    pub rdb_url: String,

    /// Shared secret signing the session tokens.
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Token lifetime, humantime syntax (e.g. `12h`, `45min`).
    #[arg(long, env = "JWT_EXPIRATION_TIME", default_value = "12h")]
    pub jwt_expiration_time: String,

    /// Host advertised to players for launched game instances.
    #[arg(long, env = "GAME_HOST", default_value = "127.0.0.1")]
    pub game_host: String,

    /// First port of the external game port range (inclusive).
    #[arg(long, env = "GAME_PORT_RANGE_START", default_value_t = 42000)]
    pub game_port_range_start: u16,

    /// End of the external game port range (exclusive).
    #[arg(long, env = "GAME_PORT_RANGE_STOP", default_value_t = 43000)]
    pub game_port_range_stop: u16,

    /// Base URL of the groups API, used for the logout self-call.
    #[arg(long, env = "GROUP_URL")]
    pub group_url: Option<String>,

    /// Base URL of the msgqueues API, advertised in notices.
    #[arg(long, env = "MSGQUEUES_URL")]
    pub msgqueues_url: Option<String>,

    /// Reverse proxies trusted to set X-Forwarded-For, comma separated.
    #[arg(long, env = "REVERSE_PROXY_IPS", value_delimiter = ',')]
    pub reverse_proxy_ips: Vec<IpAddr>,

    /// Container runtime used to launch game images.
    #[arg(long, env = "CONTAINER_RUNTIME", default_value = "docker")]
    pub container_runtime: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a verified admin account in the identity store.
    CreateAdmin {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        /// Taken from the environment so it stays out of shell history.
        #[arg(long, env = "ADMIN_PASSWORD")]
        password: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT_SECRET is required")]
    MissingSecret,
    #[error("Cannot parse JWT_EXPIRATION_TIME {0:?}: {1}")]
    BadDuration(String, String),
    #[error("Cannot parse bind address {0:?}")]
    BadAddress(String),
    #[error("Game port range is empty: start {0} >= stop {1}")]
    EmptyPortRange(u16, u16),
}

/// Validated runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub in_memory: bool,
    pub rdb_url: String,
    pub jwt_secret: String,
    pub jwt_expiration: Duration,
    pub game_host: String,
    pub game_port_range_start: u16,
    pub game_port_range_stop: u16,
    pub group_url: String,
    pub msgqueues_url: String,
    pub reverse_proxy_ips: Vec<IpAddr>,
    pub container_runtime: String,
}

impl Config {
    /// Validate raw arguments into a usable configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] describing the first invalid option.
    pub fn from_args(args: &Args) -> Result<Config, ConfigError> {
        let bind: SocketAddr = format!("{}:{}", args.address, args.port)
            .parse()
            .map_err(|_| ConfigError::BadAddress(format!("{}:{}", args.address, args.port)))?;

        let jwt_secret = args.jwt_secret.clone().ok_or(ConfigError::MissingSecret)?;
        if jwt_secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }

        let jwt_expiration = humantime::parse_duration(&args.jwt_expiration_time)
            .map_err(|e| ConfigError::BadDuration(args.jwt_expiration_time.clone(), e.to_string()))?;

        if args.game_port_range_start >= args.game_port_range_stop {
            return Err(ConfigError::EmptyPortRange(
                args.game_port_range_start,
                args.game_port_range_stop,
            ));
        }

        let group_url = args
            .group_url
            .clone()
            .unwrap_or_else(|| format!("http://{bind}/v1/groups"));
        let msgqueues_url = args
            .msgqueues_url
            .clone()
            .unwrap_or_else(|| format!("http://{bind}/v1/msgqueues"));

        Ok(Config {
            bind,
            in_memory: args.in_memory,
            rdb_url: args.rdb_url.clone(),
            jwt_secret,
            jwt_expiration,
            game_host: args.game_host.clone(),
            game_port_range_start: args.game_port_range_start,
            game_port_range_stop: args.game_port_range_stop,
            group_url,
            msgqueues_url,
            reverse_proxy_ips: args.reverse_proxy_ips.clone(),
            container_runtime: args.container_runtime.clone(),
        })
    }
}
