use core::time::Duration;

use anyhow::bail;
use clap::{Parser, ValueEnum};
use ferroid_lease::{MAX_TTL, PoolLayout, SessionConfig};

/// Coordination backend the agent claims from.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// An etcd cluster; `ADDRESS` is a comma-separated endpoint list.
    Etcd,
    /// An in-process pool, useful for trying the agent out. `ADDRESS` is
    /// ignored.
    Memory,
}

/// Runtime configuration for the `ferroid-lease-agent` binary.
///
/// All values are parsed from CLI arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ferroid-lease-agent",
    version,
    about = "Claims an expiring machine id from a shared pool"
)]
pub struct CliArgs {
    /// Coordination backend.
    ///
    /// Environment variable: `BACKEND`
    #[arg(long, env = "BACKEND", value_enum, default_value_t = Backend::Etcd)]
    pub backend: Backend,

    /// Address of the coordination quorum.
    ///
    /// Environment variable: `ADDRESS`
    #[arg(long, env = "ADDRESS", default_value_t = String::from("http://127.0.0.1:2379"))]
    pub address: String,

    /// Namespace shared by every claimant of the same pool.
    ///
    /// Environment variable: `BASE_PATH`
    #[arg(long, env = "BASE_PATH", default_value_t = String::from("/unique-id-generator"))]
    pub base_path: String,

    /// Number of machine ids in the pool; claims return ids in
    /// `[0, POOL_SIZE)`.
    ///
    /// The default matches a 10-bit Snowflake machine id.
    ///
    /// Environment variable: `POOL_SIZE`
    #[arg(long, env = "POOL_SIZE", default_value_t = 1024)]
    pub pool_size: u32,

    /// How long each claim is held, in milliseconds.
    ///
    /// Environment variable: `TTL_MS`
    #[arg(long, env = "TTL_MS", default_value_t = 60_000)]
    pub ttl_ms: u64,

    /// Upper bound on establishing a session, in milliseconds.
    ///
    /// Environment variable: `CONNECT_TIMEOUT_MS`
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 11_000)]
    pub connect_timeout_ms: u64,

    /// Session timeout requested from the backend, in milliseconds.
    ///
    /// Environment variable: `SESSION_TIMEOUT_MS`
    #[arg(long, env = "SESSION_TIMEOUT_MS", default_value_t = 10_000)]
    pub session_timeout_ms: u64,

    /// Delay before retrying a failed claim, in milliseconds.
    ///
    /// Environment variable: `RETRY_BACKOFF_MS`
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 1_000)]
    pub retry_backoff_ms: u64,

    /// Hold a single claim until it expires, then exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub backend: Backend,
    pub address: String,
    pub base_path: String,
    pub pool_size: u32,
    pub ttl: Duration,
    pub session: SessionConfig,
    pub retry_backoff: Duration,
    pub once: bool,
}

impl TryFrom<CliArgs> for AgentConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.pool_size == 0 {
            bail!("POOL_SIZE must be greater than 0");
        }
        if args.ttl_ms == 0 {
            bail!("TTL_MS must be greater than 0");
        }
        let ttl = Duration::from_millis(args.ttl_ms);
        if ttl > MAX_TTL {
            bail!("TTL_MS must not exceed {} ms", MAX_TTL.as_millis());
        }
        if args.connect_timeout_ms == 0 {
            bail!("CONNECT_TIMEOUT_MS must be greater than 0");
        }
        if args.backend == Backend::Etcd && args.address.trim().is_empty() {
            bail!("ADDRESS must name at least one etcd endpoint");
        }
        if let Err(e) = PoolLayout::new(&args.base_path) {
            bail!("BASE_PATH ({}) is not usable: {e}", args.base_path);
        }

        Ok(Self {
            backend: args.backend,
            address: args.address,
            base_path: args.base_path,
            pool_size: args.pool_size,
            ttl,
            session: SessionConfig {
                session_timeout: Duration::from_millis(args.session_timeout_ms),
                connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            },
            retry_backoff: Duration::from_millis(args.retry_backoff_ms),
            once: args.once,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<AgentConfig> {
        let argv = core::iter::once("ferroid-lease-agent").chain(args.iter().copied());
        AgentConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.backend, Backend::Etcd);
        assert_eq!(config.address, "http://127.0.0.1:2379");
        assert_eq!(config.base_path, "/unique-id-generator");
        assert_eq!(config.pool_size, 1024);
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert_eq!(config.session, SessionConfig::default());
        assert!(!config.once);
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--backend",
            "memory",
            "--pool-size",
            "64",
            "--ttl-ms",
            "2000",
            "--base-path",
            "/ids",
            "--once",
        ])
        .unwrap();
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.pool_size, 64);
        assert_eq!(config.ttl, Duration::from_secs(2));
        assert_eq!(config.base_path, "/ids");
        assert!(config.once);
    }

    #[test]
    fn rejects_unusable_values() {
        assert!(parse(&["--pool-size", "0"]).is_err());
        assert!(parse(&["--ttl-ms", "0"]).is_err());
        assert!(parse(&["--ttl-ms", "77760000000"]).is_err());
        let longest = MAX_TTL.as_millis().to_string();
        assert!(parse(&["--ttl-ms", longest.as_str()]).is_ok());
        assert!(parse(&["--connect-timeout-ms", "0"]).is_err());
        assert!(parse(&["--base-path", "relative"]).is_err());
        assert!(parse(&["--address", " "]).is_err());
        assert!(parse(&["--backend", "memory", "--address", " "]).is_ok());
    }
}
