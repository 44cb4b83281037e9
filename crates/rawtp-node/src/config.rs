use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, bail};
use rawtp_core::{DEFAULT_POLL_INTERVAL, TimerConfig};

/// Experimental protocol number (RFC 3692); the kernel has no handler for it.
pub const DEFAULT_PROTOCOL: u8 = 253;

pub const DEFAULT_WELCOME: &str = "Welcome to the rawtp echo node\n";

/// Node settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_addr: Ipv4Addr,
    pub protocol: u8,
    pub timer: TimerConfig,
    pub poll_interval: Duration,
    pub welcome: String,
}

impl NodeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup so parsing can be exercised without
    /// touching the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let bind_addr: Ipv4Addr = match lookup("RAWTP_BIND_ADDR") {
            Some(v) => v
                .parse()
                .with_context(|| format!("RAWTP_BIND_ADDR={v} is not an IPv4 address"))?,
            None => Ipv4Addr::LOCALHOST,
        };

        let protocol: u8 = match lookup("RAWTP_PROTOCOL") {
            Some(v) => v
                .parse()
                .with_context(|| format!("RAWTP_PROTOCOL={v} is not a protocol number"))?,
            None => DEFAULT_PROTOCOL,
        };
        if protocol == 6 || protocol == 17 {
            bail!("RAWTP_PROTOCOL={protocol} would collide with the kernel's TCP/UDP");
        }

        let defaults = TimerConfig::default();
        let timer = TimerConfig {
            initial_timeout: millis(&lookup, "RAWTP_INITIAL_TIMEOUT_MS")?
                .unwrap_or(defaults.initial_timeout),
            max_timeout: millis(&lookup, "RAWTP_MAX_TIMEOUT_MS")?.unwrap_or(defaults.max_timeout),
        };
        if timer.initial_timeout.is_zero() || timer.initial_timeout >= timer.max_timeout {
            bail!(
                "initial timeout {:?} must be non-zero and below the ceiling {:?}",
                timer.initial_timeout,
                timer.max_timeout
            );
        }

        let poll_interval =
            millis(&lookup, "RAWTP_POLL_INTERVAL_MS")?.unwrap_or(DEFAULT_POLL_INTERVAL);
        if poll_interval.is_zero() {
            bail!("RAWTP_POLL_INTERVAL_MS must be non-zero");
        }

        let welcome = lookup("RAWTP_WELCOME").unwrap_or_else(|| DEFAULT_WELCOME.into());

        Ok(Self {
            bind_addr,
            protocol,
            timer,
            poll_interval,
            welcome,
        })
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<Duration>> {
    lookup(key)
        .map(|v| {
            v.parse::<u64>()
                .map(Duration::from_millis)
                .with_context(|| format!("{key}={v} is not a number of milliseconds"))
        })
        .transpose()
}
