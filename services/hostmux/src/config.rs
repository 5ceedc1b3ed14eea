//! Daemon configuration.
//!
//! Everything comes from `HOSTMUX_*` environment variables. Redirects and
//! commands are `;`-separated lists of `|`-separated fields.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use hostmux::proxy::{Network, DEFAULT_SNIFF_TIMEOUT};

/// A redirect entry: `port|matcher|address[|network]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectConfig {
    pub port: u16,
    pub matcher: String,
    pub address: String,
    pub network: String,
}

/// A command entry: `matcher|program args...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    pub matcher: String,
    pub program: String,
    pub args: Vec<String>,
}

/// Daemon configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,

    /// IP every shared listener binds.
    pub bind_ip: IpAddr,

    /// Sniff deadline; `None` waits forever.
    pub sniff_timeout: Option<Duration>,

    pub redirects: Vec<RedirectConfig>,

    pub commands: Vec<CommandConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("HOSTMUX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let bind_ip = std::env::var("HOSTMUX_BIND_IP")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("HOSTMUX_BIND_IP must be an IP address.")?
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let sniff_timeout_ms: Option<u64> = std::env::var("HOSTMUX_SNIFF_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("HOSTMUX_SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?;
        let sniff_timeout = match sniff_timeout_ms {
            None => Some(DEFAULT_SNIFF_TIMEOUT),
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        };

        let redirects = std::env::var("HOSTMUX_REDIRECTS")
            .ok()
            .map(|v| parse_redirects(&v))
            .transpose()
            .context("invalid HOSTMUX_REDIRECTS")?
            .unwrap_or_default();

        let commands = std::env::var("HOSTMUX_COMMANDS")
            .ok()
            .map(|v| parse_commands(&v))
            .transpose()
            .context("invalid HOSTMUX_COMMANDS")?
            .unwrap_or_default();

        Ok(Self {
            log_level,
            bind_ip,
            sniff_timeout,
            redirects,
            commands,
        })
    }
}

fn entries(value: &str) -> impl Iterator<Item = &str> {
    value.split(';').map(str::trim).filter(|e| !e.is_empty())
}

fn check_matcher(matcher: &str) -> Result<String> {
    if hostmux::parse_matcher(matcher).is_none() {
        bail!("empty matcher");
    }
    Ok(matcher.trim().to_string())
}

pub fn parse_redirects(value: &str) -> Result<Vec<RedirectConfig>> {
    entries(value).map(parse_redirect).collect()
}

fn parse_redirect(entry: &str) -> Result<RedirectConfig> {
    let fields: Vec<&str> = entry.split('|').map(str::trim).collect();
    let (port, matcher, address, network) = match fields.as_slice() {
        [port, matcher, address] => (port, matcher, address, "tcp"),
        [port, matcher, address, network] => (port, matcher, address, *network),
        _ => bail!("redirect {entry:?} must be port|matcher|address[|network]"),
    };

    let port: u16 = port
        .parse()
        .with_context(|| format!("redirect {entry:?} has an invalid port"))?;
    if port == 0 {
        bail!("redirect {entry:?} has port 0");
    }
    if address.is_empty() {
        bail!("redirect {entry:?} has no address");
    }
    network
        .parse::<Network>()
        .with_context(|| format!("redirect {entry:?}"))?;

    Ok(RedirectConfig {
        port,
        matcher: check_matcher(matcher).with_context(|| format!("redirect {entry:?}"))?,
        address: address.to_string(),
        network: network.to_string(),
    })
}

pub fn parse_commands(value: &str) -> Result<Vec<CommandConfig>> {
    entries(value).map(parse_command).collect()
}

fn parse_command(entry: &str) -> Result<CommandConfig> {
    let Some((matcher, command)) = entry.split_once('|') else {
        bail!("command {entry:?} must be matcher|program args...");
    };
    let mut words = command.split_whitespace().map(str::to_string);
    let Some(program) = words.next() else {
        bail!("command {entry:?} has no program");
    };

    Ok(CommandConfig {
        matcher: check_matcher(matcher).with_context(|| format!("command {entry:?}"))?,
        program,
        args: words.collect(),
    })
}
