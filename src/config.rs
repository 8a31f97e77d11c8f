use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{value_parser, Parser};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::shutdown::{DEFAULT_GRACE_PERIOD, DEFAULT_HARD_TIMEOUT};

/// Port used when neither the settings file nor the CLI provides one
pub const DEFAULT_PORT: u16 = 8080;

/// Allow-list used when neither the settings file nor the CLI provides one
pub const DEFAULT_ALLOWED_IPS: &str = "127.0.0.1";

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "IP allow-listed forward proxy for HTTP and HTTPS (CONNECT)",
    long_about = "fwdproxy relays plain HTTP requests and tunnels HTTPS via CONNECT, \
admitting only clients whose IP matches the allow-list.\n\n\
Allow-list entries (comma-separated):\n\
- exact    : 10.0.0.5\n\
- wildcard : 192.168.1.*\n\
- CIDR     : 10.0.0.0/24\n\
An empty allow-list admits every client.\n\n\
The client IP is taken from the first X-Forwarded-For entry when present; \
clients can forge that header.\n"
)]
pub struct Cli {
    /// JSON settings file with `port` and `allowed_ips`
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides the settings file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Comma-separated allow-list (overrides the settings file)
    #[arg(long = "allowed-ips", value_name = "PATTERNS")]
    pub allowed_ips: Option<String>,

    /// IP address to bind the listener to
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Seconds of inactivity before an outbound request or tunnel is dropped
    #[arg(long, value_parser = value_parser!(u64).range(1..), default_value_t = 10)]
    pub idle_timeout: u64,

    /// Seconds to wait for connections to finish before force-closing them
    #[arg(long, default_value_t = DEFAULT_GRACE_PERIOD.as_secs())]
    pub grace_period: u64,

    /// Absolute upper bound in seconds on shutdown
    #[arg(long, default_value_t = DEFAULT_HARD_TIMEOUT.as_secs())]
    pub hard_timeout: u64,

    /// Interval seconds between connection count logs (0 disables)
    #[arg(long = "stats-interval", default_value_t = 300)]
    pub stats_interval: u64,
}

/// `port` may be written as a number or a numeric string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    fn to_port(&self) -> Option<u16> {
        match self {
            PortValue::Number(n) => u16::try_from(*n).ok(),
            PortValue::Text(s) => s.trim().parse::<u16>().ok(),
        }
        .filter(|port| *port != 0)
    }
}

/// `allowed_ips` may be one comma-separated string or a list of entries
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum AllowedIpsValue {
    Joined(String),
    List(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    port: Option<PortValue>,
    allowed_ips: Option<AllowedIpsValue>,
}

/// Settings read from the JSON file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub port: u16,
    pub allowed_ips: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            allowed_ips: DEFAULT_ALLOWED_IPS.to_string(),
        }
    }
}

impl ProxySettings {
    /// Parse settings text; fields that are missing or unusable take defaults
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawSettings = serde_json::from_str(text)?;
        let defaults = Self::default();

        let port = match &raw.port {
            Some(value) => value.to_port().unwrap_or_else(|| {
                warn!("Invalid port {:?} in settings, using {}", value, defaults.port);
                defaults.port
            }),
            None => defaults.port,
        };

        let allowed_ips = match raw.allowed_ips {
            Some(AllowedIpsValue::Joined(s)) => s,
            Some(AllowedIpsValue::List(entries)) => entries.join(","),
            None => defaults.allowed_ips,
        };

        Ok(Self { port, allowed_ips })
    }

    /// Load the settings file, falling back to defaults if it is absent or broken
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            debug!("No settings file given, using defaults");
            return Self::default();
        };

        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    "Could not read settings {}: {}; using defaults",
                    path.display(),
                    e
                );
                return Self::default();
            }
        };

        match Self::from_json(&text) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(
                    "Could not parse settings {}: {}; using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }
}

/// Proxy server configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub allowed_ips: String,
    pub idle_timeout: Duration,
    pub grace_period: Duration,
    pub hard_timeout: Duration,
    pub stats_interval: Option<Duration>,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments, layered over the settings file
    pub fn from_cli(args: Cli) -> Self {
        let settings = ProxySettings::load(args.config.as_deref());

        let port = args.port.unwrap_or(settings.port);
        let allowed_ips = args.allowed_ips.unwrap_or(settings.allowed_ips);

        Self {
            listen_addr: SocketAddr::from((args.listen_ip, port)),
            allowed_ips,
            idle_timeout: Duration::from_secs(args.idle_timeout),
            grace_period: Duration::from_secs(args.grace_period),
            hard_timeout: Duration::from_secs(args.hard_timeout),
            stats_interval: (args.stats_interval > 0)
                .then(|| Duration::from_secs(args.stats_interval)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_settings_numeric_and_string_port() {
        let settings =
            ProxySettings::from_json(r#"{"port": 3128, "allowed_ips": "10.0.0.0/24"}"#).unwrap();
        assert_eq!(settings.port, 3128);
        assert_eq!(settings.allowed_ips, "10.0.0.0/24");

        let settings = ProxySettings::from_json(r#"{"port": " 8081 "}"#).unwrap();
        assert_eq!(settings.port, 8081);
        assert_eq!(settings.allowed_ips, DEFAULT_ALLOWED_IPS);
    }

    #[test]
    fn test_settings_bad_port_falls_back() {
        for text in [
            r#"{"port": "http"}"#,
            r#"{"port": 70000}"#,
            r#"{"port": -1}"#,
            r#"{"port": 0}"#,
        ] {
            let settings = ProxySettings::from_json(text).unwrap();
            assert_eq!(settings.port, DEFAULT_PORT, "{}", text);
        }
    }

    #[test]
    fn test_settings_allowed_ips_list() {
        let settings =
            ProxySettings::from_json(r#"{"allowed_ips": ["10.0.0.1", "192.168.*.*"]}"#).unwrap();
        assert_eq!(settings.allowed_ips, "10.0.0.1,192.168.*.*");
    }

    #[test]
    fn test_settings_empty_allow_list_is_kept() {
        let settings = ProxySettings::from_json(r#"{"allowed_ips": ""}"#).unwrap();
        assert_eq!(settings.allowed_ips, "");
    }

    #[test]
    fn test_load_missing_or_malformed_file() {
        assert_eq!(ProxySettings::load(None), ProxySettings::default());
        assert_eq!(
            ProxySettings::load(Some(Path::new("/nonexistent/fwdproxy.json"))),
            ProxySettings::default()
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert_eq!(
            ProxySettings::load(Some(file.path())),
            ProxySettings::default()
        );
    }

    #[test]
    fn test_cli_overrides_settings_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"port": 3128, "allowed_ips": "10.0.0.0/8"}"#)
            .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let from_file = ProxyConfig::from_cli(Cli::parse_from(["fwdproxy", "--config", &path]));
        assert_eq!(from_file.listen_addr.port(), 3128);
        assert_eq!(from_file.allowed_ips, "10.0.0.0/8");

        let overridden = ProxyConfig::from_cli(Cli::parse_from([
            "fwdproxy",
            "--config",
            &path,
            "--port",
            "9000",
            "--allowed-ips",
            "",
        ]));
        assert_eq!(overridden.listen_addr.port(), 9000);
        assert_eq!(overridden.allowed_ips, "");
    }

    #[test]
    fn test_cli_defaults() {
        let config = ProxyConfig::from_cli(Cli::parse_from(["fwdproxy"]));

        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.allowed_ips, DEFAULT_ALLOWED_IPS);
        assert_eq!(config.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.grace_period, Duration::from_secs(3));
        assert_eq!(config.hard_timeout, Duration::from_secs(10));
        assert_eq!(config.stats_interval, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_cli_rejects_zero_idle_timeout() {
        assert!(Cli::try_parse_from(["fwdproxy", "--idle-timeout", "0"]).is_err());
    }
}
