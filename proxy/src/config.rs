//! Proxy configuration.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. the YAML file named by `--config` / `PROXYCONFIG` (default `~/.nem/config`)
//! 3. command-line flags
//!
//! One [`ProxyConfig`] is built at startup and handed to each component.
//!
//! ```yaml
//! server: voltha-rw-core.voltha:50057
//! kafka: voltha-kafka.voltha:9092
//! local: 0.0.0.0:50052
//! tls:
//!   useTls: false
//! grpc:
//!   timeout: 5m
//!   actionTimeout: 10s
//! ```

use clap::Parser;
use ondemand_proxy_runtime::{BridgeConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Extra time an unanswered entry may live past its longest phase.
const EVICTION_SLACK: Duration = Duration::from_secs(30);

/// Command-line options.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "ondemand-proxy", version)]
#[command(about = "Runs on-demand device tests and returns their results", long_about = None)]
pub struct Cli {
    /// Location of proxy config file
    #[arg(short = 'c', long, env = "PROXYCONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// IP/Host and port of the backend management service
    #[arg(short = 's', long, value_name = "SERVER:PORT")]
    pub server: Option<String>,

    /// IP/Host and port of Kafka
    #[arg(short = 'k', long, value_name = "SERVER:PORT")]
    pub kafka: Option<String>,

    /// IP/Host and port to listen on
    #[arg(short = 'l', long, value_name = "SERVER:PORT")]
    pub local: Option<String>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// How long a request waits for its test result
    #[arg(short = 't', long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Use TLS
    #[arg(long = "tls")]
    pub use_tls: bool,

    /// Trust certs signed only by this CA
    #[arg(long = "tlscacert", value_name = "CA_CERT_FILE")]
    pub ca_cert: Option<PathBuf>,

    /// Path to TLS certificate file
    #[arg(long = "tlscert", value_name = "CERT_FILE")]
    pub cert: Option<PathBuf>,

    /// Path to TLS key file
    #[arg(long = "tlskey", value_name = "KEY_FILE")]
    pub key: Option<PathBuf>,

    /// Use TLS and verify the remote
    #[arg(long = "tlsverify")]
    pub verify: bool,

    /// Name to verify the backend's certificate against, if not its host
    #[arg(long = "tlsdomain", value_name = "DOMAIN")]
    pub tls_domain: Option<String>,

    /// Serve Prometheus metrics on this address
    #[arg(long, value_name = "ADDR")]
    pub metrics_listen: Option<SocketAddr>,
}

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly named config file does not exist
    #[error("Configuration file '{0}' does not exist")]
    NotFound(PathBuf),

    /// The config file could not be read
    #[error("Unable to read the configuration file '{path}': {source}")]
    Read {
        /// File being read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The config file is not valid YAML for [`ProxyConfig`]
    #[error("Unable to parse the configuration file '{path}': {source}")]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// YAML error
        source: serde_yaml::Error,
    },

    /// A value is out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Backend management service address (`host:port`)
    pub server: String,
    /// Kafka bootstrap brokers
    pub kafka: String,
    /// Address the gRPC server listens on
    pub local: String,
    /// Topic carrying device events
    pub topic: String,
    /// TLS settings
    pub tls: TlsConfig,
    /// Timeouts and retries
    pub grpc: GrpcConfig,
    /// Correlation bridge tuning
    pub bridge: BridgeSettings,
    /// Prometheus scrape address; metrics are off when unset
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: "voltha-rw-core.voltha:50057".to_string(),
            kafka: "voltha-kafka.voltha:9092".to_string(),
            local: "0.0.0.0:50052".to_string(),
            topic: ondemand_proxy_runtime::correlation::DEFAULT_TOPIC.to_string(),
            tls: TlsConfig::default(),
            grpc: GrpcConfig::default(),
            bridge: BridgeSettings::default(),
            metrics_listen: None,
        }
    }
}

/// TLS settings shared by the listener and the backend connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsConfig {
    /// Enable TLS
    pub use_tls: bool,
    /// CA bundle: verifies the backend, and clients when serving
    pub ca_cert: Option<PathBuf>,
    /// Certificate presented by the proxy
    pub cert: Option<PathBuf>,
    /// Private key for `cert`
    pub key: Option<PathBuf>,
    /// Name to verify the backend's certificate against
    pub verify: Option<String>,
}

/// Request timing and retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GrpcConfig {
    /// How long a request waits for its completion event
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Deadline for each backend action call
    #[serde(with = "humantime_serde")]
    pub action_timeout: Duration,
    /// Retries of transient backend failures
    pub max_retries: u32,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            action_timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// Correlation bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeSettings {
    /// Age at which unanswered entries are evicted; defaults to the longer of
    /// the backend call budget and the request timeout, plus 30 seconds
    #[serde(with = "humantime_serde")]
    pub grace_period: Option<Duration>,
    /// How often stale entries are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Pause after a bus transport error
    #[serde(with = "humantime_serde")]
    pub transport_backoff: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            grace_period: None,
            sweep_interval: Duration::from_secs(30),
            transport_backoff: Duration::from_secs(1),
        }
    }
}

/// `~/.nem/config`.
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join(".nem")
        .join("config")
}

impl ProxyConfig {
    /// Build the configuration from the file and flags named by `cli`.
    ///
    /// A missing default config file is not an error; a missing file that was
    /// named explicitly is.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or the
    /// merged result is invalid.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) if !path.as_os_str().is_empty() => Self::from_file(path)?,
            _ => {
                let path = default_config_path();
                if path.is_file() {
                    Self::from_file(&path)?
                } else {
                    tracing::debug!(path = %path.display(), "No config file, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotFound`], [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.tls.normalize();
        Ok(config)
    }

    /// Parse YAML on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns the YAML error if `text` does not describe a config.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Override values with whatever was given on the command line.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(server) = non_empty(cli.server.as_deref()) {
            self.server = server.to_string();
        }
        if let Some(kafka) = non_empty(cli.kafka.as_deref()) {
            self.kafka = kafka.to_string();
        }
        if let Some(local) = non_empty(cli.local.as_deref()) {
            self.local = local.to_string();
        }
        if let Some(timeout) = cli.timeout {
            self.grpc.timeout = timeout;
        }
        if cli.use_tls || cli.verify {
            self.tls.use_tls = true;
        }
        if cli.ca_cert.is_some() {
            self.tls.ca_cert.clone_from(&cli.ca_cert);
        }
        if cli.cert.is_some() {
            self.tls.cert.clone_from(&cli.cert);
        }
        if cli.key.is_some() {
            self.tls.key.clone_from(&cli.key);
        }
        if cli.tls_domain.is_some() {
            self.tls.verify.clone_from(&cli.tls_domain);
        }
        if cli.metrics_listen.is_some() {
            self.metrics_listen = cli.metrics_listen;
        }
        self.tls.normalize();
    }

    /// Check values that would otherwise fail later at startup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::Invalid("server address cannot be empty".into()));
        }
        if self.kafka.trim().is_empty() {
            return Err(ConfigError::Invalid("kafka address cannot be empty".into()));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("topic cannot be empty".into()));
        }
        self.listen_addr()?;

        if self.grpc.timeout.is_zero() {
            return Err(ConfigError::Invalid("grpc.timeout cannot be 0".into()));
        }
        if self.grpc.action_timeout.is_zero() {
            return Err(ConfigError::Invalid("grpc.actionTimeout cannot be 0".into()));
        }
        if self.bridge.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("bridge.sweepInterval cannot be 0".into()));
        }
        if self.tls.use_tls && (self.tls.cert.is_some() != self.tls.key.is_some()) {
            return Err(ConfigError::Invalid(
                "TLS requires both a certificate and a key, or neither".into(),
            ));
        }
        Ok(())
    }

    /// The listen address, with a host name resolved.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `local` is not `host:port` or the
    /// host does not resolve.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.local
            .to_socket_addrs()
            .map_err(|e| ConfigError::Invalid(format!("listen address '{}': {e}", self.local)))?
            .next()
            .ok_or_else(|| {
                ConfigError::Invalid(format!("listen address '{}' does not resolve", self.local))
            })
    }

    /// Longest a backend action can take with every retry used.
    ///
    /// Each attempt may spend `action_timeout` connecting and again calling.
    #[must_use]
    pub fn backend_call_budget(&self) -> Duration {
        let attempts = self.grpc.max_retries.saturating_add(1).saturating_mul(2);
        self.grpc
            .action_timeout
            .saturating_mul(attempts)
            .saturating_add(self.retry_policy().total_backoff())
    }

    /// Bridge settings with the grace period resolved.
    ///
    /// The default grace outlasts both the backend call and the wait that
    /// follows it.
    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        let longest_phase = self.backend_call_budget().max(self.grpc.timeout);
        BridgeConfig {
            topic: self.topic.clone(),
            grace_period: self
                .bridge
                .grace_period
                .unwrap_or_else(|| longest_phase.saturating_add(EVICTION_SLACK)),
            sweep_interval: self.bridge.sweep_interval,
            transport_backoff: self.bridge.transport_backoff,
        }
    }

    /// Retry policy for backend calls.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder().max_retries(self.grpc.max_retries).build()
    }

    /// Log the effective configuration once at startup.
    pub fn log_summary(&self) {
        tracing::info!(
            server = %self.server,
            kafka = %self.kafka,
            local = %self.local,
            topic = %self.topic,
            tls = self.tls.use_tls,
            timeout = %humantime::format_duration(self.grpc.timeout),
            action_timeout = %humantime::format_duration(self.grpc.action_timeout),
            "Configuration loaded"
        );
    }
}

impl TlsConfig {
    /// Treat empty strings from YAML or flags as unset.
    fn normalize(&mut self) {
        for path in [&mut self.ca_cert, &mut self.cert, &mut self.key] {
            if path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                *path = None;
            }
        }
        // Older files carry a yes/no flag here; certificates are always verified.
        let yes_no = |v: &str| v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("false");
        if self.verify.as_deref().is_some_and(|v| v.is_empty() || yes_no(v)) {
            self.verify = None;
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_deployment() {
        let config = ProxyConfig::default();
        assert_eq!(config.server, "voltha-rw-core.voltha:50057");
        assert_eq!(config.kafka, "voltha-kafka.voltha:9092");
        assert_eq!(config.local, "0.0.0.0:50052");
        assert_eq!(config.topic, "voltha.events");
        assert_eq!(config.grpc.timeout, Duration::from_secs(300));
        assert!(!config.tls.use_tls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn yaml_overrides_defaults_and_keeps_the_rest() {
        let config = ProxyConfig::from_yaml(
            "server: core:50057\ntls:\n  useTls: true\n  caCert: ''\ngrpc:\n  timeout: 90s\n",
        )
        .unwrap();

        assert_eq!(config.server, "core:50057");
        assert_eq!(config.kafka, "voltha-kafka.voltha:9092");
        assert!(config.tls.use_tls);
        assert_eq!(config.grpc.timeout, Duration::from_secs(90));
        assert_eq!(config.grpc.action_timeout, Duration::from_secs(10));
    }

    #[test]
    fn empty_yaml_is_defaults() {
        assert_eq!(ProxyConfig::from_yaml("\n").unwrap(), ProxyConfig::default());
    }

    #[test]
    fn flags_override_file() {
        let mut config = ProxyConfig::from_yaml("server: from-file:1\nlocal: 127.0.0.1:1\n").unwrap();
        let cli = Cli::parse_from([
            "ondemand-proxy",
            "-s",
            "from-flag:2",
            "-t",
            "45s",
            "--tls",
            "--tlsdomain",
            "core.voltha",
        ]);
        config.apply_cli(&cli);

        assert_eq!(config.server, "from-flag:2");
        assert_eq!(config.local, "127.0.0.1:1");
        assert_eq!(config.grpc.timeout, Duration::from_secs(45));
        assert!(config.tls.use_tls);
        assert_eq!(config.tls.verify.as_deref(), Some("core.voltha"));
    }

    #[test]
    fn empty_flags_do_not_override() {
        let mut config = ProxyConfig::default();
        config.apply_cli(&Cli {
            server: Some(String::new()),
            ..Cli::default()
        });
        assert_eq!(config.server, ProxyConfig::default().server);
    }

    #[test]
    fn load_reads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "kafka: broker:9092\nbridge:\n  gracePeriod: 2m").unwrap();

        let config = ProxyConfig::load(&Cli {
            config: Some(file.path().to_path_buf()),
            ..Cli::default()
        })
        .unwrap();

        assert_eq!(config.kafka, "broker:9092");
        assert_eq!(config.bridge_config().grace_period, Duration::from_secs(120));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = ProxyConfig::load(&Cli {
            config: Some(PathBuf::from("/nonexistent/ondemand-proxy.yaml")),
            ..Cli::default()
        });
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn unparseable_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "grpc:\n  timeout: soon").unwrap();

        assert!(matches!(
            ProxyConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn grace_period_defaults_to_longest_phase_plus_slack() {
        let mut config = ProxyConfig::default();
        assert_eq!(config.bridge_config().grace_period, Duration::from_secs(330));

        // 4 attempts of connect + call at 10s each, plus 700ms of backoff.
        config.grpc.timeout = Duration::from_secs(10);
        assert_eq!(config.backend_call_budget(), Duration::from_millis(80_700));
        assert_eq!(
            config.bridge_config().grace_period,
            Duration::from_millis(110_700)
        );
    }

    #[test]
    fn tlsverify_is_a_plain_switch() {
        let cli = Cli::parse_from(["ondemand-proxy", "--tlsverify", "-s", "core:50057"]);
        assert!(cli.verify);
        assert_eq!(cli.server.as_deref(), Some("core:50057"));

        let mut config = ProxyConfig::default();
        config.apply_cli(&cli);
        assert!(config.tls.use_tls);
        assert_eq!(config.tls.verify, None);
    }

    #[test]
    fn yes_no_verify_in_file_is_not_a_domain() {
        let config = ProxyConfig::from_yaml("tls:\n  useTls: true\n  verify: 'true'\n").unwrap();
        let mut tls = config.tls;
        tls.normalize();
        assert_eq!(tls.verify, None);
    }

    #[test]
    fn listen_address_may_use_a_host_name() {
        let config = ProxyConfig {
            local: "localhost:50052".into(),
            ..ProxyConfig::default()
        };
        let addr = config.listen_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 50052);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = ProxyConfig {
            local: "not-an-address".into(),
            ..ProxyConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.local = "0.0.0.0:50052".into();
        config.grpc.timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.grpc.timeout = Duration::from_secs(1);
        config.tls.use_tls = true;
        config.tls.cert = Some(PathBuf::from("/etc/proxy/cert.pem"));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
