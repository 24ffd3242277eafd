//! Connection options, proxy specifications and global configuration.
//!
//! Option keys mirror the config-file surface: every key can appear globally,
//! per proxyspec, or inside a structured filter rule, in which case the rule's
//! option bundle replaces the connection's options from the moment the rule
//! matches.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default and bounds for `MaxHTTPHeaderSize`.
pub const HTTP_HEADER_SIZE_DEFAULT: usize = 8192;
pub const HTTP_HEADER_SIZE_MIN: usize = 1024;
pub const HTTP_HEADER_SIZE_MAX: usize = 65536;

/// Default and bounds for the idle sweep (seconds).
pub const CONN_IDLE_TIMEOUT_DEFAULT: u64 = 120;
pub const CONN_IDLE_TIMEOUT_MIN: u64 = 10;
pub const CONN_IDLE_TIMEOUT_MAX: u64 = 3600;
pub const EXPIRED_CHECK_PERIOD_DEFAULT: u64 = 10;
pub const EXPIRED_CHECK_PERIOD_MIN: u64 = 10;
pub const EXPIRED_CHECK_PERIOD_MAX: u64 = 60;

/// File descriptors kept in reserve; accepts are refused below this headroom.
pub const FD_RESERVE: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("invalid value '{value}' for option '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("unknown protocol tag '{0}'")]
    UnknownProto(String),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Application protocol handled by a proxyspec, mutable over a connection's
/// life (e.g. HTTP upgrades to HTTPS on CONNECT, anything may drop to
/// passthrough).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Passthrough,
    Http,
    Https,
    Pop3,
    Pop3s,
    Smtp,
    Smtps,
    Autossl,
    Tcp,
    Ssl,
}

impl Proto {
    /// Whether the client leg terminates TLS from the start.
    pub fn is_tls_client_leg(self) -> bool {
        matches!(self, Proto::Https | Proto::Pop3s | Proto::Smtps | Proto::Ssl)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Proto::Passthrough => "passthrough",
            Proto::Http => "http",
            Proto::Https => "https",
            Proto::Pop3 => "pop3",
            Proto::Pop3s => "pop3s",
            Proto::Smtp => "smtp",
            Proto::Smtps => "smtps",
            Proto::Autossl => "autossl",
            Proto::Tcp => "tcp",
            Proto::Ssl => "ssl",
        }
    }
}

impl std::str::FromStr for Proto {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Proto::Tcp),
            "ssl" => Ok(Proto::Ssl),
            "http" => Ok(Proto::Http),
            "https" => Ok(Proto::Https),
            "autossl" => Ok(Proto::Autossl),
            "pop3" => Ok(Proto::Pop3),
            "pop3s" => Ok(Proto::Pop3s),
            "smtp" => Ok(Proto::Smtp),
            "smtps" => Ok(Proto::Smtps),
            other => Err(ConfigError::UnknownProto(other.to_string())),
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS protocol versions accepted in `MinSSLProto` / `MaxSSLProto` /
/// `ForceSSLProto` and friends. Only TLS 1.2 and 1.3 can actually be
/// negotiated; older values are accepted for config compatibility and
/// rejected when the TLS config is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SslProto {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl std::str::FromStr for SslProto {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tls10" | "tls1" | "tls1.0" => Ok(SslProto::Tls10),
            "tls11" | "tls1.1" => Ok(SslProto::Tls11),
            "tls12" | "tls1.2" => Ok(SslProto::Tls12),
            "tls13" | "tls1.3" => Ok(SslProto::Tls13),
            other => Err(ConfigError::InvalidValue {
                key: "SSLProto".into(),
                value: other.into(),
                reason: "expected one of tls10 tls11 tls12 tls13".into(),
            }),
        }
    }
}

/// Per-connection option bundle.
///
/// A matching structured filter rule may carry its own bundle, which replaces
/// the connection's from that point onwards.
#[derive(Debug, Clone)]
pub struct ConnOpts {
    pub cacert: Option<PathBuf>,
    pub cakey: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub cachain: Option<PathBuf>,
    pub leaf_crl_url: Option<String>,
    pub dh_group_params: Option<PathBuf>,
    pub ecdh_curve: Option<String>,
    pub ciphers: Option<String>,
    pub ciphersuites: Option<String>,
    pub force_ssl_proto: Option<SslProto>,
    pub disabled_ssl_protos: Vec<SslProto>,
    pub enabled_ssl_protos: Vec<SslProto>,
    pub min_ssl_proto: Option<SslProto>,
    pub max_ssl_proto: Option<SslProto>,
    pub validate_proto: bool,
    pub max_http_header_size: usize,
    pub verify_peer: bool,
    pub allow_wrong_host: bool,
    pub remove_http_accept_encoding: bool,
    pub remove_http_referer: bool,
    pub deny_ocsp: bool,
    pub passthrough: bool,
    pub ssl_compression: bool,
    pub reconnect_ssl: bool,
}

impl Default for ConnOpts {
    fn default() -> Self {
        ConnOpts {
            cacert: None,
            cakey: None,
            client_cert: None,
            client_key: None,
            cachain: None,
            leaf_crl_url: None,
            dh_group_params: None,
            ecdh_curve: None,
            ciphers: None,
            ciphersuites: None,
            force_ssl_proto: None,
            disabled_ssl_protos: Vec::new(),
            enabled_ssl_protos: Vec::new(),
            min_ssl_proto: None,
            max_ssl_proto: None,
            validate_proto: false,
            max_http_header_size: HTTP_HEADER_SIZE_DEFAULT,
            verify_peer: false,
            allow_wrong_host: false,
            remove_http_accept_encoding: true,
            remove_http_referer: true,
            deny_ocsp: false,
            passthrough: false,
            ssl_compression: false,
            reconnect_ssl: false,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: "expected yes or no".into(),
        }),
    }
}

impl ConnOpts {
    /// Apply one `Key Value` pair. Returns `UnknownOption` for keys that are
    /// not connection options, so callers can try their own keys first.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "CACert" => self.cacert = Some(expand_path(value)),
            "CAKey" => self.cakey = Some(expand_path(value)),
            "ClientCert" => self.client_cert = Some(expand_path(value)),
            "ClientKey" => self.client_key = Some(expand_path(value)),
            "CAChain" => self.cachain = Some(expand_path(value)),
            "LeafCRLURL" => self.leaf_crl_url = Some(value.to_string()),
            "DHGroupParams" => self.dh_group_params = Some(expand_path(value)),
            "ECDHCurve" => self.ecdh_curve = Some(value.to_string()),
            "Ciphers" => self.ciphers = Some(value.to_string()),
            "CipherSuites" => self.ciphersuites = Some(value.to_string()),
            "ForceSSLProto" => self.force_ssl_proto = Some(value.parse()?),
            "DisableSSLProto" => self.disabled_ssl_protos.push(value.parse()?),
            "EnableSSLProto" => self.enabled_ssl_protos.push(value.parse()?),
            "MinSSLProto" => self.min_ssl_proto = Some(value.parse()?),
            "MaxSSLProto" => self.max_ssl_proto = Some(value.parse()?),
            "ValidateProto" => self.validate_proto = parse_bool(key, value)?,
            "MaxHTTPHeaderSize" => {
                let n: usize = value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.into(),
                    value: value.into(),
                    reason: "expected an integer".into(),
                })?;
                if !(HTTP_HEADER_SIZE_MIN..=HTTP_HEADER_SIZE_MAX).contains(&n) {
                    return Err(ConfigError::InvalidValue {
                        key: key.into(),
                        value: value.into(),
                        reason: format!(
                            "expected {}..{}",
                            HTTP_HEADER_SIZE_MIN, HTTP_HEADER_SIZE_MAX
                        ),
                    });
                }
                self.max_http_header_size = n;
            }
            "VerifyPeer" => self.verify_peer = parse_bool(key, value)?,
            "AllowWrongHost" => self.allow_wrong_host = parse_bool(key, value)?,
            "RemoveHTTPAcceptEncoding" => {
                self.remove_http_accept_encoding = parse_bool(key, value)?
            }
            "RemoveHTTPReferer" => self.remove_http_referer = parse_bool(key, value)?,
            "DenyOCSP" => self.deny_ocsp = parse_bool(key, value)?,
            "Passthrough" => self.passthrough = parse_bool(key, value)?,
            "SSLCompression" => self.ssl_compression = parse_bool(key, value)?,
            "ReconnectSSL" => self.reconnect_ssl = parse_bool(key, value)?,
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
        Ok(())
    }
}

fn expand_path(value: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(value).to_string())
}

/// One listening endpoint: protocol, address, and interception mode.
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub proto: Proto,
    pub listen: SocketAddr,
    /// Divert to a downstream consumer instead of splitting.
    pub divert: bool,
    /// Where the consumer listens; required in divert mode.
    pub divert_addr: Option<SocketAddr>,
    pub opts: Arc<ConnOpts>,
}

impl ProxySpec {
    /// Parse the `proto addr port [split | divert addr port]` form.
    pub fn parse(spec: &str, defaults: &Arc<ConnOpts>) -> Result<Self, ConfigError> {
        let bad = |reason: &str| ConfigError::InvalidValue {
            key: "ProxySpec".into(),
            value: spec.into(),
            reason: reason.into(),
        };
        let mut it = spec.split_whitespace();
        let proto: Proto = it
            .next()
            .ok_or_else(|| ConfigError::UnknownProto(String::new()))?
            .parse()?;
        let addr = it.next().unwrap_or("0.0.0.0");
        let port = it.next().unwrap_or("10443");
        let listen: SocketAddr = format!("{addr}:{port}")
            .parse()
            .map_err(|_| bad("expected 'proto addr port [split | divert addr port]'"))?;
        let (divert, divert_addr) = match it.next() {
            None | Some("split") => (false, None),
            Some("divert") => {
                let daddr = it
                    .next()
                    .ok_or_else(|| bad("divert requires a consumer address"))?;
                let dport = it
                    .next()
                    .ok_or_else(|| bad("divert requires a consumer port"))?;
                let target: SocketAddr = format!("{daddr}:{dport}")
                    .parse()
                    .map_err(|_| bad("invalid divert consumer address"))?;
                (true, Some(target))
            }
            Some(_) => return Err(bad("expected divert or split")),
        };
        Ok(ProxySpec {
            proto,
            listen,
            divert,
            divert_addr,
            opts: defaults.clone(),
        })
    }
}

/// On-disk configuration file shape (TOML).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    proxyspecs: Vec<String>,
    options: std::collections::BTreeMap<String, String>,
    rules: Vec<String>,
    capture_dir: Option<PathBuf>,
    pcap_file: Option<PathBuf>,
    connect_log: Option<PathBuf>,
    master_key_log: Option<PathBuf>,
    conn_idle_timeout: Option<u64>,
    expired_conn_check_period: Option<u64>,
    max_workers: Option<usize>,
    fallback_dst: Option<SocketAddr>,
    target_cert_dir: Option<PathBuf>,
    default_leaf_cert: Option<PathBuf>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub specs: Vec<ProxySpec>,
    pub opts: Arc<ConnOpts>,
    /// Raw filter rule lines, parsed by the filter engine.
    pub rules: Vec<String>,
    pub capture_dir: Option<PathBuf>,
    pub pcap_file: Option<PathBuf>,
    pub connect_log: Option<PathBuf>,
    pub master_key_log: Option<PathBuf>,
    pub conn_idle_timeout: Duration,
    pub expired_conn_check_period: Duration,
    pub max_workers: Option<usize>,
    /// Destination used when the socket carries no NAT state, for running
    /// outside transparent mode.
    pub fallback_dst: Option<SocketAddr>,
    /// Directory of preloaded per-site leaf certificates.
    pub target_cert_dir: Option<PathBuf>,
    /// Leaf served when nothing else is available.
    pub default_leaf_cert: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            specs: Vec::new(),
            opts: Arc::new(ConnOpts::default()),
            rules: Vec::new(),
            capture_dir: None,
            pcap_file: None,
            connect_log: None,
            master_key_log: None,
            conn_idle_timeout: Duration::from_secs(CONN_IDLE_TIMEOUT_DEFAULT),
            expired_conn_check_period: Duration::from_secs(EXPIRED_CHECK_PERIOD_DEFAULT),
            max_workers: None,
            fallback_dst: None,
            target_cert_dir: None,
            default_leaf_cert: None,
        }
    }
}

fn clamp_secs(key: &str, val: u64, min: u64, max: u64) -> Result<Duration, ConfigError> {
    if !(min..=max).contains(&val) {
        return Err(ConfigError::InvalidValue {
            key: key.into(),
            value: val.to_string(),
            reason: format!("expected {min}..{max}"),
        });
    }
    Ok(Duration::from_secs(val))
}

impl Config {
    /// Load a TOML config file and resolve it into a runtime config.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let file: FileConfig = toml::from_str(&raw)?;

        let mut opts = ConnOpts::default();
        for (key, value) in &file.options {
            opts.set(key, value)?;
        }
        let opts = Arc::new(opts);

        let mut specs = Vec::new();
        for spec in &file.proxyspecs {
            specs.push(ProxySpec::parse(spec, &opts)?);
        }

        let mut cfg = Config {
            specs,
            opts,
            rules: file.rules,
            capture_dir: file.capture_dir,
            pcap_file: file.pcap_file,
            connect_log: file.connect_log,
            master_key_log: file.master_key_log,
            ..Config::default()
        };
        if let Some(t) = file.conn_idle_timeout {
            cfg.conn_idle_timeout = clamp_secs(
                "conn_idle_timeout",
                t,
                CONN_IDLE_TIMEOUT_MIN,
                CONN_IDLE_TIMEOUT_MAX,
            )?;
        }
        if let Some(t) = file.expired_conn_check_period {
            cfg.expired_conn_check_period = clamp_secs(
                "expired_conn_check_period",
                t,
                EXPIRED_CHECK_PERIOD_MIN,
                EXPIRED_CHECK_PERIOD_MAX,
            )?;
        }
        cfg.max_workers = file.max_workers;
        cfg.fallback_dst = file.fallback_dst;
        cfg.target_cert_dir = file.target_cert_dir;
        cfg.default_leaf_cert = file.default_leaf_cert;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_tags_round_trip() {
        for tag in [
            "tcp", "ssl", "http", "https", "autossl", "pop3", "pop3s", "smtp", "smtps",
        ] {
            let proto: Proto = tag.parse().unwrap();
            assert_eq!(proto.as_str(), tag);
        }
        assert!("quic".parse::<Proto>().is_err());
    }

    #[test]
    fn test_conn_opts_defaults() {
        let opts = ConnOpts::default();
        assert_eq!(opts.max_http_header_size, 8192);
        assert!(opts.remove_http_accept_encoding);
        assert!(opts.remove_http_referer);
        assert!(!opts.deny_ocsp);
        assert!(!opts.passthrough);
    }

    #[test]
    fn test_conn_opts_set_known_keys() {
        let mut opts = ConnOpts::default();
        opts.set("DenyOCSP", "yes").unwrap();
        opts.set("AllowWrongHost", "on").unwrap();
        opts.set("MaxHTTPHeaderSize", "4096").unwrap();
        opts.set("MinSSLProto", "tls12").unwrap();
        assert!(opts.deny_ocsp);
        assert!(opts.allow_wrong_host);
        assert_eq!(opts.max_http_header_size, 4096);
        assert_eq!(opts.min_ssl_proto, Some(SslProto::Tls12));
    }

    #[test]
    fn test_max_http_header_size_bounds() {
        let mut opts = ConnOpts::default();
        assert!(opts.set("MaxHTTPHeaderSize", "512").is_err());
        assert!(opts.set("MaxHTTPHeaderSize", "70000").is_err());
        assert!(opts.set("MaxHTTPHeaderSize", "1024").is_ok());
        assert!(opts.set("MaxHTTPHeaderSize", "65536").is_ok());
    }

    #[test]
    fn test_unknown_option_is_reported() {
        let mut opts = ConnOpts::default();
        match opts.set("NoSuchOption", "1") {
            Err(ConfigError::UnknownOption(key)) => assert_eq!(key, "NoSuchOption"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_proxyspec_parse() {
        let opts = Arc::new(ConnOpts::default());
        let spec = ProxySpec::parse("https 127.0.0.1 8443 divert 127.0.0.1 9090", &opts).unwrap();
        assert_eq!(spec.proto, Proto::Https);
        assert_eq!(spec.listen, "127.0.0.1:8443".parse().unwrap());
        assert!(spec.divert);
        assert_eq!(spec.divert_addr, Some("127.0.0.1:9090".parse().unwrap()));

        let spec = ProxySpec::parse("tcp 0.0.0.0 9999", &opts).unwrap();
        assert!(!spec.divert);
        assert_eq!(spec.proto, Proto::Tcp);

        // Divert without a consumer address is rejected.
        assert!(ProxySpec::parse("http 0.0.0.0 8080 divert", &opts).is_err());
    }
}
