//! Dispatcher configuration loading.
//!
//! TOML is the sole config source; CLI flags override individual fields.
//! Default config path: `/etc/backhaul/dispatcher.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else has a default, so a host with stock paths needs no
//! config file at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use bh_security::{SecurityConfig, TlsConfig, DEFAULT_SERVICE_PORT};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/backhaul/dispatcher.toml";

/// Seconds a service may take to produce its reply.
const DEFAULT_REP_TIMEOUT_SECS: u64 = 6 * 60 * 60;
/// Seconds to wait for the server's ACK of our REP.
const DEFAULT_ACK_TIMEOUT_SECS: u64 = 10;
/// REP transmissions before giving up on the ACK.
const DEFAULT_REP_TRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub schema_version: u32,
    pub general: GeneralConfig,
    pub net: NetConfig,
    pub tls: TlsSection,
    pub auth: AuthSection,
}

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    /// Default security driver token.
    pub auth: String,
    /// Exit the process once no request has been active for a while.
    pub exit_when_idle: bool,
    /// Directory holding the service executables.
    pub libexec_dir: PathBuf,
    pub rep_timeout: Duration,
    pub ack_timeout: Duration,
    pub rep_tries: u32,
}

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub udp_port: u16,
    pub tcp_port: u16,
    pub require_reserved_peer_port: bool,
    pub bind_reserved_port: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TlsSection {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub fingerprint_file: Option<PathBuf>,
    pub cipher_list: Vec<String>,
    pub check_certificate_host: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSection {
    /// Override for the `.amandahosts` location (tests point this at a
    /// fixture).
    pub hosts_file: Option<PathBuf>,
}

impl DispatcherConfig {
    /// The security-driver view of this configuration.
    pub fn security_config(&self) -> SecurityConfig {
        SecurityConfig {
            require_reserved_peer_port: self.net.require_reserved_peer_port,
            bind_reserved_port: self.net.bind_reserved_port,
            service_port: self.net.tcp_port,
            hosts_file: self.auth.hosts_file.clone(),
            tls: TlsConfig {
                cert_file: self.tls.cert_file.clone(),
                key_file: self.tls.key_file.clone(),
                ca_file: self.tls.ca_file.clone(),
                fingerprint_file: self.tls.fingerprint_file.clone(),
                cipher_list: self.tls.cipher_list.clone(),
                check_certificate_host: self.tls.check_certificate_host,
            },
            ..SecurityConfig::default()
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> DispatcherConfig {
        DispatcherConfig {
            schema_version: 1,
            general: GeneralConfig {
                auth: "bsdtcp".into(),
                exit_when_idle: true,
                libexec_dir: PathBuf::from("/usr/libexec/backhaul"),
                rep_timeout: Duration::from_secs(DEFAULT_REP_TIMEOUT_SECS),
                ack_timeout: Duration::from_secs(DEFAULT_ACK_TIMEOUT_SECS),
                rep_tries: DEFAULT_REP_TRIES,
            },
            net: NetConfig {
                udp_port: DEFAULT_SERVICE_PORT,
                tcp_port: DEFAULT_SERVICE_PORT,
                require_reserved_peer_port: true,
                bind_reserved_port: true,
            },
            tls: TlsSection { check_certificate_host: true, ..TlsSection::default() },
            auth: AuthSection::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every field)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    general: Option<RawGeneral>,
    net: Option<RawNet>,
    tls: Option<RawTls>,
    auth: Option<RawAuth>,
}

#[derive(Debug, Deserialize, Default)]
struct RawGeneral {
    auth: Option<String>,
    exit_when_idle: Option<bool>,
    libexec_dir: Option<PathBuf>,
    rep_timeout_secs: Option<u64>,
    ack_timeout_secs: Option<u64>,
    rep_tries: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RawNet {
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
    require_reserved_peer_port: Option<bool>,
    bind_reserved_port: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTls {
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    ca_file: Option<PathBuf>,
    fingerprint_file: Option<PathBuf>,
    cipher_list: Option<Vec<String>>,
    check_certificate_host: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawAuth {
    hosts_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

/// Load from the default path; a missing file yields the defaults.
pub fn load_config() -> Result<DispatcherConfig, ConfigError> {
    let path = Path::new(DEFAULT_CONFIG_PATH);
    if !path.exists() {
        return Ok(DispatcherConfig::default());
    }
    load_config_from_path(path)
}

pub fn load_config_from_path(path: &Path) -> Result<DispatcherConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&text)
}

pub fn load_config_from_str(text: &str) -> Result<DispatcherConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::Invalid("schema_version is required".into()))?;
    if schema_version != 1 {
        return Err(ConfigError::Invalid(format!(
            "unsupported schema_version {schema_version}"
        )));
    }

    let defaults = DispatcherConfig::default();
    let general = raw.general.unwrap_or_default();
    let net = raw.net.unwrap_or_default();
    let tls = raw.tls.unwrap_or_default();
    let auth = raw.auth.unwrap_or_default();

    Ok(DispatcherConfig {
        schema_version,
        general: GeneralConfig {
            auth: general.auth.unwrap_or(defaults.general.auth),
            exit_when_idle: general
                .exit_when_idle
                .unwrap_or(defaults.general.exit_when_idle),
            libexec_dir: general.libexec_dir.unwrap_or(defaults.general.libexec_dir),
            rep_timeout: Duration::from_secs(
                general.rep_timeout_secs.unwrap_or(DEFAULT_REP_TIMEOUT_SECS),
            ),
            ack_timeout: Duration::from_secs(
                general.ack_timeout_secs.unwrap_or(DEFAULT_ACK_TIMEOUT_SECS),
            ),
            rep_tries: general.rep_tries.unwrap_or(DEFAULT_REP_TRIES).max(1),
        },
        net: NetConfig {
            udp_port: net.udp_port.unwrap_or(defaults.net.udp_port),
            tcp_port: net.tcp_port.unwrap_or(defaults.net.tcp_port),
            require_reserved_peer_port: net
                .require_reserved_peer_port
                .unwrap_or(defaults.net.require_reserved_peer_port),
            bind_reserved_port: net
                .bind_reserved_port
                .unwrap_or(defaults.net.bind_reserved_port),
        },
        tls: TlsSection {
            cert_file: tls.cert_file,
            key_file: tls.key_file,
            ca_file: tls.ca_file,
            fingerprint_file: tls.fingerprint_file,
            cipher_list: tls.cipher_list.unwrap_or_default(),
            check_certificate_host: tls.check_certificate_host.unwrap_or(true),
        },
        auth: AuthSection { hosts_file: auth.hosts_file },
    })
}
