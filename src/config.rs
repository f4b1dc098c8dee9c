//! Proxy configuration: records, per-proxy settings and the JSON file format.
//!
//! ```json
//! {
//!   "proxies": [
//!     {
//!       "redirect_port": 80,
//!       "proxy_port": 8080,
//!       "records": [
//!         { "source": "10.0.0.5", "forward_address": "192.168.1.10", "forward_port": 80 }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Addresses are accepted as dotted-decimal strings or as host-order integers.

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0} must be non-zero")]
    ZeroPort(&'static str),

    #[error("redirect_port and proxy_port are both {0}")]
    SamePorts(u16),

    #[error("at least one proxy record is required")]
    NoRecords,

    #[error("no proxies configured")]
    NoProxies,

    #[error("source address {0} appears in more than one record")]
    DuplicateSource(Ipv4Addr),

    #[error("port {0} is used by more than one proxy")]
    PortReused(u16),

    #[error("invalid record '{0}' (expected SOURCE=FORWARD:PORT)")]
    InvalidRecord(String),
}

// ── Records ─────────────────────────────────────────────────────────────────

/// One redirect mapping: connections from `source_address` are relayed to
/// `forward_address:forward_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ProxyRecord {
    #[serde(rename = "source", deserialize_with = "deserialize_ipv4")]
    pub source_address: Ipv4Addr,
    #[serde(deserialize_with = "deserialize_ipv4")]
    pub forward_address: Ipv4Addr,
    pub forward_port: u16,
}

impl ProxyRecord {
    pub fn new(source_address: Ipv4Addr, forward_address: Ipv4Addr, forward_port: u16) -> Self {
        Self {
            source_address,
            forward_address,
            forward_port,
        }
    }

    pub fn forward_socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.forward_address, self.forward_port)
    }
}

/// Parses the command-line form `SOURCE=FORWARD:PORT`.
impl FromStr for ProxyRecord {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidRecord(s.to_string());

        let (source, forward) = s.split_once('=').ok_or_else(invalid)?;
        let source: Ipv4Addr = source.trim().parse().map_err(|_| invalid())?;
        let forward: SocketAddrV4 = forward.trim().parse().map_err(|_| invalid())?;

        Ok(Self::new(source, *forward.ip(), forward.port()))
    }
}

/// Read-only record table shared by the rewrite engine and the acceptor.
#[derive(Debug, Clone, Default)]
pub struct RecordTable {
    records: Vec<ProxyRecord>,
}

impl RecordTable {
    pub fn new(records: Vec<ProxyRecord>) -> Self {
        Self { records }
    }

    /// First record whose source address equals `addr`.
    pub fn find_by_source(&self, addr: Ipv4Addr) -> Option<&ProxyRecord> {
        self.records.iter().find(|r| r.source_address == addr)
    }

    pub fn contains_source(&self, addr: Ipv4Addr) -> bool {
        self.find_by_source(addr).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProxyRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ── Per-proxy settings ──────────────────────────────────────────────────────

/// Settings for one `DivertProxy` instance.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    /// Port the redirected clients originally connect to.
    pub redirect_port: u16,
    /// Port the local relay listens on.
    pub proxy_port: u16,
    /// Capture handle priority.
    #[serde(default)]
    pub priority: i16,
    /// Address the relay binds to.
    #[serde(default = "default_listen_address", deserialize_with = "deserialize_ipv4")]
    pub listen_address: Ipv4Addr,
    /// Timeout for connecting to a forward target; blocking connect if unset.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    pub records: Vec<ProxyRecord>,
}

fn default_listen_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

impl ProxySettings {
    pub fn new(redirect_port: u16, proxy_port: u16, records: Vec<ProxyRecord>) -> Self {
        Self {
            redirect_port,
            proxy_port,
            priority: 0,
            listen_address: default_listen_address(),
            connect_timeout_ms: None,
            records,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redirect_port == 0 {
            return Err(ConfigError::ZeroPort("redirect_port"));
        }
        if self.proxy_port == 0 {
            return Err(ConfigError::ZeroPort("proxy_port"));
        }
        if self.redirect_port == self.proxy_port {
            return Err(ConfigError::SamePorts(self.proxy_port));
        }
        if self.records.is_empty() {
            return Err(ConfigError::NoRecords);
        }

        let mut seen = HashSet::with_capacity(self.records.len());
        for record in &self.records {
            if record.forward_port == 0 {
                return Err(ConfigError::ZeroPort("forward_port"));
            }
            if !seen.insert(record.source_address) {
                return Err(ConfigError::DuplicateSource(record.source_address));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DivertProxy({}:{})", self.redirect_port, self.proxy_port)
    }
}

// ── File format ─────────────────────────────────────────────────────────────

/// Top-level configuration file: every proxy hosted by this process.
#[derive(Debug, Clone, Deserialize)]
pub struct DivertConfig {
    pub proxies: Vec<ProxySettings>,
}

impl DivertConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxies.is_empty() {
            return Err(ConfigError::NoProxies);
        }

        let mut ports = HashSet::new();
        for proxy in &self.proxies {
            proxy.validate()?;
            for port in [proxy.redirect_port, proxy.proxy_port] {
                if !ports.insert(port) {
                    return Err(ConfigError::PortReused(port));
                }
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddrRepr {
    Text(String),
    Number(u32),
}

fn deserialize_ipv4<'de, D>(deserializer: D) -> Result<Ipv4Addr, D::Error>
where
    D: Deserializer<'de>,
{
    match AddrRepr::deserialize(deserializer)? {
        AddrRepr::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid IPv4 address '{}'", s))),
        AddrRepr::Number(n) => Ok(Ipv4Addr::from(n)),
    }
}
