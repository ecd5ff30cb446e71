//! TOML-backed configuration: a single settings file parsed with one
//! `toml::from_str` call.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use trc::{Error, ErrorKind};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub tls: TlsConfig,
    #[serde(default)]
    pub buffers: BuffersConfig,
    #[serde(default)]
    pub devicekey: DeviceKeyConfig,
    pub dns_zone: DnsZoneConfig,
    pub kvpsync: KvpSyncConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    pub dn_listen: SocketAddr,
    pub dns_listen: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub upstream_name: String,
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    pub dn_cert: PathBuf,
    pub dn_key: PathBuf,
    #[serde(default)]
    pub upstream_ca: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct BuffersConfig {
    pub nmembufs: usize,
    pub buf_size: usize,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        BuffersConfig { nmembufs: 64, buf_size: 8192 }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceKeyConfig {
    pub cap_default: usize,
    /// Base XKEYSYNC keep-alive cadence before per-session jitter, matching
    /// dovecot's `imap_idle_notify_interval` default of two minutes.
    #[serde(default = "default_keepalive_base_ms")]
    pub keepalive_base_ms: u64,
}

impl Default for DeviceKeyConfig {
    fn default() -> Self {
        DeviceKeyConfig {
            cap_default: 20,
            keepalive_base_ms: default_keepalive_base_ms(),
        }
    }
}

fn default_keepalive_base_ms() -> u64 {
    120_000
}

#[derive(Debug, Deserialize)]
pub struct DnsZoneConfig {
    pub apex: String,
    pub server_v4: Ipv4Addr,
    #[serde(default)]
    pub server_v6: Option<Ipv6Addr>,
    #[serde(default)]
    pub root_records: Vec<RootRecordConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum RootRecordConfig {
    Ns { value: String },
    Txt { value: String },
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
}

impl RootRecordConfig {
    pub fn to_rdata(&self) -> dns::RData {
        match self {
            RootRecordConfig::Ns { value } => dns::RData::Ns(value.clone()),
            RootRecordConfig::Txt { value } => dns::RData::Txt(value.clone()),
            RootRecordConfig::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => dns::RData::Soa {
                mname: mname.clone(),
                rname: rname.clone(),
                serial: *serial,
                refresh: *refresh,
                retry: *retry,
                expire: *expire,
                minimum: *minimum,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct KvpSyncConfig {
    pub listen: SocketAddr,
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    #[serde(default = "default_ok_expiry_ms")]
    pub ok_expiry_ms: u64,
}

fn default_ok_expiry_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    /// `:memory:` opens an in-process ephemeral database, matching
    /// `rusqlite::Connection::open_in_memory`.
    pub sqlite_path: String,
}

impl Config {
    pub fn load(path: &Path) -> trc::Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::new(ErrorKind::Open, format!("reading config {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| Error::new(ErrorKind::Value, format!("parsing config {}: {e}", path.display())))
    }
}

/// `UV_THREADPOOL_SIZE`-equivalent override: the environment variable wins
/// over the config file, both clamped identically by
/// `imap::clamp_worker_threads`.
pub fn resolve_worker_threads(cfg: &NetworkConfig) -> usize {
    let env_override = std::env::var("CITM_WORKER_THREADS").ok().and_then(|s| s.parse::<usize>().ok());
    imap::clamp_worker_threads(env_override.or(cfg.worker_threads))
}
