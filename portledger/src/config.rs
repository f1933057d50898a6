use anyhow::{anyhow, Context, Result};
use portledger_core::{PortKey, Protocol, DEFAULT_HOST_ID};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "portledger.yaml";
const DEFAULT_DATABASE: &str = "data/portledger.db";
const DEFAULT_BIND: &str = "127.0.0.1:2008";
const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_INSPECT_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ServeConfig {
    pub bind: Option<String>,
    pub interval_secs: Option<u64>,
    pub frontend_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ScanConfig {
    pub proc_root: Option<PathBuf>,
    pub heartbeat: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct InspectConfig {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub host_id: Option<String>,
    pub database: Option<PathBuf>,
    pub serve: Option<ServeConfig>,
    pub scan: Option<ScanConfig>,
    pub inspect: Option<InspectConfig>,
}

/// Reads `path`, or `./portledger.yaml` when no path is given and that file exists.
/// An explicitly named file that cannot be read or parsed is an error.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("failed to read config {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s).with_context(|| format!("invalid config {}", path.display()))?;
    Ok(Some(cfg))
}

/// Values given on the command line. They win over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub host_id: Option<String>,
    pub database: Option<PathBuf>,
    pub bind: Option<String>,
    pub interval_secs: Option<u64>,
}

/// Effective settings: CLI flags, then the config file, then defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host_id: String,
    pub database: PathBuf,
    pub bind: SocketAddr,
    pub interval: Duration,
    pub frontend_dir: PathBuf,
    pub proc_root: PathBuf,
    pub heartbeat: bool,
    pub inspect_program: String,
    pub inspect_args: Vec<String>,
    pub inspect_timeout: Duration,
}

impl Settings {
    pub fn resolve(cfg: Option<&Config>, o: Overrides) -> Result<Self> {
        let empty = Config::default();
        let cfg = cfg.unwrap_or(&empty);
        let serve = cfg.serve.clone().unwrap_or_default();
        let scan = cfg.scan.clone().unwrap_or_default();
        let inspect = cfg.inspect.clone().unwrap_or_default();

        let host_id = o.host_id.or_else(|| cfg.host_id.clone()).unwrap_or_else(|| DEFAULT_HOST_ID.to_string());
        // same rules every recorded tuple is held to
        PortKey::new(host_id.as_str(), Protocol::Tcp, 1).context("invalid host_id")?;

        let bind_raw = o.bind.or(serve.bind).unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind_raw.parse().with_context(|| format!("invalid bind address {bind_raw:?}"))?;

        let interval_secs = o.interval_secs.or(serve.interval_secs).unwrap_or(DEFAULT_INTERVAL_SECS);
        if interval_secs == 0 {
            return Err(anyhow!("interval_secs must be at least 1"));
        }

        Ok(Settings {
            host_id,
            database: o.database.or_else(|| cfg.database.clone()).unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE)),
            bind,
            interval: Duration::from_secs(interval_secs),
            frontend_dir: serve.frontend_dir.unwrap_or_else(|| PathBuf::from("frontend")),
            proc_root: scan.proc_root.unwrap_or_else(|| PathBuf::from("/proc")),
            heartbeat: scan.heartbeat.unwrap_or(false),
            inspect_program: inspect.program.unwrap_or_else(|| "witr".to_string()),
            inspect_args: inspect.args.unwrap_or_else(|| vec!["--port".to_string(), "{port}".to_string()]),
            inspect_timeout: Duration::from_millis(inspect.timeout_ms.unwrap_or(DEFAULT_INSPECT_TIMEOUT_MS)),
        })
    }
}
