//! Listening-socket enumeration from the local procfs.
//!
//! TCP sockets count when in LISTEN, UDP sockets when bound and unconnected.
//! Owners are found by walking `/proc/<pid>/fd`. Sockets nobody can be
//! attributed to (kernel-owned, or hidden by permissions) are left out.

use anyhow::{anyhow, Context, Result};
use portledger_core::{Observation, PortKey, Protocol, ScanSnapshot};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Anything that can produce the current set of listening tuples for a host.
pub trait SocketSource: Send + Sync {
    /// Errors mean the socket table could not be read at all. Callers must not
    /// treat that as "nothing is listening".
    fn scan(&self, host_id: &str) -> Result<ScanSnapshot>;
}

const TCP_LISTEN: &str = "0A";
const UDP_UNCONNECTED: &str = "07";

struct Table {
    file: &'static str,
    protocol: Protocol,
    wanted_state: &'static str,
    required: bool,
}

const TABLES: &[Table] = &[
    Table { file: "net/tcp", protocol: Protocol::Tcp, wanted_state: TCP_LISTEN, required: true },
    Table { file: "net/tcp6", protocol: Protocol::Tcp, wanted_state: TCP_LISTEN, required: false },
    Table { file: "net/udp", protocol: Protocol::Udp, wanted_state: UDP_UNCONNECTED, required: true },
    Table { file: "net/udp6", protocol: Protocol::Udp, wanted_state: UDP_UNCONNECTED, required: false },
];

/// One row of a `/proc/net/{tcp,udp}[6]` table we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketRow {
    pub port: u16,
    pub inode: u64,
}

/// Parses a procfs socket table, keeping rows in `wanted_state`.
/// Malformed rows are skipped.
pub fn parse_socket_table(content: &str, wanted_state: &str) -> Vec<SocketRow> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 10 || !cols[3].eq_ignore_ascii_case(wanted_state) {
                return None;
            }
            let (_, port_hex) = cols[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok().filter(|p| *p != 0)?;
            let inode = cols[9].parse::<u64>().ok().filter(|i| *i != 0)?;
            Some(SocketRow { port, inode })
        })
        .collect()
}

fn socket_inode(link: &Path) -> Option<u64> {
    let s = link.to_str()?;
    s.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

/// Reads the live socket tables under a procfs root (normally `/proc`).
#[derive(Debug, Clone)]
pub struct ProcfsScanner {
    root: PathBuf,
}

impl Default for ProcfsScanner {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcfsScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ProcfsScanner { root: root.into() }
    }

    /// inode -> lowest owning pid. Unreadable pid dirs are skipped silently.
    fn socket_owners(&self) -> Result<HashMap<u64, u32>> {
        let mut owners: HashMap<u64, u32> = HashMap::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to list {}", self.root.display()))?;
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if pid == 0 {
                continue;
            }
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                let Some(inode) = fs::read_link(fd.path()).ok().as_deref().and_then(socket_inode) else {
                    continue;
                };
                owners
                    .entry(inode)
                    .and_modify(|p| *p = (*p).min(pid))
                    .or_insert(pid);
            }
        }
        Ok(owners)
    }

    fn describe(&self, pid: u32) -> Observation {
        let dir = self.root.join(pid.to_string());
        let process_name = fs::read_to_string(dir.join("comm"))
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default();
        let cmdline = fs::read(dir.join("cmdline"))
            .map(|raw| {
                raw.split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        Observation { pid, process_name, cmdline }
    }
}

impl SocketSource for ProcfsScanner {
    fn scan(&self, host_id: &str) -> Result<ScanSnapshot> {
        let mut rows: Vec<(Protocol, SocketRow)> = Vec::new();
        for table in TABLES {
            let path = self.root.join(table.file);
            match fs::read_to_string(&path) {
                Ok(content) => {
                    rows.extend(parse_socket_table(&content, table.wanted_state).into_iter().map(|r| (table.protocol, r)));
                }
                Err(e) if table.required => {
                    return Err(anyhow!(e).context(format!("socket table {} unreadable", path.display())));
                }
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "optional socket table skipped"),
            }
        }

        let owners = self.socket_owners()?;
        let mut best: HashMap<PortKey, u32> = HashMap::new();
        for (protocol, row) in rows {
            let Some(&pid) = owners.get(&row.inode) else {
                continue;
            };
            let key = PortKey::new(host_id, protocol, row.port).map_err(|e| anyhow!(e))?;
            best.entry(key).and_modify(|p| *p = (*p).min(pid)).or_insert(pid);
        }

        let mut cache: HashMap<u32, Observation> = HashMap::new();
        let snapshot: ScanSnapshot = best
            .into_iter()
            .map(|(key, pid)| {
                let obs = cache.entry(pid).or_insert_with(|| self.describe(pid)).clone();
                (key, obs)
            })
            .collect();
        tracing::debug!(host_id, listening = snapshot.len(), "procfs scan complete");
        Ok(snapshot)
    }
}

/// Serves whatever snapshot it was last given. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct StaticSource {
    snapshot: Mutex<Option<ScanSnapshot>>,
}

impl StaticSource {
    pub fn new(snapshot: ScanSnapshot) -> Self {
        StaticSource { snapshot: Mutex::new(Some(snapshot)) }
    }

    /// A source whose socket table is unreadable.
    pub fn unavailable() -> Self {
        StaticSource { snapshot: Mutex::new(None) }
    }

    pub fn set(&self, snapshot: Option<ScanSnapshot>) {
        if let Ok(mut slot) = self.snapshot.lock() {
            *slot = snapshot;
        }
    }
}

impl SocketSource for StaticSource {
    fn scan(&self, host_id: &str) -> Result<ScanSnapshot> {
        let slot = self.snapshot.lock().map_err(|_| anyhow!("static source lock poisoned"))?;
        let snapshot = slot.as_ref().ok_or_else(|| anyhow!("socket table unavailable"))?;
        Ok(snapshot.iter().filter(|(k, _)| k.host_id == host_id).map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}
