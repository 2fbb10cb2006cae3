use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::EnumIter;

pub mod block;
pub mod moved;
pub mod node;

/// Storage media classes a node may report. A group only ever trades
/// blocks with groups of the same type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumIter,
)]
pub enum StorageType {
    Disk,
    Ssd,
    Archive,
    RamDisk,
}

/// Identity of a storage group: all storage of a single type on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId {
    pub node: String,
    pub kind: StorageType,
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?}", self.node, self.kind)
    }
}

/// Static description of a storage host as reported by the name service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub uuid: String,
    pub hostname: String,
    pub ip: String,
    /// `host:port` the node's transfer service listens on.
    pub transfer_addr: String,
    pub rack: String,
    pub node_group: Option<String>,
    pub decommissioning: bool,
}

/// Host list backing `--include`/`--exclude`. An entry matches a node by
/// peer hostname or ip, each optionally qualified with `:port`.
#[derive(Debug, Default, Clone)]
pub struct HostSet {
    entries: HashSet<String>,
}

impl HostSet {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Read one host per line; blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
        let mut file = std::fs::OpenOptions::new().read(true).open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Ok(Self::new(
            content
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        ))
    }

    pub fn extend(&mut self, other: HostSet) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn matches(&self, node: &NodeInfo) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let port = node
            .transfer_addr
            .contains(':')
            .then(|| node.transfer_addr.rsplit(':').next().unwrap_or_default());
        for key in [&node.ip, &node.hostname] {
            if self.entries.contains(key.as_str()) {
                return true;
            }
            if let Some(port) = port {
                if self.entries.contains(&format!("{key}:{port}")) {
                    return true;
                }
            }
        }
        false
    }
}
