//! External topology seam.
//!
//! SMA/SA слой строит граф фабрики и держит его под своим RwLock. Ядро PM
//! только читает его через TopologySource::read() и никогда не мутирует.
//! Сырые счётчики портов приходят из PMA-слоя вместе с графом.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::Path;
use std::sync::RwLock;

use crate::image::{NodeType, PortCounters};

/// One port as seen by the SM.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricPort {
    pub port_num: u8,
    pub guid: u64,
    pub active: bool,
    pub mtu: u8,
    pub width: u8,
    pub speed: u8,
    pub vl_select_mask: u32,
    /// Virtual fabric indexes this port is a member of.
    pub vfs: Vec<u16>,
    /// (neighbor node guid, neighbor port number)
    pub neighbor: Option<(u64, u8)>,
    /// PMA skipped this port on the last pass.
    pub skipped: bool,
    pub counters: PortCounters,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FabricNode {
    /// Port GUID used as the node key (port 0 GUID on switches).
    pub guid: u64,
    pub node_type: NodeType,
    pub description: String,
    /// LID of the node (switch port 0 / the HFI port).
    pub lid: u32,
    /// Switch: number of external ports (records are 0..=num_ports). HFI: 1.
    pub num_ports: u8,
    #[serde(default)]
    pub no_response: bool,
    pub ports: Vec<FabricPort>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmRecord {
    pub lid: u32,
    pub port_num: u8,
    pub priority: u8,
    pub state: u8,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricTopology {
    pub is_master: bool,
    /// Completed SM sweeps; 0 means the graph is not usable yet.
    pub passes_completed: u64,
    pub max_lid: u32,
    pub nodes: Vec<FabricNode>,
    /// Self first, then the top standby.
    pub sms: Vec<SmRecord>,
}

impl FabricTopology {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read topology {}", path.display()))?;
        let t: FabricTopology = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse topology {}", path.display()))?;
        Ok(t)
    }

    pub fn active_port_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.ports.iter().filter(|p| p.active).count())
            .sum()
    }
}

pub type TopologyGuard<'a> = Box<dyn Deref<Target = FabricTopology> + 'a>;

/// Locked, versioned external graph.
pub trait TopologySource: Send + Sync {
    /// Take the topology read lock for the duration of the guard.
    fn read(&self) -> TopologyGuard<'_>;
}

/// Topology held in-process (static files, tests, simulation).
#[derive(Default)]
pub struct InMemoryTopology {
    inner: RwLock<FabricTopology>,
}

impl InMemoryTopology {
    pub fn new(t: FabricTopology) -> Self {
        Self {
            inner: RwLock::new(t),
        }
    }

    /// Mutate the graph under the write lock (SM side).
    pub fn update<F: FnOnce(&mut FabricTopology)>(&self, f: F) {
        let mut g = match self.inner.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        f(&mut g);
    }
}

impl TopologySource for InMemoryTopology {
    fn read(&self) -> TopologyGuard<'_> {
        match self.inner.read() {
            Ok(g) => Box::new(g),
            Err(p) => Box::new(p.into_inner()),
        }
    }
}
