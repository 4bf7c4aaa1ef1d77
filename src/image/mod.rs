//! Image model: one ring slot per sweep.
//!
//! Раскладка:
//! - arena.rs: NodeArena (узлы общие для всех слотов, ключ - port GUID, refcount);
//! - ring.rs:  RingState (выбор следующего слота, freeze-frame аренды);
//! - copy.rs:  copy_topology / connect_neighbor (снимок внешней топологии в слот).
//!
//! Данные конкретного слота (LID карта, per-node/per-port поля, статистика групп)
//! живут в ImageSlot; узлы из арены адресуются NodeId, соседи - PortRef.

pub mod arena;
pub mod copy;
pub mod ring;

use serde::{Deserialize, Serialize};

use crate::consts::{ERR_CATEGORIES, NUM_PORT_COUNTERS};
use crate::groups::GroupStats;

pub use arena::{NodeArena, NodeId, PmNode};
pub use copy::copy_topology;
pub use ring::{FreezeInfo, RingState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Hfi,
    Switch,
}

impl NodeType {
    pub fn as_u8(self) -> u8 {
        match self {
            NodeType::Hfi => 1,
            NodeType::Switch => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(NodeType::Hfi),
            2 => Some(NodeType::Switch),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortCounters {
    /// Transmitted data, in 4-byte words.
    pub xmit_data: u64,
    pub rcv_data: u64,
    pub xmit_pkts: u64,
    pub rcv_pkts: u64,
    pub symbol_errors: u64,
    pub link_error_recovery: u64,
    pub link_downed: u64,
    pub rcv_errors: u64,
    pub rcv_remote_phys_errors: u64,
    pub rcv_switch_relay_errors: u64,
    pub xmit_discards: u64,
    pub xmit_wait: u64,
    pub congestion_discards: u64,
    pub local_link_integrity_errors: u64,
}

impl PortCounters {
    pub fn to_array(&self) -> [u64; NUM_PORT_COUNTERS] {
        [
            self.xmit_data,
            self.rcv_data,
            self.xmit_pkts,
            self.rcv_pkts,
            self.symbol_errors,
            self.link_error_recovery,
            self.link_downed,
            self.rcv_errors,
            self.rcv_remote_phys_errors,
            self.rcv_switch_relay_errors,
            self.xmit_discards,
            self.xmit_wait,
            self.congestion_discards,
            self.local_link_integrity_errors,
        ]
    }

    pub fn from_array(a: [u64; NUM_PORT_COUNTERS]) -> Self {
        Self {
            xmit_data: a[0],
            rcv_data: a[1],
            xmit_pkts: a[2],
            rcv_pkts: a[3],
            symbol_errors: a[4],
            link_error_recovery: a[5],
            link_downed: a[6],
            rcv_errors: a[7],
            rcv_remote_phys_errors: a[8],
            rcv_switch_relay_errors: a[9],
            xmit_discards: a[10],
            xmit_wait: a[11],
            congestion_discards: a[12],
            local_link_integrity_errors: a[13],
        }
    }

    /// Field-wise sum, saturating.
    pub fn accumulate(&mut self, other: &PortCounters) {
        let mut a = self.to_array();
        for (x, y) in a.iter_mut().zip(other.to_array()) {
            *x = x.saturating_add(y);
        }
        *self = Self::from_array(a);
    }

    /// Delta against a previous raw sample. Counters that went backwards were
    /// cleared in between; the raw value is then the delta.
    pub fn delta_since(&self, prev: &PortCounters) -> PortCounters {
        let cur = self.to_array();
        let old = prev.to_array();
        let mut out = [0u64; NUM_PORT_COUNTERS];
        for i in 0..NUM_PORT_COUNTERS {
            out[i] = if cur[i] >= old[i] { cur[i] - old[i] } else { cur[i] };
        }
        Self::from_array(out)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImageState {
    #[default]
    Invalid,
    InProgress,
    Valid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SmInfo {
    pub lid: u32,
    pub port_num: u8,
    pub priority: u8,
    pub state: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageCounts {
    pub num_hfi_ports: u32,
    pub num_switch_nodes: u32,
    pub num_switch_ports: u32,
    pub num_links: u32,
    pub num_sms: u32,
    pub num_no_resp_nodes: u32,
    pub num_no_resp_ports: u32,
    pub num_skipped_nodes: u32,
    pub num_skipped_ports: u32,
}

/// Per-slot sweep header.
#[derive(Clone, Debug, Default)]
pub struct Image {
    pub state: ImageState,
    pub sweep_num: u64,
    /// Unix seconds.
    pub sweep_start: u64,
    pub sweep_duration_us: u64,
    pub image_interval: u32,
    pub max_lid: u32,
    pub lid_map: Vec<Option<NodeId>>,
    pub counts: ImageCounts,
    pub sms: [SmInfo; 2],
}

/// Ссылка на порт соседа (слабая: только отношение, пересчитывается каждый свип).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: NodeId,
    pub port_num: u8,
}

#[derive(Clone, Debug, Default)]
pub struct PortImage {
    pub port_num: u8,
    pub guid: u64,
    pub active: bool,
    pub mtu: u8,
    pub width: u8,
    pub speed: u8,
    pub vl_select_mask: u32,
    pub vfs: Vec<u16>,
    /// Raw neighbor key from the topology; resolved into `neighbor` by connect_neighbor.
    pub neighbor_key: Option<(u64, u8)>,
    pub neighbor: Option<PortRef>,
    /// Switch-to-switch link.
    pub internal: bool,
    pub skipped: bool,
    /// Group indexes (bounded by the per-port capacity).
    pub groups: Vec<u16>,
    pub raw: PortCounters,
    pub delta: PortCounters,
    pub util_mbps: u32,
    pub errors: [u32; ERR_CATEGORIES],
}

#[derive(Clone, Debug, Default)]
pub struct NodeImage {
    pub lid: u32,
    /// Sweep number that last touched this node in this slot.
    pub epoch: u64,
    pub no_response: bool,
    /// Switch: index == port number (0..=num_ports). HFI: single entry at 0.
    pub ports: Vec<Option<PortImage>>,
}

impl NodeImage {
    pub fn port(&self, port_num: u8) -> Option<&PortImage> {
        self.ports
            .iter()
            .flatten()
            .find(|p| p.port_num == port_num)
    }
}

/// Position of a port inside NodeImage::ports.
pub fn port_slot(node_type: NodeType, port_num: u8) -> usize {
    match node_type {
        NodeType::Switch => port_num as usize,
        NodeType::Hfi => 0,
    }
}

pub fn port_slots(node_type: NodeType, num_ports: u8) -> usize {
    match node_type {
        NodeType::Switch => num_ports as usize + 1,
        NodeType::Hfi => 1,
    }
}

/// One ring slot: header + per-node data + group/VF aggregates.
#[derive(Debug, Default)]
pub struct ImageSlot {
    pub image: Image,
    /// Indexed by NodeId.
    pub nodes: Vec<Option<NodeImage>>,
    pub groups: Vec<GroupStats>,
    pub vfs: Vec<GroupStats>,
}

impl ImageSlot {
    pub fn node(&self, id: NodeId) -> Option<&NodeImage> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    /// Node touched by the sweep `epoch` in this slot.
    pub fn live_node(&self, id: NodeId, epoch: u64) -> Option<&NodeImage> {
        self.node(id).filter(|n| n.epoch == epoch)
    }

    pub fn node_at_lid(&self, lid: u32) -> Option<NodeId> {
        self.image.lid_map.get(lid as usize).copied().flatten()
    }

    pub fn port_at(&self, r: PortRef) -> Option<&PortImage> {
        self.node(r.node).and_then(|n| n.port(r.port_num))
    }

    pub fn valid_node_count(&self) -> usize {
        self.image.lid_map.iter().filter(|e| e.is_some()).count()
    }
}
