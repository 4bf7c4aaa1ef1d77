#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use pmsweep::composite::{CompositeHeader, CompositeNode, CompositePort, ImageSummary};
use pmsweep::consts::HISTORY_VERSION;
use pmsweep::image::{NodeType, PortCounters};
use pmsweep::topology::{FabricNode, FabricPort, FabricTopology, SmRecord};
use pmsweep::{CompositeImage, HistoryOptions};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("pmtest-{prefix}-{pid}-{t}-{id}"))
}

pub const SWITCH_GUID: u64 = 0x1000;
pub const HFI_GUID_BASE: u64 = 0x2000;

pub fn hfi_guid(i: usize) -> u64 {
    HFI_GUID_BASE + i as u64
}

pub fn port(port_num: u8, neighbor: Option<(u64, u8)>) -> FabricPort {
    FabricPort {
        port_num,
        guid: 0,
        active: true,
        mtu: 5,
        width: 4,
        speed: 25,
        vl_select_mask: 0x1,
        vfs: Vec::new(),
        neighbor,
        skipped: false,
        counters: PortCounters::default(),
    }
}

pub fn hfi(guid: u64, lid: u32, desc: &str, neighbor: Option<(u64, u8)>) -> FabricNode {
    let mut p = port(1, neighbor);
    p.guid = guid;
    FabricNode {
        guid,
        node_type: NodeType::Hfi,
        description: desc.to_string(),
        lid,
        num_ports: 1,
        no_response: false,
        ports: vec![p],
    }
}

/// One switch (LID 1) with `n` HFIs (LIDs 2..=n+1), HFI i on switch port i+1.
pub fn star_fabric(n: usize) -> FabricTopology {
    assert!(n <= 255);
    let mut sw_ports = Vec::new();
    let mut nodes = Vec::new();
    for i in 0..n {
        let pnum = (i + 1) as u8;
        sw_ports.push(port(pnum, Some((hfi_guid(i), 1))));
        nodes.push(hfi(
            hfi_guid(i),
            (i + 2) as u32,
            &format!("node{:03} hfi1_0", i),
            Some((SWITCH_GUID, pnum)),
        ));
    }
    nodes.insert(
        0,
        FabricNode {
            guid: SWITCH_GUID,
            node_type: NodeType::Switch,
            description: "edge-sw-01".to_string(),
            lid: 1,
            num_ports: n as u8,
            no_response: false,
            ports: sw_ports,
        },
    );
    FabricTopology {
        is_master: true,
        passes_completed: 1,
        max_lid: (n + 1) as u32,
        nodes,
        sms: vec![SmRecord {
            lid: 1,
            port_num: 0,
            priority: 8,
            state: 3,
        }],
    }
}

/// Advance every port's counters as if `words` 4-byte words were sent.
pub fn advance_counters(t: &mut FabricTopology, words: u64, errors: u64) {
    for n in t.nodes.iter_mut() {
        for p in n.ports.iter_mut() {
            p.counters.xmit_data += words;
            p.counters.rcv_data += words;
            p.counters.xmit_pkts += words / 64;
            p.counters.symbol_errors += errors;
        }
    }
}

pub fn node_mut(t: &mut FabricTopology, guid: u64) -> &mut FabricNode {
    t.nodes
        .iter_mut()
        .find(|n| n.guid == guid)
        .expect("node in fabric")
}

/// Base timestamp for hand-built composites.
pub const T0: u64 = 1_700_000_000;

/// Hand-built single-image composite: one HFI port per guid, util = id * 100.
pub fn composite(ts: u64, id: u64, guids: &[u64]) -> CompositeImage {
    CompositeImage {
        header: CompositeHeader {
            history_version: HISTORY_VERSION,
            timestamp: ts,
            sweep_interval: 10,
            image_ids: vec![id],
            ..CompositeHeader::default()
        },
        summary: ImageSummary {
            sweep_num: id,
            sweep_start: ts,
            sweep_duration_us: 1500,
            image_interval: 10,
            max_lid: guids.len() as u32,
            ..ImageSummary::default()
        },
        groups: Vec::new(),
        vfs: Vec::new(),
        nodes: guids
            .iter()
            .enumerate()
            .map(|(i, &g)| CompositeNode {
                lid: i as u32 + 1,
                guid: g,
                node_type: NodeType::Hfi,
                num_ports: 1,
                no_response: false,
                description: format!("n{} hfi1_0", i),
                ports: vec![CompositePort {
                    port_num: 1,
                    active: true,
                    util_mbps: id as u32 * 100,
                    ..CompositePort::default()
                }],
            })
            .collect(),
    }
}

/// Uncompressed history options.
pub fn history_opts(dir: &Path, depth: usize, per_composite: usize, max: u64) -> HistoryOptions {
    HistoryOptions {
        dir: dir.to_path_buf(),
        ring_depth: depth,
        images_per_composite: per_composite,
        compress: false,
        divisions: 1,
        max_disk_bytes: max,
    }
}
