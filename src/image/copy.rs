//! copy_topology - снимок внешней топологии в один слот кольца.
//!
//! Порядок:
//! (a) resize lid_map (рост до max_lid + LID_MAP_SPARE, ужатие до точного размера
//!     при избытке больше LID_MAP_SHRINK_SLACK; хвост при ужатии освобождается);
//! (b) для каждого активного порта - find-or-allocate узла по LID (LID занят другим
//!     GUID -> старый узел освобождается) и заполнение per-slot полей;
//! (c) проход по старому диапазону LID: узлы, не тронутые этим свипом, освобождаются;
//! (d) connect_neighbor для всех портов; смена соседа -> remove/add групп.
//!
//! Ошибка аллокации на любом шаге - PmError::InsufficientMemory: снимок
//! недостроен и доверять ему нельзя.

use log::{debug, trace, warn};

use crate::consts::{LID_MAP_SHRINK_SLACK, LID_MAP_SPARE, MAX_UNICAST_LID};
use crate::error::PmError;
use crate::groups::{GroupClassifier, PortContext};
use crate::image::{
    port_slot, port_slots, ImageCounts, ImageSlot, NodeArena, NodeId, NodeImage, NodeType,
    PortImage, PortRef, SmInfo,
};
use crate::topology::{FabricNode, FabricPort, FabricTopology, TopologySource};

fn oom(what: &str, e: std::collections::TryReserveError) -> PmError {
    PmError::InsufficientMemory(format!("{}: {}", what, e))
}

/// Master/readiness gate; nothing is mutated before it passes.
pub fn check_topology_ready(topo: &FabricTopology) -> Result<(), PmError> {
    if !topo.is_master {
        return Err(PmError::NotMaster);
    }
    if topo.passes_completed == 0 {
        return Err(PmError::TopologyNotReady);
    }
    Ok(())
}

/// Build `slot` from the external topology for sweep `sweep_num`.
///
/// `prev` is the slot of the previous sweep (group membership carry-over and
/// neighbor-change detection). Returns the master/readiness error untouched.
pub fn copy_topology(
    source: &dyn TopologySource,
    slot: &mut ImageSlot,
    prev: Option<&ImageSlot>,
    arena: &mut NodeArena,
    classifier: &GroupClassifier,
    sweep_num: u64,
) -> Result<(), PmError> {
    let topo = source.read();
    check_topology_ready(&topo)?;

    let max_lid = topo.max_lid.min(MAX_UNICAST_LID);
    let old_max = slot.image.max_lid;

    // (a)
    resize_lid_map(slot, arena, max_lid)?;

    // (b)
    let mut counts = ImageCounts::default();
    for fnode in &topo.nodes {
        if !fnode.ports.iter().any(|p| p.active) {
            continue;
        }
        if fnode.lid == 0 || fnode.lid > max_lid {
            debug!(
                "copy_topology: node {:#018x} has LID {} outside 1..={}; skipped",
                fnode.guid, fnode.lid, max_lid
            );
            continue;
        }
        let id = attach_node(slot, arena, fnode, sweep_num)?;
        copy_node_ports(slot, id, fnode, classifier, &mut counts)?;
    }

    // (c)
    let walk_to = (old_max.max(max_lid) as usize + 1).min(slot.image.lid_map.len());
    for lid in 1..walk_to {
        let Some(id) = slot.image.lid_map[lid] else {
            continue;
        };
        let stale = match slot.node(id) {
            Some(n) => n.epoch != sweep_num || n.lid as usize != lid,
            None => true,
        };
        if stale {
            drop_lid_entry(slot, arena, lid, sweep_num);
        }
    }

    slot.image.max_lid = max_lid;
    slot.image.sms = [SmInfo::default(); 2];
    for (i, sm) in topo.sms.iter().take(2).enumerate() {
        slot.image.sms[i] = SmInfo {
            lid: sm.lid,
            port_num: sm.port_num,
            priority: sm.priority,
            state: sm.state,
        };
    }
    counts.num_sms = topo.sms.len() as u32;

    // (d)
    counts.num_links = connect_neighbor(slot, prev, arena, classifier, sweep_num);
    slot.image.counts = counts;

    trace!(
        "copy_topology: sweep {} max_lid={} nodes={} links={}",
        sweep_num,
        max_lid,
        slot.valid_node_count(),
        counts.num_links
    );
    Ok(())
}

fn resize_lid_map(slot: &mut ImageSlot, arena: &mut NodeArena, max_lid: u32) -> Result<(), PmError> {
    let need = max_lid as usize + 1;
    let cap = slot.image.lid_map.len();
    if cap < need {
        let target = need + LID_MAP_SPARE;
        slot.image
            .lid_map
            .try_reserve_exact(target - cap)
            .map_err(|e| oom("lid_map grow", e))?;
        slot.image.lid_map.resize(target, None);
        debug!("copy_topology: lid_map grown {} -> {}", cap, target);
    } else if cap > need + LID_MAP_SHRINK_SLACK {
        for lid in need..cap {
            if let Some(id) = slot.image.lid_map[lid].take() {
                release_node(slot, arena, id, u64::MAX);
            }
        }
        slot.image.lid_map.truncate(need);
        slot.image.lid_map.shrink_to_fit();
        debug!("copy_topology: lid_map shrunk {} -> {}", cap, need);
    }
    Ok(())
}

/// Release the slot's reference; forget the slot data unless touched by `epoch`.
fn release_node(slot: &mut ImageSlot, arena: &mut NodeArena, id: NodeId, epoch: u64) {
    let keep = slot.node(id).map(|n| n.epoch == epoch).unwrap_or(false);
    if !keep {
        if let Some(e) = slot.nodes.get_mut(id.index()) {
            *e = None;
        }
    }
    arena.release(id);
}

fn drop_lid_entry(slot: &mut ImageSlot, arena: &mut NodeArena, lid: usize, epoch: u64) {
    if let Some(id) = slot.image.lid_map[lid].take() {
        trace!("copy_topology: LID {} released", lid);
        release_node(slot, arena, id, epoch);
    }
}

/// Find-or-allocate the node for the fabric node's LID in this slot.
fn attach_node(
    slot: &mut ImageSlot,
    arena: &mut NodeArena,
    fnode: &FabricNode,
    sweep_num: u64,
) -> Result<NodeId, PmError> {
    let lid = fnode.lid as usize;

    let id = match slot.image.lid_map[lid] {
        Some(id) if arena.get(id).map(|n| n.guid) == Some(fnode.guid) => {
            // Та же пара LID/GUID: слот уже держит ссылку.
            arena.refresh(id, fnode.node_type, &fnode.description, fnode.num_ports);
            id
        }
        Some(_) => {
            debug!(
                "copy_topology: LID {} reused by guid {:#018x}",
                lid, fnode.guid
            );
            drop_lid_entry(slot, arena, lid, sweep_num);
            let id = arena.acquire(fnode.guid, fnode.node_type, &fnode.description, fnode.num_ports)?;
            slot.image.lid_map[lid] = Some(id);
            id
        }
        None => {
            let id = arena.acquire(fnode.guid, fnode.node_type, &fnode.description, fnode.num_ports)?;
            slot.image.lid_map[lid] = Some(id);
            id
        }
    };

    if slot.nodes.len() <= id.index() {
        let grow = id.index() + 1 - slot.nodes.len();
        slot.nodes
            .try_reserve(grow)
            .map_err(|e| oom("slot nodes grow", e))?;
        slot.nodes.resize_with(id.index() + 1, || None);
    }

    let nslots = port_slots(fnode.node_type, fnode.num_ports);
    let fresh = match &slot.nodes[id.index()] {
        Some(n) => n.epoch != sweep_num,
        None => true,
    };
    if fresh {
        let mut ports = Vec::new();
        ports
            .try_reserve_exact(nslots)
            .map_err(|e| oom("node ports", e))?;
        ports.resize_with(nslots, || None);
        slot.nodes[id.index()] = Some(NodeImage {
            lid: fnode.lid,
            epoch: sweep_num,
            no_response: fnode.no_response,
            ports,
        });
    }
    Ok(id)
}

fn port_image(p: &FabricPort, vfs: Vec<u16>) -> PortImage {
    PortImage {
        port_num: p.port_num,
        guid: p.guid,
        active: p.active,
        mtu: p.mtu,
        width: p.width,
        speed: p.speed,
        vl_select_mask: p.vl_select_mask,
        vfs,
        neighbor_key: p.neighbor,
        skipped: p.skipped,
        raw: p.counters,
        ..PortImage::default()
    }
}

fn copy_node_ports(
    slot: &mut ImageSlot,
    id: NodeId,
    fnode: &FabricNode,
    classifier: &GroupClassifier,
    counts: &mut ImageCounts,
) -> Result<(), PmError> {
    let Some(node) = slot.nodes[id.index()].as_mut() else {
        return Ok(());
    };
    if fnode.node_type == NodeType::Switch {
        counts.num_switch_nodes += 1;
    }
    if fnode.no_response {
        counts.num_no_resp_nodes += 1;
    }
    let mut any_skipped = false;
    for p in fnode.ports.iter().filter(|p| p.active) {
        let idx = port_slot(fnode.node_type, p.port_num);
        if idx >= node.ports.len() {
            warn!(
                "copy_topology: node {:#018x} port {} beyond num_ports {}; ignored",
                fnode.guid, p.port_num, fnode.num_ports
            );
            continue;
        }
        let (vfs, _) = classifier.assign_vfs((fnode.guid, p.port_num), &p.vfs);
        node.ports[idx] = Some(port_image(p, vfs));
        match fnode.node_type {
            NodeType::Switch => counts.num_switch_ports += 1,
            NodeType::Hfi => counts.num_hfi_ports += 1,
        }
        if fnode.no_response {
            counts.num_no_resp_ports += 1;
        }
        if p.skipped {
            counts.num_skipped_ports += 1;
            any_skipped = true;
        }
    }
    if any_skipped {
        counts.num_skipped_nodes += 1;
    }
    Ok(())
}

/// Resolve neighbor references for every port of the slot and maintain group
/// membership. Returns the number of links (each counted once).
pub fn connect_neighbor(
    slot: &mut ImageSlot,
    prev: Option<&ImageSlot>,
    arena: &NodeArena,
    classifier: &GroupClassifier,
    sweep_num: u64,
) -> u32 {
    // Сначала резолвим соседей (слот только читается), потом применяем.
    let mut resolved: Vec<(NodeId, usize, Option<PortRef>, bool)> = Vec::new();
    for lid in 1..slot.image.lid_map.len() {
        let Some(id) = slot.image.lid_map[lid] else {
            continue;
        };
        let Some(node) = slot.live_node(id, sweep_num) else {
            continue;
        };
        let this_type = arena.get(id).map(|n| n.node_type);
        for (pidx, port) in node.ports.iter().enumerate() {
            let Some(port) = port else { continue };
            let neighbor = port.neighbor_key.and_then(|(guid, pnum)| {
                let nid = arena.lookup_guid(guid)?;
                slot.live_node(nid, sweep_num)?.port(pnum)?;
                Some(PortRef {
                    node: nid,
                    port_num: pnum,
                })
            });
            let internal = neighbor.is_some_and(|r| {
                this_type == Some(NodeType::Switch)
                    && arena.get(r.node).map(|n| n.node_type) == Some(NodeType::Switch)
            });
            resolved.push((id, pidx, neighbor, internal));
        }
    }

    let prev_epoch = prev.map(|p| p.image.sweep_num).unwrap_or(0);
    let mut links = 0u32;
    for (id, pidx, neighbor, internal) in resolved {
        let carried = prev
            .and_then(|p| p.live_node(id, prev_epoch))
            .and_then(|n| n.ports.get(pidx))
            .and_then(|p| p.as_ref())
            .filter(|pp| pp.neighbor == neighbor && pp.internal == internal)
            .map(|pp| pp.groups.clone());

        let Some(port) = slot.nodes[id.index()]
            .as_mut()
            .and_then(|n| n.ports[pidx].as_mut())
        else {
            continue;
        };
        port.neighbor = neighbor;
        port.internal = internal;

        match carried {
            Some(groups) => port.groups = groups,
            None => {
                classifier.remove_from_groups(port);
                if let (Some(r), Some(pm)) = (neighbor, arena.get(id)) {
                    let ctx = PortContext {
                        node: pm,
                        port,
                        neighbor: arena.get(r.node),
                    };
                    let (groups, _) = classifier.add_to_groups(&ctx);
                    port.groups = groups;
                }
            }
        }

        if let Some(r) = neighbor {
            // Каждую связь считаем один раз: со стороны меньшего (node, port).
            if (id, port.port_num) < (r.node, r.port_num) {
                links += 1;
            }
        }
    }
    links
}
