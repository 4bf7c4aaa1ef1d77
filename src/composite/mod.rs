//! Composite images - сериализуемая форма одного или нескольких образов.
//!
//! Раскладка файла (LE):
//!   [header HEADER_SIZE][body]
//! body (v11):
//!   [summary][num_groups u32][group rec * n][num_vfs u32][vf rec * n]
//!   [num_nodes u32]{[node rec][port rec * num_port_recs]}*
//! Сжатый файл: body разрезан на num_divisions кусков, каждый - отдельный
//! zstd-кадр; header никогда не сжимается. flat_size - длина несжатого body,
//! body_crc32 - CRC32 несжатого body.
//!
//! Модули:
//! - header.rs   - кодек заголовка;
//! - flatten.rs  - compute_sizes / flatten;
//! - compress.rs - параллельное сжатие по divisions;
//! - rebuild.rs  - разбор с диспетчеризацией по history_version;
//! - legacy.rs   - апгрейд v10;
//! - compound.rs - слияние свипа в composite;
//! - query.rs    - QueryImage (произвольный доступ для клиентов).

pub mod compound;
pub mod compress;
pub mod flatten;
pub mod header;
pub mod legacy;
pub mod query;
pub mod rebuild;

use anyhow::Result;

use crate::consts::{
    HISTORY_VERSION, MAX_GROUPS, MAX_VFABRICS, NAME_LEN, PORT_MAX_GROUPS, PORT_MAX_VFS, UNASSIGNED,
};
use crate::error::PmError;
use crate::groups::{GroupClassifier, GroupStats};
use crate::image::{ImageCounts, ImageSlot, NodeArena, NodeType, PortCounters, SmInfo};

pub use compound::{compound_image, CompoundOutcome, CompoundReport};
pub use compress::{compress_buffer, decompress_buffer, division_chunk};
pub use flatten::{compute_sizes, encode_body, flatten};
pub use header::CompositeHeader;
pub use query::QueryImage;
pub use rebuild::{decode_file, encode_file, rebuild};

/// Sweep-level fields of the newest image in the composite.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageSummary {
    pub sweep_num: u64,
    pub sweep_start: u64,
    pub sweep_duration_us: u64,
    pub image_interval: u32,
    pub max_lid: u32,
    pub counts: ImageCounts,
    pub sms: [SmInfo; 2],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompositeGroup {
    pub name: String,
    pub stats: GroupStats,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositePort {
    pub port_num: u8,
    pub active: bool,
    pub internal: bool,
    pub skipped: bool,
    pub mtu: u8,
    pub width: u8,
    pub speed: u8,
    /// 0 = no neighbor.
    pub neighbor_lid: u32,
    pub neighbor_port: u8,
    pub vl_select_mask: u32,
    pub vf_slots: [i16; PORT_MAX_VFS],
    pub group_slots: [i16; PORT_MAX_GROUPS],
    pub util_mbps: u32,
    pub errors: [u32; crate::consts::ERR_CATEGORIES],
    pub delta: PortCounters,
}

impl Default for CompositePort {
    fn default() -> Self {
        Self {
            port_num: 0,
            active: false,
            internal: false,
            skipped: false,
            mtu: 0,
            width: 0,
            speed: 0,
            neighbor_lid: 0,
            neighbor_port: 0,
            vl_select_mask: 0,
            vf_slots: [UNASSIGNED; PORT_MAX_VFS],
            group_slots: [UNASSIGNED; PORT_MAX_GROUPS],
            util_mbps: 0,
            errors: [0; crate::consts::ERR_CATEGORIES],
            delta: PortCounters::default(),
        }
    }
}

impl CompositePort {
    pub fn vfs(&self) -> impl Iterator<Item = u16> + '_ {
        self.vf_slots.iter().filter(|&&v| v >= 0).map(|&v| v as u16)
    }

    pub fn groups(&self) -> impl Iterator<Item = u16> + '_ {
        self.group_slots.iter().filter(|&&g| g >= 0).map(|&g| g as u16)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositeNode {
    pub lid: u32,
    pub guid: u64,
    pub node_type: NodeType,
    pub num_ports: u8,
    pub no_response: bool,
    pub description: String,
    pub ports: Vec<CompositePort>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositeImage {
    pub header: CompositeHeader,
    pub summary: ImageSummary,
    pub groups: Vec<CompositeGroup>,
    pub vfs: Vec<CompositeGroup>,
    /// Ordered by LID.
    pub nodes: Vec<CompositeNode>,
}

impl CompositeImage {
    pub fn num_images(&self) -> usize {
        self.header.image_ids.len()
    }

    pub fn num_ports(&self) -> usize {
        self.nodes.iter().map(|n| n.ports.len()).sum()
    }

    pub fn node_by_guid(&self, guid: u64) -> Option<&CompositeNode> {
        self.nodes.iter().find(|n| n.guid == guid)
    }
}

/// Clip a name to the fixed on-disk field (NUL-terminated, UTF-8 boundary safe).
pub fn clip_name(name: &str) -> String {
    let max = NAME_LEN - 1;
    if name.len() <= max {
        return name.to_string();
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

fn fill_slots<const N: usize>(src: &[u16]) -> [i16; N] {
    let mut out = [UNASSIGNED; N];
    for (o, &v) in out.iter_mut().zip(src.iter()) {
        *o = v as i16;
    }
    out
}

fn named_stats(names: &[String], stats: &[GroupStats]) -> Vec<CompositeGroup> {
    names
        .iter()
        .enumerate()
        .map(|(i, n)| CompositeGroup {
            name: clip_name(n),
            stats: stats.get(i).copied().unwrap_or_default(),
        })
        .collect()
}

/// Build a single-image composite from a Valid slot.
pub fn build_composite(
    slot: &ImageSlot,
    arena: &NodeArena,
    classifier: &GroupClassifier,
) -> Result<CompositeImage> {
    let group_names = classifier.group_names();
    if group_names.len() > MAX_GROUPS {
        return Err(PmError::GroupCapacity(format!(
            "{} groups configured (max {})",
            group_names.len(),
            MAX_GROUPS
        ))
        .into());
    }
    if classifier.vf_names().len() > MAX_VFABRICS {
        return Err(PmError::GroupCapacity(format!(
            "{} virtual fabrics configured (max {})",
            classifier.vf_names().len(),
            MAX_VFABRICS
        ))
        .into());
    }

    let img = &slot.image;
    let mut nodes = Vec::new();
    for lid in 1..=img.max_lid {
        let Some(id) = slot.node_at_lid(lid) else {
            continue;
        };
        let (Some(pm), Some(ni)) = (arena.get(id), slot.live_node(id, img.sweep_num)) else {
            continue;
        };
        let ports = ni
            .ports
            .iter()
            .flatten()
            .map(|p| {
                let (neighbor_lid, neighbor_port) = match p.neighbor {
                    Some(r) => (slot.node(r.node).map(|n| n.lid).unwrap_or(0), r.port_num),
                    None => (0, 0),
                };
                CompositePort {
                    port_num: p.port_num,
                    active: p.active,
                    internal: p.internal,
                    skipped: p.skipped,
                    mtu: p.mtu,
                    width: p.width,
                    speed: p.speed,
                    neighbor_lid,
                    neighbor_port,
                    vl_select_mask: p.vl_select_mask,
                    vf_slots: fill_slots(&p.vfs),
                    group_slots: fill_slots(&p.groups),
                    util_mbps: p.util_mbps,
                    errors: p.errors,
                    delta: p.delta,
                }
            })
            .collect();
        nodes.push(CompositeNode {
            lid,
            guid: pm.guid,
            node_type: pm.node_type,
            num_ports: pm.num_ports,
            no_response: ni.no_response,
            description: clip_name(&pm.description),
            ports,
        });
    }

    Ok(CompositeImage {
        header: CompositeHeader {
            history_version: HISTORY_VERSION,
            timestamp: img.sweep_start,
            sweep_interval: img.image_interval,
            image_ids: vec![img.sweep_num],
            ..CompositeHeader::default()
        },
        summary: ImageSummary {
            sweep_num: img.sweep_num,
            sweep_start: img.sweep_start,
            sweep_duration_us: img.sweep_duration_us,
            image_interval: img.image_interval,
            max_lid: img.max_lid,
            counts: img.counts,
            sms: img.sms,
        },
        groups: named_stats(&group_names, &slot.groups),
        vfs: named_stats(classifier.vf_names(), &slot.vfs),
        nodes,
    })
}
