//! v10 -> current.
//!
//! Отличия v10:
//! - VF-таблица всегда MAX_VFABRICS_V10 (32) записей, реально занятые - первые num_vfs;
//! - членство порта в VF - битовая маска u32 вместо списка слотов;
//! - group-слотов у порта нет: после апгрейда все слоты UNASSIGNED (-1).

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::consts::{MAX_VFABRICS_V10, NODE_REC_SIZE, PORT_MAX_VFS, UNASSIGNED};

use super::rebuild::{
    check_consumed, get_count, get_group, get_groups, get_node, get_port_head, get_port_tail,
    get_summary, Rd,
};
use super::{CompositeHeader, CompositeImage, CompositePort};

fn vf_mask_to_slots(mask: u32) -> [i16; PORT_MAX_VFS] {
    let mut slots = [UNASSIGNED; PORT_MAX_VFS];
    let mut n = 0;
    for bit in 0..MAX_VFABRICS_V10 {
        if mask & (1u32 << bit) != 0 && n < PORT_MAX_VFS {
            slots[n] = bit as i16;
            n += 1;
        }
    }
    slots
}

fn get_port_v10(r: &mut Rd<'_>) -> Result<CompositePort> {
    let mut p = get_port_head(r)?;
    p.vf_slots = vf_mask_to_slots(r.read_u32::<LittleEndian>()?);
    get_port_tail(r, &mut p)?;
    Ok(p)
}

pub(crate) fn decode_v10(header: &CompositeHeader, body: &[u8]) -> Result<CompositeImage> {
    let mut r = Cursor::new(body);
    let summary = get_summary(&mut r)?;
    let groups = get_groups(&mut r, "group")?;

    let num_vfs = r.read_u32::<LittleEndian>()? as usize;
    if num_vfs > MAX_VFABRICS_V10 {
        return Err(anyhow!("v10 vf count {} exceeds {}", num_vfs, MAX_VFABRICS_V10));
    }
    let mut vfs = Vec::with_capacity(num_vfs);
    for i in 0..MAX_VFABRICS_V10 {
        let vf = get_group(&mut r)?;
        if i < num_vfs {
            vfs.push(vf);
        }
    }

    let num_nodes = get_count(&mut r, NODE_REC_SIZE, "node")?;
    let mut nodes = Vec::with_capacity(num_nodes);
    for _ in 0..num_nodes {
        let (mut node, nrecs) = get_node(&mut r)?;
        node.ports = (0..nrecs)
            .map(|_| get_port_v10(&mut r))
            .collect::<Result<_>>()?;
        nodes.push(node);
    }
    check_consumed(&r)?;

    Ok(CompositeImage {
        header: header.clone(),
        summary,
        groups,
        vfs,
        nodes,
    })
}

#[cfg(test)]
pub(crate) fn encode_v10(c: &CompositeImage) -> Result<Vec<u8>> {
    use super::flatten::{put_group, put_node, put_port_head, put_port_tail, put_summary};
    use super::CompositeGroup;
    use crate::consts::{HISTORY_VERSION_V10, PORT_REC_SIZE_V10};
    use byteorder::WriteBytesExt;

    let mut body = Vec::new();
    put_summary(&mut body, &c.summary)?;
    body.write_u32::<LittleEndian>(c.groups.len() as u32)?;
    for g in &c.groups {
        put_group(&mut body, g)?;
    }
    body.write_u32::<LittleEndian>(c.vfs.len() as u32)?;
    for i in 0..MAX_VFABRICS_V10 {
        match c.vfs.get(i) {
            Some(v) => put_group(&mut body, v)?,
            None => put_group(&mut body, &CompositeGroup::default())?,
        }
    }
    body.write_u32::<LittleEndian>(c.nodes.len() as u32)?;
    for n in &c.nodes {
        put_node(&mut body, n)?;
        for p in &n.ports {
            let start = body.len();
            put_port_head(&mut body, p)?;
            let mask = p.vfs().fold(0u32, |m, v| m | (1u32 << v));
            body.write_u32::<LittleEndian>(mask)?;
            put_port_tail(&mut body, p)?;
            debug_assert_eq!(body.len() - start, PORT_REC_SIZE_V10);
        }
    }

    let mut header = c.header.clone();
    header.history_version = HISTORY_VERSION_V10;
    header.flags = 0;
    header.flat_size = body.len() as u64;
    header.num_divisions = 0;
    header.div_sizes.clear();
    header.body_crc32 = crc32fast::hash(&body);
    let mut out = header.encode()?.to_vec();
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::{decode_file, CompositeGroup, CompositeNode, ImageSummary};
    use crate::consts::HISTORY_VERSION;
    use crate::image::NodeType;
    use std::sync::atomic::AtomicBool;

    fn sample() -> CompositeImage {
        let mut port = CompositePort {
            port_num: 1,
            active: true,
            width: 4,
            speed: 25,
            util_mbps: 42,
            ..CompositePort::default()
        };
        port.vf_slots[0] = 0;
        port.vf_slots[1] = 3;
        port.group_slots[0] = 0;
        CompositeImage {
            header: CompositeHeader {
                history_version: HISTORY_VERSION,
                timestamp: 1_700_000_000,
                sweep_interval: 10,
                image_ids: vec![7],
                ..CompositeHeader::default()
            },
            summary: ImageSummary {
                sweep_num: 7,
                max_lid: 1,
                ..ImageSummary::default()
            },
            groups: vec![CompositeGroup {
                name: "All".into(),
                ..CompositeGroup::default()
            }],
            vfs: vec![
                CompositeGroup {
                    name: "Default".into(),
                    ..CompositeGroup::default()
                },
                CompositeGroup {
                    name: "Storage".into(),
                    ..CompositeGroup::default()
                },
            ],
            nodes: vec![CompositeNode {
                lid: 1,
                guid: 0xabc,
                node_type: NodeType::Hfi,
                num_ports: 1,
                no_response: false,
                description: "hfi-a".into(),
                ports: vec![port],
            }],
        }
    }

    #[test]
    fn v10_upgrade_defaults_group_slots() {
        let c = sample();
        let bytes = encode_v10(&c).unwrap();
        let back = decode_file(&bytes, &AtomicBool::new(false)).unwrap();

        assert_eq!(back.header.history_version, HISTORY_VERSION);
        assert_eq!(back.vfs, c.vfs);
        assert_eq!(back.groups, c.groups);
        let p = &back.nodes[0].ports[0];
        assert_eq!(p.vfs().collect::<Vec<_>>(), vec![0, 3]);
        assert!(p.group_slots.iter().all(|&g| g == UNASSIGNED));
        assert_eq!(p.util_mbps, 42);
        assert_eq!(back.nodes[0].description, "hfi-a");
    }

    #[test]
    fn mask_keeps_first_sixteen_vfs() {
        let slots = vf_mask_to_slots(u32::MAX);
        assert_eq!(slots[0], 0);
        assert_eq!(slots[15], 15);
    }
}
