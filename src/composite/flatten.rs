//! flatten - CompositeImage -> [header][body].
//!
//! compute_sizes должна совпадать с тем, что реально пишет encode_body; это
//! проверяется после записи (несовпадение - ошибка формата, а не panic).

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, WriteBytesExt};

use crate::consts::{
    ERR_BUCKETS, ERR_CATEGORIES, FLAG_COMPRESSED, GROUP_REC_SIZE, NAME_LEN, NODE_REC_SIZE,
    PORT_REC_SIZE, SUMMARY_SIZE, UTIL_BUCKETS,
};
use crate::groups::GroupStats;

use super::{CompositeGroup, CompositeImage, CompositeNode, CompositePort, ImageSummary};

/// Exact body size for the given record counts.
pub fn compute_sizes(num_groups: usize, num_vfs: usize, num_nodes: usize, num_ports: usize) -> usize {
    SUMMARY_SIZE
        + 4
        + num_groups * GROUP_REC_SIZE
        + 4
        + num_vfs * GROUP_REC_SIZE
        + 4
        + num_nodes * NODE_REC_SIZE
        + num_ports * PORT_REC_SIZE
}

pub(crate) fn put_name(out: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; NAME_LEN];
    let clipped = super::clip_name(name);
    let b = clipped.as_bytes();
    field[..b.len()].copy_from_slice(b);
    out.extend_from_slice(&field);
}

pub(crate) fn put_summary(out: &mut Vec<u8>, s: &ImageSummary) -> Result<()> {
    out.write_u64::<LittleEndian>(s.sweep_num)?;
    out.write_u64::<LittleEndian>(s.sweep_start)?;
    out.write_u64::<LittleEndian>(s.sweep_duration_us)?;
    out.write_u32::<LittleEndian>(s.image_interval)?;
    out.write_u32::<LittleEndian>(s.max_lid)?;
    let c = &s.counts;
    for v in [
        c.num_hfi_ports,
        c.num_switch_nodes,
        c.num_switch_ports,
        c.num_links,
        c.num_sms,
        c.num_no_resp_nodes,
        c.num_no_resp_ports,
        c.num_skipped_nodes,
        c.num_skipped_ports,
    ] {
        out.write_u32::<LittleEndian>(v)?;
    }
    for sm in &s.sms {
        out.write_u32::<LittleEndian>(sm.lid)?;
        out.write_u8(sm.port_num)?;
        out.write_u8(sm.priority)?;
        out.write_u8(sm.state)?;
        out.write_u8(0)?;
    }
    Ok(())
}

pub(crate) fn put_stats(out: &mut Vec<u8>, s: &GroupStats) -> Result<()> {
    out.write_u32::<LittleEndian>(s.num_ports)?;
    out.write_u64::<LittleEndian>(s.total_mbps)?;
    out.write_u32::<LittleEndian>(s.max_mbps)?;
    out.write_u32::<LittleEndian>(s.min_mbps)?;
    out.write_u32::<LittleEndian>(s.avg_mbps)?;
    for b in 0..UTIL_BUCKETS {
        out.write_u32::<LittleEndian>(s.util_buckets[b])?;
    }
    for c in 0..ERR_CATEGORIES {
        out.write_u32::<LittleEndian>(s.err_max[c])?;
    }
    for c in 0..ERR_CATEGORIES {
        for b in 0..ERR_BUCKETS {
            out.write_u32::<LittleEndian>(s.err_buckets[c][b])?;
        }
    }
    Ok(())
}

pub(crate) fn put_group(out: &mut Vec<u8>, g: &CompositeGroup) -> Result<()> {
    put_name(out, &g.name);
    put_stats(out, &g.stats)
}

pub(crate) fn put_node(out: &mut Vec<u8>, n: &CompositeNode) -> Result<()> {
    out.write_u32::<LittleEndian>(n.lid)?;
    out.write_u64::<LittleEndian>(n.guid)?;
    out.write_u8(n.node_type.as_u8())?;
    out.write_u8(n.num_ports)?;
    out.write_u8(n.no_response as u8)?;
    out.write_u8(0)?;
    put_name(out, &n.description);
    out.write_u32::<LittleEndian>(n.ports.len() as u32)?;
    Ok(())
}

pub(crate) const PORT_FLAG_ACTIVE: u8 = 0x1;
pub(crate) const PORT_FLAG_INTERNAL: u8 = 0x2;
pub(crate) const PORT_FLAG_SKIPPED: u8 = 0x4;

/// Common head of a port record: [port][flags][mtu][width][speed][pad3]
/// [nbr_lid u32][nbr_port u8][pad3][vl_mask u32].
pub(crate) fn put_port_head(out: &mut Vec<u8>, p: &CompositePort) -> Result<()> {
    let mut flags = 0u8;
    if p.active {
        flags |= PORT_FLAG_ACTIVE;
    }
    if p.internal {
        flags |= PORT_FLAG_INTERNAL;
    }
    if p.skipped {
        flags |= PORT_FLAG_SKIPPED;
    }
    out.write_u8(p.port_num)?;
    out.write_u8(flags)?;
    out.write_u8(p.mtu)?;
    out.write_u8(p.width)?;
    out.write_u8(p.speed)?;
    out.extend_from_slice(&[0u8; 3]);
    out.write_u32::<LittleEndian>(p.neighbor_lid)?;
    out.write_u8(p.neighbor_port)?;
    out.extend_from_slice(&[0u8; 3]);
    out.write_u32::<LittleEndian>(p.vl_select_mask)?;
    Ok(())
}

/// Tail of a port record: [util u32][errors u32*5][delta u64*14].
pub(crate) fn put_port_tail(out: &mut Vec<u8>, p: &CompositePort) -> Result<()> {
    out.write_u32::<LittleEndian>(p.util_mbps)?;
    for e in p.errors {
        out.write_u32::<LittleEndian>(e)?;
    }
    for v in p.delta.to_array() {
        out.write_u64::<LittleEndian>(v)?;
    }
    Ok(())
}

fn put_port(out: &mut Vec<u8>, p: &CompositePort) -> Result<()> {
    put_port_head(out, p)?;
    for v in p.vf_slots {
        out.write_i16::<LittleEndian>(v)?;
    }
    for g in p.group_slots {
        out.write_i16::<LittleEndian>(g)?;
    }
    put_port_tail(out, p)
}

/// Encode the current-version body.
pub fn encode_body(c: &CompositeImage) -> Result<Vec<u8>> {
    let expected = compute_sizes(c.groups.len(), c.vfs.len(), c.nodes.len(), c.num_ports());
    let mut out = Vec::new();
    out.try_reserve_exact(expected)
        .map_err(|e| anyhow!("composite body of {} bytes: {}", expected, e))?;

    put_summary(&mut out, &c.summary)?;
    out.write_u32::<LittleEndian>(c.groups.len() as u32)?;
    for g in &c.groups {
        put_group(&mut out, g)?;
    }
    out.write_u32::<LittleEndian>(c.vfs.len() as u32)?;
    for v in &c.vfs {
        put_group(&mut out, v)?;
    }
    out.write_u32::<LittleEndian>(c.nodes.len() as u32)?;
    for n in &c.nodes {
        put_node(&mut out, n)?;
        for p in &n.ports {
            put_port(&mut out, p)?;
        }
    }

    if out.len() != expected {
        return Err(anyhow!(
            "composite size mismatch: wrote {} bytes, computed {}",
            out.len(),
            expected
        ));
    }
    Ok(out)
}

/// Uncompressed file image: header (flat_size/crc filled in) + body.
pub fn flatten(c: &CompositeImage) -> Result<Vec<u8>> {
    let body = encode_body(c)?;
    let mut header = c.header.clone();
    header.flags &= !FLAG_COMPRESSED;
    header.flat_size = body.len() as u64;
    header.num_divisions = 0;
    header.div_sizes.clear();
    header.body_crc32 = crc32fast::hash(&body);

    let mut out = Vec::with_capacity(crate::consts::HEADER_SIZE + body.len());
    out.extend_from_slice(&header.encode()?);
    out.extend_from_slice(&body);
    Ok(out)
}
