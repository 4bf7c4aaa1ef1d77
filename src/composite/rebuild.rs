//! rebuild - разбор composite с диспетчеризацией по history_version.
//!
//! decode_file: [header][body|сжатые divisions] -> CompositeImage (проверка
//! CRC по несжатому body). encode_file - обратная операция.

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::atomic::AtomicBool;

use crate::consts::{
    ERR_BUCKETS, ERR_CATEGORIES, FLAG_COMPRESSED, GROUP_REC_SIZE, HEADER_SIZE, HISTORY_VERSION,
    HISTORY_VERSION_V10, NAME_LEN, NODE_REC_SIZE, NUM_PORT_COUNTERS, PORT_MAX_GROUPS,
    PORT_MAX_VFS, UTIL_BUCKETS,
};
use crate::error::PmError;
use crate::groups::GroupStats;
use crate::image::{ImageCounts, NodeType, PortCounters, SmInfo};

use super::compress::{compress_buffer, decompress_buffer};
use super::flatten::{flatten, PORT_FLAG_ACTIVE, PORT_FLAG_INTERNAL, PORT_FLAG_SKIPPED};
use super::legacy;
use super::{CompositeGroup, CompositeHeader, CompositeImage, CompositeNode, CompositePort, ImageSummary};

pub(crate) type Rd<'a> = Cursor<&'a [u8]>;

fn remaining(r: &Rd<'_>) -> usize {
    r.get_ref().len().saturating_sub(r.position() as usize)
}

/// Read a record count and check that `rec_size * count` bytes can follow.
pub(crate) fn get_count(r: &mut Rd<'_>, rec_size: usize, what: &str) -> Result<usize> {
    let n = r.read_u32::<LittleEndian>()? as usize;
    if n.saturating_mul(rec_size) > remaining(r) {
        return Err(anyhow!("{} count {} exceeds body size", what, n));
    }
    Ok(n)
}

pub(crate) fn get_name(r: &mut Rd<'_>) -> Result<String> {
    let mut field = [0u8; NAME_LEN];
    r.read_exact(&mut field)?;
    let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

fn skip(r: &mut Rd<'_>, n: usize) -> Result<()> {
    let mut pad = [0u8; 4];
    r.read_exact(&mut pad[..n])?;
    Ok(())
}

pub(crate) fn get_summary(r: &mut Rd<'_>) -> Result<ImageSummary> {
    let sweep_num = r.read_u64::<LittleEndian>()?;
    let sweep_start = r.read_u64::<LittleEndian>()?;
    let sweep_duration_us = r.read_u64::<LittleEndian>()?;
    let image_interval = r.read_u32::<LittleEndian>()?;
    let max_lid = r.read_u32::<LittleEndian>()?;
    let mut c = [0u32; 9];
    for v in c.iter_mut() {
        *v = r.read_u32::<LittleEndian>()?;
    }
    let counts = ImageCounts {
        num_hfi_ports: c[0],
        num_switch_nodes: c[1],
        num_switch_ports: c[2],
        num_links: c[3],
        num_sms: c[4],
        num_no_resp_nodes: c[5],
        num_no_resp_ports: c[6],
        num_skipped_nodes: c[7],
        num_skipped_ports: c[8],
    };
    let mut sms = [SmInfo::default(); 2];
    for sm in sms.iter_mut() {
        sm.lid = r.read_u32::<LittleEndian>()?;
        sm.port_num = r.read_u8()?;
        sm.priority = r.read_u8()?;
        sm.state = r.read_u8()?;
        skip(r, 1)?;
    }
    Ok(ImageSummary {
        sweep_num,
        sweep_start,
        sweep_duration_us,
        image_interval,
        max_lid,
        counts,
        sms,
    })
}

fn get_stats(r: &mut Rd<'_>) -> Result<GroupStats> {
    let mut s = GroupStats {
        num_ports: r.read_u32::<LittleEndian>()?,
        total_mbps: r.read_u64::<LittleEndian>()?,
        max_mbps: r.read_u32::<LittleEndian>()?,
        min_mbps: r.read_u32::<LittleEndian>()?,
        avg_mbps: r.read_u32::<LittleEndian>()?,
        ..GroupStats::default()
    };
    for b in 0..UTIL_BUCKETS {
        s.util_buckets[b] = r.read_u32::<LittleEndian>()?;
    }
    for c in 0..ERR_CATEGORIES {
        s.err_max[c] = r.read_u32::<LittleEndian>()?;
    }
    for c in 0..ERR_CATEGORIES {
        for b in 0..ERR_BUCKETS {
            s.err_buckets[c][b] = r.read_u32::<LittleEndian>()?;
        }
    }
    Ok(s)
}

pub(crate) fn get_group(r: &mut Rd<'_>) -> Result<CompositeGroup> {
    let name = get_name(r)?;
    let stats = get_stats(r)?;
    Ok(CompositeGroup { name, stats })
}

pub(crate) fn get_groups(r: &mut Rd<'_>, what: &str) -> Result<Vec<CompositeGroup>> {
    let n = get_count(r, GROUP_REC_SIZE, what)?;
    (0..n).map(|_| get_group(r)).collect()
}

/// Node record; returns the node (ports empty) and its port record count.
pub(crate) fn get_node(r: &mut Rd<'_>) -> Result<(CompositeNode, usize)> {
    let lid = r.read_u32::<LittleEndian>()?;
    let guid = r.read_u64::<LittleEndian>()?;
    let raw_type = r.read_u8()?;
    let node_type =
        NodeType::from_u8(raw_type).ok_or_else(|| anyhow!("bad node type {} at LID {}", raw_type, lid))?;
    let num_ports = r.read_u8()?;
    let no_response = r.read_u8()? != 0;
    skip(r, 1)?;
    let description = get_name(r)?;
    let nrecs = r.read_u32::<LittleEndian>()? as usize;
    Ok((
        CompositeNode {
            lid,
            guid,
            node_type,
            num_ports,
            no_response,
            description,
            ports: Vec::new(),
        },
        nrecs,
    ))
}

pub(crate) fn get_port_head(r: &mut Rd<'_>) -> Result<CompositePort> {
    let port_num = r.read_u8()?;
    let flags = r.read_u8()?;
    let mtu = r.read_u8()?;
    let width = r.read_u8()?;
    let speed = r.read_u8()?;
    skip(r, 3)?;
    let neighbor_lid = r.read_u32::<LittleEndian>()?;
    let neighbor_port = r.read_u8()?;
    skip(r, 3)?;
    let vl_select_mask = r.read_u32::<LittleEndian>()?;
    Ok(CompositePort {
        port_num,
        active: flags & PORT_FLAG_ACTIVE != 0,
        internal: flags & PORT_FLAG_INTERNAL != 0,
        skipped: flags & PORT_FLAG_SKIPPED != 0,
        mtu,
        width,
        speed,
        neighbor_lid,
        neighbor_port,
        vl_select_mask,
        ..CompositePort::default()
    })
}

pub(crate) fn get_port_tail(r: &mut Rd<'_>, p: &mut CompositePort) -> Result<()> {
    p.util_mbps = r.read_u32::<LittleEndian>()?;
    for e in p.errors.iter_mut() {
        *e = r.read_u32::<LittleEndian>()?;
    }
    let mut a = [0u64; NUM_PORT_COUNTERS];
    for v in a.iter_mut() {
        *v = r.read_u64::<LittleEndian>()?;
    }
    p.delta = PortCounters::from_array(a);
    Ok(())
}

fn get_port(r: &mut Rd<'_>) -> Result<CompositePort> {
    let mut p = get_port_head(r)?;
    for i in 0..PORT_MAX_VFS {
        p.vf_slots[i] = r.read_i16::<LittleEndian>()?;
    }
    for i in 0..PORT_MAX_GROUPS {
        p.group_slots[i] = r.read_i16::<LittleEndian>()?;
    }
    get_port_tail(r, &mut p)?;
    Ok(p)
}

pub(crate) fn check_consumed(r: &Rd<'_>) -> Result<()> {
    let left = remaining(r);
    if left != 0 {
        return Err(anyhow!("{} trailing bytes after composite body", left));
    }
    Ok(())
}

fn decode_current(header: &CompositeHeader, body: &[u8]) -> Result<CompositeImage> {
    let mut r = Cursor::new(body);
    let summary = get_summary(&mut r)?;
    let groups = get_groups(&mut r, "group")?;
    let vfs = get_groups(&mut r, "vf")?;
    let num_nodes = get_count(&mut r, NODE_REC_SIZE, "node")?;
    let mut nodes = Vec::with_capacity(num_nodes);
    for _ in 0..num_nodes {
        let (mut node, nrecs) = get_node(&mut r)?;
        node.ports = (0..nrecs).map(|_| get_port(&mut r)).collect::<Result<_>>()?;
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

/// Rebuild a composite from its header and uncompressed body.
/// Legacy versions are upgraded; the result always carries the current version.
pub fn rebuild(header: &CompositeHeader, body: &[u8]) -> Result<CompositeImage> {
    match header.history_version {
        HISTORY_VERSION => decode_current(header, body),
        HISTORY_VERSION_V10 => {
            let mut c = legacy::decode_v10(header, body)?;
            c.header.history_version = HISTORY_VERSION;
            Ok(c)
        }
        v => Err(PmError::UnsupportedVersion(v).into()),
    }
}

/// Decode a whole history file image.
pub fn decode_file(bytes: &[u8], cancel: &AtomicBool) -> Result<CompositeImage> {
    let header = CompositeHeader::decode(bytes)?;
    if header.history_version != HISTORY_VERSION && header.history_version != HISTORY_VERSION_V10 {
        return Err(PmError::UnsupportedVersion(header.history_version).into());
    }
    let payload = &bytes[HEADER_SIZE..];
    let flat_size = usize::try_from(header.flat_size)
        .map_err(|_| anyhow!("flat size {} does not fit memory", header.flat_size))?;

    let body_owned;
    let body: &[u8] = if header.is_compressed() {
        body_owned = decompress_buffer(payload, &header.div_sizes, flat_size, cancel)?;
        &body_owned
    } else {
        if payload.len() != flat_size {
            return Err(anyhow!(
                "body is {} bytes, header says {}",
                payload.len(),
                flat_size
            ));
        }
        payload
    };

    let crc = crc32fast::hash(body);
    if crc != header.body_crc32 {
        return Err(anyhow!(
            "composite body crc mismatch: {:#010x} != {:#010x}",
            crc,
            header.body_crc32
        ));
    }

    let mut c = rebuild(&header, body)?;
    // в памяти composite всегда «несжатый»
    c.header.flags &= !FLAG_COMPRESSED;
    c.header.num_divisions = 0;
    c.header.div_sizes.clear();
    Ok(c)
}

/// Encode a composite into a history file image, optionally compressed.
pub fn encode_file(
    c: &CompositeImage,
    compress: bool,
    divisions: usize,
    cancel: &AtomicBool,
) -> Result<Vec<u8>> {
    let flat = flatten(c)?;
    if !compress {
        return Ok(flat);
    }
    let mut header = CompositeHeader::decode(&flat)?;
    let (data, sizes) = compress_buffer(&flat[HEADER_SIZE..], divisions, cancel)?;
    header.flags |= FLAG_COMPRESSED;
    header.num_divisions = sizes.len() as u32;
    header.div_sizes = sizes;

    let mut out = Vec::with_capacity(HEADER_SIZE + data.len());
    out.extend_from_slice(&header.encode()?);
    out.extend_from_slice(&data);
    Ok(out)
}
