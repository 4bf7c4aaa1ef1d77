//! Compounding: слияние нового свипа в текущий composite.
//!
//! Узлы сопоставляются по GUID, порты - по номеру. Расхождение имён (группа,
//! VF, описание узла) исправляется молча по новому свипу. Расхождение набора
//! GUID - смена топологии посреди compounding: composite не трогаем, вызывающий
//! закрывает его и начинает новый.

use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consts::{GROUP_WARN_THROTTLE_SECS, MAX_IMAGES_PER_COMPOSITE};
use crate::metrics::{record_compound_name_fix, record_compound_topology_change};

use super::{CompositeGroup, CompositeImage, CompositePort};

// unix-секунды последнего warn о расхождении имён (0 = ещё не было)
static LAST_NAME_WARN: AtomicU64 = AtomicU64::new(0);

fn name_warn_due() -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let last = LAST_NAME_WARN.load(Ordering::Relaxed);
    if last != 0 && now.saturating_sub(last) < GROUP_WARN_THROTTLE_SECS {
        return false;
    }
    LAST_NAME_WARN
        .compare_exchange(last, now.max(1), Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompoundReport {
    pub name_fixes: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompoundOutcome {
    Merged(CompoundReport),
    /// Node sets differ; `dst` was left untouched.
    TopologyChanged {
        appeared: Vec<u64>,
        vanished: Vec<u64>,
    },
}

fn merge_named(dst: &mut Vec<CompositeGroup>, src: &[CompositeGroup], images_before: u32, kind: &str) -> usize {
    let mut fixes = 0;
    for (i, s) in src.iter().enumerate() {
        match dst.get_mut(i) {
            Some(d) => {
                if d.name != s.name {
                    debug!("compound: {} {} renamed {:?} -> {:?}", kind, i, d.name, s.name);
                    d.name = s.name.clone();
                    fixes += 1;
                }
                d.stats.merge(&s.stats, images_before);
            }
            None => dst.push(s.clone()),
        }
    }
    fixes
}

fn merge_port(d: &mut CompositePort, s: &CompositePort, images_before: u32) {
    let n = images_before as u64;
    d.util_mbps = ((d.util_mbps as u64 * n + s.util_mbps as u64) / (n + 1)) as u32;
    for (de, se) in d.errors.iter_mut().zip(s.errors) {
        *de = de.saturating_add(se);
    }
    d.delta.accumulate(&s.delta);
    // состояние порта - по последнему свипу
    d.active = s.active;
    d.internal = s.internal;
    d.skipped = s.skipped;
    d.mtu = s.mtu;
    d.width = s.width;
    d.speed = s.speed;
    d.neighbor_lid = s.neighbor_lid;
    d.neighbor_port = s.neighbor_port;
    d.vl_select_mask = s.vl_select_mask;
    d.vf_slots = s.vf_slots;
    d.group_slots = s.group_slots;
}

/// Merge `src` (one freshly swept image) into `dst` in place.
pub fn compound_image(dst: &mut CompositeImage, src: &CompositeImage) -> Result<CompoundOutcome> {
    let images_before = dst.num_images();
    if images_before + src.num_images() > MAX_IMAGES_PER_COMPOSITE {
        return Err(anyhow!(
            "composite already holds {} images (max {})",
            images_before,
            MAX_IMAGES_PER_COMPOSITE
        ));
    }

    let dst_guids: HashSet<u64> = dst.nodes.iter().map(|n| n.guid).collect();
    let src_guids: HashSet<u64> = src.nodes.iter().map(|n| n.guid).collect();
    if dst_guids != src_guids {
        let mut appeared: Vec<u64> = src_guids.difference(&dst_guids).copied().collect();
        let mut vanished: Vec<u64> = dst_guids.difference(&src_guids).copied().collect();
        appeared.sort_unstable();
        vanished.sort_unstable();
        record_compound_topology_change();
        warn!(
            "compound: topology changed while compounding ({} appeared, {} vanished)",
            appeared.len(),
            vanished.len()
        );
        return Ok(CompoundOutcome::TopologyChanged { appeared, vanished });
    }

    let nb = images_before as u32;
    let mut fixes = merge_named(&mut dst.groups, &src.groups, nb, "group");
    fixes += merge_named(&mut dst.vfs, &src.vfs, nb, "vf");

    let by_guid: HashMap<u64, usize> = src.nodes.iter().enumerate().map(|(i, n)| (n.guid, i)).collect();
    for d in dst.nodes.iter_mut() {
        let Some(s) = by_guid.get(&d.guid).map(|&i| &src.nodes[i]) else {
            continue;
        };
        if d.description != s.description {
            debug!(
                "compound: node {:#018x} description {:?} -> {:?}",
                d.guid, d.description, s.description
            );
            d.description = s.description.clone();
            fixes += 1;
        }
        d.lid = s.lid;
        d.no_response = s.no_response;
        for sp in &s.ports {
            match d.ports.iter_mut().find(|p| p.port_num == sp.port_num) {
                Some(dp) => merge_port(dp, sp, nb),
                None => d.ports.push(sp.clone()),
            }
        }
    }
    dst.nodes.sort_by_key(|n| n.lid);

    let n = images_before as u64;
    let s = &src.summary;
    let avg = (dst.summary.sweep_duration_us * n + s.sweep_duration_us) / (n + 1);
    dst.summary.sweep_num = s.sweep_num;
    dst.summary.sweep_duration_us = avg;
    dst.summary.max_lid = s.max_lid;
    dst.summary.counts = s.counts;
    dst.summary.sms = s.sms;
    dst.header.image_ids.extend_from_slice(&src.header.image_ids);

    if fixes > 0 {
        for _ in 0..fixes {
            record_compound_name_fix();
        }
        if name_warn_due() {
            warn!(
                "compound: {} name mismatch(es) in composite of sweep {}; names taken from the newest sweep",
                fixes, s.sweep_num
            );
        }
    }
    Ok(CompoundOutcome::Merged(CompoundReport { name_fixes: fixes }))
}
