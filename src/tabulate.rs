//! Counter tabulation.
//!
//! Tabulator - шов для внешнего слоя подсчёта. DeltaTabulator - реализация по
//! умолчанию: delta к предыдущему свипу, утилизация, категории ошибок и
//! агрегаты групп/VF. Накопленные итоги (running totals) живут под отдельным
//! totals-mutex, чтобы clear не гонялся с финализацией свипа.

use anyhow::Result;
use log::trace;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::consts::ERR_CATEGORIES;
use crate::groups::GroupClassifier;
use crate::image::{ImageSlot, NodeArena, PortCounters};

pub const ERR_INTEGRITY: usize = 0;
pub const ERR_CONGESTION: usize = 1;
pub const ERR_DISCARDS: usize = 2;
pub const ERR_REMOTE_PHYS: usize = 3;
pub const ERR_ROUTING: usize = 4;

pub const ERR_CATEGORY_NAMES: [&str; ERR_CATEGORIES] =
    ["integrity", "congestion", "discards", "remote_phys", "routing"];

/// Cross-sweep accumulated counters keyed by (node guid, port number).
#[derive(Debug, Default)]
pub struct RunningTotals {
    inner: Mutex<HashMap<(u64, u8), PortCounters>>,
}

impl RunningTotals {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(u64, u8), PortCounters>> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub fn accumulate(&self, deltas: &[((u64, u8), PortCounters)]) {
        let mut g = self.lock();
        for (key, d) in deltas {
            g.entry(*key).or_default().accumulate(d);
        }
    }

    pub fn get(&self, guid: u64, port_num: u8) -> Option<PortCounters> {
        self.lock().get(&(guid, port_num)).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

pub struct TabulateContext<'a> {
    pub slot: &'a mut ImageSlot,
    pub prev: Option<&'a ImageSlot>,
    pub arena: &'a NodeArena,
    pub classifier: &'a GroupClassifier,
    pub totals: &'a RunningTotals,
}

/// External counter layer. Runs under the exclusive image lock of `ctx.slot`.
pub trait Tabulator: Send + Sync {
    fn tabulate(&self, ctx: TabulateContext<'_>) -> Result<()>;
}

fn sat32(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

/// Five error categories from one delta sample.
pub fn error_categories(d: &PortCounters) -> [u32; ERR_CATEGORIES] {
    let mut e = [0u32; ERR_CATEGORIES];
    e[ERR_INTEGRITY] = sat32(
        d.symbol_errors
            .saturating_add(d.link_error_recovery)
            .saturating_add(d.link_downed)
            .saturating_add(d.rcv_errors)
            .saturating_add(d.local_link_integrity_errors),
    );
    e[ERR_CONGESTION] = sat32(d.xmit_wait);
    e[ERR_DISCARDS] = sat32(d.xmit_discards.saturating_add(d.congestion_discards));
    e[ERR_REMOTE_PHYS] = sat32(d.rcv_remote_phys_errors);
    e[ERR_ROUTING] = sat32(d.rcv_switch_relay_errors);
    e
}

/// MB/s from a delta of transmitted 4-byte words over `interval_secs`.
pub fn utilization_mbps(xmit_data_words: u64, interval_secs: u32) -> u32 {
    if interval_secs == 0 {
        return 0;
    }
    sat32(xmit_data_words.saturating_mul(4) / interval_secs as u64 / 1_000_000)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeltaTabulator;

impl Tabulator for DeltaTabulator {
    fn tabulate(&self, ctx: TabulateContext<'_>) -> Result<()> {
        let TabulateContext {
            slot,
            prev,
            arena,
            classifier,
            totals,
        } = ctx;
        let epoch = slot.image.sweep_num;
        let interval = slot.image.image_interval;
        let prev_epoch = prev.map(|p| p.image.sweep_num).unwrap_or(0);

        let mut deltas = Vec::new();
        for lid in 1..slot.image.lid_map.len() {
            let Some(id) = slot.image.lid_map[lid] else {
                continue;
            };
            let guid = arena.get(id).map(|n| n.guid).unwrap_or(0);
            let prev_node = prev.and_then(|p| p.live_node(id, prev_epoch));
            let Some(node) = slot.nodes.get_mut(id.index()).and_then(|n| n.as_mut()) else {
                continue;
            };
            if node.epoch != epoch {
                continue;
            }
            for (pidx, port) in node.ports.iter_mut().enumerate() {
                let Some(port) = port else { continue };
                let prev_raw = prev_node
                    .and_then(|n| n.ports.get(pidx))
                    .and_then(|p| p.as_ref())
                    .map(|p| p.raw);
                port.delta = match prev_raw {
                    Some(old) => port.raw.delta_since(&old),
                    // первый образец: delta нулевая
                    None => PortCounters::default(),
                };
                port.util_mbps = utilization_mbps(port.delta.xmit_data, interval);
                port.errors = error_categories(&port.delta);
                deltas.push(((guid, port.port_num), port.delta));
            }
        }

        totals.accumulate(&deltas);
        classifier.aggregate(slot);
        trace!(
            "tabulate: sweep {} ports={} groups={} vfs={}",
            epoch,
            deltas.len(),
            slot.groups.len(),
            slot.vfs.len()
        );
        Ok(())
    }
}
