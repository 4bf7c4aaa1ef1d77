//! Group/VF classifier.
//!
//! Группы создаются один раз при старте: встроенные All/HFIs/SWs, затем
//! пользовательские из конфигурации. У каждой группы есть компаратор
//! (port, group_name) -> bool. VF - отдельный список, членство порта в VF
//! приходит из топологии.
//!
//! add_to_groups проверяет порт по всем группам по порядку и записывает первые
//! N совпадений (N = ёмкость порта). Переполнение - мягкая ошибка: счётчик +
//! warn не чаще раза в GROUP_WARN_THROTTLE_SECS на порт.
//!
//! VF порта обрезаются до PORT_MAX_VFS тем же путём (assign_vfs), так что
//! агрегаты VF считают ровно те порты, что попадут в composite.

use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::{GroupConfig, PmConfig, PortSelector};
use crate::consts::{
    ERR_BUCKETS, ERR_CATEGORIES, GROUP_WARN_THROTTLE_SECS, PORT_MAX_VFS, UTIL_BUCKETS,
};
use crate::image::{ImageSlot, NodeType, PmNode, PortImage};
use crate::metrics::record_group_overflow;

pub const GROUP_ALL: &str = "All";
pub const GROUP_HFIS: &str = "HFIs";
pub const GROUP_SWS: &str = "SWs";

/// Aggregated statistics of a group or VF for one image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub num_ports: u32,
    pub total_mbps: u64,
    pub max_mbps: u32,
    pub min_mbps: u32,
    pub avg_mbps: u32,
    pub util_buckets: [u32; UTIL_BUCKETS],
    pub err_max: [u32; ERR_CATEGORIES],
    pub err_buckets: [[u32; ERR_BUCKETS]; ERR_CATEGORIES],
}

impl GroupStats {
    /// Fold one port into the aggregate. `link_mbps` is the port's line rate.
    pub fn add_port(&mut self, util_mbps: u32, link_mbps: u32, errors: &[u32; ERR_CATEGORIES]) {
        if self.num_ports == 0 || util_mbps < self.min_mbps {
            self.min_mbps = util_mbps;
        }
        self.max_mbps = self.max_mbps.max(util_mbps);
        self.num_ports += 1;
        self.total_mbps += util_mbps as u64;
        self.avg_mbps = (self.total_mbps / self.num_ports as u64) as u32;

        let pct = if link_mbps == 0 {
            0
        } else {
            (util_mbps as u64 * 100 / link_mbps as u64) as usize
        };
        let b = (pct * UTIL_BUCKETS / 100).min(UTIL_BUCKETS - 1);
        self.util_buckets[b] += 1;

        for (c, &e) in errors.iter().enumerate() {
            self.err_max[c] = self.err_max[c].max(e);
            self.err_buckets[c][error_bucket(e)] += 1;
        }
    }

    /// Merge another image's aggregate (compounding).
    pub fn merge(&mut self, other: &GroupStats, images_before: u32) {
        if other.num_ports == 0 {
            return;
        }
        if self.num_ports == 0 || other.min_mbps < self.min_mbps {
            self.min_mbps = other.min_mbps;
        }
        self.max_mbps = self.max_mbps.max(other.max_mbps);
        let n = images_before as u64;
        self.avg_mbps = ((self.avg_mbps as u64 * n + other.avg_mbps as u64) / (n + 1)) as u32;
        self.total_mbps = self.total_mbps.saturating_add(other.total_mbps);
        self.num_ports = self.num_ports.max(other.num_ports);
        for i in 0..UTIL_BUCKETS {
            self.util_buckets[i] += other.util_buckets[i];
        }
        for c in 0..ERR_CATEGORIES {
            self.err_max[c] = self.err_max[c].max(other.err_max[c]);
            for b in 0..ERR_BUCKETS {
                self.err_buckets[c][b] += other.err_buckets[c][b];
            }
        }
    }
}

/// Bucket edges for error counts per image: 0, 1-9, 10-99, 100-999, 1000+.
fn error_bucket(e: u32) -> usize {
    match e {
        0 => 0,
        1..=9 => 1,
        10..=99 => 2,
        100..=999 => 3,
        _ => 4,
    }
}

/// What a comparator can see about a port.
pub struct PortContext<'a> {
    pub node: &'a PmNode,
    pub port: &'a PortImage,
    pub neighbor: Option<&'a PmNode>,
}

pub type GroupComparator = Arc<dyn Fn(&PortContext<'_>, &str) -> bool + Send + Sync>;

pub struct GroupDef {
    pub name: String,
    pub comparator: GroupComparator,
}

impl std::fmt::Debug for GroupDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupDef").field("name", &self.name).finish()
    }
}

/// Result of one add_to_groups call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupAssign {
    pub added: usize,
    /// Matches dropped for lack of per-port capacity.
    pub overflowed: usize,
}

pub struct GroupClassifier {
    groups: Vec<GroupDef>,
    vfs: Vec<String>,
    per_port_capacity: usize,
    throttle: Mutex<HashMap<(u64, u8, &'static str), Instant>>,
    throttle_window: Duration,
}

fn selector_matches(sel: &PortSelector, ctx: &PortContext<'_>) -> bool {
    match sel {
        PortSelector::AllPorts => true,
        PortSelector::Hfis => ctx.node.node_type == NodeType::Hfi,
        PortSelector::Switches => ctx.node.node_type == NodeType::Switch,
        PortSelector::NodeDescPrefix(p) => ctx.node.description.starts_with(p.as_str()),
        PortSelector::NodeGuid(g) => ctx.node.guid == *g,
        PortSelector::InternalLinks => ctx.port.internal,
        PortSelector::ExternalLinks => ctx.neighbor.is_some() && !ctx.port.internal,
    }
}

fn comparator_for(cfg: &GroupConfig) -> GroupComparator {
    let select = cfg.select.clone();
    Arc::new(move |ctx: &PortContext<'_>, _name: &str| {
        select.iter().any(|s| selector_matches(s, ctx))
    })
}

impl GroupClassifier {
    /// Built-ins + configured groups + configured VFs.
    pub fn from_config(cfg: &PmConfig) -> Self {
        let mut groups = vec![
            GroupDef {
                name: GROUP_ALL.to_string(),
                comparator: Arc::new(|_ctx: &PortContext<'_>, _n: &str| true),
            },
            GroupDef {
                name: GROUP_HFIS.to_string(),
                comparator: Arc::new(|ctx: &PortContext<'_>, _n: &str| {
                    ctx.node.node_type == NodeType::Hfi
                }),
            },
            GroupDef {
                name: GROUP_SWS.to_string(),
                comparator: Arc::new(|ctx: &PortContext<'_>, _n: &str| {
                    ctx.node.node_type == NodeType::Switch
                }),
            },
        ];
        for g in &cfg.groups {
            groups.push(GroupDef {
                name: g.name.clone(),
                comparator: comparator_for(g),
            });
        }
        Self {
            groups,
            vfs: cfg.vfs.clone(),
            per_port_capacity: cfg.max_groups_per_port,
            throttle: Mutex::new(HashMap::new()),
            throttle_window: Duration::from_secs(GROUP_WARN_THROTTLE_SECS),
        }
    }

    /// Register an extra group with a custom comparator (before the engine starts).
    pub fn push_group(&mut self, name: &str, comparator: GroupComparator) {
        self.groups.push(GroupDef {
            name: name.to_string(),
            comparator,
        });
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    pub fn vf_names(&self) -> &[String] {
        &self.vfs
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn per_port_capacity(&self) -> usize {
        self.per_port_capacity
    }

    /// Test the port against every group in order; keep the first matches that fit.
    pub fn add_to_groups(&self, ctx: &PortContext<'_>) -> (Vec<u16>, GroupAssign) {
        let mut out: Vec<u16> = Vec::new();
        let mut assign = GroupAssign::default();
        for (i, g) in self.groups.iter().enumerate() {
            if !(g.comparator)(ctx, &g.name) {
                continue;
            }
            if out.len() < self.per_port_capacity {
                out.push(i as u16);
                assign.added += 1;
            } else {
                assign.overflowed += 1;
            }
        }
        if assign.overflowed > 0 {
            record_group_overflow();
            self.warn_overflow(
                (ctx.node.guid, ctx.port.port_num),
                "group",
                assign.overflowed,
                self.per_port_capacity,
            );
        }
        (out, assign)
    }

    /// Exact inverse of add_to_groups.
    pub fn remove_from_groups(&self, port: &mut PortImage) {
        port.groups.clear();
    }

    /// VF membership of a port as reported by the topology: unknown VF
    /// indices are dropped, the rest is capped at PORT_MAX_VFS.
    pub fn assign_vfs(&self, port: (u64, u8), vfs: &[u16]) -> (Vec<u16>, GroupAssign) {
        let mut out: Vec<u16> = Vec::with_capacity(vfs.len().min(PORT_MAX_VFS));
        let mut assign = GroupAssign::default();
        for &v in vfs {
            if v as usize >= self.vfs.len() || out.contains(&v) {
                continue;
            }
            if out.len() < PORT_MAX_VFS {
                out.push(v);
                assign.added += 1;
            } else {
                assign.overflowed += 1;
            }
        }
        if assign.overflowed > 0 {
            record_group_overflow();
            self.warn_overflow(port, "vf", assign.overflowed, PORT_MAX_VFS);
        }
        (out, assign)
    }

    fn warn_overflow(&self, port: (u64, u8), kind: &'static str, dropped: usize, capacity: usize) {
        let key = (port.0, port.1, kind);
        let now = Instant::now();
        let mut g = match self.throttle.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let due = match g.get(&key) {
            Some(last) => now.duration_since(*last) >= self.throttle_window,
            None => true,
        };
        if due {
            g.insert(key, now);
            warn!(
                "groups: port {:#018x}:{} is in {} {}(s) beyond capacity {}; ignored",
                port.0, port.1, dropped, kind, capacity
            );
        }
    }

    /// Recompute per-group and per-VF aggregates of a tabulated slot.
    pub fn aggregate(&self, slot: &mut ImageSlot) {
        let mut groups = vec![GroupStats::default(); self.groups.len()];
        let mut vfs = vec![GroupStats::default(); self.vfs.len()];
        let epoch = slot.image.sweep_num;

        for entry in slot.nodes.iter() {
            let Some(node) = entry.as_ref().filter(|n| n.epoch == epoch) else {
                continue;
            };
            for port in node.ports.iter().flatten() {
                let rate = link_rate_mbps(port.width, port.speed);
                for &g in &port.groups {
                    if let Some(s) = groups.get_mut(g as usize) {
                        s.add_port(port.util_mbps, rate, &port.errors);
                    }
                }
                for &v in &port.vfs {
                    if let Some(s) = vfs.get_mut(v as usize) {
                        s.add_port(port.util_mbps, rate, &port.errors);
                    }
                }
            }
        }
        slot.groups = groups;
        slot.vfs = vfs;
    }
}

impl std::fmt::Debug for GroupClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupClassifier")
            .field("groups", &self.groups)
            .field("vfs", &self.vfs)
            .field("per_port_capacity", &self.per_port_capacity)
            .finish()
    }
}

/// Line rate from width (lanes) and speed code (Gb/s per lane).
pub fn link_rate_mbps(width: u8, speed: u8) -> u32 {
    // Гб/с -> МБ/с
    width.max(1) as u32 * speed as u32 * 1000 / 8
}
