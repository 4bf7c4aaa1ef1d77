//! Centralized configuration for the PM sweep engine.
//!
//! Goals:
//! - One struct consumed by the engine (the XML loader upstream produces the same values).
//! - PmConfig::from_env() reads PM_* variables; from_json_file() reads a serde JSON file.
//! - PmConfigBuilder for tests and embedding.
//!
//! Derived values:
//! - history_ring_depth() = total_history_hours*3600 / (images_per_composite * sweep_interval_secs), >= 1
//! - max_disk_bytes() = max_disk_space_mb * 1 MiB

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::consts::{
    MAX_COMPRESSION_DIVISIONS, MAX_GROUPS, MAX_IMAGES_PER_COMPOSITE, MAX_VFABRICS, PORT_MAX_GROUPS,
};

/// Правило отбора портов для пользовательской группы.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortSelector {
    AllPorts,
    Hfis,
    Switches,
    /// Node description starts with the prefix.
    NodeDescPrefix(String),
    NodeGuid(u64),
    /// Switch-to-switch links.
    InternalLinks,
    /// Links with an HFI on at least one end.
    ExternalLinks,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// A port belongs to the group if any selector matches.
    pub select: Vec<PortSelector>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Env: PM_STH_ENABLED (default false)
    pub enabled: bool,
    /// Absolute path, created if missing. Env: PM_STH_DIR
    pub storage_location: String,
    /// Env: PM_STH_TOTAL_HISTORY (hours, default 24)
    pub total_history_hours: u32,
    /// Env: PM_STH_IMAGES_PER_COMPOSITE (default 3)
    pub images_per_composite: u32,
    /// Env: PM_STH_COMPRESS (default true)
    pub compress: bool,
    /// Env: PM_STH_COMPRESSION_DIVISIONS (default 1)
    pub compression_divisions: usize,
    /// Env: PM_STH_MAX_DISK_MB (default 1024)
    pub max_disk_space_mb: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage_location: String::new(),
            total_history_hours: 24,
            images_per_composite: 3,
            compress: true,
            compression_divisions: 1,
            max_disk_space_mb: 1024,
        }
    }
}

/// Standby manager reachable for DBSync pushes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandbyPeer {
    pub port_guid: u64,
    pub lid: u32,
    #[serde(default)]
    pub priority: u8,
    /// host:port of the standby receiver.
    pub addr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DbsyncConfig {
    /// Env: PM_DBSYNC_ENABLED (default false)
    pub enabled: bool,
    /// Env: PM_DBSYNC_INTERVAL (seconds, default 5)
    pub image_update_interval_secs: u64,
    pub standbys: Vec<StandbyPeer>,
}

impl Default for DbsyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image_update_interval_secs: 5,
            standbys: Vec::new(),
        }
    }
}

/// Top-level configuration consumed by SweepEngine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PmConfig {
    /// Image ring depth. Env: PM_TOTAL_IMAGES (default 10)
    pub total_images: usize,
    /// Max simultaneously frozen images. Env: PM_FREEZE_FRAME_IMAGES (default 5)
    pub freeze_frame_images: usize,
    /// Freeze-frame lease. Env: PM_FREEZE_FRAME_LEASE (seconds, default 60)
    pub freeze_frame_lease_secs: u64,
    /// Env: PM_SWEEP_INTERVAL (seconds, default 10)
    pub sweep_interval_secs: u32,
    /// Node arena capacity; exceeding it is an allocation failure. Env: PM_MAX_NODES
    pub max_nodes: usize,
    /// Per-port group capacity (<= PORT_MAX_GROUPS).
    pub max_groups_per_port: usize,
    /// User-defined groups (after the built-ins All/HFIs/SWs).
    pub groups: Vec<GroupConfig>,
    /// Configured virtual fabrics, by index.
    pub vfs: Vec<String>,
    pub history: HistoryConfig,
    pub dbsync: DbsyncConfig,
}

impl Default for PmConfig {
    fn default() -> Self {
        Self {
            total_images: 10,
            freeze_frame_images: 5,
            freeze_frame_lease_secs: 60,
            sweep_interval_secs: 10,
            max_nodes: 65536,
            max_groups_per_port: PORT_MAX_GROUPS,
            groups: Vec::new(),
            vfs: Vec::new(),
            history: HistoryConfig::default(),
            dbsync: DbsyncConfig::default(),
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "yes" || s == "on"
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl PmConfig {
    /// Load configuration from PM_* environment variables over the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<usize>("PM_TOTAL_IMAGES") {
            cfg.total_images = n;
        }
        if let Some(n) = env_parse::<usize>("PM_FREEZE_FRAME_IMAGES") {
            cfg.freeze_frame_images = n;
        }
        if let Some(n) = env_parse::<u64>("PM_FREEZE_FRAME_LEASE") {
            cfg.freeze_frame_lease_secs = n;
        }
        if let Some(n) = env_parse::<u32>("PM_SWEEP_INTERVAL") {
            cfg.sweep_interval_secs = n;
        }
        if let Some(n) = env_parse::<usize>("PM_MAX_NODES") {
            cfg.max_nodes = n;
        }

        // ----- short-term history -----
        if let Some(on) = env_bool("PM_STH_ENABLED") {
            cfg.history.enabled = on;
        }
        if let Ok(v) = std::env::var("PM_STH_DIR") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.history.storage_location = s.to_string();
            }
        }
        if let Some(n) = env_parse::<u32>("PM_STH_TOTAL_HISTORY") {
            cfg.history.total_history_hours = n;
        }
        if let Some(n) = env_parse::<u32>("PM_STH_IMAGES_PER_COMPOSITE") {
            cfg.history.images_per_composite = n;
        }
        if let Some(on) = env_bool("PM_STH_COMPRESS") {
            cfg.history.compress = on;
        }
        if let Some(n) = env_parse::<usize>("PM_STH_COMPRESSION_DIVISIONS") {
            cfg.history.compression_divisions = n;
        }
        if let Some(n) = env_parse::<u64>("PM_STH_MAX_DISK_MB") {
            cfg.history.max_disk_space_mb = n;
        }

        // ----- dbsync -----
        if let Some(on) = env_bool("PM_DBSYNC_ENABLED") {
            cfg.dbsync.enabled = on;
        }
        if let Some(n) = env_parse::<u64>("PM_DBSYNC_INTERVAL") {
            cfg.dbsync.image_update_interval_secs = n;
        }

        cfg
    }

    /// Read a JSON config file (missing fields take defaults).
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read config {}", path.display()))?;
        let cfg: PmConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn builder() -> PmConfigBuilder {
        PmConfigBuilder::default()
    }

    /// Short-term history ring depth derived from the time window.
    pub fn history_ring_depth(&self) -> Result<usize> {
        let per_file_secs =
            self.history.images_per_composite as u64 * self.sweep_interval_secs as u64;
        if per_file_secs == 0 {
            return Err(anyhow!(
                "images_per_composite and sweep_interval_secs must be non-zero"
            ));
        }
        let depth = self.history.total_history_hours as u64 * 3600 / per_file_secs;
        if depth < 1 {
            return Err(anyhow!(
                "total_history of {}h is shorter than one composite ({}s)",
                self.history.total_history_hours,
                per_file_secs
            ));
        }
        Ok(depth as usize)
    }

    pub fn max_disk_bytes(&self) -> u64 {
        self.history.max_disk_space_mb.saturating_mul(1024 * 1024)
    }

    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(&self.history.storage_location)
    }

    /// Check bounds; called once by SweepEngine::new.
    pub fn validate(&self) -> Result<()> {
        if self.total_images < 2 {
            return Err(anyhow!("total_images must be >= 2 (got {})", self.total_images));
        }
        if self.freeze_frame_images >= self.total_images {
            return Err(anyhow!(
                "freeze_frame_images ({}) must be < total_images ({})",
                self.freeze_frame_images,
                self.total_images
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(anyhow!("sweep_interval_secs must be > 0"));
        }
        if self.max_groups_per_port > PORT_MAX_GROUPS {
            return Err(anyhow!(
                "max_groups_per_port {} exceeds {}",
                self.max_groups_per_port,
                PORT_MAX_GROUPS
            ));
        }
        if self.groups.len() + 3 > MAX_GROUPS {
            return Err(anyhow!(
                "too many groups: {} (max {} incl. built-ins)",
                self.groups.len() + 3,
                MAX_GROUPS
            ));
        }
        if self.vfs.len() > MAX_VFABRICS {
            return Err(anyhow!("too many vfabrics: {} (max {})", self.vfs.len(), MAX_VFABRICS));
        }
        if self.history.enabled {
            let h = &self.history;
            if h.compression_divisions == 0 || h.compression_divisions > MAX_COMPRESSION_DIVISIONS {
                return Err(anyhow!(
                    "compression_divisions must be in 1..={} (got {})",
                    MAX_COMPRESSION_DIVISIONS,
                    h.compression_divisions
                ));
            }
            if h.images_per_composite == 0
                || h.images_per_composite as usize > MAX_IMAGES_PER_COMPOSITE
            {
                return Err(anyhow!(
                    "images_per_composite must be in 1..={} (got {})",
                    MAX_IMAGES_PER_COMPOSITE,
                    h.images_per_composite
                ));
            }
            if !Path::new(&h.storage_location).is_absolute() {
                return Err(anyhow!(
                    "history storage_location must be an absolute path (got '{}')",
                    h.storage_location
                ));
            }
            if h.max_disk_space_mb == 0 {
                return Err(anyhow!("max_disk_space_mb must be > 0"));
            }
            self.history_ring_depth()?;
        }
        Ok(())
    }
}

impl fmt::Display for PmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PmConfig {{ \
             total_images: {}, \
             freeze_frame_images: {}, \
             freeze_frame_lease_secs: {}, \
             sweep_interval_secs: {}, \
             groups: {}, \
             vfs: {}, \
             history: {}, \
             dbsync: {} \
             }}",
            self.total_images,
            self.freeze_frame_images,
            self.freeze_frame_lease_secs,
            self.sweep_interval_secs,
            self.groups.len(),
            self.vfs.len(),
            if self.history.enabled {
                format!(
                    "on(dir={}, {}h, {}/composite, divisions={}, {}MB)",
                    self.history.storage_location,
                    self.history.total_history_hours,
                    self.history.images_per_composite,
                    self.history.compression_divisions,
                    self.history.max_disk_space_mb
                )
            } else {
                "off".to_string()
            },
            if self.dbsync.enabled {
                format!(
                    "on(every {}s, {} standby peer(s))",
                    self.dbsync.image_update_interval_secs,
                    self.dbsync.standbys.len()
                )
            } else {
                "off".to_string()
            },
        )
    }
}

/// Builder producing a PmConfig (starts from defaults, not from env).
#[derive(Clone, Debug, Default)]
pub struct PmConfigBuilder {
    cfg: PmConfig,
}

impl PmConfigBuilder {
    pub fn total_images(mut self, n: usize) -> Self {
        self.cfg.total_images = n;
        self
    }

    pub fn freeze_frames(mut self, images: usize, lease_secs: u64) -> Self {
        self.cfg.freeze_frame_images = images;
        self.cfg.freeze_frame_lease_secs = lease_secs;
        self
    }

    pub fn sweep_interval_secs(mut self, secs: u32) -> Self {
        self.cfg.sweep_interval_secs = secs;
        self
    }

    pub fn max_nodes(mut self, n: usize) -> Self {
        self.cfg.max_nodes = n;
        self
    }

    pub fn max_groups_per_port(mut self, n: usize) -> Self {
        self.cfg.max_groups_per_port = n;
        self
    }

    pub fn group<S: Into<String>>(mut self, name: S, select: Vec<PortSelector>) -> Self {
        self.cfg.groups.push(GroupConfig {
            name: name.into(),
            select,
        });
        self
    }

    pub fn vf<S: Into<String>>(mut self, name: S) -> Self {
        self.cfg.vfs.push(name.into());
        self
    }

    /// Enable the short-term history store in `dir`.
    pub fn history<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cfg.history.enabled = true;
        self.cfg.history.storage_location = dir.as_ref().to_string_lossy().into_owned();
        self
    }

    pub fn total_history_hours(mut self, hours: u32) -> Self {
        self.cfg.history.total_history_hours = hours;
        self
    }

    pub fn images_per_composite(mut self, n: u32) -> Self {
        self.cfg.history.images_per_composite = n;
        self
    }

    pub fn compression(mut self, on: bool, divisions: usize) -> Self {
        self.cfg.history.compress = on;
        self.cfg.history.compression_divisions = divisions;
        self
    }

    pub fn max_disk_space_mb(mut self, mb: u64) -> Self {
        self.cfg.history.max_disk_space_mb = mb;
        self
    }

    pub fn dbsync(mut self, on: bool, interval_secs: u64) -> Self {
        self.cfg.dbsync.enabled = on;
        self.cfg.dbsync.image_update_interval_secs = interval_secs;
        self
    }

    pub fn standby(mut self, peer: StandbyPeer) -> Self {
        self.cfg.dbsync.standbys.push(peer);
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> PmConfig {
        self.cfg
    }
}
