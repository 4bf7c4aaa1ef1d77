//! Состояние синхронизации standby (base) и его diff со свежим снимком.

use log::{debug, info};

use super::{StandbySm, SyncCapability};

/// Per-standby sync progress.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DbsyncSmInfo {
    pub port_guid: u64,
    pub lid: u32,
    pub priority: u8,
    pub state: u8,
    pub sync_capability: SyncCapability,
    /// RAM images owed to this standby.
    pub num_ram_images_for_sync: u64,
    pub num_sweep_images_sent: u64,
    pub num_history_images_sent: u64,
    pub ram_sync_needed: bool,
    pub history_sync_needed: bool,
    /// Discovered on this tick.
    pub newly_added: bool,
}

impl DbsyncSmInfo {
    fn from_sm(sm: &StandbySm) -> Self {
        Self {
            port_guid: sm.port_guid,
            lid: sm.lid,
            priority: sm.priority,
            state: sm.state,
            sync_capability: sm.sync_capability,
            ..Self::default()
        }
    }

    pub fn in_sync(&self) -> bool {
        !self.ram_sync_needed && !self.history_sync_needed
    }
}

#[derive(Debug, Default)]
pub struct DbsyncState {
    pub(crate) base: Vec<DbsyncSmInfo>,
    pub(crate) was_master: bool,
    /// Newest sweep number already pushed to every standby.
    pub(crate) last_sent_sweep: u64,
    /// Newest history file already pushed to every standby.
    pub(crate) last_sent_history: Option<String>,
}

fn compatible(sms: Vec<StandbySm>) -> Vec<StandbySm> {
    sms.into_iter()
        .filter(|s| s.sync_capability == SyncCapability::Supported)
        .collect()
}

impl DbsyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standbys(&self) -> &[DbsyncSmInfo] {
        &self.base
    }

    pub fn standby(&self, port_guid: u64) -> Option<&DbsyncSmInfo> {
        self.base.iter().find(|s| s.port_guid == port_guid)
    }

    pub fn last_sent_sweep(&self) -> u64 {
        self.last_sent_sweep
    }

    pub fn last_sent_history(&self) -> Option<&str> {
        self.last_sent_history.as_deref()
    }

    /// Standby -> master: whatever standbys exist now are the truth, nothing owed.
    pub fn rebaseline(&mut self, current: Vec<StandbySm>, latest_sweep: u64) {
        self.base = compatible(current)
            .iter()
            .map(DbsyncSmInfo::from_sm)
            .collect();
        self.last_sent_sweep = latest_sweep;
        info!(
            "dbsync: baseline reset, {} standby(s), last sweep {}",
            self.base.len(),
            latest_sweep
        );
    }

    /// Diff base against a fresh snapshot. Additions owe a full RAM-then-history
    /// resync; standbys matched by LID keep their progress. Returns the number
    /// of newly added standbys.
    pub fn check_for_changes_in_standby_sms(
        &mut self,
        new: Vec<StandbySm>,
        num_sweeps: u64,
        total_images: usize,
    ) -> usize {
        let new = compatible(new);
        let mut added = 0;
        let mut next = Vec::with_capacity(new.len());
        for sm in &new {
            match self.base.iter().find(|b| b.lid == sm.lid) {
                Some(b) => {
                    let mut kept = b.clone();
                    kept.port_guid = sm.port_guid;
                    kept.priority = sm.priority;
                    kept.state = sm.state;
                    kept.sync_capability = sm.sync_capability;
                    kept.newly_added = false;
                    next.push(kept);
                }
                None => {
                    let quota = num_sweeps.min(total_images as u64);
                    let mut info = DbsyncSmInfo::from_sm(sm);
                    info.num_ram_images_for_sync = quota;
                    info.ram_sync_needed = quota > 0;
                    info.history_sync_needed = true;
                    info.newly_added = true;
                    info!(
                        "dbsync: new standby {:#018x} (LID {}), {} RAM image(s) owed",
                        sm.port_guid, sm.lid, quota
                    );
                    added += 1;
                    next.push(info);
                }
            }
        }
        for gone in self
            .base
            .iter()
            .filter(|b| !new.iter().any(|n| n.lid == b.lid))
        {
            debug!("dbsync: standby {:#018x} (LID {}) gone", gone.port_guid, gone.lid);
        }
        self.base = next;
        added
    }
}
