//! tick / pm_dbsync_operation.

use anyhow::Result;
use log::{debug, trace, warn};

use crate::metrics::{record_dbsync_history_sent, record_dbsync_ram_sent, record_dbsync_send_error};

use super::state::DbsyncState;
use super::{ImageSender, ImageSource, SendTarget, StandbySource};

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub broadcast: bool,
    pub ram_sent: usize,
    pub history_sent: usize,
    /// Standbys skipped this tick (discovered while compounding).
    pub skipped: usize,
}

impl TickReport {
    pub fn total_sent(&self) -> usize {
        self.ram_sent + self.history_sent
    }
}

fn send(sender: &dyn ImageSender, target: SendTarget, p: &super::ImagePayload) -> bool {
    match sender.send_image(target, p) {
        Ok(()) => true,
        Err(e) => {
            record_dbsync_send_error();
            warn!("dbsync: send to {:?} failed: {:#}", target, e);
            false
        }
    }
}

impl DbsyncState {
    /// One replicator cycle.
    pub fn tick(
        &mut self,
        src: &dyn ImageSource,
        standbys: &dyn StandbySource,
        sender: &dyn ImageSender,
    ) -> Result<TickReport> {
        if !src.is_master() {
            if self.was_master {
                debug!("dbsync: no longer master");
            }
            self.was_master = false;
            return Ok(TickReport::default());
        }
        let latest = src.latest_sweep().map(|(n, _)| n).unwrap_or(0);
        if !self.was_master {
            self.was_master = true;
            self.rebaseline(standbys.standbys(), latest);
            // файлы, записанные до смены роли, standby не должны
            self.last_sent_history = src.history_files_newest_first().into_iter().next();
        }

        self.check_for_changes_in_standby_sms(
            standbys.standbys(),
            src.num_sweeps(),
            src.total_images(),
        );
        let report = self.pm_dbsync_operation(src, sender)?;
        for s in self.base.iter_mut() {
            s.newly_added = false;
        }
        Ok(report)
    }

    /// Decide what to push next and push it.
    pub fn pm_dbsync_operation(
        &mut self,
        src: &dyn ImageSource,
        sender: &dyn ImageSender,
    ) -> Result<TickReport> {
        let mut report = TickReport::default();
        if self.base.is_empty() {
            if let Some((n, _)) = src.latest_sweep() {
                self.last_sent_sweep = n;
            }
            self.last_sent_history = src.history_files_newest_first().into_iter().next();
            return Ok(report);
        }

        let pushed = self.push_new_sweep(src, sender, &mut report)?;
        self.push_new_history(src, sender, &mut report)?;
        if pushed {
            return Ok(report);
        }
        self.catch_up(src, sender, &mut report)?;
        Ok(report)
    }

    /// Newest sweep to everyone. False when there is no new sweep.
    fn push_new_sweep(
        &mut self,
        src: &dyn ImageSource,
        sender: &dyn ImageSender,
        report: &mut TickReport,
    ) -> Result<bool> {
        let Some((sweep, index)) = src.latest_sweep().filter(|(n, _)| *n > self.last_sent_sweep) else {
            return Ok(false);
        };
        let Some(payload) = src.ram_image(index)? else {
            return Ok(true);
        };
        let compounding = src.is_compounding();
        let skip = |s: &super::DbsyncSmInfo| s.newly_added && compounding;

        if !self.base.iter().any(skip) {
            if !send(sender, SendTarget::Broadcast, &payload) {
                // last_sent_sweep не двигаем: повтор на следующем tick
                return Ok(true);
            }
            report.broadcast = true;
            for s in self.base.iter_mut() {
                report.ram_sent += 1;
                record_dbsync_ram_sent();
                if s.ram_sync_needed {
                    s.num_sweep_images_sent += 1;
                    if s.num_sweep_images_sent >= s.num_ram_images_for_sync {
                        s.ram_sync_needed = false;
                    }
                }
            }
        } else {
            for s in self.base.iter_mut() {
                if skip(s) {
                    // компенсируем пропуск ещё одним RAM-образом
                    s.num_ram_images_for_sync += 1;
                    s.ram_sync_needed = true;
                    report.skipped += 1;
                    continue;
                }
                if send(sender, SendTarget::Standby(s.port_guid), &payload) {
                    report.ram_sent += 1;
                    record_dbsync_ram_sent();
                    if s.ram_sync_needed {
                        s.num_sweep_images_sent += 1;
                        if s.num_sweep_images_sent >= s.num_ram_images_for_sync {
                            s.ram_sync_needed = false;
                        }
                    }
                }
            }
        }
        self.last_sent_sweep = sweep;
        trace!("dbsync: sweep {} pushed ({:?})", sweep, report);
        Ok(true)
    }

    /// History files written since the last push, oldest first, to everyone.
    /// Stops at the first failed send; the rest goes on the next tick.
    fn push_new_history(
        &mut self,
        src: &dyn ImageSource,
        sender: &dyn ImageSender,
        report: &mut TickReport,
    ) -> Result<()> {
        let list = src.history_files_newest_first();
        let fresh: Vec<&String> = list
            .iter()
            .take_while(|f| self.last_sent_history.as_deref() != Some(f.as_str()))
            .collect();
        for name in fresh.into_iter().rev() {
            let Some(p) = src.history_image(name)? else {
                self.last_sent_history = Some(name.clone());
                continue;
            };
            if !send(sender, SendTarget::Broadcast, &p) {
                break;
            }
            report.history_sent += 1;
            record_dbsync_history_sent();
            self.last_sent_history = Some(name.clone());
            debug!("dbsync: history file {} pushed", name);
        }
        Ok(())
    }

    fn catch_up(
        &mut self,
        src: &dyn ImageSource,
        sender: &dyn ImageSender,
        report: &mut TickReport,
    ) -> Result<()> {
        // Догоняющая синхронизация.
        let last_index = src.latest_sweep().map(|(_, i)| i);
        let n = src.total_images().max(1) as u64;
        let mut files: Option<Vec<String>> = None;
        for s in self.base.iter_mut() {
            if s.ram_sync_needed {
                let Some(last) = last_index else {
                    s.ram_sync_needed = false;
                    continue;
                };
                let idx = ((last as u64 + n - (s.num_sweep_images_sent % n)) % n) as usize;
                match src.ram_image(idx)? {
                    Some(p) => {
                        if send(sender, SendTarget::Standby(s.port_guid), &p) {
                            report.ram_sent += 1;
                            record_dbsync_ram_sent();
                            s.num_sweep_images_sent += 1;
                        }
                    }
                    // слот ещё не заполнялся: образов меньше, чем квота
                    None => s.num_sweep_images_sent = s.num_ram_images_for_sync,
                }
                if s.num_sweep_images_sent >= s.num_ram_images_for_sync {
                    s.ram_sync_needed = false;
                }
                continue;
            }
            if s.history_sync_needed {
                let list = files.get_or_insert_with(|| src.history_files_newest_first());
                let k = s.num_history_images_sent as usize;
                let Some(name) = list.get(k) else {
                    s.history_sync_needed = false;
                    continue;
                };
                match src.history_image(name)? {
                    Some(p) => {
                        if send(sender, SendTarget::Standby(s.port_guid), &p) {
                            report.history_sent += 1;
                            record_dbsync_history_sent();
                            s.num_history_images_sent += 1;
                        }
                    }
                    None => s.num_history_images_sent += 1,
                }
                if s.num_history_images_sent as usize >= list.len() {
                    s.history_sync_needed = false;
                }
            }
        }
        Ok(())
    }
}
