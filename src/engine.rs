//! SweepEngine - владелец кольца образов, арены узлов, истории и DBSync.
//!
//! Порядок блокировок: state_lock -> image_lock[i] -> arena -> history.
//! Свип берёт image_lock целевого слота эксклюзивно ещё под state_lock (при
//! выборе слота), держит его на время copy/tabulate и отпускает до
//! обновления state_lock. dbsync-mutex берётся только
//! потоком репликации и всегда первым.
//!
//! Потоки: sweep и dbsync; оба опрашивают флаг shutdown каждые 100 мс.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::composite::{build_composite, encode_file, QueryImage};
use crate::config::PmConfig;
use crate::consts::SWEEP_RETRY_DELAY_MS;
use crate::dbsync::{
    DbsyncState, ImagePayload, ImageSender, ImageSource, StandbySm, StandbySource,
    StaticStandbys, SyncCapability, TcpImageSender, TickReport,
};
use crate::error::{pm_error, PmError};
use crate::groups::GroupClassifier;
use crate::history::{HistoryOptions, InjectOutcome, ShortTermHistory};
use crate::image::{copy_topology, ImageSlot, ImageState, NodeArena, RingState};
use crate::metrics::{
    record_sweep_completed, record_sweep_failed, record_sweep_skipped, record_sweep_started,
};
use crate::tabulate::{DeltaTabulator, RunningTotals, TabulateContext, Tabulator};
use crate::topology::TopologySource;

const POLL: Duration = Duration::from_millis(100);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn poisoned(what: &str) -> anyhow::Error {
    anyhow!("{} lock poisoned", what)
}

/// Result of one sweep attempt that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed { index: usize, sweep_num: u64 },
    Skipped(PmError),
}

/// Delay before the next sweep: the normal interval after success or a skip,
/// a short fixed retry after a recoverable error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweepSchedule {
    pub interval: Duration,
    pub retry_delay: Duration,
}

impl SweepSchedule {
    pub fn from_config(cfg: &PmConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.sweep_interval_secs as u64),
            retry_delay: Duration::from_millis(SWEEP_RETRY_DELAY_MS),
        }
    }

    pub fn next_delay(&self, outcome: &Result<SweepOutcome>) -> Duration {
        match outcome {
            Ok(_) => self.interval,
            Err(_) => self.retry_delay,
        }
    }
}

/// Ring bookkeeping visible to callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStatus {
    pub last_history_index: Option<usize>,
    pub sweep_num: u64,
    pub num_sweeps: u64,
    pub frozen: usize,
}

pub struct SweepEngine {
    cfg: PmConfig,
    topology: Arc<dyn TopologySource>,
    state: RwLock<RingState>,
    images: Vec<RwLock<ImageSlot>>,
    arena: RwLock<NodeArena>,
    classifier: GroupClassifier,
    tabulator: Box<dyn Tabulator>,
    totals: RunningTotals,
    history: Mutex<Option<ShortTermHistory>>,
    dbsync: Mutex<DbsyncState>,
    standbys: Arc<dyn StandbySource>,
    sender: Arc<dyn ImageSender>,
    shutdown: Arc<AtomicBool>,
    /// Отмена сжатия истории; выставляется после финального flush.
    history_cancel: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SweepEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepEngine")
            .field("total_images", &self.images.len())
            .field("classifier", &self.classifier)
            .finish()
    }
}

fn standbys_from_config(cfg: &PmConfig) -> (StaticStandbys, TcpImageSender) {
    let mut sender = TcpImageSender::new();
    let mut sms = Vec::new();
    for p in &cfg.dbsync.standbys {
        sender.add_peer(p.port_guid, p.addr.clone());
        sms.push(StandbySm {
            port_guid: p.port_guid,
            lid: p.lid,
            priority: p.priority,
            state: 0,
            sync_capability: SyncCapability::Supported,
        });
    }
    (StaticStandbys(sms), sender)
}

impl SweepEngine {
    /// Allocate the ring and open the history store. Allocation failure here
    /// is fatal.
    pub fn new(cfg: PmConfig, topology: Arc<dyn TopologySource>) -> Result<Self> {
        cfg.validate()?;
        let n = cfg.total_images;
        let mut images = Vec::new();
        images
            .try_reserve_exact(n)
            .map_err(|e| PmError::InsufficientMemory(format!("image ring of {}: {}", n, e)))?;
        images.resize_with(n, || RwLock::new(ImageSlot::default()));

        let shutdown = Arc::new(AtomicBool::new(false));
        let history_cancel = Arc::new(AtomicBool::new(false));
        let history = if cfg.history.enabled {
            let opts = HistoryOptions::from_config(&cfg)?;
            Some(ShortTermHistory::open(opts, Arc::clone(&history_cancel))?)
        } else {
            None
        };
        let (standbys, sender) = standbys_from_config(&cfg);
        let classifier = GroupClassifier::from_config(&cfg);

        info!(
            "engine: ring of {} images, history {}, dbsync {}",
            n,
            if history.is_some() { "on" } else { "off" },
            if cfg.dbsync.enabled { "on" } else { "off" }
        );
        Ok(Self {
            state: RwLock::new(RingState::new(n)),
            images,
            arena: RwLock::new(NodeArena::with_limit(cfg.max_nodes)),
            classifier,
            tabulator: Box::new(DeltaTabulator),
            totals: RunningTotals::new(),
            history: Mutex::new(history),
            dbsync: Mutex::new(DbsyncState::new()),
            standbys: Arc::new(standbys),
            sender: Arc::new(sender),
            shutdown,
            history_cancel,
            threads: Mutex::new(Vec::new()),
            topology,
            cfg,
        })
    }

    pub fn with_tabulator(mut self, t: Box<dyn Tabulator>) -> Self {
        self.tabulator = t;
        self
    }

    pub fn with_classifier(mut self, c: GroupClassifier) -> Self {
        self.classifier = c;
        self
    }

    pub fn with_dbsync(mut self, standbys: Arc<dyn StandbySource>, sender: Arc<dyn ImageSender>) -> Self {
        self.standbys = standbys;
        self.sender = sender;
        self
    }

    pub fn config(&self) -> &PmConfig {
        &self.cfg
    }

    pub fn classifier(&self) -> &GroupClassifier {
        &self.classifier
    }

    pub fn total_images(&self) -> usize {
        self.images.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn state_read(&self) -> Result<RwLockReadGuard<'_, RingState>> {
        self.state.read().map_err(|_| poisoned("state"))
    }

    fn state_write(&self) -> Result<RwLockWriteGuard<'_, RingState>> {
        self.state.write().map_err(|_| poisoned("state"))
    }

    fn image_read(&self, index: usize) -> Result<RwLockReadGuard<'_, ImageSlot>> {
        self.images
            .get(index)
            .ok_or_else(|| anyhow!("image index {} out of range", index))?
            .read()
            .map_err(|_| poisoned("image"))
    }

    fn history_lock(&self) -> Result<MutexGuard<'_, Option<ShortTermHistory>>> {
        self.history.lock().map_err(|_| poisoned("history"))
    }

    // ---------------------------------------------------------------- sweep

    pub fn sweep_now(&self) -> Result<SweepOutcome> {
        self.sweep_at(unix_now())
    }

    /// One sweep with `now` (unix seconds) as the sweep start.
    pub fn sweep_at(&self, now: u64) -> Result<SweepOutcome> {
        if self.is_shutdown() {
            return Err(PmError::Shutdown.into());
        }
        record_sweep_started();
        match self.do_sweep(now) {
            Ok(SweepOutcome::Skipped(e)) => {
                record_sweep_skipped();
                debug!("engine: sweep skipped: {}", e);
                Ok(SweepOutcome::Skipped(e))
            }
            Ok(done) => Ok(done),
            Err(e) => {
                record_sweep_failed();
                if pm_error(&e).map(|p| p.is_fatal()).unwrap_or(false) {
                    error!("engine: fatal sweep error, shutting down: {:#}", e);
                    self.shutdown.store(true, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    fn do_sweep(&self, now: u64) -> Result<SweepOutcome> {
        let started = Instant::now();
        let is_master = self.topology.read().is_master;

        let (index, sweep_num, prev_index, mut slot) = {
            let mut st = self.state_write()?;
            if !is_master {
                st.was_master = false;
                return Ok(SweepOutcome::Skipped(PmError::NotMaster));
            }
            if !st.was_master {
                info!("engine: became master");
                st.was_master = true;
                st.first_sweep_as_master = true;
            }
            let index = match st.select_next_sweep_slot(now, self.cfg.freeze_frame_lease_secs) {
                Ok(i) => i,
                Err(e) => return Ok(SweepOutcome::Skipped(e)),
            };
            // слот захватывается до отпускания state_lock: freeze_image не
            // должен увидеть его Valid между выбором и перезаписью
            let slot = self.images[index].write().map_err(|_| poisoned("image"))?;
            (index, st.next_sweep_num(), st.last_history_index, slot)
        };

        let prev = match prev_index.filter(|&p| p != index) {
            Some(p) => Some(self.image_read(p)?),
            None => None,
        };
        let prev_slot: Option<&ImageSlot> = prev.as_deref().filter(|p| p.image.state == ImageState::Valid);

        let old_state = slot.image.state;
        slot.image.state = ImageState::InProgress;

        let mut arena = self.arena.write().map_err(|_| poisoned("arena"))?;
        if let Err(e) = copy_topology(
            &*self.topology,
            &mut slot,
            prev_slot,
            &mut arena,
            &self.classifier,
            sweep_num,
        ) {
            if e.is_skip() {
                slot.image.state = old_state;
                return Ok(SweepOutcome::Skipped(e));
            }
            slot.image.state = ImageState::Invalid;
            return Err(e.into());
        }
        drop(arena);

        slot.image.sweep_num = sweep_num;
        slot.image.sweep_start = now;
        slot.image.image_interval = match prev_slot {
            Some(p) if now > p.image.sweep_start => (now - p.image.sweep_start) as u32,
            _ => self.cfg.sweep_interval_secs,
        };

        let arena = self.arena.read().map_err(|_| poisoned("arena"))?;
        let tab = self.tabulator.tabulate(TabulateContext {
            slot: &mut slot,
            prev: prev_slot,
            arena: &arena,
            classifier: &self.classifier,
            totals: &self.totals,
        });
        if let Err(e) = tab {
            slot.image.state = ImageState::Invalid;
            return Err(e.context(format!("tabulate sweep {}", sweep_num)));
        }
        let duration_us = started.elapsed().as_micros() as u64;
        slot.image.sweep_duration_us = duration_us;
        slot.image.state = ImageState::Valid;

        let composite = if self.cfg.history.enabled {
            match build_composite(&slot, &arena, &self.classifier) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!("engine: composite of sweep {} not built: {:#}", sweep_num, e);
                    None
                }
            }
        } else {
            None
        };
        drop(arena);
        drop(prev);
        drop(slot);

        let first_as_master = {
            let mut st = self.state_write()?;
            st.complete_sweep(index, sweep_num);
            std::mem::replace(&mut st.first_sweep_as_master, false)
        };

        if let Some(c) = composite {
            let mut guard = self.history_lock()?;
            if let Some(h) = guard.as_mut() {
                if first_as_master {
                    // первый свип мастера не компаундится
                    h.discard_current();
                    if h.records_chronological().iter().any(|r| r.header.is_none()) {
                        if let Err(e) = h.reload() {
                            warn!("engine: history reload failed: {:#}", e);
                        }
                    }
                } else if let Err(e) = h.add_image(c) {
                    warn!("engine: history store failed: {:#}", e);
                }
            }
        }

        record_sweep_completed(duration_us);
        debug!(
            "engine: sweep {} -> slot {} in {} us",
            sweep_num, index, duration_us
        );
        Ok(SweepOutcome::Completed { index, sweep_num })
    }

    // ---------------------------------------------------------------- ring queries

    pub fn ring_status(&self) -> Result<RingStatus> {
        let st = self.state_read()?;
        Ok(RingStatus {
            last_history_index: st.last_history_index,
            sweep_num: st.sweep_num,
            num_sweeps: st.num_sweeps,
            frozen: st.frozen_count(),
        })
    }

    pub fn image_state(&self, index: usize) -> Result<ImageState> {
        Ok(self.image_read(index)?.image.state)
    }

    /// Sweep number held by a Valid slot.
    pub fn image_sweep_num(&self, index: usize) -> Result<Option<u64>> {
        let slot = self.image_read(index)?;
        Ok((slot.image.state == ImageState::Valid).then_some(slot.image.sweep_num))
    }

    pub fn valid_image_count(&self) -> usize {
        self.images
            .iter()
            .filter(|l| {
                l.read()
                    .map(|s| s.image.state == ImageState::Valid)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Pin a Valid image. Returns the new freeze count.
    pub fn freeze_image(&self, index: usize) -> Result<u32> {
        let mut st = self.state_write()?;
        if self.image_read(index)?.image.state != ImageState::Valid {
            return Err(anyhow!("image {} is not valid", index));
        }
        st.freeze(index, unix_now(), self.cfg.freeze_frame_images)
    }

    pub fn freeze_image_at(&self, index: usize, now: u64) -> Result<u32> {
        let mut st = self.state_write()?;
        if self.image_read(index)?.image.state != ImageState::Valid {
            return Err(anyhow!("image {} is not valid", index));
        }
        st.freeze(index, now, self.cfg.freeze_frame_images)
    }

    pub fn release_image(&self, index: usize) -> Result<u32> {
        self.state_write()?.release(index)
    }

    /// Random-access view of a RAM image.
    pub fn query_image(&self, index: usize) -> Result<QueryImage> {
        let _st = self.state_read()?;
        let slot = self.image_read(index)?;
        if slot.image.state != ImageState::Valid {
            return Err(anyhow!("image {} is not valid", index));
        }
        let arena = self.arena.read().map_err(|_| poisoned("arena"))?;
        let c = build_composite(&slot, &arena, &self.classifier)?;
        Ok(QueryImage::reconstitute(c))
    }

    /// Read access to a slot under its shared image lock.
    pub fn with_image<R>(&self, index: usize, f: impl FnOnce(&ImageSlot, &NodeArena) -> R) -> Result<R> {
        let slot = self.image_read(index)?;
        let arena = self.arena.read().map_err(|_| poisoned("arena"))?;
        Ok(f(&slot, &arena))
    }

    pub fn clear_running_totals(&self) {
        self.totals.clear();
    }

    pub fn running_totals(&self) -> &RunningTotals {
        &self.totals
    }

    // ---------------------------------------------------------------- history

    /// Run `f` on the history store if it is enabled.
    pub fn with_history<R>(&self, f: impl FnOnce(&mut ShortTermHistory) -> R) -> Result<Option<R>> {
        let mut g = self.history_lock()?;
        Ok(g.as_mut().map(f))
    }

    pub fn inject_history_file(&self, filename: &str, bytes: &[u8]) -> Result<InjectOutcome> {
        let mut g = self.history_lock()?;
        let h = g
            .as_mut()
            .ok_or_else(|| anyhow!("short-term history is disabled"))?;
        h.inject_history_file(filename, bytes)
    }

    // ---------------------------------------------------------------- dbsync

    pub fn dbsync_tick(&self) -> Result<TickReport> {
        let mut st = self.dbsync.lock().map_err(|_| poisoned("dbsync"))?;
        st.tick(self, &*self.standbys, &*self.sender)
    }

    pub fn with_dbsync_state<R>(&self, f: impl FnOnce(&DbsyncState) -> R) -> Result<R> {
        let st = self.dbsync.lock().map_err(|_| poisoned("dbsync"))?;
        Ok(f(&st))
    }

    // ---------------------------------------------------------------- threads

    /// Start the sweep thread (and the dbsync thread when enabled).
    /// `max_sweeps` stops the engine after that many completed sweeps.
    pub fn start(self: &Arc<Self>, max_sweeps: Option<u64>) -> Result<()> {
        let mut threads = self.threads.lock().map_err(|_| poisoned("threads"))?;

        let eng = Arc::clone(self);
        let h = std::thread::Builder::new()
            .name("pm-sweep".into())
            .spawn(move || eng.sweep_loop(max_sweeps))?;
        threads.push(h);

        if self.cfg.dbsync.enabled {
            let eng = Arc::clone(self);
            let h = std::thread::Builder::new()
                .name("pm-dbsync".into())
                .spawn(move || eng.dbsync_loop())?;
            threads.push(h);
        }
        Ok(())
    }

    fn sleep_until(&self, deadline: Instant) {
        while !self.is_shutdown() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(POLL));
        }
    }

    fn sweep_loop(&self, max_sweeps: Option<u64>) {
        let sched = SweepSchedule::from_config(&self.cfg);
        let mut completed = 0u64;
        while !self.is_shutdown() {
            let r = self.sweep_now();
            match &r {
                Ok(SweepOutcome::Completed { .. }) => completed += 1,
                Ok(SweepOutcome::Skipped(_)) => {}
                Err(e) => {
                    if pm_error(e).map(|p| p.is_fatal()).unwrap_or(false) {
                        break;
                    }
                    warn!("engine: sweep failed, retrying: {:#}", e);
                }
            }
            if max_sweeps.map(|m| completed >= m).unwrap_or(false) {
                info!("engine: {} sweep(s) done, stopping", completed);
                self.shutdown.store(true, Ordering::SeqCst);
                break;
            }
            self.sleep_until(Instant::now() + sched.next_delay(&r));
        }
    }

    fn dbsync_loop(&self) {
        let every = Duration::from_secs(self.cfg.dbsync.image_update_interval_secs.max(1));
        while !self.is_shutdown() {
            if let Err(e) = self.dbsync_tick() {
                warn!("dbsync: tick failed: {:#}", e);
            }
            self.sleep_until(Instant::now() + every);
        }
    }

    /// Block until the engine threads exit.
    pub fn wait(&self) -> Result<()> {
        let handles: Vec<_> = {
            let mut t = self.threads.lock().map_err(|_| poisoned("threads"))?;
            t.drain(..).collect()
        };
        for h in handles {
            if h.join().is_err() {
                error!("engine: worker thread panicked");
            }
        }
        Ok(())
    }

    /// Stop the threads, join them and flush the composite being compounded.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wait()?;
        let mut g = self.history_lock()?;
        if let Some(h) = g.as_mut() {
            match h.flush() {
                Ok(Some(name)) => info!("engine: partial composite stored as {}", name),
                Ok(None) => {}
                Err(e) => warn!("engine: partial composite lost: {:#}", e),
            }
        }
        self.history_cancel.store(true, Ordering::SeqCst);
        info!("engine: stopped");
        Ok(())
    }
}

impl ImageSource for SweepEngine {
    fn is_master(&self) -> bool {
        self.topology.read().is_master
    }

    fn latest_sweep(&self) -> Option<(u64, usize)> {
        let st = self.state_read().ok()?;
        st.last_history_index.map(|i| (st.sweep_num, i))
    }

    fn num_sweeps(&self) -> u64 {
        self.state_read().map(|s| s.num_sweeps).unwrap_or(0)
    }

    fn total_images(&self) -> usize {
        self.images.len()
    }

    fn is_compounding(&self) -> bool {
        self.history_lock()
            .map(|g| g.as_ref().map(|h| h.is_compounding()).unwrap_or(false))
            .unwrap_or(false)
    }

    fn ram_image(&self, index: usize) -> Result<Option<ImagePayload>> {
        let slot = self.image_read(index)?;
        if slot.image.state != ImageState::Valid {
            return Ok(None);
        }
        let arena = self.arena.read().map_err(|_| poisoned("arena"))?;
        let c = build_composite(&slot, &arena, &self.classifier)?;
        drop(arena);
        drop(slot);
        let bytes = encode_file(&c, false, 1, &self.history_cancel)?;
        Ok(Some(ImagePayload {
            ram_index: Some(index),
            history_file: None,
            bytes,
        }))
    }

    fn history_files_newest_first(&self) -> Vec<String> {
        self.history_lock()
            .map(|g| g.as_ref().map(|h| h.filenames_newest_first()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn history_image(&self, filename: &str) -> Result<Option<ImagePayload>> {
        let g = self.history_lock()?;
        let Some(h) = g.as_ref() else {
            return Ok(None);
        };
        if h.find_by_filename(filename).is_none() {
            return Ok(None);
        }
        let bytes = h.read_file_bytes(filename)?;
        Ok(Some(ImagePayload {
            ram_index: None,
            history_file: Some(filename.to_string()),
            bytes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_only_after_errors() {
        let cfg = PmConfig::builder().sweep_interval_secs(7).build();
        let s = SweepSchedule::from_config(&cfg);
        assert_eq!(s.next_delay(&Ok(SweepOutcome::Completed { index: 0, sweep_num: 1 })), Duration::from_secs(7));
        assert_eq!(s.next_delay(&Ok(SweepOutcome::Skipped(PmError::NotMaster))), Duration::from_secs(7));
        assert_eq!(s.next_delay(&Err(anyhow!("pma timeout"))), Duration::from_millis(1000));
    }
}
