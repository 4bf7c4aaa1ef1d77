//! Short-term history store.
//!
//! Кольцо записей (HistoryRecord) фиксированной глубины поверх каталога с
//! файлами composite. Слот свободен <=> index == None. Записи в кольце всегда
//! упорядочены по времени: самая старая - логически «следующая» после
//! current_record_index, самая новая - в current_record_index.
//!
//! Два вторичных индекса: image id -> слот и sweep time -> слот. Записи,
//! полученные через inject (standby), содержат только имя файла и в индексы не
//! попадают до reload.
//!
//! Подмодули:
//! - filename.rs - имена файлов;
//! - load.rs     - начальное сканирование каталога / reload;
//! - store.rs    - store_composite, prune, compounding;
//! - inject.rs   - вставка файла вне порядка.

pub mod filename;
pub mod inject;
pub mod load;
pub mod store;

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::composite::{decode_file, CompositeHeader, CompositeImage, QueryImage};
use crate::config::PmConfig;
use crate::consts::{MAX_COMPRESSION_DIVISIONS, MAX_IMAGES_PER_COMPOSITE};
use crate::lock::{try_lock_dir, DirLock, LockMode};

pub use filename::{history_filename, parse_history_filename};
pub use inject::InjectOutcome;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryOptions {
    pub dir: PathBuf,
    pub ring_depth: usize,
    pub images_per_composite: usize,
    pub compress: bool,
    pub divisions: usize,
    pub max_disk_bytes: u64,
}

impl HistoryOptions {
    pub fn from_config(cfg: &PmConfig) -> Result<Self> {
        Ok(Self {
            dir: cfg.storage_dir(),
            ring_depth: cfg.history_ring_depth()?,
            images_per_composite: cfg.history.images_per_composite as usize,
            compress: cfg.history.compress,
            divisions: cfg.history.compression_divisions,
            max_disk_bytes: cfg.max_disk_bytes(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.ring_depth == 0 {
            return Err(anyhow!("history ring depth must be >= 1"));
        }
        if self.images_per_composite == 0 || self.images_per_composite > MAX_IMAGES_PER_COMPOSITE {
            return Err(anyhow!(
                "images_per_composite must be in 1..={} (got {})",
                MAX_IMAGES_PER_COMPOSITE,
                self.images_per_composite
            ));
        }
        if self.divisions == 0 || self.divisions > MAX_COMPRESSION_DIVISIONS {
            return Err(anyhow!(
                "compression divisions must be in 1..={} (got {})",
                MAX_COMPRESSION_DIVISIONS,
                self.divisions
            ));
        }
        Ok(())
    }
}

/// One ring slot of the history catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Stable ring slot; None = slot not in use.
    pub index: Option<usize>,
    pub filename: String,
    /// On-disk header copy; None for injected files not cataloged yet.
    pub header: Option<CompositeHeader>,
    pub size: u64,
}

impl HistoryRecord {
    pub fn in_use(&self) -> bool {
        self.index.is_some()
    }

    /// Timestamp embedded in the file name.
    pub fn timestamp(&self) -> Option<u64> {
        parse_history_filename(&self.filename).map(|(t, _)| t)
    }
}

#[derive(Debug)]
pub struct ShortTermHistory {
    opts: HistoryOptions,
    records: Vec<HistoryRecord>,
    current_record_index: usize,
    by_image_id: HashMap<u64, usize>,
    by_time: BTreeMap<u64, usize>,
    /// Composite being compounded from fresh sweeps.
    current_composite: Option<CompositeImage>,
    /// Composite frozen for a query (one at a time).
    cached_composite: Option<(String, Arc<QueryImage>)>,
    total_disk_usage: u64,
    invalid_files: Vec<String>,
    cancel: Arc<AtomicBool>,
    _lock: DirLock,
}

impl ShortTermHistory {
    /// Open (create) the storage directory, lock it and load the catalog.
    pub fn open(opts: HistoryOptions, cancel: Arc<AtomicBool>) -> Result<Self> {
        opts.validate()?;
        std::fs::create_dir_all(&opts.dir)
            .with_context(|| format!("create history dir {}", opts.dir.display()))?;
        let lock = try_lock_dir(&opts.dir, LockMode::Exclusive)?;

        let cap = opts.ring_depth;
        let mut h = Self {
            opts,
            records: vec![HistoryRecord::default(); cap],
            current_record_index: cap - 1,
            by_image_id: HashMap::new(),
            by_time: BTreeMap::new(),
            current_composite: None,
            cached_composite: None,
            total_disk_usage: 0,
            invalid_files: Vec::new(),
            cancel,
            _lock: lock,
        };
        h.load()?;
        Ok(h)
    }

    pub fn dir(&self) -> &Path {
        &self.opts.dir
    }

    pub fn options(&self) -> &HistoryOptions {
        &self.opts
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    pub fn current_record_index(&self) -> usize {
        self.current_record_index
    }

    pub fn total_disk_usage(&self) -> u64 {
        self.total_disk_usage
    }

    pub fn invalid_files(&self) -> &[String] {
        &self.invalid_files
    }

    pub fn record(&self, slot: usize) -> Option<&HistoryRecord> {
        self.records.get(slot).filter(|r| r.in_use())
    }

    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| r.in_use()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_slot(&self, slot: usize) -> usize {
        (slot + 1) % self.records.len()
    }

    /// Ring slots in use, oldest first.
    pub(crate) fn ordered_slots(&self) -> Vec<usize> {
        let cap = self.records.len();
        (1..=cap)
            .map(|k| (self.current_record_index + k) % cap)
            .filter(|&s| self.records[s].in_use())
            .collect()
    }

    /// Catalog entries, oldest first.
    pub fn records_chronological(&self) -> Vec<&HistoryRecord> {
        self.ordered_slots()
            .into_iter()
            .map(|s| &self.records[s])
            .collect()
    }

    /// File names, newest first (DBSync walks the history in this order).
    pub fn filenames_newest_first(&self) -> Vec<String> {
        let mut v: Vec<String> = self
            .records_chronological()
            .into_iter()
            .map(|r| r.filename.clone())
            .collect();
        v.reverse();
        v
    }

    pub(crate) fn reindex(&mut self) {
        self.by_image_id.clear();
        self.by_time.clear();
        for (slot, r) in self.records.iter().enumerate() {
            if !r.in_use() {
                continue;
            }
            if let Some(h) = &r.header {
                for id in &h.image_ids {
                    self.by_image_id.insert(*id, slot);
                }
                self.by_time.insert(h.timestamp, slot);
            }
        }
    }

    pub fn find_by_image_id(&self, image_id: u64) -> Option<&HistoryRecord> {
        self.by_image_id
            .get(&image_id)
            .and_then(|&s| self.record(s))
    }

    /// Newest record whose composite started at or before `timestamp`.
    pub fn find_by_time(&self, timestamp: u64) -> Option<&HistoryRecord> {
        self.by_time
            .range(..=timestamp)
            .next_back()
            .and_then(|(_, &s)| self.record(s))
    }

    pub fn find_by_filename(&self, filename: &str) -> Option<&HistoryRecord> {
        self.records
            .iter()
            .find(|r| r.in_use() && r.filename == filename)
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.opts.dir.join(filename)
    }

    /// Raw bytes of a cataloged file (DBSync payload).
    pub fn read_file_bytes(&self, filename: &str) -> Result<Vec<u8>> {
        if self.find_by_filename(filename).is_none() {
            return Err(anyhow!("{} is not in the history catalog", filename));
        }
        let path = self.file_path(filename);
        std::fs::read(&path).with_context(|| format!("read history file {}", path.display()))
    }

    pub fn read_composite(&self, filename: &str) -> Result<CompositeImage> {
        let bytes = self.read_file_bytes(filename)?;
        decode_file(&bytes, &self.cancel).with_context(|| format!("decode {}", filename))
    }

    /// Pin a stored composite for queries. Replaces a previously cached one.
    pub fn freeze_composite(&mut self, filename: &str) -> Result<Arc<QueryImage>> {
        if let Some((name, q)) = &self.cached_composite {
            if name == filename {
                return Ok(Arc::clone(q));
            }
        }
        let c = self.read_composite(filename)?;
        let q = Arc::new(QueryImage::reconstitute(c));
        self.cached_composite = Some((filename.to_string(), Arc::clone(&q)));
        Ok(q)
    }

    pub fn release_composite(&mut self, filename: &str) -> bool {
        match &self.cached_composite {
            Some((name, _)) if name == filename => {
                self.cached_composite = None;
                true
            }
            _ => false,
        }
    }

    pub fn cached_composite(&self) -> Option<&Arc<QueryImage>> {
        self.cached_composite.as_ref().map(|(_, q)| q)
    }

    pub fn current_composite(&self) -> Option<&CompositeImage> {
        self.current_composite.as_ref()
    }

    /// A composite is being compounded and not yet written.
    pub fn is_compounding(&self) -> bool {
        self.current_composite.is_some()
    }
}
