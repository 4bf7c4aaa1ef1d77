//! Начальная загрузка каталога истории.
//!
//! Файлы сортируются по времени из имени и загружаются от новых к старым, пока
//! кольцо не заполнится. Удаляются: пустые файлы, файлы с неподдерживаемой
//! версией или битым содержимым, всё сверх ёмкости кольца и всё, что старше
//! момента пересечения дисковой квоты. Оставшиеся файлы раскладываются по
//! слотам 0..k-1 (старый -> новый).

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;

use crate::composite::{decode_file, CompositeHeader};
use crate::error::pm_error;
use crate::metrics::{record_history_invalid, record_history_pruned};

use super::filename::parse_history_filename;
use super::{HistoryRecord, ShortTermHistory};

impl ShortTermHistory {
    fn remove_invalid(&mut self, name: &str, why: &str) {
        let path = self.file_path(name);
        warn!("history: removing invalid file {} ({})", path.display(), why);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("history: remove {} failed: {}", path.display(), e),
        }
        record_history_invalid();
        self.invalid_files.push(name.to_string());
    }

    fn remove_excess(&self, name: &str, size: u64, why: &str) {
        let path = self.file_path(name);
        debug!("history: removing {} ({})", path.display(), why);
        match fs::remove_file(&path) {
            Ok(()) => record_history_pruned(size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("history: remove {} failed: {}", path.display(), e),
        }
    }

    pub(crate) fn load(&mut self) -> Result<()> {
        let dir = self.opts.dir.clone();
        let mut found: Vec<(u64, String)> = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("scan history dir {}", dir.display()))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".tmp") {
                if parse_history_filename(stem).is_some() {
                    // недописанный файл от прерванного store
                    let _ = fs::remove_file(entry.path());
                }
                continue;
            }
            if let Some((ts, _)) = parse_history_filename(&name) {
                found.push((ts, name));
            }
        }
        found.sort();

        let cap = self.records.len();
        let max = self.opts.max_disk_bytes;
        let mut kept: Vec<HistoryRecord> = Vec::new();
        let mut total = 0u64;
        let mut over_quota = false;

        for (_, name) in found.iter().rev() {
            let path = self.file_path(name);
            let size = match fs::metadata(&path) {
                Ok(m) => m.len(),
                Err(e) => {
                    warn!("history: stat {} failed: {}", path.display(), e);
                    continue;
                }
            };
            if size == 0 {
                self.remove_invalid(name, "empty file");
                continue;
            }
            if kept.len() == cap {
                self.remove_excess(name, size, "beyond ring capacity");
                continue;
            }
            if over_quota || total + size > max {
                over_quota = true;
                self.remove_excess(name, size, "over disk quota");
                continue;
            }

            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    warn!("history: read {} failed: {}", path.display(), e);
                    continue;
                }
            };
            if let Err(e) = decode_file(&bytes, &self.cancel) {
                let why = match pm_error(&e) {
                    Some(pe) => pe.to_string(),
                    None => format!("{:#}", e),
                };
                self.remove_invalid(name, &why);
                continue;
            }
            let header = CompositeHeader::decode(&bytes)?;

            total += size;
            kept.push(HistoryRecord {
                index: None,
                filename: name.clone(),
                header: Some(header),
                size,
            });
        }

        kept.reverse();
        let k = kept.len();
        for (slot, mut r) in kept.into_iter().enumerate() {
            r.index = Some(slot);
            self.records[slot] = r;
        }
        self.current_record_index = if k == 0 { cap - 1 } else { k - 1 };
        self.total_disk_usage = total;
        self.reindex();

        info!(
            "history: loaded {} file(s), {} bytes, {} invalid, ring depth {} ({})",
            k,
            total,
            self.invalid_files.len(),
            cap,
            dir.display()
        );
        Ok(())
    }

    /// Drop the in-memory catalog and rescan the directory (fully catalogs
    /// injected files).
    pub fn reload(&mut self) -> Result<()> {
        for r in self.records.iter_mut() {
            *r = HistoryRecord::default();
        }
        self.total_disk_usage = 0;
        self.invalid_files.clear();
        self.cached_composite = None;
        self.load()
    }
}
