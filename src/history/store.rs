//! store_composite / prune / compounding.
//!
//! Новый файл всегда занимает слот next(current_record_index). Занятый слот
//! сначала освобождается (самая старая запись), затем при необходимости
//! срабатывает квота. Запись файла - tmp + rename.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::composite::{compound_image, encode_file, CompositeHeader, CompositeImage, CompoundOutcome};
use crate::metrics::{record_composite_stored, record_history_pruned};

use super::filename::history_filename;
use super::{HistoryRecord, ShortTermHistory};

/// Write `bytes` to `<dir>/<name>` through a tmp file.
pub(crate) fn write_file_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let path = dir.join(name);
    let tmp = dir.join(format!("{}.tmp", name));
    let _ = fs::remove_file(&tmp);

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .with_context(|| format!("open {}", tmp.display()))?;
    f.write_all(bytes)
        .with_context(|| format!("write {}", tmp.display()))?;
    f.sync_all()?;
    drop(f);

    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

impl ShortTermHistory {
    /// Delete the file of one ring slot and free the slot. A file that is
    /// already gone counts as removed.
    pub(crate) fn prune_one_stored_history_file(&mut self, slot: usize) -> Result<u64> {
        let Some(rec) = self.records.get(slot).filter(|r| r.in_use()) else {
            return Ok(0);
        };
        let path = self.file_path(&rec.filename);
        let size = rec.size;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("history: {} already removed", path.display());
            }
            Err(e) => {
                return Err(anyhow!("remove history file {}: {}", path.display(), e));
            }
        }
        if let Some((name, _)) = &self.cached_composite {
            if *name == self.records[slot].filename {
                self.cached_composite = None;
            }
        }
        self.records[slot] = HistoryRecord::default();
        self.total_disk_usage = self.total_disk_usage.saturating_sub(size);
        self.by_image_id.retain(|_, s| *s != slot);
        self.by_time.retain(|_, s| *s != slot);
        record_history_pruned(size);
        debug!("history: pruned slot {} ({} bytes)", slot, size);
        Ok(size)
    }

    /// Free at least `need` bytes, oldest first. If a full pass over the ring
    /// is not enough the tracked usage is out of sync with the disk and is reset.
    pub fn prune_stored_history(&mut self, need: u64) -> u64 {
        let cap = self.records.len();
        let mut reclaimed = 0u64;
        for k in 1..=cap {
            if reclaimed >= need {
                break;
            }
            let slot = (self.current_record_index + k) % cap;
            if !self.records[slot].in_use() {
                continue;
            }
            match self.prune_one_stored_history_file(slot) {
                Ok(n) => reclaimed += n,
                Err(e) => warn!("history: prune failed: {:#}", e),
            }
        }
        if reclaimed < need {
            warn!(
                "history: reclaimed {} of {} bytes after a full pass; resetting tracked usage ({})",
                reclaimed, need, self.total_disk_usage
            );
            self.total_disk_usage = 0;
        }
        reclaimed
    }

    /// Write a finished composite into the next ring slot. Returns the file name.
    pub fn store_composite(&mut self, c: &CompositeImage) -> Result<String> {
        let bytes = encode_file(c, self.opts.compress, self.opts.divisions, &self.cancel)?;
        let name = history_filename(c.header.timestamp, self.opts.compress)?;
        let size = bytes.len() as u64;
        if size > self.opts.max_disk_bytes {
            return Err(anyhow!(
                "composite {} is {} bytes, larger than the disk quota {}",
                name,
                size,
                self.opts.max_disk_bytes
            ));
        }
        if self.find_by_filename(&name).is_some() {
            return Err(anyhow!("history file {} already exists", name));
        }

        let slot = self.next_slot(self.current_record_index);
        if self.records[slot].in_use() {
            self.prune_one_stored_history_file(slot)?;
        }
        if self.total_disk_usage + size > self.opts.max_disk_bytes {
            let need = self.total_disk_usage + size - self.opts.max_disk_bytes;
            self.prune_stored_history(need);
        }

        write_file_atomic(&self.opts.dir, &name, &bytes)?;

        let header = CompositeHeader::decode(&bytes)?;
        for id in &header.image_ids {
            self.by_image_id.insert(*id, slot);
        }
        self.by_time.insert(header.timestamp, slot);
        self.records[slot] = HistoryRecord {
            index: Some(slot),
            filename: name.clone(),
            header: Some(header),
            size,
        };
        self.current_record_index = slot;
        self.total_disk_usage += size;
        record_composite_stored(size);
        info!(
            "history: stored {} ({} bytes, {} image(s)) in slot {}",
            name,
            size,
            c.num_images(),
            slot
        );
        Ok(name)
    }

    /// Feed one freshly swept image. The composite is written once it holds
    /// images_per_composite images, or early when the topology changed.
    /// Returns the names of files written.
    pub fn add_image(&mut self, image: CompositeImage) -> Result<Vec<String>> {
        let mut written = Vec::new();
        let image = match self.current_composite.as_mut() {
            None => Some(image),
            Some(cur) => match compound_image(cur, &image)? {
                CompoundOutcome::Merged(_) => None,
                CompoundOutcome::TopologyChanged { .. } => Some(image),
            },
        };
        if let Some(fresh) = image {
            if let Some(done) = self.current_composite.take() {
                written.push(self.store_composite(&done)?);
            }
            self.current_composite = Some(fresh);
        }

        let full = self
            .current_composite
            .as_ref()
            .map(|c| c.num_images() >= self.opts.images_per_composite)
            .unwrap_or(false);
        if full {
            if let Some(done) = self.current_composite.take() {
                written.push(self.store_composite(&done)?);
            }
        }
        Ok(written)
    }

    /// Write a partially compounded composite (shutdown).
    pub fn flush(&mut self) -> Result<Option<String>> {
        match self.current_composite.take() {
            Some(c) => self.store_composite(&c).map(Some),
            None => Ok(None),
        }
    }

    /// Drop the composite being compounded without writing it.
    pub fn discard_current(&mut self) {
        self.current_composite = None;
    }
}
