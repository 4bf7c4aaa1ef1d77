//! inject_history_file - standby принимает файл, присланный мастером, в
//! произвольном порядке.
//!
//! Позиция находится по времени из имени файла. Если кольцо полно и файл
//! старше всего, что есть, - файл отбрасывается. Иначе записи от точки вставки
//! до current сдвигаются на один слот вперёд (при полном кольце самая старая
//! запись вытесняется), а новая запись хранит только имя файла.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use crate::metrics::record_history_injected;

use super::filename::parse_history_filename;
use super::store::write_file_atomic;
use super::{HistoryRecord, ShortTermHistory};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InjectOutcome {
    Injected { slot: usize },
    /// Older than everything in a full ring.
    Discarded,
    /// A file with this name is already cataloged.
    Duplicate,
}

impl ShortTermHistory {
    pub fn inject_history_file(&mut self, filename: &str, bytes: &[u8]) -> Result<InjectOutcome> {
        let (ts, _) = parse_history_filename(filename)
            .ok_or_else(|| anyhow!("not a history file name: {:?}", filename))?;
        if bytes.is_empty() {
            return Err(anyhow!("empty history file {}", filename));
        }
        let size = bytes.len() as u64;
        if size > self.opts.max_disk_bytes {
            return Err(anyhow!(
                "history file {} is {} bytes, larger than the disk quota {}",
                filename,
                size,
                self.opts.max_disk_bytes
            ));
        }
        if self.find_by_filename(filename).is_some() {
            debug!("history: inject {} skipped, already present", filename);
            return Ok(InjectOutcome::Duplicate);
        }

        let cap = self.records.len();
        let order = self.ordered_slots();
        let pos = order
            .iter()
            .take_while(|&&s| self.records[s].timestamp().map(|t| t < ts).unwrap_or(true))
            .count();
        let full = order.len() == cap;
        if full && pos == 0 {
            info!("history: inject {} discarded, older than the whole ring", filename);
            return Ok(InjectOutcome::Discarded);
        }

        write_file_atomic(&self.opts.dir, filename, bytes)?;

        let mut evicted_size = 0;
        if full {
            // место освобождает самая старая запись
            let oldest = order[0];
            match self.prune_one_stored_history_file(oldest) {
                Ok(n) => evicted_size = n,
                Err(e) => {
                    let _ = std::fs::remove_file(self.file_path(filename));
                    return Err(e);
                }
            }
        }

        // Сдвиг: упорядоченные записи раскладываются так, чтобы самая новая
        // оказалась в новом current.
        let live: Vec<usize> = order
            .into_iter()
            .filter(|&s| self.records[s].in_use())
            .collect();
        let mut entries: Vec<HistoryRecord> = live
            .into_iter()
            .map(|s| std::mem::take(&mut self.records[s]))
            .collect();
        let insert_at = if full { pos - 1 } else { pos };
        entries.insert(
            insert_at,
            HistoryRecord {
                index: None,
                filename: filename.to_string(),
                header: None,
                size,
            },
        );
        let new_current = if full {
            self.current_record_index
        } else {
            self.next_slot(self.current_record_index)
        };
        let n = entries.len();
        let mut slot_of_new = new_current;
        for (j, mut r) in entries.into_iter().enumerate() {
            let slot = (new_current + cap - (n - 1 - j)) % cap;
            r.index = Some(slot);
            if j == insert_at {
                slot_of_new = slot;
            }
            self.records[slot] = r;
        }
        self.current_record_index = new_current;
        self.total_disk_usage += size;
        self.reindex();

        if self.total_disk_usage > self.opts.max_disk_bytes {
            let need = self.total_disk_usage - self.opts.max_disk_bytes;
            warn!("history: inject {} crosses the disk quota, pruning {} bytes", filename, need);
            self.prune_stored_history(need);
        }

        record_history_injected();
        info!(
            "history: injected {} into slot {} (evicted {} bytes)",
            filename, slot_of_new, evicted_size
        );
        Ok(InjectOutcome::Injected { slot: slot_of_new })
    }
}
