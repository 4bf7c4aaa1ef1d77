//! RingState - учёт индексов кольца образов (под state_lock).
//!
//! Слот: Invalid -> InProgress -> Valid -> InProgress -> ... Слот с ненулевым
//! freeze-счётчиком никогда не выбирается целью следующего свипа; поиск идёт
//! вперёд по кольцу. Просроченная аренда обнуляет счётчик (клиентский слой
//! freeze-frame сам сообщает об ошибке доступа потом).

use anyhow::{anyhow, Result};
use log::{debug, info};

use crate::error::PmError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreezeInfo {
    pub refs: u32,
    /// Unix seconds of the last freeze on this slot.
    pub since: u64,
}

#[derive(Debug)]
pub struct RingState {
    total_images: usize,
    /// Slot of the last successful sweep (lastHistoryIndex).
    pub last_history_index: Option<usize>,
    /// Last assigned sweep number (1-based; 0 = none yet).
    pub sweep_num: u64,
    /// Completed sweeps since start.
    pub num_sweeps: u64,
    /// Set on the master transition, cleared after the first sweep as master.
    pub first_sweep_as_master: bool,
    /// Last master flag observed by the sweep thread.
    pub was_master: bool,
    freeze: Vec<FreezeInfo>,
}

impl RingState {
    pub fn new(total_images: usize) -> Self {
        Self {
            total_images,
            last_history_index: None,
            sweep_num: 0,
            num_sweeps: 0,
            first_sweep_as_master: false,
            was_master: false,
            freeze: vec![FreezeInfo::default(); total_images],
        }
    }

    pub fn total_images(&self) -> usize {
        self.total_images
    }

    pub fn freeze_info(&self, index: usize) -> FreezeInfo {
        self.freeze.get(index).copied().unwrap_or_default()
    }

    pub fn is_frozen(&self, index: usize) -> bool {
        self.freeze_info(index).refs > 0
    }

    pub fn frozen_count(&self) -> usize {
        self.freeze.iter().filter(|f| f.refs > 0).count()
    }

    /// Force-unfreeze slots whose lease ran out.
    pub fn expire_leases(&mut self, now: u64, lease_secs: u64) -> usize {
        let mut expired = 0;
        for (i, f) in self.freeze.iter_mut().enumerate() {
            if f.refs > 0 && now.saturating_sub(f.since) > lease_secs {
                info!(
                    "image ring: freeze lease expired on slot {} ({} ref(s), age {}s)",
                    i,
                    f.refs,
                    now.saturating_sub(f.since)
                );
                f.refs = 0;
                expired += 1;
            }
        }
        expired
    }

    /// Choose the next sweep target: forward from the last sweep, skipping frozen slots.
    pub fn select_next_sweep_slot(&mut self, now: u64, lease_secs: u64) -> Result<usize, PmError> {
        self.expire_leases(now, lease_secs);
        let n = self.total_images;
        let start = self.last_history_index.map(|i| (i + 1) % n).unwrap_or(0);
        for k in 0..n {
            let i = (start + k) % n;
            if self.freeze[i].refs == 0 {
                if k > 0 {
                    debug!("image ring: skipped {} frozen slot(s), target={}", k, i);
                }
                return Ok(i);
            }
        }
        Err(PmError::NoFreeImage(n))
    }

    /// Record a completed sweep into `index`.
    pub fn complete_sweep(&mut self, index: usize, sweep_num: u64) {
        self.last_history_index = Some(index);
        self.sweep_num = sweep_num;
        self.num_sweeps += 1;
    }

    pub fn next_sweep_num(&self) -> u64 {
        self.sweep_num + 1
    }

    /// Pin a slot. `max_frozen` bounds the number of distinct frozen slots.
    pub fn freeze(&mut self, index: usize, now: u64, max_frozen: usize) -> Result<u32> {
        let n = self.total_images;
        let frozen = self.frozen_count();
        let f = self
            .freeze
            .get_mut(index)
            .ok_or_else(|| anyhow!("image index {} out of range (ring {})", index, n))?;
        if f.refs == 0 && frozen >= max_frozen {
            return Err(anyhow!("freeze-frame limit reached ({} images)", max_frozen));
        }
        f.refs += 1;
        f.since = now;
        Ok(f.refs)
    }

    /// Unpin a slot. Releasing an expired lease is not an error.
    pub fn release(&mut self, index: usize) -> Result<u32> {
        let n = self.total_images;
        let f = self
            .freeze
            .get_mut(index)
            .ok_or_else(|| anyhow!("image index {} out of range (ring {})", index, n))?;
        f.refs = f.refs.saturating_sub(1);
        Ok(f.refs)
    }

    /// Ring index of the image `back` sweeps before the latest one.
    pub fn index_back(&self, back: u64) -> Option<usize> {
        let last = self.last_history_index?;
        let n = self.total_images as u64;
        Some(((last as u64 + n - (back % n)) % n) as usize)
    }
}
