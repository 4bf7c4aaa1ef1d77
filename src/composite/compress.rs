//! Параллельное сжатие body по divisions.
//!
//! Body режется на куски по division_chunk(len, divisions) байт (последний
//! может быть короче), каждый кусок сжимается своим потоком в отдельный
//! zstd-кадр. Распаковка - обратная операция: каждый поток пишет в свой
//! непересекающийся срез выходного буфера. Все потоки join'ятся до возврата,
//! в том числе при ошибке или отмене.

use anyhow::{anyhow, Result};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::consts::{MAX_COMPRESSION_DIVISIONS, ZSTD_LEVEL};
use crate::error::PmError;

/// Chunk length for `len` bytes split into `divisions` parts.
pub fn division_chunk(len: usize, divisions: usize) -> usize {
    let d = divisions.clamp(1, MAX_COMPRESSION_DIVISIONS);
    if len == 0 {
        0
    } else {
        len.div_ceil(d)
    }
}

fn join_all<T>(handles: Vec<thread::ScopedJoinHandle<'_, Result<T>>>) -> Vec<Result<T>> {
    handles
        .into_iter()
        .map(|h| match h.join() {
            Ok(r) => r,
            Err(_) => Err(anyhow!("compression worker panicked")),
        })
        .collect()
}

/// Compress `buf` into independent zstd frames. Returns the concatenated
/// frames and the per-division compressed lengths.
pub fn compress_buffer(
    buf: &[u8],
    divisions: usize,
    cancel: &AtomicBool,
) -> Result<(Vec<u8>, Vec<u32>)> {
    let chunk = division_chunk(buf.len(), divisions);
    if chunk == 0 {
        return Ok((Vec::new(), Vec::new()));
    }

    let results = thread::scope(|s| {
        let handles: Vec<_> = buf
            .chunks(chunk)
            .map(|piece| {
                s.spawn(move || -> Result<Vec<u8>> {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(PmError::Shutdown.into());
                    }
                    Ok(zstd::bulk::compress(piece, ZSTD_LEVEL)?)
                })
            })
            .collect();
        join_all(handles)
    });

    if cancel.load(Ordering::Relaxed) {
        return Err(PmError::Shutdown.into());
    }
    let mut out = Vec::new();
    let mut sizes = Vec::with_capacity(results.len());
    for r in results {
        let frame = r?;
        sizes.push(frame.len() as u32);
        out.extend_from_slice(&frame);
    }
    debug!(
        "compress: {} -> {} bytes in {} division(s)",
        buf.len(),
        out.len(),
        sizes.len()
    );
    Ok((out, sizes))
}

/// Inverse of compress_buffer. `flat_size` is the original length.
pub fn decompress_buffer(
    data: &[u8],
    div_sizes: &[u32],
    flat_size: usize,
    cancel: &AtomicBool,
) -> Result<Vec<u8>> {
    let total: u64 = div_sizes.iter().map(|&s| s as u64).sum();
    if total != data.len() as u64 {
        return Err(anyhow!(
            "division table covers {} bytes, payload has {}",
            total,
            data.len()
        ));
    }
    if flat_size == 0 {
        if div_sizes.is_empty() {
            return Ok(Vec::new());
        }
        return Err(anyhow!("empty flat body with {} division(s)", div_sizes.len()));
    }
    let chunk = division_chunk(flat_size, div_sizes.len());
    if div_sizes.is_empty() || flat_size.div_ceil(chunk) != div_sizes.len() {
        return Err(anyhow!(
            "division count {} does not fit flat size {}",
            div_sizes.len(),
            flat_size
        ));
    }

    let mut out = Vec::new();
    out.try_reserve_exact(flat_size)
        .map_err(|e| anyhow!("decompress buffer of {} bytes: {}", flat_size, e))?;
    out.resize(flat_size, 0u8);

    let mut inputs = Vec::with_capacity(div_sizes.len());
    let mut off = 0usize;
    for &sz in div_sizes {
        inputs.push(&data[off..off + sz as usize]);
        off += sz as usize;
    }

    let results = thread::scope(|s| {
        let handles: Vec<_> = out
            .chunks_mut(chunk)
            .zip(inputs)
            .map(|(dst, src)| {
                s.spawn(move || -> Result<()> {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(PmError::Shutdown.into());
                    }
                    let plain = zstd::bulk::decompress(src, dst.len())?;
                    if plain.len() != dst.len() {
                        return Err(anyhow!(
                            "division decompressed to {} bytes, expected {}",
                            plain.len(),
                            dst.len()
                        ));
                    }
                    dst.copy_from_slice(&plain);
                    Ok(())
                })
            })
            .collect();
        join_all(handles)
    });

    if cancel.load(Ordering::Relaxed) {
        return Err(PmError::Shutdown.into());
    }
    for r in results {
        r?;
    }
    Ok(out)
}
