use anyhow::{anyhow, Context, Result};
use log::info;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use pmsweep::dbsync::serve_standby;
use pmsweep::{HistoryOptions, ShortTermHistory};

pub fn exec(dir: PathBuf, listen: String, ring_depth: usize, max_disk_mb: u64) -> Result<()> {
    let opts = HistoryOptions {
        dir,
        ring_depth,
        images_per_composite: 1,
        compress: true,
        divisions: 1,
        max_disk_bytes: max_disk_mb.saturating_mul(1024 * 1024),
    };
    let cancel = Arc::new(AtomicBool::new(false));
    let store = Mutex::new(ShortTermHistory::open(opts, Arc::clone(&cancel))?);
    {
        let h = store.lock().map_err(|_| anyhow!("history mutex poisoned"))?;
        info!(
            "standby: {} history file(s), {} bytes in {}",
            h.len(),
            h.total_disk_usage(),
            h.dir().display()
        );
    }

    let listener = TcpListener::bind(&listen).with_context(|| format!("bind {}", listen))?;
    let n = serve_standby(listener, &store, &cancel)?;
    println!("standby: {} frame(s) received", n);
    Ok(())
}
