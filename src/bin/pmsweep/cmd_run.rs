use anyhow::{anyhow, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tiny_http::{Header, Response, Server};

use pmsweep::metrics::metrics_snapshot;
use pmsweep::topology::{FabricTopology, TopologyGuard, TopologySource};
use pmsweep::{PmConfig, SweepEngine};

/// Topology backed by a JSON file; re-read when its mtime changes.
struct FileTopology {
    path: PathBuf,
    mtime: Mutex<Option<SystemTime>>,
    inner: RwLock<FabricTopology>,
}

impl FileTopology {
    fn open(path: &Path) -> Result<Self> {
        let t = FabricTopology::from_json_file(path)?;
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok(Self {
            path: path.to_path_buf(),
            mtime: Mutex::new(mtime),
            inner: RwLock::new(t),
        })
    }

    fn refresh(&self) {
        let Ok(cur) = std::fs::metadata(&self.path).and_then(|m| m.modified()) else {
            return;
        };
        let Ok(mut seen) = self.mtime.lock() else {
            return;
        };
        if *seen == Some(cur) {
            return;
        }
        match FabricTopology::from_json_file(&self.path) {
            Ok(t) => {
                if let Ok(mut g) = self.inner.write() {
                    info!("topology: reloaded {} ({} nodes)", self.path.display(), t.nodes.len());
                    *g = t;
                    *seen = Some(cur);
                }
            }
            // файл может быть недописан; попробуем на следующем свипе
            Err(e) => warn!("topology: reload failed: {:#}", e),
        }
    }
}

impl TopologySource for FileTopology {
    fn read(&self) -> TopologyGuard<'_> {
        self.refresh();
        match self.inner.read() {
            Ok(g) => Box::new(g),
            Err(p) => Box::new(p.into_inner()),
        }
    }
}

fn serve_metrics(addr: String) -> Result<()> {
    let server = Server::http(&addr).map_err(|e| anyhow!("bind http at {}: {}", addr, e))?;
    info!("metrics exporter listening on {}", addr);
    std::thread::Builder::new()
        .name("pm-metrics".into())
        .spawn(move || loop {
            let rq = match server.recv() {
                Ok(rq) => rq,
                Err(e) => {
                    warn!("http recv error: {}", e);
                    continue;
                }
            };
            let url = rq.url().to_string();
            let is_get = rq.method().as_str() == "GET";

            if is_get && (url == "/" || url == "/health") {
                let _ = rq.respond(Response::from_string("OK\n"));
                continue;
            }
            if is_get && url == "/metrics" {
                let mut resp = Response::from_string(metrics_snapshot().to_prometheus());
                if let Ok(ct) = Header::from_bytes(b"Content-Type", b"text/plain; version=0.0.4") {
                    resp.add_header(ct);
                }
                let _ = rq.respond(resp);
                continue;
            }
            let _ = rq.respond(Response::from_string("not found\n").with_status_code(404));
        })?;
    Ok(())
}

pub fn exec(
    config: Option<PathBuf>,
    topology: PathBuf,
    sweeps: Option<u64>,
    metrics_addr: Option<String>,
) -> Result<()> {
    let cfg = match config {
        Some(p) => PmConfig::from_json_file(&p)?,
        None => PmConfig::from_env(),
    };
    info!("{}", cfg);

    let topo = Arc::new(FileTopology::open(&topology)?);
    let engine = Arc::new(SweepEngine::new(cfg, topo)?);

    if let Some(addr) = metrics_addr {
        serve_metrics(addr)?;
    }

    engine.start(sweeps)?;
    engine.wait()?;
    engine.shutdown()?;

    let m = metrics_snapshot();
    println!(
        "sweeps: started={} completed={} skipped={} failed={}",
        m.sweeps_started, m.sweeps_completed, m.sweeps_skipped, m.sweeps_failed
    );
    println!(
        "history: stored={} pruned={} invalid={}",
        m.composites_stored, m.history_files_pruned, m.history_invalid_files
    );
    Ok(())
}
