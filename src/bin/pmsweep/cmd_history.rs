use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use pmsweep::composite::{decode_file, CompositeHeader};
use pmsweep::consts::HEADER_SIZE;
use pmsweep::history::filename::parse_history_filename;
use pmsweep::lock::{try_lock_dir, LockMode};

struct Entry {
    name: String,
    ts: u64,
    size: u64,
    header: Option<CompositeHeader>,
}

fn read_header(path: &Path) -> Result<CompositeHeader> {
    let mut f = std::fs::File::open(path)?;
    let mut buf = vec![0u8; HEADER_SIZE];
    f.read_exact(&mut buf)?;
    CompositeHeader::decode(&buf)
}

fn scan(dir: &Path) -> Result<Vec<Entry>> {
    let mut out = Vec::new();
    for e in std::fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let e = e?;
        let name = e.file_name().to_string_lossy().into_owned();
        let Some((ts, _)) = parse_history_filename(&name) else {
            continue;
        };
        let size = e.metadata().map(|m| m.len()).unwrap_or(0);
        let header = read_header(&e.path()).ok();
        out.push(Entry { name, ts, size, header });
    }
    out.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.name.cmp(&b.name)));
    Ok(out)
}

pub fn exec_ls(dir: PathBuf, json: bool) -> Result<()> {
    let _lock = try_lock_dir(&dir, LockMode::Shared)?;
    let entries = scan(&dir)?;
    let total: u64 = entries.iter().map(|e| e.size).sum();

    if json {
        let files: Vec<_> = entries
            .iter()
            .map(|e| {
                json!({
                    "file": e.name,
                    "timestamp": e.ts,
                    "size": e.size,
                    "version": e.header.as_ref().map(|h| h.history_version),
                    "compressed": e.header.as_ref().map(|h| h.is_compressed()),
                    "image_ids": e.header.as_ref().map(|h| h.image_ids.clone()),
                })
            })
            .collect();
        let v = json!({ "dir": dir.display().to_string(), "total_bytes": total, "files": files });
        println!("{}", serde_json::to_string_pretty(&v)?);
        return Ok(());
    }

    println!("{} file(s), {} bytes in {}", entries.len(), total, dir.display());
    for e in &entries {
        match &e.header {
            Some(h) => println!(
                "  {}  {:>10} B  v{}  images={:?}{}",
                e.name,
                e.size,
                h.history_version,
                h.image_ids,
                if h.is_compressed() { "  zstd" } else { "" }
            ),
            None => println!("  {}  {:>10} B  <bad header>", e.name, e.size),
        }
    }
    Ok(())
}

pub fn exec_show(dir: PathBuf, file: String, json: bool) -> Result<()> {
    if parse_history_filename(&file).is_none() {
        return Err(anyhow!("not a history file name: {}", file));
    }
    let _lock = try_lock_dir(&dir, LockMode::Shared)?;
    let path = dir.join(&file);
    let bytes = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let c = decode_file(&bytes, &AtomicBool::new(false))?;
    let s = &c.summary;

    if json {
        let groups: Vec<_> = c
            .groups
            .iter()
            .chain(c.vfs.iter())
            .map(|g| {
                json!({
                    "name": g.name,
                    "ports": g.stats.num_ports,
                    "avg_mbps": g.stats.avg_mbps,
                    "max_mbps": g.stats.max_mbps,
                    "err_max": g.stats.err_max,
                })
            })
            .collect();
        let v = json!({
            "file": file,
            "image_ids": c.header.image_ids,
            "sweep_num": s.sweep_num,
            "sweep_start": s.sweep_start,
            "sweep_duration_us": s.sweep_duration_us,
            "max_lid": s.max_lid,
            "nodes": c.nodes.len(),
            "ports": c.num_ports(),
            "links": s.counts.num_links,
            "groups": groups,
        });
        println!("{}", serde_json::to_string_pretty(&v)?);
        return Ok(());
    }

    println!("{}: {} image(s) {:?}", file, c.num_images(), c.header.image_ids);
    println!(
        "  newest sweep {} started {} took {} us, max LID {}",
        s.sweep_num, s.sweep_start, s.sweep_duration_us, s.max_lid
    );
    println!(
        "  nodes={} ports={} switches={} links={} no-resp nodes={}",
        c.nodes.len(),
        c.num_ports(),
        s.counts.num_switch_nodes,
        s.counts.num_links,
        s.counts.num_no_resp_nodes
    );
    for g in c.groups.iter() {
        println!(
            "  group {:<20} ports={:<6} avg={} max={} MB/s",
            g.name, g.stats.num_ports, g.stats.avg_mbps, g.stats.max_mbps
        );
    }
    for v in c.vfs.iter() {
        println!(
            "  vf    {:<20} ports={:<6} avg={} max={} MB/s",
            v.name, v.stats.num_ports, v.stats.avg_mbps, v.stats.max_mbps
        );
    }
    Ok(())
}
