//! Имена файлов истории: c<YYYY><MM><DD><HH><mm><ss>.hist | .zhist (UTC).

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime};

use crate::consts::{HIST_EXT, HIST_EXT_COMPRESSED, HIST_FILE_PREFIX};

const STAMP_FMT: &str = "%Y%m%d%H%M%S";

pub fn history_filename(timestamp: u64, compressed: bool) -> Result<String> {
    let secs = i64::try_from(timestamp).map_err(|_| anyhow!("timestamp {} out of range", timestamp))?;
    let dt = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| anyhow!("timestamp {} out of range", timestamp))?;
    let ext = if compressed { HIST_EXT_COMPRESSED } else { HIST_EXT };
    Ok(format!("{}{}.{}", HIST_FILE_PREFIX, dt.format(STAMP_FMT), ext))
}

/// (unix seconds, compressed) for a well-formed history file name.
pub fn parse_history_filename(name: &str) -> Option<(u64, bool)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let compressed = match ext {
        HIST_EXT => false,
        HIST_EXT_COMPRESSED => true,
        _ => return None,
    };
    let stamp = stem.strip_prefix(HIST_FILE_PREFIX)?;
    if stamp.len() != 14 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let dt = NaiveDateTime::parse_from_str(stamp, STAMP_FMT).ok()?;
    let ts = dt.and_utc().timestamp();
    u64::try_from(ts).ok().map(|t| (t, compressed))
}

pub fn is_history_file(name: &str) -> bool {
    parse_history_filename(name).is_some()
}
