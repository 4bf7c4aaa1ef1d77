mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;

use pmsweep::composite::flatten;
use pmsweep::history::history_filename;
use pmsweep::{InjectOutcome, ShortTermHistory};

use common::{composite, history_opts, unique_root, T0};

fn file_for(k: u64) -> Result<(String, Vec<u8>)> {
    let ts = T0 + k * 10;
    Ok((history_filename(ts, false)?, flatten(&composite(ts, k, &[1, 2]))?))
}

fn inject(h: &mut ShortTermHistory, k: u64) -> Result<InjectOutcome> {
    let (name, bytes) = file_for(k)?;
    h.inject_history_file(&name, &bytes)
}

fn order(h: &ShortTermHistory) -> Vec<u64> {
    h.records_chronological()
        .iter()
        .filter_map(|r| r.timestamp())
        .map(|t| (t - T0) / 10)
        .collect()
}

#[test]
fn out_of_order_files_land_in_time_order() -> Result<()> {
    let root = unique_root("inject-order");
    let mut h = ShortTermHistory::open(history_opts(&root, 3, 1, u64::MAX), Arc::new(AtomicBool::new(false)))?;

    assert_eq!(inject(&mut h, 2)?, InjectOutcome::Injected { slot: 0 });
    assert_eq!(inject(&mut h, 4)?, InjectOutcome::Injected { slot: 1 });
    assert_eq!(inject(&mut h, 3)?, InjectOutcome::Injected { slot: 1 });
    assert_eq!(order(&h), vec![2, 3, 4]);
    assert_eq!(h.current_record_index(), 2);

    // записи без заголовка не индексируются до reload
    assert!(h.find_by_image_id(3).is_none());
    assert!(h.records_chronological().iter().all(|r| r.header.is_none()));

    assert_eq!(inject(&mut h, 3)?, InjectOutcome::Duplicate);

    // полное кольцо, файл старше всех
    assert_eq!(inject(&mut h, 1)?, InjectOutcome::Discarded);
    assert!(!root.join(history_filename(T0 + 10, false)?).exists());
    assert_eq!(order(&h), vec![2, 3, 4]);

    h.reload()?;
    assert_eq!(order(&h), vec![2, 3, 4]);
    assert_eq!(h.find_by_image_id(3).and_then(|r| r.timestamp()), Some(T0 + 30));
    Ok(())
}

#[test]
fn full_ring_evicts_the_oldest() -> Result<()> {
    let root = unique_root("inject-evict");
    let mut h = ShortTermHistory::open(history_opts(&root, 3, 1, u64::MAX), Arc::new(AtomicBool::new(false)))?;
    for k in [2u64, 4, 6] {
        inject(&mut h, k)?;
    }
    let usage = h.total_disk_usage();

    assert!(matches!(inject(&mut h, 5)?, InjectOutcome::Injected { .. }));
    assert_eq!(order(&h), vec![4, 5, 6]);
    assert!(!root.join(history_filename(T0 + 20, false)?).exists());
    assert_eq!(h.total_disk_usage(), usage);

    assert!(matches!(inject(&mut h, 9)?, InjectOutcome::Injected { .. }));
    assert_eq!(order(&h), vec![5, 6, 9]);
    assert_eq!(h.filenames_newest_first()[0], history_filename(T0 + 90, false)?);
    assert_eq!(h.len(), 3);
    Ok(())
}

#[test]
fn inject_respects_the_disk_quota() -> Result<()> {
    let root = unique_root("inject-quota");
    let (_, bytes) = file_for(1)?;
    let one = bytes.len() as u64;
    let mut h = ShortTermHistory::open(history_opts(&root, 8, 1, one * 2), Arc::new(AtomicBool::new(false)))?;

    for k in 1..=4u64 {
        inject(&mut h, k)?;
        assert!(h.total_disk_usage() <= one * 2);
    }
    assert_eq!(order(&h), vec![3, 4]);
    Ok(())
}

#[test]
fn bad_names_and_empty_payloads_are_errors() -> Result<()> {
    let root = unique_root("inject-bad");
    let mut h = ShortTermHistory::open(history_opts(&root, 3, 1, u64::MAX), Arc::new(AtomicBool::new(false)))?;
    let (name, bytes) = file_for(1)?;
    assert!(h.inject_history_file("../etc/passwd", &bytes).is_err());
    assert!(h.inject_history_file(&name, &[]).is_err());
    assert!(h.is_empty());
    Ok(())
}
