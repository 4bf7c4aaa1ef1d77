mod common;

use std::io::Cursor;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use pmsweep::composite::flatten;
use pmsweep::dbsync::net::{read_frame, write_frame, FRAME_HISTORY, FRAME_RAM};
use pmsweep::dbsync::{
    serve_standby, DbsyncState, ImagePayload, ImageSender, ImageSource, SendTarget, StandbySm,
    StandbySource, SyncCapability, TcpImageSender,
};
use pmsweep::history::history_filename;
use pmsweep::{InMemoryTopology, PmConfig, ShortTermHistory, SweepEngine};

use common::{composite, history_opts, star_fabric, unique_root, T0};

fn sm(guid: u64, lid: u32) -> StandbySm {
    StandbySm {
        port_guid: guid,
        lid,
        priority: 1,
        state: 0,
        sync_capability: SyncCapability::Supported,
    }
}

/// Engine stand-in: a full RAM ring and a fixed list of history files.
struct MockSource {
    master: bool,
    latest: Option<(u64, usize)>,
    num_sweeps: u64,
    total_images: usize,
    compounding: bool,
    filled: usize,
    files: Vec<String>,
}

impl MockSource {
    fn master(total_images: usize) -> Self {
        Self {
            master: true,
            latest: None,
            num_sweeps: 0,
            total_images,
            compounding: false,
            filled: total_images,
            files: Vec::new(),
        }
    }

    fn sweep(&mut self) {
        self.num_sweeps += 1;
        let i = ((self.num_sweeps - 1) % self.total_images as u64) as usize;
        self.latest = Some((self.num_sweeps, i));
    }
}

impl ImageSource for MockSource {
    fn is_master(&self) -> bool {
        self.master
    }
    fn latest_sweep(&self) -> Option<(u64, usize)> {
        self.latest
    }
    fn num_sweeps(&self) -> u64 {
        self.num_sweeps
    }
    fn total_images(&self) -> usize {
        self.total_images
    }
    fn is_compounding(&self) -> bool {
        self.compounding
    }
    fn ram_image(&self, index: usize) -> Result<Option<ImagePayload>> {
        if index >= self.filled {
            return Ok(None);
        }
        Ok(Some(ImagePayload {
            ram_index: Some(index),
            history_file: None,
            bytes: vec![index as u8; 8],
        }))
    }
    fn history_files_newest_first(&self) -> Vec<String> {
        self.files.clone()
    }
    fn history_image(&self, filename: &str) -> Result<Option<ImagePayload>> {
        Ok(Some(ImagePayload {
            ram_index: None,
            history_file: Some(filename.to_string()),
            bytes: filename.as_bytes().to_vec(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Ram(SendTarget, usize),
    File(SendTarget, String),
}

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<Sent>>,
    fail: AtomicBool,
}

impl RecordingSender {
    fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock().expect("sent"))
    }
}

impl ImageSender for RecordingSender {
    fn send_image(&self, target: SendTarget, image: &ImagePayload) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(anyhow!("link down"));
        }
        let rec = match (&image.history_file, image.ram_index) {
            (Some(f), _) => Sent::File(target, f.clone()),
            (None, Some(i)) => Sent::Ram(target, i),
            (None, None) => return Err(anyhow!("empty payload")),
        };
        self.sent.lock().expect("sent").push(rec);
        Ok(())
    }
}

#[derive(Default)]
struct MutableStandbys(Mutex<Vec<StandbySm>>);

impl MutableStandbys {
    fn set(&self, v: Vec<StandbySm>) {
        *self.0.lock().expect("standbys") = v;
    }
}

impl StandbySource for MutableStandbys {
    fn standbys(&self) -> Vec<StandbySm> {
        self.0.lock().expect("standbys").clone()
    }
}

#[test]
fn standby_diff_is_idempotent() {
    let mut st = DbsyncState::new();
    let mut old = sm(0xC, 30);
    old.sync_capability = SyncCapability::Unsupported;

    assert_eq!(st.check_for_changes_in_standby_sms(vec![sm(0xA, 10), sm(0xB, 20), old.clone()], 3, 10), 2);
    let a = st.standby(0xA).cloned().expect("A");
    assert_eq!(a.num_ram_images_for_sync, 3);
    assert!(a.ram_sync_needed && a.history_sync_needed && a.newly_added);
    assert!(st.standby(0xC).is_none(), "no sync capability");

    assert_eq!(st.check_for_changes_in_standby_sms(vec![sm(0xA, 10), sm(0xB, 20), old], 50, 10), 0);
    let a2 = st.standby(0xA).expect("A");
    assert_eq!(a2.num_ram_images_for_sync, 3, "progress survives a repeated diff");
    assert!(!a2.newly_added);

    // тот же LID, новый GUID: тот же standby
    assert_eq!(st.check_for_changes_in_standby_sms(vec![sm(0xAA, 10)], 50, 10), 0);
    assert_eq!(st.standbys().len(), 1);
    assert_eq!(st.standbys()[0].port_guid, 0xAA);

    // квота ограничена глубиной кольца
    assert_eq!(st.check_for_changes_in_standby_sms(vec![sm(0xAA, 10), sm(0xD, 40)], 50, 10), 1);
    assert_eq!(st.standby(0xD).map(|s| s.num_ram_images_for_sync), Some(10));
}

#[test]
fn nothing_is_sent_while_not_master() -> Result<()> {
    let mut src = MockSource::master(5);
    src.master = false;
    src.sweep();
    let sender = RecordingSender::default();
    let sms = MutableStandbys::default();
    sms.set(vec![sm(0xA, 10)]);

    let mut st = DbsyncState::new();
    assert_eq!(st.tick(&src, &sms, &sender)?.total_sent(), 0);
    assert!(sender.take().is_empty());
    assert!(st.standbys().is_empty());
    Ok(())
}

#[test]
fn new_master_owes_nothing_to_existing_standbys() -> Result<()> {
    let mut src = MockSource::master(5);
    for _ in 0..7 {
        src.sweep();
    }
    src.files = vec!["c2".into(), "c1".into()];
    let sender = RecordingSender::default();
    let sms = MutableStandbys::default();
    sms.set(vec![sm(0xA, 10)]);

    let mut st = DbsyncState::new();
    let r = st.tick(&src, &sms, &sender)?;
    assert_eq!(r.total_sent(), 0);
    assert_eq!(st.last_sent_sweep(), 7);
    assert!(st.standby(0xA).map(|s| s.in_sync()).unwrap_or(false));

    // новый свип - широковещательно
    src.sweep();
    let r = st.tick(&src, &sms, &sender)?;
    assert!(r.broadcast);
    assert_eq!(sender.take(), vec![Sent::Ram(SendTarget::Broadcast, 2)]);
    assert_eq!(st.last_sent_sweep(), 8);

    assert_eq!(st.tick(&src, &sms, &sender)?.total_sent(), 0);

    // потеря и возврат роли мастера снова сбрасывают долги
    src.master = false;
    st.tick(&src, &sms, &sender)?;
    sms.set(vec![sm(0xA, 10), sm(0xB, 20)]);
    src.master = true;
    src.sweep();
    assert_eq!(st.tick(&src, &sms, &sender)?.total_sent(), 0);
    assert!(st.standbys().iter().all(|s| s.in_sync()));
    Ok(())
}

#[test]
fn added_standby_catches_up_ram_then_history() -> Result<()> {
    let mut src = MockSource::master(4);
    for _ in 0..6 {
        src.sweep();
    }
    // последний свип 6 -> слот 1
    src.files = vec!["c3".into(), "c2".into(), "c1".into()];
    let sender = RecordingSender::default();
    let sms = MutableStandbys::default();

    let mut st = DbsyncState::new();
    st.tick(&src, &sms, &sender)?;
    sms.set(vec![sm(0xB, 20)]);

    let b = SendTarget::Standby(0xB);
    let mut all = Vec::new();
    for _ in 0..10 {
        st.tick(&src, &sms, &sender)?;
        all.extend(sender.take());
    }
    assert_eq!(
        all,
        vec![
            Sent::Ram(b, 1),
            Sent::Ram(b, 0),
            Sent::Ram(b, 3),
            Sent::Ram(b, 2),
            Sent::File(b, "c3".into()),
            Sent::File(b, "c2".into()),
            Sent::File(b, "c1".into()),
        ]
    );
    let info = st.standby(0xB).expect("B");
    assert!(info.in_sync());
    assert_eq!(info.num_sweep_images_sent, 4);
    assert_eq!(info.num_history_images_sent, 3);
    Ok(())
}

#[test]
fn new_sweeps_pay_down_the_ram_quota() -> Result<()> {
    let mut src = MockSource::master(10);
    for _ in 0..4 {
        src.sweep();
    }
    let sender = RecordingSender::default();
    let sms = MutableStandbys::default();

    let mut st = DbsyncState::new();
    st.tick(&src, &sms, &sender)?;
    sms.set(vec![sm(0xB, 20)]);

    for tick in 0..5 {
        src.sweep();
        let r = st.tick(&src, &sms, &sender)?;
        assert!(r.broadcast, "tick {}", tick);
        if tick == 0 {
            assert_eq!(st.standby(0xB).map(|s| s.num_ram_images_for_sync), Some(5));
        }
    }
    let info = st.standby(0xB).expect("B");
    assert_eq!(info.num_sweep_images_sent, 5);
    assert!(!info.ram_sync_needed);
    assert!(info.history_sync_needed);
    assert_eq!(sender.take().len(), 5);

    // без новых свипов повторный tick ничего не шлёт
    st.tick(&src, &sms, &sender)?;
    st.tick(&src, &sms, &sender)?;
    assert!(sender.take().is_empty());
    Ok(())
}

#[test]
fn short_ring_ends_ram_sync_early() -> Result<()> {
    let mut src = MockSource::master(4);
    src.sweep();
    src.sweep();
    src.filled = 2;
    let sender = RecordingSender::default();
    let sms = MutableStandbys::default();

    let mut st = DbsyncState::new();
    st.tick(&src, &sms, &sender)?;
    sms.set(vec![sm(0xB, 20)]);
    for _ in 0..4 {
        st.tick(&src, &sms, &sender)?;
    }
    let b = SendTarget::Standby(0xB);
    assert_eq!(sender.take(), vec![Sent::Ram(b, 1), Sent::Ram(b, 0)]);
    assert!(st.standby(0xB).map(|s| s.in_sync()).unwrap_or(false));
    Ok(())
}

#[test]
fn standby_found_while_compounding_is_skipped_once() -> Result<()> {
    let mut src = MockSource::master(5);
    for _ in 0..3 {
        src.sweep();
    }
    let sender = RecordingSender::default();
    let sms = MutableStandbys::default();
    sms.set(vec![sm(0xA, 10)]);

    let mut st = DbsyncState::new();
    st.tick(&src, &sms, &sender)?;

    sms.set(vec![sm(0xA, 10), sm(0xC, 30)]);
    src.compounding = true;
    src.sweep();
    let r = st.tick(&src, &sms, &sender)?;
    assert!(!r.broadcast);
    assert_eq!(r.skipped, 1);
    assert_eq!(sender.take(), vec![Sent::Ram(SendTarget::Standby(0xA), 3)]);
    let c = st.standby(0xC).expect("C");
    assert_eq!(c.num_ram_images_for_sync, 4 + 1);
    assert_eq!(c.num_sweep_images_sent, 0);

    // на следующем свипе C уже не новый: снова broadcast
    src.sweep();
    let r = st.tick(&src, &sms, &sender)?;
    assert!(r.broadcast);
    assert_eq!(st.standby(0xC).map(|s| s.num_sweep_images_sent), Some(1));
    Ok(())
}

#[test]
fn failed_send_does_not_count() -> Result<()> {
    let mut src = MockSource::master(3);
    src.sweep();
    let sender = RecordingSender::default();
    let sms = MutableStandbys::default();

    let mut st = DbsyncState::new();
    st.tick(&src, &sms, &sender)?;
    sms.set(vec![sm(0xB, 20)]);
    sender.fail.store(true, Ordering::Relaxed);
    st.tick(&src, &sms, &sender)?;
    st.tick(&src, &sms, &sender)?;
    let info = st.standby(0xB).expect("B");
    assert_eq!(info.num_sweep_images_sent, 0);
    assert!(info.ram_sync_needed);

    sender.fail.store(false, Ordering::Relaxed);
    st.tick(&src, &sms, &sender)?;
    assert_eq!(sender.take(), vec![Sent::Ram(SendTarget::Standby(0xB), 0)]);
    Ok(())
}

#[test]
fn frames_carry_a_crc() -> Result<()> {
    let mut buf = Vec::new();
    write_frame(&mut buf, FRAME_HISTORY, "c20231114221320.hist", b"payload")?;
    write_frame(&mut buf, FRAME_RAM, "3", &[])?;

    let mut r = Cursor::new(buf.clone());
    assert_eq!(
        read_frame(&mut r)?,
        Some((FRAME_HISTORY, "c20231114221320.hist".to_string(), b"payload".to_vec()))
    );
    assert_eq!(read_frame(&mut r)?, Some((FRAME_RAM, "3".to_string(), Vec::new())));
    assert_eq!(read_frame(&mut r)?, None);

    let mut bad = buf.clone();
    bad[20 + 22] ^= 0x01; // байт payload первого кадра
    assert!(read_frame(&mut Cursor::new(bad)).is_err());

    let mut magic = buf.clone();
    magic[0] = b'X';
    assert!(read_frame(&mut Cursor::new(magic)).is_err());

    assert!(read_frame(&mut Cursor::new(&buf[..30])).is_err(), "truncated");
    Ok(())
}

#[test]
fn tcp_push_lands_in_standby_history() -> Result<()> {
    let root = unique_root("dbsync-tcp");
    let target = Mutex::new(ShortTermHistory::open(
        history_opts(&root, 4, 1, u64::MAX),
        Arc::new(AtomicBool::new(false)),
    )?);
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let shutdown = AtomicBool::new(false);

    let mut sender = TcpImageSender::new();
    sender.add_peer(0xB, addr.to_string());

    let names: Vec<String> = [3u64, 1, 2]
        .iter()
        .map(|&k| history_filename(T0 + k * 10, false))
        .collect::<Result<_>>()?;

    let handled = std::thread::scope(|s| -> Result<usize> {
        let srv = s.spawn(|| serve_standby(listener, &target, &shutdown));

        sender.send_image(
            SendTarget::Standby(0xB),
            &ImagePayload {
                ram_index: Some(0),
                history_file: None,
                bytes: vec![1, 2, 3],
            },
        )?;
        for (name, k) in names.iter().zip([3u64, 1, 2]) {
            let bytes = flatten(&composite(T0 + k * 10, k, &[5]))?;
            sender.send_image(
                SendTarget::Broadcast,
                &ImagePayload {
                    ram_index: None,
                    history_file: Some(name.clone()),
                    bytes,
                },
            )?;
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while target.lock().expect("history").len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        shutdown.store(true, Ordering::Relaxed);
        srv.join().map_err(|_| anyhow!("standby thread panicked"))?
    })?;

    assert_eq!(handled, 4);
    let mut h = target.into_inner().map_err(|_| anyhow!("poisoned"))?;
    let order: Vec<String> = h
        .records_chronological()
        .iter()
        .map(|r| r.filename.clone())
        .collect();
    assert_eq!(order, vec![names[1].clone(), names[2].clone(), names[0].clone()]);
    h.reload()?;
    assert!(h.find_by_image_id(2).is_some());
    assert!(sender.send_image(SendTarget::Standby(0xEE), &ImagePayload::default()).is_err());
    Ok(())
}

#[test]
fn engine_replicates_its_ring() -> Result<()> {
    let topo = Arc::new(InMemoryTopology::new(star_fabric(1)));
    let cfg = PmConfig::builder().total_images(4).freeze_frames(1, 60).build();
    let sms = Arc::new(MutableStandbys::default());
    let sender = Arc::new(RecordingSender::default());
    let eng = SweepEngine::new(cfg, topo)?.with_dbsync(sms.clone(), sender.clone());

    for k in 0..3u64 {
        eng.sweep_at(100 + k * 10)?;
    }
    eng.dbsync_tick()?;
    assert_eq!(eng.with_dbsync_state(|s| s.last_sent_sweep())?, 3);

    sms.set(vec![sm(0xB, 20)]);
    eng.sweep_at(130)?;
    for _ in 0..5 {
        eng.dbsync_tick()?;
    }
    let b = SendTarget::Standby(0xB);
    assert_eq!(
        sender.take(),
        vec![
            Sent::Ram(SendTarget::Broadcast, 3),
            Sent::Ram(b, 2),
            Sent::Ram(b, 1),
            Sent::Ram(b, 0),
        ]
    );
    assert!(eng.with_dbsync_state(|s| s.standby(0xB).map(|i| i.in_sync()))?.unwrap_or(false));
    Ok(())
}

#[test]
fn history_files_written_after_sync_are_broadcast() -> Result<()> {
    let mut src = MockSource::master(5);
    src.sweep();
    src.files = vec!["c1".into()];
    let sender = RecordingSender::default();
    let sms = MutableStandbys::default();
    sms.set(vec![sm(0xA, 10)]);

    let mut st = DbsyncState::new();
    assert_eq!(st.tick(&src, &sms, &sender)?.total_sent(), 0);
    assert_eq!(st.last_sent_history(), Some("c1"));

    let all = SendTarget::Broadcast;
    src.sweep();
    src.files.insert(0, "c2".into());
    let r = st.tick(&src, &sms, &sender)?;
    assert_eq!(r.history_sent, 1);
    assert_eq!(sender.take(), vec![Sent::Ram(all, 1), Sent::File(all, "c2".into())]);

    // без нового свипа: только файлы, от старых к новым
    src.files.insert(0, "c3".into());
    src.files.insert(0, "c4".into());
    st.tick(&src, &sms, &sender)?;
    assert_eq!(sender.take(), vec![Sent::File(all, "c3".into()), Sent::File(all, "c4".into())]);
    assert_eq!(st.tick(&src, &sms, &sender)?.total_sent(), 0);

    // неудачная отправка повторяется на следующем tick
    src.files.insert(0, "c5".into());
    sender.fail.store(true, Ordering::Relaxed);
    st.tick(&src, &sms, &sender)?;
    assert_eq!(st.last_sent_history(), Some("c4"));
    sender.fail.store(false, Ordering::Relaxed);
    st.tick(&src, &sms, &sender)?;
    assert_eq!(sender.take(), vec![Sent::File(all, "c5".into())]);
    assert!(st.standby(0xA).map(|s| s.in_sync()).unwrap_or(false));
    Ok(())
}

#[test]
fn failed_broadcast_is_retried() -> Result<()> {
    let mut src = MockSource::master(5);
    src.sweep();
    src.sweep();
    let sender = RecordingSender::default();
    let sms = MutableStandbys::default();
    sms.set(vec![sm(0xA, 10)]);

    let mut st = DbsyncState::new();
    st.tick(&src, &sms, &sender)?;
    assert_eq!(st.last_sent_sweep(), 2);

    src.sweep();
    sender.fail.store(true, Ordering::Relaxed);
    let r = st.tick(&src, &sms, &sender)?;
    assert!(!r.broadcast);
    assert_eq!(st.last_sent_sweep(), 2);

    sender.fail.store(false, Ordering::Relaxed);
    let r = st.tick(&src, &sms, &sender)?;
    assert!(r.broadcast);
    assert_eq!(sender.take(), vec![Sent::Ram(SendTarget::Broadcast, 2)]);
    assert_eq!(st.last_sent_sweep(), 3);
    Ok(())
}

#[test]
fn synced_standby_keeps_receiving_history_over_tcp() -> Result<()> {
    let master_root = unique_root("dbsync-master");
    let standby_root = unique_root("dbsync-standby");
    let target = Mutex::new(ShortTermHistory::open(
        history_opts(&standby_root, 16, 1, u64::MAX),
        Arc::new(AtomicBool::new(false)),
    )?);
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let mut sender = TcpImageSender::new();
    sender.add_peer(0xB, listener.local_addr()?.to_string());
    let shutdown = AtomicBool::new(false);

    let cfg = PmConfig::builder()
        .total_images(4)
        .freeze_frames(1, 60)
        .sweep_interval_secs(10)
        .history(&master_root)
        .total_history_hours(1)
        .images_per_composite(1)
        .compression(false, 1)
        .build();
    let sms = Arc::new(MutableStandbys::default());
    sms.set(vec![sm(0xB, 20)]);
    let topo = Arc::new(InMemoryTopology::new(star_fabric(1)));
    let eng = SweepEngine::new(cfg, topo)?.with_dbsync(sms, Arc::new(sender));

    std::thread::scope(|s| -> Result<()> {
        let srv = s.spawn(|| serve_standby(listener, &target, &shutdown));
        for k in 0..6u64 {
            eng.sweep_at(T0 + k * 10)?;
            eng.dbsync_tick()?;
        }
        // standby известен с первого tick и ничего не догоняет
        assert!(eng.with_dbsync_state(|s| s.standby(0xB).map(|i| i.in_sync()))?.unwrap_or(false));

        let deadline = Instant::now() + Duration::from_secs(10);
        while target.lock().expect("history").len() < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        shutdown.store(true, Ordering::Relaxed);
        srv.join().map_err(|_| anyhow!("standby thread panicked"))??;
        Ok(())
    })?;

    let master: Vec<String> = eng
        .with_history(|h| h.filenames_newest_first())?
        .unwrap_or_default();
    assert_eq!(master.len(), 5, "first sweep as master is not stored");
    let standby = target.into_inner().map_err(|_| anyhow!("poisoned"))?;
    assert_eq!(standby.filenames_newest_first(), master);
    Ok(())
}
