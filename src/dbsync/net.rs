//! dbsync/net - TCP транспорт DBSync.
//!
//! Формат кадра (LE):
//!   header(20) = [magic8 "PMDBSYN1"][name_len u16][flags u16][len u32][crc32 u32]
//!   затем name[name_len] и payload[len]; crc32 считается по name + payload.
//! flags: FRAME_RAM - образ из RAM-кольца (name = индекс слота),
//!        FRAME_HISTORY - файл истории (name = имя файла).

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::consts::{DBSYNC_HDR_SIZE, DBSYNC_MAGIC, DBSYNC_MAX_PAYLOAD};
use crate::history::{InjectOutcome, ShortTermHistory};

use super::{ImagePayload, ImageSender, SendTarget};

pub const FRAME_RAM: u16 = 0x1;
pub const FRAME_HISTORY: u16 = 0x2;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

fn frame_crc(name: &[u8], payload: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(name);
    h.update(payload);
    h.finalize()
}

pub fn write_frame<W: Write>(w: &mut W, flags: u16, name: &str, payload: &[u8]) -> Result<()> {
    if payload.len() > DBSYNC_MAX_PAYLOAD {
        return Err(anyhow!("payload too large: {}", payload.len()));
    }
    let name = name.as_bytes();
    if name.len() > u16::MAX as usize {
        return Err(anyhow!("frame name too long: {}", name.len()));
    }
    let mut hdr = [0u8; DBSYNC_HDR_SIZE];
    hdr[..8].copy_from_slice(DBSYNC_MAGIC);
    LittleEndian::write_u16(&mut hdr[8..10], name.len() as u16);
    LittleEndian::write_u16(&mut hdr[10..12], flags);
    LittleEndian::write_u32(&mut hdr[12..16], payload.len() as u32);
    LittleEndian::write_u32(&mut hdr[16..20], frame_crc(name, payload));

    w.write_all(&hdr)?;
    w.write_all(name)?;
    if !payload.is_empty() {
        w.write_all(payload)?;
    }
    Ok(())
}

/// Next frame or None on a clean EOF.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<(u16, String, Vec<u8>)>> {
    let mut hdr = [0u8; DBSYNC_HDR_SIZE];
    if !read_exact_or_eof(r, &mut hdr)? {
        return Ok(None);
    }
    if &hdr[..8] != DBSYNC_MAGIC {
        return Err(anyhow!("bad dbsync frame magic"));
    }
    let name_len = LittleEndian::read_u16(&hdr[8..10]) as usize;
    let flags = LittleEndian::read_u16(&hdr[10..12]);
    let len = LittleEndian::read_u32(&hdr[12..16]) as usize;
    let crc = LittleEndian::read_u32(&hdr[16..20]);
    if len > DBSYNC_MAX_PAYLOAD {
        return Err(anyhow!("frame payload too large: {} (max {})", len, DBSYNC_MAX_PAYLOAD));
    }

    let mut name = vec![0u8; name_len];
    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(r, &mut name)? || !read_exact_or_eof(r, &mut payload)? {
        return Err(anyhow!("truncated dbsync frame"));
    }
    if frame_crc(&name, &payload) != crc {
        return Err(anyhow!("dbsync frame crc mismatch"));
    }
    let name = String::from_utf8(name).map_err(|_| anyhow!("frame name is not UTF-8"))?;
    Ok(Some((flags, name, payload)))
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool> {
    use std::io::ErrorKind;
    let mut off = 0usize;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) if off == 0 => return Ok(false),
            Ok(0) => return Err(anyhow!("unexpected EOF inside frame")),
            Ok(n) => off += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(anyhow!("read error: {}", e)),
        }
    }
    Ok(true)
}

fn frame_of(image: &ImagePayload) -> Result<(u16, String)> {
    match (&image.history_file, image.ram_index) {
        (Some(name), _) => Ok((FRAME_HISTORY, name.clone())),
        (None, Some(i)) => Ok((FRAME_RAM, i.to_string())),
        (None, None) => Err(anyhow!("image payload has neither a ring index nor a file name")),
    }
}

/// Sends each image over a fresh TCP connection to the standby's address.
#[derive(Debug, Default)]
pub struct TcpImageSender {
    peers: HashMap<u64, String>,
}

impl TcpImageSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer<S: Into<String>>(&mut self, port_guid: u64, addr: S) {
        self.peers.insert(port_guid, addr.into());
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    fn send_to(&self, addr: &str, flags: u16, name: &str, bytes: &[u8]) -> Result<()> {
        let sa = addr
            .to_socket_addrs()
            .with_context(|| format!("resolve {}", addr))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}", addr))?;
        let mut s = TcpStream::connect_timeout(&sa, IO_TIMEOUT)
            .with_context(|| format!("connect {}", addr))?;
        s.set_write_timeout(Some(IO_TIMEOUT))?;
        write_frame(&mut s, flags, name, bytes)?;
        s.flush()?;
        Ok(())
    }
}

impl ImageSender for TcpImageSender {
    fn send_image(&self, target: SendTarget, image: &ImagePayload) -> Result<()> {
        let (flags, name) = frame_of(image)?;
        match target {
            SendTarget::Standby(guid) => {
                let addr = self
                    .peers
                    .get(&guid)
                    .ok_or_else(|| anyhow!("no address for standby {:#018x}", guid))?;
                self.send_to(addr, flags, &name, &image.bytes)
            }
            SendTarget::Broadcast => {
                let mut first_err = None;
                for (guid, addr) in &self.peers {
                    if let Err(e) = self.send_to(addr, flags, &name, &image.bytes) {
                        warn!("dbsync: broadcast to {:#018x} ({}) failed: {:#}", guid, addr, e);
                        first_err.get_or_insert(e);
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Receiving side of DBSync.
pub trait InjectTarget: Send + Sync {
    fn inject_history_file(&self, filename: &str, bytes: &[u8]) -> Result<InjectOutcome>;

    fn receive_ram_image(&self, index: usize, bytes: &[u8]) -> Result<()> {
        debug!("dbsync: RAM image {} received ({} bytes), not kept", index, bytes.len());
        Ok(())
    }
}

impl InjectTarget for Mutex<ShortTermHistory> {
    fn inject_history_file(&self, filename: &str, bytes: &[u8]) -> Result<InjectOutcome> {
        let mut h = self
            .lock()
            .map_err(|_| anyhow!("history mutex poisoned"))?;
        h.inject_history_file(filename, bytes)
    }
}

fn handle_conn(stream: TcpStream, target: &dyn InjectTarget) -> Result<usize> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    let mut r = std::io::BufReader::new(stream);
    let mut n = 0usize;
    while let Some((flags, name, payload)) = read_frame(&mut r)? {
        if flags & FRAME_HISTORY != 0 {
            let outcome = target.inject_history_file(&name, &payload)?;
            debug!("dbsync: {} -> {:?}", name, outcome);
        } else if flags & FRAME_RAM != 0 {
            let idx: usize = name
                .parse()
                .map_err(|_| anyhow!("bad RAM image index {:?}", name))?;
            target.receive_ram_image(idx, &payload)?;
        } else {
            return Err(anyhow!("unknown dbsync frame flags {:#06x}", flags));
        }
        n += 1;
    }
    Ok(n)
}

/// Accept pushes until `shutdown` is set. Returns the number of frames handled.
pub fn serve_standby(
    listener: TcpListener,
    target: &dyn InjectTarget,
    shutdown: &AtomicBool,
) -> Result<usize> {
    listener.set_nonblocking(true)?;
    info!("dbsync: standby listening on {}", listener.local_addr()?);
    let mut total = 0usize;
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => match handle_conn(stream, target) {
                Ok(n) => total += n,
                Err(e) => warn!("dbsync: connection from {} failed: {:#}", peer, e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(anyhow!("accept: {}", e)),
        }
    }
    Ok(total)
}
