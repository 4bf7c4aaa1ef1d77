//! Composite header codec (HEADER_SIZE байт, LE, несжимаемый).

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{
    FLAG_COMPRESSED, HDR_OFF_BODY_CRC, HDR_OFF_DIV_SIZES, HDR_OFF_FLAGS, HDR_OFF_FLAT_SIZE,
    HDR_OFF_IMAGE_IDS, HDR_OFF_INTERVAL, HDR_OFF_NUM_DIVISIONS, HDR_OFF_NUM_IMAGES,
    HDR_OFF_TIMESTAMP, HDR_OFF_VERSION, HEADER_SIZE, HIST_MAGIC, MAX_COMPRESSION_DIVISIONS,
    MAX_IMAGES_PER_COMPOSITE,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompositeHeader {
    pub history_version: u32,
    pub flags: u32,
    /// Unix seconds: start of the first compounded sweep.
    pub timestamp: u64,
    pub sweep_interval: u32,
    /// Image ids (sweep numbers) compounded into this composite, oldest first.
    pub image_ids: Vec<u64>,
    /// Length of the uncompressed body.
    pub flat_size: u64,
    pub num_divisions: u32,
    /// Compressed length per division (empty when uncompressed).
    pub div_sizes: Vec<u32>,
    pub body_crc32: u32,
}

impl CompositeHeader {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        if self.image_ids.len() > MAX_IMAGES_PER_COMPOSITE {
            return Err(anyhow!(
                "too many images in composite: {} (max {})",
                self.image_ids.len(),
                MAX_IMAGES_PER_COMPOSITE
            ));
        }
        if self.div_sizes.len() > MAX_COMPRESSION_DIVISIONS
            || self.div_sizes.len() != self.num_divisions as usize
        {
            return Err(anyhow!(
                "bad division table: num_divisions={} sizes={}",
                self.num_divisions,
                self.div_sizes.len()
            ));
        }

        let mut h = [0u8; HEADER_SIZE];
        h[..8].copy_from_slice(HIST_MAGIC);
        LittleEndian::write_u32(&mut h[HDR_OFF_VERSION..HDR_OFF_VERSION + 4], self.history_version);
        LittleEndian::write_u32(&mut h[HDR_OFF_FLAGS..HDR_OFF_FLAGS + 4], self.flags);
        LittleEndian::write_u64(&mut h[HDR_OFF_TIMESTAMP..HDR_OFF_TIMESTAMP + 8], self.timestamp);
        LittleEndian::write_u32(&mut h[HDR_OFF_INTERVAL..HDR_OFF_INTERVAL + 4], self.sweep_interval);
        LittleEndian::write_u32(
            &mut h[HDR_OFF_NUM_IMAGES..HDR_OFF_NUM_IMAGES + 4],
            self.image_ids.len() as u32,
        );
        for (i, id) in self.image_ids.iter().enumerate() {
            let off = HDR_OFF_IMAGE_IDS + i * 8;
            LittleEndian::write_u64(&mut h[off..off + 8], *id);
        }
        LittleEndian::write_u64(&mut h[HDR_OFF_FLAT_SIZE..HDR_OFF_FLAT_SIZE + 8], self.flat_size);
        LittleEndian::write_u32(
            &mut h[HDR_OFF_NUM_DIVISIONS..HDR_OFF_NUM_DIVISIONS + 4],
            self.num_divisions,
        );
        for (i, sz) in self.div_sizes.iter().enumerate() {
            let off = HDR_OFF_DIV_SIZES + i * 4;
            LittleEndian::write_u32(&mut h[off..off + 4], *sz);
        }
        LittleEndian::write_u32(&mut h[HDR_OFF_BODY_CRC..HDR_OFF_BODY_CRC + 4], self.body_crc32);
        Ok(h)
    }

    /// Parse the fixed header. Version is not checked here (see rebuild).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(anyhow!(
                "composite too short: {} bytes (header is {})",
                buf.len(),
                HEADER_SIZE
            ));
        }
        if &buf[..8] != HIST_MAGIC {
            return Err(anyhow!("bad composite magic"));
        }
        let num_images = LittleEndian::read_u32(&buf[HDR_OFF_NUM_IMAGES..HDR_OFF_NUM_IMAGES + 4]) as usize;
        if num_images > MAX_IMAGES_PER_COMPOSITE {
            return Err(anyhow!("bad image count in header: {}", num_images));
        }
        let num_divisions =
            LittleEndian::read_u32(&buf[HDR_OFF_NUM_DIVISIONS..HDR_OFF_NUM_DIVISIONS + 4]);
        if num_divisions as usize > MAX_COMPRESSION_DIVISIONS {
            return Err(anyhow!("bad division count in header: {}", num_divisions));
        }

        let image_ids = (0..num_images)
            .map(|i| {
                let off = HDR_OFF_IMAGE_IDS + i * 8;
                LittleEndian::read_u64(&buf[off..off + 8])
            })
            .collect();
        let div_sizes = (0..num_divisions as usize)
            .map(|i| {
                let off = HDR_OFF_DIV_SIZES + i * 4;
                LittleEndian::read_u32(&buf[off..off + 4])
            })
            .collect();

        Ok(Self {
            history_version: LittleEndian::read_u32(&buf[HDR_OFF_VERSION..HDR_OFF_VERSION + 4]),
            flags: LittleEndian::read_u32(&buf[HDR_OFF_FLAGS..HDR_OFF_FLAGS + 4]),
            timestamp: LittleEndian::read_u64(&buf[HDR_OFF_TIMESTAMP..HDR_OFF_TIMESTAMP + 8]),
            sweep_interval: LittleEndian::read_u32(&buf[HDR_OFF_INTERVAL..HDR_OFF_INTERVAL + 4]),
            image_ids,
            flat_size: LittleEndian::read_u64(&buf[HDR_OFF_FLAT_SIZE..HDR_OFF_FLAT_SIZE + 8]),
            num_divisions,
            div_sizes,
            body_crc32: LittleEndian::read_u32(&buf[HDR_OFF_BODY_CRC..HDR_OFF_BODY_CRC + 4]),
        })
    }
}
