mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

use pmsweep::composite::{compute_sizes, decode_file, encode_file, flatten, CompositeHeader};
use pmsweep::consts::{HDR_OFF_VERSION, HEADER_SIZE, HISTORY_VERSION};
use pmsweep::topology::FabricTopology;
use pmsweep::{pm_error, CompositeImage, InMemoryTopology, PmConfig, PmError, SweepEngine, SweepOutcome};

use common::{advance_counters, hfi, star_fabric};

/// Two sweeps over `t`; returns the composite of the second one.
fn composite_of(t: FabricTopology) -> Result<CompositeImage> {
    let topo = Arc::new(InMemoryTopology::new(t));
    let cfg = PmConfig::builder()
        .total_images(3)
        .freeze_frames(1, 60)
        .vf("Default")
        .vf("Storage")
        .build();
    let eng = SweepEngine::new(cfg, topo.clone())?;
    eng.sweep_at(5_000)?;
    topo.update(|t| advance_counters(t, 1_000_000, 2));
    match eng.sweep_at(5_010)? {
        SweepOutcome::Completed { index, .. } => Ok(eng.query_image(index)?.into_composite()),
        other => panic!("sweep not completed: {:?}", other),
    }
}

fn assert_same(a: &CompositeImage, b: &CompositeImage) {
    assert_eq!(a.header.image_ids, b.header.image_ids);
    assert_eq!(a.header.timestamp, b.header.timestamp);
    assert_eq!(b.header.history_version, HISTORY_VERSION);
    assert_eq!(a.summary, b.summary);
    assert_eq!(a.groups, b.groups);
    assert_eq!(a.vfs, b.vfs);
    assert_eq!(a.nodes, b.nodes);
}

fn roundtrip(c: &CompositeImage) -> Result<()> {
    let cancel = AtomicBool::new(false);

    let flat = flatten(c)?;
    assert_eq!(
        flat.len(),
        HEADER_SIZE + compute_sizes(c.groups.len(), c.vfs.len(), c.nodes.len(), c.num_ports())
    );
    let h = CompositeHeader::decode(&flat)?;
    assert!(!h.is_compressed());
    assert_eq!(h.flat_size as usize, flat.len() - HEADER_SIZE);
    assert_same(c, &decode_file(&flat, &cancel)?);

    for divisions in [1usize, 4, 32] {
        let z = encode_file(c, true, divisions, &cancel)?;
        let zh = CompositeHeader::decode(&z)?;
        assert!(zh.is_compressed());
        assert_eq!(zh.flat_size, h.flat_size);
        assert_eq!(zh.body_crc32, h.body_crc32);
        assert_eq!(zh.div_sizes.len(), zh.num_divisions as usize);
        assert!(zh.num_divisions as usize <= divisions);
        assert_same(c, &decode_file(&z, &cancel)?);
    }
    Ok(())
}

#[test]
fn empty_fabric_roundtrips() -> Result<()> {
    let c = composite_of(star_fabric(0))?;
    assert!(c.nodes.is_empty());
    assert_eq!(c.groups.len(), 3);
    assert_eq!(c.vfs.len(), 2);
    roundtrip(&c)
}

#[test]
fn single_hfi_roundtrips() -> Result<()> {
    let t = FabricTopology {
        is_master: true,
        passes_completed: 1,
        max_lid: 1,
        nodes: vec![hfi(0x77, 1, "lonely hfi1_0", None)],
        sms: Vec::new(),
    };
    let c = composite_of(t)?;
    assert_eq!(c.nodes.len(), 1);
    assert_eq!(c.nodes[0].ports.len(), 1);
    let p = &c.nodes[0].ports[0];
    assert_eq!((p.neighbor_lid, p.neighbor_port), (0, 0));
    assert_eq!(p.groups().count(), 0, "no neighbor, no groups");
    roundtrip(&c)
}

#[test]
fn switch_fabrics_roundtrip() -> Result<()> {
    for n in [1usize, 8, 255] {
        let c = composite_of(star_fabric(n))?;
        assert_eq!(c.nodes.len(), n + 1);
        assert_eq!(c.num_ports(), 2 * n);
        assert_eq!(c.summary.counts.num_links, n as u32);
        let sw = &c.nodes[0];
        assert_eq!(sw.lid, 1);
        assert_eq!(sw.ports.len(), n);
        assert_eq!(sw.ports[n - 1].neighbor_lid, (n + 1) as u32);
        assert!(sw.ports.iter().all(|p| p.delta.xmit_data == 1_000_000));
        roundtrip(&c)?;
    }
    Ok(())
}

#[test]
fn long_descriptions_are_clipped_on_a_char_boundary() -> Result<()> {
    let mut t = star_fabric(1);
    t.nodes[1].description = "ж".repeat(40); // 80 байт
    let c = composite_of(t)?;
    let d = &c.nodes[1].description;
    assert!(d.len() <= 63);
    assert_eq!(d.chars().count(), 31);
    roundtrip(&c)
}

#[test]
fn unsupported_version_is_rejected() -> Result<()> {
    let c = composite_of(star_fabric(2))?;
    let mut flat = flatten(&c)?;
    LittleEndian::write_u32(&mut flat[HDR_OFF_VERSION..HDR_OFF_VERSION + 4], 9);
    let err = decode_file(&flat, &AtomicBool::new(false)).unwrap_err();
    assert_eq!(pm_error(&err), Some(&PmError::UnsupportedVersion(9)));
    Ok(())
}

#[test]
fn corrupt_body_fails_crc() -> Result<()> {
    let c = composite_of(star_fabric(2))?;
    let cancel = AtomicBool::new(false);

    let mut flat = flatten(&c)?;
    let last = flat.len() - 1;
    flat[last] ^= 0xFF;
    let err = decode_file(&flat, &cancel).unwrap_err();
    assert!(format!("{:#}", err).contains("crc"), "{:#}", err);

    let flat = flatten(&c)?;
    assert!(decode_file(&flat[..flat.len() - 3], &cancel).is_err(), "truncated body");
    assert!(decode_file(&flat[..100], &cancel).is_err(), "truncated header");
    Ok(())
}
