mod common;

use std::sync::Arc;

use anyhow::Result;

use pmsweep::config::{PmConfig, PortSelector};
use pmsweep::consts::PORT_MAX_VFS;
use pmsweep::groups::{GroupClassifier, GroupStats, PortContext};
use pmsweep::image::{NodeArena, NodeType, PortImage};
use pmsweep::{InMemoryTopology, SweepEngine, SweepOutcome};

use common::{advance_counters, star_fabric};

#[test]
fn overflow_keeps_first_matches() -> Result<()> {
    let cfg = PmConfig::builder()
        .max_groups_per_port(2)
        .group("Everything", vec![PortSelector::AllPorts])
        .build();
    let cls = GroupClassifier::from_config(&cfg);
    assert_eq!(cls.group_names(), vec!["All", "HFIs", "SWs", "Everything"]);

    let mut arena = NodeArena::with_limit(4);
    let h = arena.acquire(0x10, NodeType::Hfi, "n1 hfi1_0", 1)?;
    let s = arena.acquire(0x20, NodeType::Switch, "sw", 36)?;
    let port = PortImage {
        port_num: 1,
        active: true,
        ..PortImage::default()
    };
    let ctx = PortContext {
        node: arena.get(h).expect("hfi"),
        port: &port,
        neighbor: arena.get(s),
    };
    let (groups, assign) = cls.add_to_groups(&ctx);
    assert_eq!(groups, vec![0, 1]);
    assert_eq!(assign.added, 2);
    assert_eq!(assign.overflowed, 1);

    let mut p = PortImage {
        groups,
        ..PortImage::default()
    };
    cls.remove_from_groups(&mut p);
    assert!(p.groups.is_empty());
    Ok(())
}

#[test]
fn selectors_and_custom_comparators() -> Result<()> {
    let cfg = PmConfig::builder()
        .group("Compute", vec![PortSelector::NodeDescPrefix("cn".into())])
        .group("ISL", vec![PortSelector::InternalLinks])
        .group("Edge", vec![PortSelector::ExternalLinks])
        .build();
    let mut cls = GroupClassifier::from_config(&cfg);
    cls.push_group(
        "WidePorts",
        Arc::new(|ctx: &PortContext<'_>, _name: &str| ctx.port.width >= 4),
    );

    let mut arena = NodeArena::with_limit(4);
    let cn = arena.acquire(0x10, NodeType::Hfi, "cn001 hfi1_0", 1)?;
    let sw = arena.acquire(0x20, NodeType::Switch, "spine", 48)?;
    let sw2 = arena.acquire(0x30, NodeType::Switch, "leaf", 48)?;

    let hfi_port = PortImage {
        port_num: 1,
        width: 4,
        ..PortImage::default()
    };
    let ctx = PortContext {
        node: arena.get(cn).expect("cn"),
        port: &hfi_port,
        neighbor: arena.get(sw),
    };
    // All, HFIs, Compute, Edge, WidePorts
    assert_eq!(cls.add_to_groups(&ctx).0, vec![0, 1, 3, 5, 6]);

    let isl = PortImage {
        port_num: 7,
        width: 1,
        internal: true,
        ..PortImage::default()
    };
    let ctx = PortContext {
        node: arena.get(sw).expect("sw"),
        port: &isl,
        neighbor: arena.get(sw2),
    };
    // All, SWs, ISL
    assert_eq!(cls.add_to_groups(&ctx).0, vec![0, 2, 4]);
    Ok(())
}

#[test]
fn stats_bucket_utilization_and_errors() {
    let mut g = GroupStats::default();
    g.add_port(100, 1000, &[0, 0, 0, 0, 0]);
    g.add_port(950, 1000, &[5, 0, 0, 0, 1500]);
    assert_eq!(g.num_ports, 2);
    assert_eq!((g.min_mbps, g.max_mbps, g.avg_mbps), (100, 950, 525));
    assert_eq!(g.util_buckets[1], 1);
    assert_eq!(g.util_buckets[9], 1);
    assert_eq!(g.err_max[0], 5);
    assert_eq!(g.err_buckets[0][0], 1);
    assert_eq!(g.err_buckets[0][1], 1);
    assert_eq!(g.err_buckets[4][4], 1);

    let mut m = g;
    m.merge(&g, 1);
    assert_eq!(m.avg_mbps, 525);
    assert_eq!(m.num_ports, 2);
    assert_eq!(m.util_buckets[9], 2);
}

#[test]
fn sweep_aggregates_groups_and_vfs() -> Result<()> {
    let mut t = star_fabric(2);
    for n in t.nodes.iter_mut() {
        for p in n.ports.iter_mut() {
            p.vfs = vec![0];
        }
    }
    let topo = Arc::new(InMemoryTopology::new(t));
    let cfg = PmConfig::builder()
        .total_images(4)
        .freeze_frames(1, 60)
        .sweep_interval_secs(10)
        .vf("Default")
        .build();
    let eng = SweepEngine::new(cfg, topo.clone())?;

    eng.sweep_at(1_000)?;
    // 250M слов за 10 с -> 100 MB/s на порт
    topo.update(|t| advance_counters(t, 250_000_000, 5));
    let index = match eng.sweep_at(1_010)? {
        SweepOutcome::Completed { index, .. } => index,
        other => panic!("sweep not completed: {:?}", other),
    };

    let q = eng.query_image(index)?;
    let all = q.group("All").expect("All");
    assert_eq!(all.num_ports, 4);
    assert_eq!(all.avg_mbps, 100);
    assert_eq!(all.err_max[0], 5);
    assert_eq!(q.group("HFIs").map(|g| g.num_ports), Some(2));
    assert_eq!(q.group("SWs").map(|g| g.num_ports), Some(2));
    assert_eq!(q.vf("Default").map(|g| g.num_ports), Some(4));

    let p = q.port(2, 1).expect("hfi port");
    assert_eq!(p.util_mbps, 100);
    assert_eq!(p.delta.xmit_data, 250_000_000);

    let totals = eng.running_totals().get(common::hfi_guid(0), 1).expect("totals");
    assert_eq!(totals.xmit_data, 250_000_000);
    assert_eq!(totals.symbol_errors, 5);
    Ok(())
}

#[test]
fn vf_membership_is_capped_per_port() -> Result<()> {
    let mut builder = PmConfig::builder().total_images(3).freeze_frames(1, 60);
    for i in 0..20 {
        builder = builder.vf(format!("vf{}", i));
    }
    let cfg = builder.build();
    let cls = GroupClassifier::from_config(&cfg);

    // неизвестные и повторные индексы отбрасываются, остальное - до PORT_MAX_VFS
    let (vfs, assign) = cls.assign_vfs((0x10, 1), &[3, 3, 99, 1]);
    assert_eq!(vfs, vec![3, 1]);
    assert_eq!(assign.overflowed, 0);
    let (vfs, assign) = cls.assign_vfs((0x10, 1), &(0..20).collect::<Vec<u16>>());
    assert_eq!(vfs, (0..PORT_MAX_VFS as u16).collect::<Vec<u16>>());
    assert_eq!(assign.added, PORT_MAX_VFS);
    assert_eq!(assign.overflowed, 20 - PORT_MAX_VFS);

    let mut t = star_fabric(1);
    for n in t.nodes.iter_mut() {
        for p in n.ports.iter_mut() {
            p.vfs = match n.node_type {
                NodeType::Hfi => (0..20).collect(),
                NodeType::Switch => vec![19],
            };
        }
    }
    let eng = SweepEngine::new(cfg, Arc::new(InMemoryTopology::new(t)))?;
    let index = match eng.sweep_at(1_000)? {
        SweepOutcome::Completed { index, .. } => index,
        other => panic!("sweep not completed: {:?}", other),
    };

    let q = eng.query_image(index)?;
    let hfi_port = q.port(2, 1).expect("hfi port");
    assert_eq!(hfi_port.vfs().count(), PORT_MAX_VFS);
    // агрегат VF совпадает с тем, что записано в портах
    assert_eq!(q.vf("vf0").map(|g| g.num_ports), Some(1));
    assert_eq!(q.vf("vf19").map(|g| g.num_ports), Some(1));
    let vf19_ports = q
        .nodes()
        .flat_map(|n| n.ports.iter())
        .filter(|p| p.vfs().any(|v| v == 19))
        .count();
    assert_eq!(vf19_ports, 1);
    Ok(())
}
