mod common;

use std::fs;

use anyhow::Result;

use pmsweep::config::{PmConfig, PortSelector, StandbyPeer};
use pmsweep::HistoryOptions;

use common::unique_root;

#[test]
fn defaults_are_valid() -> Result<()> {
    let cfg = PmConfig::default();
    cfg.validate()?;
    assert_eq!(cfg.total_images, 10);
    assert_eq!(cfg.freeze_frame_images, 5);
    assert_eq!(cfg.sweep_interval_secs, 10);
    assert!(!cfg.history.enabled);
    assert!(!cfg.dbsync.enabled);
    // 24h * 3600 / (3 * 10s)
    assert_eq!(cfg.history_ring_depth()?, 2880);
    assert_eq!(cfg.max_disk_bytes(), 1024 * 1024 * 1024);
    Ok(())
}

#[test]
fn builder_sets_history_and_dbsync() -> Result<()> {
    let root = unique_root("cfg-builder");
    let cfg = PmConfig::builder()
        .total_images(6)
        .freeze_frames(2, 30)
        .sweep_interval_secs(5)
        .group("Compute", vec![PortSelector::NodeDescPrefix("cn".into())])
        .vf("Default")
        .history(&root)
        .total_history_hours(2)
        .images_per_composite(4)
        .compression(true, 8)
        .max_disk_space_mb(16)
        .dbsync(true, 3)
        .standby(StandbyPeer {
            port_guid: 0xB,
            lid: 20,
            priority: 1,
            addr: "127.0.0.1:9870".into(),
        })
        .build();
    cfg.validate()?;
    assert_eq!(cfg.history_ring_depth()?, 2 * 3600 / (4 * 5));

    let opts = HistoryOptions::from_config(&cfg)?;
    assert_eq!(opts.dir, root);
    assert_eq!(opts.ring_depth, 360);
    assert_eq!(opts.images_per_composite, 4);
    assert!(opts.compress);
    assert_eq!(opts.divisions, 8);
    assert_eq!(opts.max_disk_bytes, 16 << 20);

    let text = cfg.to_string();
    assert!(text.contains("on(every 3s, 1 standby peer(s))"), "{}", text);
    Ok(())
}

#[test]
fn validate_rejects_bad_bounds() {
    let bad = [
        PmConfig::builder().total_images(1).freeze_frames(0, 60).build(),
        PmConfig::builder().total_images(4).freeze_frames(4, 60).build(),
        PmConfig::builder().sweep_interval_secs(0).build(),
        PmConfig::builder().max_groups_per_port(9).build(),
        PmConfig::builder().history("relative/dir").build(),
        PmConfig::builder().history("/var/tmp/pm").compression(true, 0).build(),
        PmConfig::builder().history("/var/tmp/pm").compression(true, 33).build(),
        PmConfig::builder().history("/var/tmp/pm").images_per_composite(0).build(),
        PmConfig::builder().history("/var/tmp/pm").images_per_composite(65).build(),
        PmConfig::builder().history("/var/tmp/pm").max_disk_space_mb(0).build(),
        // окно короче одного composite
        PmConfig::builder().history("/var/tmp/pm").total_history_hours(0).build(),
    ];
    for (i, cfg) in bad.iter().enumerate() {
        assert!(cfg.validate().is_err(), "case {} should fail: {}", i, cfg);
    }

    let mut many = PmConfig::default();
    for i in 0..62 {
        many.groups.push(pmsweep::config::GroupConfig {
            name: format!("g{}", i),
            select: vec![PortSelector::AllPorts],
        });
    }
    assert!(many.validate().is_err(), "62 + 3 built-ins > 64");
}

#[test]
fn json_file_fills_missing_fields_with_defaults() -> Result<()> {
    let root = unique_root("cfg-json");
    fs::create_dir_all(&root)?;
    let path = root.join("pm.json");
    fs::write(
        &path,
        r#"{
            "total_images": 6,
            "groups": [
                {"name": "Compute", "select": [{"node_desc_prefix": "cn"}, "internal_links"]}
            ],
            "history": {"enabled": true, "storage_location": "/var/lib/pm", "images_per_composite": 2},
            "dbsync": {"standbys": [{"port_guid": 5, "lid": 9, "addr": "10.0.0.2:9870"}]}
        }"#,
    )?;
    let cfg = PmConfig::from_json_file(&path)?;
    cfg.validate()?;
    assert_eq!(cfg.total_images, 6);
    assert_eq!(cfg.freeze_frame_images, 5);
    assert_eq!(
        cfg.groups[0].select,
        vec![PortSelector::NodeDescPrefix("cn".into()), PortSelector::InternalLinks]
    );
    assert!(cfg.history.compress);
    assert_eq!(cfg.history.total_history_hours, 24);
    assert_eq!(cfg.dbsync.standbys[0].priority, 0);
    assert_eq!(cfg.dbsync.image_update_interval_secs, 5);

    fs::write(&path, b"{ not json")?;
    assert!(PmConfig::from_json_file(&path).is_err());
    assert!(PmConfig::from_json_file(&root.join("missing.json")).is_err());
    Ok(())
}

#[test]
fn env_overrides_defaults() {
    std::env::set_var("PM_TOTAL_IMAGES", "12");
    std::env::set_var("PM_STH_ENABLED", "yes");
    std::env::set_var("PM_STH_DIR", " /var/lib/pm-env ");
    std::env::set_var("PM_DBSYNC_INTERVAL", "not-a-number");
    let cfg = PmConfig::from_env();
    for k in ["PM_TOTAL_IMAGES", "PM_STH_ENABLED", "PM_STH_DIR", "PM_DBSYNC_INTERVAL"] {
        std::env::remove_var(k);
    }
    assert_eq!(cfg.total_images, 12);
    assert!(cfg.history.enabled);
    assert_eq!(cfg.history.storage_location, "/var/lib/pm-env");
    assert_eq!(cfg.dbsync.image_update_interval_secs, 5);
}
