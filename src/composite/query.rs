//! QueryImage - composite, восстановленный для произвольного доступа
//! (по LID, по (LID, port), по имени группы/VF).

use std::collections::HashMap;

use crate::groups::GroupStats;

use super::{CompositeImage, CompositeNode, CompositePort, ImageSummary};

#[derive(Debug, Clone)]
pub struct QueryImage {
    composite: CompositeImage,
    by_lid: HashMap<u32, usize>,
    groups: HashMap<String, usize>,
    vfs: HashMap<String, usize>,
}

impl QueryImage {
    pub fn reconstitute(composite: CompositeImage) -> Self {
        let by_lid = composite
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.lid, i))
            .collect();
        let groups = composite
            .groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.clone(), i))
            .collect();
        let vfs = composite
            .vfs
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.clone(), i))
            .collect();
        Self {
            composite,
            by_lid,
            groups,
            vfs,
        }
    }

    pub fn composite(&self) -> &CompositeImage {
        &self.composite
    }

    pub fn into_composite(self) -> CompositeImage {
        self.composite
    }

    pub fn summary(&self) -> &ImageSummary {
        &self.composite.summary
    }

    pub fn image_ids(&self) -> &[u64] {
        &self.composite.header.image_ids
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CompositeNode> {
        self.composite.nodes.iter()
    }

    pub fn node_by_lid(&self, lid: u32) -> Option<&CompositeNode> {
        self.by_lid.get(&lid).map(|&i| &self.composite.nodes[i])
    }

    pub fn node_by_guid(&self, guid: u64) -> Option<&CompositeNode> {
        self.composite.node_by_guid(guid)
    }

    pub fn port(&self, lid: u32, port_num: u8) -> Option<&CompositePort> {
        self.node_by_lid(lid)?
            .ports
            .iter()
            .find(|p| p.port_num == port_num)
    }

    /// The other end of a link.
    pub fn neighbor(&self, lid: u32, port_num: u8) -> Option<(&CompositeNode, &CompositePort)> {
        let p = self.port(lid, port_num)?;
        if p.neighbor_lid == 0 {
            return None;
        }
        let n = self.node_by_lid(p.neighbor_lid)?;
        let np = n.ports.iter().find(|q| q.port_num == p.neighbor_port)?;
        Some((n, np))
    }

    pub fn group(&self, name: &str) -> Option<&GroupStats> {
        self.groups.get(name).map(|&i| &self.composite.groups[i].stats)
    }

    pub fn vf(&self, name: &str) -> Option<&GroupStats> {
        self.vfs.get(name).map(|&i| &self.composite.vfs[i].stats)
    }

    /// (LID, port) of every port recorded as a member of the named group.
    pub fn group_members(&self, name: &str) -> Vec<(u32, u8)> {
        let Some(&gi) = self.groups.get(name) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for n in &self.composite.nodes {
            for p in &n.ports {
                if p.groups().any(|g| g as usize == gi) {
                    out.push((n.lid, p.port_num));
                }
            }
        }
        out
    }
}
