//! NodeArena - владелец всех узлов, общих для слотов кольца.
//!
//! Каждая запись lid_map любого слота держит одну ссылку на узел. Узел
//! освобождается только при refcount == 0; индекс уходит в free-list и может
//! быть переиспользован. Ёмкость арены ограничена конфигурацией: превышение -
//! это InsufficientMemory (фатально для движка).

use std::collections::HashMap;

use crate::error::PmError;
use crate::image::NodeType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct PmNode {
    pub guid: u64,
    pub node_type: NodeType,
    pub description: String,
    pub num_ports: u8,
    refcount: u32,
}

impl PmNode {
    pub fn refcount(&self) -> u32 {
        self.refcount
    }
}

#[derive(Debug)]
pub struct NodeArena {
    slots: Vec<Option<PmNode>>,
    free: Vec<u32>,
    by_guid: HashMap<u64, NodeId>,
    limit: usize,
}

impl NodeArena {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_guid: HashMap::new(),
            limit,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&PmNode> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    pub fn lookup_guid(&self, guid: u64) -> Option<NodeId> {
        self.by_guid.get(&guid).copied()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.by_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_guid.is_empty()
    }

    /// Upper bound of NodeId indexes handed out so far.
    pub fn capacity_hint(&self) -> usize {
        self.slots.len()
    }

    /// Find the node by GUID or allocate it; takes one reference.
    pub fn acquire(
        &mut self,
        guid: u64,
        node_type: NodeType,
        description: &str,
        num_ports: u8,
    ) -> Result<NodeId, PmError> {
        if let Some(id) = self.by_guid.get(&guid).copied() {
            if let Some(n) = self.slots[id.index()].as_mut() {
                n.refcount += 1;
                // описание/тип могли поменяться у того же GUID
                self.refresh(id, node_type, description, num_ports);
                return Ok(id);
            }
        }

        if self.by_guid.len() >= self.limit {
            return Err(PmError::InsufficientMemory(format!(
                "node arena full ({} nodes)",
                self.limit
            )));
        }

        let node = PmNode {
            guid,
            node_type,
            description: description.to_string(),
            num_ports,
            refcount: 1,
        };
        let id = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(node);
                NodeId(i)
            }
            None => {
                self.slots.try_reserve(1).map_err(|e| {
                    PmError::InsufficientMemory(format!("node arena grow: {}", e))
                })?;
                self.slots.push(Some(node));
                NodeId((self.slots.len() - 1) as u32)
            }
        };
        self.by_guid.insert(guid, id);
        Ok(id)
    }

    /// Refresh node attributes without touching the refcount.
    pub fn refresh(&mut self, id: NodeId, node_type: NodeType, description: &str, num_ports: u8) {
        if let Some(n) = self.slots.get_mut(id.index()).and_then(|s| s.as_mut()) {
            if n.description != description {
                n.description = description.to_string();
            }
            n.node_type = node_type;
            n.num_ports = num_ports;
        }
    }

    /// Drop one reference. Returns true if the node was freed.
    pub fn release(&mut self, id: NodeId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index()) else {
            return false;
        };
        let Some(n) = slot.as_mut() else {
            return false;
        };
        n.refcount = n.refcount.saturating_sub(1);
        if n.refcount > 0 {
            return false;
        }
        let guid = n.guid;
        *slot = None;
        self.by_guid.remove(&guid);
        self.free.push(id.0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reuses_index() {
        let mut a = NodeArena::with_limit(4);
        let n1 = a.acquire(0x10, NodeType::Hfi, "hfi-1", 1).unwrap();
        let again = a.acquire(0x10, NodeType::Hfi, "hfi-1", 1).unwrap();
        assert_eq!(n1, again);
        assert_eq!(a.get(n1).unwrap().refcount(), 2);

        assert!(!a.release(n1));
        assert!(a.release(n1));
        assert!(a.get(n1).is_none());
        assert!(a.lookup_guid(0x10).is_none());

        let n2 = a.acquire(0x20, NodeType::Switch, "sw", 36).unwrap();
        assert_eq!(n2.index(), n1.index(), "freed index must be reused");
    }

    #[test]
    fn limit_is_insufficient_memory() {
        let mut a = NodeArena::with_limit(1);
        a.acquire(1, NodeType::Hfi, "a", 1).unwrap();
        let err = a.acquire(2, NodeType::Hfi, "b", 1).unwrap_err();
        assert!(err.is_fatal());
    }
}
