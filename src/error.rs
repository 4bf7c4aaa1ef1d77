//! Классификация ошибок движка.
//!
//! Всё I/O и разбор форматов идёт через anyhow::Result с контекстом. PmError
//! переносится внутри anyhow::Error и извлекается через downcast_ref там, где
//! вызывающему нужно отличить фатальный исход от пропуска свипа.

/// Typed outcomes of the sweep/history core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmError {
    /// This manager is not the master; skip the tick.
    #[error("not master")]
    NotMaster,

    /// External topology has not completed a pass yet; skip the tick.
    #[error("topology not ready")]
    TopologyNotReady,

    /// Every ring slot is pinned by a freeze frame.
    #[error("no free image slot (all {0} slots frozen)")]
    NoFreeImage(usize),

    /// Allocation failed while building a snapshot. Fatal to the engine.
    #[error("insufficient memory: {0}")]
    InsufficientMemory(String),

    /// The engine is shutting down; long operations abort with this.
    #[error("shutdown in progress")]
    Shutdown,

    #[error("unsupported history version {0}")]
    UnsupportedVersion(u32),

    #[error("group capacity exceeded: {0}")]
    GroupCapacity(String),
}

impl PmError {
    /// Fatal errors stop the whole engine instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PmError::InsufficientMemory(_))
    }

    /// Sweep-abortable outcomes: skip this tick, retry on the next interval.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            PmError::NotMaster | PmError::TopologyNotReady | PmError::NoFreeImage(_)
        )
    }
}

/// Достать PmError из anyhow-цепочки (если есть).
pub fn pm_error(e: &anyhow::Error) -> Option<&PmError> {
    e.chain().find_map(|c| c.downcast_ref::<PmError>())
}
