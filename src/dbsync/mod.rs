//! DBSync - репликация образов master -> standby.
//!
//! Периодический tick (только на мастере):
//! 1) смена роли standby -> master: base := текущий набор standby без долгов;
//! 2) check_for_changes_in_standby_sms: diff base vs new по LID;
//! 3) pm_dbsync_operation: новый свип - всем сразу; новые файлы истории,
//!    записанные после прошлого tick, - тоже всем (от старых к новым); без
//!    нового свипа - догоняющая отправка RAM-образов, потом файлов истории
//!    (от новых к старым).
//!
//! Сеть вне ядра: ImageSender::send_image (fire-and-forget), на приёмной
//! стороне - ShortTermHistory::inject_history_file (см. net.rs).

pub mod net;
pub mod operation;
pub mod state;

use anyhow::Result;

pub use net::{serve_standby, InjectTarget, TcpImageSender};
pub use operation::TickReport;
pub use state::{DbsyncSmInfo, DbsyncState};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SyncCapability {
    #[default]
    Unknown,
    Unsupported,
    Supported,
}

/// Standby manager as reported by the SM layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StandbySm {
    pub port_guid: u64,
    pub lid: u32,
    pub priority: u8,
    pub state: u8,
    pub sync_capability: SyncCapability,
}

pub trait StandbySource: Send + Sync {
    fn standbys(&self) -> Vec<StandbySm>;
}

/// Fixed standby list (configuration, tests).
#[derive(Clone, Debug, Default)]
pub struct StaticStandbys(pub Vec<StandbySm>);

impl StandbySource for StaticStandbys {
    fn standbys(&self) -> Vec<StandbySm> {
        self.0.clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendTarget {
    Broadcast,
    Standby(u64),
}

/// One image on the wire: a RAM ring slot or a history file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImagePayload {
    pub ram_index: Option<usize>,
    pub history_file: Option<String>,
    pub bytes: Vec<u8>,
}

pub trait ImageSender: Send + Sync {
    fn send_image(&self, target: SendTarget, image: &ImagePayload) -> Result<()>;
}

/// What the replicator needs from the engine.
pub trait ImageSource {
    fn is_master(&self) -> bool;
    /// (sweep number, ring index) of the newest Valid image.
    fn latest_sweep(&self) -> Option<(u64, usize)>;
    fn num_sweeps(&self) -> u64;
    fn total_images(&self) -> usize;
    /// Short-term history is compounding a composite that is not written yet.
    fn is_compounding(&self) -> bool;
    fn ram_image(&self, index: usize) -> Result<Option<ImagePayload>>;
    fn history_files_newest_first(&self) -> Vec<String>;
    fn history_image(&self, filename: &str) -> Result<Option<ImagePayload>>;
}
