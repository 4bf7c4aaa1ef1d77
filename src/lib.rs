// Базовые модули
pub mod consts;
pub mod error;
pub mod config;
pub mod metrics;
pub mod lock;

// Внешний граф фабрики (только чтение)
pub mod topology;

// Кольцо образов: арена узлов, слоты, копирование топологии
pub mod image;   // src/image/{mod,arena,ring,copy}.rs
pub mod groups;
pub mod tabulate;

// Композиты и краткосрочная история на диске
pub mod composite; // src/composite/{mod,header,flatten,rebuild,legacy,compress,compound,query}.rs
pub mod history;   // src/history/{mod,filename,load,store,inject}.rs

// Репликация master -> standby
pub mod dbsync;  // src/dbsync/{mod,state,operation,net}.rs

pub mod engine;

// Удобные реэкспорты
pub use composite::{CompositeImage, QueryImage};
pub use config::{PmConfig, PmConfigBuilder};
pub use engine::{SweepEngine, SweepOutcome, SweepSchedule};
pub use error::{pm_error, PmError};
pub use history::{HistoryOptions, InjectOutcome, ShortTermHistory};
pub use topology::{FabricTopology, InMemoryTopology, TopologySource};
