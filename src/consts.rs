//! Общие константы форматов (composite/history, dbsync frames) и лимиты движка.

// -------- Composite header --------
pub const HIST_MAGIC: &[u8; 8] = b"PMHIST01";

/// Текущая версия формата тела композита.
pub const HISTORY_VERSION: u32 = 11;
/// Предыдущая версия: VF-таблица фиксирована на 32 записи, у порта нет group-слотов.
pub const HISTORY_VERSION_V10: u32 = 10;

pub const FLAG_COMPRESSED: u32 = 0x1;

pub const MAX_IMAGES_PER_COMPOSITE: usize = 64;
pub const MAX_COMPRESSION_DIVISIONS: usize = 32;

// Layout (LE):
// [magic8][version u32][flags u32][timestamp u64][sweep_interval u32][num_images u32]
// [image_ids u64 * MAX_IMAGES_PER_COMPOSITE][flat_size u64][num_divisions u32]
// [div_sizes u32 * MAX_COMPRESSION_DIVISIONS][body_crc32 u32]
pub const HDR_OFF_VERSION: usize = 8;
pub const HDR_OFF_FLAGS: usize = 12;
pub const HDR_OFF_TIMESTAMP: usize = 16;
pub const HDR_OFF_INTERVAL: usize = 24;
pub const HDR_OFF_NUM_IMAGES: usize = 28;
pub const HDR_OFF_IMAGE_IDS: usize = 32;
pub const HDR_OFF_FLAT_SIZE: usize = HDR_OFF_IMAGE_IDS + 8 * MAX_IMAGES_PER_COMPOSITE;
pub const HDR_OFF_NUM_DIVISIONS: usize = HDR_OFF_FLAT_SIZE + 8;
pub const HDR_OFF_DIV_SIZES: usize = HDR_OFF_NUM_DIVISIONS + 4;
pub const HDR_OFF_BODY_CRC: usize = HDR_OFF_DIV_SIZES + 4 * MAX_COMPRESSION_DIVISIONS;
pub const HEADER_SIZE: usize = HDR_OFF_BODY_CRC + 4;

// -------- Composite body records --------
pub const NAME_LEN: usize = 64;

pub const SM_REC_SIZE: usize = 8; // [lid u32][port u8][priority u8][state u8][pad u8]
pub const SUMMARY_SIZE: usize = 3 * 8 + 2 * 4 + 9 * 4 + 2 * SM_REC_SIZE;

pub const UTIL_BUCKETS: usize = 10;
pub const ERR_CATEGORIES: usize = 5;
pub const ERR_BUCKETS: usize = 5;
// [num_ports u32][total_mbps u64][max u32][min u32][avg u32][util_buckets][err_max][err_buckets]
pub const GROUP_STATS_SIZE: usize =
    4 + 8 + 3 * 4 + 4 * UTIL_BUCKETS + 4 * ERR_CATEGORIES + 4 * ERR_CATEGORIES * ERR_BUCKETS;
pub const GROUP_REC_SIZE: usize = NAME_LEN + GROUP_STATS_SIZE;

// [lid u32][guid u64][type u8][num_ports u8][no_resp u8][pad u8][desc 64][num_port_recs u32]
pub const NODE_REC_SIZE: usize = 4 + 8 + 4 + NAME_LEN + 4;

pub const PORT_MAX_GROUPS: usize = 8;
pub const PORT_MAX_VFS: usize = 16;
pub const NUM_PORT_COUNTERS: usize = 14;

// [port u8][flags u8][mtu u8][width u8][speed u8][pad3][nbr_lid u32][nbr_port u8][pad3]
// [vl_mask u32] ... [util u32][errors u32*5][counters u64*14]
const PORT_REC_COMMON: usize = 8 + 4 + 4 + 4 + 4 + 4 * ERR_CATEGORIES + 8 * NUM_PORT_COUNTERS;
pub const PORT_REC_SIZE: usize = PORT_REC_COMMON + 2 * PORT_MAX_VFS + 2 * PORT_MAX_GROUPS;
/// v10: вместо VF-слотов битовая маска u32, group-слотов нет.
pub const PORT_REC_SIZE_V10: usize = PORT_REC_COMMON + 4;

pub const MAX_VFABRICS_V10: usize = 32;
pub const MAX_VFABRICS: usize = 1000;
pub const MAX_GROUPS: usize = 64;

/// Значение «не назначено» для group/VF слотов порта.
pub const UNASSIGNED: i16 = -1;

// -------- Files --------
pub const HIST_FILE_PREFIX: &str = "c";
pub const HIST_EXT: &str = "hist";
pub const HIST_EXT_COMPRESSED: &str = "zhist";
pub const LOCK_FILE: &str = "LOCK";

pub const ZSTD_LEVEL: i32 = 3;

// -------- Image ring / topology copy --------
/// Запас при росте lid_map.
pub const LID_MAP_SPARE: usize = 256;
/// Если ёмкость превышает max_lid+1 больше чем на это значение - ужимаем.
pub const LID_MAP_SHRINK_SLACK: usize = 4 * LID_MAP_SPARE;
pub const MAX_UNICAST_LID: u32 = 0xBFFF;

pub const GROUP_WARN_THROTTLE_SECS: u64 = 300;

// -------- DBSync frames --------
pub const DBSYNC_MAGIC: &[u8; 8] = b"PMDBSYN1";
// [magic8][name_len u16][flags u16][len u32][crc32 u32]
pub const DBSYNC_HDR_SIZE: usize = 8 + 2 + 2 + 4 + 4;
pub const DBSYNC_MAX_PAYLOAD: usize = 256 * 1024 * 1024;

pub const SWEEP_RETRY_DELAY_MS: u64 = 1000;
