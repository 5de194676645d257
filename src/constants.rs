pub(crate) const RX_BUF_SIZE: usize = 1024;
pub(crate) const MAX_PAGE_BYTES: usize = 256;
pub(crate) const DEFAULT_PAGE_SIZE_BYTES: u16 = 128;

pub(crate) const HARDWARE_VERSION: u8 = 0x02;
pub(crate) const SOFTWARE_VERSION_MAJOR: u8 = 0x01;
pub(crate) const SOFTWARE_VERSION_MINOR: u8 = 0x12;

pub(crate) const PROGMODE_MAX_ATTEMPTS: u32 = 8;
pub(crate) const PROGMODE_RETRY_DELAY_MS: u64 = 10;
pub(crate) const RESET_SETTLE_MS: u64 = 2;
pub(crate) const CHIP_ERASE_DELAY_MS: u64 = 9;
pub(crate) const PAGE_COMMIT_DELAY_MS: u64 = 5;

/// Chip erases allowed per session before the engine halts to protect
/// the target's flash endurance.
pub(crate) const ERASE_CEILING: u32 = 200;

pub(crate) const SERIAL_TIMEOUT_MS: u64 = 1;
pub(crate) const SERIAL_CHUNK_SIZE: usize = 128;
