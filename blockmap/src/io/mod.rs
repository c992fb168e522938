mod block;
mod diskemu;

pub use block::{BlockNumber, BlockStorage};
pub use diskemu::{FileBlockEmulator, FileBlockEmulatorBuilder, DEFAULT_BLOCK_SIZE};
