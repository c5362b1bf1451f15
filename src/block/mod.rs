//! 块设备抽象
//!
//! - `device` - [`BlockDevice`] trait 与内存实现 [`MemoryDevice`]
//! - `io` - 带 LRU 缓存的 [`BlockDev`]，元数据读写都走这里
//! - `handle` - 路径游标使用的 RAII 块句柄 [`BlockPin`]

mod device;
mod handle;
mod io;

pub use device::{BlockDevice, MemoryDevice};
pub use handle::{BlockPin, PinTable};
pub use io::{BlockDev, BlockData};
