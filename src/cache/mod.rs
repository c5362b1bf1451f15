//! 块缓存模块
//!
//! extent 节点块的读缓存与事务内的写缓冲。
//!
//! # 主要组件
//!
//! - [`CacheBuffer`] - 单个缓存块，包含数据和状态标志
//! - [`BlockCache`] - 使用 `lru` crate 的缓存管理器
//! - [`CacheFlags`] - 缓存块状态标志
//! - [`CacheStats`] - 缓存统计信息
//!
//! 脏块由事务跟踪，提交时写回；中止时直接失效，下次读取回到磁盘上的旧内容。

mod block_cache;
mod buffer;

pub use block_cache::{BlockCache, CacheStats};
pub use buffer::{CacheBuffer, CacheFlags};
