//! lwext4_extent: ext4 extent 树
//!
//! 纯 Rust 实现的 ext4 extent 树管理，负责：
//! - **块映射**：逻辑块到物理块的解析，需要时分配新块
//! - **树维护**：插入、节点分裂、树长高、多层删除
//! - **unwritten extent**：预分配、写入时分裂与转换
//! - **打洞与截断**、**FIEMAP**、**extent 交换**
//!
//! 块设备、事务系统、块分配器和页缓存都是 trait，库内自带内存实现。
//!
//! # 示例
//!
//! ```rust,ignore
//! use lwext4_extent::{
//!     BitmapAllocator, ExtentFs, FsConfig, GetBlocksFlags, MemPageCache,
//!     MemoryDevice, SimpleJournal, SystemZone,
//! };
//!
//! let zone = SystemZone::new(1, 16384);
//! let fs = ExtentFs::new(
//!     MemoryDevice::new(4096, 16384),
//!     FsConfig::default(),
//!     zone.clone(),
//!     SimpleJournal::default(),
//!     BitmapAllocator::new(&zone),
//!     MemPageCache::new(4096, 4096),
//! )?;
//!
//! let inode = fs.load_inode(12, i_block, size)?;
//! let m = fs.resolve(&inode, 0, 16, GetBlocksFlags::CREATE)?;
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`block`] - 块设备抽象和带缓存的 I/O
//! - [`cache`] - LRU 块缓存
//! - [`types`] - 磁盘上的 extent 结构
//! - [`balloc`] - 块分配器接口与位图实现
//! - [`transaction`] - 事务接口与额度估算
//! - [`page_cache`] - 页缓存接口
//! - [`fs`] - 运行上下文与内存 inode
//! - [`extent`] - extent 树本身

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 块设备抽象
pub mod block;

/// 常量定义
pub mod consts;

/// 数据结构定义
pub mod types;

/// 块缓存
pub mod cache;

/// 块分配
pub mod balloc;

/// 事务系统
pub mod transaction;

/// 页缓存
pub mod page_cache;

/// 运行上下文
pub mod fs;

/// Extent 树操作
pub mod extent;

#[cfg(test)]
mod test_utils;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 块设备
pub use block::{BlockDevice, MemoryDevice};

// 块分配
pub use balloc::{BitmapAllocator, BlockAllocator, SystemZone};

// 事务
pub use transaction::{CreditModel, Ext4CreditModel, Handle, Journal, SimpleJournal};

// 页缓存
pub use page_cache::{BufferState, MemPageCache, PageCache};

// 上下文
pub use fs::{ExtentFs, ExtentInode, FsConfig, InodeData, InodeState, XattrInfo};

// Extent
pub use extent::{
    BlockMapping, ExtentPath, FiemapExtent, FiemapExtentFlags, FiemapFlags, FiemapInfo,
    GetBlocksFlags, MapFlags,
};
