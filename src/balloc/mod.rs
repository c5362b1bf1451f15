//! 物理块分配
//!
//! extent 树通过 [`BlockAllocator`] trait 申请和释放物理块：
//! 数据块由块映射路径按目标块提示分配，元数据块（分裂、增长时的新节点）
//! 以父节点所在块为目标分配。
//!
//! - [`BitmapAllocator`] - 基于位图的内存实现，记录所有调用
//! - [`SystemZone`] - 合法数据区描述，用于校验 extent 引用的物理范围

mod bitmap;
mod system_zone;

pub use bitmap::{AllocEvent, AllocLog, BitmapAllocator};
pub use system_zone::SystemZone;

use crate::error::Result;
use bitflags::bitflags;

bitflags! {
    /// 分配请求标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// 数据块分配
        const HINT_DATA        = 0x0001;
        /// 目标块只是提示，可以偏离
        const HINT_TRY_GOAL    = 0x0002;
        /// 元数据分配不允许失败（用于 unwritten 转换）
        const METADATA_NOFAIL  = 0x0004;
        /// 块已在延迟分配阶段预留
        const DELALLOC_RESERVED = 0x0008;
    }
}

bitflags! {
    /// 释放标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FreeFlags: u32 {
        /// 释放的是元数据块
        const METADATA = 0x0001;
        /// 同时让 journal 忘记该块
        const FORGET   = 0x0002;
    }
}

/// 分配请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocRequest {
    /// 对应的逻辑块（数据分配时有意义）
    pub logical: u32,
    /// 目标物理块
    pub goal: u64,
    /// 期望长度
    pub len: u32,
    /// 左侧最近已分配 extent 的最后逻辑块
    pub lleft: u32,
    /// 左侧最近已分配 extent 的最后物理块
    pub pleft: u64,
    /// 右侧最近已分配 extent 的第一个逻辑块
    pub lright: u32,
    /// 右侧最近已分配 extent 的第一个物理块
    pub pright: u64,
    /// 标志
    pub flags: AllocFlags,
}

impl AllocRequest {
    /// 单个元数据块请求
    pub fn metadata(goal: u64, flags: AllocFlags) -> Self {
        Self {
            goal,
            len: 1,
            flags,
            ..Self::default()
        }
    }
}

/// 块分配器接口
pub trait BlockAllocator {
    /// 分配物理块
    ///
    /// 返回 `(起始块, 实际长度)`，实际长度可能小于请求长度但至少为 1。
    ///
    /// # 错误
    ///
    /// - `NoSpace` - 没有空闲块
    fn allocate(&mut self, req: &AllocRequest) -> Result<(u64, u32)>;

    /// 释放 `[start, start + count)`
    fn free(&mut self, start: u64, count: u32, flags: FreeFlags) -> Result<()>;
}
