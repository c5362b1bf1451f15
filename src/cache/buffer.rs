//! 缓存块结构

use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// 缓存块标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u8 {
        /// 数据已更新（有效）
        const UPTODATE = 0x01;
        /// 数据已修改（脏），等待事务提交写回
        const DIRTY    = 0x02;
        /// 内容已通过 extent 节点校验，再次读取无需重复校验
        const VERIFIED = 0x04;
    }
}

/// 缓存块
#[derive(Debug, Clone)]
pub struct CacheBuffer {
    /// 块地址
    pub lba: u64,
    /// 块数据
    pub data: Vec<u8>,
    /// 块状态标志
    pub flags: CacheFlags,
}

impl CacheBuffer {
    /// 创建全零缓存块
    pub fn new(lba: u64, block_size: usize) -> Self {
        Self {
            lba,
            data: alloc::vec![0u8; block_size],
            flags: CacheFlags::empty(),
        }
    }

    /// 标记为脏
    pub fn mark_dirty(&mut self) {
        self.flags.insert(CacheFlags::DIRTY);
    }

    /// 标记为干净（已写回）
    pub fn clear_dirty(&mut self) {
        self.flags.remove(CacheFlags::DIRTY);
    }

    /// 是否为脏块
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(CacheFlags::DIRTY)
    }

    /// 标记数据有效
    pub fn mark_uptodate(&mut self) {
        self.flags.insert(CacheFlags::UPTODATE);
    }

    /// 数据是否有效
    pub fn is_uptodate(&self) -> bool {
        self.flags.contains(CacheFlags::UPTODATE)
    }

    /// 标记已校验
    pub fn mark_verified(&mut self) {
        self.flags.insert(CacheFlags::VERIFIED);
    }

    /// 是否已校验
    pub fn is_verified(&self) -> bool {
        self.flags.contains(CacheFlags::VERIFIED)
    }
}
