//! 事务系统
//!
//! extent 树的每一次结构修改都在事务句柄 [`Handle`] 下进行：
//!
//! 1. 修改节点前先调用 [`Journal::get_write_access`]（新分配的块用
//!    [`Journal::get_create_access`]）
//! 2. 修改内存中的节点并编码回缓存块
//! 3. 调用 [`Journal::mark_dirty`] 记录脏块或脏 inode
//!
//! 持久化推迟到提交：提交时才把脏块写回设备，中止时丢弃。
//!
//! ## 模块结构
//!
//! - `simple` - 不带日志的简化实现 [`SimpleJournal`]
//! - `credits` - 事务额度估算 [`CreditModel`]

mod credits;
mod simple;

pub use credits::{CreditModel, Ext4CreditModel};
pub use simple::{JournalStats, SimpleJournal};

use crate::error::Result;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

/// 事务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// 活跃，可以进行修改
    Active,
    /// 已提交
    Committed,
    /// 已中止
    Aborted,
}

/// `extend` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendStatus {
    /// 额度已追加
    Extended,
    /// 当前事务放不下，需要提交后在新事务中继续
    RestartNeeded,
}

/// 标脏对象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyTarget {
    /// 元数据块
    Block(u64),
    /// inode（extent 树根在 inode 内）
    Inode(u32),
}

/// 事务句柄
///
/// 跟踪剩余额度、已获得写权限的块以及脏对象。
#[derive(Debug)]
pub struct Handle {
    id: u64,
    credits: u32,
    reserved: u32,
    state: TransactionState,
    access: BTreeSet<u64>,
    dirty_blocks: BTreeSet<u64>,
    dirty_inodes: BTreeSet<u32>,
}

impl Handle {
    /// 创建句柄
    pub fn new(id: u64, credits: u32) -> Self {
        Self {
            id,
            credits,
            reserved: credits,
            state: TransactionState::Active,
            access: BTreeSet::new(),
            dirty_blocks: BTreeSet::new(),
            dirty_inodes: BTreeSet::new(),
        }
    }

    /// 事务 ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 剩余额度
    pub fn credits(&self) -> u32 {
        self.credits
    }

    /// 当前事务累计预留的额度（begin + extend）
    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    /// 事务状态
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// 是否活跃
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// 块是否已获得写权限
    pub fn has_write_access(&self, block: u64) -> bool {
        self.access.contains(&block)
    }

    /// 脏块列表
    pub fn dirty_blocks(&self) -> Vec<u64> {
        self.dirty_blocks.iter().copied().collect()
    }

    /// inode 是否被标脏
    pub fn inode_dirty(&self, ino: u32) -> bool {
        self.dirty_inodes.contains(&ino)
    }

    /// 记录写权限，首次访问某块消耗一个额度
    ///
    /// 返回是否超出额度。
    pub(crate) fn grant_access(&mut self, block: u64) -> bool {
        if self.access.insert(block) {
            if self.credits == 0 {
                return true;
            }
            self.credits -= 1;
        }
        false
    }

    /// 消耗额度（分配器修改位图和组描述符时）
    ///
    /// 返回是否超出额度。
    pub(crate) fn charge(&mut self, credits: u32) -> bool {
        let overrun = self.credits < credits;
        self.credits = self.credits.saturating_sub(credits);
        overrun
    }

    pub(crate) fn add_credits(&mut self, credits: u32) {
        self.credits = self.credits.saturating_add(credits);
        self.reserved = self.reserved.saturating_add(credits);
    }

    pub(crate) fn record_dirty(&mut self, target: DirtyTarget) {
        match target {
            DirtyTarget::Block(b) => {
                self.dirty_blocks.insert(b);
            }
            DirtyTarget::Inode(ino) => {
                self.dirty_inodes.insert(ino);
            }
        }
    }

    pub(crate) fn forget_block(&mut self, block: u64) {
        self.dirty_blocks.remove(&block);
        self.access.remove(&block);
    }

    /// 开始下一个事务：清空跟踪集合，重新设置额度
    pub(crate) fn reset(&mut self, id: u64, credits: u32) {
        self.id = id;
        self.credits = credits;
        self.reserved = credits;
        self.state = TransactionState::Active;
        self.access.clear();
        self.dirty_blocks.clear();
        self.dirty_inodes.clear();
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }
}

/// 事务管理器接口
pub trait Journal {
    /// 开始事务，预留 `credits` 个块的额度
    fn begin(&mut self, credits: u32) -> Result<Handle>;

    /// 为当前事务追加额度
    fn extend(&mut self, handle: &mut Handle, credits: u32) -> Result<ExtendStatus>;

    /// 提交当前事务并在同一句柄上开始新事务
    ///
    /// 调用者负责在此之前写回句柄中的脏块。
    fn restart(&mut self, handle: &mut Handle, credits: u32) -> Result<()>;

    /// 获取已有块的写权限
    fn get_write_access(&mut self, handle: &mut Handle, block: u64) -> Result<()>;

    /// 获取新分配块的写权限
    fn get_create_access(&mut self, handle: &mut Handle, block: u64) -> Result<()>;

    /// 标脏块或 inode
    fn mark_dirty(&mut self, handle: &mut Handle, target: DirtyTarget) -> Result<()>;

    /// 释放的元数据块不再需要写回
    fn forget(&mut self, handle: &mut Handle, block: u64) -> Result<()>;

    /// 提交事务
    fn commit(&mut self, handle: Handle) -> Result<()>;

    /// 中止事务
    fn abort(&mut self, handle: Handle);
}
