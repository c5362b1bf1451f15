//! 内存中的 inode
//!
//! extent 树只关心 inode 的一小部分：60 字节的 `i_block`（树根）、文件大小、
//! generation（校验和种子）以及 xattr 的位置（FIEMAP 使用）。
//!
//! [`ExtentInode`] 把这些字段放在读写锁 [`InodeData`] 之后：查找持读锁，
//! 任何修改树结构的操作持写锁。单槽 extent 缓存有自己的自旋锁，
//! 持读锁的查找也可以更新它。

use crate::consts::*;
use crate::extent::{tree_init, ExtentCache};
use bitflags::bitflags;
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

bitflags! {
    /// inode 运行时状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InodeState: u32 {
        /// 有等待 DIO 完成后转换的 unwritten extent
        const DIO_UNWRITTEN = 0x0001;
        /// 扩展属性存放在 inode 内
        const XATTR         = 0x0002;
        /// i_size 之后还有预分配的块
        const EOFBLOCKS     = 0x0004;
    }
}

/// 扩展属性的物理位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XattrInfo {
    /// xattr 存放在 inode 尾部的额外空间中
    pub in_inode: bool,
    /// inode 所在的 inode 表块
    pub inode_block: u64,
    /// inode 在块内的字节偏移
    pub inode_offset: u32,
    /// 磁盘 inode 大小
    pub inode_size: u32,
    /// `i_extra_isize`
    pub extra_isize: u32,
    /// 外部 xattr 块（0 表示没有）
    pub file_acl: u64,
}

/// 受数据锁保护的 inode 字段
#[derive(Debug)]
pub struct InodeData {
    /// inode 号
    pub ino: u32,
    /// extent 树根
    pub i_block: [u8; EXT4_INODE_BLOCK_SIZE],
    /// 文件大小（字节）
    pub size: u64,
    /// inode generation
    pub generation: u32,
    /// 运行时状态
    pub state: InodeState,
    /// xattr 位置
    pub xattr: XattrInfo,
    /// 分配目标提示：inode 所在块组的第一个块，0 表示未知
    pub goal_hint: u64,
    /// 延迟分配元数据估算：上次估算覆盖的连续块数
    pub da_metadata_calc_len: u32,
    /// 延迟分配元数据估算：上次估算的逻辑块
    pub da_metadata_calc_last_lblock: u32,
    cache: ExtentCache,
}

impl InodeData {
    fn new(ino: u32) -> Self {
        Self {
            ino,
            i_block: [0u8; EXT4_INODE_BLOCK_SIZE],
            size: 0,
            generation: 0,
            state: InodeState::empty(),
            xattr: XattrInfo::default(),
            goal_hint: 0,
            da_metadata_calc_len: 0,
            da_metadata_calc_last_lblock: 0,
            cache: ExtentCache::new(),
        }
    }

    /// 单槽 extent 缓存
    pub fn cache(&self) -> &ExtentCache {
        &self.cache
    }
}

/// 带 extent 树的 inode
#[derive(Debug)]
pub struct ExtentInode {
    ino: u32,
    data: RwLock<InodeData>,
}

impl ExtentInode {
    /// 创建新 inode，写入空的根叶子
    pub fn new(ino: u32) -> Self {
        let mut data = InodeData::new(ino);
        tree_init(&mut data);
        Self::from_data(data)
    }

    pub(crate) fn from_data(data: InodeData) -> Self {
        Self {
            ino: data.ino,
            data: RwLock::new(data),
        }
    }

    /// inode 号
    pub fn ino(&self) -> u32 {
        self.ino
    }

    /// 获取数据读锁
    pub fn read(&self) -> RwLockReadGuard<'_, InodeData> {
        self.data.read()
    }

    /// 获取数据写锁
    pub fn write(&self) -> RwLockWriteGuard<'_, InodeData> {
        self.data.write()
    }

    /// 尝试获取数据写锁，锁被占用时返回 `None`
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, InodeData>> {
        self.data.try_write()
    }

    /// 文件大小
    pub fn size(&self) -> u64 {
        self.data.read().size
    }

    /// 设置文件大小
    pub fn set_size(&self, size: u64) {
        self.data.write().size = size;
    }

    /// 设置 xattr 位置
    pub fn set_xattr(&self, xattr: XattrInfo) {
        let mut data = self.data.write();
        data.state.set(InodeState::XATTR, xattr.in_inode);
        data.xattr = xattr;
    }
}
