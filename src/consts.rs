//! 常量定义
//!
//! extent 树的磁盘格式常量和长度限制。

//=============================================================================
// 磁盘格式
//=============================================================================

/// Extent 头部魔数
pub const EXT4_EXTENT_MAGIC: u16 = 0xF30A;

/// inode 中 i_block 区域大小（字节），extent 树的根节点存放于此
pub const EXT4_INODE_BLOCK_SIZE: usize = 60;

/// Extent 头部大小
pub const EXT4_EXT_HEADER_SIZE: usize = 12;

/// 叶子条目 / 索引条目大小（两者相同）
pub const EXT4_EXT_ENTRY_SIZE: usize = 12;

/// extent 块尾部校验和大小
pub const EXT4_EXT_TAIL_SIZE: usize = 4;

/// 根节点容量：(60 - 12) / 12 = 4，叶子和索引相同
pub const EXT4_EXT_ROOT_CAPACITY: u16 =
    ((EXT4_INODE_BLOCK_SIZE - EXT4_EXT_HEADER_SIZE) / EXT4_EXT_ENTRY_SIZE) as u16;

/// 树的最大深度
///
/// 4 字节逻辑块号配合最小 1 KiB 块，5 层足以覆盖整个地址空间。
pub const EXT4_EXT_MAX_DEPTH: u16 = 5;

//=============================================================================
// 长度限制
//=============================================================================

/// 已初始化 extent 的最大长度
///
/// ee_len 最高位表示 unwritten，但恰好等于 0x8000 时按已初始化处理。
pub const EXT_INIT_MAX_LEN: u32 = 1 << 15;

/// unwritten extent 的最大长度
pub const EXT_UNINIT_MAX_LEN: u32 = EXT_INIT_MAX_LEN - 1;

/// 逻辑块地址空间上限，同时作为 "无下一个块" 的哨兵值
pub const EXT_MAX_BLOCKS: u32 = 0xFFFF_FFFF;

/// 物理块号上限（48 位）
pub const EXT4_MAX_PHYS_BLOCK: u64 = (1 << 48) - 1;

/// 短于 2 * EXT4_EXT_ZERO_LEN 的 unwritten extent 直接清零转换，不再拆分
pub const EXT4_EXT_ZERO_LEN: u32 = 7;

//=============================================================================
// 其他
//=============================================================================

/// 默认块大小
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// 默认块缓存容量（块数）
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// 默认页大小
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// ext4 旧版 inode 大小（xattr 在 inode 中的起始偏移基于此）
pub const EXT4_GOOD_OLD_INODE_SIZE: u32 = 128;
