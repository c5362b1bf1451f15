//! extent 树磁盘记录
//!
//! 头部、叶子条目、索引条目三种 12 字节记录的内存表示，
//! 以及与磁盘小端格式之间的编解码。内存中的代码只操作这些结构，
//! 原始字节只在存储边界（[`crate::extent::node`]）出现。

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::*;

/// Extent 头部（12 字节）
///
/// ```text
/// 0      2        4      6      8            12
/// +------+--------+------+------+------------+
/// |magic |entries | max  |depth | generation |
/// +------+--------+------+------+------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentHeader {
    /// 魔数，应为 [`EXT4_EXTENT_MAGIC`]
    pub magic: u16,
    /// 有效条目数
    pub entries: u16,
    /// 条目容量
    pub max: u16,
    /// 距离叶子层的深度，0 表示叶子
    pub depth: u16,
    /// 树的 generation
    pub generation: u32,
}

impl ExtentHeader {
    /// 创建一个空节点头部
    pub const fn new(max: u16, depth: u16) -> Self {
        Self {
            magic: EXT4_EXTENT_MAGIC,
            entries: 0,
            max,
            depth,
            generation: 0,
        }
    }

    /// 从字节解码
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            magic: LittleEndian::read_u16(&buf[0..2]),
            entries: LittleEndian::read_u16(&buf[2..4]),
            max: LittleEndian::read_u16(&buf[4..6]),
            depth: LittleEndian::read_u16(&buf[6..8]),
            generation: LittleEndian::read_u32(&buf[8..12]),
        }
    }

    /// 编码到字节
    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.magic);
        LittleEndian::write_u16(&mut buf[2..4], self.entries);
        LittleEndian::write_u16(&mut buf[4..6], self.max);
        LittleEndian::write_u16(&mut buf[6..8], self.depth);
        LittleEndian::write_u32(&mut buf[8..12], self.generation);
    }

    /// 魔数是否正确
    pub fn is_valid_magic(&self) -> bool {
        self.magic == EXT4_EXTENT_MAGIC
    }
}

/// 叶子条目：一段连续逻辑块到连续物理块的映射
///
/// ```text
/// 0          4        6          8              12
/// +----------+--------+----------+--------------+
/// | ee_block | ee_len | start_hi |   start_lo   |
/// +----------+--------+----------+--------------+
/// ```
///
/// `ee_len` 大于 0x8000 表示 unwritten，实际长度为 `ee_len - 0x8000`；
/// 恰好等于 0x8000 时是长度 32768 的已初始化 extent。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    /// 起始逻辑块
    pub block: u32,
    len: u16,
    start: u64,
}

impl Extent {
    /// 创建已初始化 extent
    pub fn new(block: u32, len: u32, pblock: u64) -> Self {
        debug_assert!(len > 0 && len <= EXT_INIT_MAX_LEN);
        Self {
            block,
            len: len as u16,
            start: pblock & EXT4_MAX_PHYS_BLOCK,
        }
    }

    /// 创建 unwritten extent
    pub fn new_unwritten(block: u32, len: u32, pblock: u64) -> Self {
        debug_assert!(len > 0 && len <= EXT_UNINIT_MAX_LEN);
        let mut ex = Self::new(block, len, pblock);
        ex.mark_unwritten();
        ex
    }

    /// 磁盘上的原始 ee_len
    pub fn raw_len(&self) -> u16 {
        self.len
    }

    /// 实际长度（去掉 unwritten 标志）
    pub fn actual_len(&self) -> u32 {
        let len = self.len as u32;
        if len <= EXT_INIT_MAX_LEN {
            len
        } else {
            len - EXT_INIT_MAX_LEN
        }
    }

    /// 设置实际长度，保持 unwritten 状态不变
    pub fn set_actual_len(&mut self, len: u32) {
        if self.is_unwritten() {
            debug_assert!(len <= EXT_UNINIT_MAX_LEN);
            self.len = (len + EXT_INIT_MAX_LEN) as u16;
        } else {
            debug_assert!(len <= EXT_INIT_MAX_LEN);
            self.len = len as u16;
        }
    }

    /// 是否为 unwritten extent
    pub fn is_unwritten(&self) -> bool {
        self.len as u32 > EXT_INIT_MAX_LEN
    }

    /// 标记为 unwritten
    pub fn mark_unwritten(&mut self) {
        debug_assert!(self.actual_len() <= EXT_UNINIT_MAX_LEN);
        self.len = (self.actual_len() + EXT_INIT_MAX_LEN) as u16;
    }

    /// 标记为已初始化
    pub fn mark_initialized(&mut self) {
        self.len = self.actual_len() as u16;
    }

    /// 该状态下允许的最大长度
    pub fn max_len(&self) -> u32 {
        if self.is_unwritten() {
            EXT_UNINIT_MAX_LEN
        } else {
            EXT_INIT_MAX_LEN
        }
    }

    /// 起始物理块
    pub fn pblock(&self) -> u64 {
        self.start
    }

    /// 设置起始物理块（48 位）
    pub fn set_pblock(&mut self, pblock: u64) {
        self.start = pblock & EXT4_MAX_PHYS_BLOCK;
    }

    /// 逻辑结束位置（不含）
    pub fn end(&self) -> u64 {
        self.block as u64 + self.actual_len() as u64
    }

    /// 最后一个逻辑块
    pub fn last_block(&self) -> u32 {
        (self.end() - 1) as u32
    }

    /// 逻辑块是否落在此 extent 内
    pub fn contains(&self, lblk: u32) -> bool {
        lblk >= self.block && (lblk as u64) < self.end()
    }

    /// 从字节解码
    pub fn decode(buf: &[u8]) -> Self {
        let hi = LittleEndian::read_u16(&buf[6..8]) as u64;
        let lo = LittleEndian::read_u32(&buf[8..12]) as u64;
        Self {
            block: LittleEndian::read_u32(&buf[0..4]),
            len: LittleEndian::read_u16(&buf[4..6]),
            start: (hi << 32) | lo,
        }
    }

    /// 编码到字节
    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.block);
        LittleEndian::write_u16(&mut buf[4..6], self.len);
        LittleEndian::write_u16(&mut buf[6..8], (self.start >> 32) as u16);
        LittleEndian::write_u32(&mut buf[8..12], self.start as u32);
    }
}

/// 索引条目：把不小于 `block` 的逻辑块路由到子节点
///
/// ```text
/// 0          4              8         10        12
/// +----------+--------------+---------+---------+
/// | ei_block |   leaf_lo    | leaf_hi | unused  |
/// +----------+--------------+---------+---------+
/// ```
///
/// 字段顺序与 ext4 磁盘格式一致：`leaf_lo` 在前，`leaf_hi` 在后。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentIndex {
    /// 子树覆盖的起始逻辑块
    pub block: u32,
    leaf: u64,
}

impl ExtentIndex {
    /// 创建索引条目
    pub fn new(block: u32, leaf: u64) -> Self {
        Self {
            block,
            leaf: leaf & EXT4_MAX_PHYS_BLOCK,
        }
    }

    /// 子节点所在物理块
    pub fn leaf(&self) -> u64 {
        self.leaf
    }

    /// 设置子节点物理块
    pub fn set_leaf(&mut self, leaf: u64) {
        self.leaf = leaf & EXT4_MAX_PHYS_BLOCK;
    }

    /// 从字节解码
    pub fn decode(buf: &[u8]) -> Self {
        let lo = LittleEndian::read_u32(&buf[4..8]) as u64;
        let hi = LittleEndian::read_u16(&buf[8..10]) as u64;
        Self {
            block: LittleEndian::read_u32(&buf[0..4]),
            leaf: (hi << 32) | lo,
        }
    }

    /// 编码到字节（保留字段写 0）
    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.block);
        LittleEndian::write_u32(&mut buf[4..8], self.leaf as u32);
        LittleEndian::write_u16(&mut buf[8..10], (self.leaf >> 32) as u16);
        LittleEndian::write_u16(&mut buf[10..12], 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_len_encoding() {
        let mut ex = Extent::new(0, 100, 1000);
        assert!(!ex.is_unwritten());
        assert_eq!(ex.raw_len(), 100);

        ex.mark_unwritten();
        assert!(ex.is_unwritten());
        assert_eq!(ex.raw_len(), 0x8000 + 100);
        assert_eq!(ex.actual_len(), 100);

        ex.set_actual_len(50);
        assert!(ex.is_unwritten());
        assert_eq!(ex.actual_len(), 50);

        ex.mark_initialized();
        assert_eq!(ex.raw_len(), 50);
    }

    #[test]
    fn test_exact_0x8000_is_initialized() {
        // 0x8000 恰好是已初始化 extent 的最大长度
        let ex = Extent::new(0, EXT_INIT_MAX_LEN, 0);
        assert!(!ex.is_unwritten());
        assert_eq!(ex.actual_len(), 32768);
        assert_eq!(ex.max_len(), EXT_INIT_MAX_LEN);
    }

    #[test]
    fn test_extent_disk_layout() {
        let ex = Extent::new_unwritten(0x0102_0304, 5, 0x0000_ABCD_1234_5678);
        let mut buf = [0u8; 12];
        ex.encode(&mut buf);

        assert_eq!(&buf[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[4..6], &[0x05, 0x80]);
        // start_hi 在 start_lo 之前
        assert_eq!(&buf[6..8], &[0xCD, 0xAB]);
        assert_eq!(&buf[8..12], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(Extent::decode(&buf), ex);
    }

    #[test]
    fn test_index_disk_layout() {
        let idx = ExtentIndex::new(42, 0x0000_0001_0000_0002);
        let mut buf = [0xFFu8; 12];
        idx.encode(&mut buf);

        assert_eq!(&buf[4..8], &[0x02, 0, 0, 0]);
        assert_eq!(&buf[8..10], &[0x01, 0]);
        assert_eq!(&buf[10..12], &[0, 0]);
        assert_eq!(ExtentIndex::decode(&buf).leaf(), 0x1_0000_0002);
    }

    #[test]
    fn test_header_layout() {
        let mut hdr = ExtentHeader::new(4, 0);
        hdr.entries = 3;
        hdr.generation = 7;
        let mut buf = [0u8; 12];
        hdr.encode(&mut buf);

        assert_eq!(&buf[0..2], &[0x0A, 0xF3]);
        assert_eq!(ExtentHeader::decode(&buf), hdr);
        assert!(hdr.is_valid_magic());
    }

    #[test]
    fn test_extent_bounds() {
        let ex = Extent::new(10, 5, 100);
        assert_eq!(ex.end(), 15);
        assert_eq!(ex.last_block(), 14);
        assert!(ex.contains(10));
        assert!(ex.contains(14));
        assert!(!ex.contains(15));
        assert!(!ex.contains(9));
    }
}
