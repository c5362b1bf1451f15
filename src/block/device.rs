//! 块设备核心类型

use crate::error::{Error, ErrorKind, Result};
use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

/// 块设备接口
///
/// 以文件系统块为单位访问底层存储。extent 树只需要按块读写元数据、
/// 以及对数据块清零（unwritten extent 的 zeroout 回退路径）。
///
/// # 示例
///
/// ```rust,ignore
/// use lwext4_extent::{BlockDevice, Result};
///
/// struct MyDevice { /* ... */ }
///
/// impl BlockDevice for MyDevice {
///     fn block_size(&self) -> u32 { 4096 }
///     fn total_blocks(&self) -> u64 { 1 << 20 }
///     fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> { /* ... */ Ok(()) }
///     fn write_block(&mut self, lba: u64, buf: &[u8]) -> Result<()> { /* ... */ Ok(()) }
/// }
/// ```
pub trait BlockDevice {
    /// 块大小（字节）
    fn block_size(&self) -> u32;

    /// 总块数
    fn total_blocks(&self) -> u64;

    /// 读取一个块
    ///
    /// `buf` 长度等于 `block_size()`
    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> Result<()>;

    /// 写入一个块
    fn write_block(&mut self, lba: u64, buf: &[u8]) -> Result<()>;

    /// 把 `[start, start + count)` 范围的块清零
    ///
    /// 默认实现逐块写零，设备可以用 discard/write-zeroes 覆盖。
    fn zero_blocks(&mut self, start: u64, count: u64) -> Result<()> {
        let zeros = vec![0u8; self.block_size() as usize];
        for lba in start..start + count {
            self.write_block(lba, &zeros)?;
        }
        Ok(())
    }

    /// 刷新设备缓存
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 内存块设备
///
/// 用于测试和不落盘的场景。记录读写次数，并可对指定块注入读错误。
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    block_size: u32,
    data: Vec<u8>,
    reads: u64,
    writes: u64,
    bad_blocks: BTreeSet<u64>,
}

impl MemoryDevice {
    /// 创建 `total_blocks` 个块、全零的设备
    pub fn new(block_size: u32, total_blocks: u64) -> Self {
        Self {
            block_size,
            data: vec![0u8; block_size as usize * total_blocks as usize],
            reads: 0,
            writes: 0,
            bad_blocks: BTreeSet::new(),
        }
    }

    /// 读取次数
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// 写入次数
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// 让对 `lba` 的读取返回 I/O 错误
    pub fn inject_read_error(&mut self, lba: u64) {
        self.bad_blocks.insert(lba);
    }

    /// 直接访问块内容（绕过缓存）
    pub fn raw_block(&self, lba: u64) -> &[u8] {
        let range = self.range(lba);
        &self.data[range]
    }

    /// 直接修改块内容（绕过缓存）
    pub fn raw_block_mut(&mut self, lba: u64) -> &mut [u8] {
        let range = self.range(lba);
        &mut self.data[range]
    }

    fn range(&self, lba: u64) -> core::ops::Range<usize> {
        let bs = self.block_size as usize;
        let start = lba as usize * bs;
        start..start + bs
    }

    fn check(&self, lba: u64, len: usize) -> Result<()> {
        if lba >= self.total_blocks() {
            return Err(Error::new(ErrorKind::Io, "Block address beyond device end"));
        }
        if len < self.block_size as usize {
            return Err(Error::new(ErrorKind::InvalidInput, "Buffer smaller than block size"));
        }
        Ok(())
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        (self.data.len() / self.block_size as usize) as u64
    }

    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.check(lba, buf.len())?;
        if self.bad_blocks.contains(&lba) {
            return Err(Error::new(ErrorKind::Io, "Injected read error"));
        }
        let range = self.range(lba);
        let bs = self.block_size as usize;
        buf[..bs].copy_from_slice(&self.data[range]);
        self.reads += 1;
        Ok(())
    }

    fn write_block(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        self.check(lba, buf.len())?;
        let range = self.range(lba);
        let bs = self.block_size as usize;
        self.data[range].copy_from_slice(&buf[..bs]);
        self.writes += 1;
        Ok(())
    }
}
