//! 带缓存的块 I/O
//!
//! 所有元数据读写都经过 [`BlockCache`]：读未命中时从设备载入，
//! 写只修改缓存并标记为脏，由事务提交时 [`BlockDev::flush_blocks`] 写回。

use super::device::BlockDevice;
use super::handle::{BlockPin, PinTable};
use crate::cache::{BlockCache, CacheFlags, CacheStats};
use crate::error::{Error, ErrorKind, Result};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

/// 读取结果
#[derive(Debug, Clone)]
pub struct BlockData {
    /// 块内容副本
    pub data: Vec<u8>,
    /// 缓存中的内容是否已经通过校验
    pub verified: bool,
}

/// 块设备包装器
pub struct BlockDev<D: BlockDevice> {
    device: D,
    cache: BlockCache,
    pins: Arc<PinTable>,
    block_size: u32,
}

impl<D: BlockDevice> BlockDev<D> {
    /// 创建包装器
    ///
    /// # 参数
    ///
    /// * `device` - 底层块设备
    /// * `cache_size` - 缓存块数
    pub fn new(device: D, cache_size: usize) -> Self {
        let block_size = device.block_size();
        let pins = PinTable::new();
        Self {
            cache: BlockCache::new(cache_size, block_size as usize, Arc::clone(&pins)),
            device,
            pins,
            block_size,
        }
    }

    /// 块大小
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// 设备总块数
    pub fn total_blocks(&self) -> u64 {
        self.device.total_blocks()
    }

    /// 底层设备
    pub fn device(&self) -> &D {
        &self.device
    }

    /// 底层设备（可变）
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// 共享的块固定表
    pub fn pins(&self) -> &Arc<PinTable> {
        &self.pins
    }

    /// 固定一个块
    pub fn pin(&self, lba: u64) -> BlockPin {
        self.pins.pin(lba)
    }

    /// 读取块
    ///
    /// 缓存未命中时从设备读入。
    ///
    /// # 错误
    ///
    /// - `Io` - 设备读取失败
    pub fn read_block(&mut self, lba: u64) -> Result<BlockData> {
        if let Some(buf) = self.cache.get(lba) {
            return Ok(BlockData {
                data: buf.data.clone(),
                verified: buf.is_verified(),
            });
        }

        let mut data = vec![0u8; self.block_size as usize];
        self.device.read_block(lba, &mut data).map_err(|e| {
            log::error!("[BLOCK] read LBA={:#x} failed: {}", lba, e);
            Error::new(ErrorKind::Io, "Failed to read metadata block")
        })?;
        self.cache.insert(lba, &data, CacheFlags::empty());
        Ok(BlockData {
            data,
            verified: false,
        })
    }

    /// 标记缓存块已通过校验
    pub fn set_verified(&mut self, lba: u64) {
        if let Some(buf) = self.cache.get_mut(lba) {
            buf.mark_verified();
        }
    }

    /// 写入块到缓存并标记为脏
    ///
    /// 内容由本模块编码生成，视为已校验。
    pub fn write_block(&mut self, lba: u64, data: &[u8]) {
        self.cache
            .insert(lba, data, CacheFlags::DIRTY | CacheFlags::VERIFIED);
    }

    /// 写回指定的脏块
    pub fn flush_blocks(&mut self, lbas: &[u64]) -> Result<()> {
        for &lba in lbas {
            if let Some(data) = self.cache.take_dirty(lba) {
                self.device.write_block(lba, &data)?;
            }
        }
        Ok(())
    }

    /// 写回所有脏块
    pub fn flush_all(&mut self) -> Result<()> {
        let lbas = self.cache.dirty_lbas();
        self.flush_blocks(&lbas)?;
        self.device.flush()
    }

    /// 丢弃缓存中的块（包括未写回的修改）
    pub fn discard(&mut self, lba: u64) {
        self.cache.invalidate(lba);
    }

    /// 把数据块范围清零
    ///
    /// 直接写设备；范围内的缓存块一并失效。
    pub fn zero_blocks(&mut self, start: u64, count: u64) -> Result<()> {
        for lba in start..start + count {
            self.cache.invalidate(lba);
        }
        self.device.zero_blocks(start, count)
    }

    /// 缓存统计
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryDevice;

    #[test]
    fn test_read_through_cache() {
        let mut dev = MemoryDevice::new(1024, 8);
        dev.raw_block_mut(2)[0] = 0x5A;
        let mut bdev = BlockDev::new(dev, 4);

        let first = bdev.read_block(2).unwrap();
        assert_eq!(first.data[0], 0x5A);
        assert!(!first.verified);

        bdev.set_verified(2);
        let second = bdev.read_block(2).unwrap();
        assert!(second.verified);
        assert_eq!(bdev.device().reads(), 1);
    }

    #[test]
    fn test_write_is_deferred_until_flush() {
        let mut bdev = BlockDev::new(MemoryDevice::new(1024, 8), 4);
        bdev.write_block(3, &[7u8; 1024]);
        assert_eq!(bdev.device().raw_block(3)[0], 0);
        assert_eq!(bdev.read_block(3).unwrap().data[0], 7);

        bdev.flush_blocks(&[3]).unwrap();
        assert_eq!(bdev.device().raw_block(3)[0], 7);
    }

    #[test]
    fn test_discard_drops_changes() {
        let mut bdev = BlockDev::new(MemoryDevice::new(1024, 8), 4);
        bdev.write_block(1, &[1u8; 1024]);
        bdev.discard(1);
        assert_eq!(bdev.read_block(1).unwrap().data[0], 0);
    }

    #[test]
    fn test_zero_blocks_invalidates_cache() {
        let mut dev = MemoryDevice::new(1024, 8);
        dev.raw_block_mut(4).fill(0xEE);
        let mut bdev = BlockDev::new(dev, 4);
        assert_eq!(bdev.read_block(4).unwrap().data[0], 0xEE);

        bdev.zero_blocks(4, 1).unwrap();
        assert_eq!(bdev.read_block(4).unwrap().data[0], 0);
    }
}
