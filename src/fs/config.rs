//! 文件系统配置

use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};

/// 文件系统配置
#[derive(Debug, Clone, Copy)]
pub struct FsConfig {
    /// 块大小（字节）
    pub block_size: u32,
    /// 块缓存大小（块数）
    pub bcache_size: u32,
    /// extent 块是否带校验和尾
    pub metadata_csum: bool,
    /// 文件系统 UUID（校验和种子）
    pub uuid: [u8; 16],
    /// 是否启用延迟分配
    pub delalloc: bool,
    /// 每组块数（额度估算使用）
    pub blocks_per_group: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            bcache_size: DEFAULT_CACHE_SIZE as u32,
            metadata_csum: false,
            uuid: [0u8; 16],
            delalloc: true,
            blocks_per_group: DEFAULT_BLOCK_SIZE * 8,
        }
    }
}

impl FsConfig {
    /// 按块大小创建配置，其余取默认值
    pub fn with_block_size(block_size: u32) -> Self {
        Self {
            block_size,
            blocks_per_group: block_size * 8,
            ..Self::default()
        }
    }

    /// 检查配置
    ///
    /// # 错误
    ///
    /// - `InvalidInput` - 块大小不是 1024..=65536 之间的 2 的幂，或缓存为空
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || !(1024..=65536).contains(&self.block_size) {
            return Err(Error::new(ErrorKind::InvalidInput, "Invalid block size"));
        }
        if self.bcache_size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Block cache size is zero"));
        }
        if self.blocks_per_group == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Blocks per group is zero"));
        }
        Ok(())
    }

    /// 块大小的位数
    pub fn block_bits(&self) -> u32 {
        self.block_size.trailing_zeros()
    }
}
