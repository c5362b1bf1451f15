//! Extent 块校验和
//!
//! 非根节点的块在最后一个条目槽之后（`12 + max * 12`）存放 4 字节校验和。
//! 校验和依次覆盖：
//! 1. 文件系统 UUID
//! 2. inode 号
//! 3. inode generation
//! 4. 块内容（头部 + 全部条目槽，不含校验和本身）

use crate::consts::*;
use crate::fs::FsConfig;
use crate::types::ExtentHeader;
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

/// 校验和初始值
const EXT4_CRC32_INIT: u32 = !0u32;

/// 校验和尾部在块中的偏移
#[inline]
pub fn extent_tail_offset(max: u16) -> usize {
    EXT4_EXT_HEADER_SIZE + EXT4_EXT_ENTRY_SIZE * max as usize
}

/// 计算 extent 块校验和
///
/// # 参数
///
/// * `uuid` - 文件系统 UUID
/// * `ino` - inode 号
/// * `generation` - inode generation
/// * `block` - 完整的 extent 块
pub fn block_csum(uuid: &[u8; 16], ino: u32, generation: u32, block: &[u8]) -> u32 {
    let hdr = ExtentHeader::decode(block);
    let end = extent_tail_offset(hdr.max).min(block.len());

    let mut hasher = Hasher::new_with_initial(EXT4_CRC32_INIT);
    hasher.update(uuid);
    hasher.update(&ino.to_le_bytes());
    hasher.update(&generation.to_le_bytes());
    hasher.update(&block[..end]);
    hasher.finalize()
}

/// 写入校验和（未启用时不做任何事）
pub fn set_block_csum(config: &FsConfig, ino: u32, generation: u32, block: &mut [u8]) {
    if !config.metadata_csum {
        return;
    }
    let hdr = ExtentHeader::decode(block);
    let off = extent_tail_offset(hdr.max);
    if off + EXT4_EXT_TAIL_SIZE > block.len() {
        return;
    }
    let csum = block_csum(&config.uuid, ino, generation, block);
    LittleEndian::write_u32(&mut block[off..off + EXT4_EXT_TAIL_SIZE], csum);
}

/// 校验块的校验和（未启用时总是通过）
pub fn verify_block_csum(config: &FsConfig, ino: u32, generation: u32, block: &[u8]) -> bool {
    if !config.metadata_csum {
        return true;
    }
    let hdr = ExtentHeader::decode(block);
    let off = extent_tail_offset(hdr.max);
    if off + EXT4_EXT_TAIL_SIZE > block.len() {
        return false;
    }
    let stored = LittleEndian::read_u32(&block[off..off + EXT4_EXT_TAIL_SIZE]);
    stored == block_csum(&config.uuid, ino, generation, block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::node::TreeNode;
    use alloc::vec;

    fn csum_config() -> FsConfig {
        FsConfig {
            metadata_csum: true,
            uuid: [7u8; 16],
            ..FsConfig::with_block_size(1024)
        }
    }

    #[test]
    fn test_tail_offset() {
        assert_eq!(extent_tail_offset(84), 1020);
        assert_eq!(extent_tail_offset(340), 4092);
    }

    #[test]
    fn test_set_and_verify() {
        let config = csum_config();
        let mut block = vec![0u8; 1024];
        TreeNode::new_leaf(84).encode_into(&mut block);

        set_block_csum(&config, 12, 1, &mut block);
        assert!(verify_block_csum(&config, 12, 1, &block));
        // 不同 inode 的校验和不同
        assert!(!verify_block_csum(&config, 13, 1, &block));

        block[20] ^= 0xFF;
        assert!(!verify_block_csum(&config, 12, 1, &block));
    }

    #[test]
    fn test_disabled() {
        let config = FsConfig::with_block_size(1024);
        let mut block = vec![0u8; 1024];
        TreeNode::new_leaf(84).encode_into(&mut block);
        set_block_csum(&config, 1, 0, &mut block);
        assert!(block[1020..].iter().all(|&b| b == 0));
        assert!(verify_block_csum(&config, 1, 0, &block));
    }
}
