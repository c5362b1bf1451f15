//! Extent 节点完整性检查
//!
//! 任何从磁盘读入的节点在使用前都要经过 [`check_node`]：
//! - 魔数检查
//! - 深度必须等于调用者根据遍历位置推出的深度
//! - 容量不能超过该位置节点的结构容量
//! - 条目数不超过容量
//! - 每个条目引用的物理块必须落在合法数据区内，且键严格递增
//!
//! 检查失败以 `Corrupted` 上报，从不自动修复。

use super::node::{Node, TreeNode};
use crate::balloc::SystemZone;
use crate::error::{Error, ErrorKind};
use crate::types::ExtentHeader;

/// 节点检查错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentCheckError {
    /// 魔数错误
    InvalidMagic,
    /// 深度与遍历位置不符
    UnexpectedDepth,
    /// 容量为 0 或超过结构容量
    InvalidMaxEntries,
    /// 条目数超过容量
    InvalidEntriesCount,
    /// 条目引用非法物理块或键未排序
    InvalidEntry,
    /// 校验和不匹配
    ChecksumMismatch,
}

impl ExtentCheckError {
    /// 错误描述
    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidMagic => "invalid magic",
            Self::UnexpectedDepth => "unexpected eh_depth",
            Self::InvalidMaxEntries => "invalid eh_max",
            Self::InvalidEntriesCount => "invalid eh_entries",
            Self::InvalidEntry => "invalid extent entries",
            Self::ChecksumMismatch => "extent tree corrupted (checksum)",
        }
    }
}

impl From<ExtentCheckError> for Error {
    fn from(e: ExtentCheckError) -> Self {
        Error::new(ErrorKind::Corrupted, e.message())
    }
}

/// 只检查头部
pub fn check_header(
    hdr: &ExtentHeader,
    expected_depth: u16,
    capacity: u16,
) -> Result<(), ExtentCheckError> {
    if !hdr.is_valid_magic() {
        return Err(ExtentCheckError::InvalidMagic);
    }
    if hdr.depth != expected_depth {
        return Err(ExtentCheckError::UnexpectedDepth);
    }
    if hdr.max == 0 || hdr.max > capacity {
        return Err(ExtentCheckError::InvalidMaxEntries);
    }
    if hdr.entries > hdr.max {
        return Err(ExtentCheckError::InvalidEntriesCount);
    }
    Ok(())
}

fn check_entries(node: &TreeNode, zone: &SystemZone) -> Result<(), ExtentCheckError> {
    match &node.node {
        Node::Leaf(extents) => {
            let mut prev_end = 0u64;
            for (i, ex) in extents.iter().enumerate() {
                let len = ex.actual_len();
                if len == 0 || !zone.data_block_valid(ex.pblock(), len as u64) {
                    return Err(ExtentCheckError::InvalidEntry);
                }
                if i > 0 && (ex.block as u64) < prev_end {
                    return Err(ExtentCheckError::InvalidEntry);
                }
                prev_end = ex.end();
            }
        }
        Node::Index(indexes) => {
            for (i, ix) in indexes.iter().enumerate() {
                if !zone.data_block_valid(ix.leaf(), 1) {
                    return Err(ExtentCheckError::InvalidEntry);
                }
                if i > 0 && ix.block <= indexes[i - 1].block {
                    return Err(ExtentCheckError::InvalidEntry);
                }
            }
        }
    }
    Ok(())
}

/// 检查并解码节点
///
/// # 参数
///
/// * `buf` - 节点字节（inode 的 `i_block` 或整个块）
/// * `expected_depth` - 遍历位置推出的深度
/// * `capacity` - 该位置节点的结构容量
/// * `zone` - 合法数据区
pub fn check_node(
    buf: &[u8],
    expected_depth: u16,
    capacity: u16,
    zone: &SystemZone,
) -> Result<TreeNode, ExtentCheckError> {
    let hdr = ExtentHeader::decode(buf);
    check_header(&hdr, expected_depth, capacity)?;
    let node = TreeNode::decode(buf);
    check_entries(&node, zone)?;
    Ok(node)
}

/// 按 `EXT4_ERROR_INODE` 的格式记录损坏
pub fn report_corruption(
    ino: u32,
    pblk: u64,
    buf: &[u8],
    expected_depth: u16,
    capacity: u16,
    err: ExtentCheckError,
) {
    let hdr = ExtentHeader::decode(buf);
    log::error!(
        "[EXT_PATH] inode #{}: pblk {}: bad header/extent: {} - magic {:#x}, entries {}, max {}({}), depth {}({})",
        ino,
        pblk,
        err.message(),
        hdr.magic,
        hdr.entries,
        hdr.max,
        capacity,
        hdr.depth,
        expected_depth
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Extent, ExtentIndex};
    use alloc::vec;

    fn zone() -> SystemZone {
        let mut zone = SystemZone::new(1, 10_000);
        zone.reserve(1, 99);
        zone
    }

    fn leaf_buf(extents: &[Extent]) -> [u8; 60] {
        let mut node = TreeNode::new_leaf(4);
        node.node = Node::Leaf(extents.to_vec());
        let mut buf = [0u8; 60];
        node.encode_into(&mut buf);
        buf
    }

    #[test]
    fn test_valid_leaf() {
        let buf = leaf_buf(&[Extent::new(0, 10, 1000), Extent::new(10, 5, 2000)]);
        let node = check_node(&buf, 0, 4, &zone()).unwrap();
        assert_eq!(node.entries(), 2);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = leaf_buf(&[]);
        buf[0] = 0;
        assert_eq!(
            check_node(&buf, 0, 4, &zone()).unwrap_err(),
            ExtentCheckError::InvalidMagic
        );
    }

    #[test]
    fn test_depth_mismatch() {
        let buf = leaf_buf(&[]);
        assert_eq!(
            check_node(&buf, 1, 4, &zone()).unwrap_err(),
            ExtentCheckError::UnexpectedDepth
        );
    }

    #[test]
    fn test_max_and_entries() {
        let mut hdr = ExtentHeader::new(5, 0);
        assert_eq!(check_header(&hdr, 0, 4), Err(ExtentCheckError::InvalidMaxEntries));
        hdr.max = 0;
        assert_eq!(check_header(&hdr, 0, 4), Err(ExtentCheckError::InvalidMaxEntries));
        hdr.max = 4;
        hdr.entries = 5;
        assert_eq!(check_header(&hdr, 0, 4), Err(ExtentCheckError::InvalidEntriesCount));
    }

    #[test]
    fn test_entry_in_reserved_area() {
        let buf = leaf_buf(&[Extent::new(0, 10, 50)]);
        assert_eq!(
            check_node(&buf, 0, 4, &zone()).unwrap_err(),
            ExtentCheckError::InvalidEntry
        );
    }

    #[test]
    fn test_overlapping_extents() {
        let buf = leaf_buf(&[Extent::new(0, 10, 1000), Extent::new(5, 5, 2000)]);
        assert_eq!(
            check_node(&buf, 0, 4, &zone()).unwrap_err(),
            ExtentCheckError::InvalidEntry
        );
    }

    #[test]
    fn test_index_entries() {
        let mut node = TreeNode::new_index(4, 1);
        node.node = Node::Index(vec![ExtentIndex::new(0, 500), ExtentIndex::new(0, 501)]);
        let mut buf = [0u8; 60];
        node.encode_into(&mut buf);
        assert_eq!(
            check_node(&buf, 1, 4, &zone()).unwrap_err(),
            ExtentCheckError::InvalidEntry
        );

        let err: Error = ExtentCheckError::InvalidEntry.into();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }
}
