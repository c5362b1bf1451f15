//! 树初始化与整体检查

use super::node::{Node, TreeNode};
use super::verify::{check_header, report_corruption};
use crate::block::BlockDevice;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, InodeData};
use crate::types::ExtentHeader;

/// 在 inode 中写入空的根叶子
pub fn tree_init(data: &mut InodeData) {
    data.i_block = [0u8; EXT4_INODE_BLOCK_SIZE];
    TreeNode::new_leaf(EXT4_EXT_ROOT_CAPACITY).encode_into(&mut data.i_block);
    data.cache().invalidate();
}

/// 检查 inode 中的根节点头部
///
/// # 错误
///
/// - `Corrupted` - 魔数、深度或容量非法
pub fn check_inode(data: &InodeData) -> Result<()> {
    let hdr = ExtentHeader::decode(&data.i_block);
    let depth = hdr.depth.min(EXT4_EXT_MAX_DEPTH);
    if let Err(e) = check_header(&hdr, depth, EXT4_EXT_ROOT_CAPACITY) {
        report_corruption(data.ino, 0, &data.i_block, depth, EXT4_EXT_ROOT_CAPACITY, e);
        return Err(e.into());
    }
    Ok(())
}

fn bad_key(ino: u32, pblk: Option<u64>, block: u32) -> Error {
    log::error!(
        "[EXT_VERIFY] inode #{}: node {:?}: key {} outside parent range",
        ino,
        pblk,
        block
    );
    Error::new(ErrorKind::Corrupted, "Extent key outside parent range")
}

impl<D: BlockDevice> ExtentFs<D> {
    /// 遍历整棵树，检查每个节点
    ///
    /// 除了读取时的头部、条目和校验和检查，还要求每个子树的键落在
    /// 父索引给出的范围内：不小于自己的索引键（第一个子树除外），
    /// 并且在下一个索引键之前结束。索引节点的子节点不能为空。
    ///
    /// # 返回
    ///
    /// 树中 extent 的个数
    pub fn verify_tree(&self, data: &InodeData) -> Result<usize> {
        let root = self.read_root(data)?;
        let count = self.verify_node(data, None, &root, None, EXT_MAX_BLOCKS as u64 + 1)?;
        log::trace!("[EXT_VERIFY] inode #{}: {} extents", data.ino, count);
        Ok(count)
    }

    fn verify_node(
        &self,
        data: &InodeData,
        pblk: Option<u64>,
        node: &TreeNode,
        lo: Option<u32>,
        hi: u64,
    ) -> Result<usize> {
        match &node.node {
            Node::Leaf(extents) => {
                for ex in extents {
                    if lo.is_some_and(|lo| ex.block < lo) || ex.end() > hi {
                        return Err(bad_key(data.ino, pblk, ex.block));
                    }
                }
                Ok(extents.len())
            }
            Node::Index(indexes) => {
                let mut count = 0;
                for (i, ix) in indexes.iter().enumerate() {
                    if lo.is_some_and(|lo| ix.block < lo) || ix.block as u64 >= hi {
                        return Err(bad_key(data.ino, pblk, ix.block));
                    }
                    let child_lo = if i == 0 { lo } else { Some(ix.block) };
                    let child_hi = indexes.get(i + 1).map_or(hi, |next| next.block as u64);

                    let (child, _pin) = self.read_extent_block(data, ix.leaf(), node.depth - 1)?;
                    if child.node.is_empty() {
                        log::error!(
                            "[EXT_VERIFY] inode #{}: empty node {} under index {}",
                            data.ino,
                            ix.leaf(),
                            ix.block
                        );
                        return Err(Error::new(ErrorKind::Corrupted, "Empty extent node"));
                    }
                    count += self.verify_node(data, Some(ix.leaf()), &child, child_lo, child_hi)?;
                }
                Ok(count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ExtentInode;
    use crate::test_utils::*;
    use crate::types::Extent;

    #[test]
    fn test_tree_init() {
        let inode = ExtentInode::new(12);
        let data = inode.read();
        let hdr = ExtentHeader::decode(&data.i_block);
        assert!(hdr.is_valid_magic());
        assert_eq!((hdr.entries, hdr.max, hdr.depth), (0, 4, 0));
        assert!(check_inode(&data).is_ok());
    }

    #[test]
    fn test_check_inode_rejects_bad_root() {
        let inode = ExtentInode::new(12);
        let mut data = inode.write();
        data.i_block[0] = 0;
        assert_eq!(check_inode(&data).unwrap_err().kind(), ErrorKind::Corrupted);

        tree_init(&mut data);
        // eh_entries > eh_max
        data.i_block[2] = 5;
        assert_eq!(check_inode(&data).unwrap_err().kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_verify_multilevel() {
        let t = test_fs();
        let inode = t.new_inode(12);
        for i in 0..200u32 {
            t.insert(&inode, Extent::new(i * 4, 2, 1000 + i as u64 * 4)).unwrap();
        }
        assert!(tree_depth(&inode) >= 1);
        assert_eq!(t.verify_tree(&inode.read()).unwrap(), 200);
    }

    #[test]
    fn test_verify_detects_bad_index_key() {
        let t = test_fs();
        let inode = t.new_inode(12);
        for i in 0..100u32 {
            t.insert(&inode, Extent::new(i * 4, 2, 1000 + i as u64 * 4)).unwrap();
        }
        assert_eq!(tree_depth(&inode), 1);

        let mut data = inode.write();
        let mut root = TreeNode::decode(&data.i_block);
        match &mut root.node {
            Node::Index(v) => {
                assert!(v.len() >= 2);
                v[1].block += 1;
            }
            Node::Leaf(_) => panic!("expected index root"),
        }
        root.encode_into(&mut data.i_block);
        assert_eq!(t.verify_tree(&data).unwrap_err().kind(), ErrorKind::Corrupted);
    }
}
