//! 路径游标
//!
//! [`ExtentPath`] 记录一次从根到叶子的遍历：每一层的节点副本、
//! 当前位置，以及该层所在块的 [`BlockPin`]。句柄随层一起 drop，
//! 错误提前返回时也会释放，不存在手工配对的 get/put。
//!
//! 第 0 层是 inode 内的根节点，没有块也没有句柄；第 `depth` 层是叶子。

use super::checksum::{set_block_csum, verify_block_csum};
use super::node::{block_capacity, Node, TreeNode};
use super::verify::{check_node, report_corruption, ExtentCheckError};
use crate::block::{BlockDevice, BlockPin};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, InodeData};
use crate::transaction::{DirtyTarget, Handle};
use crate::types::{Extent, ExtentHeader, ExtentIndex};
use alloc::vec;
use alloc::vec::Vec;

/// 路径中的一层
#[derive(Debug)]
pub struct PathLevel {
    /// 节点所在物理块，根节点为 `None`
    pub block: Option<u64>,
    /// 节点内容
    pub node: TreeNode,
    /// 当前条目位置；空叶子为 `None`
    pub pos: Option<usize>,
    pin: Option<BlockPin>,
}

impl PathLevel {
    pub(crate) fn new(block: Option<u64>, node: TreeNode, pin: Option<BlockPin>) -> Self {
        Self {
            block,
            node,
            pos: None,
            pin,
        }
    }

    /// 叶子条目
    pub fn extents(&self) -> Result<&[Extent]> {
        match &self.node.node {
            Node::Leaf(v) => Ok(v),
            Node::Index(_) => Err(Error::new(ErrorKind::Corrupted, "Expected leaf node")),
        }
    }

    /// 叶子条目（可变）
    pub fn extents_mut(&mut self) -> Result<&mut Vec<Extent>> {
        match &mut self.node.node {
            Node::Leaf(v) => Ok(v),
            Node::Index(_) => Err(Error::new(ErrorKind::Corrupted, "Expected leaf node")),
        }
    }

    /// 索引条目
    pub fn indexes(&self) -> Result<&[ExtentIndex]> {
        match &self.node.node {
            Node::Index(v) => Ok(v),
            Node::Leaf(_) => Err(Error::new(ErrorKind::Corrupted, "Expected index node")),
        }
    }

    /// 索引条目（可变）
    pub fn indexes_mut(&mut self) -> Result<&mut Vec<ExtentIndex>> {
        match &mut self.node.node {
            Node::Index(v) => Ok(v),
            Node::Leaf(_) => Err(Error::new(ErrorKind::Corrupted, "Expected index node")),
        }
    }

    /// 条目数
    pub fn entries(&self) -> usize {
        self.node.node.len()
    }

    /// 是否持有块句柄
    pub fn is_pinned(&self) -> bool {
        self.pin.is_some()
    }
}

/// 根到叶子的路径
#[derive(Debug)]
pub struct ExtentPath {
    depth: u16,
    pub(crate) levels: Vec<PathLevel>,
}

impl ExtentPath {
    /// 树深度
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// 叶子层下标
    pub fn leaf_index(&self) -> usize {
        self.depth as usize
    }

    /// 第 `i` 层
    pub fn level(&self, i: usize) -> &PathLevel {
        &self.levels[i]
    }

    /// 第 `i` 层（可变）
    pub fn level_mut(&mut self, i: usize) -> &mut PathLevel {
        &mut self.levels[i]
    }

    /// 已加载的层数
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// 是否一层都没有
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// 叶子层
    pub fn leaf(&self) -> &PathLevel {
        &self.levels[self.depth as usize]
    }

    /// 叶子层（可变）
    pub fn leaf_mut(&mut self) -> &mut PathLevel {
        let d = self.depth as usize;
        &mut self.levels[d]
    }

    /// 叶子当前位置的 extent
    pub fn extent(&self) -> Option<Extent> {
        let leaf = self.levels.get(self.depth as usize)?;
        let pos = leaf.pos?;
        leaf.extents().ok()?.get(pos).copied()
    }

    /// 释放所有块句柄（可以重复调用）
    pub fn release(&mut self) {
        for level in &mut self.levels {
            level.pin = None;
        }
    }

    /// 当前位置之后的下一个已分配逻辑块
    ///
    /// 先看叶子中的下一个 extent，再逐层向上看下一个索引。
    /// 都没有时返回 [`EXT_MAX_BLOCKS`]。
    pub fn next_allocated_block(&self) -> u32 {
        let depth = self.depth as usize;
        if depth == 0 && self.extent().is_none() {
            return EXT_MAX_BLOCKS;
        }
        for d in (0..=depth).rev() {
            let level = &self.levels[d];
            let Some(pos) = level.pos else { continue };
            if let Some(key) = level.node.node.key(pos + 1) {
                return key;
            }
        }
        EXT_MAX_BLOCKS
    }

    /// 下一个叶子覆盖的第一个逻辑块
    pub fn next_leaf_block(&self) -> u32 {
        let depth = self.depth as usize;
        if depth == 0 {
            return EXT_MAX_BLOCKS;
        }
        for d in (0..depth).rev() {
            let level = &self.levels[d];
            let Some(pos) = level.pos else { continue };
            if let Some(key) = level.node.node.key(pos + 1) {
                return key;
            }
        }
        EXT_MAX_BLOCKS
    }
}

/// 索引二分查找：最右一个 `key <= block` 的条目，第一个条目总是下界
pub(crate) fn binsearch_idx(indexes: &[ExtentIndex], block: u32) -> usize {
    indexes[1..].partition_point(|ix| ix.block <= block)
}

/// 叶子二分查找：同上，空叶子返回 `None`
pub(crate) fn binsearch_extent(extents: &[Extent], block: u32) -> Option<usize> {
    if extents.is_empty() {
        return None;
    }
    Some(extents[1..].partition_point(|ex| ex.block <= block))
}

impl<D: BlockDevice> ExtentFs<D> {
    /// 解码并检查 inode 中的根节点
    pub(crate) fn read_root(&self, data: &InodeData) -> Result<TreeNode> {
        let hdr = ExtentHeader::decode(&data.i_block);
        if hdr.depth > EXT4_EXT_MAX_DEPTH {
            report_corruption(
                data.ino,
                0,
                &data.i_block,
                hdr.depth,
                EXT4_EXT_ROOT_CAPACITY,
                ExtentCheckError::UnexpectedDepth,
            );
            return Err(ExtentCheckError::UnexpectedDepth.into());
        }
        check_node(&data.i_block, hdr.depth, EXT4_EXT_ROOT_CAPACITY, &self.zone).map_err(|e| {
            report_corruption(data.ino, 0, &data.i_block, hdr.depth, EXT4_EXT_ROOT_CAPACITY, e);
            Error::from(e)
        })
    }

    /// 读取并检查 extent 块
    ///
    /// 缓存中已经通过检查的块不再重复检查。
    ///
    /// # 错误
    ///
    /// - `Io` - 读取失败
    /// - `Corrupted` - 头部、条目或校验和非法
    pub(crate) fn read_extent_block(
        &self,
        data: &InodeData,
        pblk: u64,
        expected_depth: u16,
    ) -> Result<(TreeNode, BlockPin)> {
        let capacity = block_capacity(self.config.block_size);
        let mut bdev = self.bdev.lock();
        let pin = bdev.pin(pblk);
        let bd = bdev.read_block(pblk)?;
        if bd.verified {
            let node = TreeNode::decode(&bd.data);
            if node.depth != expected_depth {
                report_corruption(
                    data.ino,
                    pblk,
                    &bd.data,
                    expected_depth,
                    capacity,
                    ExtentCheckError::UnexpectedDepth,
                );
                return Err(ExtentCheckError::UnexpectedDepth.into());
            }
            return Ok((node, pin));
        }

        let node = check_node(&bd.data, expected_depth, capacity, &self.zone).map_err(|e| {
            report_corruption(data.ino, pblk, &bd.data, expected_depth, capacity, e);
            Error::from(e)
        })?;
        if !verify_block_csum(&self.config, data.ino, data.generation, &bd.data) {
            report_corruption(
                data.ino,
                pblk,
                &bd.data,
                expected_depth,
                capacity,
                ExtentCheckError::ChecksumMismatch,
            );
            return Err(ExtentCheckError::ChecksumMismatch.into());
        }
        bdev.set_verified(pblk);
        Ok((node, pin))
    }

    /// 查找覆盖 `block` 的路径
    ///
    /// # 参数
    ///
    /// * `data` - inode 数据（调用者持有数据锁）
    /// * `block` - 目标逻辑块
    /// * `reuse` - 可复用的旧路径，其句柄在此释放
    ///
    /// # 返回
    ///
    /// 长度为 `depth + 1` 的路径。每层选择最右一个键不大于 `block` 的条目；
    /// 叶子为空时位置为 `None`。
    pub fn find_extent(
        &self,
        data: &InodeData,
        block: u32,
        reuse: Option<ExtentPath>,
    ) -> Result<ExtentPath> {
        self.stats.inc_tree_walks();

        let root = self.read_root(data)?;
        let depth = root.depth;

        let mut levels = reuse.map(|p| p.levels).unwrap_or_default();
        levels.clear();
        levels.reserve(depth as usize + 1);
        levels.push(PathLevel::new(None, root, None));

        for i in 0..depth as usize {
            let level = &mut levels[i];
            let indexes = level.indexes()?;
            if indexes.is_empty() {
                log::error!(
                    "[EXT_PATH] inode #{}: empty index node at depth {}",
                    data.ino,
                    depth as usize - i
                );
                return Err(Error::new(ErrorKind::Corrupted, "Empty index node"));
            }
            let pos = binsearch_idx(indexes, block);
            let child = indexes[pos].leaf();
            level.pos = Some(pos);
            log::trace!(
                "[EXT_PATH] level {} idx {} -> block {} (lblk {})",
                i,
                pos,
                child,
                block
            );

            let (node, pin) = self.read_extent_block(data, child, depth - i as u16 - 1)?;
            levels.push(PathLevel::new(Some(child), node, Some(pin)));
        }

        let leaf = &mut levels[depth as usize];
        leaf.pos = binsearch_extent(leaf.extents()?, block);

        Ok(ExtentPath { depth, levels })
    }

    /// 复用 `path` 的缓冲重新查找 `block`
    ///
    /// 树结构变化之后调用。失败时 `path` 被清空，不能再使用。
    pub(crate) fn refind(&self, data: &InodeData, path: &mut ExtentPath, block: u32) -> Result<()> {
        let old = core::mem::replace(
            path,
            ExtentPath {
                depth: 0,
                levels: Vec::new(),
            },
        );
        *path = self.find_extent(data, block, Some(old))?;
        Ok(())
    }

    /// 只含根节点的路径（不遍历）
    pub(crate) fn root_path(&self, data: &InodeData) -> Result<ExtentPath> {
        let root = self.read_root(data)?;
        Ok(ExtentPath {
            depth: root.depth,
            levels: vec![PathLevel::new(None, root, None)],
        })
    }

    /// 修改第 `level` 层之前获取写权限
    ///
    /// 根节点在 inode 中，由 inode 的标脏覆盖。
    pub(crate) fn ext_get_access(
        &self,
        handle: &mut Handle,
        path: &ExtentPath,
        level: usize,
    ) -> Result<()> {
        match path.levels[level].block {
            Some(b) => self.get_write_access(handle, b),
            None => Ok(()),
        }
    }

    /// 把第 `level` 层写回并标脏
    pub(crate) fn ext_dirty(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &ExtentPath,
        level: usize,
    ) -> Result<()> {
        let lv = &path.levels[level];
        self.write_node(handle, data, lv.block, &lv.node)
    }

    /// 编码节点：根写入 `i_block`，其余写入块缓存
    pub(crate) fn write_node(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        block: Option<u64>,
        node: &TreeNode,
    ) -> Result<()> {
        match block {
            None => {
                node.encode_into(&mut data.i_block);
                self.mark_inode_dirty(handle, data)
            }
            Some(b) => {
                let mut buf = vec![0u8; self.config.block_size as usize];
                node.encode_into(&mut buf);
                set_block_csum(&self.config, data.ino, data.generation, &mut buf);
                self.bdev.lock().write_block(b, &buf);
                self.mark_dirty(handle, DirtyTarget::Block(b))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_binsearch_rightmost() {
        let idx = [
            ExtentIndex::new(0, 1),
            ExtentIndex::new(100, 2),
            ExtentIndex::new(200, 3),
        ];
        assert_eq!(binsearch_idx(&idx, 0), 0);
        assert_eq!(binsearch_idx(&idx, 99), 0);
        assert_eq!(binsearch_idx(&idx, 100), 1);
        assert_eq!(binsearch_idx(&idx, 150), 1);
        assert_eq!(binsearch_idx(&idx, 5000), 2);

        let ex = [Extent::new(10, 5, 1000), Extent::new(20, 5, 2000)];
        // 第一个条目是下界，即使目标在它之前
        assert_eq!(binsearch_extent(&ex, 3), Some(0));
        assert_eq!(binsearch_extent(&ex, 17), Some(0));
        assert_eq!(binsearch_extent(&ex, 20), Some(1));
        assert_eq!(binsearch_extent(&[], 20), None);
    }

    #[test]
    fn test_find_in_empty_tree() {
        let t = test_fs();
        let inode = t.new_inode(12);
        let data = inode.read();
        let path = t.find_extent(&data, 5, None).unwrap();
        assert_eq!(path.depth(), 0);
        assert_eq!(path.len(), 1);
        assert!(path.extent().is_none());
        assert_eq!(path.next_allocated_block(), EXT_MAX_BLOCKS);
        assert_eq!(path.next_leaf_block(), EXT_MAX_BLOCKS);
    }

    #[test]
    fn test_find_multi_level_and_release_pins() {
        let t = test_fs();
        let inode = t.new_inode(12);
        // 200 个不可合并的单块 extent，需要两层
        for i in 0..200u32 {
            t.insert(&inode, Extent::new(i * 2, 1, 1000 + i as u64 * 2)).unwrap();
        }

        let data = inode.read();
        let mut path = t.find_extent(&data, 151, None).unwrap();
        assert_eq!(path.depth(), 1);
        assert_eq!(path.extent().unwrap().block, 150);
        assert_eq!(path.next_allocated_block(), 152);
        assert!(path.level(1).is_pinned());
        assert!(!path.level(0).is_pinned());
        assert!(t.with_bdev(|b| b.pins().outstanding()) > 0);

        path.release();
        path.release();
        assert_eq!(t.with_bdev(|b| b.pins().outstanding()), 0);

        let path = t.find_extent(&data, 10, Some(path)).unwrap();
        assert_eq!(path.extent().unwrap().block, 10);
        drop(path);
        assert_eq!(t.with_bdev(|b| b.pins().outstanding()), 0);
    }

    #[test]
    fn test_pins_released_on_error() {
        let t = test_fs();
        let inode = t.new_inode(12);
        for i in 0..10u32 {
            t.insert(&inode, Extent::new(i * 2, 1, 1000 + i as u64 * 2)).unwrap();
        }
        let data = inode.read();
        let path = t.find_extent(&data, 0, None).unwrap();
        let leaf = path.level(1).block.unwrap();
        drop(path);
        t.sync().unwrap();

        // 把叶子的魔数改坏，并让缓存重新读盘
        t.with_bdev(|b| {
            b.discard(leaf);
            b.device_mut().raw_block_mut(leaf)[0] = 0;
        });
        let err = t.find_extent(&data, 0, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
        assert_eq!(t.with_bdev(|b| b.pins().outstanding()), 0);
    }

    #[test]
    fn test_root_depth_mismatch_is_corrupt() {
        let t = test_fs();
        let inode = t.new_inode(12);
        let mut data = inode.write();
        // 深度 1 但没有索引条目
        let hdr = ExtentHeader::new(4, 1);
        hdr.encode(&mut data.i_block[..12]);
        let err = t.find_extent(&data, 0, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_next_leaf_block() {
        let t = test_fs();
        let inode = t.new_inode(12);
        for i in 0..100u32 {
            t.insert(&inode, Extent::new(i * 2, 1, 1000 + i as u64 * 2)).unwrap();
        }
        let data = inode.read();
        let path = t.find_extent(&data, 0, None).unwrap();
        assert_eq!(path.depth(), 1);
        let second = path.level(0).indexes().unwrap()[1].block;
        assert_eq!(path.next_leaf_block(), second);

        let path = t.find_extent(&data, 198, Some(path)).unwrap();
        assert_eq!(path.next_leaf_block(), EXT_MAX_BLOCKS);
        assert_eq!(path.next_allocated_block(), EXT_MAX_BLOCKS);
    }
}
