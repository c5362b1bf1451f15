//! 节点分裂
//!
//! 叶子满而路径上第 `at` 层还有空位时，从第 `at + 1` 层到叶子每层分配一个新块，
//! 把当前位置之后的条目移到新块，再在第 `at` 层插入指向新子树的索引：
//!
//! ```text
//! Before (at = 0):
//! Root   [idx 0 -> A]
//! A      [e0 e1 e2 | e3 e4 e5]        cursor at e2, border = e3
//!
//! After:
//! Root   [idx 0 -> A, idx e3 -> B]
//! A      [e0 e1 e2]
//! B      [e3 e4 e5]
//! ```
//!
//! 光标在叶子最后一个条目时，新叶子为空，边界取新 extent 的起点。

use super::grow::meta_alloc_flags;
use super::map::GetBlocksFlags;
use super::node::{block_capacity, Node, TreeNode};
use super::path::ExtentPath;
use crate::balloc::{AllocRequest, FreeFlags};
use crate::block::BlockDevice;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, InodeData};
use crate::transaction::Handle;
use crate::types::{Extent, ExtentIndex};
use alloc::vec;
use alloc::vec::Vec;

impl<D: BlockDevice> ExtentFs<D> {
    /// 从第 `at` 层往下分裂
    ///
    /// 调用者保证第 `at` 层有空位、更深的层都已满。
    /// 返回后路径中的节点不再与树一致，需要重新查找。
    ///
    /// # 错误
    ///
    /// - `NoSpace` - 分配不到新块
    /// - `Corrupted` - 需要分裂的层没有满
    pub(crate) fn split(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        newext: &Extent,
        at: usize,
        flags: GetBlocksFlags,
    ) -> Result<()> {
        let depth = path.leaf_index();
        let leaf = path.leaf();
        let border = match leaf.pos {
            Some(p) if p + 1 < leaf.entries() => {
                let b = leaf.extents()?[p + 1].block;
                log::debug!("[EXT_SPLIT] leaf will be split, next leaf starts at {}", b);
                b
            }
            _ => {
                log::debug!(
                    "[EXT_SPLIT] leaf will be added, next leaf starts at {}",
                    newext.block
                );
                newext.block
            }
        };

        let mut ablocks: Vec<u64> = Vec::with_capacity(depth - at);
        let result = self
            .alloc_split_blocks(handle, data, path, newext, depth - at, flags, &mut ablocks)
            .and_then(|()| self.split_into(handle, data, path, at, border, &ablocks));

        if let Err(e) = result {
            for &b in &ablocks {
                let freed = self.free_blocks(handle, b, 1, FreeFlags::METADATA | FreeFlags::FORGET);
                if let Err(fe) = freed {
                    log::warn!("[EXT_SPLIT] failed to free block {}: {}", b, fe);
                }
            }
            return Err(e);
        }
        self.stats.inc_splits();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn alloc_split_blocks(
        &self,
        handle: &mut Handle,
        data: &InodeData,
        path: &ExtentPath,
        newext: &Extent,
        count: usize,
        flags: GetBlocksFlags,
        ablocks: &mut Vec<u64>,
    ) -> Result<()> {
        let goal = self.find_goal(data, path, newext.block);
        for _ in 0..count {
            let b = self.alloc_meta_block(
                handle,
                &AllocRequest::metadata(goal, meta_alloc_flags(flags)),
            )?;
            ablocks.push(b);
        }
        Ok(())
    }

    fn split_into(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        at: usize,
        border: u32,
        ablocks: &[u64],
    ) -> Result<()> {
        let depth = path.leaf_index();
        let capacity = block_capacity(self.config.block_size);
        let mut a = ablocks.len();

        // 叶子
        let leaf = path.leaf();
        if !leaf.node.is_full() {
            log::error!(
                "[EXT_SPLIT] inode #{}: leaf has {} of {} entries",
                data.ino,
                leaf.entries(),
                leaf.node.max
            );
            return Err(Error::new(ErrorKind::Corrupted, "Splitting a non-full leaf"));
        }
        let pos = leaf.pos.unwrap_or(0);
        let moving = leaf.entries() - (pos + 1);

        a -= 1;
        let mut newblock = ablocks[a];
        let moved: Vec<Extent> = if moving > 0 {
            self.ext_get_access(handle, path, depth)?;
            path.leaf_mut().extents_mut()?.split_off(pos + 1)
        } else {
            Vec::new()
        };
        let mut node = TreeNode::new_leaf(capacity);
        node.node = Node::Leaf(moved);
        self.get_create_access(handle, newblock)?;
        self.write_node(handle, data, Some(newblock), &node)?;
        if moving > 0 {
            self.ext_dirty(handle, data, path, depth)?;
        }
        log::debug!(
            "[EXT_SPLIT] moved {} extents to new leaf {}",
            moving,
            newblock
        );

        // 中间的索引层
        for i in (at + 1..depth).rev() {
            let oldblock = newblock;
            a -= 1;
            newblock = ablocks[a];

            let level = &path.levels[i];
            if !level.node.is_full() {
                log::error!(
                    "[EXT_SPLIT] inode #{}: index at level {} has {} of {} entries",
                    data.ino,
                    i,
                    level.entries(),
                    level.node.max
                );
                return Err(Error::new(ErrorKind::Corrupted, "Splitting a non-full index"));
            }
            let ipos = level.pos.unwrap_or(0);
            let moving = level.entries() - (ipos + 1);

            let mut entries = vec![ExtentIndex::new(border, oldblock)];
            if moving > 0 {
                self.ext_get_access(handle, path, i)?;
                entries.extend(path.levels[i].indexes_mut()?.split_off(ipos + 1));
            }
            let mut node = TreeNode::new_index(capacity, (depth - i) as u16);
            node.node = Node::Index(entries);
            self.get_create_access(handle, newblock)?;
            self.write_node(handle, data, Some(newblock), &node)?;
            if moving > 0 {
                self.ext_dirty(handle, data, path, i)?;
            }
            log::debug!(
                "[EXT_SPLIT] level {}: moved {} indexes to new block {}",
                i,
                moving,
                newblock
            );
        }

        self.insert_index(handle, data, path, at, border, newblock)
    }
}
