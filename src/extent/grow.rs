//! Extent 树深度增长
//!
//! 根节点在 inode 中，不能直接分裂。所有层都满时：
//! 1. 分配一个新块
//! 2. 把根节点的全部内容复制到新块
//! 3. 根节点变成只有一个索引的索引节点，指向新块
//! 4. 深度加一
//!
//! ```text
//! Before:
//! Root (in inode, depth=0)
//!   [extent1, extent2, extent3, extent4]
//!
//! After:
//! Root (in inode, depth=1)
//!   [index -> new_block]
//! new_block (depth=0)
//!   [extent1, extent2, extent3, extent4]
//! ```
//!
//! [`ExtentFs::create_new_leaf`] 在分裂和增长之间选择，是一个有界循环。

use super::map::GetBlocksFlags;
use super::node::{block_capacity, Node, TreeNode};
use super::path::ExtentPath;
use crate::balloc::{AllocFlags, AllocRequest, FreeFlags};
use crate::block::BlockDevice;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, InodeData};
use crate::transaction::Handle;
use crate::types::{Extent, ExtentIndex};
use alloc::vec;

/// 为新 extent 腾出空间的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpaceStep {
    /// 在第 `at` 层有空位，从该层往下分裂
    NeedSplit(usize),
    /// 每一层都满了
    NeedGrow,
    /// 结构已变化，重新查找路径后再判断
    Retry,
    /// 叶子有空位
    Done,
}

pub(crate) fn meta_alloc_flags(flags: GetBlocksFlags) -> AllocFlags {
    if flags.contains(GetBlocksFlags::METADATA_NOFAIL) {
        AllocFlags::METADATA_NOFAIL
    } else {
        AllocFlags::empty()
    }
}

impl<D: BlockDevice> ExtentFs<D> {
    /// 增加树深度
    ///
    /// # 错误
    ///
    /// - `NoSpace` - 无法分配新块，或已达到最大深度
    pub(crate) fn grow_indepth(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        newext: &Extent,
        flags: GetBlocksFlags,
    ) -> Result<()> {
        let old_depth = path.depth();
        if old_depth >= EXT4_EXT_MAX_DEPTH {
            log::error!(
                "[GROW_TREE] inode #{}: tree already at max depth {}",
                data.ino,
                old_depth
            );
            return Err(Error::new(ErrorKind::NoSpace, "Extent tree too deep"));
        }

        let goal = self.find_goal(data, path, newext.block);
        let newblock = self.alloc_meta_block(
            handle,
            &AllocRequest::metadata(goal, meta_alloc_flags(flags)),
        )?;
        log::debug!(
            "[GROW_TREE] inode #{}: depth {} -> {}, new block {}",
            data.ino,
            old_depth,
            old_depth + 1,
            newblock
        );

        if let Err(e) = self.move_root_to(handle, data, path, newblock) {
            if let Err(fe) =
                self.free_blocks(handle, newblock, 1, FreeFlags::METADATA | FreeFlags::FORGET)
            {
                log::warn!("[GROW_TREE] failed to free block {}: {}", newblock, fe);
            }
            return Err(e);
        }
        self.stats.inc_grows();
        Ok(())
    }

    fn move_root_to(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        newblock: u64,
    ) -> Result<()> {
        self.get_create_access(handle, newblock)?;

        let root = &path.levels[0].node;
        let mut moved = root.clone();
        moved.max = block_capacity(self.config.block_size);
        self.write_node(handle, data, Some(newblock), &moved)?;

        let key = root.first_key().unwrap_or(0);
        let mut new_root = TreeNode::new_index(EXT4_EXT_ROOT_CAPACITY, root.depth + 1);
        new_root.generation = root.generation;
        new_root.node = Node::Index(vec![ExtentIndex::new(key, newblock)]);
        self.write_node(handle, data, None, &new_root)?;
        path.levels[0].node = new_root;
        Ok(())
    }

    /// 叶子已满时腾出空间
    ///
    /// 从叶子往上找第一个有空位的层，找到就从那里分裂，否则增加深度；
    /// 每一步之后重新查找路径。每次分裂让叶子获得空位，每次增长让深度加一，
    /// 所以循环最多执行 `2 * (EXT4_EXT_MAX_DEPTH + 1)` 步。
    pub(crate) fn create_new_leaf(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        newext: &Extent,
        flags: GetBlocksFlags,
    ) -> Result<()> {
        let limit = 2 * (EXT4_EXT_MAX_DEPTH as usize + 1);
        let mut step = SpaceStep::Retry;

        for _ in 0..=limit {
            step = match step {
                SpaceStep::Done => return Ok(()),
                SpaceStep::Retry => {
                    let depth = path.leaf_index();
                    if path.leaf().node.has_room() {
                        SpaceStep::Done
                    } else {
                        match (0..depth).rev().find(|&i| path.level(i).node.has_room()) {
                            Some(at) => SpaceStep::NeedSplit(at),
                            None => SpaceStep::NeedGrow,
                        }
                    }
                }
                SpaceStep::NeedSplit(at) => {
                    self.split(handle, data, path, newext, at, flags)?;
                    self.refind(data, path, newext.block)?;
                    SpaceStep::Retry
                }
                SpaceStep::NeedGrow => {
                    self.grow_indepth(handle, data, path, newext, flags)?;
                    self.refind(data, path, newext.block)?;
                    SpaceStep::Retry
                }
            };
        }

        log::error!(
            "[EXT_INSERT] inode #{}: no room for {} after {} steps ({:?})",
            data.ino,
            newext.block,
            limit,
            step
        );
        Err(Error::new(ErrorKind::Corrupted, "Extent tree did not make room"))
    }
}
