//! Extent 插入
//!
//! [`ExtentFs::insert_extent`] 把一个新 extent 放进路径指向的叶子：
//!
//! 1. 能与当前位置的 extent 合并时原地扩展，不增加条目
//! 2. 叶子满且新 extent 在叶子末尾之后时，先看下一个叶子有没有空位
//! 3. 仍然没有空位则分裂或增加深度（[`ExtentFs::create_new_leaf`]）
//! 4. 按顺序插入，再尝试与邻居合并
//! 5. 叶子第一个条目变化时修正上层索引

use super::map::GetBlocksFlags;
use super::merge::{can_be_merged, try_to_merge};
use super::path::ExtentPath;
use crate::block::BlockDevice;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, InodeData};
use crate::transaction::Handle;
use crate::types::{Extent, ExtentIndex};

impl<D: BlockDevice> ExtentFs<D> {
    /// 在第 `at` 层插入索引条目 `[logical -> ptr]`
    ///
    /// # 错误
    ///
    /// - `Corrupted` - 键与当前索引重复，或节点已满
    pub(crate) fn insert_index(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        at: usize,
        logical: u32,
        ptr: u64,
    ) -> Result<()> {
        let level = &path.levels[at];
        let pos = level
            .pos
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "Index position missing"))?;
        let cur = level.indexes()?[pos].block;
        if logical == cur {
            log::error!(
                "[EXT_INSERT] inode #{}: logical {} == ei_block {}",
                data.ino,
                logical,
                cur
            );
            return Err(Error::new(ErrorKind::Corrupted, "Duplicate index key"));
        }
        if level.node.is_full() {
            log::error!(
                "[EXT_INSERT] inode #{}: no free index entry at level {}",
                data.ino,
                at
            );
            return Err(Error::new(ErrorKind::Corrupted, "Index node is full"));
        }

        self.ext_get_access(handle, path, at)?;
        let ix = if logical > cur { pos + 1 } else { pos };
        path.levels[at]
            .indexes_mut()?
            .insert(ix, ExtentIndex::new(logical, ptr));
        log::trace!(
            "[EXT_INSERT] index {} -> {} at level {} slot {}",
            logical,
            ptr,
            at,
            ix
        );
        self.ext_dirty(handle, data, path, at)
    }

    /// 插入 extent
    ///
    /// # 参数
    ///
    /// * `handle` - 事务句柄
    /// * `data` - inode 数据（调用者持有写锁）
    /// * `path` - 指向 `newext.block` 的路径，返回时指向插入（或合并）后的位置
    /// * `newext` - 新 extent
    /// * `flags` - 带 `DIO`（`PRE_IO`）时不做任何合并
    ///
    /// # 错误
    ///
    /// - `InvalidInput` - 长度为 0，或与已有 extent 起点相同
    /// - `NoSpace` - 分裂或增长时分配不到元数据块
    /// - `Corrupted` - 树结构损坏
    pub fn insert_extent(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        newext: Extent,
        flags: GetBlocksFlags,
    ) -> Result<()> {
        if newext.actual_len() == 0 {
            log::error!("[EXT_INSERT] inode #{}: zero length extent", data.ino);
            return Err(Error::new(ErrorKind::InvalidInput, "Zero length extent"));
        }
        let depth = path.leaf_index();
        let may_merge = !flags.contains(GetBlocksFlags::DIO);

        if let (Some(ex), Some(pos)) = (path.extent(), path.leaf().pos) {
            if may_merge && can_be_merged(&ex, &newext) {
                log::debug!(
                    "[EXT_INSERT] append {}:{} to {}:{}",
                    newext.block,
                    newext.actual_len(),
                    ex.block,
                    ex.actual_len()
                );
                self.ext_get_access(handle, path, depth)?;
                let len = ex.actual_len() + newext.actual_len();
                path.leaf_mut().extents_mut()?[pos].set_actual_len(len);
                return self.finish_insert(handle, data, path, pos, may_merge);
            }
            if may_merge && can_be_merged(&newext, &ex) {
                log::debug!(
                    "[EXT_INSERT] prepend {}:{} to {}:{}",
                    newext.block,
                    newext.actual_len(),
                    ex.block,
                    ex.actual_len()
                );
                self.ext_get_access(handle, path, depth)?;
                let len = ex.actual_len() + newext.actual_len();
                let target = &mut path.leaf_mut().extents_mut()?[pos];
                target.block = newext.block;
                target.set_pblock(newext.pblock());
                target.set_actual_len(len);
                return self.finish_insert(handle, data, path, pos, may_merge);
            }
        }

        if path.leaf().node.is_full() {
            let last = path.leaf().extents()?.last().map(|e| e.block);
            let next = path.next_leaf_block();
            if let Some(last) = last {
                if newext.block > last && next != EXT_MAX_BLOCKS {
                    let npath = self.find_extent(data, next, None)?;
                    if npath.leaf().node.has_room() {
                        log::debug!("[EXT_INSERT] next leaf has a free slot at {}", next);
                        *path = npath;
                    }
                }
            }
        }

        if path.leaf().node.is_full() {
            self.create_new_leaf(handle, data, path, &newext, flags)?;
        }

        let depth = path.leaf_index();
        let leaf = path.leaf();
        let pos = match (leaf.pos, path.extent()) {
            (None, _) | (_, None) => 0,
            (Some(p), Some(near)) => {
                if newext.block == near.block {
                    log::error!(
                        "[EXT_INSERT] inode #{}: extent at {} already exists",
                        data.ino,
                        newext.block
                    );
                    return Err(Error::new(ErrorKind::InvalidInput, "Extent already exists"));
                }
                if newext.block > near.block {
                    p + 1
                } else {
                    p
                }
            }
        };

        self.ext_get_access(handle, path, depth)?;
        path.leaf_mut().extents_mut()?.insert(pos, newext);
        path.leaf_mut().pos = Some(pos);
        log::debug!(
            "[EXT_INSERT] inserted {}:{}:{} at slot {} (depth {})",
            newext.block,
            newext.actual_len(),
            newext.pblock(),
            pos,
            depth
        );
        self.finish_insert(handle, data, path, pos, may_merge)
    }

    fn finish_insert(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        pos: usize,
        may_merge: bool,
    ) -> Result<()> {
        let depth = path.leaf_index();
        if may_merge {
            let merged = try_to_merge(path.leaf_mut().extents_mut()?, pos);
            path.leaf_mut().pos = Some(merged);
        }
        self.correct_indexes(handle, data, path)?;
        self.ext_dirty(handle, data, path, depth)?;
        data.cache().invalidate();
        Ok(())
    }
}
