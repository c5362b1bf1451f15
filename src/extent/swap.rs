//! 交换两个文件的 extent
//!
//! 在线碎片整理把数据写到临时文件之后，用这里的操作交换两个文件在
//! 某个逻辑区间上的物理块。只交换树中的映射，不搬运数据，
//! 也不处理页缓存，这些由调用者负责。

use super::merge::try_to_merge;
use super::path::ExtentPath;
use crate::block::BlockDevice;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, ExtentInode, InodeData};
use crate::transaction::Handle;
use crate::types::Extent;
use spin::RwLockWriteGuard;

/// 两个 inode 的写锁；同一个 inode 只锁一次
enum InodePair<'a> {
    Same(RwLockWriteGuard<'a, InodeData>),
    Two([RwLockWriteGuard<'a, InodeData>; 2]),
}

impl<'a> InodePair<'a> {
    /// 按 inode 号升序加锁
    fn lock(inode1: &'a ExtentInode, inode2: &'a ExtentInode) -> Self {
        if core::ptr::eq(inode1, inode2) {
            return Self::Same(inode1.write());
        }
        if inode1.ino() <= inode2.ino() {
            let g1 = inode1.write();
            let g2 = inode2.write();
            Self::Two([g1, g2])
        } else {
            let g2 = inode2.write();
            let g1 = inode1.write();
            Self::Two([g1, g2])
        }
    }

    fn is_same(&self) -> bool {
        matches!(self, Self::Same(_))
    }

    fn side(&mut self, i: usize) -> &mut InodeData {
        match self {
            Self::Same(g) => &mut **g,
            Self::Two(g) => &mut *g[i],
        }
    }
}

/// 一轮循环的结果
enum SwapStep {
    /// 两边都没有可交换的 extent 了
    Done,
    /// 跳过了空洞
    Skipped(u32),
    /// 做了分裂，需要重新查找
    Split,
    /// 交换了若干块
    Swapped(u32),
}

impl<D: BlockDevice> ExtentFs<D> {
    /// 交换 `inode1` 的 `[lblk1, lblk1 + count)` 与 `inode2` 的
    /// `[lblk2, lblk2 + count)` 上的 extent
    ///
    /// 两边的空洞同步跳过；边界不对齐的 extent 先分裂。交换之后
    /// 第一个文件得到第二个文件 extent 的物理块和状态，反之亦然。
    ///
    /// # 参数
    ///
    /// * `mark_unwritten` - 交换后把第二个文件得到的 extent 标记为 unwritten
    ///
    /// # 返回
    ///
    /// 交换的块数。任何一边没有更多 extent 时提前结束。
    ///
    /// # 错误
    ///
    /// - `InvalidInput` - 同一个文件的两个区间重叠
    /// - `NoSpace` - 分裂时无法分配元数据块
    pub fn swap_extents(
        &self,
        inode1: &ExtentInode,
        inode2: &ExtentInode,
        lblk1: u32,
        lblk2: u32,
        count: u32,
        mark_unwritten: bool,
    ) -> Result<u32> {
        if core::ptr::eq(inode1, inode2) {
            let (lo, hi) = if lblk1 <= lblk2 { (lblk1, lblk2) } else { (lblk2, lblk1) };
            if (lo as u64 + count as u64) > hi as u64 {
                return Err(Error::new(ErrorKind::InvalidInput, "Overlapping swap ranges"));
            }
        }

        let mut pair = InodePair::lock(inode1, inode2);
        log::debug!(
            "[EXT_SWAP] inode #{} {} <-> inode #{} {} count={}",
            inode1.ino(),
            lblk1,
            inode2.ino(),
            lblk2,
            count
        );

        let credits = self.map_credits(pair.side(0), 1) + self.map_credits(pair.side(1), 1);
        let mut handle = self.journal_start(credits)?;
        let result = (|| -> Result<u32> {
            let swapped =
                self.swap_locked(&mut handle, &mut pair, lblk1, lblk2, count, mark_unwritten)?;
            self.mark_inode_dirty(&mut handle, pair.side(0))?;
            if !pair.is_same() {
                self.mark_inode_dirty(&mut handle, pair.side(1))?;
            }
            Ok(swapped)
        })();
        self.finish(handle, result)
    }

    fn swap_locked(
        &self,
        handle: &mut Handle,
        pair: &mut InodePair<'_>,
        mut lblk1: u32,
        mut lblk2: u32,
        mut count: u32,
        mark_unwritten: bool,
    ) -> Result<u32> {
        let mut replaced = 0u32;
        while count > 0 {
            let needed = self.map_credits(pair.side(0), 1) + self.map_credits(pair.side(1), 1);
            match self.ensure_credits(handle, needed) {
                Err(e) if e.is_restart() => {}
                other => other?,
            }

            match self.swap_step(handle, pair, lblk1, lblk2, count, mark_unwritten)? {
                SwapStep::Done => break,
                SwapStep::Split => continue,
                SwapStep::Skipped(len) => {
                    lblk1 += len;
                    lblk2 += len;
                    count -= len;
                }
                SwapStep::Swapped(len) => {
                    lblk1 += len;
                    lblk2 += len;
                    count -= len;
                    replaced += len;
                }
            }
        }
        log::debug!("[EXT_SWAP] swapped {} blocks", replaced);
        Ok(replaced)
    }

    fn swap_step(
        &self,
        handle: &mut Handle,
        pair: &mut InodePair<'_>,
        lblk1: u32,
        lblk2: u32,
        count: u32,
        mark_unwritten: bool,
    ) -> Result<SwapStep> {
        let mut path1 = self.find_extent(pair.side(0), lblk1, None)?;
        let mut path2 = self.find_extent(pair.side(1), lblk2, None)?;
        let (Some(ex1), Some(ex2)) = (path1.extent(), path2.extent()) else {
            return Ok(SwapStep::Done);
        };

        if !ex1.contains(lblk1) || !ex2.contains(lblk2) {
            let next1 = if ex1.block > lblk1 { ex1.block } else { path1.next_allocated_block() };
            let next2 = if ex2.block > lblk2 { ex2.block } else { path2.next_allocated_block() };
            if next1 == EXT_MAX_BLOCKS || next2 == EXT_MAX_BLOCKS {
                return Ok(SwapStep::Done);
            }
            // 跳到两边中较远的那个 extent
            let len = (next1 - lblk1).max(next2 - lblk2).min(count);
            return Ok(SwapStep::Skipped(len));
        }

        // 左边界
        let mut split = false;
        if ex1.block < lblk1 {
            self.force_split_extent_at(handle, pair.side(0), &mut path1, lblk1, false)?;
            split = true;
        }
        if ex2.block < lblk2 {
            self.force_split_extent_at(handle, pair.side(1), &mut path2, lblk2, false)?;
            split = true;
        }
        if split {
            return Ok(SwapStep::Split);
        }

        // 右边界
        let len = (count as u64)
            .min(ex1.end() - lblk1 as u64)
            .min(ex2.end() - lblk2 as u64) as u32;
        if len != ex1.actual_len() {
            self.force_split_extent_at(handle, pair.side(0), &mut path1, lblk1 + len, false)?;
            split = true;
        }
        if len != ex2.actual_len() {
            self.force_split_extent_at(handle, pair.side(1), &mut path2, lblk2 + len, false)?;
            split = true;
        }
        if split {
            return Ok(SwapStep::Split);
        }

        pair.side(0).cache().invalidate();
        pair.side(1).cache().invalidate();

        let mut new1 = ex1;
        new1.set_pblock(ex2.pblock());
        if ex2.is_unwritten() {
            new1.mark_unwritten();
        } else {
            new1.mark_initialized();
        }
        let mut new2 = ex2;
        new2.set_pblock(ex1.pblock());
        if ex1.is_unwritten() || mark_unwritten {
            new2.mark_unwritten();
        } else {
            new2.mark_initialized();
        }

        let same_leaf = pair.is_same() && path1.leaf().block == path2.leaf().block;
        if same_leaf {
            self.swap_in_leaf(handle, pair.side(0), &mut path1, &path2, new1, new2)?;
        } else {
            let leaf1 = path1.leaf_index();
            let leaf2 = path2.leaf_index();
            self.ext_get_access(handle, &path1, leaf1)?;
            self.ext_get_access(handle, &path2, leaf2)?;
            store_and_merge(&mut path2, new2)?;
            store_and_merge(&mut path1, new1)?;
            self.ext_dirty(handle, pair.side(1), &path2, leaf2)?;
            self.ext_dirty(handle, pair.side(0), &path1, leaf1)?;
        }
        Ok(SwapStep::Swapped(len))
    }

    /// 同一个叶子中的两个 extent：在一份节点副本上修改，只写回一次
    fn swap_in_leaf(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        other: &ExtentPath,
        new1: Extent,
        new2: Extent,
    ) -> Result<()> {
        let leaf = path.leaf_index();
        let pos1 = leaf_pos(path)?;
        let pos2 = leaf_pos(other)?;
        self.ext_get_access(handle, path, leaf)?;

        let extents = path.leaf_mut().extents_mut()?;
        extents[pos1] = new1;
        extents[pos2] = new2;
        // 先合并右边的，左边的位置不受影响
        let (lo, hi) = if pos1 < pos2 { (pos1, pos2) } else { (pos2, pos1) };
        try_to_merge(extents, hi);
        try_to_merge(extents, lo);
        self.ext_dirty(handle, data, path, leaf)
    }
}

fn leaf_pos(path: &ExtentPath) -> Result<usize> {
    path.leaf()
        .pos
        .ok_or(Error::new(ErrorKind::Corrupted, "Swap path lost its extent"))
}

fn store_and_merge(path: &mut ExtentPath, ex: Extent) -> Result<()> {
    let pos = leaf_pos(path)?;
    let extents = path.leaf_mut().extents_mut()?;
    extents[pos] = ex;
    try_to_merge(extents, pos);
    Ok(())
}
