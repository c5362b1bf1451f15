//! 空间删除
//!
//! [`ExtentFs::remove_space`] 删除 `[start, end]` 覆盖的所有块：
//!
//! 1. `end` 落在某个 extent 中间时，先在 `end + 1` 处分裂，叶子删除只需要截掉尾部
//! 2. 从右往左深度优先遍历：叶子层删除范围内的 extent，
//!    子节点变空后删除父节点中的索引并释放子节点块
//! 3. 根节点变空时恢复为深度 0 的空叶子
//!
//! 每删除一个 extent 前确保事务额度足够。额度不够时事务重启，
//! 整个删除从头再来；已经删除的部分不会重复处理。

use super::node::TreeNode;
use super::path::{ExtentPath, PathLevel};
use crate::balloc::FreeFlags;
use crate::block::BlockDevice;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, ExtentInode, InodeData};
use crate::transaction::Handle;
use crate::types::{Extent, ExtentHeader};
use alloc::vec;
use alloc::vec::Vec;

/// 索引层的遍历位置
#[derive(Debug, Clone, Copy)]
struct RmCursor {
    /// 当前索引，-1 表示这一层已经处理完
    idx: isize,
    /// 进入子节点之前的条目数
    saved: usize,
}

impl RmCursor {
    fn first_visit(entries: usize) -> Self {
        Self {
            idx: entries as isize - 1,
            saved: entries + 1,
        }
    }

    /// 当前索引是否还需要进入
    ///
    /// 子节点没有被整个删除（条目数没变）说明删除已经到达 `start`，左边不用再看。
    fn more_to_rm(&self, entries: usize) -> bool {
        self.idx >= 0 && entries != self.saved
    }
}

impl<D: BlockDevice> ExtentFs<D> {
    /// 释放 extent 中 `[from, to]` 对应的物理块
    ///
    /// 只支持删除尾部（包括整个 extent）。
    fn remove_blocks(&self, handle: &mut Handle, ex: &Extent, from: u32, to: u32) -> Result<()> {
        let len = ex.actual_len();
        if from < ex.block || to != ex.last_block() {
            log::warn!(
                "[EXT_REMOVE] strange request: removal {}-{} from {}:{}",
                from,
                to,
                ex.block,
                len
            );
            return Ok(());
        }
        let num = (ex.end() - from as u64) as u32;
        let start = ex.pblock() + (len - num) as u64;
        log::debug!("[EXT_REMOVE] free last {} blocks starting {}", num, start);
        self.free_blocks(handle, start, num, FreeFlags::empty())
    }

    /// 删除第 `lv` 层节点在父节点中的索引，并释放该节点
    fn rm_idx(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        lv: usize,
    ) -> Result<()> {
        let parent = lv - 1;
        let pos = path.levels[parent]
            .pos
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "Index position missing"))?;
        if path.levels[parent].entries() == 0 {
            log::error!("[EXT_REMOVE] inode #{}: parent index is empty", data.ino);
            return Err(Error::new(ErrorKind::Corrupted, "Removing from empty index"));
        }
        let leaf = path.levels[parent].indexes()?[pos].leaf();

        self.ext_get_access(handle, path, parent)?;
        path.levels[parent].indexes_mut()?.remove(pos);
        self.ext_dirty(handle, data, path, parent)?;
        log::debug!("[EXT_REMOVE] index is empty, remove it, free block {}", leaf);

        self.free_blocks(handle, leaf, 1, FreeFlags::METADATA | FreeFlags::FORGET)?;

        if pos == 0 {
            self.correct_index_keys(handle, data, path, parent)?;
        }
        Ok(())
    }

    /// 第 `k` 层第一个条目变化后，修正上层指向它的索引键
    fn correct_index_keys(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        mut k: usize,
    ) -> Result<()> {
        while k > 0 {
            let Some(key) = path.levels[k].node.first_key() else {
                break;
            };
            let up = k - 1;
            let upos = path.levels[up]
                .pos
                .ok_or_else(|| Error::new(ErrorKind::Corrupted, "Index position missing"))?;
            if path.levels[up].indexes()?[upos].block == key {
                break;
            }
            self.ext_get_access(handle, path, up)?;
            path.levels[up].indexes_mut()?[upos].block = key;
            self.ext_dirty(handle, data, path, up)?;
            if upos != 0 {
                break;
            }
            k = up;
        }
        Ok(())
    }

    /// 删除叶子中与 `[start, end]` 相交的 extent
    ///
    /// 从最后一个 extent 往前处理，遇到完全在 `start` 之前的 extent 停止。
    /// 被删除范围只能是 extent 的尾部或整个 extent。
    fn rm_leaf(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        start: u32,
        end: u32,
        removed: &mut u64,
    ) -> Result<()> {
        let depth = path.leaf_index();
        log::debug!("[EXT_REMOVE] truncate since {} in leaf to {}", start, end);

        let mut correct_index = false;
        let mut i = path.leaf().entries();
        while i > 0 {
            let idx = i - 1;
            let ex = path.leaf().extents()?[idx];
            if ex.end() <= start as u64 {
                break;
            }
            i -= 1;
            if end < ex.block {
                continue;
            }

            let a = ex.block.max(start);
            let b = ex.last_block().min(end);
            if b != ex.last_block() {
                log::error!(
                    "[EXT_REMOVE] inode #{}: can not handle truncate {}:{} on extent {}:{}",
                    data.ino,
                    start,
                    end,
                    ex.block,
                    ex.last_block()
                );
                return Err(Error::new(ErrorKind::Corrupted, "Partial extent removal"));
            }
            let num = a - ex.block;

            if idx == 0 {
                correct_index = true;
            }
            let credits =
                self.credits
                    .remove_extent_credits(depth as u16, ex.actual_len(), idx == 0);
            self.ensure_credits(handle, credits)?;

            self.ext_get_access(handle, path, depth)?;
            self.remove_blocks(handle, &ex, a, b)?;
            let extents = path.leaf_mut().extents_mut()?;
            if num == 0 {
                extents.remove(idx);
            } else {
                extents[idx].set_actual_len(num);
            }
            self.ext_dirty(handle, data, path, depth)?;
            *removed += 1;
            log::debug!(
                "[EXT_REMOVE] extent {}:{} -> {} blocks left",
                ex.block,
                ex.actual_len(),
                num
            );
        }

        if correct_index && path.leaf().entries() > 0 {
            path.leaf_mut().pos = Some(0);
            self.correct_indexes(handle, data, path)?;
        }
        if path.leaf().entries() == 0 && path.leaf().block.is_some() {
            self.rm_idx(handle, data, path, depth)?;
        }
        Ok(())
    }

    fn try_remove_space(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        start: u32,
        end: u32,
        removed: &mut u64,
    ) -> Result<()> {
        data.cache().invalidate();

        let mut path;
        let mut cursors: Vec<Option<RmCursor>>;
        if end < EXT_MAX_BLOCKS - 1 {
            path = self.find_extent(data, end, None)?;
            let Some(ex) = path.extent() else {
                if path.depth() != 0 {
                    log::error!(
                        "[EXT_REMOVE] inode #{}: empty leaf at depth {}",
                        data.ino,
                        path.depth()
                    );
                    return Err(Error::new(ErrorKind::Corrupted, "Empty leaf in removal path"));
                }
                return Ok(());
            };
            if end >= ex.block && end < ex.last_block() {
                self.force_split_extent_at(handle, data, &mut path, end + 1, true)?;
                self.refind(data, &mut path, end)?;
            }
            let depth = path.leaf_index();
            cursors = (0..depth)
                .map(|k| {
                    let level = path.level(k);
                    Some(RmCursor {
                        idx: level.pos.map_or(-1, |p| p as isize),
                        saved: level.entries() + 1,
                    })
                })
                .collect();
            cursors.push(None);
        } else {
            path = self.root_path(data)?;
            cursors = vec![None];
        }

        let depth = path.leaf_index();
        let mut i = cursors.len() as isize - 1;
        while i >= 0 {
            let lv = i as usize;
            if lv == depth {
                self.rm_leaf(handle, data, &mut path, start, end, removed)?;
                if lv > 0 {
                    path.levels.truncate(lv);
                }
                i -= 1;
                continue;
            }

            let entries = path.levels[lv].entries();
            let cur = match cursors[lv] {
                None => RmCursor::first_visit(entries),
                Some(c) => RmCursor {
                    idx: c.idx - 1,
                    saved: c.saved,
                },
            };

            if cur.more_to_rm(entries) {
                let pos = cur.idx as usize;
                path.levels[lv].pos = Some(pos);
                let child = path.levels[lv].indexes()?[pos].leaf();
                log::trace!("[EXT_REMOVE] move to level {} (block {})", lv + 1, child);
                let (node, pin) = self.read_extent_block(data, child, (depth - lv - 1) as u16)?;
                path.levels.truncate(lv + 1);
                path.levels.push(PathLevel::new(Some(child), node, Some(pin)));
                cursors[lv] = Some(RmCursor {
                    idx: cur.idx,
                    saved: entries,
                });
                cursors.truncate(lv + 1);
                cursors.push(None);
                i += 1;
            } else {
                cursors[lv] = Some(cur);
                if entries == 0 && lv > 0 {
                    self.rm_idx(handle, data, &mut path, lv)?;
                }
                if lv > 0 {
                    path.levels.truncate(lv);
                }
                i -= 1;
                log::trace!("[EXT_REMOVE] return to level {}", i);
            }
        }
        drop(path);

        let root = self.read_root(data)?;
        if root.entries() == 0 && root.depth != 0 {
            log::debug!(
                "[EXT_REMOVE] inode #{}: tree emptied, depth {} -> 0",
                data.ino,
                root.depth
            );
            let mut node = TreeNode::new_leaf(EXT4_EXT_ROOT_CAPACITY);
            node.generation = root.generation;
            self.write_node(handle, data, None, &node)?;
        }
        Ok(())
    }

    /// 在调用者的事务中删除 `[start, end]`（调用者持有写锁）
    ///
    /// 事务重启后从头再来；连续两次重启都没有删掉任何 extent 时放弃。
    ///
    /// # 错误
    ///
    /// - `NoSpace` - 事务容量连一个 extent 都删不了
    /// - `Corrupted` - 树结构损坏
    pub(crate) fn remove_space_locked(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        start: u32,
        end: u32,
    ) -> Result<()> {
        log::debug!(
            "[EXT_REMOVE] inode #{}: remove space {}..={}",
            data.ino,
            start,
            end
        );
        let mut removed = 0u64;
        let mut last_restart: Option<u64> = None;
        loop {
            match self.try_remove_space(handle, data, start, end, &mut removed) {
                Err(e) if e.is_restart() => {
                    if last_restart == Some(removed) {
                        log::error!(
                            "[EXT_REMOVE] inode #{}: no progress after transaction restart",
                            data.ino
                        );
                        return Err(Error::new(
                            ErrorKind::NoSpace,
                            "Transaction too small for removal",
                        ));
                    }
                    log::debug!(
                        "[EXT_REMOVE] inode #{}: restart after {} extents",
                        data.ino,
                        removed
                    );
                    last_restart = Some(removed);
                }
                result => return result,
            }
        }
    }

    /// 删除逻辑块 `[start, end]` 对应的空间
    ///
    /// 持写锁，在自己的事务中完成。`end` 取 `EXT_MAX_BLOCKS - 1` 表示到文件末尾。
    pub fn remove_space(&self, inode: &ExtentInode, start: u32, end: u32) -> Result<()> {
        if start > end {
            return Err(Error::new(ErrorKind::InvalidInput, "Empty removal range"));
        }
        let mut data = inode.write();
        let depth = ExtentHeader::decode(&data.i_block).depth;
        let mut handle = self.journal_start(self.credits.truncate_start_credits(depth))?;
        let result = self.remove_space_locked(&mut handle, &mut data, start, end);
        let result = result.and_then(|()| self.mark_inode_dirty(&mut handle, &data));
        self.finish(handle, result)
    }
}
