//! Extent 合并与索引修正
//!
//! ## 合并条件
//!
//! 两个 extent 可以合并当且仅当：
//! 1. unwritten 状态相同
//! 2. 逻辑块连续（`ex1.end == ex2.block`）
//! 3. 物理块连续
//! 4. 合并后长度不超过该状态的上限（已初始化 32768，unwritten 32767）
//!
//! 合并只有一个方向：把右边的 extent 并入左边。"向左合并"就是以左邻居为基准
//! 做一次向右合并。

use super::path::ExtentPath;
use crate::block::BlockDevice;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, InodeData};
use crate::transaction::Handle;
use crate::types::Extent;
use alloc::vec::Vec;

/// `ex2` 能否并入 `ex1` 的尾部
pub fn can_be_merged(ex1: &Extent, ex2: &Extent) -> bool {
    if ex1.is_unwritten() != ex2.is_unwritten() {
        return false;
    }
    let len1 = ex1.actual_len();
    let len2 = ex2.actual_len();
    if ex1.end() != ex2.block as u64 {
        return false;
    }
    if len1 + len2 > ex1.max_len() {
        return false;
    }
    ex1.pblock() + len1 as u64 == ex2.pblock()
}

/// 以 `i` 为基准反复向右合并，返回是否发生了合并
pub(crate) fn merge_right(extents: &mut Vec<Extent>, i: usize) -> bool {
    let mut merged = false;
    while i + 1 < extents.len() && can_be_merged(&extents[i], &extents[i + 1]) {
        let len = extents[i].actual_len() + extents[i + 1].actual_len();
        extents[i].set_actual_len(len);
        extents.remove(i + 1);
        merged = true;
    }
    merged
}

/// 尝试把 `idx` 处的 extent 与邻居合并
///
/// 先以左邻居为基准合并，不行再以自身为基准。
/// 返回合并后包含原 extent 的位置。
pub(crate) fn try_to_merge(extents: &mut Vec<Extent>, idx: usize) -> usize {
    if idx > 0 && merge_right(extents, idx - 1) {
        return idx - 1;
    }
    merge_right(extents, idx);
    idx
}

impl<D: BlockDevice> ExtentFs<D> {
    /// 叶子第一个 extent 变化后，沿路径向上修正索引键
    ///
    /// 只有当前位置是叶子的第一个条目时才需要修正；
    /// 向上传播在某一层的索引不是该节点第一个条目时停止。
    pub(crate) fn correct_indexes(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
    ) -> Result<()> {
        let depth = path.leaf_index();
        if depth == 0 {
            return Ok(());
        }
        let leaf = path.leaf();
        if leaf.pos != Some(0) {
            return Ok(());
        }
        let Some(border) = leaf.node.first_key() else {
            return Ok(());
        };

        let mut k = depth - 1;
        loop {
            let pos = path.levels[k]
                .pos
                .ok_or_else(|| Error::new(ErrorKind::Corrupted, "Index position missing"))?;
            self.ext_get_access(handle, path, k)?;
            path.levels[k].indexes_mut()?[pos].block = border;
            self.ext_dirty(handle, data, path, k)?;
            log::trace!("[EXT_INSERT] corrected index at level {} to {}", k, border);

            if k == 0 || pos != 0 {
                break;
            }
            k -= 1;
        }
        Ok(())
    }
}
