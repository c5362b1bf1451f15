//! 延迟分配
//!
//! 延迟分配的写入只在页缓存中预留了缓冲区，还没有物理块，
//! extent 树里看不到它们。FIEMAP 需要通过页缓存的脏页把这些区间找出来。

use crate::block::BlockDevice;
use crate::consts::*;
use crate::fs::{ExtentFs, InodeData};
use crate::page_cache::BufferState;
use crate::types::ExtentHeader;

/// 每次从页缓存取出的脏页数
const DIRTY_PAGE_BATCH: usize = 16;

/// 一段连续的延迟分配块
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayedExtent {
    /// 起始逻辑块
    pub block: u32,
    /// 块数，不超过 `EXT_INIT_MAX_LEN`
    pub len: u32,
}

impl<D: BlockDevice> ExtentFs<D> {
    /// 查找 `[block, block + len)` 中的延迟分配区间
    ///
    /// 取范围内第一个已映射的缓冲区。它是延迟分配缓冲区时，向后收集
    /// 连续的延迟分配块（跨页时页号也必须连续）。
    ///
    /// # 返回
    ///
    /// 范围内没有脏页、第一个已映射缓冲区不是延迟分配的，
    /// 或者文件系统没有启用延迟分配时返回 `None`。
    pub fn find_delayed_extent(&self, ino: u32, block: u32, len: u32) -> Option<DelayedExtent> {
        if !self.config.delalloc || len == 0 {
            return None;
        }
        let pages = self.pages.lock();
        let bpp = (pages.page_size() / self.config.block_size).max(1) as u64;
        let range_end = block as u64 + len as u64;

        let mut batch = pages.find_dirty_pages(ino, block as u64 / bpp, DIRTY_PAGE_BATCH);
        let first = batch.first()?;
        let page_start = first.index * bpp;
        let (slot, start) = first
            .buffers
            .iter()
            .enumerate()
            .map(|(i, state)| (i, page_start + i as u64, *state))
            .find(|&(_, b, state)| state.contains(BufferState::MAPPED) && b >= block as u64)
            .map(|(i, b, _)| (i, b))?;
        if start >= range_end || !first.buffers[slot].contains(BufferState::DELAY) {
            return None;
        }

        let mut end = start;
        let mut expect = first.index;
        let mut skip = slot;
        'scan: loop {
            let full = batch.len() == DIRTY_PAGE_BATCH;
            for page in &batch {
                if page.index != expect {
                    break 'scan;
                }
                for state in &page.buffers[skip..] {
                    if !state.contains(BufferState::DELAY) {
                        break 'scan;
                    }
                    end += 1;
                }
                skip = 0;
                expect += 1;
            }
            if !full || end - start >= EXT_INIT_MAX_LEN as u64 {
                break;
            }
            batch = pages.find_dirty_pages(ino, expect, DIRTY_PAGE_BATCH);
        }

        let found = DelayedExtent {
            block: start as u32,
            len: (end - start).min(EXT_INIT_MAX_LEN as u64) as u32,
        };
        log::trace!(
            "[EXT_DELALLOC] inode #{}: delayed extent {}+{} from {}",
            ino,
            found.block,
            found.len,
            block
        );
        Some(found)
    }

    /// 为延迟分配的 `lblock` 估算最坏情况下需要的元数据块数
    ///
    /// 与上一次估算的块连续时可以共用索引块：每 `idxs` 个块多一个索引块，
    /// 每 `idxs^2`、`idxs^3` 个块再各多一个。不连续时需要整条路径，
    /// 即树深度加一。
    pub fn calc_metadata_amount(&self, data: &mut InodeData, lblock: u32) -> u32 {
        let idxs = (self.config.block_size - EXT4_EXT_HEADER_SIZE as u32)
            / EXT4_EXT_ENTRY_SIZE as u32;

        if data.da_metadata_calc_len != 0
            && data.da_metadata_calc_last_lblock.wrapping_add(1) == lblock
        {
            let len = data.da_metadata_calc_len;
            let mut num = 0;
            if len % idxs == 0 {
                num += 1;
            }
            if len % (idxs * idxs) == 0 {
                num += 1;
            }
            if len % (idxs * idxs * idxs) == 0 {
                num += 1;
                data.da_metadata_calc_len = 0;
            } else {
                data.da_metadata_calc_len += 1;
            }
            data.da_metadata_calc_last_lblock = lblock;
            return num;
        }

        data.da_metadata_calc_len = 1;
        data.da_metadata_calc_last_lblock = lblock;
        ExtentHeader::decode(&data.i_block).depth as u32 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_cache::MemPageCache;
    use crate::test_utils::*;
    use crate::transaction::SimpleJournal;
    use crate::types::Extent;

    fn with_pages(config: crate::fs::FsConfig, setup: impl FnOnce(&mut MemPageCache)) -> TestFs {
        let mut pages = MemPageCache::new(4096, TEST_BLOCK_SIZE);
        setup(&mut pages);
        test_fs_with(config, SimpleJournal::default(), pages, &[(1000, 7000)])
    }

    #[test]
    fn test_delayed_run_in_one_page() {
        let t = with_pages(test_config(), |p| p.mark_delayed(12, 6, 4));
        assert_eq!(
            t.find_delayed_extent(12, 0, 100),
            Some(DelayedExtent { block: 6, len: 4 })
        );
        // 从区间中间开始
        assert_eq!(
            t.find_delayed_extent(12, 8, 100),
            Some(DelayedExtent { block: 8, len: 2 })
        );
        assert_eq!(t.find_delayed_extent(13, 0, 100), None);
    }

    #[test]
    fn test_delayed_run_across_batches() {
        let t = with_pages(test_config(), |p| p.mark_delayed(12, 0, 100));
        assert_eq!(
            t.find_delayed_extent(12, 0, 200),
            Some(DelayedExtent { block: 0, len: 100 })
        );
    }

    #[test]
    fn test_delayed_run_stops_at_gap() {
        let t = with_pages(test_config(), |p| {
            p.mark_delayed(12, 0, 4);
            p.mark_delayed(12, 8, 4);
        });
        assert_eq!(
            t.find_delayed_extent(12, 0, 100),
            Some(DelayedExtent { block: 0, len: 4 })
        );

        let t = with_pages(test_config(), |p| {
            p.mark_delayed(12, 0, 2);
            p.set_state(12, 2, 2, BufferState::MAPPED);
        });
        assert_eq!(
            t.find_delayed_extent(12, 0, 100),
            Some(DelayedExtent { block: 0, len: 2 })
        );
    }

    #[test]
    fn test_no_delayed_extent() {
        // 范围之外
        let t = with_pages(test_config(), |p| p.mark_delayed(12, 50, 2));
        assert_eq!(t.find_delayed_extent(12, 0, 10), None);

        // 已映射但不是延迟分配
        let t = with_pages(test_config(), |p| p.set_state(12, 0, 4, BufferState::MAPPED));
        assert_eq!(t.find_delayed_extent(12, 0, 10), None);

        let config = crate::fs::FsConfig {
            delalloc: false,
            ..test_config()
        };
        let t = with_pages(config, |p| p.mark_delayed(12, 0, 4));
        assert_eq!(t.find_delayed_extent(12, 0, 10), None);
    }

    #[test]
    fn test_calc_metadata_amount() {
        let t = test_fs();
        let inode = t.new_inode(12);
        let mut data = inode.write();

        let amounts: alloc::vec::Vec<u32> = [10u32, 11, 12]
            .iter()
            .map(|&b| t.calc_metadata_amount(&mut data, b))
            .collect();
        assert_eq!(amounts, [1, 0, 0]);
        assert_eq!(t.calc_metadata_amount(&mut data, 50), 1);

        // 1 KiB 块每个索引块 84 项
        let total: u32 = (51..=134).map(|b| t.calc_metadata_amount(&mut data, b)).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_calc_metadata_amount_follows_depth() {
        let t = test_fs();
        let inode = t.new_inode(12);
        for i in 0..5u32 {
            t.insert(&inode, Extent::new(i * 4, 1, 1000 + i as u64 * 4)).unwrap();
        }
        assert_eq!(tree_depth(&inode), 1);
        let mut data = inode.write();
        assert_eq!(t.calc_metadata_amount(&mut data, 100), 2);
    }
}
