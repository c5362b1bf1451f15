//! 截断、打洞与预分配
//!
//! 这些操作以字节为单位接收范围，换算成逻辑块后交给
//! [`ExtentFs::remove_space_locked`] 和 [`ExtentFs::get_blocks`]。
//! 不足一块的边缘部分通过页缓存清零。

use super::map::GetBlocksFlags;
use crate::block::BlockDevice;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, ExtentInode, InodeData, InodeState};

impl<D: BlockDevice> ExtentFs<D> {
    /// 字节范围覆盖的逻辑块 `[start, end)`
    ///
    /// 起点向下取整、终点向上取整。
    fn covering_blocks(&self, offset: u64, len: u64) -> Result<(u32, u32)> {
        let bits = self.config.block_bits();
        let end = offset
            .checked_add(len)
            .ok_or(Error::new(ErrorKind::InvalidInput, "Range overflows"))?;
        let last = end.div_ceil(self.config.block_size as u64);
        if last > EXT_MAX_BLOCKS as u64 {
            return Err(Error::new(ErrorKind::InvalidInput, "File too large"));
        }
        Ok(((offset >> bits) as u32, last as u32))
    }

    fn zero_partial(&self, data: &InodeData, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        log::debug!(
            "[EXT_FALLOC] inode #{}: zero partial range {}+{}",
            data.ino,
            offset,
            len
        );
        self.pages.lock().zero_range(data.ino, offset, len)
    }

    /// 释放 `i_size` 之后的所有块
    ///
    /// `i_size` 不是块对齐时，最后一块中 `i_size` 之后的部分先清零。
    ///
    /// # 错误
    ///
    /// - `NoSpace` - 事务容量不足以完成删除
    /// - `Corrupted` - 树结构损坏
    pub fn truncate(&self, inode: &ExtentInode) -> Result<()> {
        let mut data = inode.write();
        let bs = self.config.block_size as u64;
        let mut handle = self.journal_start(self.map_credits(&data, 1))?;
        let result = (|| -> Result<()> {
            let tail = data.size % bs;
            if tail != 0 {
                self.zero_partial(&data, data.size, bs - tail)?;
            }
            data.cache().invalidate();

            let last_block = data.size.div_ceil(bs);
            log::debug!(
                "[EXT_FALLOC] inode #{}: truncate to {} bytes, first freed block {}",
                data.ino,
                data.size,
                last_block
            );
            if last_block < EXT_MAX_BLOCKS as u64 {
                self.remove_space_locked(
                    &mut handle,
                    &mut data,
                    last_block as u32,
                    EXT_MAX_BLOCKS - 1,
                )?;
            }
            data.state.remove(InodeState::EOFBLOCKS);
            self.mark_inode_dirty(&mut handle, &data)
        })();
        self.finish(handle, result)
    }

    /// 在文件中打洞
    ///
    /// 先在洞的两端强制分裂，再删除中间完整的块；两端不足一块的部分
    /// 通过页缓存清零。洞超出 `i_size` 时截到 `i_size` 所在页的末尾。
    ///
    /// # 参数
    ///
    /// * `offset` - 洞的起始字节
    /// * `length` - 洞的字节长度
    pub fn punch_hole(&self, inode: &ExtentInode, offset: u64, length: u64) -> Result<()> {
        let mut data = inode.write();
        if length == 0 || offset >= data.size {
            return Ok(());
        }
        let bs = self.config.block_size as u64;
        let mut length = length;
        if offset.saturating_add(length) > data.size {
            let ps = self.pages.lock().page_size() as u64;
            length = data.size + ps - (data.size & (ps - 1)) - offset;
        }
        let end = offset + length;
        let first_block = offset.div_ceil(bs);
        let stop_block = (end / bs).min(EXT_MAX_BLOCKS as u64);
        log::debug!(
            "[EXT_FALLOC] inode #{}: punch {}+{}, blocks {}..{}",
            data.ino,
            offset,
            length,
            first_block,
            stop_block
        );

        let mut handle = self.journal_start(self.map_credits(&data, 1))?;
        let result = (|| -> Result<()> {
            if first_block > stop_block {
                // 洞在同一块内
                self.zero_partial(&data, offset, length)?;
            } else {
                self.zero_partial(&data, offset, first_block * bs - offset)?;
                self.zero_partial(&data, stop_block * bs, end - stop_block * bs)?;
            }
            if first_block >= stop_block {
                return self.mark_inode_dirty(&mut handle, &data);
            }

            let (first, stop) = (first_block as u32, stop_block as u32);
            data.cache().invalidate();
            let mut path = self.find_extent(&data, first, None)?;
            self.force_split_extent_at(&mut handle, &mut data, &mut path, first, true)?;
            if stop < EXT_MAX_BLOCKS {
                self.force_split_extent_at(&mut handle, &mut data, &mut path, stop, true)?;
            }
            drop(path);

            self.remove_space_locked(&mut handle, &mut data, first, stop - 1)?;
            data.cache().invalidate();
            self.mark_inode_dirty(&mut handle, &data)
        })();
        self.finish(handle, result)
    }

    fn falloc_update_size(&self, data: &mut InodeData, new_size: u64, keep_size: bool) {
        if !keep_size {
            if new_size > data.size {
                data.size = new_size;
            }
        } else if new_size > data.size {
            data.state.insert(InodeState::EOFBLOCKS);
        }
    }

    /// 为字节范围预分配 unwritten extent
    ///
    /// 每轮在新事务中映射一段，单个 extent 最多 `EXT_UNINIT_MAX_LEN` 块。
    /// 已经有块的部分保持原样。
    ///
    /// # 参数
    ///
    /// * `offset` - 起始字节
    /// * `len` - 字节长度
    /// * `keep_size` - 为 `true` 时不修改 `i_size`，只记下 EOF 之后有块
    ///
    /// # 错误
    ///
    /// - `InvalidInput` - 长度为 0 或超出最大文件大小
    /// - `NoSpace` - 空间不足；已经分配的部分保留，重试一次后仍失败才返回
    pub fn preallocate(
        &self,
        inode: &ExtentInode,
        offset: u64,
        len: u64,
        keep_size: bool,
    ) -> Result<()> {
        if len == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Zero length preallocation"));
        }
        let (start, end) = self.covering_blocks(offset, len)?;
        let mut data = inode.write();
        log::debug!(
            "[EXT_FALLOC] inode #{}: preallocate blocks {}..{}",
            data.ino,
            start,
            end
        );

        let bits = self.config.block_bits();
        let mut block = start;
        let mut retried = false;
        while block < end {
            let remaining = end - block;
            let mut handle = self.journal_start(self.map_credits(&data, remaining))?;
            match self.get_blocks(
                &mut handle,
                &mut data,
                block,
                remaining,
                GetBlocksFlags::CREATE_UNINIT_EXT,
            ) {
                Ok(m) if m.len > 0 => {
                    block += m.len;
                    let new_size = if block >= end {
                        offset + len
                    } else {
                        (block as u64) << bits
                    };
                    self.falloc_update_size(&mut data, new_size, keep_size);
                    let result = self.mark_inode_dirty(&mut handle, &data);
                    self.finish(handle, result)?;
                }
                Ok(_) => {
                    return self.finish(
                        handle,
                        Err(Error::new(ErrorKind::Corrupted, "Empty mapping on allocation")),
                    );
                }
                Err(e) if e.is_no_space() && block > start && !retried => {
                    log::debug!(
                        "[EXT_FALLOC] inode #{}: no space at block {}, retrying",
                        data.ino,
                        block
                    );
                    retried = true;
                    self.journal_stop(handle)?;
                }
                Err(e) => {
                    let result = self.mark_inode_dirty(&mut handle, &data).and(Err(e));
                    return self.finish(handle, result);
                }
            }
        }
        Ok(())
    }

    /// 把字节范围内的 unwritten extent 转为已初始化并扩展 `i_size`
    ///
    /// 范围必须块对齐，且每个块都已经有 extent。
    ///
    /// # 错误
    ///
    /// - `InvalidInput` - 范围不是块对齐的，或者落在两个 extent 之间的空洞里
    /// - `NotFound` - 文件中没有 extent
    pub fn convert_and_extend(&self, inode: &ExtentInode, offset: u64, len: u64) -> Result<()> {
        let bs = self.config.block_size as u64;
        if offset % bs != 0 || len % bs != 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Unaligned conversion range"));
        }
        let (mut iblock, end) = self.covering_blocks(offset, len)?;
        let new_size = offset + len;
        let mut data = inode.write();

        while iblock < end {
            let max_blocks = end - iblock;
            let mut handle = self.journal_start(self.map_credits(&data, max_blocks))?;
            let result = (|| -> Result<u32> {
                let mut path = self.find_extent(&data, iblock, None)?;
                let ex = path
                    .extent()
                    .ok_or(Error::new(ErrorKind::NotFound, "No extent to convert"))?;
                if !ex.contains(iblock) {
                    return Err(Error::new(ErrorKind::InvalidInput, "Block not mapped"));
                }
                if ex.is_unwritten() {
                    self.convert_unwritten_extents_dio(
                        &mut handle,
                        &mut data,
                        &mut path,
                        iblock,
                        max_blocks,
                    )?;
                }
                let step = (ex.end() - iblock as u64).min(max_blocks as u64) as u32;
                if step == max_blocks && new_size > data.size {
                    data.size = new_size;
                }
                self.mark_inode_dirty(&mut handle, &data)?;
                Ok(step)
            })();
            iblock += self.finish(handle, result)?;
        }
        Ok(())
    }

    /// 直接 I/O 完成后把字节范围内的 unwritten extent 转为已初始化
    ///
    /// 分批进行，每批一个事务。全部完成后清除 inode 的待转换状态。
    pub fn convert_unwritten_extents(&self, inode: &ExtentInode, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let (mut block, end) = self.covering_blocks(offset, len)?;
        let mut data = inode.write();
        while block < end {
            let max_blocks = end - block;
            let mut handle = self.journal_start(self.map_credits(&data, max_blocks))?;
            let result = self
                .get_blocks(
                    &mut handle,
                    &mut data,
                    block,
                    max_blocks,
                    GetBlocksFlags::DIO_CONVERT_EXT,
                )
                .and_then(|m| {
                    self.mark_inode_dirty(&mut handle, &data)?;
                    Ok(m)
                });
            let m = self.finish(handle, result)?;
            if m.len == 0 {
                log::error!(
                    "[EXT_FALLOC] inode #{}: conversion of block {} mapped nothing",
                    data.ino,
                    block
                );
                return Err(Error::new(ErrorKind::Corrupted, "Empty mapping on conversion"));
            }
            block += m.len;
        }
        data.state.remove(InodeState::DIO_UNWRITTEN);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balloc::{AllocEvent, FreeFlags};
    use crate::page_cache::MemPageCache;
    use crate::test_utils::*;
    use crate::transaction::SimpleJournal;
    use crate::types::Extent;
    use alloc::vec::Vec;

    fn freed(t: &TestFs) -> Vec<(u64, u32)> {
        t.alloc_log
            .lock()
            .iter()
            .filter_map(|e| match e {
                AllocEvent::Free { start, len, flags } if !flags.contains(FreeFlags::METADATA) => {
                    Some((*start, *len))
                }
                _ => None,
            })
            .collect()
    }

    fn ten_blocks(t: &TestFs) -> ExtentInode {
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new(0, 10, 5000)).unwrap();
        inode.set_size(10 * 1024);
        inode
    }

    #[test]
    fn test_punch_inside_extent() {
        let t = test_fs();
        let inode = ten_blocks(&t);
        t.punch_hole(&inode, 3 * 1024, 4 * 1024).unwrap();

        assert_eq!(
            leaf_extents(&t, &inode),
            [Extent::new(0, 3, 5000), Extent::new(7, 3, 5007)]
        );
        assert_eq!(freed(&t), [(5003, 4)]);
        assert!(t.zero_log.lock().is_empty());
        assert!(t.lookup(&inode, 4, 1).unwrap().is_hole());
        check_tree(&t, &inode);
    }

    #[test]
    fn test_punch_zeroes_partial_edges() {
        let t = test_fs();
        let inode = ten_blocks(&t);
        t.punch_hole(&inode, 3 * 1024 + 100, 4 * 1024).unwrap();

        assert_eq!(
            leaf_extents(&t, &inode),
            [Extent::new(0, 4, 5000), Extent::new(7, 3, 5007)]
        );
        assert_eq!(freed(&t), [(5004, 3)]);
        assert_eq!(
            t.zero_log.lock().as_slice(),
            &[(12, 3172, 924), (12, 7168, 100)]
        );
    }

    #[test]
    fn test_punch_within_one_block() {
        let t = test_fs();
        let inode = ten_blocks(&t);
        t.punch_hole(&inode, 100, 200).unwrap();

        assert_eq!(leaf_extents(&t, &inode), [Extent::new(0, 10, 5000)]);
        assert_eq!(t.zero_log.lock().as_slice(), &[(12, 100, 200)]);
        assert!(freed(&t).is_empty());
    }

    #[test]
    fn test_punch_past_eof_is_clamped() {
        let t = test_fs();
        let inode = ten_blocks(&t);
        t.punch_hole(&inode, 8 * 1024, 100 * 1024).unwrap();

        assert_eq!(leaf_extents(&t, &inode), [Extent::new(0, 8, 5000)]);
        assert_eq!(freed(&t), [(5008, 2)]);

        // 从 EOF 之后开始的洞什么都不做
        t.punch_hole(&inode, 20 * 1024, 1024).unwrap();
        assert_eq!(leaf_extents(&t, &inode), [Extent::new(0, 8, 5000)]);
    }

    #[test]
    fn test_punch_keeps_unwritten_state() {
        let t = test_fs();
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new_unwritten(0, 10, 5000)).unwrap();
        inode.set_size(10 * 1024);
        t.punch_hole(&inode, 2 * 1024, 2 * 1024).unwrap();

        assert_eq!(
            leaf_extents(&t, &inode),
            [
                Extent::new_unwritten(0, 2, 5000),
                Extent::new_unwritten(4, 6, 5004)
            ]
        );
    }

    #[test]
    fn test_truncate_frees_tail() {
        let t = test_fs();
        let inode = ten_blocks(&t);
        inode.set_size(4 * 1024 + 10);
        t.truncate(&inode).unwrap();

        assert_eq!(leaf_extents(&t, &inode), [Extent::new(0, 5, 5000)]);
        assert_eq!(freed(&t), [(5005, 5)]);
        assert_eq!(t.zero_log.lock().as_slice(), &[(12, 4106, 1014)]);
    }

    #[test]
    fn test_truncate_to_zero_multi_level() {
        let t = test_fs();
        let inode = t.new_inode(12);
        for i in 0..200u32 {
            t.insert(&inode, Extent::new(i * 4, 2, 1000 + i as u64 * 4)).unwrap();
        }
        assert_eq!(tree_depth(&inode), 1);
        inode.set_size(0);
        t.truncate(&inode).unwrap();

        assert!(leaf_extents(&t, &inode).is_empty());
        assert_eq!(tree_depth(&inode), 0);
        assert!(t.zero_log.lock().is_empty());
    }

    #[test]
    fn test_preallocate_sets_size() {
        let t = test_fs();
        let inode = t.new_inode(12);
        t.preallocate(&inode, 3072, 2048, false).unwrap();

        let extents = leaf_extents(&t, &inode);
        assert_eq!(extents.len(), 1);
        assert_eq!((extents[0].block, extents[0].actual_len()), (3, 2));
        assert!(extents[0].is_unwritten());
        assert_eq!(inode.size(), 5120);

        // 预分配的块读出来是 unwritten
        let m = t.lookup(&inode, 3, 2).unwrap();
        assert_eq!(m.flags, crate::extent::MapFlags::UNWRITTEN);
    }

    #[test]
    fn test_preallocate_keep_size() {
        let t = test_fs();
        let inode = t.new_inode(12);
        inode.set_size(100);
        t.preallocate(&inode, 0, 8 * 1024, true).unwrap();

        assert_eq!(inode.size(), 100);
        assert!(inode.read().state.contains(InodeState::EOFBLOCKS));
        assert_eq!(leaf_extents(&t, &inode)[0].actual_len(), 8);

        t.truncate(&inode).unwrap();
        assert!(!inode.read().state.contains(InodeState::EOFBLOCKS));
        assert_eq!(leaf_extents(&t, &inode)[0].actual_len(), 1);
    }

    #[test]
    fn test_preallocate_skips_mapped_blocks() {
        let t = test_fs();
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new(2, 2, 5002)).unwrap();
        t.preallocate(&inode, 0, 6 * 1024, false).unwrap();

        let extents = leaf_extents(&t, &inode);
        assert_eq!(extents.len(), 3);
        assert_eq!(extents[1], Extent::new(2, 2, 5002));
        assert!(extents[0].is_unwritten() && extents[2].is_unwritten());
        check_tree(&t, &inode);
    }

    #[test]
    fn test_preallocate_partial_then_no_space() {
        let t = test_fs_with(
            test_config(),
            SimpleJournal::default(),
            MemPageCache::new(4096, TEST_BLOCK_SIZE),
            &[(72, TEST_BLOCKS - 72)],
        );
        let inode = t.new_inode(12);
        let err = t.preallocate(&inode, 0, 20 * 1024, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);

        // 拿到的 8 块保留，大小跟着前进
        assert_eq!(leaf_extents(&t, &inode), [Extent::new_unwritten(0, 8, 64)]);
        assert_eq!(inode.size(), 8 * 1024);
    }

    #[test]
    fn test_preallocate_without_space() {
        let t = test_fs_full();
        let inode = t.new_inode(12);
        let err = t.preallocate(&inode, 0, 4096, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        assert_eq!(inode.size(), 0);
        assert_eq!(
            t.preallocate(&inode, 0, 0, false).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_convert_and_extend() {
        let t = test_fs();
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new_unwritten(0, 8, 5000)).unwrap();
        t.convert_and_extend(&inode, 0, 4 * 1024).unwrap();

        assert_eq!(
            leaf_extents(&t, &inode),
            [Extent::new(0, 4, 5000), Extent::new_unwritten(4, 4, 5004)]
        );
        assert_eq!(inode.size(), 4 * 1024);

        assert_eq!(
            t.convert_and_extend(&inode, 100, 1024).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            t.convert_and_extend(&inode, 8 * 1024, 1024).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_convert_and_extend_empty_file() {
        let t = test_fs();
        let inode = t.new_inode(12);
        let err = t.convert_and_extend(&inode, 0, 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_convert_unwritten_after_dio() {
        let t = test_fs();
        let inode = t.new_inode(12);
        let m = t.resolve(&inode, 0, 8, GetBlocksFlags::DIO_CREATE_EXT).unwrap();
        assert!(inode.read().state.contains(InodeState::DIO_UNWRITTEN));

        t.convert_unwritten_extents(&inode, 0, 4 * 1024).unwrap();
        assert_eq!(
            leaf_extents(&t, &inode),
            [Extent::new(0, 4, m.pblk), Extent::new_unwritten(4, 4, m.pblk + 4)]
        );
        assert!(!inode.read().state.contains(InodeState::DIO_UNWRITTEN));
        check_tree(&t, &inode);
    }

    #[test]
    fn test_convert_unwritten_across_hole() {
        let t = test_fs();
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new_unwritten(0, 4, 5000)).unwrap();
        inode.set_size(10 * 1024);

        t.convert_unwritten_extents(&inode, 0, 8 * 1024).unwrap();

        let leaf = leaf_extents(&t, &inode);
        assert_eq!(leaf.len(), 2);
        assert_eq!(leaf[0], Extent::new(0, 4, 5000));
        // 空洞里新分配的块没有清零，只能是 unwritten
        assert_eq!((leaf[1].block, leaf[1].actual_len()), (4, 4));
        assert!(leaf[1].is_unwritten());
        assert!(t.zero_log.lock().is_empty());

        let m = t.lookup(&inode, 4, 4).unwrap();
        assert!(m.flags.contains(crate::extent::MapFlags::UNWRITTEN));
        check_tree(&t, &inode);
    }
}
