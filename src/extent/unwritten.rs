//! Unwritten extent 的拆分与转换
//!
//! unwritten extent 的块已经分配，内容未定义，读取时返回零。
//! 写入路径上的状态变化都在这里：
//!
//! - [`ExtentFs::split_extent_at`] 在一个逻辑块处把 extent 一分为二，两边各自决定状态
//! - [`ExtentFs::split_extent`] 最多两次分裂，把一段区间从 extent 中独立出来
//! - [`ExtentFs::convert_to_initialized`] 缓冲写入前把目标区间变成已初始化
//! - 直接 I/O 写入前拆出目标区间（仍为 unwritten），完成后再转换
//!
//! 插入新 extent 分配不到元数据块时，允许 zeroout 的分裂退化为
//! 把块清零、整个 extent 标记为已初始化：
//!
//! ```text
//! split at 5, NoSpace:
//! [0..20 u]  ->  [0..5 u][5..20 u]  (insert fails)
//!            ->  zero 0..20, [0..20 init]
//! ```

use super::map::{BlockMapping, GetBlocksFlags, MapFlags};
use super::merge::try_to_merge;
use super::path::ExtentPath;
use crate::block::BlockDevice;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, InodeData, InodeState};
use crate::transaction::Handle;
use crate::types::Extent;
use bitflags::bitflags;

bitflags! {
    /// extent 分裂标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SplitFlags: u32 {
        /// 插入失败时允许用清零代替分裂
        const MAY_ZEROOUT  = 0x01;
        /// 前半部分标记为 unwritten
        const MARK_UNINIT1 = 0x02;
        /// 后半部分标记为 unwritten
        const MARK_UNINIT2 = 0x04;
        /// 前半部分数据有效，清零时只清后半部分
        const DATA_VALID1  = 0x08;
        /// 后半部分数据有效，清零时只清前半部分
        const DATA_VALID2  = 0x10;
    }
}

/// 路径当前位置的 extent 及其下标
fn current_extent(path: &ExtentPath) -> Result<(usize, Extent)> {
    match (path.leaf().pos, path.extent()) {
        (Some(pos), Some(ex)) => Ok((pos, ex)),
        _ => Err(Error::new(ErrorKind::Corrupted, "No extent at path position")),
    }
}

impl<D: BlockDevice> ExtentFs<D> {
    fn zeroout(&self, ex: &Extent) -> Result<()> {
        self.zero_data_blocks(ex.pblock(), ex.actual_len())
    }

    /// 文件末尾所在的逻辑块（至少覆盖本次请求）
    fn eof_block(&self, data: &InodeData, iblock: u32, max_blocks: u32) -> u64 {
        let bs = self.config.block_size as u64;
        let size_blocks = (data.size + bs - 1) >> self.config.block_bits();
        size_blocks.max(iblock as u64 + max_blocks as u64)
    }

    /// 用 `replacement` 替换起点为 `replacement.block` 的 extent
    ///
    /// 分裂失败后调用：插入过程可能已经改变了树的形状，所以先重新查找。
    fn restore_extent(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        replacement: Extent,
        merge: bool,
    ) -> Result<()> {
        self.refind(data, path, replacement.block)?;
        let (pos, ex) = current_extent(path)?;
        if ex.block != replacement.block {
            log::error!(
                "[EXT_SPLIT] inode #{}: extent at {} lost during split",
                data.ino,
                replacement.block
            );
            return Err(Error::new(ErrorKind::Corrupted, "Split extent lost"));
        }

        let depth = path.leaf_index();
        self.ext_get_access(handle, path, depth)?;
        let extents = path.leaf_mut().extents_mut()?;
        extents[pos] = replacement;
        if merge {
            let merged = try_to_merge(extents, pos);
            path.leaf_mut().pos = Some(merged);
        }
        self.ext_dirty(handle, data, path, depth)?;
        data.cache().invalidate();
        Ok(())
    }

    /// 在逻辑块 `split` 处分裂当前位置的 extent
    ///
    /// `split` 等于 extent 起点时只改变状态：带 `MARK_UNINIT2` 标记为 unwritten，
    /// 否则标记为已初始化。
    ///
    /// # 参数
    ///
    /// * `path` - 当前位置为要分裂的 extent，返回后指向哪里不确定
    /// * `split` - 后半部分的起点
    /// * `split_flag` - 两部分的状态和清零策略
    /// * `flags` - 传给插入；带 `DIO` 时不合并
    ///
    /// # 错误
    ///
    /// 插入失败且不能清零时，原 extent 恢复为分裂前的样子，返回插入的错误。
    pub(crate) fn split_extent_at(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        split: u32,
        split_flag: SplitFlags,
        flags: GetBlocksFlags,
    ) -> Result<()> {
        if split_flag.contains(SplitFlags::DATA_VALID1 | SplitFlags::DATA_VALID2) {
            return Err(Error::new(ErrorKind::InvalidInput, "Both halves marked valid"));
        }
        let (pos, orig) = current_extent(path)?;
        let ee_block = orig.block;
        let ee_len = orig.actual_len();
        if split < ee_block || split as u64 >= orig.end() {
            return Err(Error::new(ErrorKind::InvalidInput, "Split point outside extent"));
        }
        log::debug!(
            "[EXT_SPLIT] inode #{}: split {}:{}:{} at {}, flags {:?}",
            data.ino,
            ee_block,
            ee_len,
            orig.pblock(),
            split,
            split_flag
        );

        let depth = path.leaf_index();
        data.cache().invalidate();
        self.ext_get_access(handle, path, depth)?;

        if split == ee_block {
            let extents = path.leaf_mut().extents_mut()?;
            if split_flag.contains(SplitFlags::MARK_UNINIT2) {
                extents[pos].mark_unwritten();
            } else {
                extents[pos].mark_initialized();
            }
            if !flags.contains(GetBlocksFlags::DIO) {
                let merged = try_to_merge(extents, pos);
                path.leaf_mut().pos = Some(merged);
            }
            return self.ext_dirty(handle, data, path, depth);
        }

        let head = split - ee_block;
        let newblock = orig.pblock() + head as u64;
        {
            let ex = &mut path.leaf_mut().extents_mut()?[pos];
            ex.mark_initialized();
            ex.set_actual_len(head);
            if split_flag.contains(SplitFlags::MARK_UNINIT1) {
                ex.mark_unwritten();
            }
        }
        if let Err(e) = self.ext_dirty(handle, data, path, depth) {
            return self.fix_extent_len(handle, data, path, orig, e);
        }

        let mut ex2 = Extent::new(split, ee_len - head, newblock);
        if split_flag.contains(SplitFlags::MARK_UNINIT2) {
            ex2.mark_unwritten();
        }
        match self.insert_extent(handle, data, path, ex2, flags) {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_space() && split_flag.contains(SplitFlags::MAY_ZEROOUT) => {
                log::debug!(
                    "[EXT_SPLIT] inode #{}: no space for {}:{}, zeroing out",
                    data.ino,
                    split,
                    ee_len - head
                );
                let zeroed = if split_flag.contains(SplitFlags::DATA_VALID1) {
                    self.zeroout(&ex2)
                } else if split_flag.contains(SplitFlags::DATA_VALID2) {
                    self.zeroout(&Extent::new(ee_block, head, orig.pblock()))
                } else {
                    self.zeroout(&orig)
                };
                if let Err(ze) = zeroed {
                    return self.fix_extent_len(handle, data, path, orig, ze);
                }
                let whole = Extent::new(ee_block, ee_len, orig.pblock());
                self.restore_extent(handle, data, path, whole, true)
            }
            Err(e) => self.fix_extent_len(handle, data, path, orig, e),
        }
    }

    /// 把被截短的 extent 恢复原样，然后返回 `err`
    fn fix_extent_len(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        orig: Extent,
        err: Error,
    ) -> Result<()> {
        if let Err(e) = self.restore_extent(handle, data, path, orig, false) {
            log::error!(
                "[EXT_SPLIT] inode #{}: failed to restore {}:{}: {}",
                data.ino,
                orig.block,
                orig.actual_len(),
                e
            );
        }
        Err(err)
    }

    /// 把 `[lblk, lblk + len)` 从当前位置的 extent 中独立出来
    ///
    /// 区间后面有剩余时先在区间末尾分裂（两边保持原状态），
    /// 再在区间起点分裂，区间本身的状态由 `MARK_UNINIT2` 决定。
    ///
    /// # 返回
    ///
    /// `len`
    pub(crate) fn split_extent(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        lblk: u32,
        len: u32,
        split_flag: SplitFlags,
        flags: GetBlocksFlags,
    ) -> Result<u32> {
        let (_, ex) = current_extent(path)?;
        let ee_block = ex.block;
        let unwritten = ex.is_unwritten();
        let end = lblk as u64 + len as u64;

        if end < ex.end() {
            let mut flag1 = split_flag & SplitFlags::MAY_ZEROOUT;
            if unwritten {
                flag1 |= SplitFlags::MARK_UNINIT1 | SplitFlags::MARK_UNINIT2;
            }
            if split_flag.contains(SplitFlags::DATA_VALID2) {
                flag1 |= SplitFlags::DATA_VALID1;
            }
            self.split_extent_at(
                handle,
                data,
                path,
                end as u32,
                flag1,
                flags | GetBlocksFlags::PRE_IO,
            )?;
        }

        self.refind(data, path, lblk)?;
        // 第一次分裂可能已经清零并把整个 extent 转为已初始化
        let unwritten = match path.extent() {
            Some(ex) if ex.contains(lblk) => ex.is_unwritten(),
            _ => unwritten,
        };
        if lblk >= ee_block {
            let mut flag1 = split_flag & (SplitFlags::MAY_ZEROOUT | SplitFlags::DATA_VALID2);
            if unwritten {
                flag1 |= SplitFlags::MARK_UNINIT1;
            }
            if split_flag.contains(SplitFlags::MARK_UNINIT2) {
                flag1 |= SplitFlags::MARK_UNINIT2;
            }
            self.split_extent_at(handle, data, path, lblk, flag1, flags)?;
        }
        Ok(len)
    }

    /// 保证 `lblk` 是某个 extent 的起点
    ///
    /// `lblk` 在空洞中或已经是起点时什么都不做。两部分保持原来的状态。
    pub(crate) fn force_split_extent_at(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        lblk: u32,
        nofail: bool,
    ) -> Result<()> {
        self.refind(data, path, lblk)?;
        let Some(ex) = path.extent() else {
            return Ok(());
        };
        if !ex.contains(lblk) || ex.block == lblk {
            return Ok(());
        }
        let split_flag = if ex.is_unwritten() {
            SplitFlags::MARK_UNINIT1 | SplitFlags::MARK_UNINIT2
        } else {
            SplitFlags::empty()
        };
        let mut flags = GetBlocksFlags::DIO;
        if nofail {
            flags |= GetBlocksFlags::METADATA_NOFAIL;
        }
        self.split_extent_at(handle, data, path, lblk, split_flag, flags)
    }

    /// 把 unwritten extent 中的 `[iblock, iblock + max_blocks)` 转为已初始化
    ///
    /// 短 extent 整体清零；目标区间旁边的剩余部分很短时一起清零，
    /// 少做一次分裂。其余情况分裂成最多三段，只有中间一段是已初始化的。
    ///
    /// # 返回
    ///
    /// 从 `iblock` 开始已初始化的块数，可能大于 `max_blocks`。
    pub(crate) fn convert_to_initialized(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        iblock: u32,
        max_blocks: u32,
        flags: GetBlocksFlags,
    ) -> Result<u32> {
        let (pos, ex) = current_extent(path)?;
        let ee_block = ex.block;
        let ee_len = ex.actual_len();
        let allocated = ee_len - (iblock - ee_block);
        let may_zeroout = ex.end() <= self.eof_block(data, iblock, max_blocks);
        log::debug!(
            "[EXT_UNWRITTEN] inode #{}: convert {}:{} in {}:{}:{}, zeroout {}",
            data.ino,
            iblock,
            max_blocks,
            ee_block,
            ee_len,
            ex.pblock(),
            may_zeroout
        );

        if ee_len <= 2 * EXT4_EXT_ZERO_LEN && may_zeroout {
            self.zeroout(&ex)?;
            let depth = path.leaf_index();
            self.ext_get_access(handle, path, depth)?;
            let extents = path.leaf_mut().extents_mut()?;
            extents[pos].mark_initialized();
            let merged = try_to_merge(extents, pos);
            path.leaf_mut().pos = Some(merged);
            self.ext_dirty(handle, data, path, depth)?;
            data.cache().invalidate();
            return Ok(allocated);
        }

        let (split_flag, max_zeroout) = if may_zeroout {
            (SplitFlags::MAY_ZEROOUT, EXT4_EXT_ZERO_LEN)
        } else {
            (SplitFlags::empty(), 0)
        };
        let mut lblk = iblock;
        let mut len = max_blocks;
        if max_zeroout > 0 && allocated > max_blocks {
            if allocated <= max_zeroout {
                // 尾部很短：连同尾部一起清零
                let off = iblock - ee_block;
                self.zeroout(&Extent::new(iblock, allocated, ex.pblock() + off as u64))?;
                len = allocated;
            } else if iblock - ee_block + max_blocks < max_zeroout {
                // 头部很短
                if iblock != ee_block {
                    self.zeroout(&Extent::new(ee_block, iblock - ee_block, ex.pblock()))?;
                }
                lblk = ee_block;
                len = iblock - ee_block + max_blocks;
            }
        }

        let flags = flags & GetBlocksFlags::METADATA_NOFAIL;
        self.split_extent(handle, data, path, lblk, len, split_flag, flags)?;
        Ok(lblk + len - iblock)
    }

    /// 直接 I/O 写入前：把目标区间拆成独立的 unwritten extent
    fn split_unwritten_extents(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        iblock: u32,
        max_blocks: u32,
        flags: GetBlocksFlags,
    ) -> Result<u32> {
        let (_, ex) = current_extent(path)?;
        let mut split_flag = SplitFlags::MARK_UNINIT2;
        if ex.end() <= self.eof_block(data, iblock, max_blocks) {
            split_flag |= SplitFlags::MAY_ZEROOUT;
        }
        if flags.contains(GetBlocksFlags::CONVERT) {
            split_flag |= SplitFlags::DATA_VALID2;
        }
        self.split_extent(
            handle,
            data,
            path,
            iblock,
            max_blocks,
            split_flag,
            flags | GetBlocksFlags::PRE_IO,
        )
    }

    /// 直接 I/O 完成后：把写过的区间标记为已初始化
    pub(crate) fn convert_unwritten_extents_dio(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        path: &mut ExtentPath,
        iblock: u32,
        max_blocks: u32,
    ) -> Result<()> {
        let (_, ex) = current_extent(path)?;
        if ex.block != iblock || ex.actual_len() > max_blocks {
            log::debug!(
                "[EXT_UNWRITTEN] inode #{}: split {}:{} before dio conversion of {}:{}",
                data.ino,
                ex.block,
                ex.actual_len(),
                iblock,
                max_blocks
            );
            self.split_unwritten_extents(
                handle,
                data,
                path,
                iblock,
                max_blocks,
                GetBlocksFlags::CONVERT | GetBlocksFlags::METADATA_NOFAIL,
            )?;
            self.refind(data, path, iblock)?;
        }

        let (pos, _) = current_extent(path)?;
        let depth = path.leaf_index();
        self.ext_get_access(handle, path, depth)?;
        let extents = path.leaf_mut().extents_mut()?;
        extents[pos].mark_initialized();
        let merged = try_to_merge(extents, pos);
        path.leaf_mut().pos = Some(merged);
        self.ext_dirty(handle, data, path, depth)?;
        data.cache().invalidate();
        Ok(())
    }

    /// 映射落在 unwritten extent 中时按请求标志处理
    ///
    /// - 直接 I/O 写入前：拆分，inode 记下待转换状态
    /// - 直接 I/O 完成：转换
    /// - 重复预分配：原样返回
    /// - 不创建：返回 unwritten 映射
    /// - 缓冲写入：转换为已初始化
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn handle_unwritten(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        mut path: ExtentPath,
        iblock: u32,
        max_blocks: u32,
        flags: GetBlocksFlags,
        allocated: u32,
        newblock: u64,
    ) -> Result<BlockMapping> {
        let flags = flags | GetBlocksFlags::METADATA_NOFAIL;
        let max_blocks = max_blocks.min(allocated);
        let request = flags.difference(GetBlocksFlags::METADATA_NOFAIL);
        log::debug!(
            "[EXT_UNWRITTEN] inode #{}: lblk {} max {} flags {:?} allocated {} pblk {}",
            data.ino,
            iblock,
            max_blocks,
            flags,
            allocated,
            newblock
        );

        let mut mapping = BlockMapping {
            lblk: iblock,
            pblk: newblock,
            len: max_blocks,
            flags: MapFlags::MAPPED,
        };

        if request == GetBlocksFlags::DIO_CREATE_EXT {
            let len =
                self.split_unwritten_extents(handle, data, &mut path, iblock, max_blocks, flags)?;
            data.state.insert(InodeState::DIO_UNWRITTEN);
            mapping.len = len.min(max_blocks);
            mapping.flags = MapFlags::NEW
                | MapFlags::MAPPED
                | MapFlags::UNWRITTEN
                | MapFlags::NEEDS_CONVERSION;
            return Ok(mapping);
        }
        if request == GetBlocksFlags::DIO_CONVERT_EXT {
            self.convert_unwritten_extents_dio(handle, data, &mut path, iblock, max_blocks)?;
            return Ok(mapping);
        }
        if flags.contains(GetBlocksFlags::UNINIT_EXT) {
            mapping.flags |= MapFlags::UNWRITTEN;
            return Ok(mapping);
        }
        if !flags.contains(GetBlocksFlags::CREATE) {
            mapping.flags = MapFlags::UNWRITTEN;
            return Ok(mapping);
        }

        let done = self.convert_to_initialized(handle, data, &mut path, iblock, max_blocks, flags)?;
        mapping.len = done.min(max_blocks);
        mapping.flags = MapFlags::NEW | MapFlags::MAPPED;
        Ok(mapping)
    }
}
