//! 块映射
//!
//! 把逻辑块解析为物理块，需要时分配新块：
//!
//! 1. 查单槽缓存：命中已映射 extent 直接返回；命中空洞且不创建时返回未映射
//! 2. 查树：覆盖目标的已初始化 extent 写入缓存后返回；
//!    unwritten extent 交给 `unwritten` 模块按标志处理
//! 3. 空洞且不创建：缓存空洞的边界后返回未映射
//! 4. 空洞且创建：找左右邻居作分配提示，按最大长度和下一个已分配块裁剪请求，
//!    分配数据块并插入新 extent；插入失败时释放刚分配的块

use super::node::Node;
use super::path::ExtentPath;
use crate::balloc::{AllocFlags, AllocRequest, FreeFlags};
use crate::block::BlockDevice;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, ExtentInode, InodeData, InodeState};
use crate::transaction::Handle;
use crate::types::{Extent, ExtentHeader};
use bitflags::bitflags;

bitflags! {
    /// 块映射请求标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GetBlocksFlags: u32 {
        /// 允许分配
        const CREATE            = 0x0001;
        /// 分配为 unwritten extent
        const UNINIT_EXT        = 0x0002;
        /// 预分配
        const CREATE_UNINIT_EXT = Self::UNINIT_EXT.bits() | Self::CREATE.bits();
        /// 块已在延迟分配阶段预留
        const DELALLOC_RESERVE  = 0x0004;
        /// 直接 I/O 提交前：拆分 unwritten extent，不做合并
        const DIO               = 0x0008;
        /// [`GetBlocksFlags::DIO`] 的别名
        const PRE_IO            = Self::DIO.bits();
        /// 直接 I/O 完成后转换为已初始化
        const CONVERT           = 0x0010;
        /// 元数据分配不允许失败
        const METADATA_NOFAIL   = 0x0020;
        /// 直接 I/O 写入前的拆分请求
        const DIO_CREATE_EXT    = Self::DIO.bits() | Self::CREATE_UNINIT_EXT.bits();
        /// 直接 I/O 完成后的转换请求
        const DIO_CONVERT_EXT   = Self::CONVERT.bits() | Self::DIO_CREATE_EXT.bits();
    }
}

bitflags! {
    /// 映射结果状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        /// 本次调用新分配或新转换的块
        const NEW              = 0x0001;
        /// 已映射到物理块，可以直接读写
        const MAPPED           = 0x0002;
        /// 映射到 unwritten extent，读取应返回零
        const UNWRITTEN        = 0x0004;
        /// I/O 完成后需要调用转换
        const NEEDS_CONVERSION = 0x0008;
    }
}

/// 一次映射的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapping {
    /// 起始逻辑块
    pub lblk: u32,
    /// 起始物理块，未映射时为 0
    pub pblk: u64,
    /// 连续映射的块数，未映射时为 0
    pub len: u32,
    /// 状态
    pub flags: MapFlags,
}

impl BlockMapping {
    /// 未映射
    pub fn hole(lblk: u32) -> Self {
        Self {
            lblk,
            pblk: 0,
            len: 0,
            flags: MapFlags::empty(),
        }
    }

    /// 是否映射到物理块
    pub fn is_mapped(&self) -> bool {
        self.flags.contains(MapFlags::MAPPED)
    }

    /// 是否为空洞
    pub fn is_hole(&self) -> bool {
        self.len == 0
    }
}

/// 路径上覆盖 `iblock` 的 extent
///
/// 非根叶子为空只在修改过程中出现，查找时视为损坏。
fn covering_extent(data: &InodeData, path: &ExtentPath, iblock: u32) -> Result<Option<Extent>> {
    let ex = path.extent();
    if ex.is_none() && path.depth() != 0 {
        log::error!(
            "[EXT_MAP] inode #{}: bad extent address iblock {}, depth {}, pblock {:?}",
            data.ino,
            iblock,
            path.depth(),
            path.leaf().block
        );
        return Err(Error::new(ErrorKind::Corrupted, "Empty leaf in lookup path"));
    }
    Ok(ex.filter(|e| e.contains(iblock)))
}

/// 把 `newext` 裁剪到下一个已分配块之前
///
/// 返回是否发生了裁剪。
pub fn check_overlap(path: &ExtentPath, newext: &mut Extent) -> bool {
    let Some(ex) = path.extent() else {
        return false;
    };
    let b1 = newext.block;
    let mut len1 = newext.actual_len();
    let mut b2 = ex.block;
    if b2 < b1 {
        b2 = path.next_allocated_block();
        if b2 == EXT_MAX_BLOCKS {
            return false;
        }
    }

    let mut clamped = false;
    // 逻辑块回绕
    if b1 as u64 + len1 as u64 > EXT_MAX_BLOCKS as u64 {
        len1 = EXT_MAX_BLOCKS - b1;
        clamped = true;
    }
    if b1 as u64 + len1 as u64 > b2 as u64 {
        len1 = b2 - b1;
        clamped = true;
    }
    if clamped {
        newext.set_actual_len(len1);
    }
    clamped
}

impl<D: BlockDevice> ExtentFs<D> {
    /// 为逻辑块 `block` 选择物理分配目标
    ///
    /// 依次尝试：路径上的 extent 按逻辑距离推算、叶子所在块、
    /// inode 所在块组的起始块。
    pub(crate) fn find_goal(&self, data: &InodeData, path: &ExtentPath, block: u32) -> u64 {
        if let Some(ex) = path.extent() {
            let diff = block as i64 - ex.block as i64;
            return (ex.pblock() as i64).saturating_add(diff).max(0) as u64;
        }
        if let Some(b) = path.leaf().block {
            return b;
        }

        let bg_start = if data.goal_hint != 0 {
            data.goal_hint
        } else {
            self.zone.first_data_block()
        };
        if self.config.delalloc {
            bg_start
        } else {
            bg_start + block as u64
        }
    }

    /// 左侧最近的已分配块
    ///
    /// 返回 `(逻辑块, 物理块)`；左侧没有 extent 时返回 `(logical, 0)`。
    pub(crate) fn search_left(
        &self,
        data: &InodeData,
        path: &ExtentPath,
        logical: u32,
    ) -> Result<(u32, u64)> {
        let depth = path.leaf_index();
        let Some(ex) = path.extent() else {
            if depth == 0 {
                return Ok((logical, 0));
            }
            return Err(Error::new(ErrorKind::Corrupted, "Empty leaf in search path"));
        };

        if logical < ex.block {
            // 目标在整个文件的第一个 extent 之前
            if (0..=depth).any(|d| path.level(d).pos != Some(0)) {
                log::error!(
                    "[EXT_MAP] inode #{}: logical {} before ee_block {} but not first",
                    data.ino,
                    logical,
                    ex.block
                );
                return Err(Error::new(ErrorKind::Corrupted, "Path is not leftmost"));
            }
            return Ok((logical, 0));
        }
        if (logical as u64) < ex.end() {
            log::error!(
                "[EXT_MAP] inode #{}: logical {} < ee_block {} + ee_len {}",
                data.ino,
                logical,
                ex.block,
                ex.actual_len()
            );
            return Err(Error::new(ErrorKind::Corrupted, "Logical block inside extent"));
        }

        let len = ex.actual_len();
        Ok((ex.block + len - 1, ex.pblock() + len as u64 - 1))
    }

    /// 右侧最近的已分配块
    ///
    /// 当前叶子用完时沿下一个索引进入右边的子树。
    /// 右侧没有 extent 时返回 `(logical, 0)`。
    pub(crate) fn search_right(
        &self,
        data: &InodeData,
        path: &ExtentPath,
        logical: u32,
    ) -> Result<(u32, u64)> {
        let depth = path.leaf_index();
        let Some(ex) = path.extent() else {
            if depth == 0 {
                return Ok((logical, 0));
            }
            return Err(Error::new(ErrorKind::Corrupted, "Empty leaf in search path"));
        };

        if logical < ex.block {
            if (0..=depth).any(|d| path.level(d).pos != Some(0)) {
                log::error!(
                    "[EXT_MAP] inode #{}: logical {} before ee_block {} but not first",
                    data.ino,
                    logical,
                    ex.block
                );
                return Err(Error::new(ErrorKind::Corrupted, "Path is not leftmost"));
            }
            return Ok((ex.block, ex.pblock()));
        }
        if (logical as u64) < ex.end() {
            log::error!(
                "[EXT_MAP] inode #{}: logical {} < ee_block {} + ee_len {}",
                data.ino,
                logical,
                ex.block,
                ex.actual_len()
            );
            return Err(Error::new(ErrorKind::Corrupted, "Logical block inside extent"));
        }

        let leaf = path.leaf();
        if let Some(pos) = leaf.pos {
            if let Some(next) = leaf.extents()?.get(pos + 1) {
                return Ok((next.block, next.pblock()));
            }
        }

        // 向上找右边还有索引的层
        let found = (0..depth).rev().find(|&k| {
            let level = path.level(k);
            matches!(level.pos, Some(p) if p + 1 < level.entries())
        });
        let Some(k) = found else {
            return Ok((logical, 0));
        };
        let pos = path.level(k).pos.unwrap_or(0);
        let mut block = path.level(k).indexes()?[pos + 1].leaf();

        for d in k + 1..depth {
            let (node, _pin) = self.read_extent_block(data, block, (depth - d) as u16)?;
            block = match &node.node {
                Node::Index(v) if !v.is_empty() => v[0].leaf(),
                _ => return Err(Error::new(ErrorKind::Corrupted, "Empty index node")),
            };
        }
        let (node, _pin) = self.read_extent_block(data, block, 0)?;
        match &node.node {
            Node::Leaf(v) if !v.is_empty() => Ok((v[0].block, v[0].pblock())),
            _ => Err(Error::new(ErrorKind::Corrupted, "Empty leaf node")),
        }
    }

    /// 缓存 `block` 所在的空洞
    pub(crate) fn put_gap(&self, data: &InodeData, path: &ExtentPath, block: u32) {
        let (start, len) = match path.extent() {
            None => (0, EXT_MAX_BLOCKS),
            Some(ex) if block < ex.block => (block, ex.block - block),
            Some(ex) if block as u64 >= ex.end() => {
                let start = ex.end() as u32;
                let next = path.next_allocated_block();
                (start, next.saturating_sub(start))
            }
            Some(ex) => {
                log::warn!(
                    "[EXT_CACHE] inode #{}: {} is covered by {}:{}, not a gap",
                    data.ino,
                    block,
                    ex.block,
                    ex.actual_len()
                );
                return;
            }
        };
        if len > 0 {
            data.cache().put_gap(start, len);
        }
    }

    /// 只读映射（调用者至少持有读锁）
    ///
    /// unwritten extent 返回 [`MapFlags::UNWRITTEN`]，不带 `MAPPED`。
    pub fn lookup_locked(
        &self,
        data: &InodeData,
        iblock: u32,
        max_blocks: u32,
    ) -> Result<BlockMapping> {
        if max_blocks == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Zero length mapping"));
        }

        if let Some(ce) = data.cache().check(iblock) {
            if ce.is_gap() {
                self.stats.inc_gap_hits();
                return Ok(BlockMapping::hole(iblock));
            }
            self.stats.inc_cache_hits();
            let off = iblock - ce.block;
            return Ok(BlockMapping {
                lblk: iblock,
                pblk: ce.start + off as u64,
                len: (ce.len - off).min(max_blocks),
                flags: MapFlags::MAPPED,
            });
        }

        let path = self.find_extent(data, iblock, None)?;
        match covering_extent(data, &path, iblock)? {
            Some(ex) => {
                let off = iblock - ex.block;
                let mut m = BlockMapping {
                    lblk: iblock,
                    pblk: ex.pblock() + off as u64,
                    len: (ex.actual_len() - off).min(max_blocks),
                    flags: MapFlags::MAPPED,
                };
                if ex.is_unwritten() {
                    m.flags = MapFlags::UNWRITTEN;
                } else {
                    data.cache().put(ex.block, ex.actual_len(), ex.pblock());
                }
                log::trace!("[EXT_MAP] {} fit into {}:{} -> {}", iblock, ex.block, ex.actual_len(), m.pblk);
                Ok(m)
            }
            None => {
                self.put_gap(data, &path, iblock);
                Ok(BlockMapping::hole(iblock))
            }
        }
    }

    /// 映射或分配块（调用者持有写锁和事务）
    ///
    /// # 参数
    ///
    /// * `handle` - 事务句柄
    /// * `data` - inode 数据
    /// * `iblock` - 起始逻辑块
    /// * `max_blocks` - 最多映射的块数
    /// * `flags` - 请求标志
    ///
    /// # 返回
    ///
    /// 从 `iblock` 开始的一段连续映射，长度不超过 `max_blocks`。
    /// 不带 `CREATE` 时空洞返回长度为 0 的映射。
    ///
    /// # 错误
    ///
    /// - `NoSpace` - 数据块或元数据块分配失败
    /// - `Corrupted` - 树结构损坏
    pub fn get_blocks(
        &self,
        handle: &mut Handle,
        data: &mut InodeData,
        iblock: u32,
        max_blocks: u32,
        flags: GetBlocksFlags,
    ) -> Result<BlockMapping> {
        if !flags.contains(GetBlocksFlags::CREATE) {
            return self.lookup_locked(data, iblock, max_blocks);
        }
        if max_blocks == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Zero length mapping"));
        }
        log::trace!(
            "[EXT_MAP] inode #{}: blocks {}/{} requested, flags {:?}",
            data.ino,
            iblock,
            max_blocks,
            flags
        );

        if let Some(ce) = data.cache().check(iblock) {
            if !ce.is_gap() {
                self.stats.inc_cache_hits();
                let off = iblock - ce.block;
                return Ok(BlockMapping {
                    lblk: iblock,
                    pblk: ce.start + off as u64,
                    len: (ce.len - off).min(max_blocks),
                    flags: MapFlags::MAPPED,
                });
            }
        }

        let mut path = self.find_extent(data, iblock, None)?;
        if let Some(ex) = covering_extent(data, &path, iblock)? {
            let off = iblock - ex.block;
            let newblock = ex.pblock() + off as u64;
            let allocated = ex.actual_len() - off;
            if !ex.is_unwritten() {
                data.cache().put(ex.block, ex.actual_len(), ex.pblock());
                return Ok(BlockMapping {
                    lblk: iblock,
                    pblk: newblock,
                    len: allocated.min(max_blocks),
                    flags: MapFlags::MAPPED,
                });
            }
            return self.handle_unwritten(
                handle, data, path, iblock, max_blocks, flags, allocated, newblock,
            );
        }

        let (lleft, pleft) = self.search_left(data, &path, iblock)?;
        let (lright, pright) = self.search_right(data, &path, iblock)?;

        let uninit = flags.contains(GetBlocksFlags::UNINIT_EXT);
        let max_blocks = if uninit {
            max_blocks.min(EXT_UNINIT_MAX_LEN)
        } else {
            max_blocks.min(EXT_INIT_MAX_LEN)
        };

        let mut newex = Extent::new(iblock, max_blocks, 0);
        check_overlap(&path, &mut newex);
        let want = newex.actual_len();

        let mut aflags = AllocFlags::HINT_DATA;
        if flags.contains(GetBlocksFlags::DELALLOC_RESERVE) {
            aflags |= AllocFlags::DELALLOC_RESERVED;
        }
        let req = AllocRequest {
            logical: iblock,
            goal: self.find_goal(data, &path, iblock),
            len: want,
            lleft,
            pleft,
            lright,
            pright,
            flags: aflags,
        };
        let (newblock, got) = self.alloc_blocks(handle, &req)?;
        log::debug!(
            "[EXT_MAP] allocate new block: goal {}, found {}/{}",
            req.goal,
            newblock,
            got
        );

        let newex = if uninit {
            Extent::new_unwritten(iblock, got, newblock)
        } else {
            Extent::new(iblock, got, newblock)
        };
        if let Err(e) = self.insert_extent(handle, data, &mut path, newex, flags) {
            log::debug!(
                "[EXT_MAP] inode #{}: insert failed, freeing {}+{}",
                data.ino,
                newblock,
                got
            );
            if let Err(fe) = self.free_blocks(handle, newblock, got, FreeFlags::empty()) {
                log::warn!("[EXT_MAP] failed to free {}+{}: {}", newblock, got, fe);
            }
            return Err(e);
        }

        let mut mflags = MapFlags::NEW | MapFlags::MAPPED;
        let allocated = got.min(max_blocks);
        if uninit {
            mflags |= MapFlags::UNWRITTEN;
            if flags.difference(GetBlocksFlags::METADATA_NOFAIL) == GetBlocksFlags::DIO_CREATE_EXT {
                data.state.insert(InodeState::DIO_UNWRITTEN);
                mflags |= MapFlags::NEEDS_CONVERSION;
            }
        } else {
            data.cache().put(iblock, allocated, newblock);
        }

        Ok(BlockMapping {
            lblk: iblock,
            pblk: newblock,
            len: allocated,
            flags: mflags,
        })
    }

    /// 按当前树深度估算一次映射的事务额度
    pub(crate) fn map_credits(&self, data: &InodeData, count: u32) -> u32 {
        let depth = ExtentHeader::decode(&data.i_block).depth;
        self.credits
            .chunk_trans_blocks(depth, count.min(EXT_INIT_MAX_LEN))
    }

    /// 块映射入口
    ///
    /// 不带 `CREATE` 时只持读锁、不开事务；否则持写锁并在自己的事务中完成。
    pub fn resolve(
        &self,
        inode: &ExtentInode,
        lblk: u32,
        count: u32,
        flags: GetBlocksFlags,
    ) -> Result<BlockMapping> {
        if !flags.contains(GetBlocksFlags::CREATE) {
            let data = inode.read();
            return self.lookup_locked(&data, lblk, count);
        }

        let mut data = inode.write();
        let mut handle = self.journal_start(self.map_credits(&data, count))?;
        let result = self.get_blocks(&mut handle, &mut data, lblk, count, flags);
        self.finish(handle, result)
    }

    /// 只读查找
    pub fn lookup(&self, inode: &ExtentInode, lblk: u32, count: u32) -> Result<BlockMapping> {
        self.resolve(inode, lblk, count, GetBlocksFlags::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_composite_flags() {
        assert_eq!(GetBlocksFlags::CREATE_UNINIT_EXT.bits(), 0x0003);
        assert_eq!(
            GetBlocksFlags::DIO_CREATE_EXT,
            GetBlocksFlags::DIO | GetBlocksFlags::UNINIT_EXT | GetBlocksFlags::CREATE
        );
        assert_eq!(GetBlocksFlags::DIO_CREATE_EXT.bits(), 0x000b);
        // 转换也要带 UNINIT_EXT，空洞里只能分配 unwritten extent
        assert_eq!(
            GetBlocksFlags::DIO_CONVERT_EXT,
            GetBlocksFlags::CONVERT | GetBlocksFlags::DIO_CREATE_EXT
        );
        assert_eq!(GetBlocksFlags::DIO_CONVERT_EXT.bits(), 0x001b);
        assert!(GetBlocksFlags::DIO_CONVERT_EXT.contains(GetBlocksFlags::UNINIT_EXT));
    }

    #[test]
    fn test_resolve_inside_extent() {
        let t = test_fs();
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new(0, 10, 1000)).unwrap();

        let m = t.lookup(&inode, 5, 100).unwrap();
        assert_eq!(m.pblk, 1005);
        assert_eq!(m.len, 5);
        assert!(m.is_mapped());

        let m = t.lookup(&inode, 5, 2).unwrap();
        assert_eq!(m.len, 2);
    }

    #[test]
    fn test_gap_cached_after_miss() {
        let t = test_fs();
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new(0, 10, 1000)).unwrap();
        t.insert(&inode, Extent::new(100, 10, 2000)).unwrap();

        let m = t.lookup(&inode, 50, 1).unwrap();
        assert!(m.is_hole());
        let walks = t.stats().tree_walks();

        for b in [10u32, 42, 99] {
            let m = t.lookup(&inode, b, 4).unwrap();
            assert!(m.is_hole());
        }
        assert_eq!(t.stats().tree_walks(), walks);
        assert_eq!(t.stats().gap_hits(), 3);

        // 边界外需要重新遍历
        assert!(t.lookup(&inode, 105, 1).unwrap().is_mapped());
        assert_eq!(t.stats().tree_walks(), walks + 1);
    }

    #[test]
    fn test_gap_in_empty_file_covers_everything() {
        let t = test_fs();
        let inode = t.new_inode(12);
        assert!(t.lookup(&inode, 7, 1).unwrap().is_hole());
        let ce = inode.read().cache().get().unwrap();
        assert_eq!((ce.block, ce.len, ce.start), (0, EXT_MAX_BLOCKS, 0));
    }

    #[test]
    fn test_mapped_cache_hit() {
        let t = test_fs();
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new(0, 10, 1000)).unwrap();
        t.lookup(&inode, 1, 1).unwrap();
        let walks = t.stats().tree_walks();
        let m = t.lookup(&inode, 8, 10).unwrap();
        assert_eq!((m.pblk, m.len), (1008, 2));
        assert_eq!(t.stats().tree_walks(), walks);
        assert_eq!(t.stats().cache_hits(), 1);
    }

    #[test]
    fn test_create_allocates_near_neighbour() {
        let t = test_fs();
        let inode = t.new_inode(12);
        let m = t.resolve(&inode, 0, 8, GetBlocksFlags::CREATE).unwrap();
        assert!(m.flags.contains(MapFlags::NEW | MapFlags::MAPPED));
        assert_eq!(m.len, 8);
        let first = m.pblk;

        let m = t.resolve(&inode, 8, 8, GetBlocksFlags::CREATE).unwrap();
        assert_eq!(m.pblk, first + 8);
        assert_eq!(leaf_extents(&t, &inode), [Extent::new(0, 16, first)]);

        // 已映射的块不会重新分配
        let again = t.resolve(&inode, 4, 8, GetBlocksFlags::CREATE).unwrap();
        assert_eq!(again.pblk, first + 4);
        assert!(!again.flags.contains(MapFlags::NEW));
    }

    #[test]
    fn test_create_clamped_by_next_extent() {
        let t = test_fs();
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new(20, 5, 1020)).unwrap();
        let m = t.resolve(&inode, 10, 50, GetBlocksFlags::CREATE).unwrap();
        assert_eq!(m.len, 10);
        check_tree(&t, &inode);

        // 第一个 extent 之前的空洞
        let m = t.resolve(&inode, 0, 50, GetBlocksFlags::CREATE).unwrap();
        assert_eq!(m.len, 10);
        check_tree(&t, &inode);
    }

    #[test]
    fn test_create_unwritten_not_cached() {
        let t = test_fs();
        let inode = t.new_inode(12);
        let m = t
            .resolve(&inode, 0, 4, GetBlocksFlags::CREATE_UNINIT_EXT)
            .unwrap();
        assert!(m.flags.contains(MapFlags::UNWRITTEN));
        assert!(!m.flags.contains(MapFlags::NEEDS_CONVERSION));
        assert!(inode.read().cache().get().is_none());
        assert!(leaf_extents(&t, &inode)[0].is_unwritten());

        let m = t.lookup(&inode, 1, 8).unwrap();
        assert_eq!(m.flags, MapFlags::UNWRITTEN);
        assert_eq!(m.len, 3);
        assert!(inode.read().cache().get().is_none());
    }

    #[test]
    fn test_dio_create_marks_inode() {
        let t = test_fs();
        let inode = t.new_inode(12);
        let m = t.resolve(&inode, 0, 4, GetBlocksFlags::DIO_CREATE_EXT).unwrap();
        assert!(m.flags.contains(MapFlags::NEEDS_CONVERSION));
        assert!(inode.read().state.contains(InodeState::DIO_UNWRITTEN));
    }

    #[test]
    fn test_no_space_propagates() {
        let t = test_fs_full();
        let inode = t.new_inode(12);
        let err = t.resolve(&inode, 0, 4, GetBlocksFlags::CREATE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        assert!(leaf_extents(&t, &inode).is_empty());
    }

    #[test]
    fn test_check_overlap() {
        let t = test_fs();
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new(0, 10, 1000)).unwrap();
        t.insert(&inode, Extent::new(30, 10, 1030)).unwrap();
        let data = inode.read();
        let path = t.find_extent(&data, 15, None).unwrap();

        let mut ex = Extent::new(15, 100, 0);
        assert!(check_overlap(&path, &mut ex));
        assert_eq!(ex.actual_len(), 15);

        let mut ex = Extent::new(15, 5, 0);
        assert!(!check_overlap(&path, &mut ex));
        assert_eq!(ex.actual_len(), 5);
    }

    #[test]
    fn test_search_neighbours_across_leaves() {
        let t = test_fs();
        let inode = t.new_inode(12);
        for i in 0..100u32 {
            t.insert(&inode, Extent::new(i * 4, 2, 1000 + i as u64 * 4)).unwrap();
        }
        let data = inode.read();
        let path = t.find_extent(&data, 0, None).unwrap();
        let first_leaf_last = path.leaf().extents().unwrap().last().copied().unwrap();
        let hole = first_leaf_last.block + 2;
        let path = t.find_extent(&data, hole, Some(path)).unwrap();

        let (ll, pl) = t.search_left(&data, &path, hole).unwrap();
        assert_eq!(ll, first_leaf_last.block + 1);
        assert_eq!(pl, first_leaf_last.pblock() + 1);

        // 右边的 extent 在下一个叶子里
        let (lr, pr) = t.search_right(&data, &path, hole).unwrap();
        assert_eq!(lr, hole + 2);
        assert_eq!(pr, 1000 + lr as u64);

        let path = t.find_extent(&data, 1000, Some(path)).unwrap();
        assert_eq!(t.search_right(&data, &path, 1000).unwrap(), (1000, 0));
    }
}
