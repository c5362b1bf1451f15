//! FIEMAP
//!
//! 把 extent 树翻译成 `{logical, physical, length, flags}` 记录序列。
//! 空洞不产生记录；空洞中的延迟分配区间产生带 `DELALLOC` 的记录。
//! 最后一条记录带 `LAST`。

use crate::block::BlockDevice;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ExtentFs, ExtentInode, InodeData, InodeState};
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// 记录标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FiemapExtentFlags: u32 {
        /// 最后一条记录
        const LAST        = 0x0001;
        /// 位置未知
        const UNKNOWN     = 0x0002;
        /// 延迟分配，还没有物理块
        const DELALLOC    = 0x0004;
        /// 数据不按块对齐
        const NOT_ALIGNED = 0x0100;
        /// 数据在元数据块内
        const DATA_INLINE = 0x0200;
        /// 已分配但未写入
        const UNWRITTEN   = 0x0800;
    }
}

bitflags! {
    /// 请求标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FiemapFlags: u32 {
        /// 先把缓存写回
        const SYNC  = 0x0001;
        /// 映射扩展属性而不是文件数据
        const XATTR = 0x0002;
    }
}

/// 一条映射记录，单位都是字节
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiemapExtent {
    /// 文件内偏移
    pub logical: u64,
    /// 设备上的偏移
    pub physical: u64,
    /// 长度
    pub length: u64,
    /// 标志
    pub flags: FiemapExtentFlags,
}

/// FIEMAP 请求与结果
#[derive(Debug, Clone, Default)]
pub struct FiemapInfo {
    /// 原始请求标志
    pub flags: u32,
    /// 最多返回的记录数；0 表示只计数
    pub max_extents: usize,
    /// 已映射的记录数
    pub mapped: usize,
    /// 记录
    pub extents: Vec<FiemapExtent>,
}

impl FiemapInfo {
    /// 创建请求
    pub fn new(flags: u32, max_extents: usize) -> Self {
        Self {
            flags,
            max_extents,
            mapped: 0,
            extents: Vec::new(),
        }
    }

    /// 追加一条记录，返回是否应该停止
    fn fill_next(&mut self, logical: u64, physical: u64, length: u64, mut flags: FiemapExtentFlags) -> bool {
        if flags.contains(FiemapExtentFlags::DELALLOC) {
            flags |= FiemapExtentFlags::UNKNOWN;
        }
        if flags.contains(FiemapExtentFlags::DATA_INLINE) {
            flags |= FiemapExtentFlags::NOT_ALIGNED;
        }
        if self.max_extents == 0 {
            self.mapped += 1;
            return flags.contains(FiemapExtentFlags::LAST);
        }
        if self.mapped >= self.max_extents {
            return true;
        }
        self.extents.push(FiemapExtent {
            logical,
            physical,
            length,
            flags,
        });
        self.mapped += 1;
        self.mapped == self.max_extents || flags.contains(FiemapExtentFlags::LAST)
    }
}

/// 一轮遍历找到的区间
struct Span {
    block: u32,
    len: u32,
    pblock: u64,
}

impl<D: BlockDevice> ExtentFs<D> {
    /// FIEMAP 入口
    ///
    /// # 参数
    ///
    /// * `info` - 请求标志、记录上限；结果写回其中
    /// * `start` - 起始字节
    /// * `len` - 字节长度
    ///
    /// # 错误
    ///
    /// - `Unsupported` - 请求了 `SYNC | XATTR` 以外的标志
    /// - `InvalidInput` - 长度为 0
    pub fn fiemap(&self, inode: &ExtentInode, info: &mut FiemapInfo, start: u64, len: u64) -> Result<()> {
        let flags = FiemapFlags::from_bits(info.flags)
            .ok_or(Error::new(ErrorKind::Unsupported, "Unsupported fiemap flags"))?;
        if len == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Zero length fiemap"));
        }
        if flags.contains(FiemapFlags::SYNC) {
            self.sync()?;
        }
        if flags.contains(FiemapFlags::XATTR) {
            let data = inode.read();
            self.xattr_fiemap(&data, info);
            return Ok(());
        }

        let bits = self.config.block_bits();
        let start_blk = start >> bits;
        if start_blk >= EXT_MAX_BLOCKS as u64 {
            return Ok(());
        }
        let last_blk = (start.saturating_add(len - 1) >> bits).min(EXT_MAX_BLOCKS as u64 - 1);
        self.fill_fiemap_extents(inode, start_blk as u32, last_blk + 1, info)
    }

    fn xattr_fiemap(&self, data: &InodeData, info: &mut FiemapInfo) {
        let bits = self.config.block_bits();
        let xattr = &data.xattr;
        let mut flags = FiemapExtentFlags::LAST;
        let (physical, length) = if data.state.contains(InodeState::XATTR) {
            let offset = EXT4_GOOD_OLD_INODE_SIZE + xattr.extra_isize;
            flags |= FiemapExtentFlags::DATA_INLINE;
            (
                (xattr.inode_block << bits) + (xattr.inode_offset + offset) as u64,
                xattr.inode_size.saturating_sub(offset) as u64,
            )
        } else {
            (xattr.file_acl << bits, self.config.block_size as u64)
        };
        if physical != 0 {
            info.fill_next(0, physical, length, flags);
        }
    }

    /// 逐段遍历 `[block, last)`
    ///
    /// 每轮只持有读锁查找一次。延迟分配查找和记录填写都在锁外进行。
    fn fill_fiemap_extents(
        &self,
        inode: &ExtentInode,
        block: u32,
        last: u64,
        info: &mut FiemapInfo,
    ) -> Result<()> {
        let bits = self.config.block_bits();
        let mut block = block as u64;

        while block < last && block < EXT_MAX_BLOCKS as u64 {
            let num = last - block;
            let data = inode.read();
            let path = self.find_extent(&data, block as u32, None)?;
            let ex = path.extent();
            let next = path.next_allocated_block();
            drop(path);
            let ino = data.ino;
            drop(data);

            let mut flags = FiemapExtentFlags::empty();
            let (mut span, mut exists) = match ex {
                Some(ex) if ex.contains(block as u32) => {
                    if ex.is_unwritten() {
                        flags |= FiemapExtentFlags::UNWRITTEN;
                    }
                    let span = Span {
                        block: ex.block,
                        len: ex.actual_len(),
                        pblock: ex.pblock(),
                    };
                    (span, true)
                }
                _ => {
                    let end = match ex {
                        None => block + num,
                        Some(ex) if ex.block as u64 > block => (ex.block as u64).min(block + num),
                        Some(_) => (block + num).min(next as u64),
                    };
                    let span = Span {
                        block: block as u32,
                        len: (end - block) as u32,
                        pblock: 0,
                    };
                    (span, false)
                }
            };

            // 延迟分配区间只会落在空洞中
            let next_del = if exists {
                let after = span.block.saturating_add(span.len);
                self.find_delayed_extent(ino, after, next.saturating_sub(after))
                    .map_or(EXT_MAX_BLOCKS, |d| d.block)
            } else {
                match self.find_delayed_extent(ino, span.block, span.len) {
                    Some(d) => {
                        exists = true;
                        flags |= FiemapExtentFlags::DELALLOC;
                        span.block = d.block;
                        span.len = d.len;
                        let after = d.block.saturating_add(d.len);
                        self.find_delayed_extent(ino, after, next.saturating_sub(after))
                            .map_or(EXT_MAX_BLOCKS, |d| d.block)
                    }
                    None => EXT_MAX_BLOCKS,
                }
            };

            if span.len == 0 {
                log::error!(
                    "[EXT_FIEMAP] inode #{}: empty span at block {}",
                    inode.ino(),
                    block
                );
                return Err(Error::new(ErrorKind::Corrupted, "Empty fiemap span"));
            }
            if next == EXT_MAX_BLOCKS && next_del == EXT_MAX_BLOCKS {
                flags |= FiemapExtentFlags::LAST;
            }
            if exists
                && info.fill_next(
                    (span.block as u64) << bits,
                    span.pblock << bits,
                    (span.len as u64) << bits,
                    flags,
                )
            {
                break;
            }
            block = span.block as u64 + span.len as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balloc::BitmapAllocator;
    use crate::block::MemoryDevice;
    use crate::fs::XattrInfo;
    use crate::page_cache::{DirtyPage, MemPageCache, PageCache};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, Ordering};
    use crate::test_utils::*;
    use crate::transaction::SimpleJournal;
    use crate::types::Extent;

    const KB: u64 = 1024;

    fn two_extents(t: &TestFs) -> ExtentInode {
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new(0, 10, 1000)).unwrap();
        t.insert(&inode, Extent::new_unwritten(20, 5, 1020)).unwrap();
        inode
    }

    #[test]
    fn test_fiemap_extents_and_holes() {
        let t = test_fs();
        let inode = two_extents(&t);
        let mut info = FiemapInfo::new(0, 16);
        t.fiemap(&inode, &mut info, 0, 100 * KB).unwrap();

        assert_eq!(
            info.extents,
            [
                FiemapExtent {
                    logical: 0,
                    physical: 1000 * KB,
                    length: 10 * KB,
                    flags: FiemapExtentFlags::empty(),
                },
                FiemapExtent {
                    logical: 20 * KB,
                    physical: 1020 * KB,
                    length: 5 * KB,
                    flags: FiemapExtentFlags::UNWRITTEN | FiemapExtentFlags::LAST,
                },
            ]
        );
        assert_eq!(info.mapped, 2);
    }

    #[test]
    fn test_fiemap_reports_whole_extent() {
        let t = test_fs();
        let inode = two_extents(&t);
        let mut info = FiemapInfo::new(0, 16);
        t.fiemap(&inode, &mut info, 5 * KB, KB).unwrap();

        assert_eq!(info.extents.len(), 1);
        assert_eq!(info.extents[0].logical, 0);
        assert_eq!(info.extents[0].length, 10 * KB);
    }

    #[test]
    fn test_fiemap_max_extents() {
        let t = test_fs();
        let inode = two_extents(&t);
        let mut info = FiemapInfo::new(0, 1);
        t.fiemap(&inode, &mut info, 0, u64::MAX).unwrap();
        assert_eq!(info.extents.len(), 1);
        assert_eq!(info.mapped, 1);
    }

    #[test]
    fn test_fiemap_count_only_multi_level() {
        let t = test_fs();
        let inode = t.new_inode(12);
        for i in 0..200u32 {
            t.insert(&inode, Extent::new(i * 4, 2, 1000 + i as u64 * 4)).unwrap();
        }
        let mut info = FiemapInfo::new(0, 0);
        t.fiemap(&inode, &mut info, 0, u64::MAX).unwrap();
        assert_eq!(info.mapped, 200);
        assert!(info.extents.is_empty());
    }

    #[test]
    fn test_fiemap_delalloc_after_last_extent() {
        let mut pages = MemPageCache::new(4096, TEST_BLOCK_SIZE);
        pages.mark_delayed(12, 12, 3);
        let t = test_fs_with(test_config(), SimpleJournal::default(), pages, &[(1000, 7000)]);
        let inode = t.new_inode(12);
        t.insert(&inode, Extent::new(0, 10, 1000)).unwrap();

        let mut info = FiemapInfo::new(0, 16);
        t.fiemap(&inode, &mut info, 0, 100 * KB).unwrap();
        assert_eq!(info.extents.len(), 2);
        assert_eq!(info.extents[0].flags, FiemapExtentFlags::empty());
        assert_eq!(
            info.extents[1],
            FiemapExtent {
                logical: 12 * KB,
                physical: 0,
                length: 3 * KB,
                flags: FiemapExtentFlags::DELALLOC
                    | FiemapExtentFlags::UNKNOWN
                    | FiemapExtentFlags::LAST,
            }
        );
    }

    /// 扫描脏页时检查 inode 数据锁是否空闲
    struct LockCheckPages {
        inner: MemPageCache,
        inode: Arc<ExtentInode>,
        locked: Arc<AtomicBool>,
    }

    impl PageCache for LockCheckPages {
        fn page_size(&self) -> u32 {
            self.inner.page_size()
        }

        fn zero_range(&mut self, ino: u32, offset: u64, len: u64) -> Result<()> {
            self.inner.zero_range(ino, offset, len)
        }

        fn find_dirty_pages(&self, ino: u32, start_index: u64, max_pages: usize) -> Vec<DirtyPage> {
            if self.inode.try_write().is_none() {
                self.locked.store(true, Ordering::SeqCst);
            }
            self.inner.find_dirty_pages(ino, start_index, max_pages)
        }
    }

    #[test]
    fn test_fiemap_delalloc_scan_without_inode_lock() {
        let inode = Arc::new(ExtentInode::new(12));
        let locked = Arc::new(AtomicBool::new(false));
        let mut inner = MemPageCache::new(4096, TEST_BLOCK_SIZE);
        inner.mark_delayed(12, 2, 2);
        let pages = LockCheckPages {
            inner,
            inode: Arc::clone(&inode),
            locked: Arc::clone(&locked),
        };
        let zone = test_zone();
        let fs = ExtentFs::new(
            MemoryDevice::new(TEST_BLOCK_SIZE, TEST_BLOCKS),
            test_config(),
            zone.clone(),
            SimpleJournal::default(),
            BitmapAllocator::new(&zone),
            pages,
        )
        .unwrap();

        let mut info = FiemapInfo::new(0, 4);
        fs.fiemap(&inode, &mut info, 0, 10 * KB).unwrap();
        assert!(!locked.load(Ordering::SeqCst));
        assert_eq!(info.extents.len(), 1);
        assert_eq!(info.extents[0].logical, 2 * KB);
        assert_eq!(info.extents[0].length, 2 * KB);
        assert!(info.extents[0].flags.contains(FiemapExtentFlags::DELALLOC));
    }

    #[test]
    fn test_fiemap_xattr() {
        let t = test_fs();
        let inode = t.new_inode(12);
        inode.set_xattr(XattrInfo {
            in_inode: true,
            inode_block: 5,
            inode_offset: 512,
            inode_size: 256,
            extra_isize: 32,
            file_acl: 0,
        });
        let mut info = FiemapInfo::new(FiemapFlags::XATTR.bits(), 4);
        t.fiemap(&inode, &mut info, 0, 1).unwrap();
        assert_eq!(
            info.extents,
            [FiemapExtent {
                logical: 0,
                physical: 5 * KB + 512 + 160,
                length: 96,
                flags: FiemapExtentFlags::LAST
                    | FiemapExtentFlags::DATA_INLINE
                    | FiemapExtentFlags::NOT_ALIGNED,
            }]
        );

        let inode = t.new_inode(13);
        inode.set_xattr(XattrInfo {
            file_acl: 77,
            ..Default::default()
        });
        let mut info = FiemapInfo::new(FiemapFlags::XATTR.bits(), 4);
        t.fiemap(&inode, &mut info, 0, 1).unwrap();
        assert_eq!(info.extents[0].physical, 77 * KB);
        assert_eq!(info.extents[0].length, KB);
        assert_eq!(info.extents[0].flags, FiemapExtentFlags::LAST);

        // 没有 xattr
        let inode = t.new_inode(14);
        let mut info = FiemapInfo::new(FiemapFlags::XATTR.bits(), 4);
        t.fiemap(&inode, &mut info, 0, 1).unwrap();
        assert!(info.extents.is_empty());
    }

    #[test]
    fn test_fiemap_rejects_bad_requests() {
        let t = test_fs();
        let inode = t.new_inode(12);
        let mut info = FiemapInfo::new(0x4, 4);
        assert_eq!(
            t.fiemap(&inode, &mut info, 0, KB).unwrap_err().kind(),
            ErrorKind::Unsupported
        );
        let mut info = FiemapInfo::new(FiemapFlags::SYNC.bits(), 4);
        assert_eq!(
            t.fiemap(&inode, &mut info, 0, 0).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        t.fiemap(&inode, &mut info, 0, KB).unwrap();
        assert!(info.extents.is_empty());
    }
}
