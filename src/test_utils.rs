//! 测试辅助
//!
//! 1024 字节块、16384 块的内存设备。`[1000, 8000)` 预先标记为已用，
//! 测试直接插入指向这段区域的 extent；新分配的数据块和元数据块从空闲区取得。

use crate::balloc::{AllocLog, BitmapAllocator, SystemZone};
use crate::block::MemoryDevice;
use crate::error::Result;
use crate::extent::{GetBlocksFlags, Node};
use crate::fs::{ExtentFs, ExtentInode, FsConfig};
use crate::page_cache::{MemPageCache, ZeroLog};
use crate::transaction::{JournalStats, SimpleJournal};
use crate::types::{Extent, ExtentHeader};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Deref;

pub(crate) const TEST_BLOCK_SIZE: u32 = 1024;
pub(crate) const TEST_BLOCKS: u64 = 16384;

/// 测试用上下文
pub(crate) struct TestFs {
    pub fs: ExtentFs<MemoryDevice>,
    pub alloc_log: AllocLog,
    pub journal_stats: Arc<JournalStats>,
    pub zero_log: ZeroLog,
}

impl Deref for TestFs {
    type Target = ExtentFs<MemoryDevice>;

    fn deref(&self) -> &Self::Target {
        &self.fs
    }
}

pub(crate) fn test_zone() -> SystemZone {
    let mut zone = SystemZone::new(1, TEST_BLOCKS);
    zone.reserve(1, 63);
    zone
}

/// 可定制的测试上下文
pub(crate) fn test_fs_with(
    config: FsConfig,
    journal: SimpleJournal,
    pages: MemPageCache,
    used: &[(u64, u64)],
) -> TestFs {
    let zone = test_zone();
    let mut allocator = BitmapAllocator::new(&zone);
    for &(start, len) in used {
        allocator.mark_used(start, len);
    }
    let alloc_log = allocator.log();
    let journal_stats = journal.stats();
    let zero_log = pages.zero_log();
    let device = MemoryDevice::new(config.block_size, TEST_BLOCKS);
    let fs = ExtentFs::new(device, config, zone, journal, allocator, pages)
        .expect("test fs");
    TestFs {
        fs,
        alloc_log,
        journal_stats,
        zero_log,
    }
}

pub(crate) fn test_config() -> FsConfig {
    FsConfig {
        bcache_size: 64,
        ..FsConfig::with_block_size(TEST_BLOCK_SIZE)
    }
}

pub(crate) fn test_fs() -> TestFs {
    test_fs_with(
        test_config(),
        SimpleJournal::default(),
        MemPageCache::new(4096, TEST_BLOCK_SIZE),
        &[(1000, 7000)],
    )
}

/// 没有空闲块的上下文
pub(crate) fn test_fs_full() -> TestFs {
    test_fs_with(
        test_config(),
        SimpleJournal::default(),
        MemPageCache::new(4096, TEST_BLOCK_SIZE),
        &[(0, TEST_BLOCKS)],
    )
}

impl TestFs {
    pub fn new_inode(&self, ino: u32) -> ExtentInode {
        ExtentInode::new(ino)
    }

    /// 在独立事务中插入一个 extent
    pub fn insert(&self, inode: &ExtentInode, ex: Extent) -> Result<()> {
        self.insert_with_flags(inode, ex, GetBlocksFlags::empty())
    }

    pub fn insert_with_flags(
        &self,
        inode: &ExtentInode,
        ex: Extent,
        flags: GetBlocksFlags,
    ) -> Result<()> {
        let mut data = inode.write();
        let mut handle = self.journal_start(64)?;
        let result = self
            .find_extent(&data, ex.block, None)
            .and_then(|mut path| self.insert_extent(&mut handle, &mut data, &mut path, ex, flags));
        self.finish(handle, result)
    }
}

/// 按顺序列出所有叶子中的 extent
pub(crate) fn leaf_extents(t: &TestFs, inode: &ExtentInode) -> Vec<Extent> {
    let data = inode.read();
    let mut out = Vec::new();
    let mut block = 0u32;
    loop {
        let path = t.find_extent(&data, block, None).unwrap();
        let leaf = path.leaf();
        if let Node::Leaf(v) = &leaf.node.node {
            out.extend(v.iter().filter(|e| e.block >= block).copied());
        }
        let next = path.next_leaf_block();
        if next == crate::consts::EXT_MAX_BLOCKS {
            break;
        }
        block = next;
    }
    out
}

/// 检查整棵树的不变量：节点有序、索引键与子节点一致、extent 不重叠
pub(crate) fn check_tree(t: &TestFs, inode: &ExtentInode) {
    let data = inode.read();
    t.verify_tree(&data).unwrap();
    drop(data);

    let all = leaf_extents(t, inode);
    for w in all.windows(2) {
        assert!(w[0].block < w[1].block, "unordered: {:?}", w);
        assert!(w[0].end() <= w[1].block as u64, "overlap: {:?}", w);
    }
    for ex in &all {
        assert!(ex.actual_len() > 0);
    }
}

pub(crate) fn tree_depth(inode: &ExtentInode) -> u16 {
    ExtentHeader::decode(&inode.read().i_block).depth
}
