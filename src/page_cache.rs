//! 页缓存接口
//!
//! extent 树对页缓存只有两种需求：
//!
//! - 打洞时把边缘不足一块的部分清零
//! - FIEMAP 查找尚未分配物理块的延迟写（delalloc）缓冲区
//!
//! [`MemPageCache`] 是内存实现，按页保存每个块缓冲区的状态。

use crate::error::Result;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    /// 块缓冲区状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferState: u32 {
        /// 已映射到物理块
        const MAPPED    = 0x0001;
        /// 延迟分配：已预留但还没有物理块
        const DELAY     = 0x0002;
        /// 映射到 unwritten extent
        const UNWRITTEN = 0x0004;
        /// 内容有效
        const UPTODATE  = 0x0008;
    }
}

/// 带脏标记的页
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyPage {
    /// 页号（以页大小为单位的文件偏移）
    pub index: u64,
    /// 页内每个块的缓冲区状态
    pub buffers: Vec<BufferState>,
}

/// 页缓存接口
pub trait PageCache {
    /// 页大小（字节）
    fn page_size(&self) -> u32;

    /// 把文件 `[offset, offset + len)` 字节范围清零
    fn zero_range(&mut self, ino: u32, offset: u64, len: u64) -> Result<()>;

    /// 从 `start_index` 开始按页号顺序返回最多 `max_pages` 个脏页
    fn find_dirty_pages(&self, ino: u32, start_index: u64, max_pages: usize) -> Vec<DirtyPage>;
}

/// 清零调用记录 `(ino, offset, len)`
pub type ZeroLog = Arc<Mutex<Vec<(u32, u64, u64)>>>;

/// 内存页缓存
#[derive(Debug)]
pub struct MemPageCache {
    page_size: u32,
    block_size: u32,
    pages: BTreeMap<(u32, u64), Vec<BufferState>>,
    zeroed: ZeroLog,
}

impl MemPageCache {
    /// 创建页缓存
    ///
    /// `page_size` 必须是 `block_size` 的整数倍。
    pub fn new(page_size: u32, block_size: u32) -> Self {
        debug_assert!(page_size >= block_size && page_size % block_size == 0);
        Self {
            page_size,
            block_size,
            pages: BTreeMap::new(),
            zeroed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 清零记录的共享句柄
    pub fn zero_log(&self) -> ZeroLog {
        Arc::clone(&self.zeroed)
    }

    fn blocks_per_page(&self) -> u64 {
        (self.page_size / self.block_size) as u64
    }

    /// 设置逻辑块 `[lblk, lblk + count)` 的缓冲区状态，所在页标记为脏
    pub fn set_state(&mut self, ino: u32, lblk: u64, count: u64, state: BufferState) {
        let per_page = self.blocks_per_page();
        for b in lblk..lblk + count {
            let page = self
                .pages
                .entry((ino, b / per_page))
                .or_insert_with(|| vec![BufferState::empty(); per_page as usize]);
            page[(b % per_page) as usize] = state;
        }
    }

    /// 把逻辑块范围标记为延迟分配
    pub fn mark_delayed(&mut self, ino: u32, lblk: u64, count: u64) {
        self.set_state(ino, lblk, count, BufferState::DELAY | BufferState::MAPPED);
    }

    /// 清除文件的所有脏页
    pub fn clear(&mut self, ino: u32) {
        self.pages.retain(|&(i, _), _| i != ino);
    }
}

impl PageCache for MemPageCache {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn zero_range(&mut self, ino: u32, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        log::trace!("[CACHE] zero ino={} offset={} len={}", ino, offset, len);
        self.zeroed.lock().push((ino, offset, len));
        Ok(())
    }

    fn find_dirty_pages(&self, ino: u32, start_index: u64, max_pages: usize) -> Vec<DirtyPage> {
        self.pages
            .range((ino, start_index)..=(ino, u64::MAX))
            .take(max_pages)
            .map(|(&(_, index), buffers)| DirtyPage {
                index,
                buffers: buffers.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_page_lookup() {
        let mut pc = MemPageCache::new(4096, 1024);
        pc.mark_delayed(5, 6, 4);
        pc.mark_delayed(6, 0, 1);

        let pages = pc.find_dirty_pages(5, 0, 16);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].index, 1);
        assert_eq!(pages[0].buffers[1], BufferState::empty());
        assert!(pages[0].buffers[2].contains(BufferState::DELAY));
        assert_eq!(pages[1].index, 2);

        assert_eq!(pc.find_dirty_pages(5, 2, 16).len(), 1);
        assert_eq!(pc.find_dirty_pages(5, 0, 1).len(), 1);
    }

    #[test]
    fn test_zero_log() {
        let mut pc = MemPageCache::new(4096, 4096);
        let log = pc.zero_log();
        pc.zero_range(3, 100, 0).unwrap();
        pc.zero_range(3, 100, 200).unwrap();
        assert_eq!(log.lock().as_slice(), &[(3, 100, 200)]);
    }
}
