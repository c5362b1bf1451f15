//! 基于 LRU 的块缓存

use super::buffer::{CacheBuffer, CacheFlags};
use crate::block::PinTable;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::num::NonZeroUsize;
use lru::LruCache;

/// 缓存统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// 命中次数
    pub hits: u64,
    /// 未命中次数
    pub misses: u64,
    /// 驱逐次数
    pub evictions: u64,
    /// 写回次数
    pub writebacks: u64,
}

/// 块缓存
///
/// 脏块在事务提交前不能驱逐；被路径游标固定的块（见 [`PinTable`]）也不驱逐。
/// 两者都不可驱逐时缓存扩容而不是失败。
pub struct BlockCache {
    cache: LruCache<u64, CacheBuffer>,
    dirty_set: BTreeSet<u64>,
    pins: Arc<PinTable>,
    block_size: usize,
    stats: CacheStats,
}

impl BlockCache {
    /// 创建缓存
    ///
    /// # 参数
    ///
    /// * `capacity` - 缓存块数（0 按 1 处理）
    /// * `block_size` - 块大小
    /// * `pins` - 共享的块固定表
    pub fn new(capacity: usize, block_size: usize, pins: Arc<PinTable>) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            dirty_set: BTreeSet::new(),
            pins,
            block_size,
            stats: CacheStats::default(),
        }
    }

    /// 查找块并更新 LRU 顺序
    pub fn get(&mut self, lba: u64) -> Option<&CacheBuffer> {
        match self.cache.get(&lba) {
            Some(buf) if buf.is_uptodate() => {
                self.stats.hits += 1;
                Some(buf)
            }
            _ => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// 查找块（可变）
    pub fn get_mut(&mut self, lba: u64) -> Option<&mut CacheBuffer> {
        self.cache.get_mut(&lba)
    }

    /// 插入或覆盖一个块
    ///
    /// 缓存满时从 LRU 端驱逐第一个既不脏也未固定的块。
    pub fn insert(&mut self, lba: u64, data: &[u8], flags: CacheFlags) -> &mut CacheBuffer {
        if !self.cache.contains(&lba) && self.cache.len() >= self.cache.cap().get() {
            self.evict_one();
        }

        let mut buf = CacheBuffer::new(lba, self.block_size);
        let len = data.len().min(self.block_size);
        buf.data[..len].copy_from_slice(&data[..len]);
        buf.flags = flags | CacheFlags::UPTODATE;
        if buf.is_dirty() {
            self.dirty_set.insert(lba);
        } else {
            self.dirty_set.remove(&lba);
        }
        self.cache.pop(&lba);
        self.cache.get_or_insert_mut(lba, || buf)
    }

    fn evict_one(&mut self) {
        // iter() 按 MRU -> LRU 顺序，反向从最旧的开始
        let victim = self
            .cache
            .iter()
            .rev()
            .map(|(lba, _)| *lba)
            .find(|lba| !self.dirty_set.contains(lba) && !self.pins.is_pinned(*lba));

        match victim {
            Some(lba) => {
                self.cache.pop(&lba);
                self.stats.evictions += 1;
                log::trace!("[CACHE] evicted LBA={:#x}", lba);
            }
            None => {
                let cap = self.cache.cap().get();
                log::warn!(
                    "[CACHE] all {} blocks dirty or pinned, growing cache to {}",
                    cap,
                    cap * 2
                );
                if let Some(new_cap) = NonZeroUsize::new(cap * 2) {
                    self.cache.resize(new_cap);
                }
            }
        }
    }

    /// 标记块为脏
    pub fn mark_dirty(&mut self, lba: u64) {
        if let Some(buf) = self.cache.get_mut(&lba) {
            buf.mark_dirty();
            self.dirty_set.insert(lba);
        }
    }

    /// 取出已写回块的数据并清除脏标记
    ///
    /// 块不在缓存中或不脏时返回 `None`。
    pub fn take_dirty(&mut self, lba: u64) -> Option<Vec<u8>> {
        if !self.dirty_set.remove(&lba) {
            return None;
        }
        let buf = self.cache.get_mut(&lba)?;
        buf.clear_dirty();
        self.stats.writebacks += 1;
        Some(buf.data.clone())
    }

    /// 所有脏块地址
    pub fn dirty_lbas(&self) -> Vec<u64> {
        self.dirty_set.iter().copied().collect()
    }

    /// 使块失效（丢弃缓存内容，包括未写回的修改）
    pub fn invalidate(&mut self, lba: u64) {
        self.cache.pop(&lba);
        self.dirty_set.remove(&lba);
    }

    /// 当前缓存块数
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// 缓存是否为空
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// 统计信息
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
