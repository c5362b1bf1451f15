//! 单槽 extent 缓存
//!
//! 每个 inode 缓存最近一次解析到的已初始化 extent 或空洞。
//! 命中时不需要遍历树；未命中或被失效时退回完整查找，结果总是正确的。
//! unwritten extent 从不进入缓存。

use spin::Mutex;

/// 缓存内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedExtent {
    /// 起始逻辑块
    pub block: u32,
    /// 长度
    pub len: u32,
    /// 起始物理块，0 表示空洞
    pub start: u64,
}

impl CachedExtent {
    /// 是否为空洞
    pub fn is_gap(&self) -> bool {
        self.start == 0
    }

    /// 逻辑块是否在范围内
    pub fn contains(&self, block: u32) -> bool {
        let block = block as u64;
        block >= self.block as u64 && block < self.block as u64 + self.len as u64
    }
}

/// 单槽缓存
#[derive(Debug, Default)]
pub struct ExtentCache {
    slot: Mutex<Option<CachedExtent>>,
}

impl ExtentCache {
    /// 空缓存
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// 查找覆盖 `block` 的缓存项
    pub fn check(&self, block: u32) -> Option<CachedExtent> {
        let slot = self.slot.lock();
        match *slot {
            Some(ce) if ce.len > 0 && ce.contains(block) => {
                log::trace!(
                    "[EXT_CACHE] {} cached by {}:{}:{}",
                    block,
                    ce.block,
                    ce.len,
                    ce.start
                );
                Some(ce)
            }
            _ => None,
        }
    }

    /// 缓存一个已初始化 extent
    pub fn put(&self, block: u32, len: u32, start: u64) {
        *self.slot.lock() = Some(CachedExtent { block, len, start });
    }

    /// 缓存一个空洞 `[block, block + len)`
    pub fn put_gap(&self, block: u32, len: u32) {
        log::trace!("[EXT_CACHE] gap {}:{}", block, len);
        *self.slot.lock() = Some(CachedExtent {
            block,
            len,
            start: 0,
        });
    }

    /// 当前缓存内容
    pub fn get(&self) -> Option<CachedExtent> {
        *self.slot.lock()
    }

    /// 失效
    pub fn invalidate(&self) {
        *self.slot.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let cache = ExtentCache::new();
        assert!(cache.check(0).is_none());

        cache.put(100, 10, 5000);
        let ce = cache.check(105).unwrap();
        assert_eq!(ce.start, 5000);
        assert!(!ce.is_gap());
        assert!(cache.check(110).is_none());
        assert!(cache.check(99).is_none());

        cache.invalidate();
        assert!(cache.check(105).is_none());
    }

    #[test]
    fn test_gap_to_end_of_address_space() {
        let cache = ExtentCache::new();
        cache.put_gap(10, u32::MAX - 10);
        let ce = cache.check(u32::MAX - 1).unwrap();
        assert!(ce.is_gap());
        assert!(cache.check(9).is_none());
    }

    #[test]
    fn test_zero_length_never_hits() {
        let cache = ExtentCache::new();
        cache.put_gap(5, 0);
        assert!(cache.check(5).is_none());
    }
}
