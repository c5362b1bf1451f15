//! extent 树运行统计

use core::sync::atomic::{AtomicU64, Ordering};

/// 运行统计计数器
///
/// 所有计数器只增不减，测试通过它们观察缓存是否生效、树结构变化了几次。
#[derive(Debug, Default)]
pub struct ExtentStats {
    tree_walks: AtomicU64,
    cache_hits: AtomicU64,
    gap_hits: AtomicU64,
    splits: AtomicU64,
    grows: AtomicU64,
    zeroouts: AtomicU64,
}

impl ExtentStats {
    /// 从根开始的路径查找次数
    pub fn tree_walks(&self) -> u64 {
        self.tree_walks.load(Ordering::Relaxed)
    }

    /// 命中已映射 extent 的缓存次数
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// 命中空洞缓存的次数
    pub fn gap_hits(&self) -> u64 {
        self.gap_hits.load(Ordering::Relaxed)
    }

    /// 节点分裂次数
    pub fn splits(&self) -> u64 {
        self.splits.load(Ordering::Relaxed)
    }

    /// 树深度增长次数
    pub fn grows(&self) -> u64 {
        self.grows.load(Ordering::Relaxed)
    }

    /// 以清零代替拆分的次数
    pub fn zeroouts(&self) -> u64 {
        self.zeroouts.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_tree_walks(&self) {
        self.tree_walks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_gap_hits(&self) {
        self.gap_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_splits(&self) {
        self.splits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_grows(&self) {
        self.grows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_zeroouts(&self) {
        self.zeroouts.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ExtentStats::default();
        stats.inc_tree_walks();
        stats.inc_tree_walks();
        stats.inc_gap_hits();
        assert_eq!(stats.tree_walks(), 2);
        assert_eq!(stats.gap_hits(), 1);
        assert_eq!(stats.cache_hits(), 0);
        assert_eq!(stats.splits(), 0);
    }
}
