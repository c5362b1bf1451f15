//! 合法数据区
//!
//! extent 引用的物理块必须落在 `[first_data_block, blocks_count)` 内，
//! 且不能与保留的元数据区域（超级块、组描述符、位图、inode 表等）重叠。

use alloc::vec::Vec;

/// 系统区描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemZone {
    first_data_block: u64,
    blocks_count: u64,
    /// 按起始块排序、互不重叠的保留区间 `(start, len)`
    reserved: Vec<(u64, u64)>,
}

impl SystemZone {
    /// 创建系统区描述
    pub fn new(first_data_block: u64, blocks_count: u64) -> Self {
        Self {
            first_data_block,
            blocks_count,
            reserved: Vec::new(),
        }
    }

    /// 增加一个保留区间
    pub fn reserve(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let pos = self.reserved.partition_point(|&(s, _)| s < start);
        self.reserved.insert(pos, (start, len));
    }

    /// 第一个数据块
    pub fn first_data_block(&self) -> u64 {
        self.first_data_block
    }

    /// 总块数
    pub fn blocks_count(&self) -> u64 {
        self.blocks_count
    }

    /// 保留区间
    pub fn reserved(&self) -> &[(u64, u64)] {
        &self.reserved
    }

    /// 检查 `[start, start + count)` 是否是合法的数据块范围
    pub fn data_block_valid(&self, start: u64, count: u64) -> bool {
        if count == 0 || start < self.first_data_block {
            return false;
        }
        let end = match start.checked_add(count) {
            Some(end) => end,
            None => return false,
        };
        if end > self.blocks_count {
            return false;
        }
        !self
            .reserved
            .iter()
            .any(|&(rs, rl)| start < rs + rl && rs < end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_block_valid() {
        let mut zone = SystemZone::new(1, 1000);
        zone.reserve(1, 10);
        zone.reserve(500, 2);

        assert!(zone.data_block_valid(11, 100));
        assert!(!zone.data_block_valid(0, 1));
        assert!(!zone.data_block_valid(5, 10));
        assert!(!zone.data_block_valid(499, 2));
        assert!(zone.data_block_valid(502, 498));
        assert!(!zone.data_block_valid(502, 499));
        assert!(!zone.data_block_valid(20, 0));
        assert!(!zone.data_block_valid(u64::MAX, 2));
    }
}
