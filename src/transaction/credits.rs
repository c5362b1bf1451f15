//! 事务额度估算
//!
//! 额度公式依赖具体的磁盘布局（块组数、组描述符块数、配额），
//! 所以做成可替换的 [`CreditModel`]。[`Ext4CreditModel`] 是 ext4 的最坏情况估算。

/// 额度估算接口
pub trait CreditModel: Send + Sync {
    /// 修改 extent 树的索引/叶子块所需额度
    ///
    /// `chunk` 表示分配的块在逻辑上连续，只会触及一条路径。
    fn index_trans_blocks(&self, depth: u16, chunk: bool) -> u32;

    /// 映射 `nrblocks` 个块时的全部元数据额度
    ///
    /// 包括树节点、位图、组描述符以及 inode/xattr/配额。
    fn meta_trans_blocks(&self, depth: u16, nrblocks: u32, chunk: bool) -> u32;

    /// 连续分配 `nrblocks` 个块的额度
    fn chunk_trans_blocks(&self, depth: u16, nrblocks: u32) -> u32 {
        self.meta_trans_blocks(depth, nrblocks, true)
    }

    /// 插入单个 extent 的额度
    ///
    /// 叶子还有空位时不需要为分裂计费。
    fn single_extent_credits(&self, depth: u16, leaf_has_room: bool, nrblocks: u32) -> u32;

    /// 删除一个 extent（或其尾部）的额度
    fn remove_extent_credits(&self, depth: u16, len: u32, first_in_leaf: bool) -> u32;

    /// 开始删除空间时预留的额度
    fn truncate_start_credits(&self, depth: u16) -> u32 {
        depth as u32 + 1
    }

    /// 分配器修改位图和组描述符消耗的额度
    fn bitmap_credits(&self) -> u32 {
        2
    }
}

/// xattr 块与 inode 本身
const EXT4_XATTR_TRANS_BLOCKS: u32 = 6;

/// ext4 最坏情况额度模型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext4CreditModel {
    /// 每组块数
    pub blocks_per_group: u32,
    /// 块组数
    pub groups_count: u32,
    /// 组描述符块数
    pub gdt_blocks: u32,
    /// 配额需要的额度（未启用配额时为 0）
    pub quota_blocks: u32,
}

impl Ext4CreditModel {
    /// 按块大小和总块数推算布局
    pub fn for_geometry(block_size: u32, blocks_count: u64) -> Self {
        let blocks_per_group = block_size * 8;
        let groups_count = blocks_count.div_ceil(blocks_per_group as u64).max(1) as u32;
        // 32 字节组描述符
        let descs_per_block = block_size / 32;
        Self {
            blocks_per_group,
            groups_count,
            gdt_blocks: groups_count.div_ceil(descs_per_block),
            quota_blocks: 0,
        }
    }

    fn meta_blocks(&self) -> u32 {
        EXT4_XATTR_TRANS_BLOCKS + self.quota_blocks
    }
}

impl Default for Ext4CreditModel {
    fn default() -> Self {
        Self::for_geometry(4096, 1 << 20)
    }
}

impl CreditModel for Ext4CreditModel {
    fn index_trans_blocks(&self, depth: u16, chunk: bool) -> u32 {
        if chunk {
            depth as u32 * 2
        } else {
            depth as u32 * 3
        }
    }

    fn meta_trans_blocks(&self, depth: u16, nrblocks: u32, chunk: bool) -> u32 {
        let idxblocks = self.index_trans_blocks(depth, chunk);
        let mut groups = idxblocks + if chunk { 1 } else { nrblocks };
        let mut gdpblocks = groups;
        if groups > self.groups_count {
            groups = self.groups_count;
        }
        if groups > self.gdt_blocks {
            gdpblocks = self.gdt_blocks;
        }
        idxblocks + groups + gdpblocks + self.meta_blocks()
    }

    fn single_extent_credits(&self, depth: u16, leaf_has_room: bool, nrblocks: u32) -> u32 {
        if leaf_has_room {
            // 1 个位图 + 1 个组描述符
            2 + self.meta_blocks()
        } else {
            self.chunk_trans_blocks(depth, nrblocks)
        }
    }

    fn remove_extent_credits(&self, depth: u16, len: u32, first_in_leaf: bool) -> u32 {
        let mut credits = 7 + 2 * (len / self.blocks_per_group);
        if first_in_leaf {
            // 需要修正上层索引
            credits += depth as u32 + 1;
        }
        credits + 2 * self.quota_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Ext4CreditModel {
        Ext4CreditModel {
            blocks_per_group: 8192,
            groups_count: 16,
            gdt_blocks: 1,
            quota_blocks: 0,
        }
    }

    #[test]
    fn test_index_trans_blocks() {
        let m = model();
        assert_eq!(m.index_trans_blocks(2, true), 4);
        assert_eq!(m.index_trans_blocks(2, false), 6);
        assert_eq!(m.index_trans_blocks(0, false), 0);
    }

    #[test]
    fn test_meta_trans_blocks_clamped() {
        let m = model();
        // depth 1, chunk: idx=2, groups=3, gdp clamp 到 1
        assert_eq!(m.meta_trans_blocks(1, 100, true), 2 + 3 + 1 + 6);
        // 非 chunk: groups = 3 + 100 -> 16
        assert_eq!(m.meta_trans_blocks(1, 100, false), 3 + 16 + 1 + 6);
    }

    #[test]
    fn test_single_extent_credits() {
        let m = model();
        assert_eq!(m.single_extent_credits(1, true, 8), 8);
        assert_eq!(m.single_extent_credits(1, false, 8), m.chunk_trans_blocks(1, 8));
    }

    #[test]
    fn test_remove_extent_credits() {
        let m = model();
        assert_eq!(m.remove_extent_credits(2, 10, false), 7);
        assert_eq!(m.remove_extent_credits(2, 10, true), 10);
        assert_eq!(m.remove_extent_credits(0, 8192 * 3, false), 13);
        assert_eq!(m.truncate_start_credits(2), 3);
    }

    #[test]
    fn test_geometry() {
        let m = Ext4CreditModel::for_geometry(1024, 65536);
        assert_eq!(m.blocks_per_group, 8192);
        assert_eq!(m.groups_count, 8);
        assert_eq!(m.gdt_blocks, 1);
    }
}
