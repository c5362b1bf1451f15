//! Extent 树
//!
//! 文件的逻辑块到物理块的映射保存在一棵 B 树中：根在 inode 的 60 字节
//! `i_block` 里，最多 4 个条目；更深的节点各占一个块。叶子存 extent，
//! 内部节点存索引。
//!
//! ## 子模块
//!
//! - `node` - 节点的内存表示与编解码
//! - `verify` - 节点完整性检查
//! - `checksum` - extent 块尾部校验和
//! - `path` - 根到叶子的路径游标
//! - `cache` - 每个 inode 一个槽的 extent 缓存
//! - `merge` - extent 合并与索引修正
//! - `insert` / `split` / `grow` - 插入、节点分裂、树长高
//! - `remove` - 多层删除
//! - `map` - 块映射入口 `get_blocks`
//! - `unwritten` - unwritten extent 的分裂与转换
//! - `falloc` - 截断、打洞、预分配
//! - `delalloc` - 延迟分配区间查找与元数据估算
//! - `fiemap` - FIEMAP 记录生成
//! - `swap` - 两个文件之间交换 extent
//! - `tree` - 初始化与整体检查
//!
//! ## 锁
//!
//! 只读查找持 inode 数据读锁，任何修改持写锁。extent 缓存有自己的锁，
//! 持读锁时也可以更新。

mod cache;
mod checksum;
mod delalloc;
mod falloc;
mod fiemap;
mod grow;
mod insert;
mod map;
mod merge;
mod node;
mod path;
mod remove;
mod split;
mod swap;
mod tree;
mod unwritten;
mod verify;

pub use cache::{CachedExtent, ExtentCache};
pub use checksum::{block_csum, extent_tail_offset, set_block_csum, verify_block_csum};
pub use delalloc::DelayedExtent;
pub use fiemap::{FiemapExtent, FiemapExtentFlags, FiemapFlags, FiemapInfo};
pub use map::{check_overlap, BlockMapping, GetBlocksFlags, MapFlags};
pub use merge::can_be_merged;
pub use node::{block_capacity, max_entries_for, Node, TreeNode};
pub use path::{ExtentPath, PathLevel};
pub use tree::{check_inode, tree_init};
pub use unwritten::SplitFlags;
pub use verify::{check_header, check_node, ExtentCheckError};
