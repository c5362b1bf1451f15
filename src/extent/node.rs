//! extent 树节点
//!
//! 磁盘上的节点是一个头部加上同一种 12 字节条目的数组，叶子存 [`Extent`]，
//! 索引节点存 [`ExtentIndex`]。内存中用 [`Node`] 区分两者，
//! 编解码只发生在存储边界：读块时 [`TreeNode::decode`]，写回时
//! [`TreeNode::encode_into`]。
//!
//! ```text
//! +--------+---------+---------+-----+---------+--------+
//! | header | entry 0 | entry 1 | ... | (空闲)  | [tail] |
//! +--------+---------+---------+-----+---------+--------+
//!  12 字节   12 字节                             4 字节，仅 extent 块
//! ```

use crate::consts::*;
use crate::types::{Extent, ExtentHeader, ExtentIndex};
use alloc::vec::Vec;

/// 节点条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// 叶子：extent 数组
    Leaf(Vec<Extent>),
    /// 索引节点：索引条目数组
    Index(Vec<ExtentIndex>),
}

impl Node {
    /// 条目数
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(v) => v.len(),
            Node::Index(v) => v.len(),
        }
    }

    /// 是否没有条目
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否为叶子
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// 第 `i` 个条目的起始逻辑块
    pub fn key(&self, i: usize) -> Option<u32> {
        match self {
            Node::Leaf(v) => v.get(i).map(|e| e.block),
            Node::Index(v) => v.get(i).map(|e| e.block),
        }
    }
}

/// 解码后的树节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// 条目容量
    pub max: u16,
    /// 距离叶子层的深度
    pub depth: u16,
    /// 树的 generation
    pub generation: u32,
    /// 条目
    pub node: Node,
}

impl TreeNode {
    /// 空叶子
    pub fn new_leaf(max: u16) -> Self {
        Self {
            max,
            depth: 0,
            generation: 0,
            node: Node::Leaf(Vec::new()),
        }
    }

    /// 空索引节点
    pub fn new_index(max: u16, depth: u16) -> Self {
        debug_assert!(depth > 0);
        Self {
            max,
            depth,
            generation: 0,
            node: Node::Index(Vec::new()),
        }
    }

    /// 有效条目数
    pub fn entries(&self) -> u16 {
        self.node.len() as u16
    }

    /// 是否已满
    pub fn is_full(&self) -> bool {
        self.entries() >= self.max
    }

    /// 是否还有空位
    pub fn has_room(&self) -> bool {
        !self.is_full()
    }

    /// 第一个条目的起始逻辑块
    pub fn first_key(&self) -> Option<u32> {
        self.node.key(0)
    }

    /// 节点头部
    pub fn header(&self) -> ExtentHeader {
        ExtentHeader {
            magic: EXT4_EXTENT_MAGIC,
            entries: self.entries(),
            max: self.max,
            depth: self.depth,
            generation: self.generation,
        }
    }

    /// 从字节解码
    ///
    /// 不做任何校验，只保证不越界：条目数按缓冲区能容纳的数量截断。
    /// 来自磁盘的数据先经过 [`super::verify::check_node`]。
    pub fn decode(buf: &[u8]) -> Self {
        let hdr = ExtentHeader::decode(buf);
        let fit = buf.len().saturating_sub(EXT4_EXT_HEADER_SIZE) / EXT4_EXT_ENTRY_SIZE;
        let count = (hdr.entries as usize).min(fit);
        let entry = |i: usize| {
            let off = EXT4_EXT_HEADER_SIZE + i * EXT4_EXT_ENTRY_SIZE;
            &buf[off..off + EXT4_EXT_ENTRY_SIZE]
        };

        let node = if hdr.depth == 0 {
            Node::Leaf((0..count).map(|i| Extent::decode(entry(i))).collect())
        } else {
            Node::Index((0..count).map(|i| ExtentIndex::decode(entry(i))).collect())
        };

        Self {
            max: hdr.max,
            depth: hdr.depth,
            generation: hdr.generation,
            node,
        }
    }

    /// 编码到 `buf`，未使用的条目槽清零
    pub fn encode_into(&self, buf: &mut [u8]) {
        self.header().encode(&mut buf[..EXT4_EXT_HEADER_SIZE]);
        let slots = &mut buf[EXT4_EXT_HEADER_SIZE..];
        let used = match &self.node {
            Node::Leaf(v) => {
                for (ex, chunk) in v.iter().zip(slots.chunks_exact_mut(EXT4_EXT_ENTRY_SIZE)) {
                    ex.encode(chunk);
                }
                v.len()
            }
            Node::Index(v) => {
                for (ix, chunk) in v.iter().zip(slots.chunks_exact_mut(EXT4_EXT_ENTRY_SIZE)) {
                    ix.encode(chunk);
                }
                v.len()
            }
        };
        let end = (self.max as usize * EXT4_EXT_ENTRY_SIZE).min(slots.len());
        let start = (used * EXT4_EXT_ENTRY_SIZE).min(end);
        slots[start..end].fill(0);
    }
}

/// 块内节点的条目容量
#[inline]
pub fn block_capacity(block_size: u32) -> u16 {
    ((block_size as usize - EXT4_EXT_HEADER_SIZE) / EXT4_EXT_ENTRY_SIZE) as u16
}

/// 节点的条目容量
///
/// 根节点在 inode 内，叶子和索引都是 4；其余节点占一整块。
/// 叶子条目和索引条目大小相同，所以容量与节点种类无关。
#[inline]
pub fn max_entries_for(is_root: bool, block_size: u32) -> u16 {
    if is_root {
        EXT4_EXT_ROOT_CAPACITY
    } else {
        block_capacity(block_size)
    }
}
