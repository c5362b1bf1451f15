//! 块句柄
//!
//! 路径游标在每一层持有一个 [`BlockPin`]。持有期间对应的缓存块不会被驱逐，
//! 句柄 drop 时自动释放，无论是正常返回还是错误提前返回。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

/// 块引用计数表
///
/// 与 [`crate::cache::BlockCache`] 共享：缓存在驱逐前查询此表。
#[derive(Debug, Default)]
pub struct PinTable {
    pins: Mutex<BTreeMap<u64, u32>>,
}

impl PinTable {
    /// 创建空表
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 固定一个块，返回 RAII 句柄
    pub fn pin(self: &Arc<Self>, lba: u64) -> BlockPin {
        *self.pins.lock().entry(lba).or_insert(0) += 1;
        BlockPin {
            lba,
            table: Arc::clone(self),
        }
    }

    /// 块是否被固定
    pub fn is_pinned(&self, lba: u64) -> bool {
        self.pins.lock().contains_key(&lba)
    }

    /// 所有未释放的句柄数
    pub fn outstanding(&self) -> usize {
        self.pins.lock().values().map(|&n| n as usize).sum()
    }

    fn release(&self, lba: u64) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&lba) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&lba);
            }
        }
    }
}

/// 已固定块的句柄
#[derive(Debug)]
pub struct BlockPin {
    lba: u64,
    table: Arc<PinTable>,
}

impl BlockPin {
    /// 块地址
    pub fn lba(&self) -> u64 {
        self.lba
    }
}

impl Drop for BlockPin {
    fn drop(&mut self) {
        self.table.release(self.lba);
    }
}
