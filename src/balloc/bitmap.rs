//! 位图分配器
//!
//! 覆盖整个设备的一张位图，从目标块开始向后做首次适配，到尾部后回绕。
//! 系统区中的保留区间在创建时标记为已用，永远不会分配出去。

use super::{AllocRequest, BlockAllocator, FreeFlags, SystemZone};
use crate::error::{Error, ErrorKind, Result};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// 分配器调用记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocEvent {
    /// 分配 `(start, len)`
    Alloc {
        /// 起始块
        start: u64,
        /// 长度
        len: u32,
    },
    /// 释放 `(start, len)`
    Free {
        /// 起始块
        start: u64,
        /// 长度
        len: u32,
        /// 标志
        flags: FreeFlags,
    },
}

/// 共享的调用记录
pub type AllocLog = Arc<Mutex<Vec<AllocEvent>>>;

#[inline]
fn test_bit(bitmap: &[u8], index: u64) -> bool {
    bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
}

#[inline]
fn set_bit(bitmap: &mut [u8], index: u64) {
    bitmap[(index / 8) as usize] |= 1 << (index % 8);
}

#[inline]
fn clear_bit(bitmap: &mut [u8], index: u64) {
    bitmap[(index / 8) as usize] &= !(1 << (index % 8));
}

/// 在 `[start, end)` 中查找第一个空闲位
fn find_first_zero(bitmap: &[u8], start: u64, end: u64) -> Option<u64> {
    (start..end).find(|&i| !test_bit(bitmap, i))
}

/// 位图分配器
pub struct BitmapAllocator {
    bitmap: Vec<u8>,
    first_data_block: u64,
    blocks_count: u64,
    free_count: u64,
    log: AllocLog,
}

impl BitmapAllocator {
    /// 按系统区描述创建分配器
    pub fn new(zone: &SystemZone) -> Self {
        let blocks_count = zone.blocks_count();
        let mut alloc = Self {
            bitmap: vec![0u8; blocks_count.div_ceil(8) as usize],
            first_data_block: zone.first_data_block(),
            blocks_count,
            free_count: blocks_count,
            log: Arc::new(Mutex::new(Vec::new())),
        };
        alloc.mark_used(0, zone.first_data_block());
        for &(start, len) in zone.reserved() {
            alloc.mark_used(start, len);
        }
        alloc
    }

    /// 调用记录的共享句柄
    pub fn log(&self) -> AllocLog {
        Arc::clone(&self.log)
    }

    /// 空闲块数
    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    /// 块是否已分配
    pub fn is_allocated(&self, block: u64) -> bool {
        block >= self.blocks_count || test_bit(&self.bitmap, block)
    }

    /// 把范围标记为已用（不记录到调用记录）
    pub fn mark_used(&mut self, start: u64, len: u64) {
        let end = (start + len).min(self.blocks_count);
        for b in start..end {
            if !test_bit(&self.bitmap, b) {
                set_bit(&mut self.bitmap, b);
                self.free_count -= 1;
            }
        }
    }

    /// 从 `from` 开始查找空闲段，返回 `(start, len)`
    fn find_run(&self, from: u64, end: u64, max_len: u32) -> Option<(u64, u32)> {
        let start = find_first_zero(&self.bitmap, from, end)?;
        let mut len = 1u32;
        while len < max_len {
            let next = start + len as u64;
            if next >= end || test_bit(&self.bitmap, next) {
                break;
            }
            len += 1;
        }
        Some((start, len))
    }
}

impl BlockAllocator for BitmapAllocator {
    fn allocate(&mut self, req: &AllocRequest) -> Result<(u64, u32)> {
        if req.len == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Zero length allocation"));
        }

        let goal = if req.goal < self.first_data_block || req.goal >= self.blocks_count {
            self.first_data_block
        } else {
            req.goal
        };

        let found = self
            .find_run(goal, self.blocks_count, req.len)
            .or_else(|| self.find_run(self.first_data_block, goal, req.len));

        let (start, len) = found.ok_or_else(|| {
            log::debug!("[BALLOC] no free block for goal={} len={}", req.goal, req.len);
            Error::new(ErrorKind::NoSpace, "No free blocks available")
        })?;

        for b in start..start + len as u64 {
            set_bit(&mut self.bitmap, b);
        }
        self.free_count -= len as u64;
        self.log.lock().push(AllocEvent::Alloc { start, len });
        log::trace!("[BALLOC] alloc goal={} -> {}+{}", req.goal, start, len);
        Ok((start, len))
    }

    fn free(&mut self, start: u64, count: u32, flags: FreeFlags) -> Result<()> {
        let end = start + count as u64;
        if start < self.first_data_block || end > self.blocks_count {
            log::error!("[BALLOC] freeing blocks outside data area: {}+{}", start, count);
            return Err(Error::new(ErrorKind::Corrupted, "Freeing blocks outside data area"));
        }

        for b in start..end {
            if !test_bit(&self.bitmap, b) {
                log::warn!("[BALLOC] bit already cleared for block {}", b);
                continue;
            }
            clear_bit(&mut self.bitmap, b);
            self.free_count += 1;
        }
        self.log.lock().push(AllocEvent::Free {
            start,
            len: count,
            flags,
        });
        log::trace!("[BALLOC] free {}+{} {:?}", start, count, flags);
        Ok(())
    }
}
