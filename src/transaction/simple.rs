//! 简化的事务系统实现
//!
//! ⚠️ **重要警告**：此实现不提供崩溃恢复保证！
//!
//! ## 工作原理
//!
//! 1. **记录修改**: 句柄跟踪所有获得写权限和被标脏的块
//! 2. **延迟写入**: 修改保存在 block cache 中，不立即写入磁盘
//! 3. **提交**: 调用者把句柄中的脏块写回磁盘后调用 `commit`
//! 4. **回滚**: 调用者让脏块在缓存中失效后调用 `abort`
//!
//! ## 额度
//!
//! 每个事务最多预留 `max_credits` 个额度。`extend` 超过上限时返回
//! [`ExtendStatus::RestartNeeded`]，调用者需要提交后在新事务中继续。

use super::{DirtyTarget, ExtendStatus, Handle, Journal, TransactionState};
use crate::error::{Error, ErrorKind, Result};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// 默认单个事务额度上限
pub const DEFAULT_MAX_CREDITS: u32 = 1024;

/// 事务统计
#[derive(Debug, Default)]
pub struct JournalStats {
    begins: AtomicU64,
    commits: AtomicU64,
    restarts: AtomicU64,
    extends: AtomicU64,
    aborts: AtomicU64,
    overruns: AtomicU64,
}

impl JournalStats {
    /// 开始的事务数
    pub fn begins(&self) -> u64 {
        self.begins.load(Ordering::Relaxed)
    }

    /// 提交的事务数
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// 重启次数
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// 成功追加额度的次数
    pub fn extends(&self) -> u64 {
        self.extends.load(Ordering::Relaxed)
    }

    /// 中止的事务数
    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    /// 超出额度的次数
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// 简化的事务系统
///
/// ⚠️ 不提供崩溃一致性保证，仅用于开发和测试
#[derive(Debug)]
pub struct SimpleJournal {
    next_id: u64,
    max_credits: u32,
    stats: Arc<JournalStats>,
    /// 第 N 次写权限请求之后全部失败（故障注入）
    fail_after: Option<u64>,
    accesses: u64,
}

impl SimpleJournal {
    /// 创建事务系统
    pub fn new(max_credits: u32) -> Self {
        Self {
            next_id: 1,
            max_credits,
            stats: Arc::new(JournalStats::default()),
            fail_after: None,
            accesses: 0,
        }
    }

    /// 允许 `n` 次写权限请求，之后的请求返回 I/O 错误
    pub fn fail_write_access_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// 统计信息的共享句柄
    pub fn stats(&self) -> Arc<JournalStats> {
        Arc::clone(&self.stats)
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_active(handle: &Handle) -> Result<()> {
        if !handle.is_active() {
            return Err(Error::new(ErrorKind::InvalidState, "Transaction is not active"));
        }
        Ok(())
    }

    fn access(&mut self, handle: &mut Handle, block: u64) -> Result<()> {
        Self::check_active(handle)?;
        if let Some(limit) = self.fail_after {
            if self.accesses >= limit {
                log::error!("[JOURNAL] write access to block {} denied", block);
                return Err(Error::new(ErrorKind::Io, "Journal write access failed"));
            }
        }
        self.accesses += 1;
        if handle.grant_access(block) {
            JournalStats::bump(&self.stats.overruns);
            log::warn!(
                "[JOURNAL] transaction {} ran out of credits at block {}",
                handle.id(),
                block
            );
        }
        Ok(())
    }
}

impl Default for SimpleJournal {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CREDITS)
    }
}

impl Journal for SimpleJournal {
    fn begin(&mut self, credits: u32) -> Result<Handle> {
        if credits > self.max_credits {
            return Err(Error::new(ErrorKind::NoSpace, "Transaction too large for journal"));
        }
        JournalStats::bump(&self.stats.begins);
        let id = self.alloc_id();
        log::trace!("[JOURNAL] begin transaction {} credits={}", id, credits);
        Ok(Handle::new(id, credits))
    }

    fn extend(&mut self, handle: &mut Handle, credits: u32) -> Result<ExtendStatus> {
        Self::check_active(handle)?;
        if handle.reserved() as u64 + credits as u64 > self.max_credits as u64 {
            log::debug!(
                "[JOURNAL] transaction {} cannot extend by {} (reserved {})",
                handle.id(),
                credits,
                handle.reserved()
            );
            return Ok(ExtendStatus::RestartNeeded);
        }
        handle.add_credits(credits);
        JournalStats::bump(&self.stats.extends);
        Ok(ExtendStatus::Extended)
    }

    fn restart(&mut self, handle: &mut Handle, credits: u32) -> Result<()> {
        Self::check_active(handle)?;
        JournalStats::bump(&self.stats.commits);
        JournalStats::bump(&self.stats.restarts);
        let id = self.alloc_id();
        log::debug!(
            "[JOURNAL] restart transaction {} -> {} credits={}",
            handle.id(),
            id,
            credits
        );
        handle.reset(id, credits.min(self.max_credits));
        Ok(())
    }

    fn get_write_access(&mut self, handle: &mut Handle, block: u64) -> Result<()> {
        self.access(handle, block)
    }

    fn get_create_access(&mut self, handle: &mut Handle, block: u64) -> Result<()> {
        self.access(handle, block)
    }

    fn mark_dirty(&mut self, handle: &mut Handle, target: DirtyTarget) -> Result<()> {
        Self::check_active(handle)?;
        if let DirtyTarget::Block(b) = target {
            if !handle.has_write_access(b) {
                log::error!("[JOURNAL] block {} dirtied without write access", b);
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    "Block dirtied without write access",
                ));
            }
        }
        handle.record_dirty(target);
        Ok(())
    }

    fn forget(&mut self, handle: &mut Handle, block: u64) -> Result<()> {
        Self::check_active(handle)?;
        handle.forget_block(block);
        Ok(())
    }

    fn commit(&mut self, mut handle: Handle) -> Result<()> {
        Self::check_active(&handle)?;
        handle.set_state(TransactionState::Committed);
        JournalStats::bump(&self.stats.commits);
        log::trace!("[JOURNAL] commit transaction {}", handle.id());
        Ok(())
    }

    fn abort(&mut self, mut handle: Handle) {
        handle.set_state(TransactionState::Aborted);
        JournalStats::bump(&self.stats.aborts);
        log::warn!("[JOURNAL] abort transaction {}", handle.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_lifecycle() {
        let mut j = SimpleJournal::new(16);
        let stats = j.stats();
        let mut h = j.begin(4).unwrap();
        j.get_write_access(&mut h, 100).unwrap();
        j.mark_dirty(&mut h, DirtyTarget::Block(100)).unwrap();
        j.mark_dirty(&mut h, DirtyTarget::Inode(12)).unwrap();
        assert_eq!(h.dirty_blocks(), alloc::vec![100]);
        j.commit(h).unwrap();
        assert_eq!(stats.begins(), 1);
        assert_eq!(stats.commits(), 1);
    }

    #[test]
    fn test_dirty_requires_access() {
        let mut j = SimpleJournal::new(16);
        let mut h = j.begin(4).unwrap();
        let err = j.mark_dirty(&mut h, DirtyTarget::Block(7)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_extend_until_restart() {
        let mut j = SimpleJournal::new(10);
        let stats = j.stats();
        let mut h = j.begin(4).unwrap();
        assert_eq!(j.extend(&mut h, 6).unwrap(), ExtendStatus::Extended);
        assert_eq!(j.extend(&mut h, 1).unwrap(), ExtendStatus::RestartNeeded);

        let old = h.id();
        j.restart(&mut h, 3).unwrap();
        assert_ne!(h.id(), old);
        assert_eq!(h.credits(), 3);
        assert_eq!(stats.restarts(), 1);
    }

    #[test]
    fn test_begin_too_large() {
        let mut j = SimpleJournal::new(8);
        assert_eq!(j.begin(9).unwrap_err().kind(), ErrorKind::NoSpace);
    }

    #[test]
    fn test_fault_injection() {
        let mut j = SimpleJournal::new(16).fail_write_access_after(1);
        let mut h = j.begin(4).unwrap();
        j.get_write_access(&mut h, 1).unwrap();
        assert_eq!(j.get_write_access(&mut h, 2).unwrap_err().kind(), ErrorKind::Io);
    }
}
