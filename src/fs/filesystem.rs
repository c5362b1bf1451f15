//! extent 树的运行上下文
//!
//! [`ExtentFs`] 把块设备、事务系统、块分配器和页缓存聚合在一起，
//! 所有 extent 操作都是它的方法。协作者各自有锁，操作期间从不同时持有两把，
//! 方法只需要 `&self`，多个线程可以对不同 inode 并发调用。

use super::config::FsConfig;
use super::inode::{ExtentInode, InodeData};
use super::stats::ExtentStats;
use crate::balloc::{AllocRequest, BlockAllocator, FreeFlags, SystemZone};
use crate::block::{BlockDev, BlockDevice};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::extent::check_inode;
use crate::page_cache::PageCache;
use crate::transaction::{
    CreditModel, DirtyTarget, Ext4CreditModel, ExtendStatus, Handle, Journal,
};
use alloc::boxed::Box;
use spin::Mutex;

/// extent 树上下文
pub struct ExtentFs<D: BlockDevice> {
    pub(crate) bdev: Mutex<BlockDev<D>>,
    pub(crate) journal: Mutex<Box<dyn Journal + Send>>,
    pub(crate) allocator: Mutex<Box<dyn BlockAllocator + Send>>,
    pub(crate) pages: Mutex<Box<dyn PageCache + Send>>,
    pub(crate) credits: Box<dyn CreditModel>,
    pub(crate) zone: SystemZone,
    pub(crate) config: FsConfig,
    pub(crate) stats: ExtentStats,
}

impl<D: BlockDevice> ExtentFs<D> {
    /// 创建上下文
    ///
    /// # 参数
    ///
    /// * `device` - 块设备，块大小必须与 `config.block_size` 一致
    /// * `config` - 配置
    /// * `zone` - 合法数据区描述
    /// * `journal` - 事务系统
    /// * `allocator` - 块分配器
    /// * `pages` - 页缓存
    ///
    /// # 错误
    ///
    /// - `InvalidInput` - 配置非法或块大小不一致
    pub fn new<J, A, P>(
        device: D,
        config: FsConfig,
        zone: SystemZone,
        journal: J,
        allocator: A,
        pages: P,
    ) -> Result<Self>
    where
        J: Journal + Send + 'static,
        A: BlockAllocator + Send + 'static,
        P: PageCache + Send + 'static,
    {
        config.validate()?;
        if device.block_size() != config.block_size {
            log::error!(
                "device block size {} does not match config {}",
                device.block_size(),
                config.block_size
            );
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Device block size does not match config",
            ));
        }

        let mut model = Ext4CreditModel::for_geometry(config.block_size, zone.blocks_count());
        model.blocks_per_group = config.blocks_per_group;

        log::info!(
            "extent fs: block_size={} blocks={} csum={}",
            config.block_size,
            zone.blocks_count(),
            config.metadata_csum
        );

        Ok(Self {
            bdev: Mutex::new(BlockDev::new(device, config.bcache_size as usize)),
            journal: Mutex::new(Box::new(journal)),
            allocator: Mutex::new(Box::new(allocator)),
            pages: Mutex::new(Box::new(pages)),
            credits: Box::new(model),
            zone,
            config,
            stats: ExtentStats::default(),
        })
    }

    /// 替换额度估算模型
    pub fn with_credit_model<M: CreditModel + 'static>(mut self, model: M) -> Self {
        self.credits = Box::new(model);
        self
    }

    /// 配置
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// 合法数据区
    pub fn zone(&self) -> &SystemZone {
        &self.zone
    }

    /// 运行统计
    pub fn stats(&self) -> &ExtentStats {
        &self.stats
    }

    /// 额度估算模型
    pub fn credit_model(&self) -> &dyn CreditModel {
        self.credits.as_ref()
    }

    /// 块大小
    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    /// 在持有块设备锁的情况下执行 `f`
    pub fn with_bdev<R>(&self, f: impl FnOnce(&mut BlockDev<D>) -> R) -> R {
        f(&mut *self.bdev.lock())
    }

    /// 把缓存中所有脏块写回设备
    pub fn sync(&self) -> Result<()> {
        self.bdev.lock().flush_all()
    }

    /// 从磁盘 inode 字段构造 [`ExtentInode`]
    ///
    /// # 错误
    ///
    /// - `Corrupted` - 根节点头部非法
    pub fn load_inode(
        &self,
        ino: u32,
        i_block: [u8; EXT4_INODE_BLOCK_SIZE],
        size: u64,
    ) -> Result<ExtentInode> {
        let inode = ExtentInode::new(ino);
        {
            let mut data = inode.write();
            data.i_block = i_block;
            data.size = size;
            check_inode(&data)?;
        }
        Ok(inode)
    }

    //=========================================================================
    // 事务
    //=========================================================================

    /// 开始事务
    pub fn journal_start(&self, credits: u32) -> Result<Handle> {
        self.journal.lock().begin(credits)
    }

    /// 写回事务中的脏块并提交
    ///
    /// 写回失败时事务被中止。
    pub fn journal_stop(&self, handle: Handle) -> Result<()> {
        let dirty = handle.dirty_blocks();
        if let Err(e) = self.bdev.lock().flush_blocks(&dirty) {
            log::error!("[JOURNAL] flush before commit failed: {}", e);
            self.journal_abort(handle);
            return Err(e);
        }
        self.journal.lock().commit(handle)
    }

    /// 丢弃事务中的脏块并中止
    pub fn journal_abort(&self, handle: Handle) {
        {
            let mut bdev = self.bdev.lock();
            for lba in handle.dirty_blocks() {
                bdev.discard(lba);
            }
        }
        self.journal.lock().abort(handle);
    }

    /// 按操作结果结束事务：I/O 类错误中止，其余情况提交
    pub(crate) fn finish<T>(&self, handle: Handle, result: Result<T>) -> Result<T> {
        match result {
            Err(e) if e.is_io_class() => {
                self.journal_abort(handle);
                Err(e)
            }
            Err(e) => {
                // 已经完成的部分仍然有效
                self.journal_stop(handle)?;
                Err(e)
            }
            Ok(v) => {
                self.journal_stop(handle)?;
                Ok(v)
            }
        }
    }

    /// 确保事务至少还有 `needed` 个额度
    ///
    /// 追加失败时写回脏块、重启事务并返回 `Restart`，
    /// 调用者应从一个可恢复的位置重新开始。
    pub(crate) fn ensure_credits(&self, handle: &mut Handle, needed: u32) -> Result<()> {
        if handle.credits() >= needed {
            return Ok(());
        }
        let status = self.journal.lock().extend(handle, needed)?;
        if status == ExtendStatus::Extended {
            return Ok(());
        }

        let dirty = handle.dirty_blocks();
        self.bdev.lock().flush_blocks(&dirty)?;
        self.journal.lock().restart(handle, needed)?;
        Err(Error::new(ErrorKind::Restart, "Transaction restarted"))
    }

    pub(crate) fn get_write_access(&self, handle: &mut Handle, block: u64) -> Result<()> {
        self.journal.lock().get_write_access(handle, block)
    }

    pub(crate) fn get_create_access(&self, handle: &mut Handle, block: u64) -> Result<()> {
        self.journal.lock().get_create_access(handle, block)
    }

    pub(crate) fn mark_dirty(&self, handle: &mut Handle, target: DirtyTarget) -> Result<()> {
        self.journal.lock().mark_dirty(handle, target)
    }

    pub(crate) fn mark_inode_dirty(&self, handle: &mut Handle, data: &InodeData) -> Result<()> {
        self.mark_dirty(handle, DirtyTarget::Inode(data.ino))
    }

    //=========================================================================
    // 块分配
    //=========================================================================

    fn charge_bitmap(&self, handle: &mut Handle) {
        if handle.charge(self.credits.bitmap_credits()) {
            log::warn!(
                "[BALLOC] transaction {} ran out of credits for bitmap update",
                handle.id()
            );
        }
    }

    /// 分配物理块
    pub(crate) fn alloc_blocks(&self, handle: &mut Handle, req: &AllocRequest) -> Result<(u64, u32)> {
        let result = self.allocator.lock().allocate(req)?;
        self.charge_bitmap(handle);
        Ok(result)
    }

    /// 分配单个元数据块
    pub(crate) fn alloc_meta_block(&self, handle: &mut Handle, req: &AllocRequest) -> Result<u64> {
        let (block, _) = self.alloc_blocks(handle, req)?;
        Ok(block)
    }

    /// 释放物理块
    ///
    /// 带 `FORGET` 时先让 journal 忘记这些块，并丢弃缓存中的内容。
    pub(crate) fn free_blocks(
        &self,
        handle: &mut Handle,
        start: u64,
        count: u32,
        flags: FreeFlags,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if flags.contains(FreeFlags::FORGET) {
            let mut journal = self.journal.lock();
            for lba in start..start + count as u64 {
                journal.forget(handle, lba)?;
            }
            drop(journal);
            let mut bdev = self.bdev.lock();
            for lba in start..start + count as u64 {
                bdev.discard(lba);
            }
        }
        self.allocator.lock().free(start, count, flags)?;
        self.charge_bitmap(handle);
        Ok(())
    }

    /// 把数据块清零（unwritten extent 的 zeroout 路径）
    pub(crate) fn zero_data_blocks(&self, start: u64, count: u32) -> Result<()> {
        log::debug!("[EXT_UNWRITTEN] zeroout pblk={} len={}", start, count);
        self.stats.inc_zeroouts();
        self.bdev.lock().zero_blocks(start, count as u64)
    }
}
