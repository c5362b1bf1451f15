//! extent 树运行上下文
//!
//! - `config` - [`FsConfig`]
//! - `inode` - [`ExtentInode`] / [`InodeData`]
//! - `filesystem` - [`ExtentFs`]，聚合所有协作者
//! - `stats` - [`ExtentStats`]

mod config;
mod filesystem;
mod inode;
mod stats;

pub use config::FsConfig;
pub use filesystem::ExtentFs;
pub use inode::{ExtentInode, InodeData, InodeState, XattrInfo};
pub use stats::ExtentStats;
