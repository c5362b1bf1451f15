//! 错误类型定义
//!
//! 提供 extent 树操作的错误类型。

use core::fmt;

/// extent 树操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误
    Io,
    /// 无效参数（调用方违反约定）
    InvalidInput,
    /// extent 树损坏（头部或条目校验失败）
    Corrupted,
    /// 对象不存在
    NotFound,
    /// 空间不足（数据块或元数据块）
    NoSpace,
    /// 不支持的操作
    Unsupported,
    /// 资源忙
    Busy,
    /// 无效状态
    InvalidState,
    /// 事务需要重启后重试
    ///
    /// 不是真正的错误，只在内部重试循环之间传递。
    Restart,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// 是否属于 I/O 类错误（树损坏也按 I/O 错误上报）
    pub const fn is_io_class(&self) -> bool {
        matches!(self.kind, ErrorKind::Io | ErrorKind::Corrupted)
    }

    /// 是否为空间不足
    pub const fn is_no_space(&self) -> bool {
        matches!(self.kind, ErrorKind::NoSpace)
    }

    /// 是否为事务重启信号
    pub const fn is_restart(&self) -> bool {
        matches!(self.kind, ErrorKind::Restart)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
