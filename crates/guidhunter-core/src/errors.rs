//! 错误分类
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 扫描过程中的错误分类
/// - 标识符与目标路径类错误在扫描开始前即失败（fail fast）
/// - 文件级错误（不可读、镜像头损坏）由调度层隔离，不中断整体批次
#[derive(Debug, Error)]
pub enum ScanError {
    /// 输入文本无法解析为 16 字节 GUID
    #[error("invalid provider GUID: {0}")]
    InvalidIdentifier(String),

    /// 搜索根路径不存在（既不是文件也不是目录）
    #[error("target file or directory does not exist: {}", .0.display())]
    TargetNotFound(PathBuf),

    /// 单个候选文件无法打开或读取（文件级，可恢复）
    #[error("failed to read {}: {source}", .path.display())]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 镜像节表解析失败（文件级，降级为原样报告偏移）
    #[error("unable to parse image headers: {0}")]
    MalformedImageHeader(String),

    /// Provider 名称在发布者注册表中查不到对应 GUID
    #[error("provider name could not be resolved to a GUID: {0}")]
    IdentifierNotResolved(String),
}
