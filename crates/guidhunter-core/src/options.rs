//! 扫描选项与统计信息

/// 默认工作线程数（固定小常数，不随文件数或核数伸缩）
pub const DEFAULT_THREADS: usize = 4;

/// 扫描选项
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// 线程数：None 表示自动（等于 CPU 核数）
    pub threads: Option<usize>,
    /// 最大文件大小（字节）；超过则跳过该文件
    pub max_file_size: Option<u64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            threads: Some(DEFAULT_THREADS),
            max_file_size: None,
        }
    }
}

/// 扫描统计（供 CLI 汇总打印）
#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    pub files_scanned: usize,
    pub files_skipped: usize,
    /// 全部成功扫描文件的命中总数
    pub total_matches: usize,
}
