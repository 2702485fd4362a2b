//! 对外结果类型
use std::path::PathBuf;

use serde::Serialize;

/// 单次命中：原始文件偏移、映射后偏移与可选的所属节名
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub raw_offset: u64,
    pub virtual_offset: u64,
    pub section: Option<String>,
}

/// 单个文件的扫描结果（构造后不可变，命中按原始偏移升序）
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub path: PathBuf,
    pub matches: Vec<Match>,
}

impl ScanResult {
    /// 命中数量；零命中是正常结果，表示该文件不含目标标识符
    pub fn count(&self) -> usize {
        self.matches.len()
    }
}

/// 文件级终态：已扫描，或被跳过（读取失败/超出大小限制）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileReport {
    Scanned(ScanResult),
    Skipped { path: PathBuf, reason: String },
}
