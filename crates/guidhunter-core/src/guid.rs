//! Provider GUID 的解析与字节布局
//!
//! 镜像中内嵌的是 Windows GUID 的内存布局（前三个字段小端序、后 8 字节原样），
//! 与注册 ETW provider 时传入的结构体一致，因此搜索模式必须取
//! `to_bytes_le` 的布局而非文本顺序。
use std::fmt;

use uuid::Uuid;

use crate::errors::ScanError;

/// 16 字节搜索标识符（固定长度，解析后不可变）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifier([u8; 16]);

impl Identifier {
    /// 从规范文本形式解析；接受带花括号、带连字符或紧凑形式
    pub fn parse(text: &str) -> Result<Self, ScanError> {
        let trimmed = text.trim().trim_start_matches('{').trim_end_matches('}');
        let uuid = Uuid::parse_str(trimmed)
            .map_err(|_| ScanError::InvalidIdentifier(text.to_string()))?;
        Ok(Self(uuid.to_bytes_le()))
    }

    /// 搜索模式字节（Windows GUID 内存布局）
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", Uuid::from_bytes_le(self.0))
    }
}
