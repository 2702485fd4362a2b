//! 可执行镜像节布局与偏移翻译
//!
//! 仅解析节表（经 goblin 的 PE 解析器），不做完整的 PE 语义分析。
//! 翻译规则：
//! - 归属判定用文件偏移与节的 *虚拟* 区间比较，上下界均为严格不等，
//!   恰好等于节起点的偏移视为不在任何节内
//! - 命中节时 translated = raw + (virtual_address - pointer_to_raw_data)，
//!   中间量走 i64，raw pointer 大于虚拟地址的节不会下溢
use goblin::pe::PE;

use crate::errors::ScanError;

/// 单个节的描述（来自节表，只读，保持头部顺序）
#[derive(Debug, Clone)]
pub struct SectionDescriptor {
    /// 节名（至多 8 字符，可能为空或重名）
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub pointer_to_raw_data: u32,
    pub size_of_raw_data: u32,
}

/// 一次偏移翻译的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedOffset {
    /// 映射后的偏移；不落在任何节内时等于原始偏移
    pub offset: u64,
    /// 所属节名；不落在任何节内时为 None
    pub section: Option<String>,
}

/// 镜像的节布局
#[derive(Debug, Clone, Default)]
pub struct ImageLayout {
    sections: Vec<SectionDescriptor>,
}

impl ImageLayout {
    /// 从镜像字节解析节表；头部不可解析时返回 MalformedImageHeader
    pub fn parse(bytes: &[u8]) -> Result<Self, ScanError> {
        let pe = PE::parse(bytes).map_err(|e| ScanError::MalformedImageHeader(e.to_string()))?;
        let sections = pe
            .sections
            .iter()
            .map(|sec| SectionDescriptor {
                name: String::from_utf8_lossy(&sec.name)
                    .trim_end_matches('\0')
                    .to_string(),
                virtual_address: sec.virtual_address,
                virtual_size: sec.virtual_size,
                pointer_to_raw_data: sec.pointer_to_raw_data,
                size_of_raw_data: sec.size_of_raw_data,
            })
            .collect();
        Ok(Self { sections })
    }

    /// 由已知节描述构造布局
    pub fn from_sections(sections: Vec<SectionDescriptor>) -> Self {
        Self { sections }
    }

    /// 空布局（解析失败后的降级形态：所有偏移原样返回）
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn sections(&self) -> &[SectionDescriptor] {
        &self.sections
    }

    /// 把文件偏移翻译为加载后偏移；按头部顺序第一个命中的节生效
    pub fn translate(&self, raw_offset: u64) -> TranslatedOffset {
        for sec in &self.sections {
            let start = u64::from(sec.virtual_address);
            let end = start + u64::from(sec.virtual_size);
            if raw_offset > start && raw_offset < end {
                let delta =
                    i64::from(sec.virtual_address) - i64::from(sec.pointer_to_raw_data);
                return TranslatedOffset {
                    offset: (raw_offset as i64 + delta) as u64,
                    section: Some(sec.name.clone()),
                };
            }
        }
        TranslatedOffset {
            offset: raw_offset,
            section: None,
        }
    }
}
