//! 扫描主流程与并行调度
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;
use walkdir::WalkDir;

use crate::errors::ScanError;
use crate::guid::Identifier;
use crate::image::ImageLayout;
use crate::matcher::find_pattern;
use crate::options::{ScanOptions, ScanStats};
use crate::types::{FileReport, Match, ScanResult};

/// 候选文件的扩展名（可执行镜像）
const IMAGE_EXTENSIONS: [&str; 3] = ["dll", "exe", "sys"];

/// 收集候选文件集合
/// - root 为文件时：单元素集合（不做扩展名过滤）
/// - root 为目录时：递归遍历，仅保留镜像扩展名，按路径排序保证输出可复现
/// - root 不存在时：TargetNotFound（扫描开始前即失败）
///
/// 集合在扇出前一次收齐，扫描开始后新增的文件不会被看到。
pub fn collect_candidate_files(root: &Path) -> Result<Vec<PathBuf>, ScanError> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.is_dir() {
        return Err(ScanError::TargetNotFound(root.to_path_buf()));
    }

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(e) => e,
            // 进不去的子目录：跳过，不中断收集
            Err(_) => continue,
        };
        if entry.file_type().is_file() && has_image_extension(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// 扫描单个文件：整读 → 模式搜索 → 命中偏移逐个翻译
///
/// 读取失败返回 FileUnreadable，由调度层隔离；节表解析失败只降级为
/// 原样报告偏移，不影响命中本身。零命中是正常结果。
pub fn scan_file(path: &Path, identifier: &Identifier) -> Result<ScanResult, ScanError> {
    let buffer = fs::read(path).map_err(|source| ScanError::FileUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let offsets = find_pattern(&buffer, identifier.as_bytes());
    if offsets.is_empty() {
        return Ok(ScanResult {
            path: path.to_path_buf(),
            matches: Vec::new(),
        });
    }

    // 只有存在命中时才解析节表，且每个文件至多解析一次
    let layout = match ImageLayout::parse(&buffer) {
        Ok(layout) => layout,
        Err(err) => {
            warn!(path = %path.display(), %err, "reporting raw offsets only");
            ImageLayout::empty()
        }
    };

    let matches = offsets
        .into_iter()
        .map(|offset| {
            let translated = layout.translate(offset as u64);
            Match {
                raw_offset: offset as u64,
                virtual_offset: translated.offset,
                section: translated.section,
            }
        })
        .collect();

    Ok(ScanResult {
        path: path.to_path_buf(),
        matches,
    })
}

/// 对固定文件集合执行扫描
///
/// 每个文件恰好处理一次；文件级失败转为 Skipped 报告，不影响其余文件。
/// 命中总数由各工作线程以原子加法并入共享计数器，报告经单线程 writer
/// 按文件序重排后交给 `on_report`，保证输出顺序与集合顺序一致。
pub fn scan_files(
    files: &[PathBuf],
    identifier: &Identifier,
    opts: &ScanOptions,
    on_report: &mut dyn FnMut(&FileReport) -> Result<()>,
) -> Result<ScanStats> {
    let threads = opts.threads.unwrap_or_else(num_cpus::get).max(1);
    if threads == 1 || files.len() <= 1 {
        return scan_files_serial(files, identifier, opts, on_report);
    }
    scan_files_parallel(files, identifier, opts, on_report, threads)
}

/// 单文件的完整生命周期：大小过滤 → 扫描 → 终态报告
fn scan_one(
    path: &Path,
    identifier: &Identifier,
    opts: &ScanOptions,
    aggregate: &AtomicUsize,
) -> FileReport {
    if let Some(max) = opts.max_file_size {
        if let Ok(metadata) = fs::metadata(path) {
            if metadata.len() > max {
                return FileReport::Skipped {
                    path: path.to_path_buf(),
                    reason: format!("file larger than {max} bytes"),
                };
            }
        }
    }

    match scan_file(path, identifier) {
        Ok(result) => {
            // 只有成功扫描的文件计入汇总
            aggregate.fetch_add(result.count(), Ordering::Relaxed);
            FileReport::Scanned(result)
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "skipping file");
            FileReport::Skipped {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }
        }
    }
}

fn tally(report: &FileReport, stats: &mut ScanStats) {
    match report {
        FileReport::Scanned(_) => stats.files_scanned += 1,
        FileReport::Skipped { .. } => stats.files_skipped += 1,
    }
}

/// 串行路径（单线程或单文件）
fn scan_files_serial(
    files: &[PathBuf],
    identifier: &Identifier,
    opts: &ScanOptions,
    on_report: &mut dyn FnMut(&FileReport) -> Result<()>,
) -> Result<ScanStats> {
    let aggregate = AtomicUsize::new(0);
    let mut stats = ScanStats::default();
    for path in files {
        let report = scan_one(path, identifier, opts, &aggregate);
        tally(&report, &mut stats);
        on_report(&report)?;
    }
    stats.total_matches = aggregate.into_inner();
    Ok(stats)
}

/// 并行调度：
/// - 后台线程内建 Rayon 线程池执行扫描
/// - 单线程 writer 按 idx 重排结果并回调，保证顺序稳定
fn scan_files_parallel(
    files: &[PathBuf],
    identifier: &Identifier,
    opts: &ScanOptions,
    on_report: &mut dyn FnMut(&FileReport) -> Result<()>,
    threads: usize,
) -> Result<ScanStats> {
    use crossbeam_channel as channel;
    use rayon::prelude::*;

    type Msg = (usize /*idx*/, FileReport);
    let (tx, rx) = channel::bounded::<Msg>(256);

    // writer 留在当前线程持有 on_report；汇总计数器由调度层持有、
    // 以引用计数句柄交给各工作线程
    let aggregate = Arc::new(AtomicUsize::new(0));
    let worker_aggregate = Arc::clone(&aggregate);
    let identifier = *identifier;
    let opts = opts.clone();
    let indexed: Vec<(usize, PathBuf)> = files
        .iter()
        .enumerate()
        .map(|(i, p)| (i, p.clone()))
        .collect();

    let scan_thread = std::thread::spawn(move || {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .expect("build rayon pool");
        pool.install(|| {
            indexed.par_iter().for_each(|(idx, path)| {
                let report = scan_one(path, &identifier, &opts, &worker_aggregate);
                let _ = tx.send((*idx, report));
            });
        });
        // 池结束后所有 Sender 释放，writer 端收到关闭信号
    });

    // writer：维护 next_idx 与缓存，按序冲刷
    let mut stats = ScanStats::default();
    let mut next_idx: usize = 0;
    let mut pending: BTreeMap<usize, FileReport> = BTreeMap::new();

    while let Ok((idx, report)) = rx.recv() {
        pending.insert(idx, report);
        while let Some(report) = pending.remove(&next_idx) {
            tally(&report, &mut stats);
            on_report(&report)?;
            next_idx += 1;
        }
    }

    let _ = scan_thread.join();

    // 理论上缓冲已清空，这里只处理残余
    while let Some(report) = pending.remove(&next_idx) {
        tally(&report, &mut stats);
        on_report(&report)?;
        next_idx += 1;
    }

    stats.total_matches = aggregate.load(Ordering::Relaxed);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_identifier() -> Identifier {
        Identifier::parse("{de7b24ea-73c8-4a09-985d-5bdadcfa9017}").unwrap()
    }

    /// 写入一个以 0x11 填充的文件，并在给定偏移处植入标识符字节
    fn write_with_matches(
        dir: &Path,
        name: &str,
        identifier: &Identifier,
        offsets: &[usize],
        len: usize,
    ) -> PathBuf {
        let mut bytes = vec![0x11u8; len];
        for &offset in offsets {
            bytes[offset..offset + 16].copy_from_slice(identifier.as_bytes());
        }
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn collect_reports(
        files: &[PathBuf],
        identifier: &Identifier,
        opts: &ScanOptions,
    ) -> (ScanStats, Vec<FileReport>) {
        let mut reports = Vec::new();
        let stats = scan_files(files, identifier, opts, &mut |report| {
            reports.push(report.clone());
            Ok(())
        })
        .unwrap();
        (stats, reports)
    }

    #[test]
    fn missing_root_is_target_not_found() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            collect_candidate_files(&missing),
            Err(ScanError::TargetNotFound(_))
        ));
    }

    #[test]
    fn file_root_is_single_candidate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.bin");
        fs::write(&path, b"data").unwrap();
        // 单文件目标不做扩展名过滤
        assert_eq!(collect_candidate_files(&path).unwrap(), vec![path]);
    }

    #[test]
    fn directory_walk_filters_and_sorts_by_extension() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join("b.exe"), b"x").unwrap();
        fs::write(dir.path().join("a.dll"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(nested.join("driver.SYS"), b"x").unwrap();

        let files = collect_candidate_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.dll", "b.exe", "driver.SYS"]);
    }

    #[test]
    fn scan_file_reports_matches_in_ascending_order() {
        let dir = tempdir().unwrap();
        let identifier = test_identifier();
        let path = write_with_matches(dir.path(), "two.dll", &identifier, &[256, 64], 1024);

        let result = scan_file(&path, &identifier).unwrap();
        assert_eq!(result.count(), 2);
        assert_eq!(result.matches[0].raw_offset, 64);
        assert_eq!(result.matches[1].raw_offset, 256);
        // 非 PE 内容：节表解析降级，偏移原样报告
        assert_eq!(result.matches[0].virtual_offset, 64);
        assert!(result.matches[0].section.is_none());
    }

    #[test]
    fn scan_file_with_no_matches_is_ok_and_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clean.dll");
        fs::write(&path, vec![0x11u8; 512]).unwrap();

        let result = scan_file(&path, &test_identifier()).unwrap();
        assert_eq!(result.count(), 0);
    }

    #[test]
    fn scan_file_missing_path_is_unreadable() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone.dll");
        assert!(matches!(
            scan_file(&missing, &test_identifier()),
            Err(ScanError::FileUnreadable { .. })
        ));
    }

    #[test]
    fn unreadable_file_is_isolated_and_reported() {
        let dir = tempdir().unwrap();
        let identifier = test_identifier();
        let good = write_with_matches(dir.path(), "good.dll", &identifier, &[100, 300], 1024);
        let missing = dir.path().join("missing.dll");
        let also_good = write_with_matches(dir.path(), "also.dll", &identifier, &[10], 256);

        let files = vec![good, missing.clone(), also_good];
        let (stats, reports) = collect_reports(&files, &identifier, &ScanOptions::default());

        assert_eq!(stats.files_scanned, 2);
        assert_eq!(stats.files_skipped, 1);
        assert_eq!(stats.total_matches, 3);
        assert_eq!(reports.len(), 3);
        // 报告顺序与文件集合一致，失败条目保序出现在中间
        match &reports[1] {
            FileReport::Skipped { path, .. } => assert_eq!(path, &missing),
            other => panic!("expected skipped report, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_count_is_exact_across_parallel_workers() {
        let dir = tempdir().unwrap();
        let identifier = test_identifier();
        let mut files = Vec::new();
        for i in 0..16 {
            files.push(write_with_matches(
                dir.path(),
                &format!("img{i:02}.dll"),
                &identifier,
                &[32, 512, 900],
                1024,
            ));
        }

        let opts = ScanOptions {
            threads: Some(8),
            max_file_size: None,
        };
        let (stats, reports) = collect_reports(&files, &identifier, &opts);
        assert_eq!(stats.total_matches, 48);
        assert_eq!(stats.files_scanned, 16);
        assert_eq!(reports.len(), 16);
    }

    #[test]
    fn serial_and_parallel_agree() {
        let dir = tempdir().unwrap();
        let identifier = test_identifier();
        let files: Vec<_> = (0..6)
            .map(|i| {
                write_with_matches(dir.path(), &format!("f{i}.dll"), &identifier, &[i * 16], 512)
            })
            .collect();

        let serial = ScanOptions {
            threads: Some(1),
            max_file_size: None,
        };
        let parallel = ScanOptions {
            threads: Some(4),
            max_file_size: None,
        };
        let (serial_stats, _) = collect_reports(&files, &identifier, &serial);
        let (parallel_stats, _) = collect_reports(&files, &identifier, &parallel);
        assert_eq!(serial_stats.total_matches, parallel_stats.total_matches);
        assert_eq!(serial_stats.files_scanned, parallel_stats.files_scanned);
    }

    #[test]
    fn oversize_file_is_skipped() {
        let dir = tempdir().unwrap();
        let identifier = test_identifier();
        let big = write_with_matches(dir.path(), "big.dll", &identifier, &[64], 4096);

        let opts = ScanOptions {
            threads: Some(1),
            max_file_size: Some(1024),
        };
        let (stats, reports) = collect_reports(&[big], &identifier, &opts);
        assert_eq!(stats.files_skipped, 1);
        assert_eq!(stats.total_matches, 0);
        assert!(matches!(&reports[0], FileReport::Skipped { reason, .. } if reason.contains("larger")));
    }
}
