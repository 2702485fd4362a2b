use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use guidhunter_core::{
    collect_candidate_files, platform_resolver, scan_files, FileReport, Identifier, ScanError,
    ScanOptions,
};
use tracing::info;

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "guidhunter", version, about = "定位静态内嵌 ETW provider GUID 的镜像")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 在目标文件或目录中搜索 provider GUID
    Scan {
        /// Provider GUID（如 "{de7b24ea-73c8-4a09-985d-5bdadcfa9017}"）
        /// 或 provider 名称（名称仅在有发布者注册表的平台可解析）
        #[arg(long)]
        provider: String,

        /// 搜索目标：单个镜像文件，或递归遍历的目录
        #[arg(long)]
        target: PathBuf,

        /// 线程数（"auto"=CPU 核心数）
        #[arg(long, default_value = "4")]
        threads: String,

        /// 最大扫描文件大小（单位字节，例如 5242880 代表 5MB）
        #[arg(long)]
        max_file_size: Option<u64>,

        /// 额外将结果写出为 JSON 数组
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            provider,
            target,
            threads,
            max_file_size,
            json,
        } => run_scan(&provider, &target, &threads, max_file_size, json),
    }
}

fn run_scan(
    provider: &str,
    target: &PathBuf,
    threads: &str,
    max_file_size: Option<u64>,
    json: Option<PathBuf>,
) -> Result<()> {
    let identifier = resolve_identifier(provider)?;

    // 文件集合在扇出前一次收齐
    let files = collect_candidate_files(target)?;
    println!("Searching {} files for {}...", files.len(), identifier);

    let opts = ScanOptions {
        threads: parse_threads(threads),
        max_file_size,
    };
    let started = Instant::now();

    let collect_json = json.is_some();
    let mut json_reports: Vec<FileReport> = Vec::new();
    let stats = scan_files(&files, &identifier, &opts, &mut |report| {
        print_report(report, &identifier);
        if collect_json {
            json_reports.push(report.clone());
        }
        Ok(())
    })?;

    println!("\nTotal References: {}", stats.total_matches);
    println!(
        "Time Elapsed: {:.4} seconds",
        started.elapsed().as_secs_f64()
    );
    info!(
        files_scanned = stats.files_scanned,
        files_skipped = stats.files_skipped,
        total_matches = stats.total_matches,
        "scan finished"
    );

    if let Some(path) = json {
        let mut out = BufWriter::new(File::create(&path).context("create json output file")?);
        serde_json::to_writer(&mut out, &json_reports).context("write json output")?;
        out.flush().ok();
    }

    Ok(())
}

/// 把命令行的 provider 参数解析为 16 字节标识符
/// - 先按 GUID 文本解析
/// - 带花括号的输入显然是 GUID，解析失败直接报 InvalidIdentifier
/// - 其余视为 provider 名称，经平台解析器查发布者注册表；查不到时
///   以 IdentifierNotResolved 整体失败（没有可搜索的标识符）
fn resolve_identifier(provider: &str) -> Result<Identifier> {
    match Identifier::parse(provider) {
        Ok(identifier) => Ok(identifier),
        Err(err) if provider.trim_start().starts_with('{') => Err(err.into()),
        Err(_) => {
            let resolver = platform_resolver();
            match resolver.lookup(provider)? {
                Some(resolved) => {
                    match &resolved.image_path {
                        Some(path) => info!(
                            provider,
                            image_path = %path,
                            "resolved provider from publisher registry"
                        ),
                        None => info!(provider, "resolved provider from publisher registry"),
                    }
                    Ok(resolved.identifier)
                }
                None => Err(ScanError::IdentifierNotResolved(provider.to_string()).into()),
            }
        }
    }
}

/// 打印单个文件的结果；零命中的文件不打印
fn print_report(report: &FileReport, identifier: &Identifier) {
    match report {
        FileReport::Scanned(result) => {
            if result.matches.is_empty() {
                return;
            }
            println!(
                "\nTarget File: {}\nGUID: {}\nFound {} references:",
                result.path.display(),
                identifier,
                result.count()
            );
            for (i, m) in result.matches.iter().enumerate() {
                match &m.section {
                    Some(section) => println!(
                        "  {}) Offset: 0x{:x} RVA: 0x{:x} Section: {}",
                        i + 1,
                        m.raw_offset,
                        m.virtual_offset,
                        section
                    ),
                    None => println!(
                        "  {}) Offset: 0x{:x} RVA: 0x{:x}",
                        i + 1,
                        m.raw_offset,
                        m.virtual_offset
                    ),
                }
            }
        }
        FileReport::Skipped { path, reason } => {
            eprintln!("Skipped {}: {}", path.display(), reason);
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 支持通过环境变量 RUST_LOG 控制日志等级，如：RUST_LOG=debug
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") {
        return None;
    }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}
