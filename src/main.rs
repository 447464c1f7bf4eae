//! 多源漫画章节下载器。
//!
//! 本 crate 负责：配置加载、命令行交互、源适配（MangaDex / 包子漫画）、下载调度与归档输出。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/退避/限流等基础设施
//! - `network_parser`：HTTP 传输抽象与网页解析
//! - `source`：源适配器（标准 API 源与受阻网页源）及内容过滤
//! - `download`：任务调度（线程池、重试、429 冷却、取消）
//! - `archive`：图片目录 / cbz 输出
//! - `ui`：命令行子命令

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;

mod archive;
mod base_system;
mod download;
mod network_parser;
mod source;
#[cfg(test)]
mod test_support;
mod third_party;
mod ui;

use archive::ArchiveFormat;
use base_system::config::load_or_create_with_base;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use source::models::SourceKind;
use ui::noui::{self, ChapterRange, DownloadArgs};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "manga-chapter-downloader", version)]
#[command(about = "Multi-source manga chapter downloader")]
struct Cli {
    /// 启用调试日志输出
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    /// 数据目录路径（用于存放 config.yml 和 logs 等文件，方便 Docker 挂载）
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 按标题搜索漫画
    Search {
        query: String,
        /// 图源: standard(mangadex) / obstructed(baozimh)
        #[arg(long, default_value = "standard")]
        source: SourceKind,
    },
    /// 列出漫画的章节
    Chapters {
        manga_id: String,
        #[arg(long, default_value = "standard")]
        source: SourceKind,
        /// 只列出这些汉化组的章节，可重复
        #[arg(long = "group")]
        groups: Vec<String>,
    },
    /// 下载章节
    Download {
        manga_id: String,
        #[arg(long, default_value = "standard")]
        source: SourceKind,
        /// 章节范围（章节列表中的序号），如 3-7、10~、5
        #[arg(long, value_parser = noui::parse_range)]
        range: Option<ChapterRange>,
        /// 只下载这些汉化组的章节，可重复；先过滤再按范围选择
        #[arg(long = "group")]
        groups: Vec<String>,
        /// 输出格式，覆盖配置中的 archive_format
        #[arg(long, value_enum)]
        format: Option<ArchiveFormat>,
        /// 保存目录，覆盖配置中的 save_path
        #[arg(long)]
        out: Option<PathBuf>,
        /// 使用省流量画质（仅 MangaDex）
        #[arg(long, default_value_t = false)]
        data_saver: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.as_deref();
    let log = init_logging(cli.debug, data_dir)?;
    info!(target: "startup", "当前版本: v{}", VERSION);

    let config = load_or_create_with_base::<Config>(None, data_dir).map_err(|e| anyhow!(e.to_string()))?;

    match cli.command {
        Command::Search { query, source } => noui::run_search(&config, source, &query),
        Command::Chapters {
            manga_id,
            source,
            groups,
        } => noui::run_chapters(&config, source, &manga_id, &groups),
        Command::Download {
            manga_id,
            source,
            range,
            groups,
            format,
            out,
            data_saver,
        } => noui::run_download(
            &config,
            &log,
            source,
            &manga_id,
            DownloadArgs {
                range,
                groups,
                format,
                out,
                data_saver,
            },
        ),
    }
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: false,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}
