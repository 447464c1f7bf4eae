//! 命令行子命令：搜索、列章节、下载。

use std::collections::VecDeque;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;
use tracing::{info, warn};

use crate::archive::ArchiveFormat;
use crate::base_system::context::Config;
use crate::base_system::cooldown_retry::ExponentialBackoff;
use crate::base_system::logging::LogSystem;
use crate::base_system::rate_limit::TokenBucket;
use crate::download::downloader::{DownloadSettings, Downloader, JobHandle};
use crate::download::models::{JobOptions, JobReport, JobState};
use crate::download::progress::ProgressReporter;
use crate::network_parser::network::{HttpTransport, ReqwestTransport};
use crate::source::models::{ChapterRef, MangaRef, SourceKind};
use crate::source::{SourceAdapter, build_adapter};
use crate::third_party::translate::{AniListTranslator, Translator};

/// 退出钩子里等待任务收尾（清理暂存目录）的最长时间。
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// 章节列表里的位置区间（从 1 开始，闭区间）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterRange {
    pub start: usize,
    pub end: usize,
}

/// 接受 `a-b`、`a~b`、`a-`（到结尾）和单个数字。
pub fn parse_range(text: &str) -> Result<ChapterRange, String> {
    let text = text.trim();
    let parse = |s: &str| {
        s.trim()
            .parse::<usize>()
            .map_err(|_| format!("无法解析章节序号: {s:?}"))
    };
    let (start, end) = match text.split_once(['-', '~']) {
        Some((a, b)) if b.trim().is_empty() => (parse(a)?, usize::MAX),
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let n = parse(text)?;
            (n, n)
        }
    };
    let (start, end) = (start.max(1), end.max(1));
    if start > end {
        return Ok(ChapterRange { start: end, end: start });
    }
    Ok(ChapterRange { start, end })
}

pub fn apply_range(chapters: &[ChapterRef], range: Option<ChapterRange>) -> Vec<ChapterRef> {
    let Some(r) = range else {
        return chapters.to_vec();
    };
    chapters
        .iter()
        .skip(r.start - 1)
        .take(r.end.saturating_sub(r.start).saturating_add(1))
        .cloned()
        .collect()
}

/// 章节的汉化组列表（MangaDex 合并字段以 `, ` 分隔）。
fn chapter_groups(chapter: &ChapterRef) -> impl Iterator<Item = &str> {
    chapter
        .scanlation_group
        .as_deref()
        .into_iter()
        .flat_map(|g| g.split(", "))
        .map(str::trim)
        .filter(|g| !g.is_empty())
}

/// 列表中出现过的汉化组，按名称排序去重。
pub fn available_groups(chapters: &[ChapterRef]) -> Vec<String> {
    let mut groups: Vec<String> = chapters
        .iter()
        .flat_map(chapter_groups)
        .map(str::to_string)
        .collect();
    groups.sort();
    groups.dedup();
    groups
}

/// 只保留属于任一指定汉化组的章节（忽略大小写）；不指定时原样返回。
pub fn filter_groups(chapters: &[ChapterRef], wanted: &[String]) -> Vec<ChapterRef> {
    if wanted.is_empty() {
        return chapters.to_vec();
    }
    chapters
        .iter()
        .filter(|ch| {
            chapter_groups(ch).any(|g| wanted.iter().any(|w| w.trim().eq_ignore_ascii_case(g)))
        })
        .cloned()
        .collect()
}

/// 下载命令的覆盖选项。
#[derive(Debug, Clone, Default)]
pub struct DownloadArgs {
    pub range: Option<ChapterRange>,
    /// 汉化组过滤，先于范围选择生效
    pub groups: Vec<String>,
    pub format: Option<ArchiveFormat>,
    pub out: Option<PathBuf>,
    pub data_saver: bool,
}

struct SourceContext {
    adapter: Arc<dyn SourceAdapter>,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<TokenBucket>,
}

fn build_source(config: &Config, kind: SourceKind) -> Result<SourceContext> {
    let transport: Arc<dyn HttpTransport> = Arc::new(
        ReqwestTransport::new(config.request_timeout()).context("初始化 HTTP 客户端失败")?,
    );
    let limiter = Arc::new(TokenBucket::from_config(config));
    // 翻译接口单独限速，不占用图源的令牌
    let translator = config.translate_titles.then(|| {
        Arc::new(AniListTranslator::new(
            transport.clone(),
            Arc::new(TokenBucket::new(1, 1.0)),
        )) as Arc<dyn Translator>
    });
    let adapter = build_adapter(kind, config, transport.clone(), limiter.clone(), translator);
    Ok(SourceContext {
        adapter,
        transport,
        limiter,
    })
}

pub fn run_search(config: &Config, kind: SourceKind, query: &str) -> Result<()> {
    let ctx = build_source(config, kind)?;
    let results = ctx
        .adapter
        .search(query)
        .with_context(|| format!("搜索失败: {query}"))?;

    if results.is_empty() {
        println!("未搜索到结果\n");
        return Ok(());
    }
    println!("\n===== 搜索结果 ({kind}) =====");
    for (idx, manga) in results.iter().enumerate() {
        println!(
            "{}. 标题: {} | ID: {} | 状态: {}",
            idx + 1,
            manga.display_title(),
            manga.id,
            manga.status.as_deref().unwrap_or("未知")
        );
    }
    println!();
    Ok(())
}

pub fn run_chapters(
    config: &Config,
    kind: SourceKind,
    manga_id: &str,
    groups: &[String],
) -> Result<()> {
    let ctx = build_source(config, kind)?;
    let all = ctx
        .adapter
        .list_chapters(manga_id)
        .with_context(|| format!("获取章节列表失败: {manga_id}"))?;

    let known = available_groups(&all);
    if !known.is_empty() {
        println!("\n汉化组: {}", known.join(" | "));
    }
    let chapters = filter_groups(&all, groups);
    if chapters.is_empty() {
        println!("没有可下载的章节\n");
        return Ok(());
    }
    println!("\n===== 章节列表（共 {} 章）=====", chapters.len());
    for (idx, ch) in chapters.iter().enumerate() {
        let mut line = format!("{}. 第 {} 话", idx + 1, ch.display_number());
        if !ch.title.trim().is_empty() {
            line.push_str(&format!(" {}", ch.title.trim()));
        }
        if let Some(lang) = ch.language.as_deref() {
            line.push_str(&format!(" [{lang}]"));
        }
        if let Some(group) = ch.scanlation_group.as_deref() {
            line.push_str(&format!(" ({group})"));
        }
        if ch.locked {
            line.push_str(" 🔒");
        }
        println!("{line}");
    }
    println!();
    Ok(())
}

pub fn run_download(
    config: &Config,
    log: &LogSystem,
    kind: SourceKind,
    manga_id: &str,
    args: DownloadArgs,
) -> Result<()> {
    let start_time = Instant::now();
    let mut config = config.clone();
    if let Some(format) = args.format {
        config.archive_format = format;
    }
    if let Some(out) = &args.out {
        config.save_path = out.to_string_lossy().to_string();
    }
    if args.data_saver {
        config.data_saver = true;
    }

    let ctx = build_source(&config, kind)?;
    let manga = match ctx.adapter.fetch_manga(manga_id) {
        Ok(m) => Some(m),
        Err(err) => {
            warn!("获取漫画信息失败，使用 ID 作为目录名: {err}");
            None
        }
    };
    print_manga(manga.as_ref(), manga_id);

    let all = ctx
        .adapter
        .list_chapters(manga_id)
        .with_context(|| format!("获取章节列表失败: {manga_id}"))?;
    let chapters = filter_groups(&all, &args.groups);
    if chapters.len() != all.len() {
        info!("汉化组过滤后剩余 {}/{} 章", chapters.len(), all.len());
    }
    let chosen = apply_range(&chapters, args.range);
    if chosen.is_empty() {
        println!("范围无效或章节为空\n");
        return Ok(());
    }
    println!("共 {} 章，本次下载 {} 章", chapters.len(), chosen.len());

    let (downloader, events) = Downloader::new(
        ctx.adapter.clone(),
        ctx.transport,
        ctx.limiter,
        DownloadSettings::from_config(&config),
        Arc::new(ExponentialBackoff::from_config(&config)),
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let registry = downloader.registry();
        let stop = stop.clone();
        log.add_exit_hook(move || {
            stop.store(true, Ordering::Relaxed);
            let n = registry.cancel_all();
            if n > 0 {
                info!(target: "download", "收到停止信号，取消 {n} 个任务");
            }
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while registry.running() > 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
        });
    }

    let options = JobOptions::from_config(&config, manga.clone());
    let window = config.max_parallel_jobs.max(1);
    let mut pending: VecDeque<ChapterRef> = chosen.into();
    let mut running: Vec<JobHandle> = Vec::new();
    let mut reports: Vec<JobReport> = Vec::new();
    let mut reporter = if io::stderr().is_terminal() {
        ProgressReporter::new(pending.len())
    } else {
        ProgressReporter::hidden(pending.len())
    };

    println!("\n开始下载...");
    loop {
        while running.len() < window && !stop.load(Ordering::Relaxed) {
            let Some(chapter) = pending.pop_front() else {
                break;
            };
            let target = config.chapter_target(manga.as_ref(), &chapter);
            let label = chapter.folder_label();
            let handle = downloader.submit_job(chapter, target, options.clone());
            reporter.label(handle.id(), label);
            running.push(handle);
        }
        if running.is_empty() {
            break;
        }
        if stop.load(Ordering::Relaxed) {
            for handle in &running {
                downloader.cancel(handle);
            }
        }

        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                if let Some(report) = reporter.handle(&event)
                    && let Some(pos) = running.iter().position(|h| h.id() == report.job_id)
                {
                    reports.push(running.swap_remove(pos).wait());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for handle in running {
        reports.push(handle.wait());
    }
    reporter.finish();

    print_summary(&reports, pending.len());
    println!(
        "\n下载完成！用时 {:.1} 秒",
        start_time.elapsed().as_secs_f32()
    );
    println!("已保存到 {}", config.default_save_dir().display());
    Ok(())
}

fn print_manga(manga: Option<&MangaRef>, manga_id: &str) {
    let Some(manga) = manga else {
        println!("\n漫画 ID: {manga_id}");
        return;
    };
    println!("\n标题: {}", manga.display_title());
    if !manga.alt_titles.is_empty() {
        println!("别名: {}", manga.alt_titles.join("|"));
    }
    if let Some(status) = manga.status.as_deref() {
        println!("状态: {status}");
    }
    if !manga.description.trim().is_empty() {
        let mut short = manga.description.trim().to_string();
        if short.chars().count() > 50 {
            short = short.chars().take(50).collect::<String>() + "...";
        }
        println!("简介: {short}");
    }
}

fn print_summary(reports: &[JobReport], skipped: usize) {
    let count = |state: JobState| reports.iter().filter(|r| r.state == state).count();
    println!(
        "\n成功: {} 章 | 部分失败: {} 章 | 失败: {} 章 | 取消: {} 章",
        count(JobState::Completed),
        count(JobState::PartiallyFailed),
        count(JobState::Failed),
        count(JobState::Cancelled) + skipped
    );
    for report in reports {
        match (report.state, &report.reason) {
            (JobState::Failed, Some(reason)) => println!("  {} 失败: {reason}", report.chapter_id),
            (JobState::PartiallyFailed, _) => println!(
                "  {} 缺页: {:?}",
                report.chapter_id,
                report.missing.iter().map(|i| i + 1).collect::<Vec<_>>()
            ),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("3-7", 3, 7)]
    #[case("10~2", 2, 10)]
    #[case(" 5 ", 5, 5)]
    #[case("0-2", 1, 2)]
    #[case("4-", 4, usize::MAX)]
    fn parses_ranges(#[case] text: &str, #[case] start: usize, #[case] end: usize) {
        assert_eq!(parse_range(text), Ok(ChapterRange { start, end }));
    }

    #[test]
    fn rejects_garbage_ranges() {
        assert!(parse_range("a-b").is_err());
        assert!(parse_range("").is_err());
    }

    #[test]
    fn range_selects_positions() {
        let chapters: Vec<ChapterRef> = (1..=5)
            .map(|n| ChapterRef::new(format!("c{n}"), "m", f64::from(n), ""))
            .collect();
        let ids = |list: Vec<ChapterRef>| list.into_iter().map(|c| c.id).collect::<Vec<_>>();

        assert_eq!(ids(apply_range(&chapters, None)).len(), 5);
        assert_eq!(
            ids(apply_range(&chapters, Some(ChapterRange { start: 2, end: 3 }))),
            vec!["c2", "c3"]
        );
        assert_eq!(
            ids(apply_range(&chapters, parse_range("4-").ok())),
            vec!["c4", "c5"]
        );
        assert!(apply_range(&chapters, Some(ChapterRange { start: 9, end: 12 })).is_empty());
    }

    fn grouped(id: &str, group: Option<&str>) -> ChapterRef {
        let mut ch = ChapterRef::new(id, "m", 1.0, "");
        ch.scanlation_group = group.map(str::to_string);
        ch
    }

    #[test]
    fn group_filter_keeps_chapters_with_any_wanted_group() {
        let chapters = vec![
            grouped("a", Some("Alpha Scans")),
            grouped("b", Some("Beta, Alpha Scans")),
            grouped("c", Some("Gamma")),
            grouped("d", None),
        ];
        let ids = |list: Vec<ChapterRef>| list.into_iter().map(|c| c.id).collect::<Vec<_>>();

        assert_eq!(ids(filter_groups(&chapters, &[])).len(), 4);
        assert_eq!(
            ids(filter_groups(&chapters, &["alpha scans".to_string()])),
            vec!["a", "b"]
        );
        assert_eq!(
            ids(filter_groups(&chapters, &["Gamma".to_string(), "Beta".to_string()])),
            vec!["b", "c"]
        );
        assert!(filter_groups(&chapters, &["Nobody".to_string()]).is_empty());
        assert_eq!(available_groups(&chapters), vec!["Alpha Scans", "Beta", "Gamma"]);
    }
}
