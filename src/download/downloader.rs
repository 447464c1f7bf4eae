//! 下载调度器。
//!
//! 每个任务一个调度线程：解析页面 → 把页面任务派给共享 worker 池 → 消费回执推进状态机
//! （重试/冷却/失败）→ 尺寸过滤 → 归档。任务与页面状态只在调度线程里修改。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, RecvTimeoutError};
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use super::models::{
    FailureReason, JobEvent, JobId, JobOptions, JobReport, JobState, PageState, PageTask,
};
use super::pipeline::{PagePipeline, ProbeSettings};
use super::staging::{StagedPage, Staging};
use super::worker::{CooldownSettings, TaskOutcome, TaskResult, WorkItem, WorkerPool};
use crate::archive::{ArchiveContent, ArchivePage, ArchiveWriter};
use crate::base_system::context::Config;
use crate::base_system::cooldown_retry::{BackoffPolicy, SharedBackoff, cooldown_for};
use crate::base_system::rate_limit::{PoolCooldown, TokenBucket};
use crate::network_parser::network::HttpTransport;
use crate::source::models::{ChapterRef, PageResolution, ResolutionOrigin};
use crate::source::{SourceAdapter, SourceError};

/// 没有到期重试时，调度线程最长阻塞这么久再检查一次取消标记。
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct DownloadSettings {
    pub workers: usize,
    /// 每页最多抓取次数（含第一次）
    pub max_retries: u32,
    pub cooldown: CooldownSettings,
    pub probe: ProbeSettings,
}

impl DownloadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.max_workers.max(1),
            max_retries: config.max_retries.max(1),
            cooldown: CooldownSettings {
                default: config.rate_limit_cooldown(),
                cap: config.max_cooldown(),
            },
            probe: ProbeSettings {
                enabled: config.validate_pages,
                bytes: config.probe_bytes,
                workers: config.max_workers,
            },
        }
    }
}

/// 正在运行的任务的取消标记，Ctrl-C 退出钩子通过它取消全部任务。
#[derive(Default)]
pub struct JobRegistry {
    flags: Mutex<HashMap<JobId, Arc<AtomicBool>>>,
}

impl JobRegistry {
    fn insert(&self, id: JobId, flag: Arc<AtomicBool>) {
        self.flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, flag);
    }

    fn remove(&self, id: JobId) {
        self.flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn cancel_all(&self) -> usize {
        let flags = self.flags.lock().unwrap_or_else(PoisonError::into_inner);
        for flag in flags.values() {
            flag.store(true, Ordering::Relaxed);
        }
        flags.len()
    }

    pub fn running(&self) -> usize {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct Shared {
    adapter: Arc<dyn SourceAdapter>,
    pipeline: PagePipeline,
    pool: WorkerPool,
    cooldown: Arc<PoolCooldown>,
    backoff: SharedBackoff,
    settings: DownloadSettings,
    events: channel::Sender<JobEvent>,
    registry: Arc<JobRegistry>,
}

pub struct Downloader {
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

enum HandleState {
    Running(JoinHandle<JobReport>),
    Done(Box<JobReport>),
}

pub struct JobHandle {
    id: JobId,
    chapter_id: String,
    cancel: Arc<AtomicBool>,
    state: HandleState,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// 等待任务结束并取回报告。
    pub fn wait(self) -> JobReport {
        match self.state {
            HandleState::Done(report) => *report,
            HandleState::Running(handle) => handle.join().unwrap_or_else(|_| {
                JobReport::failed(
                    self.id,
                    &self.chapter_id,
                    FailureReason::Resolution("任务线程异常退出".to_string()),
                )
            }),
        }
    }
}

impl Downloader {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<TokenBucket>,
        settings: DownloadSettings,
        backoff: SharedBackoff,
    ) -> (Self, channel::Receiver<JobEvent>) {
        Self::with_cooldown(
            adapter,
            transport,
            limiter,
            settings,
            backoff,
            Arc::new(PoolCooldown::default()),
        )
    }

    pub fn with_cooldown(
        adapter: Arc<dyn SourceAdapter>,
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<TokenBucket>,
        settings: DownloadSettings,
        backoff: SharedBackoff,
        cooldown: Arc<PoolCooldown>,
    ) -> (Self, channel::Receiver<JobEvent>) {
        let (events, rx) = channel::unbounded();
        let pipeline = PagePipeline::new(
            adapter.clone(),
            transport.clone(),
            limiter.clone(),
            settings.probe,
        );
        let pool = WorkerPool::new(
            settings.workers,
            adapter.clone(),
            transport,
            limiter,
            cooldown.clone(),
            settings.cooldown,
        );
        let shared = Shared {
            adapter,
            pipeline,
            pool,
            cooldown,
            backoff,
            settings,
            events,
            registry: Arc::new(JobRegistry::default()),
        };
        (
            Self {
                shared: Arc::new(shared),
                next_id: AtomicU64::new(1),
            },
            rx,
        )
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.shared.registry.clone()
    }

    /// 提交一个章节下载任务，立即返回句柄。
    pub fn submit_job(&self, chapter: ChapterRef, target: PathBuf, options: JobOptions) -> JobHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        let chapter_id = chapter.id.clone();
        self.shared.registry.insert(id, cancel.clone());
        let _ = self.shared.events.send(JobEvent::State {
            job_id: id,
            state: JobState::Queued,
        });

        let shared = self.shared.clone();
        let flag = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{id}"))
            .spawn(move || {
                let run = JobRun {
                    shared: &shared,
                    job_id: id,
                    chapter,
                    target,
                    options,
                    cancel: flag,
                };
                let report = run.execute();
                shared.registry.remove(id);
                let _ = shared.events.send(JobEvent::Finished(report.clone()));
                report
            });

        let state = match spawned {
            Ok(handle) => HandleState::Running(handle),
            Err(err) => {
                warn!("启动任务线程失败: {err}");
                self.shared.registry.remove(id);
                let report = JobReport::failed(
                    id,
                    &chapter_id,
                    FailureReason::Resolution(format!("无法启动任务线程: {err}")),
                );
                let _ = self.shared.events.send(JobEvent::Finished(report.clone()));
                HandleState::Done(Box::new(report))
            }
        };

        JobHandle {
            id,
            chapter_id,
            cancel,
            state,
        }
    }

    pub fn cancel(&self, handle: &JobHandle) {
        info!(target: "download", "取消任务 {}", handle.id);
        handle.cancel();
    }

}

struct JobRun<'a> {
    shared: &'a Shared,
    job_id: JobId,
    chapter: ChapterRef,
    target: PathBuf,
    options: JobOptions,
    cancel: Arc<AtomicBool>,
}

/// 调度循环里的待派发队列。
#[derive(Default)]
struct Queues {
    ready: VecDeque<usize>,
    delayed: Vec<(Instant, usize)>,
}

impl JobRun<'_> {
    fn emit(&self, event: JobEvent) {
        let _ = self.shared.events.send(event);
    }

    fn set_state(&self, state: JobState) {
        debug!(job = self.job_id, "状态 -> {state}");
        self.emit(JobEvent::State {
            job_id: self.job_id,
            state,
        });
    }

    fn page_event(&self, task: &PageTask) {
        self.emit(JobEvent::Page {
            job_id: self.job_id,
            page_index: task.page.index,
            state: task.state,
            attempt: task.attempts,
        });
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn finish(&self, report: JobReport) -> JobReport {
        self.set_state(report.state);
        match &report.reason {
            Some(reason) => info!(
                target: "download",
                "章节 {} 结束: {} ({reason})",
                self.chapter.display_number(),
                report.state
            ),
            None => info!(
                target: "download",
                "章节 {} 结束: {}",
                self.chapter.display_number(),
                report.state
            ),
        }
        report
    }

    fn fail(&self, reason: FailureReason) -> JobReport {
        self.finish(JobReport::failed(self.job_id, &self.chapter.id, reason))
    }

    fn cancelled_report(&self, staging: Option<&Staging>) -> JobReport {
        if let Some(staging) = staging
            && let Err(err) = staging.remove()
        {
            warn!("清理暂存目录失败: {err}");
        }
        self.finish(JobReport::new(self.job_id, &self.chapter.id, JobState::Cancelled))
    }

    fn execute(self) -> JobReport {
        self.set_state(JobState::Resolving);
        if self.cancelled() {
            return self.cancelled_report(None);
        }

        let resolution = match self.resolve_with_retry() {
            None => return self.cancelled_report(None),
            Some(Ok(res)) => res,
            Some(Err(err)) => {
                warn!(target: "download", chapter = %self.chapter.id, "解析失败: {err}");
                return self.fail(FailureReason::from(&err));
            }
        };
        if self.cancelled() {
            return self.cancelled_report(None);
        }
        self.emit(JobEvent::Resolved {
            job_id: self.job_id,
            chapter_id: self.chapter.id.clone(),
            pages: resolution.len(),
        });

        let root = self.target.parent().unwrap_or_else(|| Path::new("."));
        let staging = match Staging::create(root, self.job_id, &self.chapter.id) {
            Ok(s) => Arc::new(s),
            Err(err) => return self.fail(FailureReason::Staging(err.to_string())),
        };
        debug!(job = self.job_id, "暂存目录 {}", staging.dir().display());

        self.set_state(JobState::Downloading);
        let origin = resolution.origin;
        let referer = resolution.referer.clone();
        let mut tasks: Vec<PageTask> = resolution.pages.into_iter().map(PageTask::new).collect();

        let Some(mut staged) = self.download_all(&mut tasks, &staging, referer) else {
            return self.cancelled_report(Some(&staging));
        };

        let filtered = self.filter_outliers(&mut tasks, &mut staged, &staging);
        let report = self.assemble(&tasks, &staged, filtered, origin);
        if let Err(err) = staging.remove() {
            warn!("清理暂存目录失败: {err}");
        }
        self.finish(report)
    }

    /// 解析页面。限流先关闭池闸门再重试，网络错误按退避重试，次数上限与单页相同；
    /// 锁章、不存在等错误立即返回。返回 None 表示解析途中被取消。
    fn resolve_with_retry(&self) -> Option<Result<PageResolution, SourceError>> {
        let max_attempts = self.shared.settings.max_retries.max(1);
        let mut attempt = 0u32;
        let mut last_delay = Duration::ZERO;
        loop {
            if !self.shared.cooldown.wait_or_cancel(&self.cancel, POLL_INTERVAL) {
                return None;
            }
            attempt += 1;
            let err = match self.shared.pipeline.resolve(&self.chapter, &self.cancel) {
                Ok(res) => return Some(Ok(res)),
                Err(err) if !err.is_transient() || attempt >= max_attempts => {
                    return Some(Err(err));
                }
                Err(err) => err,
            };
            if self.cancelled() {
                return None;
            }
            match err {
                SourceError::RateLimited { retry_after } => self.pool_cooldown(retry_after),
                e => {
                    let delay = self.shared.backoff.delay(attempt).max(last_delay);
                    last_delay = delay;
                    debug!(
                        job = self.job_id,
                        attempt,
                        "解析失败: {e}，{:?} 后重试",
                        delay
                    );
                    if !self.sleep_or_cancel(delay) {
                        return None;
                    }
                }
            }
        }
    }

    /// 按真实时间睡眠，期间每个轮询间隔检查一次取消标记。
    fn sleep_or_cancel(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.cancelled() {
                return false;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            thread::sleep(left.min(POLL_INTERVAL));
        }
    }

    /// 429：关闭整个池的闸门并通知监听者。
    fn pool_cooldown(&self, retry_after: Option<Duration>) {
        let wait = cooldown_for(
            retry_after,
            self.shared.settings.cooldown.default,
            self.shared.settings.cooldown.cap,
        );
        self.shared.cooldown.trigger(wait);
        warn!(target: "download", "触发限流，全池冷却 {:?}", wait);
        self.emit(JobEvent::Cooldown {
            job_id: self.job_id,
            wait,
        });
    }

    /// 调度循环。返回 None 表示任务被取消。
    fn download_all(
        &self,
        tasks: &mut [PageTask],
        staging: &Arc<Staging>,
        referer: Option<String>,
    ) -> Option<BTreeMap<usize, StagedPage>> {
        let (reply_tx, reply_rx) = channel::unbounded::<TaskOutcome>();
        let mut queues = Queues {
            ready: (0..tasks.len()).collect(),
            delayed: Vec::new(),
        };
        let mut staged = BTreeMap::new();
        let mut in_flight = 0usize;
        let limit = self.shared.pool.size();

        loop {
            if self.cancelled() {
                return None;
            }

            let now = Instant::now();
            let (due, later): (Vec<_>, Vec<_>) =
                queues.delayed.drain(..).partition(|(at, _)| *at <= now);
            queues.delayed = later;
            queues.ready.extend(due.into_iter().map(|(_, idx)| idx));

            while in_flight < limit {
                let Some(idx) = queues.ready.pop_front() else {
                    break;
                };
                if self.cancelled() {
                    return None;
                }
                let task = &mut tasks[idx];
                task.attempts += 1;
                task.state = PageState::InFlight;
                self.page_event(task);

                let item = WorkItem {
                    job_id: self.job_id,
                    page: task.page.clone(),
                    attempt: task.attempts,
                    referer: referer.clone(),
                    staging: staging.clone(),
                    cancel: self.cancel.clone(),
                    reply: reply_tx.clone(),
                };
                if self.shared.pool.submit(item).is_err() {
                    task.state = PageState::Failed;
                    task.last_error = Some(SourceError::Network("下载线程池已关闭".to_string()));
                    self.page_event(task);
                    continue;
                }
                in_flight += 1;
            }

            if in_flight == 0 && queues.ready.is_empty() && queues.delayed.is_empty() {
                break;
            }

            let wait = queues
                .delayed
                .iter()
                .map(|(at, _)| at.saturating_duration_since(now))
                .min()
                .map_or(POLL_INTERVAL, |d| d.min(POLL_INTERVAL));
            match reply_rx.recv_timeout(wait) {
                Ok(outcome) => {
                    in_flight = in_flight.saturating_sub(1);
                    self.handle_outcome(outcome, tasks, &mut queues, &mut staged, staging);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if self.cancelled() {
            return None;
        }
        Some(staged)
    }

    fn handle_outcome(
        &self,
        outcome: TaskOutcome,
        tasks: &mut [PageTask],
        queues: &mut Queues,
        staged: &mut BTreeMap<usize, StagedPage>,
        staging: &Staging,
    ) {
        let idx = outcome.index;
        let Some(task) = tasks.get_mut(idx) else {
            return;
        };
        if task.state.is_terminal() {
            return;
        }
        let max_attempts = self.shared.settings.max_retries.max(1);

        match outcome.result {
            TaskResult::Discarded => {}
            TaskResult::Stored(page) => {
                if self.cancelled() {
                    staging.discard(&page);
                    return;
                }
                debug!(job = outcome.job_id, page = idx, bytes = page.size, "已暂存");
                task.state = PageState::Succeeded;
                staged.insert(idx, page);
                self.page_event(task);
            }
            TaskResult::StageFailed(msg) => {
                warn!(job = outcome.job_id, page = idx, "写入暂存失败: {msg}");
                task.state = PageState::Failed;
                task.last_error = Some(SourceError::Resolution(msg));
                self.page_event(task);
            }
            TaskResult::Failed(err) => {
                task.last_error = Some(err.clone());
                match err {
                    SourceError::RateLimited { retry_after } if task.attempts < max_attempts => {
                        self.pool_cooldown(retry_after);
                        task.state = PageState::Retrying;
                        self.page_event(task);
                        queues.ready.push_front(idx);
                    }
                    ref e if e.is_transient() && task.attempts < max_attempts => {
                        let delay = task.next_delay(self.shared.backoff.as_ref());
                        debug!(
                            job = self.job_id,
                            page = idx,
                            attempt = task.attempts,
                            "{e}，{:?} 后重试",
                            delay
                        );
                        task.state = PageState::Retrying;
                        self.page_event(task);
                        queues.delayed.push((Instant::now() + delay, idx));
                    }
                    e => {
                        warn!(
                            target: "download",
                            "第 {} 页失败（第 {} 次尝试）: {e}",
                            idx + 1,
                            outcome.attempt
                        );
                        task.state = PageState::Failed;
                        self.page_event(task);
                    }
                }
            }
        }
    }

    /// 下载完成后按宽度剔除尾部推广页，返回被剔除的原始序号。
    fn filter_outliers(
        &self,
        tasks: &mut [PageTask],
        staged: &mut BTreeMap<usize, StagedPage>,
        staging: &Staging,
    ) -> Vec<usize> {
        let dims: Vec<(usize, u32, u32)> = staged
            .values()
            .filter_map(|p| Some((p.index, p.width?, p.height?)))
            .collect();
        let outliers = self.shared.adapter.content_filter().dimension_outliers(&dims);
        for idx in &outliers {
            if let Some(page) = staged.remove(idx) {
                staging.discard(&page);
            }
            if let Some(task) = tasks.get_mut(*idx) {
                task.state = PageState::Filtered;
                self.page_event(task);
            }
        }
        if !outliers.is_empty() {
            info!(target: "download", "过滤掉尺寸异常的页: {:?}", outliers);
        }
        outliers
    }

    /// 剔除过滤页后重新连续编号，成功页写入归档，失败页记入缺页清单。
    fn assemble(
        &self,
        tasks: &[PageTask],
        staged: &BTreeMap<usize, StagedPage>,
        filtered: Vec<usize>,
        origin: ResolutionOrigin,
    ) -> JobReport {
        let mut report = JobReport::new(self.job_id, &self.chapter.id, JobState::Completed);
        let mut pages = Vec::new();
        let mut first_error: Option<FailureReason> = None;

        for task in tasks.iter().filter(|t| t.state != PageState::Filtered) {
            let index = report.total_pages;
            report.total_pages += 1;
            match staged.get(&task.page.index) {
                Some(page) if task.state == PageState::Succeeded => {
                    pages.push(ArchivePage {
                        index,
                        source: page.path.clone(),
                        ext: page.ext.clone(),
                    });
                    report.succeeded.push(index);
                }
                _ => {
                    report.missing.push(index);
                    if first_error.is_none() {
                        first_error = task.last_error.as_ref().map(FailureReason::from);
                    }
                }
            }
        }
        report.filtered = filtered;

        if pages.is_empty() {
            report.state = JobState::Failed;
            report.reason = Some(first_error.unwrap_or(FailureReason::NoPagesSucceeded));
            return report;
        }

        let content = ArchiveContent {
            pages,
            page_count: report.total_pages,
            missing: report.missing.clone(),
            metadata: self
                .options
                .write_metadata
                .then(|| self.metadata(&report, origin)),
        };
        let writer = ArchiveWriter::new(self.options.format, self.options.allow_overwrite);
        match writer.write(&self.target, &content) {
            Ok(path) => report.output = Some(path),
            Err(err) => {
                report.state = JobState::Failed;
                report.reason = Some(FailureReason::Archive(err.to_string()));
                return report;
            }
        }

        if !report.missing.is_empty() {
            report.state = JobState::PartiallyFailed;
            report.reason = first_error;
        }
        report
    }

    fn metadata(&self, report: &JobReport, origin: ResolutionOrigin) -> serde_json::Value {
        json!({
            "manga": self.options.manga,
            "chapter": self.chapter,
            "source": self.shared.adapter.kind(),
            "origin": origin,
            "quality": if self.options.data_saver { "data-saver" } else { "data" },
            "pages": report.total_pages,
            "missing": report.missing,
            "filtered": report.filtered,
            "downloaded_at": OffsetDateTime::now_utc().format(&Rfc3339).ok(),
        })
    }
}
