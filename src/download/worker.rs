//! 图片下载工作池。
//!
//! 所有任务共用一组 worker 线程；每个工作项自带回执通道，结果交回所属任务的调度线程。
//! worker 只负责"等冷却 → 抓取（含备选地址）→ 落盘"，不改任务状态。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel as channel;
use tracing::{debug, warn};

use super::models::JobId;
use super::staging::{StagedPage, Staging};
use crate::base_system::cooldown_retry::cooldown_for;
use crate::base_system::rate_limit::{PoolCooldown, TokenBucket};
use crate::network_parser::network::HttpTransport;
use crate::source::models::PageDescriptor;
use crate::source::{SourceAdapter, SourceError};
use crate::third_party::media_fetch::{FetchFailure, FetchedImage, fetch_image};

pub(crate) struct WorkItem {
    pub job_id: JobId,
    pub page: PageDescriptor,
    pub attempt: u32,
    pub referer: Option<String>,
    pub staging: Arc<Staging>,
    pub cancel: Arc<AtomicBool>,
    pub reply: channel::Sender<TaskOutcome>,
}

#[derive(Debug)]
pub(crate) enum TaskResult {
    Stored(StagedPage),
    Failed(SourceError),
    StageFailed(String),
    /// 取消后才轮到或才返回的结果，直接丢弃
    Discarded,
}

#[derive(Debug)]
pub(crate) struct TaskOutcome {
    pub job_id: JobId,
    pub index: usize,
    pub attempt: u32,
    pub result: TaskResult,
}

/// 429 冷却的默认值与上限。
#[derive(Debug, Clone, Copy)]
pub struct CooldownSettings {
    pub default: std::time::Duration,
    pub cap: std::time::Duration,
}

#[derive(Clone)]
struct WorkerContext {
    adapter: Arc<dyn SourceAdapter>,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<TokenBucket>,
    cooldown: Arc<PoolCooldown>,
    cooldown_settings: CooldownSettings,
}

pub(crate) struct WorkerPool {
    tx: Option<channel::Sender<WorkItem>>,
    handles: Vec<JoinHandle<()>>,
    size: usize,
}

impl WorkerPool {
    pub(crate) fn new(
        workers: usize,
        adapter: Arc<dyn SourceAdapter>,
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<TokenBucket>,
        cooldown: Arc<PoolCooldown>,
        cooldown_settings: CooldownSettings,
    ) -> Self {
        let size = workers.max(1);
        let (tx, rx) = channel::unbounded::<WorkItem>();
        let ctx = WorkerContext {
            adapter,
            transport,
            limiter,
            cooldown,
            cooldown_settings,
        };

        let mut handles = Vec::with_capacity(size);
        for n in 0..size {
            let rx = rx.clone();
            let ctx = ctx.clone();
            let spawned = thread::Builder::new()
                .name(format!("page-worker-{n}"))
                .spawn(move || {
                    for item in rx.iter() {
                        let outcome = ctx.run(&item);
                        let _ = item.reply.send(outcome);
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!("启动下载线程失败: {err}"),
            }
        }

        Self {
            tx: Some(tx),
            size: handles.len().max(1),
            handles,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// 池已关闭时返回工作项，由调用方按失败处理。
    pub(crate) fn submit(&self, item: WorkItem) -> Result<(), WorkItem> {
        match &self.tx {
            Some(tx) => tx.send(item).map_err(|e| e.into_inner()),
            None => Err(item),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.tx.take();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WorkerContext {
    fn run(&self, item: &WorkItem) -> TaskOutcome {
        let outcome = |result| TaskOutcome {
            job_id: item.job_id,
            index: item.page.index,
            attempt: item.attempt,
            result,
        };

        self.cooldown.wait();
        if item.cancel.load(Ordering::Relaxed) {
            return outcome(TaskResult::Discarded);
        }

        let fetched = match self.fetch_page(item) {
            Ok(img) => img,
            Err(err) => {
                if let SourceError::RateLimited { retry_after } = &err {
                    // 先把闸门关上，兄弟 worker 立即停止发请求
                    self.cooldown.trigger(cooldown_for(
                        *retry_after,
                        self.cooldown_settings.default,
                        self.cooldown_settings.cap,
                    ));
                }
                return outcome(TaskResult::Failed(err));
            }
        };
        if item.cancel.load(Ordering::Relaxed) {
            return outcome(TaskResult::Discarded);
        }

        match item.staging.store(item.page.index, &fetched.bytes, fetched.ext) {
            Ok(staged) => outcome(TaskResult::Stored(staged)),
            Err(err) => outcome(TaskResult::StageFailed(err.to_string())),
        }
    }

    /// 主地址 → 备选地址。主地址网络错误直接交回重试；备选地址里 404/非图片换下一个，
    /// 全部用尽时有过网络错误就按网络错误重试，否则判定为页面不存在。
    fn fetch_page(&self, item: &WorkItem) -> Result<FetchedImage, SourceError> {
        let referer = item.referer.as_deref();
        let page = &item.page;

        if !page.needs_fallback {
            match fetch_image(
                self.transport.as_ref(),
                &self.limiter,
                &page.primary_url,
                referer,
                None,
            ) {
                Ok(img) => return Ok(img),
                Err(FetchFailure::Source(err)) => return Err(err),
                Err(FetchFailure::Missing(reason)) => {
                    debug!(job = item.job_id, page = page.index, "主地址不可用: {reason}");
                }
            }
        }

        let mut network_error: Option<SourceError> = None;
        for (n, url) in self.adapter.fallback_candidates(page).iter().enumerate() {
            if item.cancel.load(Ordering::Relaxed) {
                break;
            }
            match fetch_image(self.transport.as_ref(), &self.limiter, url, referer, None) {
                Ok(img) => {
                    debug!(job = item.job_id, page = page.index, "第 {} 个备选地址可用: {url}", n + 1);
                    return Ok(img);
                }
                Err(FetchFailure::Missing(_)) => continue,
                Err(FetchFailure::Source(err @ SourceError::RateLimited { .. })) => {
                    return Err(err);
                }
                Err(FetchFailure::Source(err)) => network_error = Some(err),
            }
        }

        Err(network_error.unwrap_or_else(|| {
            SourceError::NotFound(format!("第 {} 页所有地址均不可用", page.index + 1))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::models::{ChapterRef, MangaRef, PageResolution, SourceKind};
    use crate::test_support::{ManualClock, MockTransport, png_bytes};
    use std::time::Duration;

    struct VariantAdapter(Vec<String>);

    impl SourceAdapter for VariantAdapter {
        fn kind(&self) -> SourceKind {
            SourceKind::Obstructed
        }
        fn search(&self, _query: &str) -> Result<Vec<MangaRef>, SourceError> {
            Ok(Vec::new())
        }
        fn fetch_manga(&self, id: &str) -> Result<MangaRef, SourceError> {
            Err(SourceError::NotFound(id.to_string()))
        }
        fn list_chapters(&self, _manga_id: &str) -> Result<Vec<ChapterRef>, SourceError> {
            Ok(Vec::new())
        }
        fn resolve_pages(&self, chapter: &ChapterRef) -> Result<PageResolution, SourceError> {
            Err(SourceError::NotFound(chapter.id.clone()))
        }
        fn fallback_candidates(&self, _page: &PageDescriptor) -> Vec<String> {
            self.0.clone()
        }
    }

    fn run_one(transport: Arc<MockTransport>, candidates: Vec<&str>) -> (TaskOutcome, Arc<PoolCooldown>) {
        let dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(Staging::create(dir.path(), 1, "c").unwrap());
        let cooldown = Arc::new(PoolCooldown::new(Arc::new(ManualClock::new())));
        let mut pool = WorkerPool::new(
            1,
            Arc::new(VariantAdapter(candidates.into_iter().map(String::from).collect())),
            transport,
            Arc::new(TokenBucket::unlimited()),
            cooldown.clone(),
            CooldownSettings {
                default: Duration::from_secs(5),
                cap: Duration::from_secs(60),
            },
        );
        let (reply, rx) = channel::unbounded();
        pool.submit(WorkItem {
            job_id: 1,
            page: PageDescriptor::new(6, "https://cdn/7.jpg"),
            attempt: 1,
            referer: Some("https://www.baozimh.com/".into()),
            staging,
            cancel: Arc::new(AtomicBool::new(false)),
            reply,
        })
        .ok()
        .unwrap();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
        (outcome, cooldown)
    }

    #[test]
    fn falls_through_variants_until_one_works() {
        let transport = Arc::new(MockTransport::new());
        transport.on("https://cdn/7.jpg", MockTransport::status(404));
        transport.on("https://alt/7.webp", MockTransport::image(png_bytes(3, 3)));
        let (outcome, _) = run_one(
            transport.clone(),
            vec!["https://alt/7.png", "https://alt/7.webp", "https://alt/7.gif"],
        );
        match outcome.result {
            TaskResult::Stored(page) => {
                assert_eq!(page.index, 6);
                assert_eq!(page.ext, "png");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.calls_to("https://alt/7.gif"), 0);
        assert!(transport.requests().iter().all(|r| r
            .headers
            .contains(&("Referer".to_string(), "https://www.baozimh.com/".to_string()))));
    }

    #[test]
    fn exhausted_variants_are_not_found() {
        let transport = Arc::new(MockTransport::new());
        let (outcome, _) = run_one(transport, vec!["https://alt/1.png"]);
        assert!(matches!(outcome.result, TaskResult::Failed(SourceError::NotFound(_))));
    }

    #[test]
    fn variant_network_errors_stay_transient() {
        let transport = Arc::new(MockTransport::new());
        transport.on("https://alt/1.png", MockTransport::status(503));
        let (outcome, _) = run_one(transport, vec!["https://alt/1.png", "https://alt/2.png"]);
        assert!(matches!(outcome.result, TaskResult::Failed(SourceError::Network(_))));
    }

    #[test]
    fn rate_limit_closes_the_gate() {
        let transport = Arc::new(MockTransport::new());
        transport.on(
            "https://cdn/7.jpg",
            MockTransport::status(429).with_header("Retry-After", "9"),
        );
        let (outcome, cooldown) = run_one(transport, vec![]);
        assert!(matches!(
            outcome.result,
            TaskResult::Failed(SourceError::RateLimited { .. })
        ));
        assert_eq!(cooldown.remaining(), Some(Duration::from_secs(9)));
    }
}
