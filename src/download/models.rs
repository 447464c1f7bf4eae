//! 下载任务的数据模型：任务/页面状态机、事件与最终报告。

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::archive::ArchiveFormat;
use crate::base_system::context::Config;
use crate::base_system::cooldown_retry::BackoffPolicy;
use crate::source::SourceError;
use crate::source::models::{MangaRef, PageDescriptor};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Resolving,
    Downloading,
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::PartiallyFailed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobState::Queued => "排队中",
            JobState::Resolving => "解析中",
            JobState::Downloading => "下载中",
            JobState::Completed => "完成",
            JobState::PartiallyFailed => "部分失败",
            JobState::Failed => "失败",
            JobState::Cancelled => "已取消",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    Pending,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
    /// 被内容过滤（尺寸离群的推广页），不算失败
    Filtered,
}

impl PageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PageState::Succeeded | PageState::Failed | PageState::Filtered)
    }
}

/// 任务失败（或部分失败）的原因。
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("章节已锁定: {0}")]
    Locked(String),
    #[error("资源不存在: {0}")]
    NotFound(String),
    #[error("持续被限流")]
    RateLimited,
    #[error("网络错误: {0}")]
    Network(String),
    #[error("解析失败: {0}")]
    Resolution(String),
    #[error("暂存失败: {0}")]
    Staging(String),
    #[error("归档失败: {0}")]
    Archive(String),
    #[error("没有任何页面下载成功")]
    NoPagesSucceeded,
}

impl From<&SourceError> for FailureReason {
    fn from(err: &SourceError) -> Self {
        match err {
            SourceError::Network(msg) => FailureReason::Network(msg.clone()),
            SourceError::RateLimited { .. } => FailureReason::RateLimited,
            SourceError::NotFound(msg) => FailureReason::NotFound(msg.clone()),
            SourceError::Locked(msg) => FailureReason::Locked(msg.clone()),
            SourceError::Resolution(msg) => FailureReason::Resolution(msg.clone()),
        }
    }
}

/// 提交任务时的输出选项。
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub format: ArchiveFormat,
    pub allow_overwrite: bool,
    pub write_metadata: bool,
    pub data_saver: bool,
    /// 写入 metadata.json 的漫画信息
    pub manga: Option<MangaRef>,
}

impl JobOptions {
    pub fn from_config(config: &Config, manga: Option<MangaRef>) -> Self {
        Self {
            format: config.archive_format,
            allow_overwrite: config.allow_overwrite_files,
            write_metadata: config.write_metadata,
            data_saver: config.data_saver,
            manga,
        }
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from_config(&Config::default(), None)
    }
}

/// 单页的下载状态。同一时刻只属于调度线程或某一个 worker。
#[derive(Debug, Clone)]
pub struct PageTask {
    pub page: PageDescriptor,
    pub attempts: u32,
    pub state: PageState,
    pub last_delay: Duration,
    pub last_error: Option<SourceError>,
}

impl PageTask {
    pub fn new(page: PageDescriptor) -> Self {
        Self {
            page,
            attempts: 0,
            state: PageState::Pending,
            last_delay: Duration::ZERO,
            last_error: None,
        }
    }

    /// 下一次重试前的等待；不会比上一次短。
    pub fn next_delay(&mut self, backoff: &dyn BackoffPolicy) -> Duration {
        let delay = backoff.delay(self.attempts).max(self.last_delay);
        self.last_delay = delay;
        delay
    }
}

/// 任务结束时的汇总，页序号是归档里的最终序号。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub chapter_id: String,
    pub state: JobState,
    pub total_pages: usize,
    pub succeeded: Vec<usize>,
    pub missing: Vec<usize>,
    /// 被过滤掉的页（按解析时的原始序号）
    pub filtered: Vec<usize>,
    pub output: Option<PathBuf>,
    pub reason: Option<FailureReason>,
}

impl JobReport {
    pub(crate) fn new(job_id: JobId, chapter_id: &str, state: JobState) -> Self {
        Self {
            job_id,
            chapter_id: chapter_id.to_string(),
            state,
            total_pages: 0,
            succeeded: Vec::new(),
            missing: Vec::new(),
            filtered: Vec::new(),
            output: None,
            reason: None,
        }
    }

    pub(crate) fn failed(job_id: JobId, chapter_id: &str, reason: FailureReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(job_id, chapter_id, JobState::Failed)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    State {
        job_id: JobId,
        state: JobState,
    },
    Resolved {
        job_id: JobId,
        chapter_id: String,
        pages: usize,
    },
    Page {
        job_id: JobId,
        page_index: usize,
        state: PageState,
        attempt: u32,
    },
    /// 触发了池级冷却
    Cooldown {
        job_id: JobId,
        wait: Duration,
    },
    Finished(JobReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_shrinks() {
        let shrinking = |attempt: u32| Duration::from_millis(100 / u64::from(attempt.max(1)));
        let mut task = PageTask::new(PageDescriptor::new(0, "https://x/1.jpg"));
        let mut delays = Vec::new();
        for attempt in 1..=4 {
            task.attempts = attempt;
            delays.push(task.next_delay(&shrinking));
        }
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[3], Duration::from_millis(100));
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Downloading.is_terminal());
        assert!(PageState::Filtered.is_terminal());
        assert!(!PageState::Retrying.is_terminal());
    }

    #[test]
    fn reasons_follow_source_errors() {
        let reason = FailureReason::from(&SourceError::Locked("c1".into()));
        assert_eq!(reason, FailureReason::Locked("c1".into()));
        assert_eq!(
            FailureReason::from(&SourceError::RateLimited { retry_after: None }),
            FailureReason::RateLimited
        );
    }
}
