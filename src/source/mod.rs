//! 漫画源适配器。
//!
//! 每个源把"搜索 / 章节目录 / 章节页面解析"统一成 `SourceAdapter`，
//! 下载调度器只面向这个 trait 工作。

pub mod baozimh;
pub mod filter;
pub mod mangadex;
pub mod models;
pub mod variants;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::base_system::context::Config;
use crate::base_system::rate_limit::TokenBucket;
use crate::network_parser::network::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::third_party::translate::Translator;

use filter::ContentFilter;
use models::{ChapterRef, MangaRef, PageDescriptor, PageResolution, SourceKind};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("chapter locked: {0}")]
    Locked(String),
    #[error("unexpected response: {0}")]
    Resolution(String),
}

impl SourceError {
    /// 网络抖动与限流可以重试，其余都是确定性的失败。
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Network(_) | SourceError::RateLimited { .. }
        )
    }
}

impl From<TransportError> for SourceError {
    fn from(err: TransportError) -> Self {
        SourceError::Network(err.to_string())
    }
}

pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// 空查询返回空列表，不报错。
    fn search(&self, query: &str) -> Result<Vec<MangaRef>, SourceError>;

    fn fetch_manga(&self, manga_id: &str) -> Result<MangaRef, SourceError>;

    /// 按章节号升序；同号不同汉化组的章节全部保留。
    fn list_chapters(&self, manga_id: &str) -> Result<Vec<ChapterRef>, SourceError>;

    fn resolve_pages(&self, chapter: &ChapterRef) -> Result<PageResolution, SourceError>;

    fn content_filter(&self) -> ContentFilter {
        ContentFilter::default()
    }

    /// 主地址不可用时依次尝试的备选地址。
    fn fallback_candidates(&self, page: &PageDescriptor) -> Vec<String> {
        page.fallback_url.iter().cloned().collect()
    }
}

/// 取令牌后发请求，并把状态码归类成 `SourceError`。
pub(crate) fn send_checked(
    transport: &dyn HttpTransport,
    limiter: &TokenBucket,
    request: &HttpRequest,
) -> Result<HttpResponse, SourceError> {
    limiter.acquire();
    let resp = transport.execute(request)?;
    match resp.status {
        200..=299 => Ok(resp),
        404 | 410 => Err(SourceError::NotFound(request.url.clone())),
        429 => Err(SourceError::RateLimited {
            retry_after: resp.retry_after(),
        }),
        408 | 500..=599 => Err(SourceError::Network(format!(
            "HTTP {} for {}",
            resp.status, request.url
        ))),
        status => Err(SourceError::Resolution(format!(
            "HTTP {status} for {}",
            request.url
        ))),
    }
}

pub fn build_adapter(
    kind: SourceKind,
    config: &Config,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<TokenBucket>,
    translator: Option<Arc<dyn Translator>>,
) -> Arc<dyn SourceAdapter> {
    match kind {
        SourceKind::Standard => Arc::new(mangadex::MangaDexAdapter::new(transport, limiter, config)),
        SourceKind::Obstructed => Arc::new(baozimh::BaozimhAdapter::new(
            transport, limiter, translator, config,
        )),
    }
}
