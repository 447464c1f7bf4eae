//! 页面解析流水线：调用源适配器解析，套用源的内容过滤，可选地做一次 Range 预探测。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, info};

use crate::base_system::rate_limit::TokenBucket;
use crate::network_parser::network::HttpTransport;
use crate::source::models::{ChapterRef, PageResolution};
use crate::source::{SourceAdapter, SourceError};
use crate::third_party::media_fetch::{FetchFailure, fetch_image};

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub enabled: bool,
    pub bytes: u64,
    pub workers: usize,
}

pub struct PagePipeline {
    adapter: Arc<dyn SourceAdapter>,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<TokenBucket>,
    probe: ProbeSettings,
}

impl PagePipeline {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<TokenBucket>,
        probe: ProbeSettings,
    ) -> Self {
        Self {
            adapter,
            transport,
            limiter,
            probe,
        }
    }

    /// 解析并定稿一章的页面序列；结果的页序号总是 0..n 连续。
    pub fn resolve(
        &self,
        chapter: &ChapterRef,
        cancel: &AtomicBool,
    ) -> Result<PageResolution, SourceError> {
        let raw = self.adapter.resolve_pages(chapter)?;
        let origin = raw.origin;
        let filter = self.adapter.content_filter();
        let mut resolution = if filter.is_noop() { raw } else { filter.apply(raw) };
        resolution.reindex();
        if resolution.is_empty() {
            return Err(SourceError::NotFound(format!("{} 过滤后没有页面", chapter.id)));
        }
        info!(
            chapter = %chapter.id,
            origin = ?origin,
            "解析到 {} 页",
            resolution.len()
        );

        if self.probe.enabled && !cancel.load(Ordering::Relaxed) {
            self.probe_pages(&mut resolution, cancel);
        }
        Ok(resolution)
    }

    /// 只取文件头确认主地址可用，不可用的页标记为需要备选地址。
    fn probe_pages(&self, resolution: &mut PageResolution, cancel: &AtomicBool) {
        let referer = resolution.referer.clone();
        let workers = self.probe.workers.clamp(1, 8);
        let chunk = resolution.pages.len().div_ceil(workers).max(1);
        let bytes = self.probe.bytes.max(1);

        thread::scope(|scope| {
            for pages in resolution.pages.chunks_mut(chunk) {
                let referer = referer.as_deref();
                scope.spawn(move || {
                    for page in pages {
                        if cancel.load(Ordering::Relaxed) {
                            return;
                        }
                        match fetch_image(
                            self.transport.as_ref(),
                            &self.limiter,
                            &page.primary_url,
                            referer,
                            Some(bytes),
                        ) {
                            Ok(_) => {}
                            Err(FetchFailure::Missing(reason)) => {
                                debug!(page = page.index, "预探测失败: {reason}");
                                page.needs_fallback = true;
                            }
                            // 网络问题留给正式下载时重试
                            Err(FetchFailure::Source(_)) => {}
                        }
                    }
                });
            }
        });

        let flagged = resolution.pages.iter().filter(|p| p.needs_fallback).count();
        if flagged > 0 {
            info!(chapter = %resolution.chapter_id, "预探测: {flagged} 页需要备选地址");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::filter::ContentFilter;
    use crate::source::models::{MangaRef, ResolutionOrigin, SourceKind};
    use crate::test_support::{MockTransport, png_bytes};

    struct FixedAdapter {
        urls: Vec<&'static str>,
        filter: ContentFilter,
    }

    impl SourceAdapter for FixedAdapter {
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
            Ok(PageResolution::from_urls(
                &chapter.id,
                self.urls.iter().copied(),
                ResolutionOrigin::Primary,
            ))
        }
        fn content_filter(&self) -> ContentFilter {
            self.filter.clone()
        }
    }

    fn pipeline(adapter: FixedAdapter, transport: Arc<MockTransport>, probe: bool) -> PagePipeline {
        PagePipeline::new(
            Arc::new(adapter),
            transport,
            Arc::new(TokenBucket::unlimited()),
            ProbeSettings {
                enabled: probe,
                bytes: 64,
                workers: 2,
            },
        )
    }

    #[test]
    fn filters_and_reindexes() {
        let adapter = FixedAdapter {
            urls: vec!["https://cdn/1.jpg", "https://ads.doubleclick.net/a.jpg", "https://cdn/2.jpg"],
            filter: ContentFilter {
                ad_hosts: vec!["doubleclick".into()],
                ..ContentFilter::default()
            },
        };
        let res = pipeline(adapter, Arc::new(MockTransport::new()), false)
            .resolve(&ChapterRef::new("c", "m", 1.0, ""), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(res.len(), 2);
        assert!(res.is_dense());
    }

    #[test]
    fn everything_filtered_is_not_found() {
        let adapter = FixedAdapter {
            urls: vec!["https://ads.doubleclick.net/a.jpg"],
            filter: ContentFilter {
                ad_hosts: vec!["doubleclick".into()],
                ..ContentFilter::default()
            },
        };
        let err = pipeline(adapter, Arc::new(MockTransport::new()), false)
            .resolve(&ChapterRef::new("c", "m", 1.0, ""), &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[test]
    fn probe_marks_broken_pages() {
        let transport = Arc::new(MockTransport::new());
        transport.on("https://cdn/1.jpg", MockTransport::image(png_bytes(2, 2)));
        transport.on("https://cdn/3.jpg", MockTransport::image(png_bytes(2, 2)));
        let adapter = FixedAdapter {
            urls: vec!["https://cdn/1.jpg", "https://cdn/2.jpg", "https://cdn/3.jpg"],
            filter: ContentFilter::default(),
        };
        let res = pipeline(adapter, transport.clone(), true)
            .resolve(&ChapterRef::new("c", "m", 1.0, ""), &AtomicBool::new(false))
            .unwrap();
        let flags: Vec<bool> = res.pages.iter().map(|p| p.needs_fallback).collect();
        assert_eq!(flags, vec![false, true, false]);
        assert!(transport.requests().iter().all(|r| r.byte_limit == Some(64)));
    }
}
