//! 包子漫画适配器（受阻源）。
//!
//! 网页版会对部分章节返回锁章页或只给几张占位图，图片 CDN 也时常 404。
//! 解析顺序：
//! 1. 章节页；出现锁章标记时改走 `page_direct` 备用入口
//! 2. 页数明显偏少（或命中占位图特征）时改走 App 接口
//! 3. App 接口也拿不到时，按 CDN 模板 `/scomic/{comic}/0/{chapter}/{n}.jpg` 自行拼出整章
//!
//! 单页 404 的变体爆破交给下载 worker，通过 `fallback_candidates` 提供候选。

use std::sync::Arc;

use reqwest::Url;
use tracing::{debug, info, warn};

use super::filter::{ContentFilter, ObstructedPolicy};
use super::models::{
    ChapterRef, MangaRef, PageDescriptor, PageResolution, ResolutionOrigin, SourceKind,
};
use super::variants::VariantPolicy;
use super::{SourceAdapter, SourceError, send_checked};
use crate::base_system::context::Config;
use crate::base_system::rate_limit::TokenBucket;
use crate::network_parser::html;
use crate::network_parser::network::{DEFAULT_USER_AGENT, HttpRequest, HttpResponse, HttpTransport};
use crate::third_party::media_fetch::{FetchFailure, fetch_image};
use crate::third_party::translate::Translator;

pub const BASE_URL: &str = "https://www.baozimh.com";
pub const APP_BASE: &str = "https://appgb3.baozimh.com";
pub const SYNTH_CDN_BASE: &str = "https://s2.baozicdn.com/w640";

const APP_USER_AGENT: &str = "baozimh_android/1.0.31/gb/adset";
const APP_ID: &str = "cn.sts.xiaoyun.ordermeals";
const APP_VERSION: &str = "1.0.31";
const APP_REFERER: &str = "https://appgb.baozimh.com/";
/// 无页数提示时顺序探测，连续这么多页不存在即停止
const SYNTH_MAX_MISSES: usize = 2;
/// 搜索结果只给前几条查英文标题，翻译接口每秒一次
const ENGLISH_LOOKUPS: usize = 8;

pub struct BaozimhAdapter {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<TokenBucket>,
    translator: Option<Arc<dyn Translator>>,
    policy: ObstructedPolicy,
    variants: VariantPolicy,
    base_url: String,
    app_base: String,
    synth_base: String,
}

impl BaozimhAdapter {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<TokenBucket>,
        translator: Option<Arc<dyn Translator>>,
        config: &Config,
    ) -> Self {
        Self {
            transport,
            limiter,
            translator: translator.filter(|_| config.translate_titles),
            policy: config.obstructed.clone(),
            variants: config.fallback.clone(),
            base_url: BASE_URL.to_string(),
            app_base: APP_BASE.to_string(),
            synth_base: SYNTH_CDN_BASE.to_string(),
        }
    }

    fn referer(&self) -> String {
        format!("{}/", self.base_url)
    }

    fn web_get(&self, url: &str) -> Result<HttpResponse, SourceError> {
        let request = HttpRequest::get(url)
            .header("User-Agent", DEFAULT_USER_AGENT)
            .header("Referer", self.base_url.as_str())
            .header("Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8");
        send_checked(self.transport.as_ref(), &self.limiter, &request)
    }

    fn comic_url(&self, manga_id: &str) -> String {
        if manga_id.starts_with("http") {
            manga_id.to_string()
        } else {
            format!("{}/comic/{}", self.base_url, manga_id.trim_matches('/'))
        }
    }

    fn page_direct_url(&self, comic_id: &str, slot: u32) -> String {
        format!(
            "{}/user/page_direct?comic_id={comic_id}&section_slot=0&chapter_slot={slot}",
            self.base_url
        )
    }

    fn app_url(&self, comic_id: &str, slot: u32) -> String {
        format!(
            "{}/baozimhapp/comic/chapter/{comic_id}/0_{slot}.html",
            self.app_base
        )
    }

    fn is_locked(&self, page: &str) -> bool {
        html::contains_marker(page, &self.policy.lock_markers)
    }

    fn looks_like_placeholder(&self, urls: &[String], expected: Option<usize>) -> bool {
        if urls.len() <= self.policy.placeholder_max_pages {
            return true;
        }
        if expected.is_some_and(|n| urls.len() < n) {
            return true;
        }
        urls.iter().any(|u| {
            self.policy
                .placeholder_signatures
                .iter()
                .filter(|s| !s.is_empty())
                .any(|s| u.contains(s.as_str()))
        })
    }

    /// 搜索前把非中日韩标题翻成原文标题；翻译失败时沿用原查询。
    fn search_term(&self, query: &str) -> String {
        if html::has_cjk(query) {
            return query.to_string();
        }
        let Some(translator) = &self.translator else {
            return query.to_string();
        };
        match translator.translate(query) {
            Ok(native) if !native.trim().is_empty() => {
                info!("搜索词翻译: {query} -> {native}");
                native
            }
            Ok(_) => query.to_string(),
            Err(err) => {
                warn!("标题翻译失败，使用原始查询: {err}");
                query.to_string()
            }
        }
    }

    /// 查英文标题用于展示，查不到不影响结果。
    fn english_title(&self, native: &str) -> Option<String> {
        let translator = self.translator.as_ref()?;
        match translator.english_title(native) {
            Ok(eng) if !eng.trim().is_empty() && eng.trim() != native => Some(eng.trim().to_string()),
            Ok(_) => None,
            Err(err) => {
                debug!("未找到 {native} 的英文标题: {err}");
                None
            }
        }
    }

    /// 锁章时的备用入口；拿不到 comic_id/slot 或备用入口同样锁住时返回 Locked。
    fn fetch_unlocked(
        &self,
        chapter: &ChapterRef,
        location: Option<&(String, u32)>,
    ) -> Result<String, SourceError> {
        let Some((comic_id, slot)) = location else {
            return Err(SourceError::Locked(format!(
                "{} 已锁定且无法定位备用入口",
                chapter.id
            )));
        };
        let url = self.page_direct_url(comic_id, *slot);
        info!("章节 {} 已锁定，尝试备用入口 {url}", chapter.id);
        let page = match self.web_get(&url) {
            Ok(resp) => resp.text(),
            Err(SourceError::NotFound(_)) => {
                return Err(SourceError::Locked(format!("{} 备用入口不存在", chapter.id)));
            }
            Err(e) => return Err(e),
        };
        if self.is_locked(&page) {
            return Err(SourceError::Locked(format!("{} 备用入口同样锁定", chapter.id)));
        }
        Ok(page)
    }

    /// 超过拼接上限的页数提示多半是页面里别处的数字，直接丢弃。
    fn plausible_hint(&self, hint: Option<usize>) -> Option<usize> {
        let cap = self.policy.synthesize_max_pages;
        match hint {
            Some(n) if n > cap => {
                debug!("忽略异常的页数提示 {n}（上限 {cap}）");
                None
            }
            other => other,
        }
    }

    /// 单独抓取页数提示；失败不影响解析。
    fn fetch_page_hint(&self, comic_id: &str, slot: u32) -> Result<Option<usize>, SourceError> {
        match self.web_get(&self.page_direct_url(comic_id, slot)) {
            Ok(resp) => Ok(self.plausible_hint(html::parse_page_count_hint(&resp.text()))),
            Err(e @ SourceError::RateLimited { .. }) => Err(e),
            Err(err) => {
                debug!("页数提示获取失败: {err}");
                Ok(None)
            }
        }
    }

    fn fetch_app_images(&self, comic_id: &str, slot: u32) -> Result<Vec<String>, SourceError> {
        let url = self.app_url(comic_id, slot);
        let host = Url::parse(&self.app_base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let request = HttpRequest::get(&url)
            .header("User-Agent", APP_USER_AGENT)
            .header("app-id", APP_ID)
            .header("app-version", APP_VERSION)
            .header("Host", host)
            .header("Referer", APP_REFERER);
        info!("尝试 App 接口: {url}");
        match send_checked(self.transport.as_ref(), &self.limiter, &request) {
            Ok(resp) => Ok(html::parse_app_images(&resp.text(), &self.synth_base)),
            Err(e @ SourceError::RateLimited { .. }) => Err(e),
            Err(err) => {
                warn!("App 接口失败: {err}");
                Ok(Vec::new())
            }
        }
    }

    /// 按 CDN 模板拼出整章地址。有页数提示直接生成，否则顺序探测到连续缺页为止。
    fn synthesize(
        &self,
        comic_id: &str,
        cdn_chapter: &str,
        hint: Option<usize>,
    ) -> Result<Vec<String>, SourceError> {
        let template =
            |n: usize| format!("{}/scomic/{comic_id}/0/{cdn_chapter}/{n}.jpg", self.synth_base);
        if let Some(count) = hint {
            let count = count.min(self.policy.synthesize_max_pages);
            return Ok((1..=count).map(template).collect());
        }

        let referer = self.referer();
        let mut urls = Vec::new();
        let mut misses = 0usize;
        for n in 1..=self.policy.synthesize_max_pages {
            let url = template(n);
            match fetch_image(
                self.transport.as_ref(),
                &self.limiter,
                &url,
                Some(&referer),
                Some(64),
            ) {
                Ok(_) => {
                    misses = 0;
                    urls.push(url);
                }
                Err(FetchFailure::Source(e @ SourceError::RateLimited { .. })) => return Err(e),
                Err(_) => {
                    misses += 1;
                    if misses >= SYNTH_MAX_MISSES {
                        break;
                    }
                }
            }
        }
        Ok(urls)
    }

    fn manga_from_detail(&self, id: &str, page: &str) -> Option<MangaRef> {
        let detail = html::parse_comic_detail(page, &self.base_url)?;
        Some(MangaRef {
            id: id.to_string(),
            english_title: self.english_title(&detail.title),
            title: detail.title,
            alt_titles: Vec::new(),
            source: SourceKind::Obstructed,
            cover_url: detail.cover,
            description: detail.description,
            status: None,
            languages: vec!["zh".to_string()],
        })
    }
}

fn comic_id_from_href(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    let rest = path.split("/comic/").nth(1)?;
    let id = rest.split('/').next()?.trim();
    (!id.is_empty() && id != "chapter").then(|| id.to_string())
}

impl SourceAdapter for BaozimhAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Obstructed
    }

    fn search(&self, query: &str) -> Result<Vec<MangaRef>, SourceError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        if query.contains("baozimh.com/comic/")
            && let Some(id) = comic_id_from_href(query)
        {
            return match self.fetch_manga(&id) {
                Ok(manga) => Ok(vec![manga]),
                Err(SourceError::NotFound(_)) => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }

        let term = self.search_term(query);
        let url = Url::parse_with_params(&format!("{}/search", self.base_url), &[("q", term.as_str())])
            .map_err(|e| SourceError::Resolution(e.to_string()))?;
        let page = self.web_get(url.as_str())?.text();

        let mut seen = Vec::new();
        let mut results = Vec::new();
        for card in html::parse_search_cards(&page, &self.base_url) {
            let Some(id) = comic_id_from_href(&card.href) else {
                continue;
            };
            if seen.contains(&id) {
                continue;
            }
            seen.push(id.clone());
            let english_title = if results.len() < ENGLISH_LOOKUPS {
                self.english_title(&card.title)
            } else {
                None
            };
            results.push(MangaRef {
                id,
                title: card.title,
                alt_titles: Vec::new(),
                english_title,
                source: SourceKind::Obstructed,
                cover_url: card.cover,
                description: String::new(),
                status: (!card.tags.is_empty()).then(|| card.tags.join(" ")),
                languages: vec!["zh".to_string()],
            });
        }
        debug!("包子漫画搜索 \"{term}\": {} 条结果", results.len());
        Ok(results)
    }

    fn fetch_manga(&self, manga_id: &str) -> Result<MangaRef, SourceError> {
        let page = self.web_get(&self.comic_url(manga_id))?.text();
        self.manga_from_detail(manga_id, &page)
            .ok_or_else(|| SourceError::Resolution(format!("{manga_id} 详情页缺少标题")))
    }

    /// 有 slot 的章节按 slot 升序，其余按页面顺序排在后面。
    fn list_chapters(&self, manga_id: &str) -> Result<Vec<ChapterRef>, SourceError> {
        let page = self.web_get(&self.comic_url(manga_id))?.text();
        let mut links: Vec<html::ChapterLink> = Vec::new();
        for link in html::parse_chapter_links(&page, &self.base_url) {
            match links.iter_mut().find(|l| l.href == link.href) {
                Some(existing) => {
                    if existing.slot.is_none() && link.slot.is_some() {
                        *existing = link;
                    }
                }
                None => links.push(link),
            }
        }
        links.sort_by_key(|l| (l.slot.is_none(), l.slot.unwrap_or(0)));

        let unknown_base = links.iter().filter_map(|l| l.slot).max().map_or(0, |m| m + 1);
        let chapters: Vec<ChapterRef> = links
            .into_iter()
            .enumerate()
            .map(|(pos, link)| {
                // slot 从 0 开始，章节号按 1 开始展示
                let number = match link.slot {
                    Some(slot) => f64::from(slot) + 1.0,
                    None => f64::from(unknown_base) + 1.0 + pos as f64,
                };
                let mut chapter = ChapterRef::new(link.href, manga_id, number, link.title);
                chapter.language = Some("zh".to_string());
                chapter.locked = link.locked;
                chapter
            })
            .collect();
        info!("包子漫画 {manga_id}: 共 {} 个章节", chapters.len());
        Ok(chapters)
    }

    fn resolve_pages(&self, chapter: &ChapterRef) -> Result<PageResolution, SourceError> {
        let chapter_url = html::absolutize(&chapter.id, &self.base_url);
        let location = html::chapter_location(&chapter_url);

        let primary = self.web_get(&chapter_url)?.text();
        let (page, mut origin) = if chapter.locked || self.is_locked(&primary) {
            (
                self.fetch_unlocked(chapter, location.as_ref())?,
                ResolutionOrigin::AlternateEndpoint,
            )
        } else {
            (primary, ResolutionOrigin::Primary)
        };

        let mut urls = html::parse_chapter_images(&page, &self.base_url);
        let mut hint =
            self.plausible_hint(html::parse_page_count_hint(&page).or(chapter.pages_hint));

        if self.looks_like_placeholder(&urls, hint)
            && let Some((comic_id, slot)) = &location
        {
            info!(
                "章节 {} 只解析到 {} 张图，疑似占位页",
                chapter.id,
                urls.len()
            );
            if hint.is_none() && origin == ResolutionOrigin::Primary {
                hint = self.fetch_page_hint(comic_id, *slot)?;
            }

            let app_urls = self.fetch_app_images(comic_id, *slot)?;
            if !app_urls.is_empty() && !self.looks_like_placeholder(&app_urls, hint) {
                info!("App 接口返回 {} 张图", app_urls.len());
                urls = app_urls;
                origin = ResolutionOrigin::AppApi;
            } else if let Some(cdn_chapter) =
                html::cdn_chapter_id(urls.iter().chain(app_urls.iter()).map(String::as_str))
                    .or_else(|| html::cdn_chapter_id([page.as_str()]))
            {
                let synthesized = self.synthesize(comic_id, &cdn_chapter, hint)?;
                if synthesized.len() > urls.len() {
                    info!("按 CDN 模板拼出 {} 页", synthesized.len());
                    urls = synthesized;
                    origin = ResolutionOrigin::Synthesized;
                }
            } else if app_urls.len() > urls.len() {
                urls = app_urls;
                origin = ResolutionOrigin::AppApi;
            }
        }

        if urls.is_empty() {
            return Err(SourceError::NotFound(format!("{} 没有解析到图片", chapter.id)));
        }
        Ok(PageResolution::from_urls(&chapter.id, urls, origin).with_referer(self.referer()))
    }

    fn content_filter(&self) -> ContentFilter {
        ContentFilter::from_policy(&self.policy)
    }

    fn fallback_candidates(&self, page: &PageDescriptor) -> Vec<String> {
        let mut out: Vec<String> = page.fallback_url.iter().cloned().collect();
        for candidate in self.variants.generate(&page.primary_url) {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockTransport, png_bytes};
    use anyhow::anyhow;

    struct FailingTranslator;

    impl Translator for FailingTranslator {
        fn translate(&self, _title: &str) -> anyhow::Result<String> {
            Err(anyhow!("service down"))
        }
    }

    struct FixedTranslator(&'static str);

    impl Translator for FixedTranslator {
        fn translate(&self, _title: &str) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct EnglishTranslator;

    impl Translator for EnglishTranslator {
        fn translate(&self, title: &str) -> anyhow::Result<String> {
            Ok(title.to_string())
        }

        fn english_title(&self, native: &str) -> anyhow::Result<String> {
            match native {
                "妖神记" => Ok("Tales of Demons and Gods".to_string()),
                _ => Err(anyhow!("no match")),
            }
        }
    }

    fn adapter(transport: Arc<MockTransport>, translator: Option<Arc<dyn Translator>>) -> BaozimhAdapter {
        BaozimhAdapter::new(
            transport,
            Arc::new(TokenBucket::unlimited()),
            translator,
            &Config::default(),
        )
    }

    fn images_html(count: usize, chapter: &str) -> String {
        let items: String = (1..=count)
            .map(|n| {
                format!(
                    r#"<amp-img class="comic-contain__item" src="https://s1.bzcdn.net/scomic/demo/0/{chapter}/{n}.jpg"></amp-img>"#
                )
            })
            .collect();
        format!(r#"<div class="comic-contain">{items}</div>"#)
    }

    const CHAPTER_URL: &str = "https://www.baozimh.com/comic/chapter/demo/0_4.html";
    const PAGE_DIRECT: &str =
        "https://www.baozimh.com/user/page_direct?comic_id=demo&section_slot=0&chapter_slot=4";
    const APP_URL: &str = "https://appgb3.baozimh.com/baozimhapp/comic/chapter/demo/0_4.html";

    #[test]
    fn plain_chapter_resolves_from_primary() {
        let transport = Arc::new(MockTransport::new());
        transport.on(CHAPTER_URL, MockTransport::html(&images_html(12, "c4")));
        let src = adapter(transport.clone(), None);

        let res = src
            .resolve_pages(&ChapterRef::new(CHAPTER_URL, "demo", 5.0, "第5话"))
            .unwrap();
        assert_eq!(res.origin, ResolutionOrigin::Primary);
        assert_eq!(res.len(), 12);
        assert_eq!(res.referer.as_deref(), Some("https://www.baozimh.com/"));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn locked_without_location_fails_locked() {
        let transport = Arc::new(MockTransport::new());
        let url = "https://www.baozimh.com/comic/chapter/demo/special.html";
        transport.on(url, MockTransport::html(r#"<div class="comic-lock">付费章节</div>"#));
        let src = adapter(transport, None);
        let err = src.resolve_pages(&ChapterRef::new(url, "demo", 1.0, "")).unwrap_err();
        assert!(matches!(err, SourceError::Locked(_)));
    }

    #[test]
    fn locked_on_both_endpoints_fails_locked() {
        let transport = Arc::new(MockTransport::new());
        transport.on(CHAPTER_URL, MockTransport::html(r#"<div class="comic-lock"></div>"#));
        transport.on(PAGE_DIRECT, MockTransport::html(r#"<p>需要解锁</p>"#));
        let src = adapter(transport, None);
        let err = src
            .resolve_pages(&ChapterRef::new(CHAPTER_URL, "demo", 5.0, ""))
            .unwrap_err();
        assert!(matches!(err, SourceError::Locked(_)));
    }

    #[test]
    fn locked_chapter_uses_alternate_endpoint() {
        let transport = Arc::new(MockTransport::new());
        transport.on(CHAPTER_URL, MockTransport::html(r#"<div class="chapter-lock"></div>"#));
        transport.on(PAGE_DIRECT, MockTransport::html(&images_html(9, "c4")));
        let src = adapter(transport, None);
        let res = src
            .resolve_pages(&ChapterRef::new(CHAPTER_URL, "demo", 5.0, ""))
            .unwrap();
        assert_eq!(res.origin, ResolutionOrigin::AlternateEndpoint);
        assert_eq!(res.len(), 9);
    }

    #[test]
    fn placeholder_pages_switch_to_app_endpoint() {
        let transport = Arc::new(MockTransport::new());
        transport.on(CHAPTER_URL, MockTransport::html(&images_html(3, "c4")));
        transport.on(PAGE_DIRECT, MockTransport::html(r#"<div class="comic-text__amp">(1/10)</div>"#));
        let app_imgs: String = (1..=10)
            .map(|n| format!(r#"<img src="/scomic/demo/0/c4/{n}.webp">"#))
            .collect();
        transport.on(APP_URL, MockTransport::html(&app_imgs));
        let src = adapter(transport.clone(), None);

        let res = src
            .resolve_pages(&ChapterRef::new(CHAPTER_URL, "demo", 5.0, ""))
            .unwrap();
        assert_eq!(res.origin, ResolutionOrigin::AppApi);
        assert_eq!(res.len(), 10);
        assert_eq!(
            res.pages[0].primary_url,
            "https://s2.baozicdn.com/w640/scomic/demo/0/c4/1.webp"
        );
        let app_req = transport
            .requests()
            .into_iter()
            .find(|r| r.url == APP_URL)
            .unwrap();
        assert!(app_req.headers.contains(&("User-Agent".to_string(), APP_USER_AGENT.to_string())));
    }

    #[test]
    fn synthesizes_from_hint_when_app_is_empty() {
        let transport = Arc::new(MockTransport::new());
        transport.on(CHAPTER_URL, MockTransport::html(&images_html(2, "c4")));
        transport.on(PAGE_DIRECT, MockTransport::html(r#"<div class="comic-text__amp">1 / 15</div>"#));
        transport.on(APP_URL, MockTransport::status(500));
        let src = adapter(transport, None);

        let res = src
            .resolve_pages(&ChapterRef::new(CHAPTER_URL, "demo", 5.0, ""))
            .unwrap();
        assert_eq!(res.origin, ResolutionOrigin::Synthesized);
        assert_eq!(res.len(), 15);
        assert_eq!(
            res.pages[14].primary_url,
            "https://s2.baozicdn.com/w640/scomic/demo/0/c4/15.jpg"
        );
        assert!(res.is_dense());
    }

    #[test]
    fn synthesizes_by_probing_without_hint() {
        let transport = Arc::new(MockTransport::new());
        transport.on(CHAPTER_URL, MockTransport::html(&images_html(1, "c4")));
        transport.on(PAGE_DIRECT, MockTransport::status(404));
        transport.on(APP_URL, MockTransport::html("<p>empty</p>"));
        for n in 1..=8 {
            transport.on(
                &format!("https://s2.baozicdn.com/w640/scomic/demo/0/c4/{n}.jpg"),
                MockTransport::image(png_bytes(4, 4)),
            );
        }
        let src = adapter(transport, None);
        let res = src
            .resolve_pages(&ChapterRef::new(CHAPTER_URL, "demo", 5.0, ""))
            .unwrap();
        assert_eq!(res.origin, ResolutionOrigin::Synthesized);
        assert_eq!(res.len(), 8);
    }

    #[test]
    fn oversized_page_hint_falls_back_to_probing() {
        let transport = Arc::new(MockTransport::new());
        transport.on(CHAPTER_URL, MockTransport::html(&images_html(2, "c4")));
        transport.on(PAGE_DIRECT, MockTransport::html(r#"<script>var d = {"page_count": 250000};</script>"#));
        transport.on(APP_URL, MockTransport::status(500));
        for n in 1..=5 {
            transport.on(
                &format!("https://s2.baozicdn.com/w640/scomic/demo/0/c4/{n}.jpg"),
                MockTransport::image(png_bytes(4, 4)),
            );
        }
        let src = adapter(transport, None);
        let res = src
            .resolve_pages(&ChapterRef::new(CHAPTER_URL, "demo", 5.0, ""))
            .unwrap();
        assert_eq!(res.origin, ResolutionOrigin::Synthesized);
        assert_eq!(res.len(), 5);
    }

    #[test]
    fn synthesized_pages_never_exceed_the_cap() {
        let src = adapter(Arc::new(MockTransport::new()), None);
        let cap = Config::default().obstructed.synthesize_max_pages;
        let urls = src.synthesize("demo", "c4", Some(cap * 10)).unwrap();
        assert_eq!(urls.len(), cap);
        assert!(urls[cap - 1].ends_with(&format!("/{cap}.jpg")));
        assert_eq!(src.plausible_hint(Some(cap + 1)), None);
        assert_eq!(src.plausible_hint(Some(cap)), Some(cap));
    }

    #[test]
    fn search_falls_back_to_original_query_when_translation_fails() {
        let transport = Arc::new(MockTransport::new());
        transport.on(
            "https://www.baozimh.com/search?",
            MockTransport::html(
                r#"<div class="comics-card"><a class="comics-card__poster" href="/comic/yaoshenji-tx" title="妖神记"></a>
                   <h3 class="comics-card__title">妖神记</h3></div>"#,
            ),
        );
        let src = adapter(transport.clone(), Some(Arc::new(FailingTranslator)));
        let results = src.search("Tales of Demons").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "yaoshenji-tx");
        assert_eq!(
            transport.requests()[0].url,
            "https://www.baozimh.com/search?q=Tales+of+Demons"
        );
    }

    #[test]
    fn search_results_carry_english_titles_when_found() {
        let transport = Arc::new(MockTransport::new());
        transport.on(
            "https://www.baozimh.com/search?",
            MockTransport::html(
                r#"<div class="comics-card"><a class="comics-card__poster" href="/comic/yaoshenji-tx" title="妖神记"></a>
                   <h3 class="comics-card__title">妖神记</h3></div>
                   <div class="comics-card"><a class="comics-card__poster" href="/comic/other-x" title="无名"></a>
                   <h3 class="comics-card__title">无名</h3></div>"#,
            ),
        );
        let src = adapter(transport, Some(Arc::new(EnglishTranslator)));
        let results = src.search("妖神记").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].display_title(), "Tales of Demons and Gods (妖神记)");
        assert_eq!(results[1].english_title, None);
        assert_eq!(results[1].display_title(), "无名");
    }

    #[test]
    fn search_uses_translated_title() {
        let transport = Arc::new(MockTransport::new());
        transport.on("https://www.baozimh.com/search?", MockTransport::html("<p></p>"));
        let src = adapter(transport.clone(), Some(Arc::new(FixedTranslator("妖神记"))));
        assert!(src.search("Tales of Demons").unwrap().is_empty());
        assert!(src.search("").unwrap().is_empty());
        let url = &transport.requests()[0].url;
        assert!(url.starts_with("https://www.baozimh.com/search?q=%E5%A6%96"));
    }

    #[test]
    fn lists_chapters_sorted_by_slot() {
        let transport = Arc::new(MockTransport::new());
        transport.on(
            "https://www.baozimh.com/comic/demo",
            MockTransport::html(
                r#"
                <div class="comics-chapters"><a href="/comic/chapter/demo/0_2.html">第3话</a></div>
                <div class="comics-chapters"><a href="/comic/chapter/demo/0_0.html">第1话</a></div>
                <div id="chapters_box">
                  <div class="comics-chapters"><a href="/comic/chapter/demo/0_1.html"><span class="lock-icon"></span>第2话</a></div>
                  <div class="comics-chapters"><a href="/comic/chapter/demo/0_2.html">第3话</a></div>
                </div>"#,
            ),
        );
        let src = adapter(transport, None);
        let chapters = src.list_chapters("demo").unwrap();
        let numbers: Vec<f64> = chapters.iter().map(|c| c.number).collect();
        assert_eq!(numbers, vec![1.0, 2.0, 3.0]);
        assert!(chapters[1].locked);
        assert_eq!(chapters[0].id, "https://www.baozimh.com/comic/chapter/demo/0_0.html");
    }

    #[test]
    fn fallback_candidates_follow_variant_order() {
        let transport = Arc::new(MockTransport::new());
        let src = adapter(transport, None);
        let page = PageDescriptor::new(6, "https://s1.bzcdn.net/scomic/demo/0/c4/7.jpg");
        let candidates = src.fallback_candidates(&page);
        assert_eq!(candidates[0], "https://s2.bzcdn.net/scomic/demo/0/c4/7.jpg");
        assert!(candidates.len() <= Config::default().fallback.max_variants);
    }
}
