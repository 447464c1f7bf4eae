//! 标题翻译：把英文/罗马字标题换成原文标题，供只支持中文检索的源使用；
//! 反向查英文标题用于结果展示，AniList 查不到时退到 MangaUpdates。

use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::base_system::rate_limit::TokenBucket;
use crate::network_parser::network::{HttpRequest, HttpTransport};

pub const ANILIST_ENDPOINT: &str = "https://graphql.anilist.co";
pub const MANGAUPDATES_ENDPOINT: &str = "https://api.mangaupdates.com/v1/series/search";

const MEDIA_QUERY: &str = r#"
query ($search: String) {
  Media(search: $search, type: MANGA) {
    title { native romaji english }
  }
}
"#;

pub trait Translator: Send + Sync {
    fn translate(&self, title: &str) -> Result<String>;

    /// 原文标题 → 英文（或罗马字）标题。
    fn english_title(&self, native: &str) -> Result<String> {
        Err(anyhow!("不支持查询 {native} 的英文标题"))
    }
}

pub struct AniListTranslator {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<TokenBucket>,
    endpoint: String,
    fallback_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<GraphData>,
}

#[derive(Debug, Deserialize)]
struct GraphData {
    #[serde(rename = "Media")]
    media: Option<GraphMedia>,
}

#[derive(Debug, Deserialize)]
struct GraphMedia {
    title: GraphTitle,
}

#[derive(Debug, Deserialize)]
struct GraphTitle {
    native: Option<String>,
    romaji: Option<String>,
    english: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeriesSearch {
    #[serde(default)]
    results: Vec<SeriesHit>,
}

#[derive(Debug, Deserialize)]
struct SeriesHit {
    record: SeriesRecord,
}

#[derive(Debug, Deserialize)]
struct SeriesRecord {
    title: Option<String>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl AniListTranslator {
    pub fn new(transport: Arc<dyn HttpTransport>, limiter: Arc<TokenBucket>) -> Self {
        Self {
            transport,
            limiter,
            endpoint: ANILIST_ENDPOINT.to_string(),
            fallback_endpoint: MANGAUPDATES_ENDPOINT.to_string(),
        }
    }

    fn lookup(&self, title: &str) -> Result<GraphTitle> {
        let body = json!({ "query": MEDIA_QUERY, "variables": { "search": title } });
        let request = HttpRequest::post_json(&self.endpoint, body)
            .header("Accept", "application/json");

        self.limiter.acquire();
        let resp = self.transport.execute(&request)?;
        if !resp.is_success() {
            return Err(anyhow!("AniList 返回 HTTP {}", resp.status));
        }
        let parsed: GraphResponse = resp.json()?;
        parsed
            .data
            .and_then(|d| d.media)
            .map(|m| m.title)
            .ok_or_else(|| anyhow!("AniList 未找到 {title}"))
    }

    fn mangaupdates_title(&self, title: &str) -> Result<String> {
        let body = json!({ "search": title, "page": 1, "perpage": 1 });
        self.limiter.acquire();
        let resp = self.transport.execute(&HttpRequest::post_json(&self.fallback_endpoint, body))?;
        if !resp.is_success() {
            return Err(anyhow!("MangaUpdates 返回 HTTP {}", resp.status));
        }
        let parsed: SeriesSearch = resp.json()?;
        parsed
            .results
            .into_iter()
            .next()
            .and_then(|hit| non_empty(hit.record.title))
            .ok_or_else(|| anyhow!("MangaUpdates 未找到 {title}"))
    }
}

impl Translator for AniListTranslator {
    fn translate(&self, title: &str) -> Result<String> {
        let native = non_empty(self.lookup(title)?.native)
            .ok_or_else(|| anyhow!("AniList 未找到 {title} 的原文标题"))?;
        debug!("标题翻译: {title} -> {native}");
        Ok(native)
    }

    fn english_title(&self, native: &str) -> Result<String> {
        let from_anilist = match self.lookup(native) {
            Ok(t) => non_empty(t.english).or_else(|| non_empty(t.romaji)),
            Err(err) => {
                debug!("AniList 查询英文标题失败: {err}");
                None
            }
        };
        let english = match from_anilist {
            Some(e) => e,
            None => self.mangaupdates_title(native)?,
        };
        debug!("英文标题: {native} -> {english}");
        Ok(english)
    }
}
