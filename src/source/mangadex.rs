//! MangaDex 适配器（标准 JSON API 源）。

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use reqwest::Url;
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use tracing::{debug, info};

use super::models::{
    ChapterRef, MangaRef, PageDescriptor, PageResolution, ResolutionOrigin, SourceKind,
    UNNUMBERED, sort_chapters,
};
use super::{SourceAdapter, SourceError, send_checked};
use crate::base_system::context::Config;
use crate::base_system::rate_limit::TokenBucket;
use crate::network_parser::network::{HttpRequest, HttpTransport};

pub const API_BASE: &str = "https://api.mangadex.org";
pub const UPLOADS_BASE: &str = "https://uploads.mangadex.org";

const MAX_CHAPTER_OFFSET: usize = 5000;

static TITLE_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"mangadex\.org/title/([0-9a-fA-F]{8}-[0-9a-fA-F-]{27})").expect("static regex")
});
static LEADING_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("static regex"));

// ── API 结构 ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct Entity<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct MangaData {
    id: String,
    #[serde(default)]
    attributes: MangaAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MangaAttributes {
    #[serde(default, deserialize_with = "lang_map")]
    title: BTreeMap<String, String>,
    #[serde(default)]
    alt_titles: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "lang_map")]
    description: BTreeMap<String, String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    available_translated_languages: Vec<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct Relationship {
    id: String,
    #[serde(rename = "type")]
    rel_type: String,
    #[serde(default)]
    attributes: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChapterData {
    id: String,
    #[serde(default)]
    attributes: ChapterAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterAttributes {
    chapter: Option<String>,
    title: Option<String>,
    volume: Option<String>,
    translated_language: Option<String>,
    external_url: Option<String>,
    pages: Option<usize>,
    publish_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHome {
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHomeChapter {
    hash: String,
    #[serde(default)]
    data: Vec<String>,
    #[serde(default)]
    data_saver: Vec<String>,
}

// 空的多语言字段会被序列化成 `[]` 而不是 `{}`
fn lang_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    })
}

fn pick_lang(map: &BTreeMap<String, String>) -> Option<&str> {
    map.get("en")
        .or_else(|| map.get("ja-ro"))
        .or_else(|| map.values().next())
        .map(String::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 归一化后的查询是否出现在候选标题中（子串或全部词命中）。
fn matches_query(query: &str, candidate: &str) -> bool {
    if query.is_empty() || candidate.is_empty() {
        return false;
    }
    if candidate.contains(query) {
        return true;
    }
    let tokens: Vec<&str> = candidate.split(' ').collect();
    query.split(' ').all(|q| tokens.contains(&q))
}

fn parse_chapter_number(raw: Option<&str>) -> f64 {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return UNNUMBERED;
    };
    raw.parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .or_else(|| {
            LEADING_NUMBER_RE
                .captures(raw)
                .and_then(|c| c.get(1)?.as_str().parse().ok())
        })
        .unwrap_or(UNNUMBERED)
}

// ── 适配器 ────────────────────────────────────────────────────

pub struct MangaDexAdapter {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<TokenBucket>,
    api_base: String,
    uploads_base: String,
    data_saver: bool,
    languages: Vec<String>,
    page_limit: usize,
}

impl MangaDexAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>, limiter: Arc<TokenBucket>, config: &Config) -> Self {
        Self {
            transport,
            limiter,
            api_base: API_BASE.to_string(),
            uploads_base: UPLOADS_BASE.to_string(),
            data_saver: config.data_saver,
            languages: config
                .languages
                .iter()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            page_limit: 100,
        }
    }

    #[cfg(test)]
    fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let raw = format!("{}{}", self.api_base, path);
        let url = if params.is_empty() {
            Url::parse(&raw)
        } else {
            Url::parse_with_params(&raw, params)
        }
        .map_err(|e| SourceError::Resolution(format!("bad url {path}: {e}")))?;
        let request = HttpRequest::get(url.as_str()).header("Accept", "application/json");
        let resp = send_checked(self.transport.as_ref(), &self.limiter, &request)?;
        resp.json()
            .map_err(|e| SourceError::Resolution(format!("{path}: {e}")))
    }

    fn cover_url(&self, manga_id: &str, rels: &[Relationship]) -> Option<String> {
        rels.iter()
            .filter(|r| r.rel_type == "cover_art")
            .find_map(|r| r.attributes.as_ref()?.get("fileName")?.as_str().map(str::to_string))
            .map(|file| format!("{}/covers/{}/{}.512.jpg", self.uploads_base, manga_id, file))
    }

    fn to_manga(&self, data: MangaData) -> MangaRef {
        let attrs = &data.attributes;
        let title = pick_lang(&attrs.title)
            .map(str::to_string)
            .or_else(|| {
                attrs
                    .alt_titles
                    .iter()
                    .filter_map(|v| v.as_object())
                    .flat_map(|m| m.values())
                    .find_map(|v| v.as_str().map(str::to_string))
            })
            .unwrap_or_else(|| "Unknown".to_string());

        let mut alt_titles: Vec<String> = Vec::new();
        let all_titles = attrs.title.values().cloned().chain(
            attrs
                .alt_titles
                .iter()
                .filter_map(|v| v.as_object())
                .flat_map(|m| m.values().filter_map(|v| v.as_str().map(str::to_string))),
        );
        for t in all_titles {
            if t != title && !t.trim().is_empty() && !alt_titles.contains(&t) {
                alt_titles.push(t);
            }
        }

        MangaRef {
            cover_url: self.cover_url(&data.id, &data.relationships),
            description: pick_lang(&attrs.description).unwrap_or("").to_string(),
            status: attrs.status.clone(),
            languages: attrs
                .available_translated_languages
                .iter()
                .flatten()
                .cloned()
                .collect(),
            source: SourceKind::Standard,
            id: data.id,
            title,
            alt_titles,
            english_title: None,
        }
    }

    fn to_chapter(&self, manga_id: &str, data: ChapterData) -> ChapterRef {
        let attrs = data.attributes;
        let mut groups: Vec<String> = Vec::new();
        for rel in data.relationships.iter().filter(|r| r.rel_type == "scanlation_group") {
            let name = rel
                .attributes
                .as_ref()
                .and_then(|a| a.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or(rel.id.as_str())
                .to_string();
            if !groups.contains(&name) {
                groups.push(name);
            }
        }
        let number = parse_chapter_number(attrs.chapter.as_deref());
        let mut chapter = ChapterRef::new(
            data.id,
            manga_id,
            number,
            attrs.title.map(|t| t.trim().to_string()).unwrap_or_default(),
        );
        chapter.volume = attrs.volume.filter(|v| !v.is_empty());
        chapter.language = attrs.translated_language;
        chapter.scanlation_group = (!groups.is_empty()).then(|| groups.join(", "));
        chapter.locked = attrs.external_url.is_some() || attrs.pages == Some(0);
        chapter.pages_hint = attrs.pages.filter(|p| *p > 0);
        chapter.release_date = attrs.publish_at;
        chapter
    }

    fn search_raw(&self, title: &str) -> Result<Vec<MangaData>, SourceError> {
        let params = [
            ("title", title.to_string()),
            ("limit", self.page_limit.min(100).to_string()),
            ("includes[]", "cover_art".to_string()),
        ];
        let page: Collection<MangaData> = self.get_json("/manga", &params)?;
        Ok(page.data)
    }
}

impl SourceAdapter for MangaDexAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Standard
    }

    fn search(&self, query: &str) -> Result<Vec<MangaRef>, SourceError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(id) = TITLE_URL_RE.captures(query).and_then(|c| c.get(1)) {
            return match self.fetch_manga(id.as_str()) {
                Ok(manga) => Ok(vec![manga]),
                Err(SourceError::NotFound(_)) => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }

        let mut raw = self.search_raw(query)?;
        let query_norm = normalize(query);
        // 结果很少时用前几个词再搜一次，补齐标题写法不一致的情况
        let tokens: Vec<&str> = query_norm.split(' ').collect();
        if raw.len() < 5 && tokens.len() > 1 {
            let shorter = tokens.iter().take(3).copied().collect::<Vec<_>>().join(" ");
            if shorter != query_norm {
                debug!("MangaDex 结果过少，改用 \"{shorter}\" 重试");
                raw.extend(self.search_raw(&shorter)?);
            }
        }

        let mut seen = Vec::new();
        let mut ranked: Vec<(bool, MangaRef)> = Vec::new();
        for data in raw {
            if seen.contains(&data.id) {
                continue;
            }
            seen.push(data.id.clone());
            let manga = self.to_manga(data);
            let matched = std::iter::once(&manga.title)
                .chain(manga.alt_titles.iter())
                .any(|t| matches_query(&query_norm, &normalize(t)));
            ranked.push((matched, manga));
        }
        ranked.sort_by(|(am, a), (bm, b)| {
            bm.cmp(am)
                .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
        });
        Ok(ranked.into_iter().map(|(_, m)| m).collect())
    }

    fn fetch_manga(&self, manga_id: &str) -> Result<MangaRef, SourceError> {
        let entity: Entity<MangaData> = self.get_json(
            &format!("/manga/{manga_id}"),
            &[("includes[]", "cover_art".to_string())],
        )?;
        Ok(self.to_manga(entity.data))
    }

    fn list_chapters(&self, manga_id: &str) -> Result<Vec<ChapterRef>, SourceError> {
        let mut chapters = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut params = vec![
                ("manga", manga_id.to_string()),
                ("limit", self.page_limit.to_string()),
                ("offset", offset.to_string()),
                ("order[chapter]", "asc".to_string()),
                ("includes[]", "scanlation_group".to_string()),
            ];
            for lang in &self.languages {
                params.push(("translatedLanguage[]", lang.clone()));
            }
            let page: Collection<ChapterData> = self.get_json("/chapter", &params)?;
            let count = page.data.len();
            chapters.extend(page.data.into_iter().map(|c| self.to_chapter(manga_id, c)));
            offset += count;

            let exhausted = page.total.is_some_and(|t| offset >= t);
            if count < self.page_limit || exhausted || offset >= MAX_CHAPTER_OFFSET {
                break;
            }
        }
        sort_chapters(&mut chapters);
        info!("MangaDex {manga_id}: 共 {} 个章节", chapters.len());
        Ok(chapters)
    }

    fn resolve_pages(&self, chapter: &ChapterRef) -> Result<PageResolution, SourceError> {
        let home: AtHome = self.get_json(&format!("/at-home/server/{}", chapter.id), &[])?;
        let base = home.base_url.trim_end_matches('/');
        let hash = &home.chapter.hash;

        let (mut primary_mode, mut primary, mut alt_mode, mut alt) = if self.data_saver {
            ("data-saver", home.chapter.data_saver, "data", home.chapter.data)
        } else {
            ("data", home.chapter.data, "data-saver", home.chapter.data_saver)
        };
        if primary.is_empty() {
            std::mem::swap(&mut primary, &mut alt);
            std::mem::swap(&mut primary_mode, &mut alt_mode);
        }
        if primary.is_empty() {
            return Err(if chapter.locked {
                SourceError::Locked(format!("{} 是外链章节", chapter.id))
            } else {
                SourceError::NotFound(format!("{} 没有页面", chapter.id))
            });
        }

        let saver_files = if primary_mode == "data-saver" { &primary } else { &alt };
        let pages = primary
            .iter()
            .enumerate()
            .map(|(i, file)| PageDescriptor {
                index: i,
                primary_url: format!("{base}/{primary_mode}/{hash}/{file}"),
                fallback_url: alt
                    .get(i)
                    .map(|f| format!("{base}/{alt_mode}/{hash}/{f}")),
                data_saver_url: saver_files
                    .get(i)
                    .map(|f| format!("{base}/data-saver/{hash}/{f}")),
                needs_fallback: false,
            })
            .collect();

        Ok(PageResolution {
            chapter_id: chapter.id.clone(),
            pages,
            origin: ResolutionOrigin::Primary,
            referer: None,
        })
    }
}
