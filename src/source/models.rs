//! 源适配器共享的数据模型。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// 有公开 JSON API 的站点（MangaDex）
    Standard,
    /// 需要绕过占位页、锁章与 CDN 404 的站点（包子漫画）
    Obstructed,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Standard => f.write_str("standard"),
            SourceKind::Obstructed => f.write_str("obstructed"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "mangadex" => Ok(SourceKind::Standard),
            "obstructed" | "baozimh" => Ok(SourceKind::Obstructed),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MangaRef {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub alt_titles: Vec<String>,
    /// 查到的英文标题，只用于展示
    #[serde(default)]
    pub english_title: Option<String>,
    pub source: SourceKind,
    pub cover_url: Option<String>,
    #[serde(default)]
    pub description: String,
    pub status: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
}

impl MangaRef {
    /// `英文名 (原名)`，没有英文名时就是原名。
    pub fn display_title(&self) -> String {
        match self.english_title.as_deref() {
            Some(eng) if eng != self.title => format!("{eng} ({})", self.title),
            _ => self.title.clone(),
        }
    }
}

/// 没有章节号（oneshot、番外）时的排序值，排在所有编号章节之后。
pub const UNNUMBERED: f64 = 999_999.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRef {
    pub id: String,
    pub manga_id: String,
    pub number: f64,
    pub title: String,
    pub volume: Option<String>,
    pub language: Option<String>,
    pub scanlation_group: Option<String>,
    /// 发布时间（RFC 3339 原文），网页源没有
    pub release_date: Option<String>,
    pub locked: bool,
    /// 列表接口给出的页数（MangaDex `pages`），可能缺失
    pub pages_hint: Option<usize>,
}

impl ChapterRef {
    pub fn new(
        id: impl Into<String>,
        manga_id: impl Into<String>,
        number: f64,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            manga_id: manga_id.into(),
            number,
            title: title.into(),
            volume: None,
            language: None,
            scanlation_group: None,
            release_date: None,
            locked: false,
            pages_hint: None,
        }
    }

    pub fn is_numbered(&self) -> bool {
        self.number < UNNUMBERED
    }

    /// `12` / `12.5`，不带多余的小数位；无章节号时为 `Oneshot`。
    pub fn display_number(&self) -> String {
        if !self.is_numbered() {
            return "Oneshot".to_string();
        }
        if self.number.fract() == 0.0 && self.number.abs() < 1e15 {
            format!("{}", self.number as i64)
        } else {
            format!("{}", self.number)
        }
    }

    pub fn folder_label(&self) -> String {
        let base = if self.is_numbered() {
            format!("Chapter {}", self.display_number())
        } else {
            self.display_number()
        };
        let title = self.title.trim();
        if title.is_empty() || title == base {
            base
        } else {
            format!("{base} - {title}")
        }
    }
}

/// 按章节号升序稳定排序；同号章节（不同汉化组）保持原始顺序。
pub fn sort_chapters(chapters: &mut [ChapterRef]) {
    chapters.sort_by(|a, b| a.number.total_cmp(&b.number));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageDescriptor {
    pub index: usize,
    pub primary_url: String,
    pub fallback_url: Option<String>,
    /// 省流量画质地址（只有 MangaDex 提供）
    pub data_saver_url: Option<String>,
    #[serde(default)]
    pub needs_fallback: bool,
}

impl PageDescriptor {
    pub fn new(index: usize, primary_url: impl Into<String>) -> Self {
        Self {
            index,
            primary_url: primary_url.into(),
            fallback_url: None,
            data_saver_url: None,
            needs_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOrigin {
    Primary,
    AlternateEndpoint,
    AppApi,
    Synthesized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResolution {
    pub chapter_id: String,
    pub pages: Vec<PageDescriptor>,
    pub origin: ResolutionOrigin,
    /// 下载图片时需要带上的 Referer
    pub referer: Option<String>,
}

impl PageResolution {
    pub fn from_urls<I, S>(chapter_id: impl Into<String>, urls: I, origin: ResolutionOrigin) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pages = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| PageDescriptor::new(i, url))
            .collect();
        Self {
            chapter_id: chapter_id.into(),
            pages,
            origin,
            referer: None,
        }
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// 按当前顺序重新编号为 0..n。
    pub fn reindex(&mut self) {
        for (i, page) in self.pages.iter_mut().enumerate() {
            page.index = i;
        }
    }

    pub fn is_dense(&self) -> bool {
        self.pages.iter().enumerate().all(|(i, p)| p.index == i)
    }
}
