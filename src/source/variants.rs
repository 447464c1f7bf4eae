//! 图片地址变体生成：主地址 404 时按 CDN 主机、扩展名、页码偏移依次尝试。

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<origin>https?://[^/?#]+)(?P<dir>/(?:[^?#]*/)?)(?P<file>[^/?#]+)(?P<tail>[?#].*)?$")
        .expect("static regex")
});
static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<stem>.*?)(?P<num>\d+)?\.(?P<ext>[A-Za-z0-9]{2,5})$").expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantAxis {
    Host,
    Extension,
    Offset,
    /// 主机 × 扩展名组合
    HostExtension,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantPolicy {
    pub order: Vec<VariantAxis>,
    /// 完整前缀，例如 `https://s2.baozicdn.com/w640`
    pub hosts: Vec<String>,
    /// 路径从这里开始在不同主机间保持一致
    pub path_anchor: String,
    pub extensions: Vec<String>,
    pub number_offsets: Vec<i64>,
    pub max_variants: usize,
}

impl Default for VariantPolicy {
    fn default() -> Self {
        Self {
            order: vec![
                VariantAxis::Host,
                VariantAxis::Extension,
                VariantAxis::Offset,
                VariantAxis::HostExtension,
            ],
            hosts: vec![
                "https://s1.bzcdn.net".to_string(),
                "https://s2.bzcdn.net".to_string(),
                "https://tem2.baozimh.com".to_string(),
                "https://tem3.baozimh.com".to_string(),
                "https://s2.baozicdn.com/w640".to_string(),
            ],
            path_anchor: "/scomic/".to_string(),
            extensions: vec![
                "jpg".to_string(),
                "webp".to_string(),
                "png".to_string(),
                "jpeg".to_string(),
            ],
            number_offsets: vec![-1, 1],
            max_variants: 24,
        }
    }
}

#[derive(Debug, Clone)]
struct UrlParts<'a> {
    origin: &'a str,
    /// 锚点之前的路径前缀（CDN 的尺寸目录等）
    prefix: &'a str,
    /// 从锚点开始到文件名前
    anchored: &'a str,
    stem: &'a str,
    number: Option<&'a str>,
    ext: Option<&'a str>,
    file: &'a str,
    tail: &'a str,
}

impl<'a> UrlParts<'a> {
    fn parse(url: &'a str, anchor: &str) -> Option<Self> {
        let caps = URL_RE.captures(url)?;
        let origin = caps.name("origin")?.as_str();
        let dir = caps.name("dir")?.as_str();
        let file = caps.name("file")?.as_str();
        let tail = caps.name("tail").map_or("", |m| m.as_str());

        let (prefix, anchored) = match (!anchor.is_empty()).then(|| dir.find(anchor)).flatten() {
            Some(pos) => dir.split_at(pos),
            None => ("", dir),
        };

        let (stem, number, ext) = match FILE_RE.captures(file) {
            Some(fc) => (
                fc.name("stem").map_or("", |m| m.as_str()),
                fc.name("num").map(|m| m.as_str()),
                fc.name("ext").map(|m| m.as_str()),
            ),
            None => (file, None, None),
        };

        Some(Self {
            origin,
            prefix,
            anchored,
            stem,
            number,
            ext,
            file,
            tail,
        })
    }

    fn build(&self, host: Option<&str>, number: Option<String>, ext: Option<&str>) -> String {
        let base = match host {
            Some(h) => h.trim_end_matches('/').to_string(),
            None => format!("{}{}", self.origin, self.prefix),
        };
        let file = if number.is_none() && ext.is_none() {
            self.file.to_string()
        } else {
            let num = number.as_deref().or(self.number).unwrap_or("");
            match ext.or(self.ext) {
                Some(e) => format!("{}{}.{}", self.stem, num, e),
                None => format!("{}{}", self.stem, num),
            }
        };
        format!("{base}{}{file}{}", self.anchored, self.tail)
    }

    fn shifted_number(&self, offset: i64) -> Option<String> {
        let raw = self.number?;
        let value: i64 = raw.parse().ok()?;
        let shifted = value.checked_add(offset)?;
        if shifted < 0 {
            return None;
        }
        // 保留原有的零填充宽度
        Some(format!("{:0width$}", shifted, width = raw.len()))
    }
}

impl VariantPolicy {
    /// 按配置顺序生成去重后的备选地址，不包含原地址，最多 `max_variants` 个。
    pub fn generate(&self, url: &str) -> Vec<String> {
        let Some(parts) = UrlParts::parse(url, &self.path_anchor) else {
            return Vec::new();
        };
        let own_ext = parts.ext.map(str::to_ascii_lowercase);
        let other_exts: Vec<&str> = self
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.'))
            .filter(|e| !e.is_empty())
            .filter(|e| own_ext.as_deref() != Some(&e.to_ascii_lowercase()))
            .collect();

        let mut seen: HashSet<String> = HashSet::from([url.to_string()]);
        let mut out = Vec::new();
        let mut push = |candidate: String, out: &mut Vec<String>| {
            if out.len() < self.max_variants && seen.insert(candidate.clone()) {
                out.push(candidate);
            }
        };

        for axis in &self.order {
            match axis {
                VariantAxis::Host => {
                    for host in &self.hosts {
                        push(parts.build(Some(host), None, None), &mut out);
                    }
                }
                VariantAxis::Extension => {
                    if parts.ext.is_none() {
                        continue;
                    }
                    for ext in &other_exts {
                        push(parts.build(None, None, Some(ext)), &mut out);
                    }
                }
                VariantAxis::Offset => {
                    for offset in &self.number_offsets {
                        if let Some(num) = parts.shifted_number(*offset) {
                            push(parts.build(None, Some(num), None), &mut out);
                        }
                    }
                }
                VariantAxis::HostExtension => {
                    if parts.ext.is_none() {
                        continue;
                    }
                    for host in &self.hosts {
                        for ext in &other_exts {
                            push(parts.build(Some(host), None, Some(ext)), &mut out);
                        }
                    }
                }
            }
        }
        out
    }
}
