//! 受阻源的处理策略与内容过滤（广告页、尾部推广页、尺寸离群页）。

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::PageResolution;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObstructedPolicy {
    /// 页数不超过该值时视为占位页
    pub placeholder_max_pages: usize,
    /// 图片地址包含这些片段时视为占位图
    pub placeholder_signatures: Vec<String>,
    /// 页面包含这些片段时视为锁章
    pub lock_markers: Vec<String>,
    /// 图片地址包含这些片段时视为广告
    pub ad_host_patterns: Vec<String>,
    /// 固定去掉结尾的 N 页
    pub trailing_ad_pages: usize,
    pub filter_dimension_outliers: bool,
    /// 宽度偏离中位数的比例超过该值算离群
    pub dimension_tolerance: f64,
    /// 只检查最后几页
    pub dimension_window: usize,
    /// 没有页数提示时，按 CDN 模板顺序探测的页数上限
    pub synthesize_max_pages: usize,
}

impl Default for ObstructedPolicy {
    fn default() -> Self {
        Self {
            placeholder_max_pages: 6,
            placeholder_signatures: vec![
                "/static/img/placeholder".to_string(),
                "loading.gif".to_string(),
                "lock.png".to_string(),
            ],
            lock_markers: vec![
                "comic-lock".to_string(),
                "chapter-lock".to_string(),
                "付费章节".to_string(),
                "需要解锁".to_string(),
            ],
            ad_host_patterns: vec![
                "googlesyndication".to_string(),
                "doubleclick".to_string(),
                "/ads/".to_string(),
                "adservice".to_string(),
            ],
            trailing_ad_pages: 0,
            filter_dimension_outliers: true,
            dimension_tolerance: 0.35,
            dimension_window: 3,
            synthesize_max_pages: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DimensionRule {
    pub tolerance: f64,
    pub window: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentFilter {
    pub ad_hosts: Vec<String>,
    pub trailing_pages: usize,
    pub dimension: Option<DimensionRule>,
}

impl ContentFilter {
    pub fn from_policy(policy: &ObstructedPolicy) -> Self {
        Self {
            ad_hosts: policy
                .ad_host_patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .cloned()
                .collect(),
            trailing_pages: policy.trailing_ad_pages,
            dimension: policy.filter_dimension_outliers.then_some(DimensionRule {
                tolerance: policy.dimension_tolerance.max(0.0),
                window: policy.dimension_window,
            }),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.ad_hosts.is_empty() && self.trailing_pages == 0 && self.dimension.is_none()
    }

    /// 去掉广告地址与尾部固定页数后重新连续编号。
    ///
    /// 页数不超过 `trailing_pages` 的章节不做尾部裁剪。
    pub fn apply(&self, mut resolution: PageResolution) -> PageResolution {
        let before = resolution.len();
        resolution
            .pages
            .retain(|p| !self.ad_hosts.iter().any(|pat| p.primary_url.contains(pat.as_str())));
        if self.trailing_pages > 0 && resolution.len() > self.trailing_pages {
            let keep = resolution.len() - self.trailing_pages;
            resolution.pages.truncate(keep);
        }
        resolution.reindex();
        if resolution.len() != before {
            debug!(
                chapter = %resolution.chapter_id,
                "过滤掉 {} 个广告/推广页",
                before - resolution.len()
            );
        }
        resolution
    }

    /// 尾部窗口里宽度与全章中位数差距过大的页（通常是推广图）。
    ///
    /// `dims` 是 `(页序号, 宽, 高)`，不要求有序；已知尺寸少于 3 个时不做判断。
    pub fn dimension_outliers(&self, dims: &[(usize, u32, u32)]) -> Vec<usize> {
        let Some(rule) = self.dimension else {
            return Vec::new();
        };
        if dims.len() < 3 || rule.window == 0 {
            return Vec::new();
        }
        let mut widths: Vec<u32> = dims.iter().map(|(_, w, _)| *w).collect();
        widths.sort_unstable();
        let median = f64::from(widths[widths.len() / 2]);
        if median <= 0.0 {
            return Vec::new();
        }

        let mut sorted: Vec<(usize, u32, u32)> = dims.to_vec();
        sorted.sort_by_key(|(idx, _, _)| *idx);
        // 窗口不超过一半页数，避免多数页被判成离群
        let window = rule.window.min(sorted.len() / 2);
        let mut outliers: Vec<usize> = sorted
            .iter()
            .rev()
            .take(window)
            .filter(|(_, w, _)| (f64::from(*w) - median).abs() / median > rule.tolerance)
            .map(|(idx, _, _)| *idx)
            .collect();
        outliers.sort_unstable();
        outliers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::models::ResolutionOrigin;

    fn resolution(urls: &[&str]) -> PageResolution {
        PageResolution::from_urls("c", urls.iter().copied(), ResolutionOrigin::Primary)
    }

    #[test]
    fn drops_ad_hosts_and_reindexes() {
        let filter = ContentFilter {
            ad_hosts: vec!["doubleclick".into()],
            ..ContentFilter::default()
        };
        let res = filter.apply(resolution(&[
            "https://cdn/1.jpg",
            "https://ad.doubleclick.net/x.jpg",
            "https://cdn/2.jpg",
        ]));
        assert_eq!(res.len(), 2);
        assert!(res.is_dense());
        assert_eq!(res.pages[1].primary_url, "https://cdn/2.jpg");
    }

    #[test]
    fn trims_trailing_pages_only_from_longer_chapters() {
        let filter = ContentFilter {
            trailing_pages: 2,
            ..ContentFilter::default()
        };
        assert_eq!(filter.apply(resolution(&["a", "b", "c", "d"])).len(), 2);
        assert_eq!(filter.apply(resolution(&["a", "b", "c"])).len(), 1);
        assert_eq!(filter.apply(resolution(&["a", "b"])).len(), 2);
    }

    #[test]
    fn flags_trailing_width_outliers() {
        let filter = ContentFilter::from_policy(&ObstructedPolicy::default());
        let mut dims: Vec<(usize, u32, u32)> = (0..8).map(|i| (i, 800, 1200)).collect();
        dims.push((8, 1920, 400));
        dims.push((3, 1920, 400));
        dims.retain(|d| !(d.0 == 3 && d.1 == 800));
        assert_eq!(filter.dimension_outliers(&dims), vec![8]);
    }

    #[test]
    fn too_few_dimensions_are_ignored() {
        let filter = ContentFilter::from_policy(&ObstructedPolicy::default());
        assert!(filter.dimension_outliers(&[(0, 800, 1), (1, 10, 1)]).is_empty());
        assert!(ContentFilter::default().dimension_outliers(&[(0, 1, 1), (1, 1, 1), (2, 900, 1)]).is_empty());
    }
}
