//! 包子漫画网页解析（搜索卡片、详情、章节目录、章节图片）。

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

macro_rules! selector {
    ($name:ident, $css:expr) => {
        static $name: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse($css).expect("static selector"));
    };
}

macro_rules! regex {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($re).expect("static regex"));
    };
}

selector!(CARD, "div.comics-card");
selector!(CARD_POSTER, "a.comics-card__poster");
selector!(CARD_TITLE, "h3.comics-card__title");
selector!(CARD_TAGS, ".tags");
selector!(ANY_IMG, "amp-img, img");
selector!(DETAIL_TITLE, ".comics-detail__title");
selector!(DETAIL_POSTER, "amp-img.comics-detail__poster");
selector!(DETAIL_DESC, ".comics-detail__desc");
selector!(DETAIL_AUTHOR, ".comics-detail__author");
selector!(CHAPTER_LINKS, ".comics-chapters a, div#chapters_box a");
selector!(ALL_LINKS, "a[href]");
selector!(CONTAIN_ITEM, ".comic-contain__item");
selector!(CONTAIN_IMG, ".comic-contain amp-img, .comic-contain img");
selector!(AMP_IMG, "amp-img");
selector!(PAGER_TEXT, ".comic-text__amp");

regex!(PAGER_RE, r"(\d+)\s*/\s*(\d+)");
regex!(PAGE_COUNT_JSON_RE, r#""(?:page_count|total_page|totalPage)"\s*:\s*"?(\d+)"#);
regex!(SLOT_QUERY_RE, r"[?&]chapter_slot=(\d+)");
regex!(COMIC_QUERY_RE, r"[?&]comic_id=([^&#]+)");
regex!(SLOT_PATH_RE, r"/comic/chapter/([^/?#]+)/0_(\d+)");
regex!(SLOT_FILE_RE, r"0_(\d+)\.html");
regex!(CDN_CHAPTER_RE, r"/scomic/([^/]+)/0/([^/]+)/");
regex!(CJK_RE, r"[\p{Han}\p{Hiragana}\p{Katakana}\p{Hangul}]");

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SearchCard {
    pub href: String,
    pub title: String,
    pub cover: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ComicDetail {
    pub title: String,
    pub cover: Option<String>,
    pub description: String,
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChapterLink {
    pub href: String,
    pub title: String,
    pub slot: Option<u32>,
    pub locked: bool,
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn img_src(el: ElementRef<'_>) -> Option<String> {
    let v = el.value();
    v.attr("data-src")
        .or_else(|| v.attr("src"))
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with("data:"))
        .map(str::to_string)
}

fn has_class_fragment(el: ElementRef<'_>, fragment: &str) -> bool {
    el.descendants()
        .filter_map(|n| n.value().as_element())
        .any(|e| e.classes().any(|c| c.contains(fragment)))
}

fn inside_recommend(el: ElementRef<'_>) -> bool {
    el.ancestors()
        .filter_map(|n| n.value().as_element())
        .any(|e| e.classes().any(|c| c == "recommend--item"))
}

/// 把 `//host/x`、`/x` 之类的相对地址补全成绝对地址。
pub(crate) fn absolutize(src: &str, base: &str) -> String {
    let src = src.trim();
    if src.starts_with("http://") || src.starts_with("https://") {
        src.to_string()
    } else if let Some(rest) = src.strip_prefix("//") {
        format!("https://{rest}")
    } else if src.starts_with('/') {
        format!("{}{}", base.trim_end_matches('/'), src)
    } else {
        format!("{}/{}", base.trim_end_matches('/'), src)
    }
}

fn dedupe(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}

pub(crate) fn parse_search_cards(html: &str, base: &str) -> Vec<SearchCard> {
    let doc = Html::parse_document(html);
    let mut cards = Vec::new();
    for card in doc.select(&CARD) {
        let Some(poster) = card.select(&CARD_POSTER).next() else {
            continue;
        };
        let Some(href) = poster.value().attr("href").filter(|h| !h.is_empty()) else {
            continue;
        };
        let title = card
            .select(&CARD_TITLE)
            .next()
            .map(text_of)
            .filter(|t| !t.is_empty())
            .or_else(|| poster.value().attr("title").map(str::to_string))
            .unwrap_or_default();
        let cover = poster
            .select(&ANY_IMG)
            .next()
            .and_then(img_src)
            .map(|s| absolutize(&s, base));
        let tags = card
            .select(&CARD_TAGS)
            .map(text_of)
            .filter(|t| !t.is_empty())
            .collect();
        cards.push(SearchCard {
            href: absolutize(href, base),
            title,
            cover,
            tags,
        });
    }
    cards
}

pub(crate) fn parse_comic_detail(html: &str, base: &str) -> Option<ComicDetail> {
    let doc = Html::parse_document(html);
    let title = doc.select(&DETAIL_TITLE).next().map(text_of)?;
    if title.is_empty() {
        return None;
    }
    Some(ComicDetail {
        title,
        cover: doc
            .select(&DETAIL_POSTER)
            .next()
            .and_then(img_src)
            .map(|s| absolutize(&s, base)),
        description: doc
            .select(&DETAIL_DESC)
            .next()
            .map(text_of)
            .unwrap_or_default(),
        author: doc
            .select(&DETAIL_AUTHOR)
            .next()
            .map(text_of)
            .filter(|a| !a.is_empty()),
    })
}

/// 章节目录。先看 `.comics-chapters`/`#chapters_box`，都没有时退回到页面上所有章节样式的链接。
pub(crate) fn parse_chapter_links(html: &str, base: &str) -> Vec<ChapterLink> {
    let doc = Html::parse_document(html);
    let mut links: Vec<ChapterLink> = doc
        .select(&CHAPTER_LINKS)
        .filter_map(|a| {
            let href = a.value().attr("href")?.trim();
            if href.is_empty() {
                return None;
            }
            let href = absolutize(href, base);
            let data_index = a
                .value()
                .attr("data-index")
                .or_else(|| {
                    a.parent()
                        .and_then(ElementRef::wrap)
                        .and_then(|p| p.value().attr("data-index"))
                })
                .and_then(|v| v.trim().parse().ok());
            Some(ChapterLink {
                slot: slot_from_url(&href).or(data_index),
                title: text_of(a),
                locked: has_class_fragment(a, "lock"),
                href,
            })
        })
        .collect();

    if links.is_empty() {
        links = doc
            .select(&ALL_LINKS)
            .filter_map(|a| {
                let href = a.value().attr("href")?.trim();
                if href.starts_with("http") && !href.contains("baozimh.com") {
                    return None;
                }
                if !(href.contains("/chapter/") || href.contains("page_direct")) {
                    return None;
                }
                let href = absolutize(href, base);
                Some(ChapterLink {
                    slot: slot_from_url(&href),
                    title: text_of(a),
                    locked: has_class_fragment(a, "lock"),
                    href,
                })
            })
            .collect();
    }
    links
}

/// 章节图片：`.comic-contain__item` → `.comic-contain` 下的图片 → 页面所有 amp-img（排除推荐位）。
pub(crate) fn parse_chapter_images(html: &str, base: &str) -> Vec<String> {
    let doc = Html::parse_document(html);

    let mut urls: Vec<String> = doc
        .select(&CONTAIN_ITEM)
        .filter_map(|item| img_src(item).or_else(|| item.select(&ANY_IMG).next().and_then(img_src)))
        .collect();

    if urls.is_empty() {
        urls = doc.select(&CONTAIN_IMG).filter_map(img_src).collect();
    }
    if urls.is_empty() {
        urls = doc
            .select(&AMP_IMG)
            .filter(|el| !inside_recommend(*el))
            .filter_map(img_src)
            .collect();
    }

    dedupe(urls.into_iter().map(|u| absolutize(&u, base)).collect())
}

/// App 接口返回的 HTML 里只认 `/scomic/` 路径的图片。
pub(crate) fn parse_app_images(html: &str, cdn_base: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let urls = doc
        .select(&ANY_IMG)
        .filter_map(img_src)
        .filter(|src| src.contains("/scomic/"))
        .map(|src| absolutize(&src, cdn_base))
        .collect();
    dedupe(urls)
}

/// 页码提示：分页文字 `1/23` 或内嵌 JSON 的 `page_count`。
pub(crate) fn parse_page_count_hint(html: &str) -> Option<usize> {
    let doc = Html::parse_document(html);
    let from_pager = doc
        .select(&PAGER_TEXT)
        .filter_map(|el| {
            let text = text_of(el);
            PAGER_RE
                .captures(&text)
                .and_then(|c| c.get(2))
                .and_then(|m| m.as_str().parse::<usize>().ok())
        })
        .max();
    let from_json = PAGE_COUNT_JSON_RE
        .captures_iter(html)
        .filter_map(|c| c.get(1)?.as_str().parse::<usize>().ok())
        .max();
    from_pager.into_iter().chain(from_json).filter(|n| *n > 0).max()
}

pub(crate) fn contains_marker(html: &str, markers: &[String]) -> bool {
    markers
        .iter()
        .filter(|m| !m.trim().is_empty())
        .any(|m| html.contains(m.as_str()))
}

pub(crate) fn slot_from_url(url: &str) -> Option<u32> {
    SLOT_QUERY_RE
        .captures(url)
        .or_else(|| SLOT_FILE_RE.captures(url))
        .and_then(|c| c.get(1)?.as_str().parse().ok())
}

/// 从章节地址里取出 `(comic_id, chapter_slot)`。
pub(crate) fn chapter_location(url: &str) -> Option<(String, u32)> {
    if let Some(c) = SLOT_PATH_RE.captures(url) {
        let slot = c.get(2)?.as_str().parse().ok()?;
        return Some((c.get(1)?.as_str().to_string(), slot));
    }
    let comic = COMIC_QUERY_RE.captures(url)?.get(1)?.as_str().to_string();
    let slot = SLOT_QUERY_RE.captures(url)?.get(1)?.as_str().parse().ok()?;
    Some((comic, slot))
}

/// 在图片地址里出现最多的 CDN 章节 id（`/scomic/{comic}/0/{chapter}/`）。
pub(crate) fn cdn_chapter_id<'a>(texts: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for text in texts {
        for c in CDN_CHAPTER_RE.captures_iter(text) {
            let Some(id) = c.get(2).map(|m| m.as_str()) else {
                continue;
            };
            match counts.iter_mut().find(|(k, _)| k == id) {
                Some((_, n)) => *n += 1,
                None => counts.push((id.to_string(), 1)),
            }
        }
    }
    // 出现次数相同取先出现的
    let mut best: Option<(String, usize)> = None;
    for (id, n) in counts {
        if best.as_ref().is_none_or(|(_, b)| n > *b) {
            best = Some((id, n));
        }
    }
    best.map(|(id, _)| id)
}

pub(crate) fn has_cjk(text: &str) -> bool {
    CJK_RE.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const BASE: &str = "https://www.baozimh.com";

    #[test]
    fn parses_search_cards() {
        let html = r#"
            <div class="comics-card">
              <a class="comics-card__poster" href="/comic/yaoshenji-taxuedongman" title="妖神记">
                <amp-img src="https://static-tw.baozimh.com/cover/yaoshenji.jpg"></amp-img>
              </a>
              <a class="comics-card__info"><h3 class="comics-card__title"> 妖神记 </h3></a>
              <div class="tags">热血</div><div class="tags">玄幻</div>
            </div>
            <div class="comics-card"><span>broken</span></div>
        "#;
        let cards = parse_search_cards(html, BASE);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].href, "https://www.baozimh.com/comic/yaoshenji-taxuedongman");
        assert_eq!(cards[0].title, "妖神记");
        assert_eq!(
            cards[0].cover.as_deref(),
            Some("https://static-tw.baozimh.com/cover/yaoshenji.jpg")
        );
        assert_eq!(cards[0].tags, vec!["热血", "玄幻"]);
    }

    #[test]
    fn parses_detail_page() {
        let html = r#"
            <h1 class="comics-detail__title">斗破苍穹</h1>
            <h2 class="comics-detail__author">天蚕土豆</h2>
            <p class="comics-detail__desc"> 三十年河东 </p>
            <amp-img class="comics-detail__poster" src="//static.baozimh.com/c.jpg"></amp-img>
        "#;
        let detail = parse_comic_detail(html, BASE).unwrap();
        assert_eq!(detail.title, "斗破苍穹");
        assert_eq!(detail.author.as_deref(), Some("天蚕土豆"));
        assert_eq!(detail.description, "三十年河东");
        assert_eq!(detail.cover.as_deref(), Some("https://static.baozimh.com/c.jpg"));
        assert!(parse_comic_detail("<p>nothing</p>", BASE).is_none());
    }

    #[test]
    fn parses_chapter_links_with_slots_and_locks() {
        let html = r#"
            <div class="comics-chapters" data-index="5">
              <a href="/user/page_direct?comic_id=abc&section_slot=0&chapter_slot=2">第3话</a>
            </div>
            <div class="comics-chapters"><a href="/comic/chapter/abc/0_0.html">第1话</a></div>
            <div class="comics-chapters" data-index="9"><a href="/comic/chapter/abc/x.html">
              <span class="icon-lock"></span>第10话</a></div>
        "#;
        let links = parse_chapter_links(html, BASE);
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].slot, Some(2));
        assert_eq!(links[1].slot, Some(0));
        assert_eq!(links[2].slot, Some(9));
        assert!(links[2].locked);
        assert!(!links[0].locked);
        assert_eq!(links[2].title, "第10话");
    }

    #[test]
    fn falls_back_to_generic_chapter_links() {
        let html = r#"
            <a href="https://ads.example.com/chapter/1">ad</a>
            <a href="/comic/chapter/abc/0_4.html">第5话</a>
            <a href="/about">about</a>
        "#;
        let links = parse_chapter_links(html, BASE);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].slot, Some(4));
    }

    #[test]
    fn image_strategies_in_order() {
        let items = r#"
            <div class="comic-contain">
              <amp-img class="comic-contain__item" src="https://s1.bzcdn.net/scomic/a/0/b/1.jpg"></amp-img>
              <amp-img class="comic-contain__item" src="https://s1.bzcdn.net/scomic/a/0/b/2.jpg"></amp-img>
              <amp-img class="comic-contain__item" src="https://s1.bzcdn.net/scomic/a/0/b/1.jpg"></amp-img>
            </div>
        "#;
        assert_eq!(parse_chapter_images(items, BASE).len(), 2);

        let contain = r#"<div class="comic-contain"><img data-src="/p/1.webp"><img src="/p/2.webp"></div>"#;
        assert_eq!(
            parse_chapter_images(contain, BASE),
            vec!["https://www.baozimh.com/p/1.webp", "https://www.baozimh.com/p/2.webp"]
        );

        let loose = r#"
            <amp-img src="https://cdn/x/1.jpg"></amp-img>
            <div class="recommend--item"><amp-img src="https://cdn/rec.jpg"></amp-img></div>
        "#;
        assert_eq!(parse_chapter_images(loose, BASE), vec!["https://cdn/x/1.jpg"]);
    }

    #[test]
    fn app_images_keep_only_scomic() {
        let html = r#"<img src="/scomic/a/0/b/1.jpg"><img src="https://x/logo.png"><img data-src="//s1.bzcdn.net/scomic/a/0/b/2.jpg">"#;
        assert_eq!(
            parse_app_images(html, "https://s2.baozicdn.com"),
            vec![
                "https://s2.baozicdn.com/scomic/a/0/b/1.jpg",
                "https://s1.bzcdn.net/scomic/a/0/b/2.jpg"
            ]
        );
    }

    #[rstest]
    #[case(r#"<div class="comic-text__amp">(1/24)</div>"#, Some(24))]
    #[case(r#"<script>var d = {"page_count": "31"};</script>"#, Some(31))]
    #[case("<p>nothing</p>", None)]
    fn page_count_hints(#[case] html: &str, #[case] expected: Option<usize>) {
        assert_eq!(parse_page_count_hint(html), expected);
    }

    #[rstest]
    #[case("https://www.baozimh.com/comic/chapter/yaoshenji/0_12.html", Some(("yaoshenji", 12)))]
    #[case("https://www.baozimh.com/user/page_direct?comic_id=abc&section_slot=0&chapter_slot=7", Some(("abc", 7)))]
    #[case("https://www.baozimh.com/comic/abc", None)]
    fn chapter_locations(#[case] url: &str, #[case] expected: Option<(&str, u32)>) {
        assert_eq!(
            chapter_location(url),
            expected.map(|(c, s)| (c.to_string(), s))
        );
    }

    #[test]
    fn picks_most_common_cdn_chapter_id() {
        let urls = [
            "https://s1.bzcdn.net/scomic/a/0/AAA/1.jpg",
            "https://s1.bzcdn.net/scomic/a/0/BBB/1.jpg",
            "https://s1.bzcdn.net/scomic/a/0/BBB/2.jpg",
        ];
        assert_eq!(cdn_chapter_id(urls), Some("BBB".to_string()));
        assert_eq!(cdn_chapter_id(["nothing"]), None);
    }

    #[test]
    fn detects_cjk_titles() {
        assert!(has_cjk("妖神记"));
        assert!(has_cjk("ワンピース"));
        assert!(!has_cjk("Tales of Demons and Gods"));
    }
}
