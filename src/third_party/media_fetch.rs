//! 图片抓取与校验。
//!
//! 下载 worker 与预探测共用：取令牌、带 Referer 请求、按状态码分类、
//! 用魔数确认返回的确实是图片。

use std::io::Cursor;

use crate::base_system::rate_limit::TokenBucket;
use crate::network_parser::network::{HttpRequest, HttpResponse, HttpTransport};
use crate::source::SourceError;

const IMAGE_ACCEPT: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FetchedImage {
    pub url: String,
    pub bytes: Vec<u8>,
    pub ext: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FetchFailure {
    /// 地址本身不可用（404/403/非图片），值得换变体再试
    Missing(String),
    Source(SourceError),
}

pub(crate) fn fetch_image(
    transport: &dyn HttpTransport,
    limiter: &TokenBucket,
    url: &str,
    referer: Option<&str>,
    byte_limit: Option<u64>,
) -> Result<FetchedImage, FetchFailure> {
    limiter.acquire();
    let mut request = HttpRequest::get(url)
        .header("Accept", IMAGE_ACCEPT)
        .referer(referer);
    if let Some(limit) = byte_limit {
        request = request.byte_limit(limit);
    }

    let resp = transport
        .execute(&request)
        .map_err(|e| FetchFailure::Source(e.into()))?;

    match resp.status {
        200..=299 => {}
        429 => {
            return Err(FetchFailure::Source(SourceError::RateLimited {
                retry_after: resp.retry_after(),
            }));
        }
        408 | 500..=599 => {
            return Err(FetchFailure::Source(SourceError::Network(format!(
                "HTTP {} for {url}",
                resp.status
            ))));
        }
        status => return Err(FetchFailure::Missing(format!("HTTP {status} for {url}"))),
    }

    let Some(ext) = image_ext(&resp, url) else {
        return Err(FetchFailure::Missing(format!("non-image body for {url}")));
    };
    Ok(FetchedImage {
        url: url.to_string(),
        bytes: resp.body,
        ext,
    })
}

/// 魔数优先；认不出时要求 `image/*` 的 Content-Type，扩展名取地址里的，再退回 MIME。
pub(crate) fn image_ext(resp: &HttpResponse, url: &str) -> Option<&'static str> {
    if resp.body.is_empty() {
        return None;
    }
    if let Some(ext) = sniff_image_ext(&resp.body) {
        return Some(ext);
    }
    let ctype = resp.content_type()?.to_ascii_lowercase();
    let mime = ctype.split(';').next().unwrap_or("").trim();
    let subtype = mime.strip_prefix("image/")?;
    url_image_ext(url).or(match subtype {
        "jpeg" | "jpg" => Some("jpg"),
        "png" => Some("png"),
        "webp" => Some("webp"),
        "gif" => Some("gif"),
        "avif" => Some("avif"),
        _ => None,
    })
}

fn url_image_ext(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let (_, ext) = path.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("jpg"),
        "png" => Some("png"),
        "webp" => Some("webp"),
        "gif" => Some("gif"),
        "avif" => Some("avif"),
        _ => None,
    }
}

pub(crate) fn sniff_image_ext(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("jpg");
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("png");
    }
    if bytes.starts_with(b"GIF8") {
        return Some("gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("webp");
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" && matches!(&bytes[8..12], b"avif" | b"avis")
    {
        return Some("avif");
    }
    None
}

/// 只读文件头取宽高，解码失败时返回 None。
pub(crate) fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
