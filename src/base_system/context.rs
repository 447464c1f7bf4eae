//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};
use crate::archive::ArchiveFormat;
use crate::source::filter::ObstructedPolicy;
use crate::source::models::{ChapterRef, MangaRef};
use crate::source::variants::VariantPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 网络配置
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_min_wait_time")]
    pub min_wait_time: u64,
    #[serde(default = "default_max_wait_time")]
    pub max_wait_time: u64,
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown: u64,
    #[serde(default = "default_max_cooldown")]
    pub max_cooldown: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,

    // 源配置
    #[serde(default = "default_false")]
    pub data_saver: bool,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_true")]
    pub translate_titles: bool,
    #[serde(default = "default_false")]
    pub validate_pages: bool,
    #[serde(default = "default_probe_bytes")]
    pub probe_bytes: u64,
    #[serde(default)]
    pub obstructed: ObstructedPolicy,
    #[serde(default)]
    pub fallback: VariantPolicy,

    // 保存配置
    #[serde(default)]
    pub archive_format: ArchiveFormat,
    #[serde(default)]
    pub save_path: String,
    #[serde(default = "default_true")]
    pub allow_overwrite_files: bool,
    #[serde(default = "default_true")]
    pub write_metadata: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_parallel_jobs: default_max_parallel_jobs(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            min_wait_time: default_min_wait_time(),
            max_wait_time: default_max_wait_time(),
            rate_limit_cooldown: default_rate_limit_cooldown(),
            max_cooldown: default_max_cooldown(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            data_saver: default_false(),
            languages: default_languages(),
            translate_titles: default_true(),
            validate_pages: default_false(),
            probe_bytes: default_probe_bytes(),
            obstructed: ObstructedPolicy::default(),
            fallback: VariantPolicy::default(),
            archive_format: ArchiveFormat::default(),
            save_path: String::new(),
            allow_overwrite_files: default_true(),
            write_metadata: default_true(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 21] = [
            FieldMeta {
                name: "max_workers",
                description: "下载线程池大小（所有章节共享）",
            },
            FieldMeta {
                name: "max_parallel_jobs",
                description: "同时进行的章节任务数",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求超时时间（秒）",
            },
            FieldMeta {
                name: "max_retries",
                description: "单页最大尝试次数（含首次请求）",
            },
            FieldMeta {
                name: "min_wait_time",
                description: "退避基础间隔, 单位ms",
            },
            FieldMeta {
                name: "max_wait_time",
                description: "退避上限, 单位ms",
            },
            FieldMeta {
                name: "rate_limit_cooldown",
                description: "遇到 429 且服务端未给出 Retry-After 时的全局冷却, 单位ms",
            },
            FieldMeta {
                name: "max_cooldown",
                description: "单次全局冷却上限, 单位ms",
            },
            FieldMeta {
                name: "requests_per_second",
                description: "令牌桶补充速率（每秒请求数）",
            },
            FieldMeta {
                name: "burst",
                description: "令牌桶容量",
            },
            FieldMeta {
                name: "data_saver",
                description: "MangaDex 使用压缩图 (data-saver)",
            },
            FieldMeta {
                name: "languages",
                description: "MangaDex 章节语言过滤，例如 [en, zh]",
            },
            FieldMeta {
                name: "translate_titles",
                description: "包子漫画是否通过 AniList 互译标题：搜索前转为原文标题，结果展示时补上英文标题",
            },
            FieldMeta {
                name: "validate_pages",
                description: "下载前是否用 Range 请求探测每页是否可用",
            },
            FieldMeta {
                name: "probe_bytes",
                description: "探测请求读取的最大字节数",
            },
            FieldMeta {
                name: "obstructed",
                description: "包子漫画反爬处理：占位页阈值、锁章标记、广告过滤、尺寸离群过滤",
            },
            FieldMeta {
                name: "fallback",
                description: "图片 404 时的 URL 变体爆破策略：CDN 列表、扩展名、页码偏移与尝试顺序",
            },
            FieldMeta {
                name: "archive_format",
                description: "保存格式, 可选: [dir, packed]",
            },
            FieldMeta {
                name: "save_path",
                description: "保存路径（留空为当前目录）",
            },
            FieldMeta {
                name: "allow_overwrite_files",
                description: "是否允许覆盖已存在的章节输出",
            },
            FieldMeta {
                name: "write_metadata",
                description: "是否在输出中附带 metadata.json",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers 必须 >= 1".to_string());
        }
        if self.max_parallel_jobs == 0 {
            return Err("max_parallel_jobs 必须 >= 1".to_string());
        }
        if self.max_retries == 0 {
            return Err("max_retries 必须 >= 1".to_string());
        }
        if self.max_wait_time < self.min_wait_time {
            return Err("max_wait_time 不能小于 min_wait_time".to_string());
        }
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return Err("requests_per_second 必须为正数".to_string());
        }
        if self.burst == 0 {
            return Err("burst 必须 >= 1".to_string());
        }
        if self.fallback.max_variants == 0 {
            return Err("fallback.max_variants 必须 >= 1".to_string());
        }
        Ok(())
    }
}

impl Config {
    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.save_path)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown.max(self.rate_limit_cooldown))
    }

    /// 章节输出的目标路径（不含 `.cbz` 后缀）：`{save}/{漫画名}/{章节名}`。
    pub fn chapter_target(&self, manga: Option<&MangaRef>, chapter: &ChapterRef) -> PathBuf {
        let manga_dir = manga
            .map(|m| m.title.as_str())
            .unwrap_or(chapter.manga_id.as_str());
        self.default_save_dir()
            .join(safe_fs_name(manga_dir, "_", 120))
            .join(safe_fs_name(&chapter.folder_label(), "_", 120))
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_max_parallel_jobs() -> usize {
    2
}

fn default_request_timeout() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    4
}

fn default_min_wait_time() -> u64 {
    500
}

fn default_max_wait_time() -> u64 {
    8000
}

fn default_rate_limit_cooldown() -> u64 {
    5000
}

fn default_max_cooldown() -> u64 {
    60_000
}

fn default_requests_per_second() -> f64 {
    5.0
}

fn default_burst() -> u32 {
    5
}

fn default_languages() -> Vec<String> {
    vec!["en".to_string()]
}

fn default_probe_bytes() -> u64 {
    2048
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

/// 把任意标题转换成可用作文件/目录名的字符串。
///
/// Windows 保留字符替换为全角等价字符，去掉结尾的空格和点，保留设备名前加下划线。
pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let fallback = replacement.chars().next().unwrap_or('_');
    let mut cleaned: String = name
        .trim()
        .chars()
        .map(|ch| match ch {
            ':' => '：',
            '"' => '＂',
            '<' => '《',
            '>' => '》',
            '/' | '\\' => '、',
            '|' => '｜',
            '?' => '？',
            '*' => '＊',
            c if c.is_control() => fallback,
            _ => ch,
        })
        .collect();

    if cleaned.chars().count() > max_len {
        cleaned = cleaned.chars().take(max_len).collect();
    }

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }

    if cleaned.is_empty() {
        return "unnamed".to_string();
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let stem = cleaned.split('.').next().unwrap_or("").to_uppercase();
    if RESERVED.contains(&stem.as_str()) {
        cleaned.insert(0, '_');
    }
    cleaned
}
