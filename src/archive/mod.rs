//! 章节输出：图片目录或 `.cbz` 压缩包。
//!
//! 两种格式都先写到目标旁边的临时位置，全部写完后再改名到最终路径，
//! 中途失败不会在目标位置留下半成品。

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};
use zip::CompressionMethod;
use zip::write::FileOptions;

pub const MISSING_MANIFEST: &str = "missing.json";
pub const METADATA_FILE: &str = "metadata.json";
const PACKED_EXT: &str = "cbz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    /// 每页一个图片文件
    #[default]
    Dir,
    /// 单个 `.cbz`（zip）
    Packed,
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveFormat::Dir => "dir",
            ArchiveFormat::Packed => "packed",
        })
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("目标已存在且配置禁止覆盖: {}", .0.display())]
    Exists(PathBuf),
    #[error("没有可写入的页面")]
    Empty,
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// 暂存区里的一页，`index` 是最终序号。
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivePage {
    pub index: usize,
    pub source: PathBuf,
    pub ext: String,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveContent {
    /// 成功的页，顺序不限，写入时按序号排列
    pub pages: Vec<ArchivePage>,
    /// 章节总页数（含缺页），决定文件名补零宽度
    pub page_count: usize,
    pub missing: Vec<usize>,
    pub metadata: Option<serde_json::Value>,
}

impl ArchiveContent {
    fn sorted_pages(&self) -> Vec<&ArchivePage> {
        let mut pages: Vec<&ArchivePage> = self.pages.iter().collect();
        pages.sort_by_key(|p| p.index);
        pages
    }

    fn missing_manifest(&self) -> Option<serde_json::Value> {
        if self.missing.is_empty() {
            return None;
        }
        Some(json!({
            "page_count": self.page_count,
            "missing": self.missing,
        }))
    }
}

/// 补零宽度：`max(3, page_count 的位数)`。
pub fn entry_name(index: usize, ext: &str, page_count: usize) -> String {
    let width = page_count.max(1).to_string().len().max(3);
    format!("{index:0width$}.{ext}")
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveWriter {
    format: ArchiveFormat,
    overwrite: bool,
}

impl ArchiveWriter {
    pub fn new(format: ArchiveFormat, overwrite: bool) -> Self {
        Self { format, overwrite }
    }

    /// 最终输出路径；压缩包在章节名后追加 `.cbz`。
    pub fn output_path(&self, target: &Path) -> PathBuf {
        match self.format {
            ArchiveFormat::Dir => target.to_path_buf(),
            ArchiveFormat::Packed => {
                let mut name = target.as_os_str().to_os_string();
                name.push(".");
                name.push(PACKED_EXT);
                PathBuf::from(name)
            }
        }
    }

    pub fn write(&self, target: &Path, content: &ArchiveContent) -> Result<PathBuf, ArchiveError> {
        if content.pages.is_empty() {
            return Err(ArchiveError::Empty);
        }
        let output = self.output_path(target);
        if output.exists() && !self.overwrite {
            return Err(ArchiveError::Exists(output));
        }
        let parent = output.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(io_at(parent))?;

        match self.format {
            ArchiveFormat::Dir => self.write_dir(&output, parent, content)?,
            ArchiveFormat::Packed => self.write_packed(&output, parent, content)?,
        }
        info!(
            target: "archive",
            "已写入 {}（{} 页，缺 {} 页）",
            output.display(),
            content.pages.len(),
            content.missing.len()
        );
        Ok(output)
    }

    fn write_dir(
        &self,
        output: &Path,
        parent: &Path,
        content: &ArchiveContent,
    ) -> Result<(), ArchiveError> {
        let tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempdir_in(parent)
            .map_err(io_at(parent))?;

        for page in content.sorted_pages() {
            let dest = tmp.path().join(entry_name(page.index, &page.ext, content.page_count));
            fs::copy(&page.source, &dest).map_err(io_at(&page.source))?;
        }
        if let Some(manifest) = content.missing_manifest() {
            write_json(&tmp.path().join(MISSING_MANIFEST), &manifest)?;
        }
        if let Some(meta) = &content.metadata {
            write_json(&tmp.path().join(METADATA_FILE), meta)?;
        }

        // 旧目录先挪进独占的临时目录，新目录就位后随它一起删掉
        let backup = if output.exists() {
            let holder = tempfile::Builder::new()
                .prefix(".replaced-")
                .tempdir_in(parent)
                .map_err(io_at(parent))?;
            let moved = holder.path().join("old");
            fs::rename(output, &moved).map_err(io_at(output))?;
            Some((holder, moved))
        } else {
            None
        };
        if let Err(err) = fs::rename(tmp.path(), output) {
            if let Some((_, moved)) = &backup {
                let _ = fs::rename(moved, output);
            }
            return Err(io_at(output)(err));
        }
        if let Some((holder, _)) = backup {
            debug!("删除被替换的旧目录 {}", holder.path().display());
            let _ = holder.close();
        }
        // 改名后 TempDir 析构时找不到目录，忽略即可
        drop(tmp);
        Ok(())
    }

    fn write_packed(
        &self,
        output: &Path,
        parent: &Path,
        content: &ArchiveContent,
    ) -> Result<(), ArchiveError> {
        let mut tmp = NamedTempFile::new_in(parent).map_err(io_at(parent))?;
        {
            let mut zip = zip::ZipWriter::new(tmp.as_file_mut());
            // 图片本身已压缩，直接存储
            let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
            let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);

            for page in content.sorted_pages() {
                zip.start_file(entry_name(page.index, &page.ext, content.page_count), stored)?;
                let mut src = File::open(&page.source).map_err(io_at(&page.source))?;
                io::copy(&mut src, &mut zip).map_err(io_at(&page.source))?;
            }
            if let Some(manifest) = content.missing_manifest() {
                zip.start_file(MISSING_MANIFEST, deflated)?;
                zip.write_all(&serde_json::to_vec_pretty(&manifest)?)
                    .map_err(io_at(output))?;
            }
            if let Some(meta) = &content.metadata {
                zip.start_file(METADATA_FILE, deflated)?;
                zip.write_all(&serde_json::to_vec_pretty(meta)?)
                    .map_err(io_at(output))?;
            }
            zip.finish()?;
        }
        tmp.as_file().sync_all().map_err(io_at(output))?;
        tmp.persist(output).map_err(|e| io_at(output)(e.error))?;
        Ok(())
    }
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), ArchiveError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(path, bytes).map_err(io_at(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Read;

    fn staged(dir: &Path, pages: &[(usize, &str, &[u8])]) -> Vec<ArchivePage> {
        pages
            .iter()
            .map(|(index, ext, bytes)| {
                let source = dir.join(format!("src-{index}.{ext}"));
                fs::write(&source, bytes).unwrap();
                ArchivePage {
                    index: *index,
                    source,
                    ext: ext.to_string(),
                }
            })
            .collect()
    }

    #[rstest]
    #[case(0, "jpg", 5, "000.jpg")]
    #[case(12, "png", 999, "012.png")]
    #[case(7, "webp", 1000, "0007.webp")]
    #[case(123, "jpg", 20000, "00123.jpg")]
    fn pads_entry_names(
        #[case] index: usize,
        #[case] ext: &str,
        #[case] count: usize,
        #[case] expected: &str,
    ) {
        assert_eq!(entry_name(index, ext, count), expected);
    }

    #[test]
    fn dir_output_keeps_extensions_and_manifest() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("Chapter 2");
        let content = ArchiveContent {
            pages: staged(src.path(), &[(2, "png", b"c"), (0, "jpg", b"a")]),
            page_count: 3,
            missing: vec![1],
            metadata: None,
        };
        let path = ArchiveWriter::new(ArchiveFormat::Dir, false)
            .write(&target, &content)
            .unwrap();

        assert_eq!(path, target);
        let mut names: Vec<String> = fs::read_dir(&target)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["000.jpg", "002.png", "missing.json"]);
        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(target.join(MISSING_MANIFEST)).unwrap()).unwrap();
        assert_eq!(manifest["missing"], json!([1]));
        assert_eq!(manifest["page_count"], 3);
        // 临时目录已经改名，不留痕迹
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[test]
    fn packed_output_is_ordered_zip() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let content = ArchiveContent {
            pages: staged(src.path(), &[(1, "jpg", b"second"), (0, "jpg", b"first")]),
            page_count: 2,
            missing: Vec::new(),
            metadata: Some(json!({"source": "standard"})),
        };
        let path = ArchiveWriter::new(ArchiveFormat::Packed, false)
            .write(&out.path().join("ch"), &content)
            .unwrap();
        assert_eq!(path, out.path().join("ch.cbz"));

        let mut zip = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["000.jpg", "001.jpg", "metadata.json"]);
        let mut first = String::new();
        zip.by_name("000.jpg").unwrap().read_to_string(&mut first).unwrap();
        assert_eq!(first, "first");
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[test]
    fn refuses_existing_target_without_overwrite() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("ch");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("old.jpg"), b"old").unwrap();
        let content = ArchiveContent {
            pages: staged(src.path(), &[(0, "jpg", b"new")]),
            page_count: 1,
            ..ArchiveContent::default()
        };

        let err = ArchiveWriter::new(ArchiveFormat::Dir, false)
            .write(&target, &content)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Exists(_)));
        assert!(target.join("old.jpg").exists());

        ArchiveWriter::new(ArchiveFormat::Dir, true)
            .write(&target, &content)
            .unwrap();
        assert!(!target.join("old.jpg").exists());
        assert_eq!(fs::read(target.join("000.jpg")).unwrap(), b"new");
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[test]
    fn parallel_replacements_in_one_folder_do_not_collide() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        // 上次运行残留的备份目录
        let stale = out.path().join(format!(".replaced-{}", std::process::id()));
        fs::create_dir(&stale).unwrap();
        fs::write(stale.join("junk"), b"x").unwrap();

        let targets: Vec<PathBuf> = (1..=4)
            .map(|n| {
                let target = out.path().join(format!("Chapter {n}"));
                fs::create_dir(&target).unwrap();
                fs::write(target.join("old.jpg"), b"old").unwrap();
                target
            })
            .collect();
        let pages = staged(src.path(), &[(0, "jpg", b"new")]);

        std::thread::scope(|scope| {
            for target in &targets {
                let content = ArchiveContent {
                    pages: pages.clone(),
                    page_count: 1,
                    ..ArchiveContent::default()
                };
                scope.spawn(move || {
                    ArchiveWriter::new(ArchiveFormat::Dir, true)
                        .write(target, &content)
                        .unwrap();
                });
            }
        });

        for target in &targets {
            assert!(!target.join("old.jpg").exists());
            assert_eq!(fs::read(target.join("000.jpg")).unwrap(), b"new");
        }
        // 只剩四个章节目录和那个残留目录
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 5);
    }

    #[test]
    fn empty_content_is_rejected() {
        let out = tempfile::tempdir().unwrap();
        let err = ArchiveWriter::new(ArchiveFormat::Packed, true)
            .write(&out.path().join("x"), &ArchiveContent::default())
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Empty));
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }
}
