//! 任务暂存目录：下载成功的页先落盘到这里，归档完成后整体删除。

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;

use super::models::JobId;
use crate::base_system::file_cleaner;
use crate::third_party::media_fetch::image_dimensions;

pub(crate) const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, PartialEq)]
pub struct StagedPage {
    pub index: usize,
    pub path: PathBuf,
    pub ext: String,
    pub size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// 每个任务独占一个目录：`{root}/.staging/{job_id}-{sha1(chapter)[..12]}`。
#[derive(Debug)]
pub struct Staging {
    root: PathBuf,
    dir: PathBuf,
}

impl Staging {
    pub fn create(root: &Path, job_id: JobId, chapter_id: &str) -> io::Result<Self> {
        let digest = hex::encode(Sha1::digest(chapter_id.as_bytes()));
        let root = root.join(STAGING_DIR);
        let dir = root.join(format!("{job_id}-{}", &digest[..12]));
        fs::create_dir_all(&dir)?;
        Ok(Self { root, dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 写入一页并读取尺寸。
    pub fn store(&self, index: usize, bytes: &[u8], ext: &str) -> io::Result<StagedPage> {
        let path = self.dir.join(format!("{index:05}.{ext}"));
        write_atomic(&path, bytes)?;
        let dims = image_dimensions(bytes);
        Ok(StagedPage {
            index,
            path,
            ext: ext.to_string(),
            size: bytes.len() as u64,
            width: dims.map(|d| d.0),
            height: dims.map(|d| d.1),
        })
    }

    pub fn discard(&self, page: &StagedPage) {
        let _ = fs::remove_file(&page.path);
    }

    /// 删除本任务目录；`.staging` 空了也一并删掉。
    pub fn remove(&self) -> io::Result<()> {
        file_cleaner::remove_dir_quietly(&self.dir)?;
        file_cleaner::prune_if_empty(&self.root);
        Ok(())
    }
}

/// 同目录临时文件写完再改名，读者看不到半截文件。
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
